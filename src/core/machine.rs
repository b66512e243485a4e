use crate::core::command;
use crate::core::job::{GpuRecord, MemorySummary, ProcessRecord, Significance};
use crate::core::parser::{parse_scan_output, PsSchemaV1, ScanWarning};
use crate::core::MAX_GPUS_PER_MACHINE;
use crate::remote::RemoteExecutor;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;
use strum::Display;

/// What a machine hands out to jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum UnitKind {
    #[default]
    #[strum(to_string = "core")]
    Cpu,
    #[strum(to_string = "GPU")]
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuSpec {
    pub model: String,
    pub count: u32,
    /// VRAM of a single GPU.
    pub vram_bytes: u64,
}

/// One registered host. Built from the registry and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub name: String,
    pub group: String,
    pub id: u32,
    pub cpu_model: String,
    pub cores: u32,
    pub ram_bytes: u64,
    pub gpu: Option<GpuSpec>,
    pub enabled: bool,
    pub comment: String,
}

impl Machine {
    pub fn kind(&self) -> UnitKind {
        if self.gpu.is_some() {
            UnitKind::Gpu
        } else {
            UnitKind::Cpu
        }
    }

    /// Installed compute units. GPUs past the monitoring ceiling are not handed out.
    pub fn units(&self) -> u32 {
        match &self.gpu {
            Some(gpu) => gpu.count.min(MAX_GPUS_PER_MACHINE as u32),
            None => self.cores,
        }
    }

    /// Query the process table, memory and GPUs of this machine in one round trip.
    ///
    /// Never fails: transport errors turn into [`ScanStatus::Unreachable`].
    pub async fn scan<E: RemoteExecutor>(
        &self,
        executor: &E,
        users: &[String],
        timeout: Duration,
    ) -> MachineReport {
        let gpu = self.kind() == UnitKind::Gpu;
        let script = command::scan_script(users, gpu);

        let output = match executor.execute(&self.name, &script, timeout).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("{} is unreachable: {e}", self.name);
                return MachineReport {
                    machine: self.clone(),
                    status: ScanStatus::Unreachable {
                        reason: e.to_string(),
                    },
                    warnings: Vec::new(),
                };
            }
        };

        let parsed = parse_scan_output(&PsSchemaV1, &self.name, &output.stdout, gpu);
        let mut warnings = parsed.warnings;
        if !output.success() {
            if let Some(line) = output.stderr.lines().find(|l| !l.trim().is_empty()) {
                warnings.push(ScanWarning::Remote(line.trim().to_string()));
            }
        }

        let jobs = if gpu {
            parsed.processes
        } else {
            collect_jobs(parsed.processes, &mut warnings)
        };
        let memory = parsed.memory.unwrap_or_default();

        for warning in &warnings {
            tracing::warn!("{}: {warning}", self.name);
        }
        tracing::debug!("{}: {} jobs", self.name, jobs.len());

        MachineReport {
            machine: self.clone(),
            status: ScanStatus::Reachable(Snapshot {
                jobs,
                memory,
                gpus: parsed.gpus,
            }),
            warnings,
        }
    }

    /// Launch `command` detached in `cwd`. Fire-and-forget: only the hand-off is checked.
    pub async fn run<E: RemoteExecutor>(
        &self,
        executor: &E,
        cwd: &Path,
        command: &str,
        timeout: Duration,
    ) -> LaunchOutcome {
        let script = command::run_detached(cwd, command);
        match executor.execute(&self.name, &script, timeout).await {
            Ok(output) if output.success() => {
                tracing::info!("Launched on {}: {command}", self.name);
                LaunchOutcome::Issued
            }
            Ok(output) => {
                let reason = first_line_or(&output.stderr, "remote shell failed");
                tracing::warn!("Launch on {} reported an error: {reason}", self.name);
                LaunchOutcome::RemoteFailure { reason }
            }
            Err(e) => {
                tracing::warn!("Failed to reach {} for launch: {e}", self.name);
                LaunchOutcome::NotIssued {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// SIGTERM the session of `job`, from the process itself up to its session leader.
    pub async fn kill<E: RemoteExecutor>(
        &self,
        executor: &E,
        job: &ProcessRecord,
        timeout: Duration,
    ) -> KillOutcome {
        let script = command::kill_session_chain(job.pid, job.sid);
        match executor.execute(&self.name, &script, timeout).await {
            Ok(output) if output.success() => {
                tracing::info!("Sent SIGTERM to {}:{} (session {})", self.name, job.pid, job.sid);
                KillOutcome::Signalled
            }
            Ok(_) => KillOutcome::NoSuchProcess,
            Err(e) => {
                tracing::warn!("Failed to reach {} for kill: {e}", self.name);
                KillOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Keep the processes that count as jobs, one record per pid, reporting zombies and empty
/// running processes.
fn collect_jobs(
    processes: Vec<ProcessRecord>,
    warnings: &mut Vec<ScanWarning>,
) -> Vec<ProcessRecord> {
    let mut zombies = BTreeSet::new();
    let mut empty = BTreeSet::new();
    let mut jobs: Vec<ProcessRecord> = Vec::new();
    let mut by_pid: HashMap<u32, usize> = HashMap::new();

    for process in processes {
        match process.significance() {
            Significance::Job => {
                if process.rss_bytes == 0 {
                    empty.insert(process.pid);
                }
                match by_pid.get(&process.pid) {
                    Some(&i) => {
                        let job = &mut jobs[i];
                        job.threads += 1;
                        job.cpu_percent += process.cpu_percent;
                    }
                    None => {
                        by_pid.insert(process.pid, jobs.len());
                        jobs.push(process);
                    }
                }
            }
            Significance::Zombie => {
                zombies.insert(process.pid);
            }
            Significance::Idle | Significance::System => {}
        }
    }

    warnings.extend(zombies.into_iter().map(|pid| ScanWarning::Zombie { pid }));
    warnings.extend(empty.into_iter().map(|pid| ScanWarning::ZeroMemory { pid }));
    jobs
}

fn first_line_or(text: &str, fallback: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// State of a reachable machine at scan time.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub jobs: Vec<ProcessRecord>,
    pub memory: MemorySummary,
    pub gpus: Vec<GpuRecord>,
}

#[derive(Debug, Clone)]
pub enum ScanStatus {
    Reachable(Snapshot),
    Unreachable { reason: String },
}

/// Result of scanning one machine.
#[derive(Debug, Clone)]
pub struct MachineReport {
    pub machine: Machine,
    pub status: ScanStatus,
    pub warnings: Vec<ScanWarning>,
}

impl MachineReport {
    pub fn is_reachable(&self) -> bool {
        matches!(self.status, ScanStatus::Reachable(_))
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        match &self.status {
            ScanStatus::Reachable(snapshot) => Some(snapshot),
            ScanStatus::Unreachable { .. } => None,
        }
    }

    pub fn jobs(&self) -> &[ProcessRecord] {
        self.snapshot().map_or(&[], |s| s.jobs.as_slice())
    }

    /// Units held by jobs: one per job thread on CPU machines, one per busy GPU otherwise.
    pub fn occupied_units(&self) -> u32 {
        let jobs = self.jobs();
        match self.machine.kind() {
            UnitKind::Cpu => jobs.iter().map(|j| j.threads).sum(),
            UnitKind::Gpu => jobs
                .iter()
                .filter_map(|j| j.gpu.map(|g| g.index))
                .collect::<BTreeSet<_>>()
                .len() as u32,
        }
    }

    /// Units a new job could take. An unreachable machine has none.
    pub fn free_units(&self) -> u32 {
        if !self.is_reachable() {
            return 0;
        }
        self.machine.units().saturating_sub(self.occupied_units())
    }

    pub fn free_memory(&self) -> u64 {
        self.snapshot().map_or(0, |s| s.memory.free)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Issued,
    /// The remote shell ran but complained, e.g. the working directory does not exist there.
    RemoteFailure { reason: String },
    NotIssued { reason: String },
}

impl LaunchOutcome {
    /// Whether the command was handed to the remote host.
    pub fn was_issued(&self) -> bool {
        !matches!(self, LaunchOutcome::NotIssued { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    Signalled,
    NoSuchProcess,
    Failed { reason: String },
}
