use crate::utils::{format_bytes, format_ps_elapsed};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Command fragments of processes that never count as jobs.
const EXCEPTIONS: &[&str] = &[
    "kworker",
    "ps H --no-headers",
    "sshd",
    "@notty",
    "/usr/lib/systemd/systemd",
    "scala.tools.nsc.CompileServer",
    ".vscode-server",
];

/// Why a process does or does not count as a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Significance {
    Job,
    Idle,
    System,
    Zombie,
}

/// GPU attachment of a process on a GPU machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuUsage {
    pub index: u32,
    pub vram_bytes: u64,
}

/// One line of a remote process table. Immutable snapshot of a single scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub machine: String,
    pub user: String,
    pub state: String,
    pub pid: u32,
    /// Session leader of the process.
    pub sid: u32,
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub rss_bytes: u64,
    pub elapsed: Duration,
    pub start: String,
    pub command: String,
    pub gpu: Option<GpuUsage>,
    /// Busy threads of the process. `ps H` prints one row per thread, all with the same pid.
    pub threads: u32,
}

impl ProcessRecord {
    /// Identity of the record within one scan snapshot.
    pub fn key(&self) -> (&str, u32) {
        (&self.machine, self.pid)
    }

    pub fn significance(&self) -> Significance {
        if EXCEPTIONS.iter().any(|e| self.command.contains(e)) {
            return Significance::System;
        }
        if self.state.contains('Z') {
            return Significance::Zombie;
        }
        if self.cpu_percent > 20.0 {
            return Significance::Job;
        }
        if self.state.contains('R') {
            if self.cpu_percent > 5.0 || self.elapsed > Duration::from_secs(1) {
                return Significance::Job;
            }
            return Significance::Idle;
        }
        if self.state.contains('D') {
            return Significance::Job;
        }
        Significance::Idle
    }

    pub fn is_job(&self) -> bool {
        self.significance() == Significance::Job
    }
}

impl fmt::Display for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let machine = match self.gpu {
            Some(gpu) => format!("{}-GPU{}", self.machine, gpu.index),
            None => self.machine.clone(),
        };
        write!(
            f,
            "{:<12} {:<15} {:<5} {:>8} {:>6.1} {:>5.1} {:>9} {:>12} {:>6}  {}",
            machine,
            self.user,
            self.state,
            self.pid,
            self.cpu_percent,
            self.mem_percent,
            format_bytes(self.rss_bytes),
            format_ps_elapsed(self.elapsed),
            self.start,
            self.command
        )
    }
}

/// `free` output of one machine, in bytes. `free` is what is still available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySummary {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// One GPU of a machine as reported by `nvidia-smi`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuRecord {
    pub index: u32,
    pub bus_id: String,
    pub utilization: f32,
    pub vram_used: u64,
    pub vram_total: u64,
}

impl GpuRecord {
    pub fn vram_free(&self) -> u64 {
        self.vram_total.saturating_sub(self.vram_used)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record(machine: &str, user: &str, pid: u32, command: &str) -> ProcessRecord {
        ProcessRecord {
            machine: machine.to_string(),
            user: user.to_string(),
            state: "R".to_string(),
            pid,
            sid: pid,
            cpu_percent: 99.0,
            mem_percent: 0.5,
            rss_bytes: 1_000_000,
            elapsed: Duration::from_secs(600),
            start: "10:00".to_string(),
            command: command.to_string(),
            gpu: None,
            threads: 1,
        }
    }

    #[test]
    fn test_significance_rules() {
        let busy = record("tenet1", "alice", 1, "python sim.py");
        assert_eq!(busy.significance(), Significance::Job);

        let mut sshd = record("tenet1", "alice", 2, "sshd: alice@notty");
        sshd.cpu_percent = 50.0;
        assert_eq!(sshd.significance(), Significance::System);

        let mut zombie = record("tenet1", "alice", 3, "python old.py");
        zombie.state = "Z".to_string();
        assert_eq!(zombie.significance(), Significance::Zombie);

        let mut sleeping = record("tenet1", "alice", 4, "bash");
        sleeping.state = "Ss".to_string();
        sleeping.cpu_percent = 0.0;
        assert_eq!(sleeping.significance(), Significance::Idle);

        let mut fresh = record("tenet1", "alice", 5, "./a.out");
        fresh.cpu_percent = 1.0;
        fresh.elapsed = Duration::from_secs(1);
        assert_eq!(fresh.significance(), Significance::Idle);

        let mut io_bound = record("tenet1", "alice", 6, "rsync data");
        io_bound.state = "D".to_string();
        io_bound.cpu_percent = 0.0;
        assert!(io_bound.is_job());
    }

    #[test]
    fn test_display_contains_identity() {
        let mut job = record("kuda3", "bob", 4242, "python train.py --lr 0.1");
        job.gpu = Some(GpuUsage {
            index: 2,
            vram_bytes: 1_000_000,
        });
        let line = job.to_string();
        assert!(line.starts_with("kuda3-GPU2"));
        assert!(line.contains("4242"));
        assert!(line.ends_with("python train.py --lr 0.1"));
    }
}
