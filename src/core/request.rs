//! Requests decoded once at the command-line boundary.
//!
//! Every request is validated against the registry before a single remote call is made.

use crate::audit::{self, AuditAction, AuditEntry, AuditLog, AuditTarget};
use crate::config::Registry;
use crate::core::dispatch::{self, DispatchOptions, DispatchReport};
use crate::core::error::ValidationError;
use crate::core::filter::FilterCriteria;
use crate::core::job::ProcessRecord;
use crate::core::machine::{KillOutcome, LaunchOutcome, Machine, MachineReport};
use crate::core::queue::CommandQueue;
use crate::core::scan::{ProgressObserver, ScanCoordinator, Silent};
use crate::core::MAX_DISPATCH;
use crate::remote::RemoteExecutor;
use anyhow::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Machines a request applies to. Machines take precedence over groups; both empty means
/// the whole fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub groups: Vec<String>,
    pub machines: Vec<String>,
}

impl Target {
    /// Both groups and machines given; the groups are ignored.
    pub fn group_suppressed(&self) -> bool {
        !self.groups.is_empty() && !self.machines.is_empty()
    }

    pub fn resolve(&self, registry: &Registry) -> Result<Vec<Machine>, ValidationError> {
        if !self.machines.is_empty() {
            return self
                .machines
                .iter()
                .map(|name| {
                    registry
                        .machine(name)
                        .cloned()
                        .ok_or_else(|| ValidationError::UnknownMachine(name.clone()))
                })
                .collect();
        }
        if !self.groups.is_empty() {
            let mut machines = Vec::new();
            for name in &self.groups {
                let group = registry
                    .group(name)
                    .ok_or_else(|| ValidationError::UnknownGroup(name.clone()))?;
                machines.extend(group.machines().iter().cloned());
            }
            return Ok(machines);
        }
        Ok(registry.machines().cloned().collect())
    }
}

/// Who runs the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoker {
    pub name: String,
    pub is_root: bool,
}

impl Invoker {
    pub fn current() -> Self {
        Self {
            name: crate::utils::current_user(),
            is_root: crate::utils::is_root(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Registry information only, no remote calls.
    List { target: Target },
    Free { target: Target },
    Job { target: Target, filter: FilterCriteria },
    User { target: Target },
    Run {
        machine: String,
        command: String,
        cwd: PathBuf,
    },
    Runs {
        file: PathBuf,
        group: String,
        range: Option<(u32, u32)>,
        limit: usize,
        cwd: PathBuf,
    },
    Kill { target: Target, filter: FilterCriteria },
}

impl Request {
    /// Check the request and resolve the machines it touches.
    pub fn validate(
        &self,
        registry: &Registry,
        invoker: &Invoker,
    ) -> Result<Vec<Machine>, ValidationError> {
        match self {
            Request::List { target } | Request::Free { target } | Request::User { target } => {
                target.resolve(registry)
            }
            Request::Job { target, filter } => {
                let machines = target.resolve(registry)?;
                check_filter(filter, &machines, registry)?;
                Ok(machines)
            }
            Request::Kill { target, filter } => {
                let machines = target.resolve(registry)?;
                check_filter(filter, &machines, registry)?;
                if !invoker.is_root {
                    let victim = match (&filter.user, filter.all_users) {
                        (None, _) | (_, true) => Some("all users"),
                        (Some(user), false) => (*user != invoker.name).then_some(user.as_str()),
                    };
                    if let Some(victim) = victim {
                        return Err(ValidationError::ForeignKillNeedsRoot {
                            invoker: invoker.name.clone(),
                            target: victim.to_string(),
                        });
                    }
                }
                Ok(machines)
            }
            Request::Run {
                machine, command, ..
            } => {
                check_command(command)?;
                let machine = registry
                    .machine(machine)
                    .cloned()
                    .ok_or_else(|| ValidationError::UnknownMachine(machine.clone()))?;
                Ok(vec![machine])
            }
            Request::Runs {
                group,
                range,
                limit,
                ..
            } => {
                if *limit == 0 {
                    return Err(ValidationError::EmptyDispatch);
                }
                if *limit > MAX_DISPATCH {
                    return Err(ValidationError::DispatchCapExceeded {
                        requested: *limit,
                        cap: MAX_DISPATCH,
                    });
                }
                let group = registry
                    .group(group)
                    .ok_or_else(|| ValidationError::UnknownGroup(group.clone()))?;
                match range {
                    Some((start, end)) => group.range(*start, *end),
                    None => Ok(group.machines().to_vec()),
                }
            }
        }
    }
}

fn check_filter(
    filter: &FilterCriteria,
    machines: &[Machine],
    registry: &Registry,
) -> Result<(), ValidationError> {
    if !filter.pids.is_empty() && machines.len() != 1 {
        return Err(ValidationError::PidNeedsSingleMachine(machines.len()));
    }
    if let Some(user) = filter.user.as_deref().filter(|_| !filter.all_users) {
        if !registry.is_registered(user) {
            return Err(ValidationError::UnregisteredUser(user.to_string()));
        }
    }
    Ok(())
}

fn check_command(command: &str) -> Result<(), ValidationError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(ValidationError::EmptyCommand);
    }
    if command.ends_with('&') {
        return Err(ValidationError::BackgroundModifier(command.to_string()));
    }
    Ok(())
}

/// Outcome of a single `run`.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub scan: MachineReport,
    pub outcome: LaunchOutcome,
}

/// Everything a request needs: registry, remote channel, invoker and history.
pub struct Session<E> {
    registry: Registry,
    coordinator: ScanCoordinator<E>,
    invoker: Invoker,
    audit_log: Box<dyn AuditLog>,
}

impl<E: RemoteExecutor> Session<E> {
    pub fn new(
        registry: Registry,
        coordinator: ScanCoordinator<E>,
        invoker: Invoker,
        audit_log: Box<dyn AuditLog>,
    ) -> Self {
        Self {
            registry,
            coordinator,
            invoker,
            audit_log,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    /// Validate `request` and scan the machines it targets.
    pub async fn scan(
        &self,
        request: &Request,
        progress: &mut dyn ProgressObserver,
    ) -> Result<Vec<MachineReport>, ValidationError> {
        let machines = request.validate(&self.registry, &self.invoker)?;
        Ok(self
            .coordinator
            .scan(&machines, self.registry.users(), progress)
            .await)
    }

    /// Validate and scan, then keep the jobs matching the request's filter.
    pub async fn find_jobs(
        &self,
        request: &Request,
        progress: &mut dyn ProgressObserver,
    ) -> Result<(Vec<MachineReport>, Vec<ProcessRecord>), ValidationError> {
        let filter = match request {
            Request::Job { filter, .. } | Request::Kill { filter, .. } => filter.clone(),
            _ => FilterCriteria::default(),
        };
        let reports = self.scan(request, progress).await?;
        let jobs = filter.select(&reports).into_iter().cloned().collect();
        Ok((reports, jobs))
    }

    /// SIGTERM every given job. Jobs must come from [`Session::find_jobs`] on a `Kill` request.
    pub async fn kill(&self, jobs: &[ProcessRecord]) -> Vec<(ProcessRecord, KillOutcome)> {
        let semaphore = Arc::new(Semaphore::new(self.coordinator.concurrency()));
        let timeout = self.coordinator.timeout();
        let mut tasks = JoinSet::new();
        let mut seen = HashSet::new();

        for job in jobs {
            if !seen.insert(job.key()) {
                continue;
            }
            let Some(machine) = self.registry.machine(&job.machine).cloned() else {
                tracing::warn!("Skipping job on unregistered machine {}", job.machine);
                continue;
            };
            let executor = Arc::clone(self.coordinator.executor());
            let semaphore = Arc::clone(&semaphore);
            let job = job.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = machine.kill(executor.as_ref(), &job, timeout).await;
                (job, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(seen.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => tracing::error!("Kill task failed: {e}"),
            }
        }
        outcomes.sort_by(|(a, _), (b, _)| a.machine.cmp(&b.machine).then(a.pid.cmp(&b.pid)));

        let entries: Vec<_> = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == KillOutcome::Signalled)
            .map(|(job, _)| {
                AuditEntry::new(
                    AuditAction::Kill,
                    &job.machine,
                    AuditTarget::Pid(job.pid),
                    &self.invoker.name,
                )
            })
            .collect();
        audit::record(self.audit_log.as_ref(), &entries);
        outcomes
    }

    /// Launch one command. The machine is scanned first so callers can warn about a full
    /// machine; the launch happens regardless.
    pub async fn run(&self, request: &Request) -> Result<RunReport> {
        let Request::Run { command, cwd, .. } = request else {
            anyhow::bail!("not a run request");
        };
        let machines = request.validate(&self.registry, &self.invoker)?;
        let mut scans = self
            .coordinator
            .scan(&machines, self.registry.users(), &mut Silent)
            .await;
        let (Some(machine), Some(scan)) = (machines.first(), scans.pop()) else {
            anyhow::bail!("no machine to run on");
        };

        let outcome = machine
            .run(
                self.coordinator.executor().as_ref(),
                cwd,
                command.trim(),
                self.coordinator.timeout(),
            )
            .await;
        if outcome.was_issued() {
            audit::record(
                self.audit_log.as_ref(),
                &[AuditEntry::new(
                    AuditAction::Run,
                    &machine.name,
                    AuditTarget::Command(command.trim().to_string()),
                    &self.invoker.name,
                )],
            );
        }
        Ok(RunReport { scan, outcome })
    }

    /// Dispatch a command file onto a group.
    pub async fn runs(
        &self,
        request: &Request,
        progress: &mut dyn ProgressObserver,
    ) -> Result<DispatchReport> {
        let Request::Runs {
            file, limit, cwd, ..
        } = request
        else {
            anyhow::bail!("not a runs request");
        };
        let machines = request.validate(&self.registry, &self.invoker)?;
        let queue = CommandQueue::load(file)?;
        let options = DispatchOptions {
            limit: *limit,
            cwd: cwd.clone(),
            users: self.registry.users().to_vec(),
            actor: self.invoker.name.clone(),
        };
        dispatch::dispatch(
            &self.coordinator,
            &machines,
            &queue,
            &options,
            self.audit_log.as_ref(),
            progress,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::tests::MemoryLog;
    use crate::core::command::Section;
    use crate::core::group::Group;
    use crate::core::machine::tests::{busy_output, cpu_machine};
    use crate::remote::fake::FakeExecutor;
    use std::time::Duration;

    fn registry() -> Registry {
        Registry::new(
            vec![
                Group::new(
                    "tenet",
                    (1..=3)
                        .map(|i| cpu_machine(&format!("tenet{i}"), 8))
                        .collect(),
                ),
                Group::new("kuda", vec![cpu_machine("kuda1", 32)]),
            ],
            vec!["alice".to_string(), "bob".to_string()],
        )
    }

    fn alice() -> Invoker {
        Invoker {
            name: "alice".to_string(),
            is_root: false,
        }
    }

    fn session(fake: FakeExecutor) -> (Session<FakeExecutor>, Arc<FakeExecutor>) {
        let (session, fake, _) = session_with_log(fake);
        (session, fake)
    }

    fn session_with_log(
        fake: FakeExecutor,
    ) -> (Session<FakeExecutor>, Arc<FakeExecutor>, Arc<MemoryLog>) {
        let fake = Arc::new(fake);
        let log = Arc::new(MemoryLog::default());
        let coordinator = ScanCoordinator::new(Arc::clone(&fake), 4, Duration::from_secs(1));
        let session = Session::new(registry(), coordinator, alice(), Box::new(Arc::clone(&log)));
        (session, fake, log)
    }

    fn pid_filter(pids: &[u32]) -> FilterCriteria {
        FilterCriteria {
            user: Some("alice".to_string()),
            pids: pids.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_target_resolution() {
        let registry = registry();
        let group = Target {
            groups: vec!["tenet".to_string()],
            machines: vec![],
        };
        assert_eq!(group.resolve(&registry).unwrap().len(), 3);

        let both = Target {
            groups: vec!["tenet".to_string()],
            machines: vec!["kuda1".to_string()],
        };
        assert!(both.group_suppressed());
        assert_eq!(both.resolve(&registry).unwrap()[0].name, "kuda1");

        assert_eq!(Target::default().resolve(&registry).unwrap().len(), 4);
        assert_eq!(
            Target {
                groups: vec!["nope".to_string()],
                machines: vec![],
            }
            .resolve(&registry),
            Err(ValidationError::UnknownGroup("nope".to_string()))
        );
    }

    #[test]
    fn test_pid_filter_needs_one_machine() {
        let request = Request::Job {
            target: Target {
                groups: vec!["tenet".to_string()],
                machines: vec![],
            },
            filter: pid_filter(&[42]),
        };
        assert_eq!(
            request.validate(&registry(), &alice()),
            Err(ValidationError::PidNeedsSingleMachine(3))
        );

        let single = Request::Job {
            target: Target {
                groups: vec![],
                machines: vec!["tenet2".to_string()],
            },
            filter: pid_filter(&[42]),
        };
        assert!(single.validate(&registry(), &alice()).is_ok());
    }

    #[test]
    fn test_foreign_kill_needs_root() {
        let kill_bob = Request::Kill {
            target: Target::default(),
            filter: FilterCriteria::for_user("bob"),
        };
        assert!(matches!(
            kill_bob.validate(&registry(), &alice()),
            Err(ValidationError::ForeignKillNeedsRoot { .. })
        ));

        let kill_all = Request::Kill {
            target: Target::default(),
            filter: FilterCriteria {
                all_users: true,
                ..Default::default()
            },
        };
        assert!(kill_all.validate(&registry(), &alice()).is_err());

        let root = Invoker {
            name: "root".to_string(),
            is_root: true,
        };
        assert!(kill_bob.validate(&registry(), &root).is_ok());

        let own = Request::Kill {
            target: Target::default(),
            filter: FilterCriteria::for_user("alice"),
        };
        assert!(own.validate(&registry(), &alice()).is_ok());
    }

    #[test]
    fn test_run_and_runs_validation() {
        let run = |command: &str| Request::Run {
            machine: "tenet1".to_string(),
            command: command.to_string(),
            cwd: PathBuf::from("/tmp"),
        };
        assert_eq!(
            run("./sim &").validate(&registry(), &alice()),
            Err(ValidationError::BackgroundModifier("./sim &".to_string()))
        );
        assert_eq!(
            run("  ").validate(&registry(), &alice()),
            Err(ValidationError::EmptyCommand)
        );

        let runs = |limit: usize, range: Option<(u32, u32)>| Request::Runs {
            file: PathBuf::from("cmds.txt"),
            group: "tenet".to_string(),
            range,
            limit,
            cwd: PathBuf::from("/tmp"),
        };
        assert_eq!(
            runs(51, None).validate(&registry(), &alice()),
            Err(ValidationError::DispatchCapExceeded {
                requested: 51,
                cap: MAX_DISPATCH
            })
        );
        assert_eq!(
            runs(0, None).validate(&registry(), &alice()),
            Err(ValidationError::EmptyDispatch)
        );
        assert_eq!(
            runs(10, Some((2, 3))).validate(&registry(), &alice()).unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_invalid_request_makes_no_remote_call() {
        let (session, fake) = session(FakeExecutor::new());
        let request = Request::Kill {
            target: Target {
                groups: vec![],
                machines: vec!["tenet1".to_string(), "tenet2".to_string()],
            },
            filter: pid_filter(&[1000]),
        };

        let result = session.find_jobs(&request, &mut Silent).await;
        assert_eq!(
            result.map(|_| ()),
            Err(ValidationError::PidNeedsSingleMachine(2))
        );
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_find_and_kill_jobs() {
        let (session, fake) =
            session(FakeExecutor::new().with_output("tenet1", busy_output(3)));
        let request = Request::Kill {
            target: Target {
                groups: vec![],
                machines: vec!["tenet1".to_string()],
            },
            filter: pid_filter(&[1001]),
        };

        let (reports, jobs) = session.find_jobs(&request, &mut Silent).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].pid, 1001);

        let outcomes = session.kill(&jobs).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].1, KillOutcome::Signalled);
        assert!(fake.calls().last().unwrap().1.contains("kill -15 1001"));
    }

    #[tokio::test]
    async fn test_multithreaded_job_is_killed_once() {
        let raw = [
            Section::Processes.marker(),
            "alice Rl 500 500 99.0 0.1 2048 01:00 10:00 ./sim -t 3".to_string(),
            "alice Rl 500 500 99.0 0.1 2048 01:00 10:00 ./sim -t 3".to_string(),
            "alice Rl 500 500 99.0 0.1 2048 01:00 10:00 ./sim -t 3".to_string(),
            Section::Memory.marker(),
            "Mem: 1000 400 500 0 100 600".to_string(),
        ]
        .join("\n");
        let (session, fake, log) =
            session_with_log(FakeExecutor::new().with_output("tenet1", raw));
        let request = Request::Kill {
            target: Target {
                groups: vec![],
                machines: vec!["tenet1".to_string()],
            },
            filter: FilterCriteria::for_user("alice"),
        };

        let (_, jobs) = session.find_jobs(&request, &mut Silent).await.unwrap();
        assert_eq!(jobs.len(), 1);

        let doubled = [jobs[0].clone(), jobs[0].clone()];
        let outcomes = session.kill(&doubled).await;
        assert_eq!(outcomes.len(), 1);

        let kills = fake
            .calls()
            .into_iter()
            .filter(|(_, script)| script.contains("kill -15"))
            .count();
        assert_eq!(kills, 1);
        assert_eq!(log.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_scans_then_launches() {
        let (session, fake) =
            session(FakeExecutor::new().with_output("tenet3", busy_output(8)));
        let request = Request::Run {
            machine: "tenet3".to_string(),
            command: "./sim -N 10".to_string(),
            cwd: PathBuf::from("/home/alice"),
        };

        let report = session.run(&request).await.unwrap();
        assert_eq!(report.scan.free_units(), 0);
        assert_eq!(report.outcome, LaunchOutcome::Issued);
        assert_eq!(fake.calls().len(), 2);
    }
}
