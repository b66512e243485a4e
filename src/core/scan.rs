use crate::core::machine::{Machine, MachineReport, ScanStatus};
use crate::remote::RemoteExecutor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Receives scan progress. The only link between the engine and any display.
pub trait ProgressObserver: Send {
    fn started(&mut self, _total: usize) {}

    /// Called once per machine, after its scan finished or failed.
    fn advanced(&mut self, completed: usize, total: usize);

    fn finished(&mut self) {}
}

/// Observer that ignores every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl ProgressObserver for Silent {
    fn advanced(&mut self, _completed: usize, _total: usize) {}
}

/// Fans scans out to many machines at once.
///
/// Holds no results between calls; every [`ScanCoordinator::scan`] queries the fleet anew.
pub struct ScanCoordinator<E> {
    executor: Arc<E>,
    concurrency: usize,
    timeout: Duration,
}

impl<E: RemoteExecutor> ScanCoordinator<E> {
    pub fn new(executor: Arc<E>, concurrency: usize, timeout: Duration) -> Self {
        Self {
            executor,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Scan every machine and return one report per machine, in completion order.
    pub async fn scan(
        &self,
        machines: &[Machine],
        users: &[String],
        progress: &mut dyn ProgressObserver,
    ) -> Vec<MachineReport> {
        let total = machines.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let users: Arc<[String]> = users.into();
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::with_capacity(total);

        progress.started(total);
        for machine in machines {
            let executor = Arc::clone(&self.executor);
            let semaphore = Arc::clone(&semaphore);
            let users = Arc::clone(&users);
            let timeout = self.timeout;
            let task_machine = machine.clone();
            let handle = tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                task_machine.scan(executor.as_ref(), &users, timeout).await
            });
            spawned.insert(handle.id(), machine);
        }

        let mut reports = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, report)) => reports.push(report),
                Err(e) => {
                    if let Some(machine) = spawned.get(&e.id()) {
                        tracing::error!("Scan task for {} failed: {e}", machine.name);
                        reports.push(MachineReport {
                            machine: (*machine).clone(),
                            status: ScanStatus::Unreachable {
                                reason: format!("scan aborted: {e}"),
                            },
                            warnings: Vec::new(),
                        });
                    }
                }
            }
            progress.advanced(reports.len(), total);
        }
        progress.finished();

        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::RemoteError;
    use crate::core::machine::tests::{busy_output, cpu_machine};
    use crate::remote::fake::FakeExecutor;
    use crate::remote::RemoteOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        total: usize,
        seen: Vec<usize>,
        finished: bool,
    }

    impl ProgressObserver for Recorder {
        fn started(&mut self, total: usize) {
            self.total = total;
        }

        fn advanced(&mut self, completed: usize, total: usize) {
            assert_eq!(total, self.total);
            self.seen.push(completed);
        }

        fn finished(&mut self) {
            self.finished = true;
        }
    }

    #[tokio::test]
    async fn test_unreachable_machines_are_isolated() {
        let machines: Vec<_> = (1..=10)
            .map(|i| cpu_machine(&format!("tenet{i}"), 8))
            .collect();
        let mut fake = FakeExecutor::new();
        for machine in &machines {
            fake = match machine.id {
                3 | 7 => fake.refusing(&machine.name),
                9 => fake.timing_out(&machine.name),
                _ => fake.with_output(&machine.name, busy_output(2)),
            };
        }

        let coordinator = ScanCoordinator::new(Arc::new(fake), 4, Duration::from_secs(1));
        let mut recorder = Recorder::default();
        let reports = coordinator.scan(&machines, &[], &mut recorder).await;

        assert_eq!(reports.len(), 10);
        assert_eq!(reports.iter().filter(|r| r.is_reachable()).count(), 7);
        let mut down: Vec<_> = reports
            .iter()
            .filter(|r| !r.is_reachable())
            .map(|r| r.machine.id)
            .collect();
        down.sort_unstable();
        assert_eq!(down, vec![3, 7, 9]);

        assert_eq!(recorder.seen, (1..=10).collect::<Vec<_>>());
        assert!(recorder.finished);
    }

    #[tokio::test]
    async fn test_empty_machine_set() {
        let coordinator =
            ScanCoordinator::new(Arc::new(FakeExecutor::new()), 4, Duration::from_secs(1));
        let reports = coordinator.scan(&[], &[], &mut Silent).await;
        assert!(reports.is_empty());
    }

    struct Probe {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl RemoteExecutor for Probe {
        async fn execute(
            &self,
            _host: &str,
            _script: &str,
            _timeout: Duration,
        ) -> Result<RemoteOutput, RemoteError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(RemoteOutput {
                status: Some(0),
                stdout: busy_output(0),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let probe = Arc::new(Probe {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let machines: Vec<_> = (1..=12)
            .map(|i| cpu_machine(&format!("tenet{i}"), 8))
            .collect();

        let coordinator = ScanCoordinator::new(Arc::clone(&probe), 3, Duration::from_secs(1));
        let reports = coordinator.scan(&machines, &[], &mut Silent).await;

        assert_eq!(reports.len(), 12);
        assert!(probe.peak.load(Ordering::SeqCst) <= 3);
    }
}
