//! Bulk dispatch of a command file onto free machines.

use crate::audit::{self, AuditAction, AuditEntry, AuditLog, AuditTarget};
use crate::core::machine::{LaunchOutcome, Machine, MachineReport};
use crate::core::queue::{CommandQueue, PendingCommand};
use crate::core::scan::{ProgressObserver, ScanCoordinator};
use crate::core::MAX_DISPATCH;
use crate::remote::RemoteExecutor;
use anyhow::Result;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchAssignment {
    pub machine: Machine,
    /// Line of the command in the queue file.
    pub line: usize,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub assignment: DispatchAssignment,
    pub outcome: LaunchOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Free units across the candidate machines before dispatch.
    pub free_units: u32,
    pub pending: usize,
    /// Launch attempts in queue order.
    pub launched: Vec<Dispatched>,
    /// Lines removed from the queue file.
    pub removed: Vec<String>,
    /// Why the queue file could not be rewritten. Its issued lines are still in it.
    pub rewrite_error: Option<String>,
    pub scans: Vec<MachineReport>,
}

impl DispatchReport {
    pub fn issued(&self) -> usize {
        self.launched
            .iter()
            .filter(|d| d.outcome.was_issued())
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Most commands to launch, clamped to [`MAX_DISPATCH`].
    pub limit: usize,
    /// Working directory the commands run in.
    pub cwd: PathBuf,
    /// Users whose processes count as occupying a unit.
    pub users: Vec<String>,
    pub actor: String,
}

/// Assign commands to machines in queue order, first-fit over ascending machine id.
pub fn plan(
    reports: &[MachineReport],
    pending: &[PendingCommand],
    limit: usize,
) -> Vec<DispatchAssignment> {
    let mut slots: Vec<(&Machine, u32)> = reports
        .iter()
        .map(|r| (&r.machine, r.free_units()))
        .filter(|(_, free)| *free > 0)
        .collect();
    slots.sort_by(|(a, _), (b, _)| a.id.cmp(&b.id).then_with(|| a.name.cmp(&b.name)));

    let mut assignments = Vec::new();
    let mut slot = 0;
    for pending in pending.iter().take(limit.min(MAX_DISPATCH)) {
        while slot < slots.len() && slots[slot].1 == 0 {
            slot += 1;
        }
        let Some((machine, free)) = slots.get_mut(slot) else {
            break;
        };
        *free -= 1;
        assignments.push(DispatchAssignment {
            machine: (*machine).clone(),
            line: pending.line,
            command: pending.command.clone(),
        });
    }
    assignments
}

/// Scan `machines`, launch as many queued commands as they have free units and drop the
/// issued ones from the queue file.
///
/// The file is rewritten once, after every launch returned and was recorded in the history.
/// A failed rewrite does not discard the launches: it is reported in
/// [`DispatchReport::rewrite_error`].
pub async fn dispatch<E: RemoteExecutor>(
    coordinator: &ScanCoordinator<E>,
    machines: &[Machine],
    queue: &CommandQueue,
    options: &DispatchOptions,
    audit_log: &dyn AuditLog,
    progress: &mut dyn ProgressObserver,
) -> Result<DispatchReport> {
    queue.validate()?;
    let pending = queue.pending();

    let scans = coordinator.scan(machines, &options.users, progress).await;
    let free_units: u32 = scans.iter().map(MachineReport::free_units).sum();
    let assignments = plan(&scans, &pending, options.limit);

    let mut report = DispatchReport {
        free_units,
        pending: pending.len(),
        scans,
        ..Default::default()
    };
    if assignments.is_empty() {
        tracing::info!("Nothing dispatched: {} free units", free_units);
        return Ok(report);
    }

    report.launched = launch_all(coordinator, assignments, options).await;

    let entries: Vec<_> = report
        .launched
        .iter()
        .filter(|d| d.outcome.was_issued())
        .map(|d| {
            AuditEntry::new(
                AuditAction::Dispatch,
                &d.assignment.machine.name,
                AuditTarget::Command(d.assignment.command.clone()),
                &options.actor,
            )
        })
        .collect();
    audit::record(audit_log, &entries);

    let issued: BTreeSet<usize> = report
        .launched
        .iter()
        .filter(|d| d.outcome.was_issued())
        .map(|d| d.assignment.line)
        .collect();
    match queue.commit(&issued) {
        Ok(removed) => report.removed = removed,
        Err(e) => {
            tracing::error!(
                "Launched {} command(s) but failed to update {}: {e:#}",
                issued.len(),
                queue.path().display()
            );
            report.rewrite_error = Some(format!("{e:#}"));
        }
    }

    Ok(report)
}

async fn launch_all<E: RemoteExecutor>(
    coordinator: &ScanCoordinator<E>,
    assignments: Vec<DispatchAssignment>,
    options: &DispatchOptions,
) -> Vec<Dispatched> {
    let semaphore = Arc::new(Semaphore::new(coordinator.concurrency()));
    let cwd = Arc::new(options.cwd.clone());
    let timeout = coordinator.timeout();
    let mut tasks = JoinSet::new();

    for (order, assignment) in assignments.iter().cloned().enumerate() {
        let executor = Arc::clone(coordinator.executor());
        let semaphore = Arc::clone(&semaphore);
        let cwd = Arc::clone(&cwd);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let outcome = assignment
                .machine
                .run(executor.as_ref(), &cwd, &assignment.command, timeout)
                .await;
            (order, outcome)
        });
    }

    let mut outcomes: Vec<Option<LaunchOutcome>> = vec![None; assignments.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((order, outcome)) => outcomes[order] = Some(outcome),
            Err(e) => tracing::error!("Launch task failed: {e}"),
        }
    }

    assignments
        .into_iter()
        .zip(outcomes)
        .map(|(assignment, outcome)| Dispatched {
            assignment,
            outcome: outcome.unwrap_or_else(|| LaunchOutcome::NotIssued {
                reason: "launch task aborted".to_string(),
            }),
        })
        .collect()
}
