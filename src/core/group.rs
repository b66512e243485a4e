use crate::core::error::ValidationError;
use crate::core::machine::{Machine, MachineReport, UnitKind};
use std::collections::BTreeMap;

/// Machines sharing a name prefix, ordered by their numeric id.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: String,
    machines: Vec<Machine>,
}

impl Group {
    /// Build a group, sorting machines by id. Names must be unique.
    pub fn new(name: impl Into<String>, mut machines: Vec<Machine>) -> Self {
        machines.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.name.cmp(&b.name)));
        machines.dedup_by(|a, b| a.name == b.name);
        Self {
            name: name.into(),
            machines,
        }
    }

    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    pub fn machine(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.name == name)
    }

    pub fn kind(&self) -> UnitKind {
        self.machines
            .first()
            .map_or(UnitKind::Cpu, |m| m.kind())
    }

    /// Machines whose id lies in `start..=end`.
    pub fn range(&self, start: u32, end: u32) -> Result<Vec<Machine>, ValidationError> {
        if start > end {
            return Err(ValidationError::InvalidRange { start, end });
        }
        Ok(self
            .machines
            .iter()
            .filter(|m| (start..=end).contains(&m.id))
            .cloned()
            .collect())
    }

    /// Aggregate the reports of this group's machines. Reports of other groups are ignored.
    pub fn summarize(&self, reports: &[MachineReport]) -> GroupSummary {
        let mut summary = GroupSummary {
            group: self.name.clone(),
            kind: self.kind(),
            ..Default::default()
        };

        for report in reports.iter().filter(|r| r.machine.group == self.name) {
            summary.machines += 1;
            summary.units += report.machine.units();
            summary.ram_bytes += report.machine.ram_bytes;
            if !report.is_reachable() {
                summary.unreachable += 1;
                continue;
            }

            let free = report.free_units();
            if free > 0 {
                summary.free_machines += 1;
                summary.free_units += free;
            }
            summary.free_ram_bytes += report.free_memory();
            summary.jobs += report.jobs().len();
            if !report.jobs().is_empty() {
                summary.busy_machines += 1;
            }
            for job in report.jobs() {
                *summary.users.entry(job.user.clone()).or_default() += 1;
            }
        }
        summary
    }
}

/// Group-wide totals of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSummary {
    pub group: String,
    pub kind: UnitKind,
    pub machines: usize,
    pub unreachable: usize,
    pub units: u32,
    pub ram_bytes: u64,
    /// Reachable machines with at least one free unit.
    pub free_machines: usize,
    pub free_units: u32,
    pub free_ram_bytes: u64,
    pub busy_machines: usize,
    pub jobs: usize,
    /// Job count per user.
    pub users: BTreeMap<String, usize>,
}

/// Display order of scan results: by group, then machine id.
pub fn sort_reports(reports: &mut [MachineReport]) {
    reports.sort_by(|a, b| {
        a.machine
            .group
            .cmp(&b.machine.group)
            .then(a.machine.id.cmp(&b.machine.id))
    });
}
