use crate::core::job::ProcessRecord;
use crate::core::machine::MachineReport;
use std::collections::BTreeSet;
use std::time::Duration;

/// Conjunction of optional predicates over process records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    pub user: Option<String>,
    /// Ignore `user` and match every user.
    pub all_users: bool,
    pub pids: BTreeSet<u32>,
    /// Every entry must occur in the command line.
    pub commands: Vec<String>,
    /// Only jobs that have run for less than this.
    pub max_elapsed: Option<Duration>,
    /// Exact `ps` start column, e.g. `10:42` or `Jan05`.
    pub start: Option<String>,
}

impl FilterCriteria {
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &ProcessRecord) -> bool {
        if !self.all_users {
            if let Some(user) = &self.user {
                if record.user != *user {
                    return false;
                }
            }
        }
        if !self.pids.is_empty() && !self.pids.contains(&record.pid) {
            return false;
        }
        if !self
            .commands
            .iter()
            .all(|needle| record.command.contains(needle.as_str()))
        {
            return false;
        }
        if let Some(max) = self.max_elapsed {
            if record.elapsed >= max {
                return false;
            }
        }
        if let Some(start) = &self.start {
            if record.start != *start {
                return false;
            }
        }
        true
    }

    /// Matching jobs across all reachable machines, in report order.
    pub fn select<'a>(&self, reports: &'a [MachineReport]) -> Vec<&'a ProcessRecord> {
        reports
            .iter()
            .flat_map(|r| r.jobs())
            .filter(|job| self.matches(job))
            .collect()
    }
}
