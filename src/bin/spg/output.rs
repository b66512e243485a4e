use owo_colors::OwoColorize;
use spg::config::Registry;
use spg::core::group::{sort_reports, Group, GroupSummary};
use spg::core::job::ProcessRecord;
use spg::core::machine::{Machine, MachineReport, ScanStatus, UnitKind};
use spg::core::scan::{ProgressObserver, Silent};
use spg::utils::{format_bytes, format_ps_elapsed};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{IsTerminal, Write};
use tabled::{builder::Builder, settings::Style};

const BAR_WIDTH: usize = 30;

/// Scan progress as one self-overwriting line on stderr.
pub struct StderrProgress {
    label: String,
}

impl StderrProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    fn draw(&self, completed: usize, total: usize) {
        let filled = (BAR_WIDTH * completed).checked_div(total).unwrap_or(BAR_WIDTH);
        let mut stderr = std::io::stderr().lock();
        let _ = write!(
            stderr,
            "\r{} [{}{}] {completed}/{total}",
            self.label,
            "#".repeat(filled),
            " ".repeat(BAR_WIDTH - filled),
        );
        let _ = stderr.flush();
    }
}

impl ProgressObserver for StderrProgress {
    fn started(&mut self, total: usize) {
        self.draw(0, total);
    }

    fn advanced(&mut self, completed: usize, total: usize) {
        self.draw(completed, total);
    }

    fn finished(&mut self) {
        eprintln!();
    }
}

/// Progress display for a scan, or nothing when silenced or not on a terminal.
pub fn progress(silent: bool) -> Box<dyn ProgressObserver> {
    if silent || !std::io::stderr().is_terminal() {
        Box::new(Silent)
    } else {
        Box::new(StderrProgress::new("Scanning"))
    }
}

pub fn warn(message: impl std::fmt::Display) {
    eprintln!("{} {message}", "WARNING:".yellow().bold());
}

/// Order reports for display and print what went wrong on each machine.
pub fn prepare(reports: &mut [MachineReport]) {
    sort_reports(reports);
    for report in reports.iter() {
        if let ScanStatus::Unreachable { reason } = &report.status {
            eprintln!(
                "{} {}: {reason}",
                "UNREACHABLE:".red().bold(),
                report.machine.name
            );
        }
        for warning in &report.warnings {
            warn(format_args!("{}: {warning}", report.machine.name));
        }
    }
}

fn render(builder: Builder) -> String {
    builder.build().with(Style::rounded()).to_string()
}

fn compute_unit(machine: &Machine) -> String {
    match &machine.gpu {
        Some(gpu) => gpu.model.clone(),
        None => machine.cpu_model.clone(),
    }
}

fn units(count: u32, kind: UnitKind) -> String {
    format!("{count} {kind}")
}

/// Groups of the registry in display order, restricted to those that appear in `names`.
fn groups_of<'a, 'b>(
    registry: &'a Registry,
    names: impl Iterator<Item = &'b str>,
) -> Vec<&'a Group> {
    let present: Vec<&str> = names.collect();
    registry
        .groups()
        .iter()
        .filter(|g| present.contains(&g.name.as_str()))
        .collect()
}

pub fn machine_table(machines: &[Machine]) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Machine", "ComputeUnit", "Units", "Memory", "Comment"]);
    for machine in machines {
        builder.push_record([
            machine.name.clone(),
            compute_unit(machine),
            units(machine.units(), machine.kind()),
            format_bytes(machine.ram_bytes),
            machine.comment.clone(),
        ]);
    }
    render(builder)
}

/// Registry totals per group, for machines that were listed.
pub fn list_summary(registry: &Registry, machines: &[Machine]) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Group", "Machines", "Units", "Memory"]);
    for group in groups_of(registry, machines.iter().map(|m| m.group.as_str())) {
        let members: Vec<_> = machines.iter().filter(|m| m.group == group.name).collect();
        builder.push_record([
            group.name.clone(),
            members.len().to_string(),
            units(members.iter().map(|m| m.units()).sum(), group.kind()),
            format_bytes(members.iter().map(|m| m.ram_bytes).sum()),
        ]);
    }
    render(builder)
}

pub fn free_table(reports: &[MachineReport]) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Machine", "ComputeUnit", "Free", "Free memory"]);
    for report in reports.iter().filter(|r| r.free_units() > 0) {
        builder.push_record([
            report.machine.name.clone(),
            compute_unit(&report.machine),
            units(report.free_units(), report.machine.kind()),
            format_bytes(report.free_memory()),
        ]);
    }
    render(builder)
}

pub fn summaries(registry: &Registry, reports: &[MachineReport]) -> Vec<GroupSummary> {
    groups_of(registry, reports.iter().map(|r| r.machine.group.as_str()))
        .into_iter()
        .map(|group| group.summarize(reports))
        .collect()
}

pub fn free_summary(summaries: &[GroupSummary]) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Group", "Free machines", "Free units", "Free memory", "Unreachable"]);
    for summary in summaries {
        builder.push_record([
            summary.group.clone(),
            format!("{} / {}", summary.free_machines, summary.machines),
            format!("{} / {}", units(summary.free_units, summary.kind), summary.units),
            format_bytes(summary.free_ram_bytes),
            summary.unreachable.to_string(),
        ]);
    }
    render(builder)
}

fn machine_label(job: &ProcessRecord) -> String {
    match job.gpu {
        Some(gpu) => format!("{}-GPU{}", job.machine, gpu.index),
        None => job.machine.clone(),
    }
}

/// Order jobs like the reports they came from, then by pid.
pub fn sort_jobs(jobs: &mut [ProcessRecord], reports: &[MachineReport]) {
    let position: HashMap<&str, usize> = reports
        .iter()
        .enumerate()
        .map(|(i, r)| (r.machine.name.as_str(), i))
        .collect();
    jobs.sort_by_key(|j| {
        (
            position.get(j.machine.as_str()).copied().unwrap_or(usize::MAX),
            j.pid,
        )
    });
}

pub fn job_table(jobs: &[ProcessRecord]) -> String {
    let mut builder = Builder::default();
    builder.push_record([
        "Machine", "User", "ST", "PID", "CPU(%)", "MEM(%)", "Memory", "Time", "Start", "Command",
    ]);
    for job in jobs {
        builder.push_record([
            machine_label(job),
            job.user.clone(),
            job.state.clone(),
            job.pid.to_string(),
            format!("{:.1}", job.cpu_percent),
            format!("{:.1}", job.mem_percent),
            format_bytes(job.rss_bytes),
            format_ps_elapsed(job.elapsed),
            job.start.clone(),
            job.command.clone(),
        ]);
    }
    render(builder)
}

/// Per group: machines holding one of `jobs` out of the scanned ones, and the job count.
pub fn job_summary(registry: &Registry, reports: &[MachineReport], jobs: &[ProcessRecord]) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Group", "Busy machines", "Jobs"]);
    for group in groups_of(registry, reports.iter().map(|r| r.machine.group.as_str())) {
        let scanned = reports.iter().filter(|r| r.machine.group == group.name).count();
        let matched: Vec<_> = jobs
            .iter()
            .filter(|j| group.machine(&j.machine).is_some())
            .collect();
        let busy: BTreeSet<&str> = matched.iter().map(|j| j.machine.as_str()).collect();
        builder.push_record([
            group.name.clone(),
            format!("{} / {scanned}", busy.len()),
            matched.len().to_string(),
        ]);
    }
    render(builder)
}

/// Job counts with one row per user and one column per group, plus a total row.
pub fn user_table(summaries: &[GroupSummary]) -> String {
    let mut per_user: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (column, summary) in summaries.iter().enumerate() {
        for (user, count) in &summary.users {
            per_user
                .entry(user.as_str())
                .or_insert_with(|| vec![0; summaries.len()])[column] = *count;
        }
    }

    let mut builder = Builder::default();
    let mut header = vec!["User".to_string(), "total".to_string()];
    header.extend(summaries.iter().map(|s| s.group.clone()));
    builder.push_record(header);

    for (user, counts) in &per_user {
        let mut row = vec![user.to_string(), counts.iter().sum::<usize>().to_string()];
        row.extend(counts.iter().map(ToString::to_string));
        builder.push_record(row);
    }

    let totals: Vec<usize> = summaries.iter().map(|s| s.jobs).collect();
    let mut row = vec!["total".to_string(), totals.iter().sum::<usize>().to_string()];
    row.extend(totals.iter().map(ToString::to_string));
    builder.push_record(row);

    render(builder)
}
