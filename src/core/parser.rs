//! Parsing of remote scan output into typed records.
//!
//! Column layouts of external tools are confined to a [`RecordSchema`]. A malformed line is
//! skipped and reported as a [`ScanWarning`]; it never discards the rest of the output.

use crate::core::command::{Section, SECTION_PREFIX};
use crate::core::error::ParseError;
use crate::core::job::{GpuRecord, GpuUsage, MemorySummary, ProcessRecord};
use crate::core::MAX_GPUS_PER_MACHINE;
use crate::utils::{parse_ps_elapsed, parse_size};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

const MIB: u64 = 1024 * 1024;

/// Non-fatal condition found while scanning one machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanWarning {
    Parse(ParseError),
    MissingSection(Section),
    SchemaMismatch { found: String },
    GpuCeiling { observed: usize },
    Zombie { pid: u32 },
    ZeroMemory { pid: u32 },
    Remote(String),
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanWarning::Parse(e) => write!(f, "skipped malformed line, {e}"),
            ScanWarning::MissingSection(section) => write!(f, "no {section} section in output"),
            ScanWarning::SchemaMismatch { found } => {
                write!(f, "unexpected output schema marker {found:?}")
            }
            ScanWarning::GpuCeiling { observed } => write!(
                f,
                "{observed} GPUs found, only the first {MAX_GPUS_PER_MACHINE} are monitored"
            ),
            ScanWarning::Zombie { pid } => write!(f, "zombie process {pid}"),
            ScanWarning::ZeroMemory { pid } => write!(f, "zero-memory process {pid}"),
            ScanWarning::Remote(message) => write!(f, "{message}"),
        }
    }
}

/// A compute process reported by `nvidia-smi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuApp {
    pub pid: u32,
    pub bus_id: String,
    pub vram_bytes: u64,
}

/// Column layout of the remote tools, one implementation per output schema version.
pub trait RecordSchema: Send + Sync {
    fn version(&self) -> u32;

    fn parse_process_line(&self, machine: &str, line: &str) -> Result<ProcessRecord, ParseError>;

    fn parse_memory(&self, lines: &[&str]) -> Result<MemorySummary, ParseError>;

    fn parse_gpu_line(&self, line: &str) -> Result<GpuRecord, ParseError>;

    fn parse_gpu_app_line(&self, line: &str) -> Result<GpuApp, ParseError>;
}

/// `ps`/`free`/`nvidia-smi` layout produced by [`crate::core::command::scan_script`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PsSchemaV1;

impl RecordSchema for PsSchemaV1 {
    fn version(&self) -> u32 {
        1
    }

    fn parse_process_line(&self, machine: &str, line: &str) -> Result<ProcessRecord, ParseError> {
        let (fields, command) = split_fields(line, 9)
            .ok_or_else(|| ParseError::new(line, "expected 10 columns"))?;
        if command.is_empty() {
            return Err(ParseError::new(line, "missing command"));
        }

        let number_err = |column: &str| ParseError::new(line, format!("invalid {column}"));
        Ok(ProcessRecord {
            machine: machine.to_string(),
            user: fields[0].to_string(),
            state: fields[1].to_string(),
            pid: fields[2].parse().map_err(|_| number_err("pid"))?,
            sid: fields[3].parse().map_err(|_| number_err("sid"))?,
            cpu_percent: fields[4].parse().map_err(|_| number_err("cpu%"))?,
            mem_percent: fields[5].parse().map_err(|_| number_err("mem%"))?,
            rss_bytes: parse_size(fields[6], 1024).map_err(|_| number_err("rss"))?,
            elapsed: parse_ps_elapsed(fields[7]).map_err(|_| number_err("elapsed time"))?,
            start: fields[8].to_string(),
            command: command.to_string(),
            gpu: None,
            threads: 1,
        })
    }

    fn parse_memory(&self, lines: &[&str]) -> Result<MemorySummary, ParseError> {
        let line = lines
            .iter()
            .find(|l| l.trim_start().starts_with("Mem:"))
            .ok_or_else(|| ParseError::new(lines.join("\n"), "no Mem: row"))?;
        let values = line
            .split_whitespace()
            .skip(1)
            .map(|v| v.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ParseError::new(*line, "invalid memory value"))?;

        match values.as_slice() {
            [total, used, .., available] => Ok(MemorySummary {
                total: *total,
                used: *used,
                free: *available,
            }),
            _ => Err(ParseError::new(*line, "expected at least 3 memory columns")),
        }
    }

    fn parse_gpu_line(&self, line: &str) -> Result<GpuRecord, ParseError> {
        let fields = csv_fields(line)?;
        let [index, bus_id, utilization, used, total] = fields.as_slice() else {
            return Err(ParseError::new(line, "expected 5 GPU columns"));
        };

        Ok(GpuRecord {
            index: index
                .parse()
                .map_err(|_| ParseError::new(line, "invalid GPU index"))?,
            bus_id: bus_id.clone(),
            utilization: not_available_as_zero(utilization)
                .parse()
                .map_err(|_| ParseError::new(line, "invalid GPU utilization"))?,
            vram_used: mib(line, used)?,
            vram_total: mib(line, total)?,
        })
    }

    fn parse_gpu_app_line(&self, line: &str) -> Result<GpuApp, ParseError> {
        let fields = csv_fields(line)?;
        let [pid, bus_id, used] = fields.as_slice() else {
            return Err(ParseError::new(line, "expected 3 GPU process columns"));
        };

        Ok(GpuApp {
            pid: pid
                .parse()
                .map_err(|_| ParseError::new(line, "invalid pid"))?,
            bus_id: bus_id.clone(),
            vram_bytes: mib(line, used)?,
        })
    }
}

/// Everything parsed from one scan round trip.
#[derive(Debug, Default, Clone)]
pub struct ParsedScan {
    pub processes: Vec<ProcessRecord>,
    pub memory: Option<MemorySummary>,
    pub gpus: Vec<GpuRecord>,
    pub warnings: Vec<ScanWarning>,
}

/// Parse the output of a scan script.
///
/// On GPU machines only processes holding a GPU are kept, one record per PID, tagged with
/// the GPU they run on.
pub fn parse_scan_output(
    schema: &dyn RecordSchema,
    machine: &str,
    raw: &str,
    gpu: bool,
) -> ParsedScan {
    let mut parsed = ParsedScan::default();
    let sections = split_sections(schema.version(), raw, &mut parsed.warnings);

    match sections.get(&Section::Processes) {
        Some(lines) => {
            for line in lines {
                match schema.parse_process_line(machine, line) {
                    Ok(record) => parsed.processes.push(record),
                    Err(e) => parsed.warnings.push(ScanWarning::Parse(e)),
                }
            }
        }
        None => parsed
            .warnings
            .push(ScanWarning::MissingSection(Section::Processes)),
    }

    match sections.get(&Section::Memory) {
        Some(lines) => match schema.parse_memory(lines) {
            Ok(memory) => parsed.memory = Some(memory),
            Err(e) => parsed.warnings.push(ScanWarning::Parse(e)),
        },
        None => parsed
            .warnings
            .push(ScanWarning::MissingSection(Section::Memory)),
    }

    if !gpu {
        return parsed;
    }

    let mut gpus = Vec::new();
    for line in sections.get(&Section::Gpus).into_iter().flatten() {
        match schema.parse_gpu_line(line) {
            Ok(record) => gpus.push(record),
            Err(e) => parsed.warnings.push(ScanWarning::Parse(e)),
        }
    }
    if gpus.len() > MAX_GPUS_PER_MACHINE {
        parsed.warnings.push(ScanWarning::GpuCeiling {
            observed: gpus.len(),
        });
        gpus.truncate(MAX_GPUS_PER_MACHINE);
    }

    let gpu_by_bus: HashMap<&str, u32> = gpus
        .iter()
        .map(|g| (g.bus_id.as_str(), g.index))
        .collect();
    let mut usage: HashMap<u32, GpuUsage> = HashMap::new();
    for line in sections.get(&Section::GpuApps).into_iter().flatten() {
        match schema.parse_gpu_app_line(line) {
            Ok(app) => {
                if let Some(&index) = gpu_by_bus.get(app.bus_id.as_str()) {
                    usage.entry(app.pid).or_insert(GpuUsage {
                        index,
                        vram_bytes: app.vram_bytes,
                    });
                }
            }
            Err(e) => parsed.warnings.push(ScanWarning::Parse(e)),
        }
    }

    let processes = std::mem::take(&mut parsed.processes);
    for mut record in processes {
        if let Some(gpu) = usage.remove(&record.pid) {
            record.gpu = Some(gpu);
            parsed.processes.push(record);
        }
    }
    parsed.gpus = gpus;
    parsed
}

fn split_sections<'a>(
    version: u32,
    raw: &'a str,
    warnings: &mut Vec<ScanWarning>,
) -> HashMap<Section, Vec<&'a str>> {
    let expected = format!("{SECTION_PREFIX}/{version}:");
    let mut sections: HashMap<Section, Vec<&str>> = HashMap::new();
    let mut current = None;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with(SECTION_PREFIX) {
            current = trimmed
                .strip_prefix(&expected)
                .and_then(|name| Section::from_str(name).ok());
            match current {
                Some(section) => {
                    sections.entry(section).or_default();
                }
                None => warnings.push(ScanWarning::SchemaMismatch {
                    found: trimmed.to_string(),
                }),
            }
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        if let Some(section) = current {
            sections.entry(section).or_default().push(line);
        }
    }
    sections
}

/// Split off `n` whitespace-separated fields and return them with the untouched remainder.
fn split_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest.trim_end()))
}

fn csv_fields(line: &str) -> Result<Vec<String>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());
    let record = reader
        .records()
        .next()
        .ok_or_else(|| ParseError::new(line, "empty csv row"))?
        .map_err(|e| ParseError::new(line, e.to_string()))?;
    Ok(record.iter().map(str::to_string).collect())
}

fn not_available_as_zero(value: &str) -> &str {
    match value {
        "[N/A]" | "N/A" | "[Not Supported]" => "0",
        other => other,
    }
}

fn mib(line: &str, value: &str) -> Result<u64, ParseError> {
    not_available_as_zero(value)
        .parse::<u64>()
        .map(|v| v * MIB)
        .map_err(|_| ParseError::new(line, "invalid memory value"))
}
