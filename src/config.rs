use crate::core::error::RegistryError;
use crate::core::group::Group;
use crate::core::machine::{GpuSpec, Machine};
use crate::core::{get_config_dir, get_data_dir, MAX_DISPATCH};
use crate::utils::{parse_size, split_machine_name};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Users whose processes are scanned. Empty means every user except root.
    #[serde(default)]
    pub users: Vec<String>,
    /// Machine groups in display order. Empty means every registry file.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Directory of `<group>.json` machine files (default: `<config_dir>/spg/machine`)
    #[serde(default)]
    pub registry_dir: Option<PathBuf>,
    /// Default limit of `runs`, never above 50
    #[serde(default = "default_max_runs")]
    pub max_runs: usize,
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    #[serde(default)]
    pub ssh: SshConfig,
    /// History file (default: `<data_dir>/spg/history.jsonl`)
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SshConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Upper bound of a whole remote invocation, connection included
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_max_runs() -> usize {
    MAX_DISPATCH
}

fn default_scan_concurrency() -> usize {
    32
}

fn default_connect_timeout_secs() -> u64 {
    4
}

fn default_command_timeout_secs() -> u64 {
    30
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            groups: Vec::new(),
            registry_dir: None,
            max_runs: default_max_runs(),
            scan_concurrency: default_scan_concurrency(),
            ssh: SshConfig::default(),
            audit_log: None,
        }
    }
}

impl Config {
    pub fn registry_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.registry_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_config_dir()?.join("machine")),
        }
    }

    pub fn audit_log_path(&self) -> anyhow::Result<PathBuf> {
        match &self.audit_log {
            Some(path) => Ok(path.clone()),
            None => Ok(get_data_dir()?.join("history.jsonl")),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.command_timeout_secs)
    }
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    // Default config file, overridden by an explicit one
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("spg.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            tracing::warn!("Config file {config_path:?} not found.");
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("SPG")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("users")
                .with_list_parse_key("groups"),
        )
        .build()?
        .try_deserialize()
}

/// Registry values written either as JSON scalars or as strings.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Number(u64),
    Text(String),
}

impl Loose {
    fn as_flag(&self) -> Option<bool> {
        match self {
            Loose::Bool(b) => Some(*b),
            Loose::Number(n) => Some(*n != 0),
            Loose::Text(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" | "" => Some(false),
                _ => None,
            },
        }
    }

    fn as_count(&self) -> Option<u32> {
        match self {
            Loose::Number(n) => u32::try_from(*n).ok(),
            Loose::Text(s) => s.trim().parse().ok(),
            Loose::Bool(_) => None,
        }
    }

    fn as_size(&self) -> Option<u64> {
        match self {
            Loose::Number(n) => Some(*n),
            Loose::Text(s) => parse_size(s, 1).ok(),
            Loose::Bool(_) => None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
struct MachineEntry {
    #[serde(alias = "use")]
    enabled: Option<Loose>,
    name: Option<String>,
    #[serde(default)]
    cpu: String,
    num_cpu: Option<Loose>,
    ram: Option<Loose>,
    gpu: Option<String>,
    num_gpu: Option<Loose>,
    vram: Option<Loose>,
    #[serde(default)]
    comment: String,
}

impl MachineEntry {
    /// The machine described by this entry, or `None` when it is disabled. Disabled entries
    /// are not checked any further.
    fn into_machine(
        self,
        key: &str,
        group: &str,
        path: &Path,
    ) -> Result<Option<Machine>, RegistryError> {
        let name = self.name.unwrap_or_else(|| key.to_string());
        let invalid = |reason: &str| RegistryError::InvalidMachine {
            path: path.to_path_buf(),
            machine: name.clone(),
            reason: reason.to_string(),
        };

        let enabled = match &self.enabled {
            Some(flag) => flag.as_flag().ok_or_else(|| invalid("invalid 'use' flag"))?,
            None => true,
        };
        if !enabled {
            return Ok(None);
        }
        let id = match split_machine_name(&name) {
            Some((prefix, id)) if prefix == group => id,
            _ => return Err(invalid(&format!("name must be '{group}<number>'"))),
        };
        let cores = self
            .num_cpu
            .as_ref()
            .and_then(Loose::as_count)
            .ok_or_else(|| invalid("invalid 'num_cpu'"))?;
        let ram_bytes = self
            .ram
            .as_ref()
            .and_then(Loose::as_size)
            .ok_or_else(|| invalid("invalid 'ram'"))?;

        let gpu = match self.gpu.filter(|g| !g.trim().is_empty()) {
            Some(model) => {
                let count = self
                    .num_gpu
                    .as_ref()
                    .and_then(Loose::as_count)
                    .filter(|&n| n > 0)
                    .ok_or_else(|| invalid("GPU machine needs a positive 'num_gpu'"))?;
                let vram_bytes = match &self.vram {
                    Some(vram) => vram.as_size().ok_or_else(|| invalid("invalid 'vram'"))?,
                    None => 0,
                };
                Some(GpuSpec {
                    model,
                    count,
                    vram_bytes,
                })
            }
            None => None,
        };

        Ok(Some(Machine {
            name,
            group: group.to_string(),
            id,
            cpu_model: self.cpu,
            cores,
            ram_bytes,
            gpu,
            enabled,
            comment: self.comment,
        }))
    }
}

/// Every enabled machine, grouped, plus the registered users. Immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    groups: Vec<Group>,
    users: Vec<String>,
}

impl Registry {
    pub fn new(groups: Vec<Group>, users: Vec<String>) -> Self {
        Self { groups, users }
    }

    /// Read the group files named by `config` from `dir`, skipping disabled machines.
    pub fn load(dir: &Path, config: &Config) -> Result<Self, RegistryError> {
        let names = if config.groups.is_empty() {
            discover_groups(dir)?
        } else {
            config.groups.clone()
        };

        let mut seen = HashSet::new();
        let mut groups = Vec::with_capacity(names.len());
        for name in names {
            let group = load_group(dir, &name)?;
            for machine in group.machines() {
                if !seen.insert(machine.name.clone()) {
                    return Err(RegistryError::DuplicateMachine(machine.name.clone()));
                }
            }
            groups.push(group);
        }

        tracing::debug!(
            "Loaded {} groups from {}",
            groups.len(),
            dir.display()
        );
        Ok(Self::new(groups, config.users.clone()))
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn machine(&self, name: &str) -> Option<&Machine> {
        self.groups.iter().find_map(|g| g.machine(name))
    }

    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.groups.iter().flat_map(|g| g.machines())
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn is_registered(&self, user: &str) -> bool {
        self.users.is_empty() || self.users.iter().any(|u| u == user)
    }
}

fn discover_groups(dir: &Path) -> Result<Vec<String>, RegistryError> {
    let entries = std::fs::read_dir(dir).map_err(|source| RegistryError::Read {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    Ok(names)
}

fn load_group(dir: &Path, name: &str) -> Result<Group, RegistryError> {
    let path = dir.join(format!("{name}.json"));
    let content = std::fs::read_to_string(&path).map_err(|source| RegistryError::Read {
        path: path.clone(),
        source,
    })?;
    let entries: BTreeMap<String, MachineEntry> =
        serde_json::from_str(&content).map_err(|source| RegistryError::Malformed {
            path: path.clone(),
            source,
        })?;

    let mut machines = Vec::with_capacity(entries.len());
    for (key, entry) in entries {
        if let Some(machine) = entry.into_machine(&key, name, &path)? {
            machines.push(machine);
        }
    }
    Ok(Group::new(name, machines))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TENET: &str = r#"{
        "tenet1": {"use": "True", "name": "tenet1", "cpu": "i9-9900K", "num_cpu": "16", "ram": "64G", "comment": ""},
        "tenet2": {"use": "False", "name": "tenet2", "cpu": "i9-9900K", "num_cpu": "16", "ram": "64G", "comment": "broken fan"},
        "tenet10": {"enabled": true, "cpu": "Xeon", "num_cpu": 40, "ram": "256GB", "comment": ""}
    }"#;

    const KUDA: &str = r#"{
        "kuda1": {"use": "1", "name": "kuda1", "cpu": "EPYC", "num_cpu": "32", "ram": "512G",
                  "gpu": "RTX 3090", "num_gpu": "4", "vram": "24G", "comment": ""}
    }"#;

    fn registry_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(format!("{name}.json")), content).unwrap();
        }
        dir
    }

    fn config_for(groups: &[&str]) -> Config {
        Config {
            groups: groups.iter().map(|g| g.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_registry() {
        let dir = registry_dir(&[("tenet", TENET), ("kuda", KUDA)]);
        let registry = Registry::load(dir.path(), &config_for(&["tenet", "kuda"])).unwrap();

        let names: Vec<_> = registry.groups().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["tenet", "kuda"]);

        let tenet = registry.group("tenet").unwrap();
        let machines: Vec<_> = tenet.machines().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(machines, vec!["tenet1", "tenet10"]);
        assert_eq!(tenet.machines()[1].cores, 40);
        assert_eq!(tenet.machines()[1].ram_bytes, 256_000_000_000);

        let kuda1 = registry.machine("kuda1").unwrap();
        let gpu = kuda1.gpu.as_ref().unwrap();
        assert_eq!(gpu.count, 4);
        assert_eq!(gpu.vram_bytes, 24_000_000_000);
        assert_eq!(kuda1.units(), 4);
    }

    #[test]
    fn test_discover_groups_when_unconfigured() {
        let dir = registry_dir(&[("tenet", TENET), ("kuda", KUDA)]);
        let registry = Registry::load(dir.path(), &config_for(&[])).unwrap();
        let names: Vec<_> = registry.groups().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["kuda", "tenet"]);
    }

    #[test]
    fn test_missing_and_malformed_registry_are_fatal() {
        let dir = registry_dir(&[("broken", "{ not json")]);
        assert!(matches!(
            Registry::load(dir.path(), &config_for(&["absent"])),
            Err(RegistryError::Read { .. })
        ));
        assert!(matches!(
            Registry::load(dir.path(), &config_for(&["broken"])),
            Err(RegistryError::Malformed { .. })
        ));
    }

    #[test]
    fn test_invalid_machine_entries() {
        let wrong_prefix = r#"{"kuda1": {"cpu": "x", "num_cpu": 4, "ram": "1G"}}"#;
        let bad_cores = r#"{"tenet1": {"cpu": "x", "num_cpu": "many", "ram": "1G"}}"#;
        let dir = registry_dir(&[("tenet", wrong_prefix), ("other", bad_cores)]);
        assert!(matches!(
            Registry::load(dir.path(), &config_for(&["tenet"])),
            Err(RegistryError::InvalidMachine { .. })
        ));
        assert!(Registry::load(dir.path(), &config_for(&["other"])).is_err());
    }

    #[test]
    fn test_disabled_entries_are_not_checked() {
        let retired = r#"{
            "tenet1": {"use": "True", "cpu": "x", "num_cpu": 4, "ram": "1G"},
            "tenet2": {"use": "False", "cpu": "", "num_cpu": "", "ram": ""},
            "tenet3": {"use": "False"}
        }"#;
        let dir = registry_dir(&[("tenet", retired)]);
        let registry = Registry::load(dir.path(), &config_for(&["tenet"])).unwrap();
        let names: Vec<_> = registry.machines().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["tenet1"]);
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spg.toml");
        std::fs::write(
            &path,
            "users = [\"alice\", \"bob\"]\ngroups = [\"tenet\"]\nscan_concurrency = 8\n\n[ssh]\ncommand_timeout_secs = 12\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.users, vec!["alice", "bob"]);
        assert_eq!(config.scan_concurrency, 8);
        assert_eq!(config.ssh.connect_timeout_secs, 4);
        assert_eq!(config.command_timeout(), Duration::from_secs(12));
        assert_eq!(config.max_runs, MAX_DISPATCH);
    }

    #[test]
    fn test_registered_users() {
        let open = Registry::new(Vec::new(), Vec::new());
        assert!(open.is_registered("anyone"));
        let closed = Registry::new(Vec::new(), vec!["alice".to_string()]);
        assert!(closed.is_registered("alice"));
        assert!(!closed.is_registered("mallory"));
    }
}
