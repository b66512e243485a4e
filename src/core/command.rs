//! Shell snippets executed on remote machines.
//!
//! Everything that knows the exact command line of `ssh`, `ps`, `free` or `nvidia-smi`
//! lives here; the matching output layout is handled by [`crate::core::parser`].

use shell_escape::escape;
use std::borrow::Cow;
use std::path::Path;
use strum::{Display, EnumIter, EnumString};

/// Version of the section layout shared with the record parser.
pub const SCHEMA_VERSION: u32 = 1;

/// Prefix of the lines separating the sections of a scan script output.
pub const SECTION_PREFIX: &str = "@@spg";

/// Sections of a scan script, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Section {
    Processes,
    Memory,
    Gpus,
    GpuApps,
}

impl Section {
    pub fn marker(self) -> String {
        format!("{SECTION_PREFIX}/{SCHEMA_VERSION}:{self}")
    }
}

/// Arguments passed to `ssh` before the remote command.
pub fn ssh_args(host: &str, connect_timeout_secs: u64) -> Vec<String> {
    vec![
        // No pseudo-terminal, no password prompts
        "-T".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={connect_timeout_secs}"),
        "-o".to_string(),
        "UpdateHostKeys=no".to_string(),
        host.to_string(),
    ]
}

/// Process table of the given users, one line per thread.
///
/// Columns: `ruser stat pid sid pcpu pmem rss etime stime args`. An empty user list selects
/// every process not owned by root.
pub fn ps_listing(users: &[String]) -> String {
    let selection = if users.is_empty() {
        "-N --user root".to_string()
    } else {
        let users = users
            .iter()
            .map(|u| escape(Cow::from(u.as_str())).into_owned())
            .collect::<Vec<_>>()
            .join(",");
        format!("--user {users}")
    };
    format!(
        "ps H --no-headers {selection} \
         --format ruser:15,stat,pid,sid,pcpu,pmem,rss:10,etime:15,stime,args"
    )
}

pub fn free_memory() -> &'static str {
    "free --bytes"
}

pub fn gpu_query() -> &'static str {
    "nvidia-smi --query-gpu=index,pci.bus_id,utilization.gpu,memory.used,memory.total \
     --format=csv,noheader,nounits"
}

pub fn gpu_apps() -> &'static str {
    "nvidia-smi --query-compute-apps=pid,gpu_bus_id,used_memory --format=csv,noheader,nounits"
}

/// Single remote script collecting every table a scan needs in one round trip.
pub fn scan_script(users: &[String], gpu: bool) -> String {
    let mut parts = vec![
        format!("echo '{}'", Section::Processes.marker()),
        ps_listing(users),
        format!("echo '{}'", Section::Memory.marker()),
        free_memory().to_string(),
    ];
    if gpu {
        parts.push(format!("echo '{}'", Section::Gpus.marker()));
        parts.push(gpu_query().to_string());
        parts.push(format!("echo '{}'", Section::GpuApps.marker()));
        parts.push(gpu_apps().to_string());
    }
    parts.join("; ")
}

/// Launch `command` in `cwd`, detached from the SSH session.
pub fn run_detached(cwd: &Path, command: &str) -> String {
    let cwd = escape(cwd.to_string_lossy());
    let command = escape(Cow::from(command));
    format!("cd {cwd} && setsid nohup sh -c {command} > /dev/null 2>&1 < /dev/null &")
}

/// SIGTERM `pid`, every ancestor up to its session leader, and the leader itself.
pub fn kill_session_chain(pid: u32, sid: u32) -> String {
    if sid <= 1 || sid == pid {
        return format!("kill -15 {pid} 2> /dev/null");
    }
    format!(
        "p={pid}; \
         while [ -n \"$p\" ] && [ \"$p\" -gt 1 ] && [ \"$p\" -ne {sid} ]; do \
         n=$(ps -o ppid= -p \"$p\" | tr -d ' '); kill -15 \"$p\" 2> /dev/null; p=$n; \
         done; kill -15 {sid} 2> /dev/null"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_section_markers() {
        assert_eq!(Section::Processes.marker(), "@@spg/1:processes");
        assert_eq!(Section::GpuApps.marker(), "@@spg/1:gpu_apps");
        assert_eq!(Section::from_str("gpu_apps").unwrap(), Section::GpuApps);
    }

    #[test]
    fn test_ps_listing_users() {
        let users = vec!["alice".to_string(), "bob".to_string()];
        let cmd = ps_listing(&users);
        assert!(cmd.starts_with("ps H --no-headers --user alice,bob "));
        assert!(cmd.ends_with("etime:15,stime,args"));
        assert!(ps_listing(&[]).contains("-N --user root"));
    }

    #[test]
    fn test_scan_script_sections() {
        let cpu = scan_script(&[], false);
        assert!(cpu.contains("@@spg/1:memory"));
        assert!(!cpu.contains("nvidia-smi"));

        let gpu = scan_script(&[], true);
        assert!(gpu.contains("@@spg/1:gpus"));
        assert!(gpu.contains("--query-compute-apps"));
    }

    #[test]
    fn test_run_detached_keeps_cwd_and_backgrounds() {
        let cmd = run_detached(Path::new("/home/alice/sim run"), "python sim.py -N 10 > out.txt");
        assert_eq!(
            cmd,
            "cd '/home/alice/sim run' && setsid nohup sh -c 'python sim.py -N 10 > out.txt' \
             > /dev/null 2>&1 < /dev/null &"
        );
    }

    #[test]
    fn test_kill_session_chain() {
        assert_eq!(kill_session_chain(42, 42), "kill -15 42 2> /dev/null");
        assert_eq!(kill_session_chain(42, 0), "kill -15 42 2> /dev/null");
        let chain = kill_session_chain(4242, 4000);
        assert!(chain.starts_with("p=4242;"));
        assert!(chain.contains("-ne 4000"));
        assert!(chain.ends_with("kill -15 4000 2> /dev/null"));
    }

    #[test]
    fn test_ssh_args() {
        let args = ssh_args("tenet1", 4);
        assert_eq!(args.last().unwrap(), "tenet1");
        assert!(args.contains(&"ConnectTimeout=4".to_string()));
    }
}
