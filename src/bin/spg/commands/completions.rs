use crate::cli::Spg;
use anyhow::Result;
use clap::CommandFactory;
use clap_complete::Shell;
use std::io::Write;

pub fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Spg::command();
    let mut buf = Vec::<u8>::new();
    clap_complete::generate(shell, &mut cmd, "spg", &mut buf);

    match std::io::stdout().write_all(&buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(e.into()),
    }
}
