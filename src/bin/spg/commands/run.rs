use crate::commands::Context;
use crate::output;
use anyhow::Result;
use spg::core::machine::LaunchOutcome;
use spg::core::request::Request;
use spg::remote::RemoteExecutor;

pub async fn handle_run<E: RemoteExecutor>(ctx: &Context<E>, request: &Request) -> Result<()> {
    let mut report = ctx.session.run(request).await?;
    output::prepare(std::slice::from_mut(&mut report.scan));

    let machine = &report.scan.machine;
    if report.scan.is_reachable() && report.scan.free_units() == 0 {
        output::warn(format_args!(
            "{} had no free {} before this job",
            machine.name,
            machine.kind()
        ));
    }

    match &report.outcome {
        LaunchOutcome::Issued => {
            if let Request::Run { command, .. } = request {
                println!("Running '{}' at {}", command.trim(), machine.name);
            }
            Ok(())
        }
        LaunchOutcome::RemoteFailure { reason } => {
            output::warn(format_args!("{} reported: {reason}", machine.name));
            Ok(())
        }
        LaunchOutcome::NotIssued { reason } => {
            anyhow::bail!("Failed to run at {}: {reason}", machine.name)
        }
    }
}
