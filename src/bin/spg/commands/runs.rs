use crate::commands::Context;
use crate::output;
use anyhow::Result;
use spg::core::machine::LaunchOutcome;
use spg::core::request::Request;
use spg::remote::RemoteExecutor;
use tabled::{builder::Builder, settings::Style};

pub async fn handle_runs<E: RemoteExecutor>(ctx: &Context<E>, request: &Request) -> Result<()> {
    let Request::Runs { file, group, .. } = request else {
        anyhow::bail!("not a runs request");
    };

    let mut progress = output::progress(ctx.silent);
    let mut report = ctx.session.runs(request, progress.as_mut()).await?;
    output::prepare(&mut report.scans);

    if report.launched.is_empty() {
        println!(
            "No free machine in {group}: {} command(s) left in {}",
            report.pending,
            file.display()
        );
        return Ok(());
    }

    let mut builder = Builder::default();
    builder.push_record(["Machine", "Command", "Status"]);
    for dispatched in &report.launched {
        let status = match &dispatched.outcome {
            LaunchOutcome::Issued => "issued".to_string(),
            LaunchOutcome::RemoteFailure { reason } => format!("issued, remote error: {reason}"),
            LaunchOutcome::NotIssued { reason } => format!("not issued: {reason}"),
        };
        builder.push_record([
            dispatched.assignment.machine.name.clone(),
            dispatched.assignment.command.clone(),
            status,
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));

    println!(
        "Dispatched {} of {} command(s) onto {} free unit(s); {} line(s) removed from {}",
        report.issued(),
        report.pending,
        report.free_units,
        report.removed.len(),
        file.display()
    );
    if let Some(reason) = &report.rewrite_error {
        anyhow::bail!(
            "Failed to remove the dispatched lines from {}: {reason}. \
             Remove them by hand before the next 'spg runs'",
            file.display()
        );
    }
    Ok(())
}
