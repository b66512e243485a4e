use crate::commands::Context;
use crate::output;
use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Confirm};
use spg::core::filter::FilterCriteria;
use spg::core::machine::KillOutcome;
use spg::core::request::{Request, Target};
use spg::remote::RemoteExecutor;
use spg::utils::format_time_window;
use std::io::IsTerminal;
use tabled::{builder::Builder, settings::Style};

pub async fn handle_kill<E: RemoteExecutor>(
    ctx: &Context<E>,
    request: &Request,
    yes: bool,
) -> Result<()> {
    let Request::Kill { target, filter } = request else {
        anyhow::bail!("not a KILL request");
    };

    let mut progress = output::progress(ctx.silent);
    let (mut reports, mut jobs) = ctx.session.find_jobs(request, progress.as_mut()).await?;
    output::prepare(&mut reports);
    output::sort_jobs(&mut jobs, &reports);

    if jobs.is_empty() {
        println!("No job to kill");
        return Ok(());
    }
    println!("{}", output::job_table(&jobs));

    if !yes {
        if !std::io::stdin().is_terminal() {
            anyhow::bail!("Refusing to kill without confirmation. Pass --yes to skip the prompt");
        }
        let question = kill_question(target, filter, &ctx.session.invoker().name);
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(question)
            .default(false)
            .interact()
            .map_err(map_dialoguer_err)?;
        if !confirmed {
            println!("Aborted");
            return Ok(());
        }
    }

    let outcomes = ctx.session.kill(&jobs).await;
    let mut builder = Builder::default();
    builder.push_record(["Machine", "PID", "Command", "Result"]);
    let mut killed = 0;
    for (job, outcome) in &outcomes {
        let result = match outcome {
            KillOutcome::Signalled => {
                killed += 1;
                "killed".to_string()
            }
            KillOutcome::NoSuchProcess => "already gone".to_string(),
            KillOutcome::Failed { reason } => format!("failed: {reason}"),
        };
        builder.push_record([
            job.machine.clone(),
            job.pid.to_string(),
            job.command.clone(),
            result,
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));
    println!("Killed {killed} of {} job(s)", jobs.len());
    Ok(())
}

fn map_dialoguer_err(err: dialoguer::Error) -> std::io::Error {
    match err {
        dialoguer::Error::IO(e) => e,
    }
}

/// Confirmation prompt spelling out every condition of the kill.
pub fn kill_question(target: &Target, filter: &FilterCriteria, invoker: &str) -> String {
    let mut question = String::from("Do you want to kill ");

    match (&filter.user, filter.all_users) {
        (None, _) | (_, true) => question.push_str("jobs of all users"),
        (Some(user), false) if user != invoker => {
            question.push_str(&format!("jobs of user {user}"))
        }
        _ => question.push_str("your jobs"),
    }

    if !filter.pids.is_empty() {
        let pids: Vec<String> = filter.pids.iter().map(ToString::to_string).collect();
        question.push_str(&format!(" with pid {}", pids.join(", ")));
    }

    if !target.machines.is_empty() {
        question.push_str(&format!(" at machine {}", target.machines.join(", ")));
    } else if !target.groups.is_empty() {
        question.push_str(&format!(" at group {}", target.groups.join(", ")));
    } else {
        question.push_str(" at all machines");
    }

    if !filter.commands.is_empty() {
        question.push_str(&format!(
            " with command including '{}'",
            filter.commands.join("' and '")
        ));
    }
    if let Some(window) = filter.max_elapsed {
        question.push_str(&format!(
            " with running less than '{}'",
            format_time_window(window)
        ));
    }
    if let Some(start) = &filter.start {
        question.push_str(&format!(" starts at time '{start}'"));
    }

    question.push('?');
    question
}
