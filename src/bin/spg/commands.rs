use crate::cli::{Commands, JobArgs, TargetArgs, UserArgs};
use crate::output;
use anyhow::{Context as _, Result};
use spg::config::Config;
use spg::core::error::ValidationError;
use spg::core::filter::FilterCriteria;
use spg::core::request::{Request, Session, Target};
use spg::remote::RemoteExecutor;
use spg::utils::{parse_pids, parse_time_window};

pub mod completions;
pub mod free;
pub mod job;
pub mod kill;
pub mod list;
pub mod run;
pub mod runs;
pub mod user;

/// What every handler gets: the session plus the options of the top-level command.
pub struct Context<E> {
    pub session: Session<E>,
    pub config: Config,
    pub silent: bool,
}

pub async fn handle_commands<E: RemoteExecutor>(ctx: &Context<E>, command: Commands) -> Result<()> {
    let invoker = ctx.session.invoker().name.clone();
    match redirect_deprecated(command) {
        Commands::List(target) => list::handle_list(ctx, &to_target(&target)),
        Commands::Free(target) => {
            let request = Request::Free {
                target: to_target(&target),
            };
            free::handle_free(ctx, &request).await
        }
        Commands::Job(args) => {
            let request = Request::Job {
                target: to_target(&args.target),
                filter: to_filter(&args, &invoker)?,
            };
            job::handle_job(ctx, &request).await
        }
        Commands::User(target) => {
            let request = Request::User {
                target: to_target(&target),
            };
            user::handle_user(ctx, &request).await
        }
        Commands::Run { machine, command } => {
            let request = Request::Run {
                machine,
                command: command.join(" "),
                cwd: current_dir()?,
            };
            run::handle_run(ctx, &request).await
        }
        Commands::Runs {
            file,
            group,
            start,
            end,
            max,
        } => {
            let request = Request::Runs {
                file,
                group,
                range: start.zip(end),
                limit: max.unwrap_or(ctx.config.max_runs),
                cwd: current_dir()?,
            };
            runs::handle_runs(ctx, &request).await
        }
        Commands::Kill { filter, yes } => {
            let request = Request::Kill {
                target: to_target(&filter.target),
                filter: to_filter(&filter, &invoker)?,
            };
            kill::handle_kill(ctx, &request, yes).await
        }
        Commands::Completions { shell } => completions::handle_completions(shell),
        deprecated => anyhow::bail!("Unhandled command {deprecated:?}"),
    }
}

fn current_dir() -> Result<std::path::PathBuf> {
    std::env::current_dir().context("Failed to read the current directory")
}

/// Rewrite the old command names onto the current ones, warning about each.
pub fn redirect_deprecated(command: Commands) -> Commands {
    let (command, replacement) = match command {
        Commands::Machine(target) => (Commands::List(target), "spg list"),
        Commands::Me(target) => (
            Commands::Job(JobArgs {
                target,
                ..Default::default()
            }),
            "spg job",
        ),
        Commands::All(target) => (
            Commands::Job(JobArgs {
                target,
                all: true,
                ..Default::default()
            }),
            "spg job -a",
        ),
        Commands::KillPids { machine, pid } => (
            kill_with(JobArgs {
                target: TargetArgs {
                    machine: vec![machine],
                    ..Default::default()
                },
                pid,
                ..Default::default()
            }),
            "spg KILL -m [machine name] -p [pid list]",
        ),
        Commands::Killall { target, user } => (
            kill_with(JobArgs {
                target,
                user,
                ..Default::default()
            }),
            "spg KILL",
        ),
        Commands::Killmachine { machine, user } => (
            kill_with(JobArgs {
                target: TargetArgs {
                    machine: vec![machine],
                    ..Default::default()
                },
                user,
                ..Default::default()
            }),
            "spg KILL -m [machine list]",
        ),
        Commands::Killthis {
            pattern,
            target,
            user,
        } => (
            kill_with(JobArgs {
                target,
                user,
                command: pattern,
                ..Default::default()
            }),
            "spg KILL -c [command]",
        ),
        Commands::Killbefore { time, target, user } => (
            kill_with(JobArgs {
                target,
                user,
                time,
                ..Default::default()
            }),
            "spg KILL -t [time]",
        ),
        current => return current,
    };
    output::warn(format_args!(
        "This method will be deprecated. Use '{replacement}' instead"
    ));
    command
}

fn kill_with(filter: JobArgs) -> Commands {
    Commands::Kill { filter, yes: false }
}

pub fn to_target(args: &TargetArgs) -> Target {
    let target = Target {
        groups: args.group.clone(),
        machines: args.machine.clone(),
    };
    if target.group_suppressed() {
        output::warn("Group option is suppressed by Machine option");
    }
    target
}

/// Build the job filter. Without `-u` or `-a` only the invoker's jobs match.
pub fn to_filter(args: &JobArgs, invoker: &str) -> Result<FilterCriteria> {
    let UserArgs { user } = &args.user;
    let mut pids = std::collections::BTreeSet::new();
    for pid in &args.pid {
        pids.extend(parse_pids(pid)?);
    }

    let max_elapsed = if args.time.is_empty() {
        None
    } else {
        let window = parse_time_window(&args.time).map_err(|e| {
            tracing::debug!("{e:#}");
            ValidationError::InvalidTimeWindow(args.time.join(" "))
        })?;
        Some(window)
    };

    Ok(FilterCriteria {
        user: (!args.all).then(|| user.clone().unwrap_or_else(|| invoker.to_string())),
        all_users: args.all,
        pids,
        commands: args.command.clone(),
        max_elapsed,
        start: args.start.clone(),
    })
}
