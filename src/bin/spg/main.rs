mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use spg::audit::JsonLinesLog;
use spg::config::Registry;
use spg::core::request::{Invoker, Session};
use spg::core::scan::ScanCoordinator;
use spg::remote::SshExecutor;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, Layer};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Spg::parse();

    // Console (stderr) + daily rolling file appender
    let log_dir = spg::core::get_log_dir()?;
    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("spg")
        .filename_suffix("log")
        .max_log_files(7)
        .build(&log_dir)?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from(args.verbosity).into()));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_filter(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    if let cli::Commands::Completions { shell } = args.command {
        return commands::completions::handle_completions(shell);
    }

    let config = spg::config::load_config(args.config.as_ref())?;
    let registry = Registry::load(&config.registry_dir()?, &config)?;

    let executor = Arc::new(SshExecutor::new(config.ssh.connect_timeout_secs));
    let coordinator = ScanCoordinator::new(
        executor,
        config.scan_concurrency,
        config.command_timeout(),
    );
    let audit_log = Box::new(JsonLinesLog::new(config.audit_log_path()?));
    let session = Session::new(registry, coordinator, Invoker::current(), audit_log);

    let ctx = commands::Context {
        session,
        config,
        silent: args.silent,
    };
    commands::handle_commands(&ctx, args.command).await
}
