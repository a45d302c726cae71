use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands;

#[derive(Debug, Parser)]
#[command(name = "watchd")]
#[command(about = "Filesystem watch daemon with cookie-synchronized clocks")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground.
    Serve,
    /// Ask a running daemon to shut down.
    Stop,
    Status,
    Watch(RootArgs),
    WatchDel(RootArgs),
    WatchList,
    Clock(ClockArgs),
    Query(QueryArgs),
    DebugPauseWatchers,
    DebugUnpauseWatchers,
    DebugRecrawl(RootArgs),
    DebugAbortCookies(RootArgs),
}

#[derive(Debug, Args)]
pub struct RootArgs {
    pub path: PathBuf,
}

#[derive(Debug, Args)]
pub struct ClockArgs {
    pub path: PathBuf,
    /// Milliseconds to wait for the watcher to catch up; 0 skips the sync.
    #[arg(long, default_value_t = 0)]
    pub sync_timeout: u64,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    pub path: PathBuf,
    /// Query spec as a JSON object, e.g. '{"glob": ["*.c"], "fields": ["name"]}'.
    #[arg(default_value = "{}")]
    pub spec: String,
}

fn print_report(report: &commands::CommandReport, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("command: {}", report.command);
    println!("ok: {}", report.ok);
    if !report.details.is_empty() {
        println!("details:");
        for detail in &report.details {
            println!("- {detail}");
        }
    }
    if !report.issues.is_empty() {
        println!("issues:");
        for issue in &report.issues {
            println!("- {issue}");
        }
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let report = match &cli.command {
        Command::Serve => commands::serve::run()?,
        Command::Stop => commands::stop::run()?,
        Command::Status => commands::status::run()?,
        Command::Watch(args) => commands::watch::run(&args.path)?,
        Command::WatchDel(args) => commands::watch::run_del(&args.path)?,
        Command::WatchList => commands::watch::run_list()?,
        Command::Clock(args) => commands::clock::run(&args.path, args.sync_timeout)?,
        Command::Query(args) => commands::query::run(&args.path, &args.spec)?,
        Command::DebugPauseWatchers => commands::debug::pause_watchers()?,
        Command::DebugUnpauseWatchers => commands::debug::unpause_watchers()?,
        Command::DebugRecrawl(args) => commands::debug::recrawl(&args.path)?,
        Command::DebugAbortCookies(args) => commands::debug::abort_cookies(&args.path)?,
    };

    print_report(&report, cli.json)?;

    if report.ok {
        Ok(())
    } else {
        std::process::exit(2);
    }
}
