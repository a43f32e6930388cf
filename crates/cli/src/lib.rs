pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::queue::QueueCommand;

#[derive(Debug, Parser)]
#[command(
    name = "dealsync",
    about = "Dealsync operator CLI",
    long_about = "Apply migrations, inspect configuration, check readiness, and review the CRM sync retry queue.",
    after_help = "Examples:\n  dealsync doctor --json\n  dealsync queue stats\n  dealsync queue list --status failed_manual_review"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, webhook secrets, CRM mode, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Inspect and maintain the CRM sync retry queue")]
    Queue(QueueCommand),
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Queue(command) => commands::queue::run(command),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
