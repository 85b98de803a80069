use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod console;
mod output;

use commands::admin::run_config;
use commands::edit::{run_apply, run_parse};
use commands::session::{run_session_cmd, run_summarize};

#[derive(Parser)]
#[command(name = "blocksmith")]
#[command(about = "Apply model-proposed SEARCH/REPLACE edits to a workspace", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// Workspace root. Defaults to the current directory.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Enable verbose logging to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send an instruction to the model and apply the edits it proposes.
    Run(RunArgs),
    /// Apply the edit blocks of a saved model response.
    Apply(ApplyArgs),
    /// Show the edit blocks and problems found in a response.
    Parse(ParseArgs),
    /// Ask the model for a one-line summary of some changes.
    Summarize(SummarizeArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCmd,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(required = true)]
    instruction: Vec<String>,

    /// Make a file editable (repeatable).
    #[arg(long = "edit")]
    edit: Vec<String>,

    /// Show a file to the model as read-only context (repeatable).
    #[arg(long = "read")]
    read: Vec<String>,

    /// Make files editable without asking.
    #[arg(long)]
    yes: bool,

    #[arg(long)]
    model: Option<String>,

    #[arg(long = "max-reflections")]
    max_reflections: Option<u32>,
}

#[derive(Args)]
struct ApplyArgs {
    /// Response file, or `-` for stdin.
    input: String,

    #[arg(long = "edit")]
    edit: Vec<String>,

    #[arg(long)]
    yes: bool,
}

#[derive(Args)]
struct ParseArgs {
    /// Response file, or `-` for stdin.
    input: String,
}

#[derive(Args)]
struct SummarizeArgs {
    /// File holding the changes, or `-` for stdin.
    input: String,

    #[arg(long)]
    model: Option<String>,
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the effective configuration.
    Show,
    /// Write default settings when none exist.
    Init,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let cwd = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let success = match cli.command {
        Commands::Run(args) => run_session_cmd(&cwd, args, cli.json, cli.verbose)?,
        Commands::Apply(args) => run_apply(&cwd, args, cli.json)?,
        Commands::Parse(args) => run_parse(args, cli.json)?,
        Commands::Summarize(args) => run_summarize(&cwd, args, cli.json)?,
        Commands::Config { command } => run_config(&cwd, command, cli.json)?,
    };
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
