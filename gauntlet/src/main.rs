//! Command-line entry point for the gauntlet.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use gauntlet::core::types::Mode;
use gauntlet::exit_codes;
use gauntlet::io::report::{ReportFormat, render, write_report};
use gauntlet::logging;
use gauntlet::run::{RunOptions, RunRequest, run_gauntlet};

#[derive(Parser)]
#[command(
    name = "gauntlet",
    version,
    about = "Validate a candidate code artifact inside a target project"
)]
struct Cli {
    /// Project the artifact is validated in.
    target_dir: PathBuf,

    /// Candidate file to validate.
    #[arg(long)]
    source: PathBuf,

    /// Destination inside the target, relative to it.
    #[arg(long)]
    dest: PathBuf,

    #[arg(long, value_enum, default_value_t = Mode::Commit)]
    mode: Mode,

    /// Report format written to stdout.
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    format: ReportFormat,

    /// Explicit config file; otherwise `.gauntlet.toml` in the target, then the cwd.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also write the rendered report here.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Override `network.base_url`.
    #[arg(long, env = "OLLAMA_HOST")]
    ollama_base_url: Option<String>,

    /// Override `network.model`.
    #[arg(long, env = "OLLAMA_MODEL")]
    ollama_model: Option<String>,

    /// Console log filter, overridden by `RUST_LOG`.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Mirror DEBUG logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ABORTED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let _guard = logging::init(&cli.log_level, cli.log_file.as_deref())?;

    let request = RunRequest {
        target_dir: cli.target_dir,
        source: cli.source,
        dest: cli.dest,
        mode: cli.mode,
        config_path: cli.config,
        base_url: cli.ollama_base_url,
        model: cli.ollama_model,
    };
    let outcome = run_gauntlet(&request, &RunOptions::default());

    let rendered = render(&outcome.report, cli.format);
    println!("{rendered}");
    if let Some(path) = &cli.output {
        write_report(path, &rendered)?;
    }
    Ok(outcome.exit_code())
}
