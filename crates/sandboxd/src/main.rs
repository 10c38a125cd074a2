use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use sandboxd::cmd;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "sandboxd", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default sandboxd.yaml into a base directory
    Init(cmd::InitArgs),
    /// Serve the sandbox HTTP API and run the expiry reaper
    Serve(cmd::ServeArgs),
    /// List registered languages and whether their runtimes are installed
    Languages(cmd::LanguagesArgs),
    /// Execute a single file and print the result as JSON
    Run(cmd::RunArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Init(args) => cmd::run_init(args).await.map(|()| ExitCode::SUCCESS),
        Command::Serve(args) => cmd::run_serve(args).await.map(|()| ExitCode::SUCCESS),
        Command::Languages(args) => cmd::run_languages(args).await.map(|()| ExitCode::SUCCESS),
        Command::Run(args) => cmd::run_file(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
