use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use mediarelay::core::{Core, CoreOpts};

/// Multi-protocol live media relay.
#[derive(Parser)]
#[command(name = "mediarelay", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(default_value = "mediarelay.yml")]
    confpath: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match Core::start(cli.confpath, CoreOpts::default()).await {
        Ok(core) => {
            core.wait().await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ERR: {e}");
            ExitCode::FAILURE
        }
    }
}
