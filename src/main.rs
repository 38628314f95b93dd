mod cli;
mod client;
mod config;
mod error;
mod intake;
mod logging;
mod model;
mod orchestrator;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    let is_non_tui = !args.is_interactive();

    if is_non_tui || cfg!(not(feature = "tui")) {
        logging::init_stderr(is_silent);
    } else if let Err(e) = logging::init_file() {
        // The TUI still works without a log file.
        eprintln!("Logging disabled: {e:#}");
    }

    match cli::run(args).await {
        Ok(()) => {
            // Explicitly exit with code 0 on success, especially for non-TUI modes
            if is_non_tui {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            if is_silent {
                println!("{}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
