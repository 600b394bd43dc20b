mod app;

use std::{io, panic, process};

use anyhow::Result;
use app::Cli;
use backtrace::Backtrace;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    set_panic_handlers()?;
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if !app::run(cli).await? {
        process::exit(1);
    }
    Ok(())
}

/// `RUST_LOG` wins; otherwise `-v` raises the level step by step.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

// handle all panic here
fn set_panic_handlers() -> Result<()> {
    panic::set_hook(Box::new(|e| {
        let backtrace = Backtrace::new();
        eprintln!(
            "\nssh-courier was closed due to an unexpected panic with the following info:\n\n{:?}\ntrace:\n{:?}",
            e, backtrace
        );
    }));
    Ok(())
}
