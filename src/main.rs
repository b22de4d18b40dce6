use std::ffi::OsString;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::error;
use usb2host::{Config, Summary};

/// Exit status on any failure, `-1` as seen by the shell.
const EXIT_FAILURE: u8 = 255;

/// Put USB dual-role ports into host mode
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Nodes under /sys/kernel/debug/usb to switch; all nodes when omitted
    #[arg(value_name = "NODE")]
    nodes: Vec<OsString>,
}

fn try_main(args: &Args) -> anyhow::Result<Summary> {
    let config = Config::default();
    usb2host::run(&config, &args.nodes).context("cannot put usb nodes into host mode")
}

/// Map the outcome of a run onto the process exit status.
fn exit_code(outcome: anyhow::Result<Summary>) -> ExitCode {
    match outcome {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(summary) => {
            error!(
                "{} node(s) failed, {} written, {} skipped",
                summary.failed, summary.written, summary.skipped
            );
            ExitCode::from(EXIT_FAILURE)
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    exit_code(try_main(&args))
}
