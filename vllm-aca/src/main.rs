use clap::Parser;
use std::process::ExitCode;
use tracing::debug;

use vllm_aca::app;
use vllm_aca::util::{cmd::Args, init_logging};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Usage errors exit here, before any side effect.
    let args = Args::parse();
    init_logging();

    match app::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Printed regardless of the log filter.
            eprintln!("Error: {:#}", e);
            debug!("{:?}", e);
            ExitCode::from(app::exit_code(&e))
        }
    }
}
