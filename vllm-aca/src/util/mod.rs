pub mod cmd;
pub mod config;
pub mod process;

use tracing::{debug, Level};
use tracing_subscriber::EnvFilter;

pub fn init_logging() {
    // DEBUG for debug builds, INFO for release builds; RUST_LOG wins when set

    #[cfg(not(debug_assertions))]
    let default_level = Level::INFO;
    #[cfg(debug_assertions)]
    let default_level = Level::DEBUG;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!cfg!(windows))
        .with_target(false)
        .with_writer(std::io::stderr)
        // Debug builds: show file and line number
        .with_file(cfg!(debug_assertions))
        .with_line_number(cfg!(debug_assertions))
        .compact()
        .init();

    debug!("Logging initialized");
}
