use std::str::FromStr;

use tracing::Level;

/// Installs the fmt subscriber. `AENEAS_LOG` picks the level, default info.
pub fn init() {
    let level = std::env::var("AENEAS_LOG")
        .ok()
        .and_then(|v| Level::from_str(v.trim()).ok())
        .unwrap_or(Level::INFO);

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
