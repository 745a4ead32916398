use crate::types::{Result, ZatError};
use tracing_subscriber::{fmt, EnvFilter};

/// Install a process-global tracing subscriber filtered by `level`
/// (an `EnvFilter` directive such as `"info"` or `"zatdb=trace"`).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level).map_err(|_| ZatError::Invalid("invalid log filter"))?,
        )
        .with_target(true)
        .try_init()
        .map_err(|_| ZatError::Invalid("logging already initialized"))
}
