use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

/// Environment variable holding the log filter directives.
pub const LOG_ENV_VAR: &str = "NUDGEQ_LOG";

fn env_filter() -> eyre::Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?)
}

/// Installs the global tracing subscriber. Logs go to stderr so stdout stays
/// free for command output.
pub fn init() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter()?)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter()?)
        .finish()
        .try_init()?;

    Ok(())
}
