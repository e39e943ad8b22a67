use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_ENV_VAR: &str = "SCANSYNC_LOG";
const DEFAULT_FILTER: &str = "scansync=warn";
const VERBOSE_FILTER: &str = "scansync=debug";

/// Install the global subscriber. Diagnostics always go to stderr so that
/// `--json` output on stdout stays machine readable.
pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::try_from_env(LOG_ENV_VAR)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };

    // A second init (e.g. from tests) is harmless; keep the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}
