use tracing_subscriber::{fmt, EnvFilter};

/// Initializes tracing from `RUST_LOG`, falling back to `default_level`.
/// Logs go to stderr so the chat front end keeps stdout to itself.
pub fn init_tracing(default_level: &str, json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
