use anyhow::Result;
use time::{format_description, UtcOffset};
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub fn init_logging(debug: u8) -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        match debug {
            0 => std::env::set_var("RUST_LOG", "thea_remote=info,thea_remote_core=info"),
            1 => std::env::set_var("RUST_LOG", "thea_remote=debug,thea_remote_core=debug"),
            _ => std::env::set_var("RUST_LOG", "debug"),
        }
    }

    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    #[allow(clippy::unwrap_used)]
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_timer(OffsetTime::new(
            offset,
            format_description::parse("[hour]:[minute]:[second]").unwrap(),
        ));

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt_layer)
        .init();
    Ok(())
}
