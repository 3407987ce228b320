use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install the global subscriber. `RUST_LOG` overrides `level`.
pub fn init(level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr);
        Registry::default().with(env_filter).with(json_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr);
        Registry::default().with(env_filter).with(fmt_layer).try_init()?;
    }

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "hilrun starting");
    Ok(())
}
