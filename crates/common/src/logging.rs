use tracing_core::Level;
use tracing_subscriber::{filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Install the global tracing subscriber.
///
/// Transport crates are capped at `WARN`, since their debug output drowns
/// the build progress rendered to the same terminal.
pub fn init(config: &Config) {
    let fmt = fmt::format().with_target(false).compact();

    let target_filters = Targets::new()
        .with_target("tungstenite", Level::WARN)
        .with_target("tokio_tungstenite", Level::WARN)
        .with_target("notify", Level::WARN)
        .with_target("globset", Level::WARN)
        .with_default(config.logging.level);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).event_format(fmt))
        .with(target_filters)
        .init();
}
