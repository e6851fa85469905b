use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};
use tracing_tree::time::Uptime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Level {
    /// Suppress all output.
    Quiet,
    /// Show warnings.
    Default,
    /// Show a more verbose report of progress and failure.
    Verbose,
    /// Show all tracing output.
    ExtraVerbose,
}

pub(crate) fn setup_logging(level: Level) -> Result<()> {
    let directive = match level {
        Level::Quiet => "off",
        Level::Default => "delocate=warn",
        Level::Verbose => "delocate=info",
        Level::ExtraVerbose => "delocate=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let subscriber = Registry::default().with(
        tracing_tree::HierarchicalLayer::default()
            .with_indent_lines(true)
            .with_indent_amount(2)
            .with_targets(level == Level::ExtraVerbose)
            .with_writer(|| Box::new(std::io::stderr()))
            .with_timer(Uptime::default())
            .with_filter(filter),
    );
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
