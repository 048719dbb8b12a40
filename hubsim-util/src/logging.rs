use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Initialize the tracing subscriber for human-readable logs on stderr.
///
/// Defaults can be overriden using `RUST_LOG`.
pub fn initialize_tracing() {
    let default_filter = EnvFilter::default()
        .add_directive(tracing::Level::INFO.into())
        .add_directive("hyper=error".parse().expect("static directive"))
        .add_directive("reqwest=warn".parse().expect("static directive"));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or(default_filter))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}
