//! Helpers related to tracing, used by main entrypoints

/// Initialize tracing. The default threshold only surfaces warnings;
/// each verbosity step raises it (info, debug, trace), and an explicit
/// `RUST_LOG` filter still takes precedence for fine-grained control.
pub fn initialize_tracing(verbosity: u8) {
    let max_level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    // No timestamps: the agent's output is read through journald or a
    // device console, both of which stamp lines already.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    // Log to stderr so command output on stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_max_level(max_level)
        .init();
}
