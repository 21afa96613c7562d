//! Tracing subscriber setup from the `logging` config section.

use cascade_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Filter directives from the config; `--verbose` forces debug.
fn directives(config: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        config.level.as_deref().unwrap_or("info")
    };
    std::iter::once(level.to_string())
        .chain(config.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. `RUST_LOG` overrides the config.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(directives(config, verbose)).unwrap_or_else(|_| EnvFilter::new("info"))
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let to_stdout = config.output == "stdout";

    match (config.format.as_str(), to_stdout) {
        ("json", true) => builder.json().with_writer(std::io::stdout).init(),
        ("json", false) => builder.json().with_writer(std::io::stderr).init(),
        (_, true) => builder.with_writer(std::io::stdout).init(),
        (_, false) => builder.with_writer(std::io::stderr).init(),
    }
}
