//! Log subscriber installation.
//!
//! `-quiet` lowers the default level to `warn`. `-trace` selectors raise the
//! matching module targets to `trace`. `RUST_LOG` replaces both when set.

use tracing_subscriber::EnvFilter;

/// Modules raised to `trace` by each `-trace` selector.
const SELECTORS: &[(&str, &[&str])] = &[
    ("all", &["stowage"]),
    ("trace", &["stowage"]),
    ("repository", &["stowage::repository"]),
    ("snapshot", &["stowage::commands", "stowage::task"]),
    ("server", &["stowage::services", "stowage::updates"]),
    ("reporting", &["stowage::reporting"]),
];

/// Builds the filter directives for the given options.
///
/// Unknown selectors are ignored.
#[must_use]
pub fn filter_directives(quiet: bool, trace: Option<&str>) -> String {
    let mut directives = vec![if quiet { "warn" } else { "info" }.to_string()];
    for selector in trace.unwrap_or_default().split(',').map(str::trim) {
        let Some((_, targets)) = SELECTORS.iter().find(|(name, _)| *name == selector) else {
            continue;
        };
        for target in *targets {
            let directive = format!("{target}=trace");
            if !directives.contains(&directive) {
                directives.push(directive);
            }
        }
    }
    directives.join(",")
}

/// Installs the global subscriber, writing to standard error.
///
/// Returns false if a subscriber was already installed.
pub fn init(quiet: bool, trace: Option<&str>) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(quiet, trace)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
