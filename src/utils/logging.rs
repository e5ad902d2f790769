use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging system.
///
/// Logs go to stderr so scan tables on stdout stay clean; `RUST_LOG`
/// directives are applied on top of the crate level picked by `verbose`.
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive(crate_directive(verbose).parse()?)
        .add_directive("warn".parse()?);

    let stderr_layer = fmt::layer()
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .context(format!("Failed to open log file: {}", path.display()))?;

            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}

/// Level directive for this crate's own targets
fn crate_directive(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("{}={}", env!("CARGO_CRATE_NAME"), level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::Directive;

    #[test]
    fn test_crate_directive_matches_event_targets() {
        let crate_prefix = module_path!().split("::").next().unwrap();

        assert_eq!(crate_directive(false), format!("{}=info", crate_prefix));
        assert_eq!(crate_directive(true), format!("{}=debug", crate_prefix));
    }

    #[test]
    fn test_crate_directive_parses() {
        assert!(crate_directive(true).parse::<Directive>().is_ok());
        assert!(crate_directive(false).parse::<Directive>().is_ok());
    }
}
