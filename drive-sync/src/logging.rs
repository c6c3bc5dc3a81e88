use tracing_subscriber::EnvFilter;

const QUIET_CRATES: &[&str] = &["sqlx=warn", "hyper=warn", "hyper_util=warn", "reqwest=warn"];

/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `verbose`.
pub fn env_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    if let Some(directives) = rust_log.filter(|value| !value.trim().is_empty())
        && let Ok(filter) = EnvFilter::try_new(directives)
    {
        return filter;
    }

    let level = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::new(level);
    for directive in QUIET_CRATES {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Installs the global fmt subscriber writing to stderr. A second call is a no-op.
pub fn init(verbose: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose, rust_log.as_deref()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_selects_default_level() {
        assert_eq!(
            env_filter(false, None).max_level_hint(),
            Some(tracing::level_filters::LevelFilter::INFO)
        );
        assert_eq!(
            env_filter(true, None).max_level_hint(),
            Some(tracing::level_filters::LevelFilter::DEBUG)
        );
    }

    #[test]
    fn rust_log_overrides_verbosity() {
        assert_eq!(
            env_filter(true, Some("warn")).max_level_hint(),
            Some(tracing::level_filters::LevelFilter::WARN)
        );
        assert_eq!(
            env_filter(false, Some("  ")).max_level_hint(),
            Some(tracing::level_filters::LevelFilter::INFO)
        );
    }
}
