pub mod logging {
    //! Process-wide `tracing` setup for the `busline` binary.

    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Full `EnvFilter` override, e.g. `busline::monitor=trace,warn`.
    pub const FILTER_VAR: &str = "BUSLINE_LOG_FILTER";
    /// Lets websocket and TLS internals log below `info`.
    const TRACE_DEPS_VAR: &str = "BUSLINE_TRACE_DEPS";

    const OWN_CRATES: [&str; 2] = ["busline", "transport_bus"];
    const NOISY_DEPS: [&str; 4] = ["tokio_tungstenite", "tungstenite", "mio", "native_tls"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Append to this file instead of stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to install subscriber: {0}")]
        Install(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Install the global subscriber once; later calls return `Ok` without
    /// touching it.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let directives = match std::env::var(FILTER_VAR) {
            Ok(raw) => raw,
            Err(_) => directives_for(config.level.into(), trace_deps()),
        };
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&directives))
            .with_target(true)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::Install(err.to_string()))?;

        let _ = GUARD.set(guard);
        tracing::debug!(target = "busline::telemetry", %directives, "logging ready");
        Ok(())
    }

    fn trace_deps() -> bool {
        std::env::var(TRACE_DEPS_VAR).is_ok_and(|value| !value.is_empty() && value != "0")
    }

    /// Directives for `level`. Above `info` only our own crates get louder;
    /// at `trace` the websocket stack stays at `info` unless `deps` is set.
    fn directives_for(level: LevelFilter, deps: bool) -> String {
        if level <= LevelFilter::INFO {
            return level.to_string().to_lowercase();
        }
        let mut directives = vec!["info".to_string()];
        directives.extend(OWN_CRATES.iter().map(|krate| format!("{krate}={level}")));
        if level == LevelFilter::TRACE && !deps {
            directives.extend(NOISY_DEPS.iter().map(|dep| format!("{dep}=info")));
        }
        directives.join(",").to_lowercase()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn debug_raises_only_our_crates() {
            assert_eq!(
                directives_for(LevelFilter::DEBUG, false),
                "info,busline=debug,transport_bus=debug"
            );
            assert_eq!(directives_for(LevelFilter::WARN, false), "warn");
        }

        #[test]
        fn trace_keeps_websocket_internals_quiet_unless_asked() {
            let quiet = directives_for(LevelFilter::TRACE, false);
            assert!(quiet.starts_with("info,busline=trace,transport_bus=trace,"));
            assert!(quiet.ends_with(",native_tls=info"));

            let loud = directives_for(LevelFilter::TRACE, true);
            assert_eq!(loud, "info,busline=trace,transport_bus=trace");
        }

        #[test]
        fn cli_level_maps_to_filter() {
            assert_eq!(LevelFilter::from(LogLevel::default()), LevelFilter::WARN);
            assert!(LogLevel::Trace > LogLevel::Debug);
        }
    }
}
