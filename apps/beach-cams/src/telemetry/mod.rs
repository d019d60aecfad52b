pub mod logging {
    //! Process-wide tracing setup for the binary.
    //!
    //! Every event in this crate carries an explicit `beach_cams::<area>`
    //! target. The filter raises those areas to the requested verbosity while
    //! everything else stays at `info` or quieter.

    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    use crate::config::env_truthy;

    /// Full filter override, in `EnvFilter` syntax.
    pub const FILTER_ENV: &str = "BEACH_CAMS_LOG_FILTER";
    /// Lets webrtc and websocket internals log at trace level too.
    pub const TRACE_DEPS_ENV: &str = "BEACH_CAMS_TRACE_DEPS";

    const AREAS: &[&str] = &[
        "beach_cams::registry",
        "beach_cams::transport",
        "beach_cams::negotiation",
        "beach_cams::status",
        "beach_cams::media",
        "beach_cams::telemetry",
        "beach_cams_core",
    ];

    const CHATTY_DEPENDENCIES: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_sctp",
        "webrtc_srtp",
        "webrtc_mdns",
        "tokio_tungstenite",
        "tungstenite",
        "mio",
    ];

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
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    /// What the filter was built from, kept so `init` can say so once the
    /// subscriber is live.
    #[derive(Debug, PartialEq, Eq)]
    enum FilterSource {
        Override,
        Level { dependencies_quieted: bool },
    }

    // Holds the non-blocking writer's guard for the life of the process.
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (directives, source) = build_env_filter(
            config.level,
            std::env::var(FILTER_ENV).ok(),
            env_truthy(TRACE_DEPS_ENV),
        );

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

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&directives))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);

        match source {
            FilterSource::Override => tracing::debug!(
                target: "beach_cams::telemetry",
                filter = %directives,
                "log filter taken from {FILTER_ENV}"
            ),
            FilterSource::Level {
                dependencies_quieted: true,
            } => tracing::info!(
                target: "beach_cams::telemetry",
                "webrtc and websocket internals held at info; set {TRACE_DEPS_ENV}=1 to trace them"
            ),
            FilterSource::Level { .. } => {}
        }
        Ok(())
    }

    /// Directive string for `level`. An override replaces it wholesale.
    /// At trace level the chatty dependencies stay at info unless
    /// `trace_dependencies` is set.
    fn build_env_filter(
        level: LogLevel,
        override_filter: Option<String>,
        trace_dependencies: bool,
    ) -> (String, FilterSource) {
        if let Some(filter) = override_filter.filter(|f| !f.trim().is_empty()) {
            return (filter, FilterSource::Override);
        }

        let requested = LevelFilter::from(level);
        let baseline = requested.min(LevelFilter::INFO);
        let mut directives = vec![baseline.to_string()];
        if requested > baseline {
            directives.extend(AREAS.iter().map(|area| format!("{area}={requested}")));
        }

        let dependencies_quieted = level == LogLevel::Trace && !trace_dependencies;
        if dependencies_quieted {
            directives.extend(CHATTY_DEPENDENCIES.iter().map(|dep| format!("{dep}=info")));
        }
        (
            directives.join(","),
            FilterSource::Level {
                dependencies_quieted,
            },
        )
    }

}
