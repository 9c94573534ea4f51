// Configuration module entry point
// Layers defaults, an optional config file, PREFORK_* environment variables
// and command line overrides into one `Config`

mod types;

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use tracing_subscriber::filter::LevelFilter;

use crate::app::AppRef;
use crate::error::ConfigError;

// Re-export public types
pub use types::{Config, LoggingConfig, PerformanceConfig, ServerConfig, SupervisorConfig};

/// Prefix of configuration environment variables, e.g. `PREFORK_SERVER__PORT`
pub const ENV_PREFIX: &str = "PREFORK";

/// Conventional variable holding the default worker count
const WEB_CONCURRENCY: &str = "WEB_CONCURRENCY";

/// Values given on the command line; they win over every other source.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub app: Option<String>,
    pub graceful_timeout: Option<u64>,
    pub worker_timeout: Option<u64>,
    pub keep_alive_timeout: Option<u64>,
    pub max_requests: Option<u64>,
    pub max_requests_jitter: Option<u64>,
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from the process environment, an optional file and
    /// command line overrides.
    pub fn load(file: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        Self::load_with_env(file, std::env::vars().collect(), overrides)
    }

    /// Same as [`Config::load`] but reads environment variables from `env`.
    pub fn load_with_env(
        file: Option<&Path>,
        env: config::Map<String, String>,
        overrides: &Overrides,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(workers) = env
            .get(WEB_CONCURRENCY)
            .and_then(|v| v.trim().parse::<i64>().ok())
        {
            builder = builder.set_default("server.workers", workers)?;
        }

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(env)),
            )
            .set_override_option("server.bind", overrides.bind.clone())?
            .set_override_option("server.port", overrides.port.map(i64::from))?
            .set_override_option("server.workers", as_int(overrides.workers))?
            .set_override_option("server.app", overrides.app.clone())?
            .set_override_option(
                "supervisor.graceful_timeout",
                as_int(overrides.graceful_timeout),
            )?
            .set_override_option("supervisor.worker_timeout", as_int(overrides.worker_timeout))?
            .set_override_option(
                "performance.keep_alive_timeout",
                as_int(overrides.keep_alive_timeout),
            )?
            .set_override_option("performance.max_requests", as_int(overrides.max_requests))?
            .set_override_option(
                "performance.max_requests_jitter",
                as_int(overrides.max_requests_jitter),
            )?
            .set_override_option("logging.level", overrides.log_level.clone())?;

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot: addresses, log level and the app reference syntax.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        self.log_level()?;
        if let Some(app) = &self.server.app {
            app.parse::<AppRef>()?;
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self
            .server
            .bind
            .parse::<IpAddr>()
            .map_err(|source| ConfigError::InvalidAddress {
                addr: self.server.bind.clone(),
                source,
            })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// The configured application reference; its absence is fatal.
    pub fn app_ref(&self) -> Result<AppRef, ConfigError> {
        self.server
            .app
            .as_deref()
            .ok_or(ConfigError::MissingApp)?
            .parse()
    }

    pub fn log_level(&self) -> Result<LevelFilter, ConfigError> {
        self.logging
            .level
            .parse()
            .map_err(|_| ConfigError::InvalidLogLevel(self.logging.level.clone()))
    }
}

impl SupervisorConfig {
    pub const fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout)
    }

    pub const fn worker_timeout(&self) -> Option<Duration> {
        match self.worker_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn as_int<T: TryInto<i64>>(value: Option<T>) -> Option<i64> {
    value.and_then(|v| v.try_into().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> config::Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_the_documented_entry_point() {
        let config = Config::load_with_env(None, env(&[]), &Overrides::default()).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.app, None);
        assert_eq!(config.supervisor.graceful_timeout, 30);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn environment_variables_override_defaults() {
        let vars = env(&[
            ("PREFORK_SERVER__PORT", "8080"),
            ("PREFORK_SERVER__APP", "builtin:echo"),
            ("PREFORK_PERFORMANCE__MAX_REQUESTS", "500"),
            ("PREFORK_LOGGING__ACCESS_LOG", "false"),
        ]);
        let config = Config::load_with_env(None, vars, &Overrides::default()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.app.as_deref(), Some("builtin:echo"));
        assert_eq!(config.performance.max_requests, 500);
        assert!(!config.logging.access_log);
    }

    #[test]
    fn web_concurrency_sets_default_worker_count() {
        let config =
            Config::load_with_env(None, env(&[("WEB_CONCURRENCY", "7")]), &Overrides::default())
                .unwrap();
        assert_eq!(config.server.workers, 7);

        let overrides = Overrides {
            workers: Some(2),
            ..Overrides::default()
        };
        let config =
            Config::load_with_env(None, env(&[("WEB_CONCURRENCY", "7")]), &overrides).unwrap();
        assert_eq!(config.server.workers, 2);
    }

    #[test]
    fn command_line_wins_over_file_and_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[server]\nport = 6000\nworkers = 3\napp = \"builtin:hello\"\n\n[supervisor]\ngraceful_timeout = 5"
        )
        .unwrap();

        let overrides = Overrides {
            port: Some(7000),
            ..Overrides::default()
        };
        let vars = env(&[("PREFORK_SERVER__WORKERS", "6")]);
        let config = Config::load_with_env(Some(file.path()), vars, &overrides).unwrap();

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.workers, 6);
        assert_eq!(config.server.app.as_deref(), Some("builtin:hello"));
        assert_eq!(config.supervisor.graceful_timeout, 5);
        // Untouched keys keep their defaults
        assert_eq!(config.server.backlog, 2048);
    }

    #[test]
    fn invalid_bind_address_is_rejected() {
        let overrides = Overrides {
            bind: Some("not-an-ip".to_string()),
            ..Overrides::default()
        };
        let err = Config::load_with_env(None, env(&[]), &overrides).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { .. }));
    }

    #[test]
    fn malformed_app_reference_is_rejected() {
        let overrides = Overrides {
            app: Some("no-colon".to_string()),
            ..Overrides::default()
        };
        let err = Config::load_with_env(None, env(&[]), &overrides).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAppRef(_)));
    }

    #[test]
    fn missing_app_is_a_config_error() {
        let config = Config::default();
        assert!(matches!(config.app_ref(), Err(ConfigError::MissingApp)));
    }

    #[test]
    fn zero_worker_timeout_disables_health_checks() {
        let supervisor = SupervisorConfig {
            worker_timeout: 0,
            ..SupervisorConfig::default()
        };
        assert_eq!(supervisor.worker_timeout(), None);
        assert_eq!(
            SupervisorConfig::default().worker_timeout(),
            Some(Duration::from_secs(30))
        );
    }
}
