use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{CacheConfig, ConfigError};

/// Command-line arguments for the gateway binary.
#[derive(Debug, Parser)]
#[command(
    name = "cache-entity-gateway",
    version,
    about = "HTTP gateway with tag-invalidated response caching"
)]
pub struct CliArgs {
    /// Address the gateway accepts clients on.
    #[arg(
        long,
        env = "CACHE_GATEWAY_LISTEN",
        value_name = "ADDR",
        default_value = "127.0.0.1:8000"
    )]
    pub listen: String,

    /// Upstream service address (host:port).
    #[arg(
        long,
        env = "CACHE_GATEWAY_UPSTREAM",
        value_name = "ADDR",
        default_value = "127.0.0.1:9000"
    )]
    pub upstream: String,

    /// Plugin JSON configuration file.
    #[arg(long, env = "CACHE_GATEWAY_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the Redis host.
    #[arg(long = "redis-host", env = "CACHE_REDIS_HOST", value_name = "HOST")]
    pub redis_host: Option<String>,

    /// Override the Redis port.
    #[arg(long = "redis-port", env = "CACHE_REDIS_PORT", value_name = "PORT")]
    pub redis_port: Option<u16>,

    /// Store keys without the namespace prefix.
    #[arg(long = "no-prefix", action = clap::ArgAction::SetTrue)]
    pub no_prefix: bool,

    /// Override the entry lifetime.
    #[arg(long = "ttl-seconds", env = "CACHE_GATEWAY_TTL_SECONDS", value_name = "SECONDS")]
    pub ttl_seconds: Option<u64>,

    /// Close client connections idle for this long.
    #[arg(
        long = "idle-timeout-seconds",
        env = "CACHE_GATEWAY_IDLE_TIMEOUT_SECONDS",
        value_name = "SECONDS",
        default_value_t = 60
    )]
    pub idle_timeout_seconds: u64,

    /// Keep entries in process memory instead of Redis.
    #[arg(long = "memory-store", action = clap::ArgAction::SetTrue)]
    pub memory_store: bool,
}

impl CliArgs {
    /// Loads the config file, if any, then applies the command-line overrides.
    pub fn cache_config(&self) -> Result<CacheConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::from_file(path)?,
            None => CacheConfig::default(),
        };

        if let Some(host) = &self.redis_host {
            config.store.host = host.clone();
        }
        if let Some(port) = self.redis_port {
            config.store.port = port;
        }
        if self.no_prefix {
            config.use_prefix = false;
        }
        if let Some(secs) = self.ttl_seconds.filter(|s| *s > 0) {
            config.default_ttl = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("cache-entity-gateway").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        assert_eq!(args.listen, "127.0.0.1:8000");
        assert_eq!(args.upstream, "127.0.0.1:9000");
        assert!(!args.memory_store);
        assert_eq!(args.idle_timeout_seconds, 60);
        assert_eq!(args.cache_config().unwrap(), CacheConfig::default());
    }

    #[test]
    fn overrides_apply() {
        let args = parse(&[
            "--redis-host",
            "cache.internal",
            "--redis-port",
            "6380",
            "--no-prefix",
            "--ttl-seconds",
            "60",
            "--memory-store",
        ]);
        let config = args.cache_config().unwrap();
        assert_eq!(config.store.host, "cache.internal");
        assert_eq!(config.store.port, 6380);
        assert!(!config.use_prefix);
        assert_eq!(config.default_ttl, Duration::from_secs(60));
        assert!(args.memory_store);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = parse(&["--config", "/nonexistent/cache-entity.json"]);
        assert!(matches!(args.cache_config(), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn every_valued_flag_has_an_env_fallback() {
        use clap::CommandFactory;

        let command = CliArgs::command();
        let envs: Vec<_> = command
            .get_arguments()
            .filter(|arg| arg.get_action().takes_values())
            .filter_map(|arg| arg.get_env())
            .collect();
        for name in [
            "CACHE_GATEWAY_LISTEN",
            "CACHE_GATEWAY_UPSTREAM",
            "CACHE_GATEWAY_CONFIG",
            "CACHE_REDIS_HOST",
            "CACHE_REDIS_PORT",
            "CACHE_GATEWAY_TTL_SECONDS",
            "CACHE_GATEWAY_IDLE_TIMEOUT_SECONDS",
        ] {
            assert!(envs.iter().any(|env| *env == name), "missing {name}");
        }
    }

    #[test]
    fn rejects_bad_port() {
        let result = CliArgs::try_parse_from(["cache-entity-gateway", "--redis-port", "nope"]);
        assert!(result.is_err());
    }
}
