//! Command line and environment configuration.

use clap::Parser;
use ipnetwork::Ipv4Network;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::error::ConfigError;
use crate::hub::HubConfig;
use crate::logging::LoggingMode;

#[derive(Debug, Clone, Parser)]
#[command(name = "lanwatch", version, about = "Continuous LAN device discovery")]
pub struct Cli {
    /// Address the HTTP and WebSocket server listens on
    #[arg(long, env = "LANWATCH_BIND", default_value = "0.0.0.0:8000")]
    pub bind: SocketAddr,

    /// SQLite database file (":memory:" keeps history in memory only)
    #[arg(long, env = "LANWATCH_DATABASE", default_value = "lanwatch.db")]
    pub database: PathBuf,

    /// Seconds between scan cycles
    #[arg(long, env = "LANWATCH_INTERVAL", default_value_t = 30)]
    pub interval: u64,

    /// Consecutive missed cycles before a device is reported offline
    #[arg(long, env = "LANWATCH_GRACE_LIMIT", default_value_t = 3)]
    pub grace_limit: u32,

    /// Seconds a single discovery run may take
    #[arg(long, env = "LANWATCH_DISCOVERY_TIMEOUT", default_value_t = 3)]
    pub discovery_timeout: u64,

    /// Extra probe rounds for hosts that have not answered
    #[arg(long, env = "LANWATCH_RETRIES", default_value_t = 3)]
    pub retries: u32,

    /// Interface to scan from (default: the one holding the default route)
    #[arg(long, env = "LANWATCH_INTERFACE")]
    pub interface: Option<String>,

    /// Subnet to sweep (default: the interface's own network)
    #[arg(long, env = "LANWATCH_SUBNET")]
    pub subnet: Option<Ipv4Network>,

    /// Milliseconds a reverse name lookup may take (0 turns lookups off)
    #[arg(long, env = "LANWATCH_RESOLVE_TIMEOUT_MS", default_value_t = 500)]
    pub resolve_timeout_ms: u64,

    /// Seconds a push to one observer may block before it is dropped
    #[arg(long, env = "LANWATCH_SEND_TIMEOUT", default_value_t = 2)]
    pub send_timeout: u64,

    /// Events buffered per observer
    #[arg(long, env = "LANWATCH_OBSERVER_QUEUE", default_value_t = 64)]
    pub observer_queue: usize,

    #[arg(long, env = "LANWATCH_LOG_FORMAT", value_enum, default_value_t = LoggingMode::Pretty)]
    pub log_format: LoggingMode,
}

impl Cli {
    /// Check value ranges clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(invalid("interval", "must be at least 1 second"));
        }
        if self.grace_limit == 0 {
            return Err(invalid("grace-limit", "must be at least 1 cycle"));
        }
        if self.discovery_timeout == 0 {
            return Err(invalid("discovery-timeout", "must be at least 1 second"));
        }
        if self.send_timeout == 0 {
            return Err(invalid("send-timeout", "must be at least 1 second"));
        }
        if self.observer_queue == 0 {
            return Err(invalid("observer-queue", "must hold at least 1 event"));
        }
        Ok(())
    }

    pub fn engine_config(&self, subnet: Ipv4Network) -> EngineConfig {
        EngineConfig {
            subnet,
            interval: Duration::from_secs(self.interval),
            grace_limit: self.grace_limit,
            discovery_timeout: Duration::from_secs(self.discovery_timeout),
            retries: self.retries,
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            send_timeout: Duration::from_secs(self.send_timeout),
            queue_capacity: self.observer_queue,
        }
    }

    /// Timeout for reverse name lookups, `None` when they are turned off.
    pub fn resolve_timeout(&self) -> Option<Duration> {
        (self.resolve_timeout_ms > 0).then(|| Duration::from_millis(self.resolve_timeout_ms))
    }

    pub fn in_memory_database(&self) -> bool {
        self.database.as_os_str() == ":memory:"
    }
}

fn invalid(name: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["lanwatch"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[]);
        assert!(cli.validate().is_ok());
        assert_eq!(cli.bind.port(), 8000);
        assert_eq!(cli.log_format, LoggingMode::Pretty);

        let engine = cli.engine_config("192.168.1.0/24".parse().unwrap());
        assert_eq!(engine.interval, Duration::from_secs(30));
        assert_eq!(engine.grace_limit, 3);
        assert_eq!(engine.retries, 3);

        let hub = cli.hub_config();
        assert_eq!(hub.send_timeout, Duration::from_secs(2));
        assert_eq!(hub.queue_capacity, 64);

        assert_eq!(cli.resolve_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(parse(&["--resolve-timeout-ms", "0"]).resolve_timeout(), None);
    }

    #[test]
    fn test_rejects_zero_interval_and_grace() {
        let err = parse(&["--interval", "0"]).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "interval", .. }));

        let err = parse(&["--grace-limit", "0"]).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "grace-limit", .. }));
    }

    #[test]
    fn test_parses_subnet_and_format() {
        let cli = parse(&["--subnet", "10.0.0.0/24", "--log-format", "json"]);
        assert_eq!(cli.subnet, Some("10.0.0.0/24".parse().unwrap()));
        assert_eq!(cli.log_format, LoggingMode::Json);
        assert!(!cli.in_memory_database());
        assert!(parse(&["--database", ":memory:"]).in_memory_database());
    }
}
