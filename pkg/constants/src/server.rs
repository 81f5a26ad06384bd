//! Daemon defaults.

/// Port the HTTP endpoints (`/healthz`, `/metrics`) listen on.
pub const DEFAULT_METRICS_PORT: u16 = 9464;

/// Default SlateDB data directory.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/quota/data";

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/quota/config.yaml";
