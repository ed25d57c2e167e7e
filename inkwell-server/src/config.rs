//! Server configuration, parsed from CLI flags with environment variable
//! fallbacks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Default transform window `W`: how far back the server will fold an
/// incoming edit through the operation log before giving up and asking the
/// client to reconcile.
pub const DEFAULT_TRANSFORM_WINDOW: u64 = 1024;
/// Default WAL compaction threshold, in bytes.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 8 * 1024 * 1024;
/// Default client heartbeat interval.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);
/// Default presence idle-eviction threshold.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(60);
/// Also-compact-on-this-many-revisions-since-snapshot threshold.
pub const DEFAULT_SNAPSHOT_REV_GAP: u64 = 10_000;

#[derive(Parser, Debug, Clone)]
pub struct Args {
    #[clap(long, default_value = "0.0.0.0:3030")]
    pub host: SocketAddr,

    #[clap(short, long, default_value = "vault")]
    pub storage: PathBuf,

    #[clap(long, default_value_t = DEFAULT_TRANSFORM_WINDOW)]
    pub transform_window: u64,

    #[clap(long, default_value_t = DEFAULT_SNAPSHOT_THRESHOLD)]
    pub snapshot_threshold: u64,

    #[clap(long, default_value = "5")]
    pub heartbeat_interval_secs: u64,

    #[clap(long, default_value = "60")]
    pub idle_threshold_secs: u64,
}

/// Resolved server configuration, independent of how it was parsed.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: SocketAddr,
    pub storage: PathBuf,
    pub transform_window: u64,
    pub snapshot_threshold: u64,
    pub heartbeat_interval: Duration,
    pub idle_threshold: Duration,
}

impl ServerConfig {
    pub fn host(&self) -> SocketAddr {
        self.host
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: SocketAddr::from(([0, 0, 0, 0], 3030)),
            storage: PathBuf::from("vault"),
            transform_window: DEFAULT_TRANSFORM_WINDOW,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            storage: args.storage,
            transform_window: args.transform_window,
            snapshot_threshold: args.snapshot_threshold,
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
            idle_threshold: Duration::from_secs(args.idle_threshold_secs),
        }
    }
}

/// Build the `tracing_subscriber::EnvFilter` default directive: crate-scoped,
/// `tower_http=info` by default, `debug` when `APP_ENV=development`.
pub fn default_log_directive() -> String {
    let level = match std::env::var("APP_ENV").as_deref() {
        Ok("development") => "debug",
        _ => "info",
    };
    format!("{}={level},tower_http=info", env!("CARGO_CRATE_NAME"))
}
