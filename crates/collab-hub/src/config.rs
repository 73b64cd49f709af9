use clap::Parser;
use collab_core::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;

const DEFAULT_ADDR: &str = "127.0.0.1:3001";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub debug: bool,
    pub log_dir: String,
    pub ping_interval: Duration,
    pub stale_after: Option<Duration>,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            debug: false,
            log_dir: String::new(),
            ping_interval: Duration::from_secs(10),
            stale_after: Some(Duration::from_secs(60)),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "collab-hub", about = "Realtime collaboration hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// Seconds between websocket pings; 0 disables.
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    /// Close sessions silent for this many seconds; 0 disables.
    #[arg(long, default_value_t = 60)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
}

pub fn load_config() -> Config {
    from_args(Args::parse())
}

fn from_args(args: Args) -> Config {
    let addr = resolve_addr(&args.addr);
    let debug = args.debug || env_true("COLLAB_HUB_DEBUG");
    let log_dir = resolve_log_dir(&args.log_dir);
    let stale_after = match args.stale_seconds {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    Config {
        addr,
        debug,
        log_dir,
        ping_interval: Duration::from_secs(args.ping_interval),
        stale_after,
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        queue_capacity: args.queue_capacity.max(1),
        max_frame_bytes: args.max_frame_bytes,
    }
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("COLLAB_HUB_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_ADDR.to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    if let Ok(value) = std::env::var("COLLAB_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_stale_seconds_disables_reaper() {
        let args = Args::parse_from([
            "collab-hub",
            "--addr",
            "127.0.0.1:4100",
            "--stale-seconds",
            "0",
            "--ping-interval",
            "5",
        ]);
        let config = from_args(args);
        assert_eq!(config.addr, "127.0.0.1:4100");
        assert_eq!(config.stale_after, None);
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn explicit_flags_win_over_defaults() {
        let args = Args::parse_from([
            "collab-hub",
            "--addr",
            "0.0.0.0:9000",
            "--log-dir",
            "/tmp/collab-logs",
            "--queue-capacity",
            "0",
        ]);
        let config = from_args(args);
        assert_eq!(config.addr, "0.0.0.0:9000");
        assert_eq!(config.log_dir, "/tmp/collab-logs");
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.stale_after, Some(Duration::from_secs(60)));
    }
}
