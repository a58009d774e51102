//! Runtime configuration for the arena server.

use std::time::Duration;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_IO_WORKERS: usize = 4;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 2;
pub const DEFAULT_BATTLE_TICK_MS: u64 = 50;
pub const DEFAULT_ROOM_CAPACITY: usize = 2;

/// Number of scheduler workers when none is configured
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Threads of the tokio runtime driving socket I/O
    pub io_workers: usize,
    /// Threads of the affinity scheduler running handlers
    pub workers: usize,
    pub heartbeat_period: Duration,
    /// Silent heartbeat periods tolerated before a connection is dropped
    pub max_missed_heartbeats: u32,
    pub battle_tick: Duration,
    pub room_capacity: usize,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: shared::DEFAULT_PORT,
            io_workers: DEFAULT_IO_WORKERS,
            workers: default_workers(),
            heartbeat_period: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            battle_tick: Duration::from_millis(DEFAULT_BATTLE_TICK_MS),
            room_capacity: DEFAULT_ROOM_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8989);
        assert_eq!(config.bind_addr(), "0.0.0.0:8989");
        assert_eq!(config.heartbeat_period, Duration::from_secs(10));
        assert_eq!(config.max_missed_heartbeats, 2);
        assert_eq!(config.battle_tick, Duration::from_millis(50));
        assert_eq!(config.room_capacity, 2);
        assert!(config.workers >= 1);
    }
}
