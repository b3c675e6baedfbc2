use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::tcp::{MAX_FRAME_LEN, MAX_READ_SIZE};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub lease_database: LeaseDatabaseConfig,
    pub listener: ListenerConfig,
    #[serde(default)]
    pub packet_queue: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseDatabaseConfig {
    pub persist: bool,
    pub leases_file: String,
    #[serde(default = "default_extended_info_tables")]
    pub extended_info_tables: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub address: IpAddr,
    pub port: u16,
    pub idle_timeout_ms: u64,
    #[serde(default = "default_read_max")]
    pub read_max: usize,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

fn default_extended_info_tables() -> bool {
    true
}

fn default_read_max() -> usize {
    32 * 1024
}

fn default_max_request_size() -> usize {
    u16::MAX as usize
}

impl Default for LeaseDatabaseConfig {
    fn default() -> Self {
        Self {
            persist: true,
            leases_file: "leases.json".to_string(),
            extended_info_tables: true,
        }
    }
}

impl LeaseDatabaseConfig {
    pub fn in_memory(extended_info_tables: bool) -> Self {
        Self {
            persist: false,
            leases_file: String::new(),
            extended_info_tables,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 5547,
            idle_timeout_ms: 10_000,
            read_max: default_read_max(),
            max_request_size: default_max_request_size(),
        }
    }
}

impl ListenerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_database.persist && self.lease_database.leases_file.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "leases_file must be set when persist is enabled".to_string(),
            ));
        }

        if self.listener.idle_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "idle_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.listener.read_max == 0 || self.listener.read_max > MAX_READ_SIZE {
            return Err(Error::InvalidConfig(format!(
                "read_max must be between 1 and {}",
                MAX_READ_SIZE
            )));
        }

        if self.listener.max_request_size == 0 || self.listener.max_request_size > MAX_FRAME_LEN {
            return Err(Error::InvalidConfig(format!(
                "max_request_size must be between 1 and {}",
                MAX_FRAME_LEN
            )));
        }

        if let Some(queue) = &self.packet_queue
            && !queue.is_object()
        {
            return Err(Error::InvalidConfig(
                "packet_queue must be a JSON map".to_string(),
            ));
        }

        Ok(())
    }
}
