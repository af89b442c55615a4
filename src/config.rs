use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address of the bound interface. Stamped into `siaddr` and option 54.
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// Host offset of the first pool address inside the server's network.
    pub pool_start: u32,
    pub pool_size: u32,
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_duration_seconds: u32,
    /// Network device the UDP socket is bound to (Linux only).
    #[serde(default)]
    pub interface: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: 100,
            pool_size: 101,
            router: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            lease_duration_seconds: 86400,
            interface: None,
        }
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
        if self.pool_size == 0 {
            return Err(Error::InvalidConfig(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.pool_start == 0 {
            return Err(Error::InvalidConfig(
                "pool_start must not be the network address".to_string(),
            ));
        }

        let end = u32::from(self.network())
            .checked_add(self.pool_start)
            .and_then(|first| first.checked_add(self.pool_size));
        match end {
            Some(end) if end <= u32::from(self.broadcast()) => {}
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "pool of {} addresses at offset {} does not fit below broadcast {}",
                    self.pool_size,
                    self.pool_start,
                    self.broadcast()
                )));
            }
        }

        if self.ip_in_pool(self.server_ip) {
            return Err(Error::InvalidConfig(
                "server_ip must not be within the pool range".to_string(),
            ));
        }

        Ok(())
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.server_ip) & u32::from(self.subnet_mask))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.server_ip) | !u32::from(self.subnet_mask))
    }

    /// First pool address. Only meaningful after [`validate`](Self::validate).
    pub fn pool_first(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()).wrapping_add(self.pool_start))
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        let addr = u64::from(u32::from(ip));
        let first = u64::from(u32::from(self.pool_first()));
        addr >= first && addr < first + u64::from(self.pool_size)
    }
}
