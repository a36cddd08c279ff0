//! Network identity loaded into the chip on power-on reset.

use crate::error::ChipError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

/// Addressing the chip reports as its own. Only consulted on power-on
/// reset; firmware is free to overwrite the registers afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(with = "mac_format")]
    pub mac: [u8; 6],
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            // WIZnet OUI, as shipped on the card.
            mac: [0x00, 0x08, 0xDC, 0x01, 0x02, 0x03],
            ip: Ipv4Addr::new(192, 168, 65, 100),
            subnet: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 65, 1),
        }
    }
}

impl NetworkConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ChipError> {
        let data = std::fs::read(path)?;
        let config = serde_json::from_slice(&data)?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ChipError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Source of the chip's network identity.
pub trait NetworkConfigProvider: Send + Sync {
    fn network_config(&self) -> NetworkConfig;
}

/// Fixed configuration handed in at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub NetworkConfig);

impl NetworkConfigProvider for StaticConfig {
    fn network_config(&self) -> NetworkConfig {
        self.0.clone()
    }
}

pub fn parse_mac(s: &str) -> Result<[u8; 6], ChipError> {
    let parts: Vec<&str> = s.split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(ChipError::InvalidConfig(format!("bad MAC address: {}", s)));
    }
    let mut mac = [0u8; 6];
    for (b, part) in mac.iter_mut().zip(parts) {
        *b = u8::from_str_radix(part, 16)
            .map_err(|_| ChipError::InvalidConfig(format!("bad MAC address: {}", s)))?;
    }
    Ok(mac)
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

mod mac_format {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mac: &[u8; 6], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_mac(mac))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 6], D::Error> {
        let s = String::deserialize(d)?;
        super::parse_mac(&s).map_err(serde::de::Error::custom)
    }
}
