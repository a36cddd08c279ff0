use std::net::Ipv4Addr;
use std::path::Path;
use uther_chip::regs::CHANNELS;
use uther_chip::{ChipError, NetworkConfig};

pub fn load_config(path: Option<&Path>) -> Result<NetworkConfig, ChipError> {
    match path {
        Some(path) => {
            let config = NetworkConfig::from_json_file(path)?;
            tracing::info!(path = %path.display(), ip = %config.ip, "loaded network config");
            Ok(config)
        }
        None => Ok(NetworkConfig::default()),
    }
}

pub fn check_channel(channel: usize) -> Result<usize, ChipError> {
    if channel >= CHANNELS {
        return Err(ChipError::InvalidConfig(format!(
            "channel {} out of range (0-{})",
            channel,
            CHANNELS - 1
        )));
    }
    Ok(channel)
}

pub fn format_size(bytes: u16) -> String {
    if bytes == 0 {
        "-".to_string()
    } else if bytes >= 1024 {
        format!("{}KB", bytes / 1024)
    } else {
        format!("{}B", bytes)
    }
}

pub fn ip_from(bytes: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}
