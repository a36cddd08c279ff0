use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChipError {
    #[error("bind to port {port} failed: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("channel has no bound host socket")]
    NotBound,

    #[error("unsupported raw protocol: {0}")]
    UnsupportedProtocol(u8),

    #[error("{0} echo requests already outstanding")]
    PingBacklog(usize),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("channel closed while waiting for {0}")]
    Closed(&'static str),

    #[error("invalid network config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChipError {
    /// True for failures an operator can fix (port in use, privileged port).
    pub fn is_bind_failure(&self) -> bool {
        matches!(self, ChipError::Bind { .. })
    }
}
