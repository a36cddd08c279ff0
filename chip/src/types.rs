/// Channel status register (Sn_SR) values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Closed,
    Init,
    Listen,
    Established,
    Closing,
    CloseWait,
    Udp,
    IpRaw,
    MacRaw,
    Pppoe,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Closed => 0x00,
            Status::Init => 0x13,
            Status::Listen => 0x14,
            Status::Established => 0x17,
            Status::Closing => 0x1A,
            Status::CloseWait => 0x1C,
            Status::Udp => 0x22,
            Status::IpRaw => 0x32,
            Status::MacRaw => 0x42,
            Status::Pppoe => 0x5F,
        }
    }

    /// Decode a status byte. Anything unrecognised reads as `Closed`, which is
    /// the only value a cleared register block can hold.
    pub fn from_code(code: u8) -> Status {
        match code {
            0x13 => Status::Init,
            0x14 => Status::Listen,
            0x17 => Status::Established,
            0x1A => Status::Closing,
            0x1C => Status::CloseWait,
            0x22 => Status::Udp,
            0x32 => Status::IpRaw,
            0x42 => Status::MacRaw,
            0x5F => Status::Pppoe,
            _ => Status::Closed,
        }
    }

    /// States in which SEND moves data to a host transport.
    pub fn can_send(self) -> bool {
        matches!(self, Status::Established | Status::Udp | Status::IpRaw)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Closed => write!(f, "closed"),
            Status::Init => write!(f, "init"),
            Status::Listen => write!(f, "listen"),
            Status::Established => write!(f, "established"),
            Status::Closing => write!(f, "closing"),
            Status::CloseWait => write!(f, "close-wait"),
            Status::Udp => write!(f, "udp"),
            Status::IpRaw => write!(f, "ipraw"),
            Status::MacRaw => write!(f, "macraw"),
            Status::Pppoe => write!(f, "pppoe"),
        }
    }
}

/// Channel command register (Sn_CR) values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Open,
    Listen,
    Connect,
    Discon,
    Close,
    Send,
    SendMac,
    SendKeep,
    Recv,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Open => 0x01,
            Command::Listen => 0x02,
            Command::Connect => 0x04,
            Command::Discon => 0x08,
            Command::Close => 0x10,
            Command::Send => 0x20,
            Command::SendMac => 0x21,
            Command::SendKeep => 0x22,
            Command::Recv => 0x40,
        }
    }

    pub fn from_code(code: u8) -> Option<Command> {
        match code {
            0x01 => Some(Command::Open),
            0x02 => Some(Command::Listen),
            0x04 => Some(Command::Connect),
            0x08 => Some(Command::Discon),
            0x10 => Some(Command::Close),
            0x20 => Some(Command::Send),
            0x21 => Some(Command::SendMac),
            0x22 => Some(Command::SendKeep),
            0x40 => Some(Command::Recv),
            _ => None,
        }
    }
}

/// Protocol selected by the low nibble of Sn_MR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Closed,
    Tcp,
    Udp,
    IpRaw,
    MacRaw,
    Pppoe,
}

impl Protocol {
    pub fn from_mode(mode: u8) -> Protocol {
        match mode & 0x0F {
            0x01 => Protocol::Tcp,
            0x02 => Protocol::Udp,
            0x03 => Protocol::IpRaw,
            0x04 => Protocol::MacRaw,
            0x05 => Protocol::Pppoe,
            _ => Protocol::Closed,
        }
    }

    /// The Sn_MR protocol nibble selecting this protocol.
    pub fn mode(self) -> u8 {
        match self {
            Protocol::Closed => 0x00,
            Protocol::Tcp => 0x01,
            Protocol::Udp => 0x02,
            Protocol::IpRaw => 0x03,
            Protocol::MacRaw => 0x04,
            Protocol::Pppoe => 0x05,
        }
    }
}

/// Sn_MR bit requesting multicast for UDP channels.
pub const MODE_MULTICAST: u8 = 0x80;

/// Sn_IR bits.
pub mod irq {
    pub const CON: u8 = 0x01;
    pub const DISCON: u8 = 0x02;
    pub const RECV: u8 = 0x04;
    pub const TIMEOUT: u8 = 0x08;
    pub const SEND_OK: u8 = 0x10;
}

/// Global MR bits.
pub mod mode {
    pub const INDIRECT: u8 = 0x01;
    pub const AUTO_INCREMENT: u8 = 0x02;
    pub const RESET: u8 = 0x80;
}
