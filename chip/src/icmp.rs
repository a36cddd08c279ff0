//! ICMP message helpers for the raw-IP echo emulation.

pub const IP_PROTO_ICMP: u8 = 1;

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_DEST_UNREACHABLE: u8 = 3;
pub const TYPE_ECHO_REQUEST: u8 = 8;

pub const CODE_HOST_UNREACHABLE: u8 = 1;

/// Minimum ICMP header: type, code, checksum, identifier, sequence.
pub const HEADER_LEN: usize = 8;

/// One's-complement Internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    // Fold carries into 16 bits.
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build an echo request the way guest ping tools do.
pub fn echo_request(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut message = vec![TYPE_ECHO_REQUEST, 0, 0, 0];
    message.extend_from_slice(&id.to_be_bytes());
    message.extend_from_slice(&seq.to_be_bytes());
    message.extend_from_slice(payload);
    let cksum = checksum(&message);
    message[2..4].copy_from_slice(&cksum.to_be_bytes());
    message
}

pub fn is_echo_request(message: &[u8]) -> bool {
    message.len() >= HEADER_LEN && message[0] == TYPE_ECHO_REQUEST
}

/// Turn an echo request into the reply the pinged host would send:
/// flip the type, keep id/sequence/payload, recompute the checksum.
pub fn echo_reply(request: &[u8]) -> Vec<u8> {
    rewrite(request, TYPE_ECHO_REPLY, 0)
}

/// Destination-unreachable message quoting the original request.
pub fn host_unreachable(request: &[u8]) -> Vec<u8> {
    let mut message = vec![TYPE_DEST_UNREACHABLE, CODE_HOST_UNREACHABLE, 0, 0, 0, 0, 0, 0];
    let quoted = request.len().min(HEADER_LEN);
    message.extend_from_slice(&request[..quoted]);
    let cksum = checksum(&message);
    message[2..4].copy_from_slice(&cksum.to_be_bytes());
    message
}

fn rewrite(request: &[u8], kind: u8, code: u8) -> Vec<u8> {
    let mut message = request.to_vec();
    if message.len() < 4 {
        message.resize(4, 0);
    }
    message[0] = kind;
    message[1] = code;
    message[2..4].copy_from_slice(&[0, 0]);
    let cksum = checksum(&message);
    message[2..4].copy_from_slice(&cksum.to_be_bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(payload: &[u8]) -> Vec<u8> {
        echo_request(0x1234, 1, payload)
    }

    #[test]
    fn test_checksum_of_valid_message_is_zero() {
        let msg = request(b"abcdefgh");
        assert_eq!(&msg[..8], &[TYPE_ECHO_REQUEST, 0, msg[2], msg[3], 0x12, 0x34, 0, 1]);
        assert_eq!(checksum(&msg), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        // 0x0100 + 0xF200 = 0xF300 -> !0xF300
        assert_eq!(checksum(&[0x01, 0x00, 0xF2]), !0xF300);
    }

    #[test]
    fn test_echo_reply_keeps_id_and_payload() {
        let req = request(b"ping!");
        let reply = echo_reply(&req);
        assert_eq!(reply[0], TYPE_ECHO_REPLY);
        assert_eq!(reply[1], 0);
        assert_eq!(&reply[4..8], &req[4..8]);
        assert_eq!(&reply[8..], b"ping!");
        assert_eq!(checksum(&reply), 0);
    }

    #[test]
    fn test_host_unreachable_quotes_header() {
        let req = request(b"zzzz");
        let msg = host_unreachable(&req);
        assert_eq!(msg[0], TYPE_DEST_UNREACHABLE);
        assert_eq!(msg[1], CODE_HOST_UNREACHABLE);
        assert_eq!(&msg[8..], &req[..8]);
        assert_eq!(checksum(&msg), 0);
    }

    #[test]
    fn test_is_echo_request() {
        assert!(is_echo_request(&request(b"")));
        assert!(!is_echo_request(&[TYPE_ECHO_REQUEST, 0, 0]));
        assert!(!is_echo_request(&echo_reply(&request(b"x"))));
    }
}
