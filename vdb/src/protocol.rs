//! Wire protocol between the transport and the viewer.
//!
//! The viewer is a WebSocket client, so the default protocol is a minimal
//! RFC 6455 server: the upgrade handshake, unmasked binary frames towards
//! the viewer, and parsing of (masked) frames coming back.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};

use crate::error::ProtocolError;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Longest possible frame header: 2 bytes + 8 length bytes + 4 mask bytes.
pub const MAX_FRAME_HEADER: usize = 14;

pub mod opcode {
    pub const CONTINUATION: u8 = 0x0;
    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Commands a viewer can send to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stop the session: no further connections are accepted.
    Shutdown,
    /// The viewer is closing the connection.
    Close,
}

impl ControlCommand {
    /// Interpret a final message as a control command, if it is one.
    pub fn from_message(msg: &Message) -> Option<Self> {
        if !msg.fin {
            return None;
        }
        match msg.opcode {
            opcode::CLOSE => Some(ControlCommand::Close),
            opcode::TEXT | opcode::BINARY if msg.payload.trim_ascii() == b"shutdown" => {
                Some(ControlCommand::Shutdown)
            }
            _ => None,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
    /// Size of the encoded header in bytes.
    pub header_len: usize,
}

impl FrameHeader {
    /// Decode a header from the start of `data`. `None` if incomplete.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let fin = data[0] & 0x80 != 0;
        let opcode = data[0] & 0x0F;
        let masked = data[1] & 0x80 != 0;
        let len7 = data[1] & 0x7F;

        let (payload_len, mut offset) = match len7 {
            126 => {
                let bytes = data.get(2..4)?;
                (u16::from_be_bytes([bytes[0], bytes[1]]) as u64, 4)
            }
            127 => {
                let bytes: [u8; 8] = data.get(2..10)?.try_into().ok()?;
                (u64::from_be_bytes(bytes), 10)
            }
            n => (n as u64, 2),
        };

        let mask = if masked {
            let key: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
            offset += 4;
            Some(key)
        } else {
            None
        };

        Some(Self {
            fin,
            opcode,
            mask,
            payload_len,
            header_len: offset,
        })
    }
}

/// Encode a frame header for `payload_len` bytes.
pub fn encode_header(fin: bool, opcode: u8, payload_len: usize, mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut header = Vec::with_capacity(MAX_FRAME_HEADER);
    header.push(if fin { 0x80 } else { 0x00 } | (opcode & 0x0F));

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload_len < 126 {
        header.push(mask_bit | payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        header.push(mask_bit | 126);
        header.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        header.push(mask_bit | 127);
        header.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }

    if let Some(key) = mask {
        header.extend_from_slice(&key);
    }
    header
}

fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Build a complete masked frame, as a client must send it.
pub fn encode_client_frame(opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut frame = encode_header(true, opcode, payload.len(), Some(mask));
    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], mask);
    frame
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Build a client upgrade request for `host` with the given key.
pub fn client_handshake(host: &str, key: &str) -> String {
    format!(
        "GET / HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        host, key
    )
}

/// Check a server's handshake response against the key we sent.
pub fn verify_handshake_response(response: &[u8], key: &str) -> Result<(), ProtocolError> {
    let text = std::str::from_utf8(response)
        .map_err(|_| ProtocolError::BadResponse("response is not UTF-8".to_string()))?;

    let status = text.lines().next().unwrap_or_default();
    if !status.contains(" 101 ") {
        return Err(ProtocolError::BadResponse(status.to_string()));
    }

    let accept = header_value(text, "sec-websocket-accept")
        .ok_or_else(|| ProtocolError::BadResponse("missing Sec-WebSocket-Accept".to_string()))?;
    if accept != accept_key(key) {
        return Err(ProtocolError::BadResponse("accept key mismatch".to_string()));
    }
    Ok(())
}

fn header_value<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    text.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// Framing and handshake operations used by the workers.
pub trait Protocol {
    /// Produce the handshake response for a client's opening request.
    fn generate_handshake(&self, request: &[u8]) -> Result<Vec<u8>, ProtocolError>;

    /// Produce the header that precedes a payload of `payload_len` bytes.
    fn form_frame(&self, payload_len: usize) -> Vec<u8>;

    /// Parse one message from `raw`. `None` if `raw` does not hold a
    /// complete message.
    fn parse_message(&self, raw: &[u8]) -> Option<Message>;
}

/// RFC 6455 WebSocket server side.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocket;

impl Protocol for WebSocket {
    fn generate_handshake(&self, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let text = std::str::from_utf8(request).map_err(|_| ProtocolError::BadRequest)?;
        if !text.starts_with("GET ") {
            return Err(ProtocolError::BadRequest);
        }

        let key = header_value(text, "sec-websocket-key").ok_or(ProtocolError::MissingKey)?;
        if key.is_empty() {
            return Err(ProtocolError::MissingKey);
        }

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(key)
        );
        Ok(response.into_bytes())
    }

    fn form_frame(&self, payload_len: usize) -> Vec<u8> {
        encode_header(true, opcode::BINARY, payload_len, None)
    }

    fn parse_message(&self, raw: &[u8]) -> Option<Message> {
        let header = FrameHeader::decode(raw)?;
        let len = usize::try_from(header.payload_len).ok()?;
        let end = header.header_len.checked_add(len)?;
        let mut payload = raw.get(header.header_len..end)?.to_vec();

        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }

        Some(Message {
            fin: header.fin,
            opcode: header.opcode,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_matches_rfc_example() {
        // RFC 6455 section 1.3
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_handshake() {
        let request = client_handshake("localhost:8000", "dGhlIHNhbXBsZSBub25jZQ==");
        let response = WebSocket.generate_handshake(request.as_bytes()).unwrap();
        let text = String::from_utf8(response.clone()).unwrap();

        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        verify_handshake_response(&response, "dGhlIHNhbXBsZSBub25jZQ==").unwrap();
    }

    #[test]
    fn test_handshake_header_name_is_case_insensitive() {
        let request = "GET / HTTP/1.1\r\nsec-websocket-key: abc\r\n\r\n";
        assert!(WebSocket.generate_handshake(request.as_bytes()).is_ok());
    }

    #[test]
    fn test_handshake_failures() {
        assert_eq!(
            WebSocket.generate_handshake(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"),
            Err(ProtocolError::MissingKey)
        );
        assert_eq!(
            WebSocket.generate_handshake(b"POST / HTTP/1.1\r\n\r\n"),
            Err(ProtocolError::BadRequest)
        );
        assert_eq!(
            WebSocket.generate_handshake(&[0xff, 0xfe, 0x00]),
            Err(ProtocolError::BadRequest)
        );
        assert!(verify_handshake_response(b"HTTP/1.1 400 Bad Request\r\n\r\n", "k").is_err());
    }

    #[test]
    fn test_frame_round_trip_for_each_length_encoding() {
        for len in [0usize, 1, 125, 126, 1000, 65535, 65536, 200_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut frame = WebSocket.form_frame(len);
            frame.extend_from_slice(&payload);

            let msg = WebSocket.parse_message(&frame).unwrap();
            assert!(msg.fin);
            assert_eq!(msg.opcode, opcode::BINARY);
            assert_eq!(msg.payload.len(), len);
            assert_eq!(msg.payload, payload);
        }
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(WebSocket.form_frame(125).len(), 2);
        assert_eq!(WebSocket.form_frame(126).len(), 4);
        assert_eq!(WebSocket.form_frame(65536).len(), 10);
    }

    #[test]
    fn test_parse_masked_client_frame() {
        let frame = encode_client_frame(opcode::TEXT, b"shutdown", [1, 2, 3, 4]);
        assert_ne!(&frame[6..], b"shutdown");

        let msg = WebSocket.parse_message(&frame).unwrap();
        assert_eq!(msg.payload, b"shutdown");
        assert_eq!(ControlCommand::from_message(&msg), Some(ControlCommand::Shutdown));
    }

    #[test]
    fn test_incomplete_frames_are_not_messages() {
        let frame = encode_client_frame(opcode::TEXT, b"hello", [9, 9, 9, 9]);
        for cut in 0..frame.len() {
            assert!(WebSocket.parse_message(&frame[..cut]).is_none());
        }
    }

    #[test]
    fn test_control_commands() {
        let fragment = Message {
            fin: false,
            opcode: opcode::TEXT,
            payload: b"shutdown".to_vec(),
        };
        assert_eq!(ControlCommand::from_message(&fragment), None);

        let close = Message {
            fin: true,
            opcode: opcode::CLOSE,
            payload: Vec::new(),
        };
        assert_eq!(ControlCommand::from_message(&close), Some(ControlCommand::Close));

        let other = Message {
            fin: true,
            opcode: opcode::TEXT,
            payload: b"hello".to_vec(),
        };
        assert_eq!(ControlCommand::from_message(&other), None);
    }
}
