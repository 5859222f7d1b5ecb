//! Terminal wire protocol helpers.
//!
//! The in-container terminal server speaks a ttyd-style protocol over the
//! `tty` WebSocket sub-protocol. The first byte of every frame is a type
//! tag; the payload follows raw.
//!
//! Client -> server:
//!   '0' + data  = input; the very first frame carries the JSON handshake
//!                 `{"AuthToken":"","columns":N,"rows":N}`
//!   '1' + JSON  = resize `{"columns":N,"rows":N}`
//!   '2'         = ping
//!
//! Server -> client:
//!   '0' + data  = terminal output
//!   '1' + text  = window title
//!   '2'         = pong

use serde::{Deserialize, Serialize};

/// The single accepted WebSocket sub-protocol.
pub const SUBPROTOCOL: &str = "tty";

/// Frame type tags.
pub const TAG_DATA: u8 = b'0';
pub const TAG_TITLE: u8 = b'1';
pub const TAG_PING: u8 = b'2';

/// Phrases in server output that mean the remote shell multiplexer exited.
/// Seeing one is an explicit session-ended signal, distinct from an
/// unexpected socket close.
const EXIT_MARKERS: &[&str] = &["[exited]", "Session terminated"];

/// Initial client frame, sent as a type-`0` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "AuthToken", default)]
    pub auth_token: String,
    pub columns: u16,
    pub rows: u16,
}

/// Client resize request, sent as a type-`1` payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Resize {
    pub columns: u16,
    pub rows: u16,
}

/// Parse a frame as the client handshake, if it is one.
pub fn parse_handshake(frame: &[u8]) -> Option<Handshake> {
    let payload = frame.strip_prefix(&[TAG_DATA])?;
    serde_json::from_slice(payload).ok()
}

/// Parse a frame as a resize request, if it is one.
pub fn parse_resize(frame: &[u8]) -> Option<Resize> {
    let payload = frame.strip_prefix(&[TAG_TITLE])?;
    serde_json::from_slice(payload).ok()
}

/// Whether a server data frame announces that the remote session ended.
pub fn is_exit_notice(frame: &[u8]) -> bool {
    let Some(payload) = frame.strip_prefix(&[TAG_DATA]) else {
        return false;
    };
    let text = String::from_utf8_lossy(payload);
    EXIT_MARKERS.iter().any(|marker| text.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handshake_frame() {
        let frame = br#"0{"AuthToken":"","columns":120,"rows":40}"#;
        let handshake = parse_handshake(frame).unwrap();
        assert_eq!(handshake.columns, 120);
        assert_eq!(handshake.rows, 40);
        assert_eq!(handshake.auth_token, "");
    }

    #[test]
    fn handshake_requires_data_tag() {
        assert!(parse_handshake(br#"1{"AuthToken":"","columns":1,"rows":1}"#).is_none());
        assert!(parse_handshake(b"0not json").is_none());
        assert!(parse_handshake(b"").is_none());
    }

    #[test]
    fn parses_resize_frame() {
        let resize = parse_resize(br#"1{"columns":80,"rows":24}"#).unwrap();
        assert_eq!(resize.columns, 80);
        assert_eq!(resize.rows, 24);
    }

    #[test]
    fn detects_exit_notice_in_output() {
        assert!(is_exit_notice(b"0\r\n[exited]\r\n"));
        assert!(is_exit_notice(b"0Session terminated by server"));
        assert!(!is_exit_notice(b"0ls -la\r\n"));
        // Title frames never count, whatever they contain.
        assert!(!is_exit_notice(b"1[exited]"));
    }
}
