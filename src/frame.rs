//! Binary frame codec and text command vocabulary for the WebSocket tunnel.
//!
//! Binary messages carry a single tag byte at offset 0 followed by the raw
//! payload; text messages carry one ASCII command line. See the frame codec
//! component for the full vocabulary.

use crate::errors::FrameCodecError;
use bytes::{Bytes, BytesMut};

/// The four binary frame tags the tunnel understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    /// server -> device: RTSP bytes read from the loopback proxy.
    ProxyToDevice = 1,
    /// device -> server: RTSP bytes headed to the loopback proxy.
    DeviceToProxy = 2,
    /// server -> device: open the camera socket and begin relaying.
    Open = 3,
    /// server -> device: drop the camera socket.
    Close = 4,
}

impl FrameTag {
    fn from_u8(tag: u8) -> Result<Self, FrameCodecError> {
        match tag {
            1 => Ok(FrameTag::ProxyToDevice),
            2 => Ok(FrameTag::DeviceToProxy),
            3 => Ok(FrameTag::Open),
            4 => Ok(FrameTag::Close),
            other => Err(FrameCodecError::UnknownTag(other)),
        }
    }
}

/// A decoded binary frame: a tag plus whatever payload followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: FrameTag,
    pub payload: Bytes,
}

/// Encode `tag` and `payload` into a single binary WebSocket message.
pub fn encode(tag: FrameTag, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.extend_from_slice(&[tag as u8]);
    buf.extend_from_slice(payload);
    buf.to_vec()
}

/// Decode a binary WebSocket message into a [`Frame`]. Never panics; any
/// malformed input produces a [`FrameCodecError`] instead.
pub fn decode(data: &[u8]) -> Result<Frame, FrameCodecError> {
    let (tag_byte, rest) = data.split_first().ok_or(FrameCodecError::EmptyFrame)?;
    let tag = FrameTag::from_u8(*tag_byte)?;
    Ok(Frame {
        tag,
        payload: Bytes::copy_from_slice(rest),
    })
}

/// A parsed device <-> server text command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextCommand {
    /// Server -> device: the server is ready to receive `HELLO`.
    Ready,
    /// Server -> device: challenge nonce, base64 encoded.
    Chal(String),
    /// Server -> device: authentication succeeded.
    AuthOk,
    /// Server -> device: authentication failed, with a machine-readable reason.
    AuthFail(String),
    /// Server -> device: the HELLO line itself was rejected.
    HelloFail(String),
    /// Device -> server: `HELLO <deviceId>` or `HELLO <payloadId> <deviceId>`.
    Hello {
        payload_id: Option<String>,
        device_id: String,
    },
    /// Device -> server: `AUTH <deviceId> <sigB64>`.
    Auth { device_id: String, sig_b64: String },
}

impl TextCommand {
    /// Render the command as the exact wire text the peer expects.
    pub fn to_wire(&self) -> String {
        match self {
            TextCommand::Ready => "READY".to_string(),
            TextCommand::Chal(nonce) => format!("CHAL {nonce}"),
            TextCommand::AuthOk => "AUTH_OK".to_string(),
            TextCommand::AuthFail(reason) => format!("AUTH_FAIL {reason}"),
            TextCommand::HelloFail(reason) => format!("HELLO_FAIL {reason}"),
            TextCommand::Hello {
                payload_id,
                device_id,
            } => match payload_id {
                Some(pid) => format!("HELLO {pid} {device_id}"),
                None => format!("HELLO {device_id}"),
            },
            TextCommand::Auth { device_id, sig_b64 } => format!("AUTH {device_id} {sig_b64}"),
        }
    }
}

/// Parse a device-originated text line. The verb is matched
/// case-insensitively; arguments split on any run of whitespace. Unknown
/// verbs or malformed argument counts yield `None` and are ignored silently
/// by the caller, per the wire-protocol contract.
pub fn parse_text_command(line: &str) -> Option<TextCommand> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;

    match verb.to_ascii_uppercase().as_str() {
        "HELLO" => {
            let args: Vec<&str> = parts.collect();
            match args.len() {
                1 => Some(TextCommand::Hello {
                    payload_id: None,
                    device_id: args[0].to_string(),
                }),
                2 => Some(TextCommand::Hello {
                    payload_id: Some(args[0].to_string()),
                    device_id: args[1].to_string(),
                }),
                _ => None,
            }
        }
        "AUTH" => {
            let args: Vec<&str> = parts.collect();
            if args.len() != 2 {
                return None;
            }
            Some(TextCommand::Auth {
                device_id: args[0].to_string(),
                sig_b64: args[1].to_string(),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_round_trips_for_all_tags() {
        for tag in [
            FrameTag::ProxyToDevice,
            FrameTag::DeviceToProxy,
            FrameTag::Open,
            FrameTag::Close,
        ] {
            let payload = b"some rtsp bytes";
            let encoded = encode(tag, payload);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded.tag, tag);
            assert_eq!(decoded.payload.as_ref(), payload);
        }
    }

    #[test]
    fn open_and_close_carry_empty_payload() {
        let encoded = encode(FrameTag::Open, &[]);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.tag, FrameTag::Open);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn empty_buffer_is_rejected() {
        assert!(matches!(decode(&[]), Err(FrameCodecError::EmptyFrame)));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            decode(&[9, 1, 2, 3]),
            Err(FrameCodecError::UnknownTag(9))
        ));
    }

    #[test]
    fn parses_hello_without_payload_id() {
        assert_eq!(
            parse_text_command("hello devA"),
            Some(TextCommand::Hello {
                payload_id: None,
                device_id: "devA".to_string()
            })
        );
    }

    #[test]
    fn parses_hello_with_payload_id() {
        assert_eq!(
            parse_text_command("HELLO p1 devA"),
            Some(TextCommand::Hello {
                payload_id: Some("p1".to_string()),
                device_id: "devA".to_string()
            })
        );
    }

    #[test]
    fn parses_auth_case_insensitively() {
        assert_eq!(
            parse_text_command("AuTh devA c2lnbmF0dXJl"),
            Some(TextCommand::Auth {
                device_id: "devA".to_string(),
                sig_b64: "c2lnbmF0dXJl".to_string()
            })
        );
    }

    #[test]
    fn unknown_verb_is_ignored() {
        assert_eq!(parse_text_command("PING"), None);
    }

    #[test]
    fn malformed_argument_count_is_ignored() {
        assert_eq!(parse_text_command("HELLO a b c"), None);
        assert_eq!(parse_text_command("AUTH onlyonearg"), None);
    }

    #[test]
    fn whitespace_runs_are_collapsed() {
        assert_eq!(
            parse_text_command("HELLO    p1     devA"),
            Some(TextCommand::Hello {
                payload_id: Some("p1".to_string()),
                device_id: "devA".to_string()
            })
        );
    }

    #[test]
    fn server_to_device_wire_text_matches_spec() {
        assert_eq!(TextCommand::Ready.to_wire(), "READY");
        assert_eq!(TextCommand::Chal("abc".to_string()).to_wire(), "CHAL abc");
        assert_eq!(TextCommand::AuthOk.to_wire(), "AUTH_OK");
        assert_eq!(
            TextCommand::AuthFail("verify_failed".to_string()).to_wire(),
            "AUTH_FAIL verify_failed"
        );
    }
}
