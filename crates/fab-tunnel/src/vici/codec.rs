//! VICI packet framing.
//!
//! Each packet is a big-endian `u32` length followed by a packet type byte,
//! an optional length-prefixed name and an optional message body.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, put_name, take_name};
use crate::error::{Result, TunnelError};

/// Largest packet accepted from the daemon.
pub const MAX_PACKET_SIZE: usize = 512 * 1024;

const CMD_REQUEST: u8 = 0;
const CMD_RESPONSE: u8 = 1;
const CMD_UNKNOWN: u8 = 2;
const EVENT_REGISTER: u8 = 3;
const EVENT_UNREGISTER: u8 = 4;
const EVENT_CONFIRM: u8 = 5;
const EVENT_UNKNOWN: u8 = 6;
const EVENT: u8 = 7;

/// A VICI packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Named command request.
    CmdRequest {
        /// Command name.
        command: String,
        /// Command arguments.
        message: Message,
    },
    /// Response to a command.
    CmdResponse(Message),
    /// The command is not known.
    CmdUnknown,
    /// Register for a named event.
    EventRegister(String),
    /// Unregister from a named event.
    EventUnregister(String),
    /// (Un)registration succeeded.
    EventConfirm,
    /// The event is not known.
    EventUnknown,
    /// A named event with payload.
    Event {
        /// Event name.
        name: String,
        /// Event payload.
        message: Message,
    },
}

/// Codec for [`Packet`]s over a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct ViciCodec;

impl Decoder for ViciCodec {
    type Item = Packet;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 || len > MAX_PACKET_SIZE {
            return Err(TunnelError::Malformed(format!("invalid packet length {len}")));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(len);
        let mut body: &[u8] = &frame;
        let packet_type = body.get_u8();

        let packet = match packet_type {
            CMD_REQUEST => {
                let command = take_name(&mut body)?;
                Packet::CmdRequest {
                    command,
                    message: Message::decode(body)?,
                }
            }
            CMD_RESPONSE => Packet::CmdResponse(Message::decode(body)?),
            CMD_UNKNOWN => Packet::CmdUnknown,
            EVENT_REGISTER => Packet::EventRegister(take_name(&mut body)?),
            EVENT_UNREGISTER => Packet::EventUnregister(take_name(&mut body)?),
            EVENT_CONFIRM => Packet::EventConfirm,
            EVENT_UNKNOWN => Packet::EventUnknown,
            EVENT => {
                let name = take_name(&mut body)?;
                Packet::Event {
                    name,
                    message: Message::decode(body)?,
                }
            }
            other => return Err(TunnelError::Malformed(format!("unknown packet type {other}"))),
        };

        Ok(Some(packet))
    }
}

impl Encoder<Packet> for ViciCodec {
    type Error = TunnelError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        match &packet {
            Packet::CmdRequest { command, message } => {
                body.put_u8(CMD_REQUEST);
                put_name(&mut body, command)?;
                message.encode(&mut body)?;
            }
            Packet::CmdResponse(message) => {
                body.put_u8(CMD_RESPONSE);
                message.encode(&mut body)?;
            }
            Packet::CmdUnknown => body.put_u8(CMD_UNKNOWN),
            Packet::EventRegister(name) => {
                body.put_u8(EVENT_REGISTER);
                put_name(&mut body, name)?;
            }
            Packet::EventUnregister(name) => {
                body.put_u8(EVENT_UNREGISTER);
                put_name(&mut body, name)?;
            }
            Packet::EventConfirm => body.put_u8(EVENT_CONFIRM),
            Packet::EventUnknown => body.put_u8(EVENT_UNKNOWN),
            Packet::Event { name, message } => {
                body.put_u8(EVENT);
                put_name(&mut body, name)?;
                message.encode(&mut body)?;
            }
        }

        if body.len() > MAX_PACKET_SIZE {
            return Err(TunnelError::Malformed(format!(
                "packet of {} bytes exceeds limit",
                body.len()
            )));
        }

        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        ViciCodec.encode(packet, &mut buf).expect("encode");
        buf
    }

    #[test]
    fn test_register_frame_layout() {
        let buf = encode(Packet::EventRegister("list-sa".to_string()));
        assert_eq!(&buf[..4], &[0, 0, 0, 9]);
        assert_eq!(buf[4], EVENT_REGISTER);
        assert_eq!(buf[5], 7);
        assert_eq!(&buf[6..], b"list-sa");
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let full = encode(Packet::CmdRequest {
            command: "get-conns".to_string(),
            message: Message::new(),
        });

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(ViciCodec.decode(&mut partial).expect("decode"), None);

        partial.extend_from_slice(&full[full.len() - 1..]);
        let packet = ViciCodec.decode(&mut partial).expect("decode").expect("packet");
        assert!(matches!(packet, Packet::CmdRequest { command, .. } if command == "get-conns"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut buf = encode(Packet::EventConfirm);
        buf.extend_from_slice(&encode(Packet::CmdResponse(
            Message::new().with_value("success", "yes"),
        )));

        assert_eq!(
            ViciCodec.decode(&mut buf).expect("decode"),
            Some(Packet::EventConfirm)
        );
        let response = ViciCodec.decode(&mut buf).expect("decode").expect("packet");
        let Packet::CmdResponse(message) = response else {
            panic!("expected response");
        };
        assert_eq!(message.get_str("success").as_deref(), Some("yes"));
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut buf = BytesMut::from(&[0xff, 0xff, 0xff, 0xff, 0][..]);
        assert!(ViciCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut buf = BytesMut::from(&[0, 0, 0, 1, 42][..]);
        assert!(matches!(ViciCodec.decode(&mut buf), Err(TunnelError::Malformed(_))));
    }
}
