//! strongSwan VICI control protocol.

pub mod client;
pub mod codec;
pub mod message;

pub use client::{DEFAULT_SOCKET, ViciClient};
pub use codec::{Packet, ViciCodec};
pub use message::{Element, Message};
