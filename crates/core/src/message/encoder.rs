//! Datagram codec: `[tag: u8][bincode((hub, payload))]`.
//!
//! The tag is stable per message type. Decoding dispatches on it to the concrete payload type.

use bytes::Bytes;

use super::types::*;
use super::Envelope;
use super::HubId;
use crate::error::Error;
use crate::error::Result;

/// Encode into a datagram.
pub trait Encoder {
    /// Encode.
    fn encode(&self) -> Result<Bytes>;
}

/// Decode from a datagram.
pub trait Decoder: Sized {
    /// Decode.
    fn from_encoded(encoded: &[u8]) -> Result<Self>;
}

macro_rules! wire_tags {
    ($($tag:literal => $variant:ident),* $(,)?) => {
        impl Message {
            /// Stable tag of the message type.
            pub fn tag(&self) -> u8 {
                match self {
                    $(Message::$variant(_) => $tag,)*
                }
            }

            /// Name of the message type, for logs.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Message::$variant(_) => stringify!($variant),)*
                }
            }
        }

        fn encode_body(hub: HubId, msg: &Message) -> Result<Vec<u8>> {
            match msg {
                $(Message::$variant(m) => bincode::serialize(&(hub, m)),)*
            }
            .map_err(Error::BincodeSerialize)
        }

        fn decode_body(tag: u8, body: &[u8]) -> Result<Envelope> {
            match tag {
                $($tag => {
                    let (hub, m): (HubId, $variant) =
                        bincode::deserialize(body).map_err(Error::BincodeDeserialize)?;
                    Ok(Envelope { hub, message: Message::$variant(m) })
                })*
                t => Err(Error::UnknownMessageTag(t)),
            }
        }
    };
}

wire_tags! {
    0x01 => JoinRequest,
    0x02 => JoinResponse,
    0x03 => NotifySuccessor,
    0x04 => GetPred,
    0x05 => Pred,
    0x06 => GetSuccessorList,
    0x07 => SuccessorList,
    0x08 => LivenessPing,
    0x09 => LivenessPong,
    0x0a => NeighborRequest,
    0x0b => NeighborResponse,
    0x0c => LeaveNotification,
    0x0d => LinkBreak,
    0x0e => LocalLBRequest,
    0x0f => LocalLBResponse,
    0x10 => StateHandover,
    0x11 => LeaveJoinLBRequest,
    0x12 => LeaveJoinDenial,
    0x13 => LeaveCheckRequest,
    0x14 => LeaveCheckResponse,
    0x20 => Publication,
    0x21 => Subscription,
    0x22 => LinearPublication,
    0x23 => LinearSubscription,
    0x24 => MatchedPublication,
    0x30 => BootstrapRequest,
    0x31 => BootstrapResponse,
    0x32 => HeartBeat,
    0x33 => AllJoined,
}

impl Encoder for Envelope {
    fn encode(&self) -> Result<Bytes> {
        let body = encode_body(self.hub, &self.message)?;
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(self.message.tag());
        out.extend_from_slice(&body);
        Ok(Bytes::from(out))
    }
}

impl Decoder for Envelope {
    fn from_encoded(encoded: &[u8]) -> Result<Self> {
        let (tag, body) = encoded.split_first().ok_or(Error::EmptyFrame)?;
        decode_body(*tag, body)
    }
}
