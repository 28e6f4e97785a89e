//! Overlay wire format.
//!
//! Every datagram is an [`Envelope`]: a cleartext routing header followed by
//! an armed message. Relays only read and rewrite the header.
//!
//! ```text
//! +-----------+------------+-----+------------+---------------+-------------+
//! | Magic 4B  | Network 4B | Hop | Sender 32B | Recipient 32B | Armed ...   |
//! +-----------+------------+-----+------------+---------------+-------------+
//! ```
//!
//! The armed message decrypts to an `ArmMessage`, whose application payload
//! is a [`DiscoveryMessage`]:
//!
//! ```text
//! +------+---------------------------------------------------+
//! | Type | Body                                              |
//! | 0x10 | time u64 | children time u64                      |
//! | 0x11 | time u64                                          |
//! | 0x12 | address 32B | family 1B | ip 4B/16B | port u16    |
//! | 0x13 | payload                                           |
//! +------+---------------------------------------------------+
//! ```
//!
//! Integers are big endian.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::arm::ArmedMessage;
use crate::core::{
    CodecError, DISCOVERY_TYPE_ACKNOWLEDGEMENT, DISCOVERY_TYPE_APPLICATION, DISCOVERY_TYPE_HELLO,
    DISCOVERY_TYPE_UNITE, ENVELOPE_HEADER_SIZE, ENVELOPE_MAGIC, PUBLIC_KEY_SIZE,
};
use crate::crypto::IdentityPublicKey;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Message exchanged by the discovery handlers, or application data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    /// Ping. `children_time > 0` asks a super peer to take us as a child.
    Hello {
        /// Sender's clock when sending.
        time: u64,
        /// Non-zero when joining as a child.
        children_time: u64,
    },

    /// Pong echoing the hello time.
    Acknowledgement {
        /// Time of the acknowledged hello.
        time: u64,
    },

    /// Rendezvous: `address` is reachable at `socket_addr`.
    Unite {
        /// Peer to contact directly.
        address: IdentityPublicKey,
        /// Public endpoint of that peer as seen by the super peer.
        socket_addr: SocketAddr,
    },

    /// Application payload.
    Application(Vec<u8>),
}

impl DiscoveryMessage {
    /// Message type byte.
    pub fn message_type(&self) -> u8 {
        match self {
            Self::Hello { .. } => DISCOVERY_TYPE_HELLO,
            Self::Acknowledgement { .. } => DISCOVERY_TYPE_ACKNOWLEDGEMENT,
            Self::Unite { .. } => DISCOVERY_TYPE_UNITE,
            Self::Application(_) => DISCOVERY_TYPE_APPLICATION,
        }
    }

    /// Whether this is a protocol message rather than application data.
    pub fn is_discovery(&self) -> bool {
        !matches!(self, Self::Application(_))
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.message_type()];
        match self {
            Self::Hello {
                time,
                children_time,
            } => {
                buf.extend_from_slice(&time.to_be_bytes());
                buf.extend_from_slice(&children_time.to_be_bytes());
            }
            Self::Acknowledgement { time } => buf.extend_from_slice(&time.to_be_bytes()),
            Self::Unite {
                address,
                socket_addr,
            } => {
                buf.extend_from_slice(address.as_bytes());
                encode_socket_addr(socket_addr, &mut buf);
            }
            Self::Application(payload) => buf.extend_from_slice(payload),
        }
        buf
    }

    /// Decode from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data);
        let msg_type = reader.u8()?;

        match msg_type {
            DISCOVERY_TYPE_HELLO => Ok(Self::Hello {
                time: reader.u64()?,
                children_time: reader.u64()?,
            }),
            DISCOVERY_TYPE_ACKNOWLEDGEMENT => Ok(Self::Acknowledgement {
                time: reader.u64()?,
            }),
            DISCOVERY_TYPE_UNITE => {
                let address = IdentityPublicKey::from_bytes(reader.array()?);
                let socket_addr = decode_socket_addr(&mut reader)?;
                Ok(Self::Unite {
                    address,
                    socket_addr,
                })
            }
            DISCOVERY_TYPE_APPLICATION => Ok(Self::Application(reader.rest().to_vec())),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

/// Discovery message queued by a handler for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Overlay recipient.
    pub recipient: IdentityPublicKey,
    /// Address to send the envelope to.
    pub addr: SocketAddr,
    /// Message to arm and send.
    pub message: DiscoveryMessage,
}

fn encode_socket_addr(addr: &SocketAddr, buf: &mut Vec<u8>) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(FAMILY_V4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(FAMILY_V6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

fn decode_socket_addr(reader: &mut Reader<'_>) -> Result<SocketAddr, CodecError> {
    let ip = match reader.u8()? {
        FAMILY_V4 => IpAddr::V4(Ipv4Addr::from(reader.array::<4>()?)),
        FAMILY_V6 => IpAddr::V6(Ipv6Addr::from(reader.array::<16>()?)),
        _ => return Err(CodecError::InvalidAddress),
    };
    let port = u16::from_be_bytes(reader.array()?);
    Ok(SocketAddr::new(ip, port))
}

/// Routing header plus armed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Overlay network id.
    pub network_id: i32,
    /// Number of relays taken so far.
    pub hop_count: u8,
    /// Originator.
    pub sender: IdentityPublicKey,
    /// Final recipient.
    pub recipient: IdentityPublicKey,
    /// Encrypted content.
    pub armed: ArmedMessage,
}

impl Envelope {
    /// Encoded size.
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_HEADER_SIZE + self.armed.encoded_len()
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&ENVELOPE_MAGIC.to_be_bytes());
        buf.extend_from_slice(&self.network_id.to_be_bytes());
        buf.push(self.hop_count);
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(self.recipient.as_bytes());
        self.armed.encode_into(&mut buf);
        buf
    }

    /// Decode from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data);
        let magic = u32::from_be_bytes(reader.array()?);
        if magic != ENVELOPE_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        let network_id = i32::from_be_bytes(reader.array()?);
        let hop_count = reader.u8()?;
        let sender = IdentityPublicKey::from_bytes(reader.array::<PUBLIC_KEY_SIZE>()?);
        let recipient = IdentityPublicKey::from_bytes(reader.array::<PUBLIC_KEY_SIZE>()?);
        let armed = ArmedMessage::decode(reader.rest())?;

        Ok(Self {
            network_id,
            hop_count,
            sender,
            recipient,
            armed,
        })
    }
}

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let end = self.pos + N;
        let bytes = self.data.get(self.pos..end).ok_or(CodecError::TooShort {
            expected: end,
            actual: self.data.len(),
        })?;
        self.pos = end;
        bytes.try_into().map_err(|_| CodecError::TooShort {
            expected: end,
            actual: self.data.len(),
        })
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.array::<1>()?[0])
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }
}
