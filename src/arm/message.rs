//! Arm layer wire format.
//!
//! Plaintext (inside the AEAD):
//!
//! ```text
//! +------+------------------------------------+
//! | Type | Body                               |
//! | 1B   | 0x01: payload                      |
//! |      | 0x02: key agreement public key 32B |
//! |      | 0x03: agreement id 32B             |
//! +------+------------------------------------+
//! ```
//!
//! Armed message (outside):
//!
//! ```text
//! +------------------+-------------+----------------------+
//! | Agreement ID 32B | Nonce 24B   | Ciphertext + tag 16B |
//! +------------------+-------------+----------------------+
//! ```

use crate::core::{
    AEAD_NONCE_SIZE, AEAD_TAG_SIZE, AGREEMENT_ID_SIZE, ARM_TYPE_ACKNOWLEDGEMENT,
    ARM_TYPE_APPLICATION, ARM_TYPE_KEY_EXCHANGE, ARMED_HEADER_SIZE, CodecError, PUBLIC_KEY_SIZE,
};
use crate::crypto::KeyAgreementPublicKey;

use super::agreement::AgreementId;

/// Decrypted content of an armed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmMessage {
    /// Opaque payload for the layer above.
    Application(Vec<u8>),
    /// Sender's ephemeral key for a new agreement.
    KeyExchange(KeyAgreementPublicKey),
    /// Sender derived the agreement with this id.
    Acknowledgement(AgreementId),
}

impl ArmMessage {
    /// Message type byte.
    pub fn message_type(&self) -> u8 {
        match self {
            Self::Application(_) => ARM_TYPE_APPLICATION,
            Self::KeyExchange(_) => ARM_TYPE_KEY_EXCHANGE,
            Self::Acknowledgement(_) => ARM_TYPE_ACKNOWLEDGEMENT,
        }
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let body: &[u8] = match self {
            Self::Application(payload) => payload,
            Self::KeyExchange(key) => key.as_bytes(),
            Self::Acknowledgement(id) => id.as_bytes(),
        };

        let mut buf = Vec::with_capacity(1 + body.len());
        buf.push(self.message_type());
        buf.extend_from_slice(body);
        buf
    }

    /// Decode from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let (&msg_type, body) = data.split_first().ok_or(CodecError::TooShort {
            expected: 1,
            actual: 0,
        })?;

        match msg_type {
            ARM_TYPE_APPLICATION => Ok(Self::Application(body.to_vec())),
            ARM_TYPE_KEY_EXCHANGE => {
                let key: [u8; PUBLIC_KEY_SIZE] = exact(body)?;
                Ok(Self::KeyExchange(KeyAgreementPublicKey::from_bytes(key)))
            }
            ARM_TYPE_ACKNOWLEDGEMENT => {
                let id: [u8; AGREEMENT_ID_SIZE] = exact(body)?;
                Ok(Self::Acknowledgement(AgreementId::from_bytes(id)))
            }
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

fn exact<const N: usize>(body: &[u8]) -> Result<[u8; N], CodecError> {
    if body.len() < N {
        return Err(CodecError::TooShort {
            expected: 1 + N,
            actual: 1 + body.len(),
        });
    }
    body[..N].try_into().map_err(|_| CodecError::InvalidKey)
}

/// Encrypted message as produced by the arm engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedMessage {
    /// Agreement whose key sealed the message.
    pub agreement_id: AgreementId,
    /// AEAD nonce.
    pub nonce: [u8; AEAD_NONCE_SIZE],
    /// Ciphertext with tag.
    pub ciphertext: Vec<u8>,
}

impl ArmedMessage {
    /// Minimum encoded size (header plus tag).
    pub const MIN_SIZE: usize = ARMED_HEADER_SIZE + AEAD_TAG_SIZE;

    /// Encoded size.
    pub fn encoded_len(&self) -> usize {
        ARMED_HEADER_SIZE + self.ciphertext.len()
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.agreement_id.as_bytes());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.ciphertext);
    }

    /// Decode from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::MIN_SIZE {
            return Err(CodecError::TooShort {
                expected: Self::MIN_SIZE,
                actual: data.len(),
            });
        }

        let (id, rest) = data.split_at(AGREEMENT_ID_SIZE);
        let (nonce, ciphertext) = rest.split_at(AEAD_NONCE_SIZE);

        Ok(Self {
            agreement_id: AgreementId::from_bytes(
                id.try_into().map_err(|_| CodecError::InvalidAgreementId)?,
            ),
            nonce: nonce.try_into().map_err(|_| CodecError::InvalidAgreementId)?,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_encoding() {
        let msg = ArmMessage::Application(b"hi".to_vec());
        assert_eq!(msg.encode(), vec![ARM_TYPE_APPLICATION, b'h', b'i']);
        assert_eq!(ArmMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_key_exchange_decode() {
        let mut data = vec![ARM_TYPE_KEY_EXCHANGE];
        data.extend_from_slice(&[9; 32]);

        assert_eq!(
            ArmMessage::decode(&data).unwrap(),
            ArmMessage::KeyExchange(KeyAgreementPublicKey::from_bytes([9; 32]))
        );
    }

    #[test]
    fn test_truncated_acknowledgement() {
        let data = [ARM_TYPE_ACKNOWLEDGEMENT, 1, 2, 3];
        assert_eq!(
            ArmMessage::decode(&data),
            Err(CodecError::TooShort {
                expected: 33,
                actual: 4
            })
        );
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(
            ArmMessage::decode(&[0x7f]),
            Err(CodecError::UnknownMessageType(0x7f))
        );
        assert!(matches!(
            ArmMessage::decode(&[]),
            Err(CodecError::TooShort { .. })
        ));
    }

    #[test]
    fn test_armed_message_layout() {
        let armed = ArmedMessage {
            agreement_id: AgreementId::from_bytes([1; 32]),
            nonce: [2; AEAD_NONCE_SIZE],
            ciphertext: vec![3; AEAD_TAG_SIZE + 4],
        };
        let bytes = armed.encode();

        assert_eq!(bytes.len(), armed.encoded_len());
        assert_eq!(&bytes[..32], &[1; 32]);
        assert_eq!(&bytes[32..56], &[2; 24]);
        assert_eq!(ArmedMessage::decode(&bytes).unwrap(), armed);
    }

    #[test]
    fn test_armed_message_too_short() {
        let result = ArmedMessage::decode(&[0u8; ArmedMessage::MIN_SIZE - 1]);
        assert!(matches!(result, Err(CodecError::TooShort { .. })));
    }
}
