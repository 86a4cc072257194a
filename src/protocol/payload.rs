//! Typed payloads carried inside frames.
//!
//! Frames carry opaque bytes. Applications that exchange structured messages can use [`encode`]
//! and [`decode`], which serialize with bincode using a big-endian, fixed-width integer layout.
use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("failed to encode payload: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode payload: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("{0} unexpected trailing bytes in payload")]
    Trailing(usize),
}

fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

pub fn encode<M: Encode>(message: &M) -> Result<Vec<u8>, PayloadError> {
    Ok(bincode::encode_to_vec(message, config())?)
}

/// Decodes a whole payload; bytes left over after the message are treated as malformed input.
pub fn decode<M: Decode<()>>(bytes: &[u8]) -> Result<M, PayloadError> {
    let (message, read) = bincode::decode_from_slice(bytes, config())?;
    if read != bytes.len() {
        return Err(PayloadError::Trailing(bytes.len() - read));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Encode, Decode, PartialEq, Eq)]
    enum Chat {
        Join { name: String },
        Say(String),
        Leave,
    }

    #[test]
    fn typed_message() {
        let bytes = encode(&Chat::Join {
            name: "ferris".to_string(),
        })
        .unwrap();
        let chat: Chat = decode(&bytes).unwrap();

        assert_eq!(
            chat,
            Chat::Join {
                name: "ferris".to_string()
            }
        );
    }

    #[test]
    fn integers_are_fixed_width_big_endian() {
        assert_eq!(encode(&1u32).unwrap(), vec![0, 0, 0, 1]);
        assert_eq!(encode(&Chat::Leave).unwrap(), vec![0, 0, 0, 2]);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode(&Chat::Say("hi".to_string())).unwrap();
        bytes.push(0);

        assert!(matches!(
            decode::<Chat>(&bytes),
            Err(PayloadError::Trailing(1))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode::<Chat>(&[0xff; 4]),
            Err(PayloadError::Deserialize(_))
        ));
    }
}
