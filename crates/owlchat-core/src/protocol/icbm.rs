//! Instant message block
//!
//! Channel-1 messages carry their text inside TLV 0x0002 as a list of
//! fragments: `id u8, version u8, length u16, data`. Fragment 0x05 lists
//! required features; fragment 0x01 holds `charset u16, subset u16, text`.

use rand_core::{OsRng, RngCore};

use crate::errors::{OwlchatError, Result};
use crate::protocol::bytes::{check_u16_len, ByteReader, WireWrite};

pub const FRAGMENT_FEATURES: u8 = 0x05;
pub const FRAGMENT_TEXT: u8 = 0x01;

pub const CHARSET_ASCII: u16 = 0x0000;
pub const CHARSET_UNICODE: u16 = 0x0002;
pub const CHARSET_LATIN1: u16 = 0x0003;

pub const TLV_MESSAGE_BLOCK: u16 = 0x0002;
pub const TLV_ACK_REQUESTED: u16 = 0x0003;
pub const TLV_AUTO_RESPONSE: u16 = 0x0004;
pub const TLV_STORE_OFFLINE: u16 = 0x0006;

/// Plain IM channel
pub const CHANNEL_IM: u16 = 0x0001;
/// Rendezvous proposals (file transfer, chat invites)
pub const CHANNEL_RENDEZVOUS: u16 = 0x0002;
/// Chat room messages
pub const CHANNEL_CHAT: u16 = 0x0003;

/// Fresh random message cookie
pub fn new_message_cookie() -> [u8; 8] {
    let mut cookie = [0u8; 8];
    OsRng.fill_bytes(&mut cookie);
    cookie
}

/// Decoded message text and how it was encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageText {
    pub text: String,
    pub charset: u16,
}

/// Charset and bytes for outgoing text: ASCII when possible, else UCS-2BE
pub fn encode_text(text: &str) -> (u16, Vec<u8>) {
    if text.is_ascii() {
        (CHARSET_ASCII, text.as_bytes().to_vec())
    } else {
        let bytes = text
            .encode_utf16()
            .flat_map(|unit| unit.to_be_bytes())
            .collect();
        (CHARSET_UNICODE, bytes)
    }
}

/// Text from wire bytes in the given charset
pub fn decode_text(charset: u16, bytes: &[u8]) -> String {
    match charset {
        CHARSET_UNICODE => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        CHARSET_LATIN1 => bytes.iter().map(|&b| char::from(b)).collect(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Build the TLV 0x0002 value for `text`
pub fn encode_message_block(text: &str) -> Result<Vec<u8>> {
    let (charset, bytes) = encode_text(text);
    check_u16_len("message text", &bytes)?;

    let mut block = Vec::with_capacity(bytes.len() + 13);
    block.put_u8(FRAGMENT_FEATURES);
    block.put_u8(0x01);
    block.put_u16_prefixed(&[0x01]);

    block.put_u8(FRAGMENT_TEXT);
    block.put_u8(0x01);
    block.put_u16((bytes.len() + 4) as u16);
    block.put_u16(charset);
    block.put_u16(0x0000);
    block.put_bytes(&bytes);
    Ok(block)
}

/// Extract the text fragment from a TLV 0x0002 value
pub fn decode_message_block(block: &[u8]) -> Result<MessageText> {
    let mut reader = ByteReader::new(block, "message block");
    while !reader.is_empty() {
        let id = reader.read_u8()?;
        let _version = reader.read_u8()?;
        let data = reader.read_u16_prefixed()?;
        if id == FRAGMENT_TEXT {
            let mut text = ByteReader::new(data, "message text");
            let charset = text.read_u16()?;
            let _subset = text.read_u16()?;
            return Ok(MessageText {
                text: decode_text(charset, text.rest()),
                charset,
            });
        }
    }
    Err(OwlchatError::malformed("message block", "no text fragment"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_block_layout() {
        let block = encode_message_block("hi").unwrap();
        assert_eq!(
            block,
            vec![
                0x05, 0x01, 0x00, 0x01, 0x01, // features
                0x01, 0x01, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, b'h', b'i',
            ]
        );
        let decoded = decode_message_block(&block).unwrap();
        assert_eq!(decoded.text, "hi");
        assert_eq!(decoded.charset, CHARSET_ASCII);
    }

    #[test]
    fn test_unicode_text() {
        let block = encode_message_block("héllo").unwrap();
        let decoded = decode_message_block(&block).unwrap();
        assert_eq!(decoded.text, "héllo");
        assert_eq!(decoded.charset, CHARSET_UNICODE);
    }

    #[test]
    fn test_latin1_decode() {
        assert_eq!(decode_text(CHARSET_LATIN1, &[0x63, 0x61, 0x66, 0xe9]), "café");
    }

    #[test]
    fn test_missing_text_fragment() {
        assert!(decode_message_block(&[0x05, 0x01, 0x00, 0x01, 0x01]).is_err());
    }
}
