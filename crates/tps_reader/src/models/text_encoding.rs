use encoding::label::encoding_from_whatwg_label;
use encoding::{DecoderTrap, EncoderTrap, EncodingRef};
use std::fmt;

use crate::errors::{TpsError, TpsResult};

/// Label used when the caller does not name an encoding
pub const DEFAULT_ENCODING_LABEL: &str = "windows-1251";

/// Single-byte text encoding used for names and string fields
#[derive(Clone, Copy)]
pub struct TextEncoding {
    inner: EncodingRef,
}

impl TextEncoding {
    /// Resolve a WHATWG label such as `cp1251`, `windows-1252` or `latin1`
    pub fn from_label(label: &str) -> TpsResult<Self> {
        encoding_from_whatwg_label(label.trim())
            .map(|inner| TextEncoding { inner })
            .ok_or_else(|| TpsError::UnknownEncoding(label.to_string()))
    }

    pub fn latin1() -> Self {
        TextEncoding {
            inner: encoding::all::ISO_8859_1,
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    /// Decode bytes, replacing anything the encoding cannot map
    pub fn decode_lossy(&self, input: &[u8]) -> String {
        self.inner
            .decode(input, DecoderTrap::Replace)
            .unwrap_or_else(|_| String::from_utf8_lossy(input).into_owned())
    }

    /// Encode text, replacing characters the encoding cannot represent
    pub fn encode_lossy(&self, input: &str) -> Vec<u8> {
        self.inner
            .encode(input, EncoderTrap::Replace)
            .unwrap_or_else(|_| input.bytes().collect())
    }
}

impl Default for TextEncoding {
    fn default() -> Self {
        TextEncoding {
            inner: encoding::all::WINDOWS_1251,
        }
    }
}

impl fmt::Debug for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TextEncoding").field(&self.name()).finish()
    }
}

impl PartialEq for TextEncoding {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_resolve() {
        assert_eq!(TextEncoding::from_label("cp1251").unwrap().name(), "windows-1251");
        assert_eq!(TextEncoding::from_label(" windows-1252 ").unwrap().name(), "windows-1252");
        assert!(TextEncoding::from_label("not-an-encoding").is_err());
    }

    #[test]
    fn test_cyrillic_round_trip() {
        let enc = TextEncoding::default();
        let bytes = enc.encode_lossy("Привет");
        assert_eq!(bytes.len(), 6);
        assert_eq!(enc.decode_lossy(&bytes), "Привет");
    }

    #[test]
    fn test_latin1_accents() {
        let enc = TextEncoding::latin1();
        assert_eq!(enc.decode_lossy(&[0x63, 0x61, 0x66, 0xE9]), "café");
        assert_eq!(enc.encode_lossy("café"), vec![0x63, 0x61, 0x66, 0xE9]);
    }
}
