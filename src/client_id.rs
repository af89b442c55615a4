//! Client identifiers used to correlate a client across requests.
//!
//! Taken from Option 61 when the client sends one, otherwise from the
//! 16-byte `chaddr` header field. Short identifiers (the common case) are
//! stored inline; longer ones spill to the heap.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Identifiers up to this many bytes are stored without allocating.
pub const INLINE_CAPACITY: usize = 16;

/// Maximum identifier length (the option length field is one byte).
pub const MAX_LENGTH: usize = 255;

/// An immutable byte key identifying a DHCP client.
///
/// Equality and hashing are byte-wise, independent of storage.
#[derive(Clone)]
pub enum ClientIdentifier {
    Inline { bytes: [u8; INLINE_CAPACITY], len: u8 },
    Heap(Box<[u8]>),
}

impl ClientIdentifier {
    /// Builds an identifier from raw bytes, truncating to [`MAX_LENGTH`].
    pub fn new(data: &[u8]) -> Self {
        let data = &data[..data.len().min(MAX_LENGTH)];
        if data.len() <= INLINE_CAPACITY {
            let mut bytes = [0u8; INLINE_CAPACITY];
            bytes[..data.len()].copy_from_slice(data);
            Self::Inline {
                bytes,
                len: data.len() as u8,
            }
        } else {
            Self::Heap(data.into())
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Inline { bytes, len } => &bytes[..*len as usize],
            Self::Heap(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Parses the colon-separated hex form produced by `Display`.
    pub fn from_hex(text: &str) -> Option<Self> {
        if text.is_empty() {
            return Some(Self::new(&[]));
        }
        let bytes = text
            .split(':')
            .map(|part| u8::from_str_radix(part, 16).ok())
            .collect::<Option<Vec<u8>>>()?;
        if bytes.len() > MAX_LENGTH {
            return None;
        }
        Some(Self::new(&bytes))
    }
}

impl PartialEq for ClientIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ClientIdentifier {}

impl Hash for ClientIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl From<&[u8]> for ClientIdentifier {
    fn from(data: &[u8]) -> Self {
        Self::new(data)
    }
}

impl fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.as_bytes().iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ClientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientIdentifier({})", self)
    }
}

impl Serialize for ClientIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClientIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text)
            .ok_or_else(|| de::Error::custom(format!("invalid client identifier: {}", text)))
    }
}
