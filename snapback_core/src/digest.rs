//! The digest type used by snapback (SHA-256, 32 bytes, lowercase hex).

use std::{borrow::Borrow, fmt, str::FromStr};

use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::READ_SIZE;

/// Digest type used by snapback (SHA-256, 32 bytes).
///
/// The lowercase hex rendering of a digest is also the object's key in the
/// store, so `Display` and `FromStr` are part of the protocol.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// The digest of the empty byte sequence (`b""`).
    ///
    /// Reserved as the content id of pipes and sockets, which carry no bytes.
    pub const EMPTY: Digest = Digest([
        0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9,
        0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52,
        0xb8, 0x55,
    ]);

    /// Calculate the digest of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(buf.as_ref());
        Digest(hasher.finalize().into())
    }

    /// Bytes of the digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `Digest` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convert the digest to its lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hex string limited to the first 5 bytes for a friendly
    /// representation of the digest in logs.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }

    /// Stream `reader` to EOF, returning the digest of everything read.
    pub async fn from_reader<R>(reader: &mut R) -> std::io::Result<Digest>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut hasher = Hasher::new();
        let mut buf = vec![0u8; READ_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| crate::Error::InvalidArguments(format!("invalid digest: {s:?}")))?;
        Ok(Digest(bytes))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8; 32]> for Digest {
    fn borrow(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Digest {
    fn from(value: [u8; 32]) -> Self {
        Digest(value)
    }
}

impl From<Digest> for [u8; 32] {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> = serde::Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental digest computation over streamed chunks.
#[derive(Default)]
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Hasher(Sha256::new())
    }

    pub fn update(&mut self, bytes: impl AsRef<[u8]>) {
        self.0.update(bytes.as_ref());
    }

    pub fn finalize(self) -> Digest {
        Digest(self.0.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_matches_reserved_constant() {
        assert_eq!(Digest::new(b""), Digest::EMPTY);
        assert_eq!(
            Digest::EMPTY.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn known_content_digest() {
        assert_eq!(
            Digest::new(b"Hello World").to_hex(),
            "a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e"
        );
    }

    #[test]
    fn hex_round_trip() {
        let digest = Digest::new(b"round trip");
        let parsed: Digest = digest.to_hex().parse().unwrap();
        assert_eq!(digest, parsed);
        assert!("not-a-digest".parse::<Digest>().is_err());
    }

    #[tokio::test]
    async fn reader_digest_matches_buffer_digest() {
        let content = vec![7u8; 3 * 1024 * 1024 + 17];
        let mut reader = std::io::Cursor::new(content.clone());
        let streamed = Digest::from_reader(&mut reader).await.unwrap();
        assert_eq!(streamed, Digest::new(&content));
    }
}
