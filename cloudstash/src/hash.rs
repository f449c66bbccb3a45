//! Content fingerprints used to decide whether a local copy equals what is stored remotely.
//!
//! All hashes are SHA-512. When uploading, the hash is embedded as object metadata under
//! [HASH_METADATA_KEY] so that later reads can compare true content hashes instead of vendor
//! etags.

use crate::error::{IoPathResult, WithPath};
use chrono::{DateTime, Utc};
use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use sha2::{Digest, Sha512};
use std::fmt::{Debug, Display, Formatter};
use std::fs::File;
use std::io;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

/// Object metadata key under which the content hash is stored remotely.
pub const HASH_METADATA_KEY: &str = "cloudstash-sha512";

/// Size of a [ContentHash] in bytes.
pub const CONTENT_HASH_SIZE: usize = 64;

/// A SHA-512 digest of some payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; CONTENT_HASH_SIZE]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; CONTENT_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    /// Parses a hex string (either case).
    pub fn from_hex(hex: &str) -> Result<Self, InvalidContentHash> {
        let bytes = HEXLOWER_PERMISSIVE
            .decode(hex.trim().as_bytes())
            .map_err(|_| InvalidContentHash(hex.to_string()))?;
        let bytes: [u8; CONTENT_HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| InvalidContentHash(hex.to_string()))?;
        Ok(Self(bytes))
    }

    /// A stand-in fingerprint for remote objects that carry no embedded hash.
    ///
    /// It changes whenever any of the inputs change, but two equal substitutes are no proof of
    /// equal content. The modification time is truncated to whole seconds.
    pub fn substitute(
        bucket: &str,
        key: &str,
        size: u64,
        last_modified: DateTime<Utc>,
        etag: &str,
    ) -> Self {
        let mut hasher = IdentityHasher::new();
        hasher.update(bucket.as_bytes());
        hasher.update(b"\0");
        hasher.update(key.as_bytes());
        hasher.update(b"\0");
        hasher.update(size.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(last_modified.timestamp().to_string().as_bytes());
        if !etag.is_empty() {
            hasher.update(b"\0");
            hasher.update(etag.as_bytes());
        }
        hasher.finalize()
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Debug for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl FromStr for ContentHash {
    type Err = InvalidContentHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("not a SHA-512 hex digest: {0:?}")]
pub struct InvalidContentHash(String);

/// Incremental hasher producing a [ContentHash].
#[derive(Clone, Default)]
pub struct IdentityHasher {
    inner: Sha512,
}

impl IdentityHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    pub fn finalize(self) -> ContentHash {
        let digest = self.inner.finalize();
        let mut bytes = [0; CONTENT_HASH_SIZE];
        bytes.copy_from_slice(&digest);
        ContentHash(bytes)
    }
}

impl Write for IdentityHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = IdentityHasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub fn hash_reader(mut reader: impl Read) -> io::Result<ContentHash> {
    let mut hasher = IdentityHasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize())
}

pub fn hash_file(path: impl AsRef<Path>) -> IoPathResult<ContentHash> {
    let path = path.as_ref();
    let file = File::open(path).with_path(path)?;
    hash_reader(io::BufReader::new(file)).with_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HELLO_WORLD_SHA512: &str = "309ecc489c12d6eb4cc40f50c902f2b4d0ed77ee511a7c7a9bcd3ca86d4cd86f989dd35bc5ff499670da34255b45b0cfd830e81f605dcf7dc5542e93ae9cd76f";

    #[test]
    fn test_hash_bytes_matches_known_digest() {
        assert_eq!(hash_bytes(b"hello world").to_hex(), HELLO_WORLD_SHA512);
    }

    #[test]
    fn test_incremental_hashing_equals_one_shot() {
        let mut hasher = IdentityHasher::new();
        hasher.update(b"hello ").update(b"world");
        assert_eq!(hasher.finalize(), hash_bytes(b"hello world"));
    }

    #[test]
    fn test_hash_file_and_reader() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().join("hello.txt");
        std::fs::write(&path, "hello world").unwrap();
        assert_eq!(hash_file(&path).unwrap().to_hex(), HELLO_WORLD_SHA512);
        assert_eq!(
            hash_reader(&b"hello world"[..]).unwrap(),
            hash_bytes(b"hello world")
        );
    }

    #[test]
    fn test_hash_file_reports_path_on_error() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().join("missing");
        let error = hash_file(&path).unwrap_err();
        assert_eq!(error.path(), path.as_path());
    }

    #[test]
    fn test_hex_parsing_accepts_uppercase_and_rejects_wrong_length() {
        let hash = hash_bytes(b"abc");
        assert_eq!(
            ContentHash::from_hex(&hash.to_hex().to_uppercase()).unwrap(),
            hash
        );
        assert!(ContentHash::from_hex("abcd").is_err());
        assert!(ContentHash::from_hex("not hex").is_err());
    }

    #[test]
    fn test_substitute_changes_with_any_input() {
        let mtime = DateTime::parse_from_rfc3339("2025-01-24T20:47:33.400Z")
            .unwrap()
            .to_utc();
        let base = ContentHash::substitute("bucket", "key", 10, mtime, "etag");
        assert_eq!(
            base,
            ContentHash::substitute(
                "bucket",
                "key",
                10,
                mtime + chrono::TimeDelta::milliseconds(100),
                "etag"
            ),
            "sub-second differences must not change the substitute"
        );
        assert_ne!(base, ContentHash::substitute("bucket", "key", 11, mtime, "etag"));
        assert_ne!(base, ContentHash::substitute("bucket", "key", 10, mtime, "other"));
        assert_ne!(base, ContentHash::substitute("bucket", "key", 10, mtime, ""));
    }
}
