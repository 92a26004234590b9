use std::fs::File;
use std::io::{self, BufReader, BufWriter};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Atomic reference-counted string type used for identifiers.
pub type ArcStr = std::sync::Arc<str>;

/// A 32-byte BLAKE3 hash used for content-addressing and node identity.
///
/// In `kumitate`, this serves three purposes:
/// 1. Node ids in both graphs are derived from it, so structurally identical
///    work collapses onto the same node across incremental rebuilds.
/// 2. Request ids are derived from the hashed request descriptor.
/// 3. Cache paths are sharded by the first byte of the hex digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes the canonical JSON form of a value.
    pub fn hash_json<T: Serialize + ?Sized>(value: &T) -> Self {
        let mut hasher = Blake3Hasher::default();
        if let Err(err) = serde_json::to_writer(&mut hasher, value) {
            tracing::error!("couldn't serialize value for hashing: {err}");
        }
        hasher.into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental BLAKE3 hasher usable as both `std::hash::Hasher` and
/// `std::io::Write`.
#[derive(Default)]
pub struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub fn update(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        self.0.update(bytes.as_ref());
        self
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

impl io::Write for Blake3Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes a value to disk as CBOR.
pub(crate) fn save_cbor<T: Serialize>(path: &Utf8Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = BufWriter::new(File::create(path)?);
    ciborium::into_writer(value, file).map_err(io::Error::other)
}

/// Reads a CBOR value, treating anything unreadable as absent.
pub(crate) fn load_cbor<T: DeserializeOwned>(path: &Utf8Path) -> Option<T> {
    let file = BufReader::new(File::open(path).ok()?);
    ciborium::from_reader(file).ok()
}

/// Lexically drops `.` components and folds `..` into the preceding one.
/// The filesystem is not consulted, so symlinks are kept as written.
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_str()),
        }
    }
    out
}
