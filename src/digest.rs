//! The file-digest table: component A of the engine (`spec.md` §4.A).
//!
//! Maps a pathname to the last mtime at which its content digest was known,
//! plus that digest. [`DigestTable::observe`] is the table's only public
//! operation, and implements the mtime-first fast path described in the
//! spec: if a file's mtime hasn't moved since we last looked, and at least a
//! second of wall-clock time has passed since then, we trust the cached
//! digest without touching the file's bytes.
//!
//! Grounded on the teacher's `cache.rs` (`FileDigestEntry::freshen`) and on
//! `fbuild/db/backend.py`'s `add_file`, which is the original this table is
//! modeled after (in particular the exact ">1.0s elapsed" re-hash policy).

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::{
    collections::HashMap,
    fs,
    io::Read,
    path::Path,
    time::SystemTime,
};
use string_interner::{DefaultSymbol, StringInterner};

use crate::error::{Error, Result};

/// A stable, 32-byte content fingerprint.
///
/// This wraps a raw SHA-256 output in a `Copy` newtype so it drops cleanly
/// into `HashMap`/`BTreeMap` keys; the teacher types digests as a bare
/// `generic_array::GenericArray` (see its `cache.rs`), which works but drags
/// `generic-array`'s trait surface into every signature that touches a
/// digest. The algorithm choice (SHA-256) and the wrapped byte layout are
/// unchanged from the teacher.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(hasher.finalize().into())
    }

    /// Wrap a raw 32-byte digest already computed elsewhere (e.g. decoded
    /// from a backend's storage column) without re-hashing it.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::de::Deserialize::deserialize(deserializer)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("digest must be 32 bytes"))?;
        Ok(Digest(arr))
    }
}

/// A digest combined with a hasher updated incrementally as bytes stream
/// through, used by output-writing helpers that want the digest of what
/// they just wrote without buffering it twice.
pub struct StreamingDigest(Sha256);

impl StreamingDigest {
    pub fn new() -> Self {
        StreamingDigest(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Digest {
        Digest(self.0.finalize().into())
    }
}

impl Default for StreamingDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// The persisted half of a file record: what we last saw for a pathname.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FileRecord {
    pub mtime: SystemTime,
    pub digest: Digest,
    pub size: u64,
}

/// The outcome of a single [`DigestTable::observe`] call.
#[derive(Clone, Copy, Debug)]
pub struct Observation {
    pub changed: bool,
    pub mtime: SystemTime,
    pub digest: Digest,
}

/// The minimum amount of time that must elapse after an mtime is recorded
/// before we're willing to trust it without re-reading the file, defeating
/// filesystems with coarse (e.g. one-second) mtime resolution.
pub const MTIME_TRUST_WINDOW_SECS: f64 = 1.0;

fn digest_of_file(path: &Path) -> Result<Digest> {
    let mut f = fs::File::open(path).map_err(|_| Error::FileMissing(path.to_path_buf()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Digest(hasher.finalize().into()))
}

fn read_mtime(path: &Path) -> Result<SystemTime> {
    stat(path).map(|(mtime, _)| mtime)
}

fn stat(path: &Path) -> Result<(SystemTime, u64)> {
    let md = fs::metadata(path).map_err(|_| Error::FileMissing(path.to_path_buf()))?;
    let mtime = md.modified().map_err(Error::Io)?;
    Ok((mtime, md.len()))
}

/// Public re-export of the file-hashing primitive for backends (such as
/// [`crate::backend::sql`]) that maintain their own file-digest storage
/// rather than delegating to [`DigestTable`].
pub fn digest_of_file_public(path: &Path) -> Result<Digest> {
    digest_of_file(path)
}

/// Public re-export of the mtime primitive, for the same reason as
/// [`digest_of_file_public`].
pub fn read_mtime_public(path: &Path) -> Result<SystemTime> {
    read_mtime(path)
}

/// In-memory table of interned-path -> [`FileRecord`], with the single
/// `observe` operation specified in `spec.md` §4.A. Paths are interned
/// through a [`StringInterner`] rather than stored as owned `PathBuf`s in
/// the hot map, the same way the teacher's `cache.rs` keys its
/// `FileDigestEntry` table by `PathSymbol` instead of by raw path strings.
/// This table itself holds no knowledge of persistence; the backend
/// snapshots it wholesale (see [`crate::backend::snapshot`]).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DigestTable {
    interner: StringInterner,
    records: HashMap<DefaultSymbol, FileRecord>,
}

impl Default for DigestTable {
    fn default() -> Self {
        DigestTable {
            interner: StringInterner::new(),
            records: HashMap::new(),
        }
    }
}

impl DigestTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn symbol_for(&mut self, path: &Path) -> DefaultSymbol {
        self.interner.get_or_intern(path.to_string_lossy())
    }

    /// Query (and if necessary refresh) the digest of `path`.
    ///
    /// 1. Read the current mtime; I/O failure is [`Error::FileMissing`].
    /// 2. If a previous record exists with the same mtime, and more than
    ///    [`MTIME_TRUST_WINDOW_SECS`] has elapsed since then, trust the
    ///    recorded digest without reading the file.
    /// 3. Otherwise hash the file. If the digest matches what was recorded,
    ///    only the mtime is refreshed and `changed` is false. Otherwise (or
    ///    if there was no previous record) the new `(mtime, digest)` pair is
    ///    stored and `changed` is true.
    pub fn observe(&mut self, path: &Path) -> Result<Observation> {
        let (mtime, size) = stat(path)?;
        let symbol = self.symbol_for(path);
        let previous = self.records.get(&symbol).copied();

        if let Some(prev) = previous {
            if prev.mtime == mtime {
                let elapsed = SystemTime::now()
                    .duration_since(mtime)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);

                if elapsed > MTIME_TRUST_WINDOW_SECS {
                    return Ok(Observation {
                        changed: false,
                        mtime,
                        digest: prev.digest,
                    });
                }
            }
        }

        let digest = digest_of_file(path)?;

        let changed = match previous {
            Some(prev) => prev.digest != digest,
            None => true,
        };

        self.records.insert(symbol, FileRecord { mtime, digest, size });

        Ok(Observation {
            changed,
            mtime,
            digest,
        })
    }

    /// Record the digest of a file we just finished writing ourselves,
    /// skipping the read-back: the digest was already computed as the bytes
    /// streamed through (see [`StreamingDigest`]).
    pub fn record_known(&mut self, path: &Path, digest: Digest) -> Result<()> {
        let (mtime, size) = stat(path)?;
        let symbol = self.symbol_for(path);
        self.records.insert(symbol, FileRecord { mtime, digest, size });
        Ok(())
    }

    pub fn forget(&mut self, path: &Path) {
        let symbol = self.symbol_for(path);
        self.records.remove(&symbol);
    }
}

/// Compute the digest of an in-memory buffer, e.g. a canonicalized argument
/// encoding, without touching the filesystem.
pub fn digest_bytes(data: &[u8]) -> Digest {
    Digest::of_bytes(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &str) {
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn first_observation_is_always_a_change() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("a.txt");
        write(&p, "hello");

        let mut table = DigestTable::new();
        let obs = table.observe(&p).unwrap();
        assert!(obs.changed);
    }

    #[test]
    fn unchanged_file_is_eventually_not_dirty() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("a.txt");
        write(&p, "hello");

        let mut table = DigestTable::new();
        table.observe(&p).unwrap();

        // Immediately after, even with an unchanged mtime, we might still
        // decide to re-hash (sub-second window); but it should report
        // unchanged either way since content didn't change.
        let obs = table.observe(&p).unwrap();
        assert!(!obs.changed);
    }

    #[test]
    fn content_change_with_same_mtime_is_still_detected_within_the_window() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("a.txt");
        write(&p, "hello");

        let mut table = DigestTable::new();
        let first = table.observe(&p).unwrap();

        // Overwrite with different content. Depending on filesystem mtime
        // resolution this may or may not bump the mtime, but within the
        // trust window we always re-hash, so the change must be caught.
        write(&p, "world");
        let second = table.observe(&p).unwrap();
        assert_ne!(first.digest.as_bytes(), second.digest.as_bytes());
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("nope.txt");
        let mut table = DigestTable::new();
        let err = table.observe(&p).unwrap_err();
        assert!(matches!(err, Error::FileMissing(_)));
    }

    #[test]
    fn digest_is_stable_across_runs_on_identical_bytes() {
        let a = Digest::of_bytes(b"identical payload");
        let b = Digest::of_bytes(b"identical payload");
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
