//! Keepsake is a crash-safe, content-addressed file cache with a
//! keyed metadata index, laid out on disk exactly like the npm
//! `cacache` format (`content-v2`/`index-v5`).
//!
//! Blobs are stored once per digest and published atomically, so a
//! reader never observes a torn or corrupted blob at its addressed
//! path.  The key index is an append-only log of self-hashed lines:
//! concurrent writers interleave at line boundaries, torn appends are
//! skipped on read, and the whole index can be rebuilt from the
//! content store by [`Cache::verify`].  There are no locks and no
//! daemon; the on-disk convention is the entire concurrency protocol,
//! which makes the cache safe to share between cooperating processes.
//!
//! ```no_run
//! fn main() -> keepsake::Result<()> {
//!     let cache = keepsake::Cache::new("./my-cache");
//!
//!     // Data goes in under a key...
//!     let sri = cache.put("my-key", b"hello world")?;
//!
//!     // ...and comes back out by key or by digest.
//!     let found = cache.get("my-key")?;
//!     assert_eq!(found.data, b"hello world");
//!     assert_eq!(cache.get_by_digest(&sri)?, b"hello world");
//!     Ok(())
//! }
//! ```
mod content;
mod errors;
mod index;
mod integrity;
mod layout;
mod ownership;
mod tmp;
mod verify;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

pub use errors::Error;
pub use errors::Result;
pub use index::Entry;
pub use integrity::Hash;
pub use integrity::Integrity;
pub use layout::CONTENT_VERSION;
pub use layout::INDEX_VERSION;
pub use serde_json::Value;
pub use verify::VerificationStats;

/// Everything a [`Cache::get`] returns about a key: the bytes, the
/// digest they were verified against, and the entry's metadata.
#[derive(Clone, Debug)]
pub struct Fetched {
    /// The content, verified against `integrity`.
    pub data: Vec<u8>,
    /// The integrity the entry was stored under.
    pub integrity: Integrity,
    /// The byte count of `data`.
    pub size: u64,
    /// Caller-supplied metadata from the index entry.
    pub metadata: Value,
}

/// Per-write options for [`Cache::put_with`].  The default writes a
/// single sha512 hash with no declared size or integrity.
#[derive(Debug, Default)]
pub struct WriteOpts {
    pub(crate) algorithms: Vec<String>,
    pub(crate) size: Option<u64>,
    pub(crate) integrity: Option<Integrity>,
    pub(crate) metadata: Value,
    pub(crate) uid: Option<u32>,
    pub(crate) gid: Option<u32>,
    pub(crate) tmp_prefix: Option<String>,
}

impl WriteOpts {
    /// Returns the default options.
    pub fn new() -> WriteOpts {
        WriteOpts::default()
    }

    /// Adds `algorithm` to the set of digests computed for this write.
    /// The first algorithm added names the content path.
    pub fn algorithm(mut self, algorithm: impl Into<String>) -> WriteOpts {
        self.algorithms.push(algorithm.into());
        self
    }

    /// Declares the expected payload size; the write fails up front
    /// when the actual bytes disagree.
    pub fn size(mut self, size: u64) -> WriteOpts {
        self.size = Some(size);
        self
    }

    /// Declares the expected integrity; the write fails when the
    /// payload does not match it.
    pub fn integrity(mut self, sri: Integrity) -> WriteOpts {
        self.integrity = Some(sri);
        self
    }

    /// Attaches metadata to the index entry.
    pub fn metadata(mut self, metadata: Value) -> WriteOpts {
        self.metadata = metadata;
        self
    }

    /// Chowns created files and directories when running as root.
    pub fn chown(mut self, uid: Option<u32>, gid: Option<u32>) -> WriteOpts {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Prefixes this write's temporary file name, which helps attribute
    /// leftovers after a crash.
    pub fn tmp_prefix(mut self, prefix: impl Into<String>) -> WriteOpts {
        self.tmp_prefix = Some(prefix.into());
        self
    }
}

/// Per-run options for [`Cache::verify_with`].
#[derive(Default)]
pub struct VerifyOpts {
    pub(crate) filter: Option<Box<dyn Fn(&Entry) -> bool>>,
    pub(crate) uid: Option<u32>,
    pub(crate) gid: Option<u32>,
}

impl VerifyOpts {
    /// Returns the default options: keep everything, chown nothing.
    pub fn new() -> VerifyOpts {
        VerifyOpts::default()
    }

    /// Keeps only entries for which `filter` returns true.  Everything
    /// else is dropped from the index and its content reclaimed.
    pub fn filter(mut self, filter: impl Fn(&Entry) -> bool + 'static) -> VerifyOpts {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Chowns repaired files and directories when running as root.
    pub fn chown(mut self, uid: Option<u32>, gid: Option<u32>) -> VerifyOpts {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub(crate) fn keeps(&self, entry: &Entry) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(entry))
    }
}

impl fmt::Debug for VerifyOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyOpts")
            .field("filter", &self.filter.as_ref().map(|_| "..."))
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .finish()
    }
}

/// A handle on one cache directory.  The handle holds only the path:
/// all state lives on disk, so handles are cheap and any number of
/// them (in any number of processes) may share a directory.
#[derive(Clone, Debug)]
pub struct Cache {
    path: PathBuf,
}

impl Cache {
    /// Returns a cache rooted at `path`.  Nothing is created until the
    /// first write.
    pub fn new(path: impl Into<PathBuf>) -> Cache {
        Cache { path: path.into() }
    }

    /// Returns the cache root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores `data` under `key` with default options and returns its
    /// integrity.
    pub fn put(&self, key: &str, data: &[u8]) -> Result<Integrity> {
        self.put_with(key, data, WriteOpts::new())
    }

    /// Stores `data` under `key`: the content store gets the blob, the
    /// index gets a new entry shadowing any previous one for `key`.
    pub fn put_with(&self, key: &str, data: &[u8], opts: WriteOpts) -> Result<Integrity> {
        let (sri, size) = content::write(&self.path, data, &opts)?;
        index::insert(
            &self.path,
            key,
            Some(&sri),
            Some(size),
            opts.metadata,
            opts.uid,
            opts.gid,
        )?;
        Ok(sri)
    }

    /// Fetches the newest live content for `key`, verified against its
    /// integrity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EntryNotFound`] when the key has no live entry,
    /// and [`Error::IntegrityMismatch`] when the stored blob no longer
    /// matches its digest.
    pub fn get(&self, key: &str) -> Result<Fetched> {
        let entry = self.get_info(key)?.ok_or_else(|| Error::EntryNotFound {
            cache: self.path.clone(),
            key: key.to_string(),
        })?;

        let data = content::read(&self.path, &entry.integrity)?;
        entry.integrity.check_data(&data, entry.size)?;

        let size = data.len() as u64;
        Ok(Fetched {
            data,
            integrity: entry.integrity,
            size,
            metadata: entry.metadata,
        })
    }

    /// Fetches content directly by digest, skipping the index.  The
    /// bytes are verified before they are returned.
    pub fn get_by_digest(&self, sri: &Integrity) -> Result<Vec<u8>> {
        let data = content::read(&self.path, sri)?;
        sri.check_data(&data, None)?;
        Ok(data)
    }

    /// Returns the newest live index entry for `key`, without touching
    /// the content store.
    pub fn get_info(&self, key: &str) -> Result<Option<Entry>> {
        index::find(&self.path, key)
    }

    /// Returns whether `key` has a live entry whose content is
    /// actually present.
    pub fn exists(&self, key: &str) -> Result<bool> {
        match self.get_info(key)? {
            Some(entry) => Ok(self.has_content(&entry.integrity)?.is_some()),
            None => Ok(false),
        }
    }

    /// Probes the content store for `sri`.  Returns the integrity and
    /// the blob's size when present.
    pub fn has_content(&self, sri: &Integrity) -> Result<Option<(Integrity, u64)>> {
        Ok(content::has_content(&self.path, sri)?.map(|(_, size)| (sri.clone(), size)))
    }

    /// Writes a tombstone for `key`.  The content itself stays until
    /// the next [`Cache::verify`] finds it unreferenced.
    pub fn rm_entry(&self, key: &str) -> Result<()> {
        index::delete(&self.path, key, None, None)
    }

    /// Removes the blob addressed by `sri` from the content store.
    /// Returns whether a blob was there.  Index entries pointing at it
    /// become dangling until the next verify.
    pub fn rm_content(&self, sri: &Integrity) -> Result<bool> {
        content::rm(&self.path, sri)
    }

    /// Removes all cache data: every versioned content and index tree
    /// under the root.  Anything else living in the directory is left
    /// alone.
    pub fn rm_all(&self) -> Result<()> {
        let iter = match std::fs::read_dir(&self.path) {
            Ok(iter) => iter,
            Err(e) if ownership::is_absent_file_error(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for dirent in iter.flatten() {
            let name = dirent.file_name();
            let name = name.to_string_lossy();
            if !name.contains("content-") && !name.contains("index-") {
                continue;
            }

            if dirent.file_type()?.is_dir() {
                std::fs::remove_dir_all(dirent.path())?;
            }
        }

        Ok(())
    }

    /// Returns every live entry, keyed by entry key.
    pub fn ls(&self) -> Result<HashMap<String, Entry>> {
        index::ls(&self.path)
    }

    /// Streams every live entry to `consumer` instead of collecting
    /// them.
    pub fn ls_for_each(&self, consumer: impl FnMut(Entry)) -> Result<()> {
        index::ls_for_each(&self.path, consumer)
    }

    /// Runs the full verify/GC pipeline with default options.
    pub fn verify(&self) -> Result<VerificationStats> {
        self.verify_with(VerifyOpts::new())
    }

    /// Runs the full verify/GC pipeline: unreferenced and corrupt
    /// content is reclaimed, buckets are compacted to their live
    /// entries, the tmp workspace is cleared, and `_lastverified` is
    /// stamped.
    pub fn verify_with(&self, opts: VerifyOpts) -> Result<VerificationStats> {
        verify::run(&self.path, &opts)
    }

    /// Returns when the last verify completed, if one ever has.
    pub fn verify_last_run(&self) -> Result<Option<SystemTime>> {
        verify::last_run(&self.path)
    }
}

/// sha512 of "foobarbaz" in base64; the integrity `put` must report.
#[cfg(test)]
const FOOBARBAZ_SHA512: &str =
    "yzd8ELD1piyANiWnmdnpCL5F52f10UfUdEkHywVZeqTt0ymgrxR63Qz0GB7TKPoeeZQmWCaz7T1+9vBnypkYWg==";

/// Write then read: the returned integrity is the sha512 of the
/// payload, the payload round-trips, and the blob actually sits at its
/// content-addressed path.
#[test]
fn test_put_then_get() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = Cache::new(temp.path("."));

    let sri = cache.put("k", b"foobarbaz").expect("put must succeed");
    assert_eq!(sri.to_string(), format!("sha512-{}", FOOBARBAZ_SHA512));

    let found = cache.get("k").expect("get must succeed");
    assert_eq!(&found.data, b"foobarbaz");
    assert_eq!(found.size, 9);
    assert_eq!(found.integrity, sri);

    let (_, hex_digest) = sri.to_hex().expect("non-empty");
    let blob = temp
        .path(".")
        .join("content-v2")
        .join("sha512")
        .join(&hex_digest[0..2])
        .join(&hex_digest[2..4])
        .join(&hex_digest[4..]);
    assert!(std::fs::metadata(blob).expect("blob must exist").is_file());
}

/// Repeated puts on one key: the last writer wins.
#[test]
fn test_last_put_wins() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = Cache::new(temp.path("."));

    for payload in [&b"v1"[..], b"v2", b"v3"] {
        cache.put("k", payload).expect("put must succeed");
    }

    assert_eq!(&cache.get("k").expect("get must succeed").data, b"v3");
}

/// rm_entry hides the key but leaves the blob in the content store.
#[test]
fn test_rm_entry_keeps_content() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = Cache::new(temp.path("."));

    let sri = cache.put("k", b"foobarbaz").expect("put must succeed");
    cache.rm_entry("k").expect("rm_entry must succeed");

    assert!(matches!(
        cache.get("k"),
        Err(Error::EntryNotFound { key, .. }) if key == "k"
    ));
    assert!(!cache.exists("k").expect("exists must succeed"));

    // The tombstone does not remove content.
    let (_, size) = cache
        .has_content(&sri)
        .expect("probe must succeed")
        .expect("content must remain");
    assert_eq!(size, 9);
    assert_eq!(
        cache.get_by_digest(&sri).expect("digest get must succeed"),
        b"foobarbaz"
    );
}

/// get verifies: a blob corrupted behind the index's back is reported,
/// not returned.
#[test]
fn test_get_detects_corruption() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = Cache::new(temp.path("."));

    let sri = cache.put("k", b"foobarbaz").expect("put must succeed");

    let blob = layout::content_path(&temp.path("."), &sri).expect("non-empty");
    let data = std::fs::read(&blob).expect("read must succeed");
    std::fs::remove_file(&blob).expect("remove must succeed");
    std::fs::write(&blob, &data[..data.len() - 1]).expect("write must succeed");

    assert!(matches!(cache.get("k"), Err(Error::SizeMismatch { .. })));
    assert!(matches!(
        cache.get_by_digest(&sri),
        Err(Error::IntegrityMismatch { .. })
    ));
}

/// Write options: declared size and integrity must agree with the
/// payload, metadata rides along, and extra algorithms show up in the
/// result.
#[test]
fn test_write_opts() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = Cache::new(temp.path("."));

    let declared = Integrity::from_data(b"foobarbaz", &["sha512"], &[]).expect("supported");
    let sri = cache
        .put_with(
            "k",
            b"foobarbaz",
            WriteOpts::new()
                .size(9)
                .integrity(declared)
                .metadata(serde_json::json!({"from": "opts"}))
                .algorithm("sha256")
                .algorithm("sha512")
                .tmp_prefix("test"),
        )
        .expect("put must succeed");

    assert_eq!(sri.hashes.len(), 2);
    assert_eq!(sri.hashes[0].algorithm, "sha256");

    let entry = cache
        .get_info("k")
        .expect("info must succeed")
        .expect("entry must exist");
    assert_eq!(entry.metadata, serde_json::json!({"from": "opts"}));
    assert_eq!(entry.size, Some(9));

    assert!(matches!(
        cache.put_with("k2", b"foobarbaz", WriteOpts::new().size(3)),
        Err(Error::BadArgument(_))
    ));
}

/// ls sees every live key and none of the deleted ones.
#[test]
fn test_ls_and_exists() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = Cache::new(temp.path("."));

    cache.put("a", b"payload a").expect("put must succeed");
    cache.put("b", b"payload b").expect("put must succeed");
    cache.rm_entry("a").expect("rm_entry must succeed");

    let entries = cache.ls().expect("ls must succeed");
    assert_eq!(entries.len(), 1);
    assert!(entries.contains_key("b"));
    assert!(cache.exists("b").expect("exists must succeed"));

    let mut streamed = Vec::new();
    cache
        .ls_for_each(|entry| streamed.push(entry.key))
        .expect("ls_for_each must succeed");
    assert_eq!(streamed, vec!["b".to_string()]);
}

/// rm_all removes the versioned trees and nothing else.
#[test]
fn test_rm_all() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = Cache::new(temp.path("."));

    cache.put("k", b"foobarbaz").expect("put must succeed");
    std::fs::write(temp.path("unrelated"), b"keep me").expect("write must succeed");

    cache.rm_all().expect("rm_all must succeed");

    assert!(std::fs::metadata(temp.path("content-v2")).is_err());
    assert!(std::fs::metadata(temp.path("index-v5")).is_err());
    assert!(std::fs::metadata(temp.path("unrelated")).is_ok());
    assert!(matches!(cache.get("k"), Err(Error::EntryNotFound { .. })));

    // A cache directory that never existed is also fine.
    assert!(Cache::new(temp.path("never-created")).rm_all().is_ok());
}

/// The facade's verify round-trip: a put survives, garbage does not.
#[test]
fn test_verify_through_facade() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = Cache::new(temp.path("."));

    cache.put("keep", b"kept payload").expect("put must succeed");
    // Content with no index entry: garbage.
    content::write(&temp.path("."), b"orphan", &WriteOpts::new()).expect("write must succeed");

    let stats = cache.verify().expect("verify must succeed");
    assert_eq!(stats.verified_content, 1);
    assert_eq!(stats.reclaimed_count, 1);
    assert_eq!(stats.reclaimed_size, 6);

    assert_eq!(
        &cache.get("keep").expect("get must succeed").data,
        b"kept payload"
    );
    assert!(cache
        .verify_last_run()
        .expect("read must succeed")
        .is_some());
}
