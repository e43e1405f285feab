//! The index store maps keys to content metadata through `index-v5`, a
//! tree of append-only bucket files sharded by the sha256 of the key.
//!
//! Each bucket line carries its own sha1 prefix, so readers can detect
//! and skip torn or corrupted appends without coordination; the last
//! valid line for a key wins.  Appends go through a single `O_APPEND`
//! write of one small line, which interleaves at line boundaries
//! between cooperating processes.  Buckets are only ever rewritten by
//! the verify pipeline.
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::errors::Result;
use crate::integrity::Integrity;
use crate::layout;
use crate::ownership;

/// A live index entry, as observed by readers.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    /// The key this entry is filed under.
    pub key: String,
    /// The integrity of the content the entry points at.
    pub integrity: Integrity,
    /// The content-addressed path derived from `integrity`.  Not
    /// persisted on disk.
    pub path: PathBuf,
    /// Insertion time, in seconds since the unix epoch.
    pub time: u64,
    /// Content size recorded at insertion, when known.
    pub size: Option<u64>,
    /// Arbitrary caller-supplied metadata.
    pub metadata: Value,
}

/// The serialized form of one bucket line.  Field declaration order is
/// load-bearing: each line is hashed over its exact JSON text, and the
/// on-disk format fixes the key order.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawEntry {
    key: String,
    integrity: Option<String>,
    time: u64,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    metadata: Value,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Turns a raw line into the reader-facing view.  Tombstones (and
/// lines whose integrity no longer parses) have no formatted form.
fn format_entry(cache: &Path, raw: RawEntry) -> Option<Entry> {
    let integrity = Integrity::parse(raw.integrity.as_deref()?, false);
    if integrity.is_empty() {
        return None;
    }

    let path = layout::content_path(cache, &integrity).ok()?;
    Some(Entry {
        key: raw.key,
        integrity,
        path,
        time: raw.time,
        size: raw.size,
        metadata: raw.metadata,
    })
}

/// Appends an entry for `key` to its bucket and returns the formatted
/// view (`None` when a tombstone was written).
///
/// `sri = None` writes a tombstone that shadows every earlier entry
/// for the key.
pub(crate) fn insert(
    cache: &Path,
    key: &str,
    sri: Option<&Integrity>,
    size: Option<u64>,
    metadata: Value,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<Option<Entry>> {
    let bucket = layout::bucket_path(cache, key);
    if let Some(parent) = bucket.parent() {
        ownership::ensure_owned_directory(parent, uid, gid)?;
    }

    let raw = RawEntry {
        key: key.to_string(),
        integrity: sri.map(Integrity::to_string),
        time: now_secs(),
        size,
        metadata,
    };
    let serialized = serde_json::to_string(&raw)?;
    let line = format!("{}\t{}\n", layout::hash_entry(&serialized), serialized);

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&bucket)?;
    file.write_all(line.as_bytes())?;
    drop(file);

    ownership::fix_owner(&bucket, uid, gid)?;
    Ok(format_entry(cache, raw))
}

/// Reads every valid entry in the bucket at `path`, oldest first.
/// Lines whose self-hash or JSON fail to parse are skipped.
pub(crate) fn bucket_entries(path: &Path) -> std::io::Result<Vec<RawEntry>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .split('\n')
        .filter_map(|line| {
            let (declared, serialized) = line.split_once('\t')?;
            if layout::hash_entry(serialized) != declared {
                return None;
            }

            serde_json::from_str(serialized).ok()
        })
        .collect())
}

/// Finds the newest live entry for `key`, scanning its bucket in
/// reverse.  A tombstone as the newest match hides the key.
pub(crate) fn find(cache: &Path, key: &str) -> Result<Option<Entry>> {
    let bucket = layout::bucket_path(cache, key);
    let entries = match bucket_entries(&bucket) {
        Ok(entries) => entries,
        Err(e) if ownership::is_absent_file_error(&e) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(entries
        .into_iter()
        .rev()
        .find(|raw| raw.key == key)
        .and_then(|raw| format_entry(cache, raw)))
}

/// Appends a tombstone for `key`.
pub(crate) fn delete(
    cache: &Path,
    key: &str,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<()> {
    insert(cache, key, None, None, Value::Null, uid, gid)?;
    Ok(())
}

/// Calls `consumer` once per live entry across the whole index.
///
/// Within a bucket the last write wins before tombstones are filtered,
/// so a shadowed or deleted key never reaches the consumer.  Missing
/// directories and stray non-directories anywhere in the tree are
/// tolerated: the index may be mutated or repaired while we walk it.
pub(crate) fn ls_for_each(cache: &Path, mut consumer: impl FnMut(Entry)) -> Result<()> {
    let index_root = layout::index_dir(cache);
    for first in tolerant_read_dir(&index_root)? {
        for second in tolerant_read_dir(&first)? {
            for bucket in tolerant_read_dir(&second)? {
                let entries = match bucket_entries(&bucket) {
                    Ok(entries) => entries,
                    // The bucket disappeared, or this is a stray
                    // subdirectory; either way there is nothing to list.
                    Err(e)
                        if ownership::is_absent_file_error(&e)
                            || ownership::is_directory_error(&e) =>
                    {
                        continue
                    }
                    Err(e) => return Err(e.into()),
                };

                let mut newest: HashMap<String, RawEntry> = HashMap::new();
                for raw in entries {
                    newest.insert(raw.key.clone(), raw);
                }

                for (_, raw) in newest {
                    if let Some(entry) = format_entry(cache, raw) {
                        consumer(entry);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Returns every live entry, keyed by entry key.
pub(crate) fn ls(cache: &Path) -> Result<HashMap<String, Entry>> {
    let mut entries = HashMap::new();
    ls_for_each(cache, |entry| {
        entries.insert(entry.key.clone(), entry);
    })?;
    Ok(entries)
}

/// Lists the children of `dir`, treating a missing directory (or a
/// file where a directory should be) as empty.
fn tolerant_read_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let iter = match std::fs::read_dir(dir) {
        Ok(iter) => iter,
        Err(e)
            if ownership::is_absent_file_error(&e) || ownership::is_not_directory_error(&e) =>
        {
            return Ok(Vec::new())
        }
        Err(e) => return Err(e.into()),
    };

    let mut children = Vec::new();
    for dirent in iter.flatten() {
        children.push(dirent.path());
    }
    Ok(children)
}

#[cfg(test)]
fn seed(cache: &Path, key: &str, data: &[u8], metadata: Value) -> Integrity {
    let sri = Integrity::from_data(data, &["sha512"], &[]).expect("sha512 is supported");
    insert(cache, key, Some(&sri), Some(data.len() as u64), metadata, None, None)
        .expect("insert must succeed");
    sri
}

/// Inserting then finding returns the formatted entry, path included.
#[test]
fn test_insert_then_find() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    let sri = seed(&cache, "k", b"foobarbaz", serde_json::json!({"tag": 1}));

    let entry = find(&cache, "k")
        .expect("find must succeed")
        .expect("entry must exist");
    assert_eq!(entry.key, "k");
    assert_eq!(entry.integrity, sri);
    assert_eq!(entry.size, Some(9));
    assert_eq!(entry.metadata, serde_json::json!({"tag": 1}));
    assert_eq!(
        entry.path,
        layout::content_path(&cache, &sri).expect("non-empty")
    );

    assert!(find(&cache, "other")
        .expect("find must succeed")
        .is_none());
}

/// The newest line for a key shadows every earlier one.
#[test]
fn test_last_write_wins() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    seed(&cache, "k", b"foobarbaz", Value::String("m1".into()));
    seed(&cache, "k", b"foobarbaz", Value::String("m2".into()));

    // Both lines are physically present until verify compacts them.
    let bucket = layout::bucket_path(&cache, "k");
    assert_eq!(bucket_entries(&bucket).expect("bucket must read").len(), 2);

    let entry = find(&cache, "k")
        .expect("find must succeed")
        .expect("entry must exist");
    assert_eq!(entry.metadata, Value::String("m2".into()));
}

/// A tombstone hides the key from find and ls, without touching any
/// earlier lines.
#[test]
fn test_tombstone() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    seed(&cache, "k", b"foobarbaz", Value::Null);
    delete(&cache, "k", None, None).expect("delete must succeed");

    assert!(find(&cache, "k").expect("find must succeed").is_none());
    assert!(ls(&cache).expect("ls must succeed").is_empty());

    let bucket = layout::bucket_path(&cache, "k");
    assert_eq!(bucket_entries(&bucket).expect("bucket must read").len(), 2);
}

/// Garbage appended to a bucket is invisible to readers.
#[test]
fn test_corrupt_lines_are_skipped() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    seed(&cache, "k", b"foobarbaz", Value::Null);

    let bucket = layout::bucket_path(&cache, "k");
    let mut file = OpenOptions::new()
        .append(true)
        .open(&bucket)
        .expect("bucket must open");
    file.write_all(b"\n234uhhh").expect("append must succeed");
    drop(file);

    let entries = bucket_entries(&bucket).expect("bucket must read");
    assert_eq!(entries.len(), 1);
    assert!(find(&cache, "k")
        .expect("find must succeed")
        .is_some());
}

/// A line whose payload was altered after hashing fails the self-hash
/// check and is dropped.
#[test]
fn test_tampered_line_is_dropped() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    seed(&cache, "k", b"foobarbaz", Value::Null);

    let bucket = layout::bucket_path(&cache, "k");
    let tampered = std::fs::read_to_string(&bucket)
        .expect("bucket must read")
        .replace("\"key\":\"k\"", "\"key\":\"x\"");
    // The payload changed after hashing; the hash prefix is now stale.
    std::fs::write(&bucket, tampered).expect("write must succeed");

    assert!(find(&cache, "k").expect("find must succeed").is_none());
}

/// ls folds every bucket and skips shadowed entries.
#[test]
fn test_ls() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    seed(&cache, "a", b"payload a", Value::Null);
    seed(&cache, "b", b"payload b", Value::Null);
    seed(&cache, "b", b"payload b2", Value::Null);

    let entries = ls(&cache).expect("ls must succeed");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries["a"].key, "a");
    let expected = Integrity::from_data(b"payload b2", &["sha512"], &[]).expect("supported");
    assert_eq!(entries["b"].integrity, expected);
}

/// ls on a cache with no index at all is empty, not an error.
#[test]
fn test_ls_missing_index() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    assert!(ls(&temp.path(".")).expect("ls must succeed").is_empty());
}
