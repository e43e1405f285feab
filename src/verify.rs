//! The verify pipeline: a sequential sweep that garbage-collects
//! unreferenced blobs, re-verifies and evicts corrupted ones, compacts
//! index buckets down to their live entries, clears the tmp workspace,
//! and records a completion timestamp in `_lastverified`.
//!
//! Failures inside the sweep are localized: a bad blob or an unreadable
//! bucket line is counted in the returned stats rather than raised.  A
//! crash mid-rewrite leaves a bucket whose torn trailer the next reader
//! silently drops, because every line is self-hashed.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use tracing::debug;
use tracing::warn;
use walkdir::WalkDir;

use crate::errors::Error;
use crate::errors::Result;
use crate::index;
use crate::integrity::Integrity;
use crate::layout;
use crate::ownership;
use crate::tmp::ensure_file_removed;
use crate::VerifyOpts;

/// Counters and timings collected over one verify run.
#[derive(Clone, Debug)]
pub struct VerificationStats {
    /// Live blobs that passed re-verification.
    pub verified_content: usize,
    /// Files deleted from the content store, for any reason.
    pub reclaimed_count: usize,
    /// Bytes freed by those deletions.
    pub reclaimed_size: u64,
    /// Live blobs that failed their digest check and were deleted.
    pub bad_content_count: usize,
    /// Bytes retained in verified live blobs.
    pub kept_size: u64,
    /// Index entries whose content had vanished by rebuild time.
    pub missing_content: usize,
    /// Entries dropped during the rebuild (filtered out or missing
    /// their content).
    pub rejected_entries: usize,
    /// Entries successfully rewritten into their buckets.
    pub total_entries: usize,
    /// When the run started.
    pub start_time: SystemTime,
    /// When the run finished.
    pub end_time: SystemTime,
    /// Wall-clock duration per phase, plus a `total`.
    pub run_time: BTreeMap<String, Duration>,
}

impl Default for VerificationStats {
    fn default() -> VerificationStats {
        VerificationStats {
            verified_content: 0,
            reclaimed_count: 0,
            reclaimed_size: 0,
            bad_content_count: 0,
            kept_size: 0,
            missing_content: 0,
            rejected_entries: 0,
            total_entries: 0,
            start_time: SystemTime::UNIX_EPOCH,
            end_time: SystemTime::UNIX_EPOCH,
            run_time: BTreeMap::new(),
        }
    }
}

/// One step of the pipeline.  Phases run in order; each owns a slice
/// of the stats and its wall-clock duration is recorded under `name`.
struct Phase {
    name: &'static str,
    run: fn(&Path, &VerifyOpts, &mut VerificationStats) -> Result<()>,
}

const PHASES: [Phase; 7] = [
    Phase {
        name: "mark_start_time",
        run: mark_start_time,
    },
    Phase {
        name: "fix_permissions",
        run: fix_permissions,
    },
    Phase {
        name: "garbage_collect_content",
        run: garbage_collect_content,
    },
    Phase {
        name: "rebuild_index",
        run: rebuild_index,
    },
    Phase {
        name: "clean_tmp",
        run: clean_tmp,
    },
    Phase {
        name: "write_verifile",
        run: write_verifile,
    },
    Phase {
        name: "mark_end_time",
        run: mark_end_time,
    },
];

/// Runs the whole pipeline over `cache`.
pub(crate) fn run(cache: &Path, opts: &VerifyOpts) -> Result<VerificationStats> {
    let mut stats = VerificationStats::default();

    for phase in &PHASES {
        let clock = Instant::now();
        (phase.run)(cache, opts, &mut stats)?;
        let elapsed = clock.elapsed();
        debug!(
            phase = phase.name,
            elapsed_us = elapsed.as_micros() as u64,
            "verify phase done"
        );
        stats.run_time.insert(phase.name.to_string(), elapsed);
    }

    let total = stats
        .end_time
        .duration_since(stats.start_time)
        .unwrap_or_default();
    stats.run_time.insert("total".to_string(), total);
    Ok(stats)
}

/// Reads the timestamp of the last completed verify, if any.
pub(crate) fn last_run(cache: &Path) -> Result<Option<SystemTime>> {
    let raw = match std::fs::read_to_string(layout::verifile(cache)) {
        Ok(raw) => raw,
        Err(e) if ownership::is_absent_file_error(&e) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(raw
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs)))
}

fn mark_start_time(_cache: &Path, _opts: &VerifyOpts, stats: &mut VerificationStats) -> Result<()> {
    stats.start_time = SystemTime::now();
    Ok(())
}

fn mark_end_time(_cache: &Path, _opts: &VerifyOpts, stats: &mut VerificationStats) -> Result<()> {
    stats.end_time = SystemTime::now();
    Ok(())
}

fn fix_permissions(cache: &Path, opts: &VerifyOpts, _stats: &mut VerificationStats) -> Result<()> {
    ownership::ensure_owned_directory(cache, opts.uid, opts.gid)?;
    Ok(())
}

/// Sweeps the content tree: live blobs are re-verified (and deleted on
/// mismatch), everything else is reclaimed.
fn garbage_collect_content(
    cache: &Path,
    opts: &VerifyOpts,
    stats: &mut VerificationStats,
) -> Result<()> {
    let mut live = HashSet::new();
    index::ls_for_each(cache, |entry| {
        if opts.keeps(&entry) {
            live.insert(entry.integrity.to_string());
        }
    })?;

    for dirent in WalkDir::new(layout::content_dir(cache)) {
        let dirent = match dirent {
            Ok(dirent) => dirent,
            // A fresh cache has no content tree, and files may vanish
            // while we walk.
            Err(_) => continue,
        };
        if !dirent.file_type().is_file() {
            continue;
        }

        let path = dirent.path();
        let is_live = reconstruct_integrity(path)
            .map(|sri| (live.contains(&sri.to_string()), sri));

        match is_live {
            Some((true, sri)) => {
                let (size, valid) = verify_content(path, &sri)?;
                if valid {
                    stats.verified_content += 1;
                    stats.kept_size += size;
                } else {
                    stats.bad_content_count += 1;
                    stats.reclaimed_count += 1;
                    stats.reclaimed_size += size;
                }
            }
            // Unreferenced, or not a digest-addressed name at all; in
            // both cases nothing can point at it.
            _ => {
                let size = file_size(path);
                ensure_file_removed(path)?;
                stats.reclaimed_count += 1;
                stats.reclaimed_size += size;
            }
        }
    }

    Ok(())
}

/// Rebuilds the digest a content file was filed under from its last
/// four path segments: `<algorithm>/<aa>/<bb>/<rest>`.
fn reconstruct_integrity(path: &Path) -> Option<Integrity> {
    let segments: Vec<&str> = path.iter().filter_map(|s| s.to_str()).collect();
    if segments.len() < 4 {
        return None;
    }

    let tail = &segments[segments.len() - 4..];
    let hex_digest = format!("{}{}{}", tail[1], tail[2], tail[3]);
    Integrity::from_hex(&hex_digest, tail[0], &[]).ok()
}

fn file_size(path: &Path) -> u64 {
    std::fs::symlink_metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

/// Streams the blob through its digest.  A mismatching blob is deleted
/// on the spot; a blob that vanished mid-pipeline counts as size zero
/// and invalid.  A digest this build cannot recompute (an algorithm
/// another implementation sharing the cache could write) is also
/// invalid rather than fatal: failures here stay in the stats.
fn verify_content(path: &Path, sri: &Integrity) -> Result<(u64, bool)> {
    let size = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if ownership::is_absent_file_error(&e) => return Ok((0, false)),
        Err(e) => return Err(e.into()),
    };

    match sri.check_file(path, None) {
        Ok(_) => Ok((size, true)),
        Err(Error::Io(e)) if ownership::is_absent_file_error(&e) => Ok((0, false)),
        Err(Error::Io(e)) => Err(e.into()),
        Err(_) => {
            warn!(path = %path.display(), "content failed verification; removing");
            ensure_file_removed(path)?;
            Ok((size, false))
        }
    }
}

/// Rewrites every bucket that held live entries down to exactly those
/// entries, refreshing each entry's recorded size from the blob on
/// disk.
fn rebuild_index(cache: &Path, opts: &VerifyOpts, stats: &mut VerificationStats) -> Result<()> {
    let entries = index::ls(cache)?;

    let mut buckets: HashMap<PathBuf, Vec<index::Entry>> = HashMap::new();
    for (_, entry) in entries {
        let bucket = layout::bucket_path(cache, &entry.key);
        let group = buckets.entry(bucket).or_default();
        if opts.keeps(&entry) {
            group.push(entry);
        } else {
            // Filtered out: the bucket still gets truncated, so the
            // entry's lines disappear from disk.
            stats.rejected_entries += 1;
        }
    }

    for (bucket, group) in buckets {
        rebuild_bucket(cache, &bucket, group, opts, stats)?;
    }

    Ok(())
}

fn rebuild_bucket(
    cache: &Path,
    bucket: &Path,
    group: Vec<index::Entry>,
    opts: &VerifyOpts,
    stats: &mut VerificationStats,
) -> Result<()> {
    match OpenOptions::new().write(true).truncate(true).open(bucket) {
        Ok(file) => drop(file),
        // The bucket vanished since we listed it; re-inserts below
        // will recreate it as needed.
        Err(e) if ownership::is_absent_file_error(&e) => {}
        Err(e) => return Err(e.into()),
    }

    for entry in group {
        let content = layout::content_path(cache, &entry.integrity)?;
        let size = match std::fs::symlink_metadata(&content) {
            Ok(meta) => meta.len(),
            Err(e) if ownership::is_absent_file_error(&e) => {
                warn!(key = %entry.key, "dropping index entry whose content is gone");
                stats.rejected_entries += 1;
                stats.missing_content += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        index::insert(
            cache,
            &entry.key,
            Some(&entry.integrity),
            Some(size),
            entry.metadata,
            opts.uid,
            opts.gid,
        )?;
        stats.total_entries += 1;
    }

    Ok(())
}

fn clean_tmp(cache: &Path, _opts: &VerifyOpts, _stats: &mut VerificationStats) -> Result<()> {
    match std::fs::remove_dir_all(layout::tmp_dir(cache)) {
        Ok(()) => Ok(()),
        Err(e) if ownership::is_absent_file_error(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn write_verifile(cache: &Path, opts: &VerifyOpts, _stats: &mut VerificationStats) -> Result<()> {
    let path = layout::verifile(cache);
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    std::fs::write(&path, now.to_string())?;
    ownership::fix_owner(&path, opts.uid, opts.gid)?;
    Ok(())
}

#[cfg(test)]
use serde_json::Value;

/// Puts `data` under `key` the way the facade does: content write plus
/// index append.
#[cfg(test)]
fn put(cache: &Path, key: &str, data: &[u8]) -> Integrity {
    let (sri, size) =
        crate::content::write(cache, data, &crate::WriteOpts::new()).expect("write must succeed");
    index::insert(cache, key, Some(&sri), Some(size), Value::Null, None, None)
        .expect("insert must succeed");
    sri
}

#[cfg(test)]
fn verify(cache: &Path) -> VerificationStats {
    run(cache, &VerifyOpts::new()).expect("verify must succeed")
}

/// A healthy one-entry cache verifies cleanly and survives a trailing
/// chunk of garbage in its bucket: afterwards the bucket holds exactly
/// one valid line.
#[test]
fn test_corrupted_bucket_trailer() {
    use std::io::Write;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    put(&cache, "k", b"foobarbaz");

    let bucket = layout::bucket_path(&cache, "k");
    let mut file = OpenOptions::new()
        .append(true)
        .open(&bucket)
        .expect("bucket must open");
    file.write_all(b"\n234uhhh").expect("append must succeed");
    drop(file);

    let stats = verify(&cache);
    assert_eq!(stats.verified_content, 1);
    assert_eq!(stats.rejected_entries, 0);
    assert_eq!(stats.total_entries, 1);

    let contents = std::fs::read_to_string(&bucket).expect("bucket must read");
    let lines: Vec<&str> = contents.trim_end().lines().collect();
    assert_eq!(lines.len(), 1);
    let (declared, serialized) = lines[0].split_once('\t').expect("line must have a hash");
    assert_eq!(layout::hash_entry(serialized), declared);
}

/// Shadowed entries are compacted away; the newest metadata survives.
#[test]
fn test_shadowed_entries_compact() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    let sri = Integrity::from_data(b"foobarbaz", &["sha512"], &[]).expect("supported");
    crate::content::write(&cache, b"foobarbaz", &crate::WriteOpts::new()).expect("write");
    index::insert(&cache, "k", Some(&sri), Some(9), Value::String("m1".into()), None, None)
        .expect("insert must succeed");
    index::insert(&cache, "k", Some(&sri), Some(9), Value::String("m2".into()), None, None)
        .expect("insert must succeed");

    let bucket = layout::bucket_path(&cache, "k");
    assert_eq!(index::bucket_entries(&bucket).expect("read").len(), 2);

    verify(&cache);

    assert_eq!(index::bucket_entries(&bucket).expect("read").len(), 1);
    let entry = index::find(&cache, "k")
        .expect("find must succeed")
        .expect("entry must exist");
    assert_eq!(entry.metadata, Value::String("m2".into()));
}

/// A blob nothing points at is reclaimed.
#[test]
fn test_unreferenced_blob_collected() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    let (sri, _) = crate::content::write(&cache, b"foobarbaz", &crate::WriteOpts::new())
        .expect("write must succeed");

    let stats = verify(&cache);
    assert_eq!(stats.reclaimed_count, 1);
    assert_eq!(stats.reclaimed_size, 9);
    assert_eq!(stats.verified_content, 0);

    let path = layout::content_path(&cache, &sri).expect("non-empty");
    assert!(std::fs::metadata(path).is_err());
}

/// A referenced blob that no longer matches its digest is deleted, and
/// its index entry is dropped during the rebuild.
#[test]
fn test_corrupt_blob_evicted() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    let sri = put(&cache, "k", b"foobarbaz");
    let blob = layout::content_path(&cache, &sri).expect("non-empty");

    // Truncate the blob by one byte, working around its read-only mode.
    let data = std::fs::read(&blob).expect("read must succeed");
    std::fs::remove_file(&blob).expect("remove must succeed");
    std::fs::write(&blob, &data[..data.len() - 1]).expect("write must succeed");

    let stats = verify(&cache);
    assert_eq!(stats.bad_content_count, 1);
    assert_eq!(stats.reclaimed_count, 1);
    assert_eq!(stats.reclaimed_size, 8);
    assert_eq!(stats.missing_content, 1);
    assert_eq!(stats.rejected_entries, 1);
    assert_eq!(stats.total_entries, 0);
    assert_eq!(stats.verified_content, 0);

    assert!(std::fs::metadata(&blob).is_err());
    assert!(index::find(&cache, "k").expect("find must succeed").is_none());
}

/// A live blob under an algorithm this build cannot recompute (written
/// by some other implementation sharing the cache) is reclaimed and
/// counted, not a fatal error.
#[test]
fn test_uncomputable_algorithm_is_localized() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    // 16 zero bytes in base64; hex form is all zeroes.
    let sri = Integrity::parse("whirlpool-AAAAAAAAAAAAAAAAAAAAAA==", false);
    let blob = layout::content_path(&cache, &sri).expect("non-empty");
    std::fs::create_dir_all(blob.parent().expect("sharded path has a parent"))
        .expect("mkdir must succeed");
    std::fs::write(&blob, b"opaque payload").expect("write must succeed");
    index::insert(&cache, "k", Some(&sri), Some(14), Value::Null, None, None)
        .expect("insert must succeed");

    let stats = verify(&cache);
    assert_eq!(stats.bad_content_count, 1);
    assert_eq!(stats.reclaimed_count, 1);
    assert_eq!(stats.missing_content, 1);
    assert_eq!(stats.rejected_entries, 1);
    assert_eq!(stats.total_entries, 0);

    assert!(std::fs::metadata(&blob).is_err());
    assert!(index::find(&cache, "k").expect("find must succeed").is_none());
}

/// Verifying twice with unchanged inputs reclaims nothing the second
/// time and reports the same retained totals.
#[test]
fn test_verify_is_idempotent() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    put(&cache, "a", b"payload a");
    put(&cache, "b", b"somewhat longer payload b");

    let first = verify(&cache);
    let second = verify(&cache);

    assert_eq!(second.verified_content, first.verified_content);
    assert_eq!(second.kept_size, first.kept_size);
    assert_eq!(second.total_entries, first.total_entries);
    assert_eq!(second.reclaimed_count, 0);
    assert_eq!(second.missing_content, 0);
    assert_eq!(second.bad_content_count, 0);
}

/// The filter drops entries and their content, and counts them as
/// rejected.
#[test]
fn test_filter_rejects_entries() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    put(&cache, "keep", b"kept payload");
    let dropped = put(&cache, "drop", b"dropped payload");

    let opts = VerifyOpts::new().filter(|entry| entry.key != "drop");
    let stats = run(&cache, &opts).expect("verify must succeed");

    assert_eq!(stats.rejected_entries, 1);
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.verified_content, 1);
    assert_eq!(stats.reclaimed_count, 1);

    assert!(index::find(&cache, "keep").expect("find").is_some());
    assert!(index::find(&cache, "drop").expect("find").is_none());
    let blob = layout::content_path(&cache, &dropped).expect("non-empty");
    assert!(std::fs::metadata(blob).is_err());
}

/// The tmp workspace is removed wholesale.
#[test]
fn test_clean_tmp() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    let tmp_dir = layout::tmp_dir(&cache);
    std::fs::create_dir_all(&tmp_dir).expect("mkdir must succeed");
    std::fs::write(tmp_dir.join("leftover-deadbeef"), b"junk").expect("write must succeed");

    verify(&cache);
    assert!(std::fs::metadata(&tmp_dir).is_err());
}

/// last_run reports nothing until a verify completes, then a recent
/// timestamp, and the run_time map covers every phase.
#[test]
fn test_verifile_and_timings() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    assert!(last_run(&cache).expect("read must succeed").is_none());

    let before = SystemTime::now() - Duration::from_secs(1);
    let stats = verify(&cache);
    let after = SystemTime::now() + Duration::from_secs(1);

    let stamp = last_run(&cache)
        .expect("read must succeed")
        .expect("verify has run");
    assert!(stamp >= before && stamp <= after);

    assert!(stats.start_time <= stats.end_time);
    for phase in &PHASES {
        assert!(stats.run_time.contains_key(phase.name), "{}", phase.name);
    }
    assert!(stats.run_time.contains_key("total"));
}
