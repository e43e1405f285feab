//! Deterministic mapping from keys and digests to on-disk paths.
//!
//! The layout is bit-compatible with the npm `cacache` directory format:
//! blobs live under `content-v2/<algorithm>/<aa>/<bb>/<rest>` keyed by the
//! hex form of their digest, and index buckets live under
//! `index-v5/<aa>/<bb>/<rest>` keyed by the sha256 of the entry key.
use std::path::Path;
use std::path::PathBuf;

use sha1::Sha1;
use sha2::Digest;
use sha2::Sha256;

use crate::errors::Result;
use crate::integrity::Integrity;

/// On-disk format version for the content store.
pub const CONTENT_VERSION: u32 = 2;
/// On-disk format version for the index store.
pub const INDEX_VERSION: u32 = 5;

const TMP_SUBDIR: &str = "tmp";
const VERIFILE: &str = "_lastverified";

/// Returns the content store root for `cache`.
pub(crate) fn content_dir(cache: &Path) -> PathBuf {
    cache.join(format!("content-v{}", CONTENT_VERSION))
}

/// Returns the index store root for `cache`.
pub(crate) fn index_dir(cache: &Path) -> PathBuf {
    cache.join(format!("index-v{}", INDEX_VERSION))
}

/// Returns the temporary workspace for `cache`.
pub(crate) fn tmp_dir(cache: &Path) -> PathBuf {
    cache.join(TMP_SUBDIR)
}

/// Returns the path of the last-verified timestamp file for `cache`.
pub(crate) fn verifile(cache: &Path) -> PathBuf {
    cache.join(VERIFILE)
}

/// Hashes an index key into the hex string that names its bucket.
pub(crate) fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Hashes the serialized form of an index entry.  Each bucket line is
/// prefixed with this value so that torn appends can be detected.
pub(crate) fn hash_entry(serialized: &str) -> String {
    hex::encode(Sha1::digest(serialized.as_bytes()))
}

/// Splits a hex digest into the three path segments used for sharding.
/// The digest must be at least four characters long; both sha256 keys
/// and any supported content digest are far longer.
pub(crate) fn hash_to_segments(hex: &str) -> [&str; 3] {
    [&hex[0..2], &hex[2..4], &hex[4..]]
}

/// Returns the bucket file that holds index entries for `key`.
pub(crate) fn bucket_path(cache: &Path, key: &str) -> PathBuf {
    let hashed = hash_key(key);
    let [a, b, rest] = hash_to_segments(&hashed);
    index_dir(cache).join(a).join(b).join(rest)
}

/// Returns the content file addressed by the first hash of `sri`.
pub(crate) fn content_path(cache: &Path, sri: &Integrity) -> Result<PathBuf> {
    let (algorithm, hex_digest) = sri.to_hex()?;
    let [a, b, rest] = hash_to_segments(&hex_digest);
    Ok(content_dir(cache)
        .join(algorithm)
        .join(a)
        .join(b)
        .join(rest))
}

/// Bucket paths shard on the sha256 of the key, two bytes per level.
#[test]
fn test_bucket_path() {
    // sha256("hello") = 2cf24db…
    let path = bucket_path(Path::new("/cache"), "hello");
    assert_eq!(
        path,
        PathBuf::from("/cache/index-v5/2c/f2/4dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
    );
}

/// Content paths embed the algorithm and the hex form of the digest.
#[test]
fn test_content_path() {
    // sha256("hello world") = b94d27b…
    let sri = Integrity::from_data(b"hello world", &["sha256"], &[]).expect("sha256 is supported");
    let path = content_path(Path::new("/cache"), &sri).expect("integrity is non-empty");
    assert_eq!(
        path,
        PathBuf::from("/cache/content-v2/sha256/b9/4d/27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
    );
}

/// The segment split is stable for digests of any supported length.
#[test]
fn test_hash_to_segments() {
    assert_eq!(hash_to_segments("aabbccdd"), ["aa", "bb", "ccdd"]);
    let key_hash = hash_key("");
    assert_eq!(key_hash.len(), 64);
    let [a, b, rest] = hash_to_segments(&key_hash);
    assert_eq!(a.len() + b.len() + rest.len(), 64);
}

/// Entry hashes are plain sha1 over the serialized JSON.
#[test]
fn test_hash_entry() {
    // sha1("abc") is a well-known vector.
    assert_eq!(hash_entry("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
}
