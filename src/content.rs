//! The content store manages the `content-v2` tree of read-only blobs,
//! each named by the hex form of its digest.
//!
//! Writes are crash-atomic: bytes land in a private temporary file that
//! is published with `link(2)` (rename on platforms without usable hard
//! links), so a reader either sees a complete blob at its addressed
//! path or nothing at all.  Two processes publishing the same digest
//! race benignly: the loser's link fails with EEXIST, and the content
//! at the destination is by definition identical.
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::errors::Error;
use crate::errors::Result;
use crate::integrity::Integrity;
use crate::layout;
use crate::ownership;
use crate::tmp::ensure_file_removed;
use crate::tmp::TmpFile;
use crate::WriteOpts;

/// Writes `data` into the content store and returns the computed
/// integrity along with the byte count.
///
/// The declared `opts.size` and `opts.integrity`, when present, are
/// checked before anything touches the disk.
pub(crate) fn write(cache: &Path, data: &[u8], opts: &WriteOpts) -> Result<(Integrity, u64)> {
    if let Some(declared) = opts.size {
        if declared != data.len() as u64 {
            return Err(Error::BadArgument(format!(
                "declared a size of {} bytes but wrote {}",
                declared,
                data.len()
            )));
        }
    }

    let algorithms: Vec<&str> = opts.algorithms.iter().map(String::as_str).collect();
    let sri = Integrity::from_data(data, &algorithms, &[])?;

    if let Some(declared) = &opts.integrity {
        declared.check_data(data, None)?;
    }

    let (tmp, mut file) = TmpFile::create(cache, opts.tmp_prefix.as_deref(), opts.uid, opts.gid)?;
    file.write_all(data)?;
    file.flush()?;
    drop(file);

    move_to_destination(&tmp, cache, &sri, opts)?;
    Ok((sri, data.len() as u64))
}

/// Publishes the temporary file at its content-addressed destination
/// and consumes the temporary directory entry.
fn move_to_destination(tmp: &TmpFile, cache: &Path, sri: &Integrity, opts: &WriteOpts) -> Result<()> {
    let dest = layout::content_path(cache, sri)?;
    if let Some(parent) = dest.parent() {
        ownership::ensure_owned_directory(parent, opts.uid, opts.gid)?;
    }

    // Mark the blob read-only before it becomes visible; the hard link
    // shares the inode, so the destination inherits the mode.
    set_read_only(&tmp.path)?;
    publish(&tmp.path, &dest)?;
    ownership::fix_owner(&dest, opts.uid, opts.gid)?;
    ensure_file_removed(&tmp.path)?;
    Ok(())
}

#[cfg(unix)]
fn set_read_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o444))
}

#[cfg(not(unix))]
fn set_read_only(path: &Path) -> std::io::Result<()> {
    let mut permissions = std::fs::symlink_metadata(path)?.permissions();
    permissions.set_readonly(true);
    std::fs::set_permissions(path, permissions)
}

/// Links `from` to `to`.  A destination that already exists holds the
/// same bytes (it is named by their digest), so EEXIST and EBUSY mean
/// another writer won the race and we are done.  EPERM means the
/// filesystem refuses hard links; fall back to an atomic rename.
#[cfg(not(windows))]
fn publish(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::hard_link(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) if ownership::is_busy_error(&e) => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => std::fs::rename(from, to),
        err => err,
    }
}

// Hard links on Windows need elevated rights often enough that the
// rename path is the only dependable one.
#[cfg(windows)]
fn publish(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::rename(from, to)
}

/// Reads the blob addressed by `sri`, without re-verifying it; callers
/// that need the corruption guarantee run `check_data` on the result.
pub(crate) fn read(cache: &Path, sri: &Integrity) -> Result<Vec<u8>> {
    let path = layout::content_path(cache, sri)?;
    Ok(std::fs::read(path)?)
}

/// Returns the content path for `sri` when a blob exists there, along
/// with its size.  Missing or unreadable blobs are reported as absent;
/// anything else propagates.
pub(crate) fn has_content(cache: &Path, sri: &Integrity) -> Result<Option<(PathBuf, u64)>> {
    let path = layout::content_path(cache, sri)?;
    match std::fs::symlink_metadata(&path) {
        Ok(meta) => Ok(Some((path, meta.len()))),
        Err(e) if ownership::is_absent_file_error(&e) => Ok(None),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Removes the blob addressed by `sri`.  Returns whether a blob was
/// actually there.
pub(crate) fn rm(cache: &Path, sri: &Integrity) -> Result<bool> {
    match has_content(cache, sri)? {
        Some((path, _)) => {
            std::fs::remove_file(path)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Write then read the same bytes back through the addressed path.
#[test]
fn test_write_then_read() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    let (sri, size) = write(&cache, b"foobarbaz", &WriteOpts::new()).expect("write must succeed");
    assert_eq!(size, 9);

    let data = read(&cache, &sri).expect("read must succeed");
    assert_eq!(&data, b"foobarbaz");

    // The blob sits at its content-addressed path, read-only.
    let path = layout::content_path(&cache, &sri).expect("non-empty sri");
    let meta = std::fs::metadata(&path).expect("blob must exist");
    assert!(meta.permissions().readonly());

    // The tmp workspace holds no leftovers.
    let leftovers = std::fs::read_dir(layout::tmp_dir(&cache))
        .expect("tmp dir exists")
        .count();
    assert_eq!(leftovers, 0);
}

/// A declared size that disagrees with the payload fails before I/O.
#[test]
fn test_write_size_precheck() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();

    assert!(matches!(
        write(&temp.path("."), b"foobarbaz", &WriteOpts::new().size(4)),
        Err(Error::BadArgument(_))
    ));
    // Nothing was created.
    assert!(std::fs::metadata(layout::content_dir(&temp.path("."))).is_err());
}

/// A declared integrity that disagrees with the payload fails, and the
/// temporary file is cleaned up.
#[test]
fn test_write_integrity_precheck() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let declared =
        Integrity::from_data(b"something else", &["sha512"], &[]).expect("supported");

    assert!(matches!(
        write(
            &temp.path("."),
            b"foobarbaz",
            &WriteOpts::new().integrity(declared)
        ),
        Err(Error::IntegrityMismatch { .. })
    ));
}

/// Writing the same bytes twice is idempotent.
#[test]
fn test_write_twice() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    let (first, _) = write(&cache, b"foobarbaz", &WriteOpts::new()).expect("write must succeed");
    let (second, _) = write(&cache, b"foobarbaz", &WriteOpts::new()).expect("rewrite must succeed");
    assert_eq!(first, second);
    assert_eq!(
        read(&cache, &first).expect("read must succeed"),
        b"foobarbaz"
    );
}

/// has_content reports the blob and its size, and absence as None.
#[test]
fn test_has_content() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    let missing = Integrity::from_data(b"never written", &["sha512"], &[]).expect("supported");
    assert!(has_content(&cache, &missing)
        .expect("probe must succeed")
        .is_none());

    let (sri, _) = write(&cache, b"foobarbaz", &WriteOpts::new()).expect("write must succeed");
    let (path, size) = has_content(&cache, &sri)
        .expect("probe must succeed")
        .expect("blob must exist");
    assert_eq!(size, 9);
    assert_eq!(path, layout::content_path(&cache, &sri).expect("non-empty"));
}

/// rm deletes the blob and reports whether anything was there.
#[test]
fn test_rm() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    let (sri, _) = write(&cache, b"foobarbaz", &WriteOpts::new()).expect("write must succeed");
    assert!(rm(&cache, &sri).expect("rm must succeed"));
    assert!(!rm(&cache, &sri).expect("second rm must succeed"));
    assert!(read(&cache, &sri).is_err());
}
