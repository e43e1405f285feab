//! Ownership fix-up and the errno classification the stores use to
//! tell expected filesystem races from real failures.
//!
//! Nothing in this cache takes a lock: blobs appear atomically, verify
//! may reclaim them at any moment, and index buckets are compacted
//! underneath readers.  A handful of errno values are therefore part of
//! the on-disk protocol rather than failures, and each store swallows
//! exactly the ones its own convention produces.
use std::io::Error;
use std::io::ErrorKind;
use std::io::Result;
use std::path::Path;

/// Checks whether the error means the file is simply not there.  Blobs
/// and buckets may be reclaimed by a concurrent verify between lookup
/// and open, so NotFound is a cache miss, never a failure.  Over NFS a
/// reclaimed inode can surface as ESTALE instead of ENOENT; the meaning
/// is the same, so it gets the same treatment.
/// [`ErrorKind::StaleNetworkFileHandle`] would cover that case without
/// reaching for `libc`, but it is still unstable
/// (<https://github.com/rust-lang/rust/issues/86442>).
pub(crate) fn is_absent_file_error(error: &Error) -> bool {
    error.kind() == ErrorKind::NotFound
        || matches!(error.raw_os_error(), Some(errno) if errno == libc::ESTALE)
}

/// Checks whether the error is EBUSY.  A hardlink target can report
/// busy on some network filesystems when another writer just published
/// the same content; the destination is by definition identical.
pub(crate) fn is_busy_error(error: &Error) -> bool {
    matches!(error.raw_os_error(), Some(errno) if errno == libc::EBUSY)
}

/// Checks whether the error is ENOTDIR: a path component that should
/// have been a directory turned out to be a regular file.
pub(crate) fn is_not_directory_error(error: &Error) -> bool {
    matches!(error.raw_os_error(), Some(errno) if errno == libc::ENOTDIR)
}

/// Checks whether the error is EISDIR: a file operation hit a
/// directory instead.
pub(crate) fn is_directory_error(error: &Error) -> bool {
    matches!(error.raw_os_error(), Some(errno) if errno == libc::EISDIR)
}

/// Hands `path` to `uid`/`gid` when the current process is privileged
/// enough to do so.  Only root may chown to arbitrary owners, so this is
/// a no-op for unprivileged processes and on platforms without POSIX
/// ownership.  A file that disappears between creation and the chown is
/// not an error: things do disappear from caches.
#[cfg(unix)]
pub(crate) fn fix_owner(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    if uid.is_none() && gid.is_none() {
        return Ok(());
    }

    if unsafe { libc::geteuid() } != 0 {
        return Ok(());
    }

    match std::os::unix::fs::chown(path, uid, gid) {
        Err(e) if is_absent_file_error(&e) => Ok(()),
        ret => ret,
    }
}

#[cfg(not(unix))]
pub(crate) fn fix_owner(_path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> Result<()> {
    Ok(())
}

/// Makes sure `path` is a directory owned by `uid`/`gid`, creating any
/// missing levels.  The sharded trees are built lazily and then reused
/// for every later write, so the directory usually exists already;
/// probe for that before reaching for `create_dir_all`.
pub(crate) fn ensure_owned_directory(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        _ => std::fs::create_dir_all(path)?,
    }

    fix_owner(path, uid, gid)
}

/// The stores route their error handling through these predicates:
/// absent means a miss, busy means a racing writer already published
/// the same digest, ENOTDIR/EISDIR mean the index walk strayed onto a
/// file.  The categories must not bleed into each other.
#[test]
fn test_error_classification() {
    for errno in [libc::ENOENT, libc::ESTALE] {
        let error = Error::from_raw_os_error(errno);
        assert!(is_absent_file_error(&error), "{:?}", error);
        assert!(!is_busy_error(&error), "{:?}", error);
        assert!(!is_not_directory_error(&error), "{:?}", error);
    }
    assert!(is_absent_file_error(&Error::new(ErrorKind::NotFound, "gone")));

    let busy = Error::from_raw_os_error(libc::EBUSY);
    assert!(is_busy_error(&busy));
    assert!(!is_absent_file_error(&busy));

    let not_dir = Error::from_raw_os_error(libc::ENOTDIR);
    assert!(is_not_directory_error(&not_dir));
    assert!(!is_directory_error(&not_dir));
    assert!(!is_absent_file_error(&not_dir));

    let is_dir = Error::from_raw_os_error(libc::EISDIR);
    assert!(is_directory_error(&is_dir));
    assert!(!is_not_directory_error(&is_dir));

    // Real failures must stay failures.
    for errno in [libc::EIO, libc::EPERM] {
        let error = Error::from_raw_os_error(errno);
        assert!(!is_absent_file_error(&error), "{:?}", error);
        assert!(!is_busy_error(&error), "{:?}", error);
    }

    // Errors built in-process carry no errno at all.
    let synthetic = Error::new(ErrorKind::Other, "no errno");
    assert!(!is_absent_file_error(&synthetic));
    assert!(!is_busy_error(&synthetic));
}

/// Creating over an existing directory must be a no-op, and missing
/// intermediate levels are filled in.
#[test]
fn test_ensure_owned_directory() {
    use test_dir::{DirBuilder, FileType, TestDir};
    let temp = TestDir::temp().create("existing", FileType::Dir);

    assert!(ensure_owned_directory(&temp.path("existing"), None, None).is_ok());
    assert!(ensure_owned_directory(&temp.path("fresh/nested"), None, None).is_ok());
    assert!(std::fs::metadata(temp.path("fresh/nested"))
        .expect("metadata must succeed")
        .is_dir());
}

/// Unprivileged processes skip the chown entirely, even for missing paths.
#[test]
#[cfg(unix)]
fn test_fix_owner_unprivileged() {
    use test_dir::{DirBuilder, TestDir};
    let temp = TestDir::temp();

    // No owner requested: trivially fine.
    assert!(fix_owner(&temp.path("absent"), None, None).is_ok());
    // Owner requested, but we are (presumably) not root; still fine.
    if unsafe { libc::geteuid() } != 0 {
        assert!(fix_owner(&temp.path("absent"), Some(0), Some(0)).is_ok());
    }
}
