//! Temporary files under the cache's `tmp/` workspace.
//!
//! Every write lands in a private temporary file first and is published
//! into the content store by link or rename.  The allocator guarantees
//! that the temporary directory entry is gone on every exit path: the
//! publish step consumes it on success, and the RAII guard deletes any
//! leftover on failure.  Files that survive a crash anyway are swept by
//! the verify pipeline's tmp phase.
use std::fs::File;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::io::Result;
use std::path::Path;
use std::path::PathBuf;

use crate::layout;
use crate::ownership;

/// Temporary file names look like `<prefix>-<slug>`.
const DEFAULT_PREFIX: &str = "tmp";

/// Removes a file if it exists.
pub(crate) fn ensure_file_removed(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if ownership::is_absent_file_error(&e) => Ok(()),
        err => err,
    }
}

/// A claimed name in the cache's tmp directory.  Dropping the guard
/// removes whatever is still at that name.
#[derive(Debug)]
pub(crate) struct TmpFile {
    pub path: PathBuf,
}

impl TmpFile {
    /// Creates a fresh uniquely-named file under `cache`'s tmp
    /// directory, retrying on the (unlikely) slug collision.
    pub fn create(
        cache: &Path,
        prefix: Option<&str>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(TmpFile, File)> {
        let tmp_dir = layout::tmp_dir(cache);
        ownership::ensure_owned_directory(&tmp_dir, uid, gid)?;

        let prefix = prefix.unwrap_or(DEFAULT_PREFIX);
        loop {
            let path = tmp_dir.join(format!("{}-{}", prefix, random_slug()));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    ownership::fix_owner(&path, uid, gid)?;
                    return Ok((TmpFile { path }, file));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for TmpFile {
    fn drop(&mut self) {
        // Nothing left to clean up when publication already consumed
        // the entry; errors here are unreportable either way.
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Returns eight random hex characters.
fn random_slug() -> String {
    use rand::Rng;

    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

/// Slugs have the advertised shape.
#[test]
fn test_random_slug() {
    let slug = random_slug();
    assert_eq!(slug.len(), 8);
    assert!(slug.bytes().all(|b| b.is_ascii_hexdigit()));
}

/// Creating a tmp file materializes the tmp directory and the file;
/// dropping the guard removes the file.
#[test]
fn test_create_and_drop() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = temp.path(".");

    let path = {
        let (tmp, _file) = TmpFile::create(&cache, None, None, None).expect("create must succeed");
        assert!(tmp.path.starts_with(layout::tmp_dir(&cache)));
        assert!(std::fs::metadata(&tmp.path).is_ok());
        tmp.path.clone()
    };

    assert!(matches!(std::fs::metadata(&path),
                     Err(e) if e.kind() == ErrorKind::NotFound));
}

/// A custom prefix shows up in the file name.
#[test]
fn test_prefix() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let (tmp, _file) =
        TmpFile::create(&temp.path("."), Some("fetch"), None, None).expect("create must succeed");
    let name = tmp.path.file_name().expect("has a name").to_string_lossy().into_owned();
    assert!(name.starts_with("fetch-"));
}

/// Dropping after the file was already consumed is fine.
#[test]
fn test_drop_after_consumed() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let (tmp, _file) = TmpFile::create(&temp.path("."), None, None, None).expect("create must succeed");
    std::fs::remove_file(&tmp.path).expect("remove must succeed");
    drop(tmp);
}
