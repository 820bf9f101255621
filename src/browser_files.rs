//! On-disk browser profile directories.
//!
//! Temporary context directories live under a day-of-month bucket of the
//! temp-context root, e.g. `<root>/18/cx.1018aNcTx1q5`. Allocation and
//! reclamation are serialized across processes by an exclusive lock on
//! `<root>/context.lock`.

use chrono::{Datelike, Local};
use fs2::FileExt;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::DirError;
use crate::fingerprint::BrowserKind;

pub const CONTEXT_DIR_PREFIX: &str = "cx.";
pub const PID_FILE_NAME: &str = "launcher.pid";
pub const CONTEXT_LOCK_NAME: &str = "context.lock";

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);
const RANDOM_SUFFIX_LEN: usize = 5;

/// Exclusive hold on the shared lock file, released on drop.
struct DirLock {
    file: File,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub struct ProfileDirectoryAllocator {
    root: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    sequence: AtomicUsize,
    cleaned: Mutex<HashSet<PathBuf>>,
}

impl ProfileDirectoryAllocator {
    pub fn new(root: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let root = normalize_root(root.into());
        let lock_path = root.join(CONTEXT_LOCK_NAME);
        Self {
            root,
            lock_path,
            lock_timeout,
            sequence: AtomicUsize::new(0),
            cleaned: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> Result<DirLock, DirError> {
        fs::create_dir_all(&self.root)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.lock_path)
            .map_err(|source| DirError::Lock {
                path: self.lock_path.clone(),
                source,
            })?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(DirLock { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if start.elapsed() >= self.lock_timeout {
                        return Err(DirError::LockTimeout {
                            path: self.lock_path.clone(),
                            waited: start.elapsed(),
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(source) => {
                    return Err(DirError::Lock {
                        path: self.lock_path.clone(),
                        source,
                    })
                }
            }
        }
    }

    /// Create and return a fresh, uniquely named temporary context directory.
    ///
    /// Blocks for up to the lock timeout; call from a blocking task.
    pub fn allocate_next(&self) -> Result<PathBuf, DirError> {
        let _lock = self.lock()?;

        let today = Local::now();
        let bucket = self.root.join(format!("{:02}", today.day()));
        fs::create_dir_all(&bucket)?;

        let siblings = count_context_dirs(&bucket)?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let rand: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_SUFFIX_LEN)
            .map(char::from)
            .collect();

        let name = format!(
            "{}{:02}{:02}{}{}{}",
            CONTEXT_DIR_PREFIX,
            today.month(),
            today.day(),
            seq,
            rand,
            siblings
        );
        let dir = bucket.join(name);
        fs::create_dir(&dir)?;
        debug!(dir = %dir.display(), "Allocated context dir");
        Ok(dir)
    }

    /// The persistent directory of sequential roster slot `seq`, created if
    /// missing. Lives beside, not under, the temporary root so it is never
    /// reclaimed.
    pub fn sequential_dir(&self, seq: usize) -> Result<PathBuf, DirError> {
        let _lock = self.lock()?;
        let group_root = match self.root.parent() {
            Some(parent) => parent.join("group"),
            None => self.root.join("group"),
        };
        let dir = group_root.join(format!("{}{}", CONTEXT_DIR_PREFIX, seq));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Delete browser user data dirs under expired temporary context dirs.
    /// Returns the number of dirs deleted. Failures are logged and left for
    /// a later sweep.
    pub fn reclaim_expired(&self, expiry: Duration) -> Result<usize, DirError> {
        if !self.root.exists() {
            return Ok(0);
        }

        let candidates: Vec<PathBuf> = WalkDir::new(&self.root)
            .max_depth(3)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(CONTEXT_DIR_PREFIX)
            })
            .flat_map(|entry| {
                [BrowserKind::Chrome, BrowserKind::Chromium]
                    .into_iter()
                    .map(move |kind| entry.path().join(kind.dir_name()))
            })
            .filter(|dir| dir.is_dir())
            .filter(|dir| !self.cleaned.lock().contains(dir))
            .collect();

        let mut deleted = 0;
        for dir in candidates {
            match self.delete_with_lock(&dir, expiry) {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(DirError::OutsideRoot(path)) => {
                    error!(dir = %path.display(), "Not a temporary user data dir");
                }
                Err(e) => return Err(e),
            }
        }
        if deleted > 0 {
            info!(deleted, root = %self.root.display(), "Reclaimed expired context dirs");
        }
        Ok(deleted)
    }

    fn delete_with_lock(&self, dir: &Path, expiry: Duration) -> Result<bool, DirError> {
        if !is_descendant(&self.root, dir) {
            return Err(DirError::OutsideRoot(dir.to_path_buf()));
        }

        let _lock = self.lock()?;

        if !dir.exists() || self.cleaned.lock().contains(dir) {
            return Ok(false);
        }
        if !is_descendant(&self.root, dir) {
            return Err(DirError::OutsideRoot(dir.to_path_buf()));
        }

        let expired = fs::metadata(dir)
            .and_then(|m| m.modified())
            .map(|modified| modified.elapsed().map(|age| age >= expiry).unwrap_or(false))
            .unwrap_or(false);
        if !expired {
            return Ok(false);
        }

        let has_pid_file = dir
            .parent()
            .map(|parent| parent.join(PID_FILE_NAME).is_file())
            .unwrap_or(false);
        if !has_pid_file {
            return Ok(false);
        }

        if let Err(e) = fs::remove_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "Failed to delete context dir");
        }
        if dir.exists() {
            error!(dir = %dir.display(), "Browser data dir not deleted");
            Ok(false)
        } else {
            self.cleaned.lock().insert(dir.to_path_buf());
            Ok(true)
        }
    }
}

/// Absolute form of `root` without `.` segments, so every path walked from
/// it passes [`is_descendant`].
fn normalize_root(root: PathBuf) -> PathBuf {
    let absolute = if root.is_absolute() {
        root
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(root),
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Keeping relative context root");
                root
            }
        }
    };
    absolute
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Lexical check: `path` is strictly below `root` and has no `..` segment.
fn is_descendant(root: &Path, path: &Path) -> bool {
    path != root
        && path.starts_with(root)
        && !path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
}

fn count_context_dirs(bucket: &Path) -> std::io::Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(bucket)? {
        let entry = entry?;
        if entry.file_type()?.is_dir()
            && entry
                .file_name()
                .to_string_lossy()
                .starts_with(CONTEXT_DIR_PREFIX)
        {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn context_with_profile(root: &Path, name: &str, with_pid: bool) -> PathBuf {
        let context_dir = root.join("18").join(name);
        let profile = context_dir.join(BrowserKind::Chrome.dir_name());
        fs::create_dir_all(profile.join("Default")).unwrap();
        if with_pid {
            fs::write(context_dir.join(PID_FILE_NAME), "4242").unwrap();
        }
        profile
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("context").join("tmp");

        // Two allocators on the same root stand in for two processes.
        let a = Arc::new(ProfileDirectoryAllocator::new(&root, Duration::from_secs(10)));
        let b = Arc::new(ProfileDirectoryAllocator::new(&root, Duration::from_secs(10)));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let alloc = if i % 2 == 0 { a.clone() } else { b.clone() };
                std::thread::spawn(move || alloc.allocate_next().unwrap())
            })
            .collect();

        let dirs: HashSet<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(dirs.len(), 16);
        for dir in &dirs {
            assert!(dir.is_dir());
            assert!(dir.starts_with(&root));
            let name = dir.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with(CONTEXT_DIR_PREFIX));
        }
    }

    #[test]
    fn test_reclaim_requires_sibling_pid_file() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tmp");
        let alloc = ProfileDirectoryAllocator::new(&root, Duration::from_secs(10));

        let marked = context_with_profile(&root, "cx.1018aaaaa0", true);
        let unmarked = context_with_profile(&root, "cx.1018bbbbb1", false);

        assert_eq!(alloc.reclaim_expired(Duration::ZERO).unwrap(), 1);
        assert!(!marked.exists());
        assert!(unmarked.exists());

        // Already reclaimed, nothing to do.
        assert_eq!(alloc.reclaim_expired(Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_root_is_made_absolute() {
        let alloc = ProfileDirectoryAllocator::new("./ctx/./tmp", Duration::from_secs(10));
        assert!(alloc.root().is_absolute());
        assert!(alloc.root().ends_with("ctx/tmp"));
        assert!(!alloc.root().components().any(|c| c == Component::CurDir));
    }

    #[test]
    fn test_reclaim_under_dot_relative_root() {
        let tmp = tempfile::tempdir_in(".").unwrap();
        let relative = Path::new(".")
            .join(tmp.path().file_name().unwrap())
            .join("ctx");
        let alloc = ProfileDirectoryAllocator::new(&relative, Duration::from_secs(10));

        let profile = context_with_profile(&relative, "cx.1018ddddd0", true);
        assert_eq!(alloc.reclaim_expired(Duration::ZERO).unwrap(), 1);
        assert!(!profile.exists());
    }

    #[test]
    fn test_reclaim_keeps_fresh_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tmp");
        let alloc = ProfileDirectoryAllocator::new(&root, Duration::from_secs(10));

        let fresh = context_with_profile(&root, "cx.1018ccccc0", true);
        assert_eq!(alloc.reclaim_expired(Duration::from_secs(3600)).unwrap(), 0);
        assert!(fresh.exists());
    }

    #[test]
    fn test_delete_refuses_paths_outside_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tmp");
        let alloc = ProfileDirectoryAllocator::new(&root, Duration::from_secs(10));

        let outside = tmp.path().join("elsewhere").join("cx.1").join("chrome");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.parent().unwrap().join(PID_FILE_NAME), "1").unwrap();

        let sneaky = root.join("..").join("elsewhere").join("cx.1").join("chrome");
        assert!(matches!(
            alloc.delete_with_lock(&sneaky, Duration::ZERO),
            Err(DirError::OutsideRoot(_))
        ));
        assert!(matches!(
            alloc.delete_with_lock(&outside, Duration::ZERO),
            Err(DirError::OutsideRoot(_))
        ));
        assert!(outside.exists());
    }

    #[test]
    fn test_sequential_dir_is_stable_and_outside_tmp_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("context").join("tmp");
        let alloc = ProfileDirectoryAllocator::new(&root, Duration::from_secs(10));

        let first = alloc.sequential_dir(3).unwrap();
        assert_eq!(first, alloc.sequential_dir(3).unwrap());
        assert!(first.ends_with("group/cx.3"));
        assert!(!first.starts_with(&root));
    }

    #[test]
    fn test_lock_times_out_while_held() {
        let tmp = tempfile::tempdir().unwrap();
        let alloc = ProfileDirectoryAllocator::new(tmp.path(), Duration::from_millis(50));
        let _held = alloc.lock().unwrap();

        let other = ProfileDirectoryAllocator::new(tmp.path(), Duration::from_millis(50));
        assert!(matches!(other.allocate_next(), Err(DirError::LockTimeout { .. })));
    }
}
