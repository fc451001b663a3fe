//! File-level primitives shared by the vault and the index.
//!
//! - `atomic_write`: sibling temp file, fsync, rename over the target
//! - `PathLocks`: a registry of per-key mutexes so two writers never interleave
//!   a read-modify-write on the same file (or the same index path)

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::eid::Eid;

/// Write `data` to `path` so that readers observe either the old or the new
/// content, never a truncated file.
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("file");
    let temp_path = path.with_file_name(format!(".{}-{file_name}.tmp", Eid::new()));

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }

    result
}

/// Is this a scratch file produced by `atomic_write`?
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.') && name.ends_with(".tmp"))
        .unwrap_or(false)
}

/// Per-key mutex registry. Locks for different keys are independent. A key
/// stays registered only while someone holds or waits for its lock.
#[derive(Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<R>(&self, key: impl AsRef<Path>, f: impl FnOnce() -> R) -> R {
        let key = key.as_ref();
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(key.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };

        // clones are taken and dropped under the registry lock, so whoever
        // leaves last sees only the registry's own reference
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
        result
    }

    /// Number of registered keys. Used by tests.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.md");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_temp_file(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_atomic_write_fails_in_missing_dir() {
        let path = PathBuf::from("/nonexistent/directory/note.md");
        assert!(atomic_write(&path, b"x").is_err());
    }

    #[test]
    fn test_is_temp_file() {
        assert!(is_temp_file(Path::new("/v/.01ABC-note.md.tmp")));
        assert!(!is_temp_file(Path::new("/v/note.md")));
        assert!(!is_temp_file(Path::new("/v/note.tmp")));
    }

    #[test]
    fn test_same_key_is_serialized() {
        let locks = Arc::new(PathLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                std::thread::spawn(move || {
                    locks.with_lock("same.md", || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn test_different_keys_do_not_block() {
        let locks = PathLocks::new();
        let held = locks.with_lock("a.md", || locks.with_lock("b.md", || locks.len()));
        assert_eq!(held, 2);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn test_released_keys_are_forgotten() {
        let locks = PathLocks::new();
        for i in 0..100 {
            locks.with_lock(format!("note-{i}.md"), || ());
        }
        assert_eq!(locks.len(), 0);

        // a waiter keeps the entry alive for itself
        let locks = Arc::new(locks);
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let holder = {
            let locks = locks.clone();
            std::thread::spawn(move || {
                locks.with_lock("busy.md", || {
                    entered_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(50));
                })
            })
        };
        entered_rx.recv().unwrap();
        locks.with_lock("busy.md", || assert_eq!(locks.len(), 1));
        holder.join().unwrap();
        assert_eq!(locks.len(), 0);
    }
}
