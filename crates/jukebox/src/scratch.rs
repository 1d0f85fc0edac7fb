//! Scratch-file ownership for a single load.
//!
//! Every file fetched or transcoded for a track is created through a [`ScratchSet`], which
//! deletes all of them on [`ScratchSet::release`] (and, as a backstop, on drop). The set is
//! shared between the loader and the session, so whichever side ends the track first cleans up.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tempfile::TempPath;

/// File-name prefix shared by every scratch file this process creates.
pub const SCRATCH_PREFIX: &str = "jukebox-";

/// The scratch files owned by one load/playback cycle.
#[derive(Debug)]
pub struct ScratchSet {
    dir: PathBuf,
    files: Mutex<Files>,
}

#[derive(Debug, Default)]
struct Files {
    paths: Vec<TempPath>,
    released: bool,
}

impl ScratchSet {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(Files::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Files> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a new, uniquely named, empty file owned by this set.
    ///
    /// `role` ends up in the file name (`jukebox-in-…`); `extension` includes its dot or is empty.
    /// Fails once the set has been released. Write through the returned handle: the path may be
    /// unlinked at any time by [`ScratchSet::release`].
    pub fn create(&self, role: &str, extension: &str) -> io::Result<(File, PathBuf)> {
        let mut files = self.lock();
        if files.released {
            return Err(io::Error::other("scratch set already released"));
        }
        let prefix = format!("{SCRATCH_PREFIX}{role}-");
        let named = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(extension)
            .tempfile_in(&self.dir)?;
        let (file, temp_path) = named.into_parts();
        let path = temp_path.to_path_buf();
        files.paths.push(temp_path);
        Ok((file, path))
    }

    /// Delete one file early (used when a stage fails after creating its output).
    pub fn discard(&self, path: &Path) -> io::Result<()> {
        let mut files = self.lock();
        let Some(idx) = files.paths.iter().position(|p| &**p == path) else {
            return Ok(());
        };
        files.paths.swap_remove(idx).close()
    }

    pub fn len(&self) -> usize {
        self.lock().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().paths.is_empty()
    }

    /// Delete every owned file and refuse new ones. Returns how many were removed.
    ///
    /// Calling it again is a no-op.
    pub fn release(&self) -> usize {
        let drained: Vec<TempPath> = {
            let mut files = self.lock();
            files.released = true;
            files.paths.drain(..).collect()
        };
        let mut removed = 0usize;
        for temp_path in drained {
            let path = temp_path.to_path_buf();
            match temp_path.close() {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = ?path, "scratch cleanup warning: {e}"),
            }
        }
        removed
    }
}

/// Remove stale scratch files left behind by an earlier process.
pub fn cleanup_stale(dir: &Path) -> io::Result<usize> {
    let mut removed = 0usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if !file_name.starts_with(SCRATCH_PREFIX) {
            continue;
        }
        if std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn create_names_files_with_prefix_role_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        let set = ScratchSet::new(dir.path());
        let (_file, path) = set.create("in", ".mp3").unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("jukebox-in-"));
        assert!(name.ends_with(".mp3"));
        assert!(path.exists());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn release_removes_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let set = ScratchSet::new(dir.path());
        set.create("in", ".mp3").unwrap();
        set.create("out", ".wav").unwrap();
        assert_eq!(entries(dir.path()), 2);
        assert_eq!(set.release(), 2);
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn drop_also_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let set = ScratchSet::new(dir.path());
            set.create("in", "").unwrap();
        }
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn discard_removes_only_the_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let set = ScratchSet::new(dir.path());
        let (_a, input) = set.create("in", ".mp3").unwrap();
        let (_b, output) = set.create("out", ".wav").unwrap();
        set.discard(&output).unwrap();
        assert!(input.exists());
        assert!(!output.exists());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn release_tolerates_files_already_gone() {
        let dir = tempfile::tempdir().unwrap();
        let set = ScratchSet::new(dir.path());
        let (file, path) = set.create("in", "").unwrap();
        drop(file);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(set.release(), 0);
    }

    #[test]
    fn release_is_idempotent_and_refuses_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let set = ScratchSet::new(dir.path());
        set.create("in", ".mp3").unwrap();
        assert_eq!(set.release(), 1);
        assert_eq!(set.release(), 0);
        assert!(set.create("out", ".wav").is_err());
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn release_from_another_thread_unlinks_files_still_being_written() {
        use std::io::Write;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let set = Arc::new(ScratchSet::new(dir.path()));
        let (mut file, path) = set.create("in", ".mp3").unwrap();

        let releaser = set.clone();
        std::thread::spawn(move || releaser.release()).join().unwrap();

        assert!(!path.exists());
        file.write_all(b"late bytes").unwrap();
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn cleanup_stale_only_touches_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("jukebox-in-old.mp3"), b"x").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"y").unwrap();
        let removed = cleanup_stale(dir.path()).unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
