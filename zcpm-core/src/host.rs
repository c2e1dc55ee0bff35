//! Host filesystem probes consumed by the resolver and the directory
//! search. Terminal handling lives with the embedder; the core only needs
//! to classify paths, size files, list directories and change the working
//! directory.

use std::fs;
use std::io;
use std::path::Path;

/// What a path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Other,
    Missing,
}

/// A directory-listing entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

/// Host services the core consumes.
pub trait Host {
    fn file_kind(&self, path: &Path) -> FileKind;

    /// File size in bytes, or None if it cannot be determined.
    fn file_size(&self, path: &Path) -> Option<u64>;

    /// List a directory. Errors collapse to an empty listing.
    fn list_dir(&self, path: &Path) -> Vec<DirEntry>;

    fn chdir(&self, path: &Path) -> io::Result<()>;
}

/// The real host filesystem.
#[derive(Default)]
pub struct LocalHost;

impl Host for LocalHost {
    fn file_kind(&self, path: &Path) -> FileKind {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => FileKind::Regular,
            Ok(meta) if meta.is_dir() => FileKind::Directory,
            Ok(_) => FileKind::Other,
            Err(_) => FileKind::Missing,
        }
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).ok().map(|meta| meta.len())
    }

    fn list_dir(&self, path: &Path) -> Vec<DirEntry> {
        let Ok(entries) = fs::read_dir(path) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_str()?.to_string();
                let is_directory = entry.file_type().ok()?.is_dir();
                Some(DirEntry { name, is_directory })
            })
            .collect()
    }

    fn chdir(&self, path: &Path) -> io::Result<()> {
        std::env::set_current_dir(path)
    }
}
