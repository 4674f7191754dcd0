//! In-memory file system. The guest of the emulator only ever sees this tree;
//! host files become visible by being copied in via [`Filesystem::map_file`].
//!
//! The tree is flat: files are keyed by their absolute path and directories
//! exist implicitly. Open handles ([`RamFile`]) share the underlying node and
//! carry their own offset, close to the UNIX open-file semantics.

#![deny(clippy::all)]
#![deny(missing_debug_implementations)]

mod file;
mod flags;
mod stat;

use crate::file::FileNode;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

pub use file::RamFile;
pub use flags::OpenFlags;
pub use stat::Metadata;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("file exists: {0}")]
    Exists(String),
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("handle was not opened for this access mode")]
    AccessMode,
    #[error("unable to ingest host file: {0}")]
    HostIo(#[from] std::io::Error),
}

/// The virtual file system, keyed by absolute path.
#[derive(Debug, Default)]
pub struct Filesystem {
    files: BTreeMap<String, Rc<RefCell<FileNode>>>,
}

impl Filesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a file. With [`OpenFlags::O_CREAT`] a missing file is created
    /// with the given `umode`, otherwise a missing file is an error.
    pub fn open_file(
        &mut self,
        path: &str,
        flags: OpenFlags,
        umode: u16,
    ) -> Result<RamFile, FsError> {
        check_absolute(path)?;
        if let Some(node) = self.files.get(path) {
            let handle = RamFile::new(node.clone(), flags);
            if flags.truncates() && flags.can_write() {
                let mut h = handle.clone();
                h.truncate(0)?;
            }
            log::trace!("open: path={}, flags={:?}", path, flags);
            return Ok(handle);
        }
        if !flags.can_create() {
            log::trace!("open failed: path={}, flags={:?}", path, flags);
            return Err(FsError::NotFound(path.to_string()));
        }
        let node = Rc::new(RefCell::new(FileNode::new(path.to_string(), umode)));
        self.files.insert(path.to_string(), node.clone());
        log::trace!("file created: path={}, umode={:o}", path, umode);
        Ok(RamFile::new(node, flags))
    }

    /// Opens an existing file read-only. Shorthand used by kernel handlers
    /// that only need to inspect a file (`stat`, `access`, `mmap`).
    pub fn open(&mut self, path: &str) -> Result<RamFile, FsError> {
        self.open_file(path, OpenFlags::O_RDONLY, 0)
    }

    /// Creates a new, empty, writable file. Fails if the path already exists.
    pub fn create(&mut self, path: &str) -> Result<RamFile, FsError> {
        check_absolute(path)?;
        if self.files.contains_key(path) {
            return Err(FsError::Exists(path.to_string()));
        }
        self.open_file(path, OpenFlags::O_RDWR | OpenFlags::O_CREAT, 0o644)
    }

    pub fn chmod(&mut self, path: &str, umode: u16) -> Result<(), FsError> {
        let node = self
            .files
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        node.borrow_mut().set_umode(umode);
        Ok(())
    }

    /// Ingests a host file by copying its contents to `guest_path`. An
    /// existing file at that path is replaced.
    pub fn map_file(&mut self, host_path: &Path, guest_path: &str) -> Result<(), FsError> {
        check_absolute(guest_path)?;
        let data = std::fs::read(host_path)?;
        log::debug!(
            "mapping host file {} -> {} ({} bytes)",
            host_path.display(),
            guest_path,
            data.len()
        );
        let node = FileNode::with_data(guest_path.to_string(), 0o755, data);
        self.files
            .insert(guest_path.to_string(), Rc::new(RefCell::new(node)));
        Ok(())
    }

    pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        // open handles keep the node alive, only the name goes away
        self.files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }
}

fn check_absolute(path: &str) -> Result<(), FsError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(FsError::NotAbsolute(path.to_string()))
    }
}
