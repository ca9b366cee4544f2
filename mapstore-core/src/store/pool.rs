//! Bounded pool of pre-opened read handles for one dataset file.
//!
//! Handles travel through a bounded `crossbeam-channel`: acquiring receives
//! one, dropping the guard sends it back. Callers block while every handle
//! is out.

use std::{fs::File, ops::Deref, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::{Receiver, Sender, bounded};
use log::warn;

use super::error::StoreError;

/// Fixed set of open handles shared by concurrent queries.
#[derive(Debug)]
pub struct HandlePool {
    path: Utf8PathBuf,
    sender: Sender<Arc<File>>,
    receiver: Receiver<Arc<File>>,
    size: usize,
}

impl HandlePool {
    /// Open `size` read handles on `path`.
    pub fn open(path: &Utf8Path, size: usize) -> Result<Self, StoreError> {
        let size = size.max(1);
        let (sender, receiver) = bounded(size);
        for _ in 0..size {
            let file = File::open(path).map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            sender
                .send(Arc::new(file))
                .map_err(|_| StoreError::HandlePool {
                    path: path.to_path_buf(),
                })?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            sender,
            receiver,
            size,
        })
    }

    /// Take a handle, waiting until one is free.
    pub fn acquire(&self) -> Result<PooledHandle<'_>, StoreError> {
        let file = self.receiver.recv().map_err(|_| StoreError::HandlePool {
            path: self.path.clone(),
        })?;
        Ok(PooledHandle {
            file,
            home: &self.sender,
        })
    }

    /// Number of handles the pool owns.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Number of handles not currently checked out.
    #[must_use]
    pub fn available(&self) -> usize {
        self.receiver.len()
    }
}

/// A checked-out handle, returned to its pool on drop.
///
/// `&File` implements `Read` and `Seek`, so the guard derefs to the file.
#[derive(Debug)]
pub struct PooledHandle<'pool> {
    file: Arc<File>,
    home: &'pool Sender<Arc<File>>,
}

impl Deref for PooledHandle<'_> {
    type Target = File;

    fn deref(&self) -> &Self::Target {
        &self.file
    }
}

impl Drop for PooledHandle<'_> {
    fn drop(&mut self) {
        if self.home.send(Arc::clone(&self.file)).is_err() {
            warn!("file handle pool closed before a handle was returned");
        }
    }
}
