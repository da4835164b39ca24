//! File content collaborator.

use crate::{StoreError, StoreResult};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Byte content of files, addressed by file id.
///
/// The directory hierarchy itself lives in the document store as
/// `io.cozy.files` documents.
pub trait Vfs: Send + Sync {
    /// Reads the whole content of a file.
    fn read_content(&self, file_id: &str) -> StoreResult<Vec<u8>>;

    /// Replaces the content of a file.
    fn write_content(&self, file_id: &str, content: &[u8]) -> StoreResult<()>;

    /// Returns true if content is stored for this file.
    fn has_content(&self, file_id: &str) -> bool;
}

/// A [`Vfs`] kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryVfs {
    contents: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryVfs {
    /// Creates an empty file store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vfs for MemoryVfs {
    fn read_content(&self, file_id: &str) -> StoreResult<Vec<u8>> {
        let contents = self.contents.read().unwrap_or_else(PoisonError::into_inner);
        contents
            .get(file_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("content of {file_id}")))
    }

    fn write_content(&self, file_id: &str, content: &[u8]) -> StoreResult<()> {
        let mut contents = self.contents.write().unwrap_or_else(PoisonError::into_inner);
        contents.insert(file_id.to_string(), content.to_vec());
        Ok(())
    }

    fn has_content(&self, file_id: &str) -> bool {
        let contents = self.contents.read().unwrap_or_else(PoisonError::into_inner);
        contents.contains_key(file_id)
    }
}
