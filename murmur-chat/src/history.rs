//! Append-only message log shared by every connection handler.
//!
//! Message IDs are dense and zero-based; `size()` is the next free ID.
//! Entries are write-once with a single exception: the shutdown sentinel may
//! be replaced by a neutral marker when the server restarts
//! (see [`SharedLog::replace_if`]).
//!
//! Every handler computes its delivery with [`SharedLog::suffix_after`], which
//! reads under one lock so a batch is always a contiguous, gap-free suffix of
//! the global append order.

use tokio::sync::RwLock;

use crate::error::{ChatError, Result};

/// The server-held chat history.
#[derive(Debug, Default)]
pub struct SharedLog {
    entries: RwLock<Vec<String>>,
}

impl SharedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` as the next entry and return its ID.
    pub async fn append(&self, text: impl Into<String>) -> usize {
        let mut entries = self.entries.write().await;
        entries.push(text.into());
        entries.len() - 1
    }

    /// Number of entries, i.e. the next ID to be assigned.
    pub async fn size(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn get(&self, id: usize) -> Result<String> {
        let entries = self.entries.read().await;
        entries.get(id).cloned().ok_or(ChatError::OutOfRange {
            id,
            size: entries.len(),
        })
    }

    /// Replace the entry at `id`, returning the previous content.
    pub async fn overwrite(&self, id: usize, text: impl Into<String>) -> Result<String> {
        let mut entries = self.entries.write().await;
        let size = entries.len();
        let slot = entries.get_mut(id).ok_or(ChatError::OutOfRange { id, size })?;
        Ok(std::mem::replace(slot, text.into()))
    }

    /// Replace the entry at `id` only if it currently equals `expected`.
    ///
    /// The comparison and the write happen under the same lock, so a
    /// concurrent reader observes either the old or the new text.
    pub async fn replace_if(
        &self,
        id: usize,
        expected: &str,
        text: impl Into<String>,
    ) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let size = entries.len();
        let slot = entries.get_mut(id).ok_or(ChatError::OutOfRange { id, size })?;
        if slot != expected {
            return Ok(false);
        }
        *slot = text.into();
        Ok(true)
    }

    /// Entries strictly after `cursor` (`None` = nothing delivered yet),
    /// together with the cursor that covers them.
    pub async fn suffix_after(&self, cursor: Option<usize>) -> (Vec<String>, Option<usize>) {
        let entries = self.entries.read().await;
        let start = cursor.map_or(0, |c| c + 1);
        if start >= entries.len() {
            return (Vec::new(), cursor);
        }
        (entries[start..].to_vec(), Some(entries.len() - 1))
    }

    /// Copy of the whole history.
    pub async fn snapshot(&self) -> Vec<String> {
        self.entries.read().await.clone()
    }
}
