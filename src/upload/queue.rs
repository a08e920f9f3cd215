//! Admission Queue
//!
//! Bounds how many uploads may transfer at once. Uploads beyond the bound
//! wait in FIFO order. Freeing an active slot does not promote the head of
//! the waiting list; a waiting upload becomes active the next time `add` is
//! called for it while a slot is free.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use super::types::UploadError;

/// Returned by [`AdmissionQueue::get_queue_position`] for unknown uploads
pub const NOT_QUEUED: i64 = -1;

#[derive(Default)]
struct QueueState {
    /// Uploads allowed to transfer, in admission order
    active: Vec<String>,

    /// Uploads waiting for a slot, oldest first
    waiting: VecDeque<String>,
}

impl QueueState {
    fn contains(&self, id: &str) -> bool {
        self.active.iter().any(|a| a == id) || self.waiting.iter().any(|w| w == id)
    }

    fn remove(&mut self, id: &str) -> bool {
        if let Some(pos) = self.active.iter().position(|a| a == id) {
            self.active.remove(pos);
            return true;
        }
        if let Some(pos) = self.waiting.iter().position(|w| w == id) {
            self.waiting.remove(pos);
            return true;
        }
        false
    }
}

/// Bounded active set plus FIFO waiting list, keyed by upload ID
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<AdmissionQueueInner>,
}

struct AdmissionQueueInner {
    max_concurrent: usize,
    state: RwLock<QueueState>,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(AdmissionQueueInner {
                max_concurrent,
                state: RwLock::new(QueueState::default()),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Admit `id` if a slot is free, otherwise append it to the waiting list.
    /// Known IDs are left where they are.
    pub fn add(&self, id: &str) {
        let mut state = self.inner.state.write();
        if state.contains(id) {
            return;
        }

        if state.active.len() < self.inner.max_concurrent {
            state.active.push(id.to_string());
            tracing::debug!(upload_id = %id, "Upload admitted");
        } else {
            state.waiting.push_back(id.to_string());
            tracing::debug!(
                upload_id = %id,
                position = state.waiting.len(),
                "Upload queued"
            );
        }
    }

    /// Remove `id` from whichever set holds it
    pub fn remove(&self, id: &str) -> Result<(), UploadError> {
        if self.inner.state.write().remove(id) {
            Ok(())
        } else {
            Err(UploadError::NotFound(format!("upload tidak ada dalam antrian: {}", id)))
        }
    }

    /// Release `id` after normal completion. Unknown IDs are ignored.
    pub fn finish_upload(&self, id: &str) {
        if self.inner.state.write().remove(id) {
            tracing::debug!(upload_id = %id, "Upload slot released");
        }
    }

    /// Empty both sets, returning every ID that was active or waiting
    pub fn clear(&self) -> Vec<String> {
        let mut state = self.inner.state.write();
        let mut ids: Vec<String> = state.active.drain(..).collect();
        ids.extend(state.waiting.drain(..));
        ids
    }

    /// Seed the queue from a durable list of uploads that were active before a
    /// restart. IDs fill free active slots first; any overflow waits in order.
    pub fn load_from_db<I>(&self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.inner.state.write();
        for id in ids {
            if state.contains(&id) {
                continue;
            }
            if state.active.len() < self.inner.max_concurrent {
                state.active.push(id);
            } else {
                state.waiting.push_back(id);
            }
        }

        tracing::info!(
            active = state.active.len(),
            waiting = state.waiting.len(),
            "Admission queue restored"
        );
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// 0 if active, 1-based position if waiting, [`NOT_QUEUED`] if unknown
    pub fn get_queue_position(&self, id: &str) -> i64 {
        let state = self.inner.state.read();
        if state.active.iter().any(|a| a == id) {
            return 0;
        }
        state
            .waiting
            .iter()
            .position(|w| w == id)
            .map(|pos| pos as i64 + 1)
            .unwrap_or(NOT_QUEUED)
    }

    pub fn can_accept_upload(&self) -> bool {
        self.inner.state.read().active.len() < self.inner.max_concurrent
    }

    pub fn has_active_upload(&self) -> bool {
        !self.inner.state.read().active.is_empty()
    }

    /// The first active upload, for single-slot queues
    pub fn get_active_upload(&self) -> Option<String> {
        self.inner.state.read().active.first().cloned()
    }

    pub fn get_active_uploads(&self) -> Vec<String> {
        self.inner.state.read().active.clone()
    }

    /// Snapshot of the waiting list
    pub fn get_current_queue(&self) -> Vec<String> {
        self.inner.state.read().waiting.iter().cloned().collect()
    }

    pub fn get_queue_length(&self) -> usize {
        self.inner.state.read().waiting.len()
    }

    pub fn is_active_upload(&self, id: &str) -> bool {
        self.inner.state.read().active.iter().any(|a| a == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot_scenario() {
        let queue = AdmissionQueue::new(1);

        queue.add("a");
        assert_eq!(queue.get_active_uploads(), vec!["a".to_string()]);
        assert_eq!(queue.get_queue_position("a"), 0);

        queue.add("b");
        assert_eq!(queue.get_current_queue(), vec!["b".to_string()]);
        assert_eq!(queue.get_queue_position("b"), 1);
        assert!(!queue.can_accept_upload());

        queue.finish_upload("a");
        assert!(queue.get_active_uploads().is_empty());
        assert!(queue.can_accept_upload());

        // Waiting uploads are not promoted when a slot frees up
        assert_eq!(queue.get_current_queue(), vec!["b".to_string()]);
        assert!(!queue.is_active_upload("b"));

        // Re-adding a waiting upload is a no-op
        queue.add("b");
        assert_eq!(queue.get_queue_length(), 1);
        assert!(queue.get_active_uploads().is_empty());
    }

    #[test]
    fn test_add_is_idempotent_for_active() {
        let queue = AdmissionQueue::new(2);
        queue.add("a");
        queue.add("a");
        assert_eq!(queue.get_active_uploads().len(), 1);
        assert_eq!(queue.get_queue_length(), 0);
    }

    #[test]
    fn test_fifo_positions() {
        let queue = AdmissionQueue::new(1);
        for id in ["a", "b", "c", "d"] {
            queue.add(id);
        }

        assert_eq!(queue.get_queue_position("b"), 1);
        assert_eq!(queue.get_queue_position("c"), 2);
        assert_eq!(queue.get_queue_position("d"), 3);
        assert_eq!(queue.get_queue_position("zzz"), NOT_QUEUED);

        queue.remove("c").unwrap();
        assert_eq!(queue.get_queue_position("d"), 2);
    }

    #[test]
    fn test_remove_unknown_errors() {
        let queue = AdmissionQueue::new(1);
        assert!(matches!(queue.remove("ghost"), Err(UploadError::NotFound(_))));

        // finish_upload tolerates unknown IDs
        queue.finish_upload("ghost");
    }

    #[test]
    fn test_accessors() {
        let queue = AdmissionQueue::new(1);
        assert!(!queue.has_active_upload());
        assert_eq!(queue.get_active_upload(), None);

        queue.add("a");
        assert!(queue.has_active_upload());
        assert_eq!(queue.get_active_upload(), Some("a".to_string()));
        assert!(queue.is_active_upload("a"));
        assert_eq!(queue.max_concurrent(), 1);
    }

    #[test]
    fn test_clear_returns_all_ids() {
        let queue = AdmissionQueue::new(1);
        queue.add("a");
        queue.add("b");

        let cleared = queue.clear();
        assert_eq!(cleared, vec!["a".to_string(), "b".to_string()]);
        assert!(!queue.has_active_upload());
        assert_eq!(queue.get_queue_length(), 0);
    }

    #[test]
    fn test_load_from_db() {
        let queue = AdmissionQueue::new(2);
        queue.load_from_db(["a", "b", "c", "a"].map(String::from).to_vec());

        assert_eq!(queue.get_active_uploads(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(queue.get_current_queue(), vec!["c".to_string()]);
    }

    #[test]
    fn test_concurrent_adds_respect_bound() {
        let queue = AdmissionQueue::new(3);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let queue = queue.clone();
                std::thread::spawn(move || queue.add(&format!("u{}", i)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.get_active_uploads().len(), 3);
        assert_eq!(queue.get_queue_length(), 13);
    }
}
