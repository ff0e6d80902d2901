//! Per-device command queue.
//!
//! Commands are sent one at a time in FIFO order. A file upload lives in a
//! separate chunk sub-queue that, once accepted, is drained before regular
//! commands. All access goes through one short-lived lock so the engine's
//! "is anything pending" check and the pop happen atomically.

use carpark_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Next unit of work taken from a [`CommandQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next<C, K> {
    Command(C),
    Chunk(K),
}

#[derive(Debug)]
struct Pending<C, K> {
    commands: VecDeque<C>,
    chunks: VecDeque<K>,
    upload_active: bool,
}

/// Command queue shared between device handles and the device task.
#[derive(Debug)]
pub struct CommandQueue<C, K> {
    pending: Mutex<Pending<C, K>>,
    notify: Notify,
}

impl<C: PartialEq, K> CommandQueue<C, K> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                commands: VecDeque::new(),
                chunks: VecDeque::new(),
                upload_active: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append a command.
    pub fn enqueue(&self, command: C) {
        self.pending.lock().commands.push_back(command);
        self.notify.notify_one();
    }

    /// Put a command at the front.
    ///
    /// Returns `false` and leaves the queue unchanged when the same command
    /// already sits at the front.
    pub fn enqueue_front(&self, command: C) -> bool {
        {
            let mut pending = self.pending.lock();
            if pending.commands.front() == Some(&command) {
                return false;
            }
            pending.commands.push_front(command);
        }
        self.notify.notify_one();
        true
    }

    /// Append one chunk to the chunk sub-queue.
    pub fn enqueue_chunk(&self, chunk: K) {
        {
            let mut pending = self.pending.lock();
            pending.chunks.push_back(chunk);
            pending.upload_active = true;
        }
        self.notify.notify_one();
    }

    /// Accept a whole upload.
    ///
    /// # Errors
    /// `QueueBusy` while chunks of a previous upload are still pending.
    pub fn begin_upload(&self, chunks: impl IntoIterator<Item = K>) -> Result<usize> {
        let count = {
            let mut pending = self.pending.lock();
            if pending.upload_active {
                return Err(Error::QueueBusy(format!(
                    "upload in progress, {} chunks pending",
                    pending.chunks.len()
                )));
            }
            pending.chunks.extend(chunks);
            pending.upload_active = !pending.chunks.is_empty();
            pending.chunks.len()
        };
        self.notify.notify_one();
        Ok(count)
    }

    /// Take the next unit of work. Pending chunks go first.
    pub fn pop_next(&self) -> Option<Next<C, K>> {
        let mut pending = self.pending.lock();
        if let Some(chunk) = pending.chunks.pop_front() {
            return Some(Next::Chunk(chunk));
        }
        pending.commands.pop_front().map(Next::Command)
    }

    /// Take the next chunk of the running upload.
    pub fn pop_chunk(&self) -> Option<K> {
        self.pending.lock().chunks.pop_front()
    }

    /// Mark the running upload finished, dropping any chunks left.
    ///
    /// Returns the number of chunks dropped.
    pub fn finish_upload(&self) -> usize {
        let mut pending = self.pending.lock();
        let dropped = pending.chunks.len();
        pending.chunks.clear();
        pending.upload_active = false;
        dropped
    }

    pub fn upload_active(&self) -> bool {
        self.pending.lock().upload_active
    }

    /// Queued commands, excluding chunks.
    pub fn len(&self) -> usize {
        self.pending.lock().commands.len()
    }

    pub fn chunk_len(&self) -> usize {
        self.pending.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        let pending = self.pending.lock();
        pending.commands.is_empty() && pending.chunks.is_empty()
    }

    /// Drop every queued command and chunk.
    pub fn clear(&self) {
        let mut pending = self.pending.lock();
        pending.commands.clear();
        pending.chunks.clear();
        pending.upload_active = false;
    }

    /// Wait until work is added. A notification sent while nobody waits is
    /// kept for the next caller.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl<C: PartialEq, K> Default for CommandQueue<C, K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drain(queue: &CommandQueue<char, u16>) -> Vec<Next<char, u16>> {
        std::iter::from_fn(|| queue.pop_next()).collect()
    }

    #[test]
    fn test_front_insert_order() {
        let queue = CommandQueue::<char, u16>::new();
        queue.enqueue('A');
        queue.enqueue('B');
        assert!(queue.enqueue_front('C'));

        assert_eq!(
            drain(&queue),
            [Next::Command('C'), Next::Command('A'), Next::Command('B')]
        );
    }

    #[test]
    fn test_enqueue_front_same_command_is_noop() {
        let queue = CommandQueue::<char, u16>::new();
        queue.enqueue('A');
        queue.enqueue_front('C');
        let len = queue.len();

        assert!(!queue.enqueue_front('C'));
        assert_eq!(queue.len(), len);
    }

    #[test]
    fn test_enqueue_front_other_command_inserts() {
        let queue = CommandQueue::<char, u16>::new();
        queue.enqueue('A');
        assert!(queue.enqueue_front('B'));
        assert!(queue.enqueue_front('C'));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_chunks_drain_before_commands() {
        let queue = CommandQueue::<char, u16>::new();
        queue.enqueue('A');
        queue.begin_upload([0, 1]).unwrap();

        assert_eq!(
            drain(&queue),
            [Next::Chunk(0), Next::Chunk(1), Next::Command('A')]
        );
    }

    #[test]
    fn test_second_upload_rejected_while_active() {
        let queue = CommandQueue::<char, u16>::new();
        assert_eq!(queue.begin_upload([0, 1, 2]).unwrap(), 3);

        let err = queue.begin_upload([9]).unwrap_err();
        assert!(matches!(err, Error::QueueBusy(_)));
        assert_eq!(queue.chunk_len(), 3);

        // still busy while the last chunk is in flight
        queue.pop_chunk();
        queue.pop_chunk();
        queue.pop_chunk();
        assert!(queue.begin_upload([9]).is_err());

        queue.finish_upload();
        assert!(queue.begin_upload([9]).is_ok());
    }

    #[test]
    fn test_finish_upload_drops_remaining_chunks() {
        let queue = CommandQueue::<char, u16>::new();
        queue.begin_upload([0, 1, 2, 3]).unwrap();
        queue.pop_chunk();

        assert_eq!(queue.finish_upload(), 3);
        assert!(queue.is_empty());
        assert!(!queue.upload_active());
    }

    #[tokio::test]
    async fn test_notification_kept_without_waiter() {
        let queue = CommandQueue::<char, u16>::new();
        queue.enqueue('A');

        tokio::time::timeout(Duration::from_millis(50), queue.notified())
            .await
            .expect("stored notification");
    }
}
