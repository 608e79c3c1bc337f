//! Outbound command queue

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use ring_core::Command;
use serde::{Deserialize, Serialize};

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Commands waiting to be written
    pub pending_count: usize,

    /// Total commands enqueued
    pub total_enqueued: u64,

    /// Total commands taken by the session
    pub total_dequeued: u64,
}

/// FIFO of commands waiting for the session to write them
///
/// Enqueueing never blocks on the session; the session takes one command per
/// polling tick.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: Mutex<VecDeque<Command>>,
    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command
    pub fn enqueue(&self, command: Command) {
        self.commands.lock().push_back(command);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Append several commands, keeping their order
    pub fn enqueue_all(&self, commands: impl IntoIterator<Item = Command>) {
        let mut queue = self.commands.lock();
        for command in commands {
            queue.push_back(command);
            self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take the oldest command
    pub fn dequeue(&self) -> Option<Command> {
        let command = self.commands.lock().pop_front();
        if command.is_some() {
            self.total_dequeued.fetch_add(1, Ordering::Relaxed);
        }
        command
    }

    /// Drop everything still waiting
    pub fn clear(&self) -> usize {
        let mut queue = self.commands.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending_count: self.len(),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_dequeued: self.total_dequeued.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring_core::Endpoint;
    use std::sync::Arc;

    fn write(label: &str) -> Command {
        Command::write(label, Endpoint::Control, vec![0])
    }

    #[test]
    fn test_fifo_order() {
        let queue = CommandQueue::new();
        queue.enqueue(write("a"));
        queue.enqueue_all([write("b"), Command::Disconnect, write("c")]);

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.dequeue().unwrap().label(), Some("a"));
        assert_eq!(queue.dequeue().unwrap().label(), Some("b"));
        assert!(queue.dequeue().unwrap().is_disconnect());
        assert_eq!(queue.dequeue().unwrap().label(), Some("c"));
        assert!(queue.dequeue().is_none());

        let stats = queue.stats();
        assert_eq!(stats.total_enqueued, 4);
        assert_eq!(stats.total_dequeued, 4);
        assert_eq!(stats.pending_count, 0);
    }

    #[test]
    fn test_clear() {
        let queue = CommandQueue::new();
        queue.enqueue_all([write("a"), write("b")]);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(CommandQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        queue.enqueue(write(&format!("{t}-{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 400);
        // Per-producer order survives interleaving
        let mut last = [-1i32; 4];
        while let Some(command) = queue.dequeue() {
            let label = command.label().unwrap().to_string();
            let (t, i) = label.split_once('-').unwrap();
            let (t, i): (usize, i32) = (t.parse().unwrap(), i.parse().unwrap());
            assert!(i > last[t]);
            last[t] = i;
        }
    }
}
