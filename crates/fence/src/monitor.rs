use std::sync::{Arc, Mutex};

use buffer_protocol::Nanos;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::Fence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceSignaled<Tag> {
    pub tag: Tag,
    /// `None` when the fence went invalid instead of signaling.
    pub signal_time: Option<Nanos>,
}

#[derive(Debug)]
struct WatchedFence<Tag> {
    fence: Fence,
    tag: Tag,
}

/// Registration side of the fence monitor. Clones share one list and may be
/// used from any thread.
#[derive(Debug)]
pub struct FenceWatchList<Tag> {
    entries: Arc<Mutex<Vec<WatchedFence<Tag>>>>,
}

impl<Tag> Clone for FenceWatchList<Tag> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Tag> FenceWatchList<Tag> {
    pub fn watch(&self, fence: Fence, tag: Tag) {
        self.entries
            .lock()
            .expect("fence watch list lock poisoned")
            .push(WatchedFence { fence, tag });
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("fence watch list lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops watching every entry whose tag matches. Returns how many were
    /// removed.
    pub fn forget(&self, mut predicate: impl FnMut(&Tag) -> bool) -> usize {
        let mut entries = self
            .entries
            .lock()
            .expect("fence watch list lock poisoned");
        let before = entries.len();
        entries.retain(|entry| !predicate(&entry.tag));
        before - entries.len()
    }
}

/// Single producer of [`FenceSignaled`] events.
pub struct FencePoller<Tag> {
    watch_list: FenceWatchList<Tag>,
    producer: Producer<FenceSignaled<Tag>>,
    delivered: u64,
}

impl<Tag> FencePoller<Tag>
where
    Tag: Copy + std::fmt::Debug,
{
    /// Moves every settled fence into the event queue, keeping watch order.
    /// Entries that do not fit stay watched until the next poll.
    pub fn poll(&mut self) -> usize {
        let mut entries = self
            .watch_list
            .entries
            .lock()
            .expect("fence watch list lock poisoned");
        let mut pushed = 0;
        let mut queue_full = false;
        entries.retain(|entry| {
            if queue_full || !entry.fence.is_signaled() {
                return true;
            }
            if entry.fence.is_stale() {
                tracing::debug!(tag = ?entry.tag, "watched fence went invalid");
            }
            let event = FenceSignaled {
                tag: entry.tag,
                signal_time: entry.fence.signal_time(),
            };
            match self.producer.push(event) {
                Ok(()) => {
                    pushed += 1;
                    false
                }
                Err(_) => {
                    queue_full = true;
                    true
                }
            }
        });
        if queue_full {
            tracing::debug!(
                remaining = entries.len(),
                "fence event queue full; deferring to next poll"
            );
        }
        self.delivered += pushed as u64;
        pushed
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn watch_list(&self) -> &FenceWatchList<Tag> {
        &self.watch_list
    }
}

/// Single consumer of [`FenceSignaled`] events, owned by the presentation
/// path.
pub struct FenceEventQueue<Tag> {
    consumer: Consumer<FenceSignaled<Tag>>,
}

impl<Tag> FenceEventQueue<Tag> {
    pub fn pop(&mut self) -> Option<FenceSignaled<Tag>> {
        self.consumer.pop().ok()
    }

    /// Appends every queued event to `output` and returns how many were
    /// moved. `output` is not cleared.
    pub fn drain_into(&mut self, output: &mut Vec<FenceSignaled<Tag>>) -> usize {
        let mut drained = 0;
        while let Ok(event) = self.consumer.pop() {
            output.push(event);
            drained += 1;
        }
        drained
    }

    pub fn items(&self) -> usize {
        self.consumer.slots()
    }
}

pub fn fence_event_queue<Tag>(
    capacity: usize,
) -> (FenceWatchList<Tag>, FencePoller<Tag>, FenceEventQueue<Tag>) {
    assert!(capacity > 0, "fence event capacity must be greater than zero");
    let watch_list = FenceWatchList {
        entries: Arc::new(Mutex::new(Vec::new())),
    };
    let (producer, consumer) = RingBuffer::new(capacity);
    (
        watch_list.clone(),
        FencePoller {
            watch_list,
            producer,
            delivered: 0,
        },
        FenceEventQueue { consumer },
    )
}
