use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use buffer_protocol::{BufferIdentity, CacheId, Nanos, SurfaceId};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use fence::Fence;
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The display moved past the buffer.
    Displayed,
    /// A newer latch pushed the buffer out before it was reported displayed.
    Superseded,
    SurfaceDestroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// A newer submission replaced the buffer before it was latched.
    Stomped,
    SurfaceDestroyed,
}

#[derive(Debug, Clone)]
pub struct ReleaseNotice {
    pub surface: SurfaceId,
    pub buffer: BufferIdentity,
    pub cache_id: CacheId,
    /// The producer may reuse the buffer once this fence signals.
    pub release_fence: Fence,
    pub acquire_time: Option<Nanos>,
    pub latch_time: Nanos,
    pub reason: ReleaseReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropNotice {
    pub surface: SurfaceId,
    pub buffer: BufferIdentity,
    pub cache_id: CacheId,
    pub reason: DropReason,
}

/// Transaction-completion listener attached to a submission.
///
/// Called with the surface lock held; implementations must not call back
/// into the surface.
pub trait TransactionListener: Send + Sync {
    fn on_buffer_released(&self, notice: &ReleaseNotice);

    fn on_buffer_dropped(&self, _notice: &DropNotice) {}
}

pub type ListenerSet = SmallVec<[Arc<dyn TransactionListener>; 2]>;

pub(crate) fn notify_released(listeners: &ListenerSet, notice: &ReleaseNotice) {
    for listener in listeners {
        listener.on_buffer_released(notice);
    }
}

pub(crate) fn notify_dropped(listeners: &ListenerSet, notice: &DropNotice) {
    for listener in listeners {
        listener.on_buffer_dropped(notice);
    }
}

#[derive(Debug, Clone)]
pub enum ListenerEvent {
    Released(ReleaseNotice),
    Dropped(DropNotice),
}

/// Forwards notices to a client thread over a bounded channel. Never blocks:
/// notices that do not fit are lost and counted.
#[derive(Debug)]
pub struct ChannelListener {
    sender: Sender<ListenerEvent>,
    lost: AtomicU64,
}

impl ChannelListener {
    pub fn lost_notices(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    fn forward(&self, event: ListenerEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.lost.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(?event, "listener channel full; notice lost");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.lost.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("listener channel receiver gone");
            }
        }
    }
}

impl TransactionListener for ChannelListener {
    fn on_buffer_released(&self, notice: &ReleaseNotice) {
        self.forward(ListenerEvent::Released(notice.clone()));
    }

    fn on_buffer_dropped(&self, notice: &DropNotice) {
        self.forward(ListenerEvent::Dropped(*notice));
    }
}

pub fn listener_channel(capacity: usize) -> (Arc<ChannelListener>, Receiver<ListenerEvent>) {
    assert!(capacity > 0, "listener channel capacity must be greater than zero");
    let (sender, receiver) = bounded(capacity);
    let listener = Arc::new(ChannelListener {
        sender,
        lost: AtomicU64::new(0),
    });
    (listener, receiver)
}

#[cfg(test)]
mod tests {
    use buffer_protocol::BufferId;

    use super::*;

    fn drop_notice(frame_number: u64) -> DropNotice {
        DropNotice {
            surface: SurfaceId::default(),
            buffer: BufferIdentity::new(BufferId(frame_number), frame_number),
            cache_id: CacheId::new(1, 1),
            reason: DropReason::Stomped,
        }
    }

    #[test]
    fn full_channel_counts_lost_notices() {
        let (listener, receiver) = listener_channel(1);
        listener.on_buffer_dropped(&drop_notice(1));
        listener.on_buffer_dropped(&drop_notice(2));
        assert_eq!(listener.lost_notices(), 1);

        match receiver.try_recv() {
            Ok(ListenerEvent::Dropped(notice)) => assert_eq!(notice.buffer.frame_number, 1),
            other => panic!("expected dropped notice, got {other:?}"),
        }
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn disconnected_receiver_does_not_panic() {
        let (listener, receiver) = listener_channel(4);
        drop(receiver);
        listener.on_buffer_released(&ReleaseNotice {
            surface: SurfaceId::default(),
            buffer: BufferIdentity::new(BufferId(7), 7),
            cache_id: CacheId::new(1, 7),
            release_fence: Fence::NO_FENCE,
            acquire_time: None,
            latch_time: Nanos(1),
            reason: ReleaseReason::Displayed,
        });
        assert_eq!(listener.lost_notices(), 1);
    }
}
