use std::sync::Arc;

use buffer_protocol::{
    BufferIdentity, CacheId, Clock, FrameNumber, Nanos, PresentTiming, SlotResolution, SurfaceId,
};
use fence::Fence;
use frame_timeline::{FrameEventTracker, FrameTrackerConfig, FrameTrackerSnapshot, JankClassifier};
use hwc_slots::HwcSlotAllocator;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::counter::PendingBufferCounter;
use crate::listener::{
    DropNotice, DropReason, ListenerSet, ReleaseNotice, ReleaseReason, notify_dropped,
    notify_released,
};

pub const DEFAULT_COUNTER_TRACE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferStateConfig {
    /// Latch even when the acquire fence has not signaled; the consumer then
    /// waits on the fence carried by [`DisplayableBuffer`].
    pub latch_unsignaled: bool,
    pub frame_tracker: FrameTrackerConfig,
    pub counter_trace_capacity: usize,
}

impl Default for BufferStateConfig {
    fn default() -> Self {
        Self {
            latch_unsignaled: false,
            frame_tracker: FrameTrackerConfig::default(),
            counter_trace_capacity: DEFAULT_COUNTER_TRACE_CAPACITY,
        }
    }
}

pub struct BufferSubmission {
    pub buffer: BufferIdentity,
    pub acquire_fence: Fence,
    pub cache_id: CacheId,
    pub present: PresentTiming,
    pub auto_refresh: bool,
    pub listeners: ListenerSet,
}

impl BufferSubmission {
    pub fn new(buffer: BufferIdentity, cache_id: CacheId) -> Self {
        Self {
            buffer,
            acquire_fence: Fence::NO_FENCE,
            cache_id,
            present: PresentTiming::Auto,
            auto_refresh: false,
            listeners: ListenerSet::new(),
        }
    }

    pub fn frame_number(&self) -> FrameNumber {
        self.buffer.frame_number
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued {
        /// The unlatched buffer this submission replaced.
        stomped: Option<BufferIdentity>,
        pending_transactions: u64,
    },
    /// The surface was torn down; the submission was dropped.
    SurfaceDestroyed,
}

/// A freshly latched buffer ready to be handed to the display.
#[derive(Debug, Clone)]
pub struct DisplayableBuffer {
    pub surface: SurfaceId,
    pub buffer: BufferIdentity,
    pub cache_id: CacheId,
    pub slot: SlotResolution,
    /// May still be unsignaled when unsignaled latching is enabled.
    pub acquire_fence: Fence,
    pub latch_time: Nanos,
}

#[derive(Debug, Clone)]
pub enum LatchOutcome {
    Latched(DisplayableBuffer),
    /// Auto-refresh re-latch of the current buffer.
    Refreshed(DisplayableBuffer),
    NothingToLatch,
    Stale {
        frame_number: FrameNumber,
        last_latched: FrameNumber,
    },
    NotDue {
        desired_present_time: Nanos,
    },
    FenceNotSignaled {
        frame_number: FrameNumber,
    },
}

impl LatchOutcome {
    pub fn displayable(&self) -> Option<&DisplayableBuffer> {
        match self {
            LatchOutcome::Latched(buffer) | LatchOutcome::Refreshed(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn into_displayable(self) -> Option<DisplayableBuffer> {
        match self {
            LatchOutcome::Latched(buffer) | LatchOutcome::Refreshed(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn is_latched(&self) -> bool {
        matches!(self, LatchOutcome::Latched(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentBuffer {
    pub buffer: BufferIdentity,
    pub cache_id: CacheId,
    pub slot: SlotResolution,
    pub acquire_time: Option<Nanos>,
    pub latch_time: Nanos,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub dropped: Option<BufferIdentity>,
    pub released: SmallVec<[BufferIdentity; 2]>,
    pub erased_cache_ids: Vec<CacheId>,
}

struct PendingBuffer {
    buffer: BufferIdentity,
    acquire_fence: Fence,
    cache_id: CacheId,
    present: PresentTiming,
    post_time: Nanos,
    listeners: ListenerSet,
}

struct LatchedBuffer {
    buffer: BufferIdentity,
    acquire_fence: Fence,
    cache_id: CacheId,
    slot: SlotResolution,
    acquire_time: Option<Nanos>,
    latch_time: Nanos,
    listeners: ListenerSet,
}

struct PreviousBuffer {
    latched: LatchedBuffer,
    release_fence: Fence,
}

// Null acquire fences mean the buffer was ready when posted.
fn resolved_acquire_time(fence: &Fence, post_time: Nanos) -> Option<Nanos> {
    if fence.is_valid() {
        fence.signal_time()
    } else {
        Some(post_time)
    }
}

/// Buffer lifecycle of one surface: at most one pending buffer, the current
/// buffer and the previous buffer waiting for its release.
///
/// Not synchronized; the owner wraps it in the per-surface lock.
pub struct BufferState {
    surface: SurfaceId,
    name: String,
    config: BufferStateConfig,
    allocator: Arc<HwcSlotAllocator>,
    clock: Arc<dyn Clock>,
    counter: Arc<PendingBufferCounter>,
    frames: FrameEventTracker,
    pending: Option<PendingBuffer>,
    current: Option<LatchedBuffer>,
    previous: Option<PreviousBuffer>,
    last_latched_frame: Option<FrameNumber>,
    auto_refresh: bool,
    torn_down: bool,
}

impl BufferState {
    pub fn new(
        surface: SurfaceId,
        name: &str,
        config: BufferStateConfig,
        allocator: Arc<HwcSlotAllocator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            surface,
            name: name.to_owned(),
            config,
            allocator,
            clock,
            counter: Arc::new(PendingBufferCounter::new(name, config.counter_trace_capacity)),
            frames: FrameEventTracker::new(config.frame_tracker),
            pending: None,
            current: None,
            previous: None,
            last_latched_frame: None,
            auto_refresh: false,
            torn_down: false,
        }
    }

    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submit(&mut self, submission: BufferSubmission) -> SubmitOutcome {
        if self.torn_down {
            tracing::debug!(
                surface = %self.name,
                frame_number = submission.frame_number(),
                "submission to destroyed surface dropped"
            );
            notify_dropped(
                &submission.listeners,
                &DropNotice {
                    surface: self.surface,
                    buffer: submission.buffer,
                    cache_id: submission.cache_id,
                    reason: DropReason::SurfaceDestroyed,
                },
            );
            return SubmitOutcome::SurfaceDestroyed;
        }

        let now = self.clock.now();
        let stomped = self
            .pending
            .take()
            .map(|pending| self.drop_pending(pending, DropReason::Stomped, now));

        self.auto_refresh = submission.auto_refresh;
        let evicted = self.frames.on_submitted(
            submission.buffer.frame_number,
            submission.cache_id,
            now,
            submission.present,
            submission.acquire_fence.clone(),
        );
        if let Some(record) = evicted {
            tracing::trace!(
                surface = %self.name,
                frame_number = record.frame_number(),
                "frame history full"
            );
        }

        let pending_transactions = self.counter.increment(now);
        tracing::trace!(
            surface = %self.name,
            frame_number = submission.buffer.frame_number,
            cache_id = %submission.cache_id,
            pending_transactions,
            "buffer submitted"
        );
        self.pending = Some(PendingBuffer {
            buffer: submission.buffer,
            acquire_fence: submission.acquire_fence,
            cache_id: submission.cache_id,
            present: submission.present,
            post_time: now,
            listeners: submission.listeners,
        });
        SubmitOutcome::Queued {
            stomped,
            pending_transactions,
        }
    }

    pub fn latch(&mut self, expected_present_time: Nanos) -> LatchOutcome {
        let Some(pending) = &self.pending else {
            return self.refresh_current();
        };

        let resubmitted_current = self.auto_refresh
            && self.current.as_ref().is_some_and(|current| {
                current.buffer == pending.buffer && current.cache_id == pending.cache_id
            });
        if resubmitted_current {
            return self.absorb_resubmitted_current();
        }

        let frame_number = pending.buffer.frame_number;
        if let Some(last_latched) = self.last_latched_frame {
            if frame_number <= last_latched {
                tracing::debug!(
                    surface = %self.name,
                    frame_number,
                    last_latched,
                    "stale frame not latched"
                );
                return LatchOutcome::Stale {
                    frame_number,
                    last_latched,
                };
            }
        }
        if !pending.present.is_due(expected_present_time) {
            let desired_present_time = pending.present.desired().unwrap_or(expected_present_time);
            tracing::trace!(surface = %self.name, frame_number, "frame not due yet");
            return LatchOutcome::NotDue {
                desired_present_time,
            };
        }
        if !self.config.latch_unsignaled && !pending.acquire_fence.is_signaled() {
            tracing::trace!(surface = %self.name, frame_number, "acquire fence not signaled");
            return LatchOutcome::FenceNotSignaled { frame_number };
        }
        if pending.acquire_fence.is_stale() {
            tracing::warn!(
                surface = %self.name,
                frame_number,
                "acquire fence invalid; latching anyway"
            );
        }

        let Some(pending) = self.pending.take() else {
            return LatchOutcome::NothingToLatch;
        };
        let now = self.clock.now();

        if let Some(previous) = self.previous.take() {
            self.release(previous, ReleaseReason::Superseded, now);
        }
        if let Some(current) = self.current.take() {
            self.previous = Some(PreviousBuffer {
                latched: current,
                release_fence: Fence::NO_FENCE,
            });
        }

        self.counter.decrement(now);
        let slot = self
            .allocator
            .resolve_slot_for(self.surface, pending.cache_id);
        self.frames.on_latched(frame_number, now);
        self.last_latched_frame = Some(frame_number);

        let displayable = DisplayableBuffer {
            surface: self.surface,
            buffer: pending.buffer,
            cache_id: pending.cache_id,
            slot,
            acquire_fence: pending.acquire_fence.clone(),
            latch_time: now,
        };
        tracing::trace!(
            surface = %self.name,
            frame_number,
            slot = slot.slot.0,
            cache_hit = slot.cache_hit,
            "buffer latched"
        );
        self.current = Some(LatchedBuffer {
            buffer: pending.buffer,
            acquire_time: resolved_acquire_time(&pending.acquire_fence, pending.post_time),
            acquire_fence: pending.acquire_fence,
            cache_id: pending.cache_id,
            slot,
            latch_time: now,
            listeners: pending.listeners,
        });
        LatchOutcome::Latched(displayable)
    }

    // The pending entry repeats the current buffer: consume it and re-latch
    // the current buffer on its cached slot. Its listeners join the current
    // buffer's release.
    fn absorb_resubmitted_current(&mut self) -> LatchOutcome {
        let Some(pending) = self.pending.take() else {
            return LatchOutcome::NothingToLatch;
        };
        let now = self.clock.now();
        self.counter.decrement(now);
        self.frames.on_latched(pending.buffer.frame_number, now);

        let Some(current) = self.current.as_mut() else {
            return LatchOutcome::NothingToLatch;
        };
        for listener in pending.listeners {
            if !current
                .listeners
                .iter()
                .any(|known| Arc::ptr_eq(known, &listener))
            {
                current.listeners.push(listener);
            }
        }
        let slot = self
            .allocator
            .resolve_slot_for(self.surface, current.cache_id);
        current.slot = slot;
        tracing::trace!(
            surface = %self.name,
            frame_number = current.buffer.frame_number,
            slot = slot.slot.0,
            "resubmitted current buffer refreshed"
        );
        LatchOutcome::Refreshed(DisplayableBuffer {
            surface: self.surface,
            buffer: current.buffer,
            cache_id: current.cache_id,
            slot,
            acquire_fence: current.acquire_fence.clone(),
            latch_time: now,
        })
    }

    fn refresh_current(&mut self) -> LatchOutcome {
        let current = match &self.current {
            Some(current) if self.auto_refresh => current,
            _ => {
                tracing::trace!(surface = %self.name, "nothing to latch");
                return LatchOutcome::NothingToLatch;
            }
        };
        let slot = self
            .allocator
            .resolve_slot_for(self.surface, current.cache_id);
        LatchOutcome::Refreshed(DisplayableBuffer {
            surface: self.surface,
            buffer: current.buffer,
            cache_id: current.cache_id,
            slot,
            acquire_fence: current.acquire_fence.clone(),
            latch_time: self.clock.now(),
        })
    }

    /// Releases the previous buffer once the display no longer reads it.
    /// Returns false when there is nothing to release.
    pub fn on_displayed(&mut self, release_fence: Fence) -> bool {
        let Some(mut previous) = self.previous.take() else {
            tracing::trace!(surface = %self.name, "no previous buffer to release");
            return false;
        };
        previous.release_fence = previous.release_fence.merge(&release_fence);
        let now = self.clock.now();
        self.release(previous, ReleaseReason::Displayed, now);
        true
    }

    /// Records the acquire signal time delivered by the fence monitor.
    pub fn on_acquire_fence_signaled(
        &mut self,
        frame_number: FrameNumber,
        signal_time: Option<Nanos>,
    ) -> bool {
        let Some(signal_time) = signal_time else {
            return false;
        };
        if let Some(current) = &mut self.current {
            if current.buffer.frame_number == frame_number && current.acquire_time.is_none() {
                current.acquire_time = Some(signal_time);
            }
        }
        self.frames.on_acquire_signaled(frame_number, signal_time)
    }

    /// Destroys the surface's buffer state without waiting on any fence.
    pub fn teardown(&mut self) -> TeardownReport {
        if self.torn_down {
            return TeardownReport::default();
        }
        self.torn_down = true;
        self.auto_refresh = false;
        let now = self.clock.now();

        let mut report = TeardownReport {
            dropped: self
                .pending
                .take()
                .map(|pending| self.drop_pending(pending, DropReason::SurfaceDestroyed, now)),
            ..TeardownReport::default()
        };
        if let Some(previous) = self.previous.take() {
            report.released.push(previous.latched.buffer);
            self.release(previous, ReleaseReason::SurfaceDestroyed, now);
        }
        if let Some(current) = self.current.take() {
            report.released.push(current.buffer);
            let previous = PreviousBuffer {
                latched: current,
                release_fence: Fence::NO_FENCE,
            };
            self.release(previous, ReleaseReason::SurfaceDestroyed, now);
        }
        report.erased_cache_ids = self.allocator.release_owner(self.surface);
        tracing::debug!(
            surface = %self.name,
            released = report.released.len(),
            erased = report.erased_cache_ids.len(),
            "surface buffer state torn down"
        );
        report
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn set_auto_refresh(&mut self, auto_refresh: bool) -> bool {
        let changed = self.auto_refresh != auto_refresh;
        self.auto_refresh = auto_refresh;
        changed
    }

    pub fn auto_refresh(&self) -> bool {
        self.auto_refresh
    }

    /// Whether the next latch would produce a buffer, ignoring fences and
    /// present times.
    pub fn has_frame_update(&self) -> bool {
        self.pending.is_some() || (self.auto_refresh && self.current.is_some())
    }

    pub fn head_frame_number(&self) -> Option<FrameNumber> {
        self.pending.as_ref().map(|pending| pending.buffer.frame_number)
    }

    pub fn last_latched_frame(&self) -> Option<FrameNumber> {
        self.last_latched_frame
    }

    pub fn pending_transactions(&self) -> u64 {
        self.counter.value()
    }

    pub fn pending_counter(&self) -> &Arc<PendingBufferCounter> {
        &self.counter
    }

    pub fn current_buffer(&self) -> Option<CurrentBuffer> {
        self.current.as_ref().map(|current| CurrentBuffer {
            buffer: current.buffer,
            cache_id: current.cache_id,
            slot: current.slot,
            acquire_time: current.acquire_time,
            latch_time: current.latch_time,
        })
    }

    pub fn previous_buffer(&self) -> Option<BufferIdentity> {
        self.previous.as_ref().map(|previous| previous.latched.buffer)
    }

    pub fn drain_jank_classifications(&mut self, classifier: &mut dyn JankClassifier) -> usize {
        self.frames.drain_finalized(classifier)
    }

    pub fn frame_snapshot(&self) -> FrameTrackerSnapshot {
        self.frames.snapshot()
    }

    fn drop_pending(
        &mut self,
        pending: PendingBuffer,
        reason: DropReason,
        now: Nanos,
    ) -> BufferIdentity {
        self.counter.decrement(now);
        self.frames.on_dropped(pending.buffer.frame_number);
        tracing::debug!(
            surface = %self.name,
            frame_number = pending.buffer.frame_number,
            ?reason,
            "pending buffer dropped"
        );
        notify_dropped(
            &pending.listeners,
            &DropNotice {
                surface: self.surface,
                buffer: pending.buffer,
                cache_id: pending.cache_id,
                reason,
            },
        );
        pending.buffer
    }

    fn release(&mut self, previous: PreviousBuffer, reason: ReleaseReason, now: Nanos) {
        let PreviousBuffer {
            latched,
            release_fence,
        } = previous;
        self.frames.on_released(latched.buffer.frame_number, now);
        tracing::trace!(
            surface = %self.name,
            frame_number = latched.buffer.frame_number,
            ?reason,
            "buffer released"
        );
        notify_released(
            &latched.listeners,
            &ReleaseNotice {
                surface: self.surface,
                buffer: latched.buffer,
                cache_id: latched.cache_id,
                release_fence,
                acquire_time: latched.acquire_time,
                latch_time: latched.latch_time,
                reason,
            },
        );
    }
}

impl std::fmt::Debug for BufferState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BufferState")
            .field("surface", &self.surface)
            .field("name", &self.name)
            .field("head_frame_number", &self.head_frame_number())
            .field("current", &self.current_buffer())
            .field("previous", &self.previous_buffer())
            .field("last_latched_frame", &self.last_latched_frame)
            .field("auto_refresh", &self.auto_refresh)
            .field("torn_down", &self.torn_down)
            .finish()
    }
}
