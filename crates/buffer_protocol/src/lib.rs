use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

slotmap::new_key_type! {
    pub struct SurfaceId;
}

pub type FrameNumber = u64;

/// Monotonic timestamp in nanoseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Nanos(pub i64);

impl Nanos {
    pub const ZERO: Self = Self(0);

    pub fn saturating_add(self, delta: i64) -> Self {
        Self(self.0.saturating_add(delta))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferId(pub u64);

/// Producer-assigned buffer plus the frame it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferIdentity {
    pub buffer_id: BufferId,
    pub frame_number: FrameNumber,
}

impl BufferIdentity {
    pub fn new(buffer_id: BufferId, frame_number: FrameNumber) -> Self {
        Self {
            buffer_id,
            frame_number,
        }
    }
}

/// Client-side cache entry key.
///
/// Ordering is `(process_token, id)`; the slot allocator relies on it to break
/// LRU ties deterministically. Ids from different processes that alias the
/// same content stay distinct keys.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CacheId {
    pub process_token: u64,
    pub id: u64,
}

impl CacheId {
    pub const fn new(process_token: u64, id: u64) -> Self {
        Self { process_token, id }
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.process_token, self.id)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HwcSlot(pub u32);

impl HwcSlot {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Slot handed to the payload layer. On a hit the hardware already holds the
/// buffer and only the slot index needs to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotResolution {
    pub slot: HwcSlot,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresentTiming {
    Auto,
    At(Nanos),
}

impl PresentTiming {
    pub fn desired(self) -> Option<Nanos> {
        match self {
            PresentTiming::Auto => None,
            PresentTiming::At(time) => Some(time),
        }
    }

    /// Whether a frame with this intent may be shown on a refresh expected at
    /// `expected_present_time`.
    pub fn is_due(self, expected_present_time: Nanos) -> bool {
        match self {
            PresentTiming::Auto => true,
            PresentTiming::At(time) => time <= expected_present_time,
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Nanos;
}

#[derive(Debug, Clone, Copy)]
pub struct SteadyClock {
    origin: Instant,
}

impl SteadyClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SteadyClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SteadyClock {
    fn now(&self) -> Nanos {
        let elapsed = self.origin.elapsed().as_nanos();
        Nanos(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }
}

/// Clock that only moves when told to. Used by tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Nanos) -> Self {
        Self {
            now: AtomicI64::new(start.0),
        }
    }

    pub fn set(&self, time: Nanos) {
        self.now.store(time.0, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: i64) -> Nanos {
        let previous = self.now.fetch_add(delta, Ordering::SeqCst);
        Nanos(previous.saturating_add(delta))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Nanos {
        Nanos(self.now.load(Ordering::SeqCst))
    }
}
