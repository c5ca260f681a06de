//! Bounded per-surface frame history used for jank classification.
//!
//! Records are appended in submission order and leave in the same order,
//! either classified or evicted. The history is diagnostic only: losing a
//! record never affects latching.

use std::collections::VecDeque;

use buffer_protocol::{CacheId, FrameNumber, Nanos, PresentTiming};
use fence::Fence;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_FRAME_RECORDS: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameTrackerConfig {
    pub max_records: usize,
}

impl Default for FrameTrackerConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_FRAME_RECORDS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameRecordState {
    Pending,
    Latched,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JankType {
    None,
    /// The buffer's acquire fence signaled after the requested present time.
    AppDeadlineMissed,
    /// The buffer was ready in time but latched after the requested present time.
    LatchedLate,
    Dropped,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTimings {
    pub frame_number: FrameNumber,
    pub cache_id: CacheId,
    pub post_time: Nanos,
    pub requested_present: PresentTiming,
    pub acquire_time: Option<Nanos>,
    pub latch_time: Option<Nanos>,
    pub release_time: Option<Nanos>,
    pub state: FrameRecordState,
}

#[derive(Debug, Clone)]
pub struct SurfaceFrameRecord {
    timings: FrameTimings,
    acquire_fence: Fence,
}

impl SurfaceFrameRecord {
    pub fn timings(&self) -> &FrameTimings {
        &self.timings
    }

    pub fn frame_number(&self) -> FrameNumber {
        self.timings.frame_number
    }

    pub fn acquire_fence(&self) -> &Fence {
        &self.acquire_fence
    }

    fn refresh_acquire_time(&mut self) {
        if self.timings.acquire_time.is_some() {
            return;
        }
        if !self.acquire_fence.is_valid() {
            self.timings.acquire_time = Some(self.timings.post_time);
        } else {
            self.timings.acquire_time = self.acquire_fence.signal_time();
        }
    }

    /// Dropped frames are final right away; latched frames once the acquire
    /// fence has settled.
    pub fn is_final(&self) -> bool {
        match self.timings.state {
            FrameRecordState::Pending => false,
            FrameRecordState::Dropped => true,
            FrameRecordState::Latched => {
                self.timings.acquire_time.is_some() || self.acquire_fence.is_signaled()
            }
        }
    }

    pub fn classify(&self) -> JankType {
        match self.timings.state {
            FrameRecordState::Pending => JankType::Unknown,
            FrameRecordState::Dropped => JankType::Dropped,
            FrameRecordState::Latched => {
                let Some(acquire_time) = self.timings.acquire_time else {
                    return JankType::Unknown;
                };
                let Some(deadline) = self.timings.requested_present.desired() else {
                    return JankType::None;
                };
                if acquire_time > deadline {
                    JankType::AppDeadlineMissed
                } else if self
                    .timings
                    .latch_time
                    .is_some_and(|latch_time| latch_time > deadline)
                {
                    JankType::LatchedLate
                } else {
                    JankType::None
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedFrame {
    pub timings: FrameTimings,
    pub jank: JankType,
}

/// Downstream consumer of finalized frames.
pub trait JankClassifier {
    fn on_frame_classified(&mut self, frame: ClassifiedFrame);
}

impl JankClassifier for Vec<ClassifiedFrame> {
    fn on_frame_classified(&mut self, frame: ClassifiedFrame) {
        self.push(frame);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTrackerSnapshot {
    pub max_records: usize,
    pub evicted: u64,
    pub classified: u64,
    pub live: Vec<FrameTimings>,
}

#[derive(Debug)]
pub struct FrameEventTracker {
    config: FrameTrackerConfig,
    records: VecDeque<SurfaceFrameRecord>,
    evicted: u64,
    classified: u64,
}

impl FrameEventTracker {
    pub fn new(config: FrameTrackerConfig) -> Self {
        assert!(
            config.max_records > 0,
            "frame tracker must keep at least one record"
        );
        Self {
            config,
            records: VecDeque::with_capacity(config.max_records),
            evicted: 0,
            classified: 0,
        }
    }

    pub fn config(&self) -> FrameTrackerConfig {
        self.config
    }

    /// Appends a record for a freshly submitted frame. Returns the oldest
    /// record when the bound was exceeded.
    pub fn on_submitted(
        &mut self,
        frame_number: FrameNumber,
        cache_id: CacheId,
        post_time: Nanos,
        requested_present: PresentTiming,
        acquire_fence: Fence,
    ) -> Option<SurfaceFrameRecord> {
        self.records.push_back(SurfaceFrameRecord {
            timings: FrameTimings {
                frame_number,
                cache_id,
                post_time,
                requested_present,
                acquire_time: None,
                latch_time: None,
                release_time: None,
                state: FrameRecordState::Pending,
            },
            acquire_fence,
        });
        if self.records.len() <= self.config.max_records {
            return None;
        }
        let evicted = self.records.pop_front()?;
        self.evicted += 1;
        tracing::debug!(
            frame_number = evicted.frame_number(),
            "frame record evicted before classification"
        );
        Some(evicted)
    }

    pub fn on_dropped(&mut self, frame_number: FrameNumber) -> bool {
        self.update(frame_number, |timings| {
            timings.state = FrameRecordState::Dropped;
        })
    }

    pub fn on_latched(&mut self, frame_number: FrameNumber, latch_time: Nanos) -> bool {
        self.update(frame_number, |timings| {
            timings.state = FrameRecordState::Latched;
            timings.latch_time = Some(latch_time);
        })
    }

    pub fn on_acquire_signaled(&mut self, frame_number: FrameNumber, signal_time: Nanos) -> bool {
        self.update(frame_number, |timings| {
            timings.acquire_time.get_or_insert(signal_time);
        })
    }

    pub fn on_released(&mut self, frame_number: FrameNumber, release_time: Nanos) -> bool {
        self.update(frame_number, |timings| {
            timings.release_time = Some(release_time);
        })
    }

    /// Hands every final record at the head of the history to `classifier`,
    /// oldest first, stopping at the first record that is not final yet.
    pub fn drain_finalized(&mut self, classifier: &mut dyn JankClassifier) -> usize {
        let mut drained = 0;
        while let Some(front) = self.records.front_mut() {
            front.refresh_acquire_time();
            if !front.is_final() {
                break;
            }
            let Some(record) = self.records.pop_front() else {
                break;
            };
            let jank = record.classify();
            classifier.on_frame_classified(ClassifiedFrame {
                timings: record.timings,
                jank,
            });
            drained += 1;
        }
        self.classified += drained as u64;
        drained
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    pub fn classified_count(&self) -> u64 {
        self.classified
    }

    pub fn iter(&self) -> impl Iterator<Item = &SurfaceFrameRecord> + '_ {
        self.records.iter()
    }

    pub fn snapshot(&self) -> FrameTrackerSnapshot {
        FrameTrackerSnapshot {
            max_records: self.config.max_records,
            evicted: self.evicted,
            classified: self.classified,
            live: self
                .records
                .iter()
                .map(|record| record.timings.clone())
                .collect(),
        }
    }

    fn update(
        &mut self,
        frame_number: FrameNumber,
        apply: impl FnOnce(&mut FrameTimings),
    ) -> bool {
        let Some(record) = self
            .records
            .iter_mut()
            .rev()
            .find(|record| record.timings.frame_number == frame_number)
        else {
            return false;
        };
        apply(&mut record.timings);
        true
    }
}

impl Default for FrameEventTracker {
    fn default() -> Self {
        Self::new(FrameTrackerConfig::default())
    }
}
