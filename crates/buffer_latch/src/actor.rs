use std::sync::Arc;

use buffer_protocol::{Nanos, SurfaceId};
use buffer_state::{DisplayableBuffer, LatchOutcome};
use fence::{Fence, FenceEventQueue, FencePoller, FenceSignaled};
use frame_timeline::JankClassifier;

use crate::registry::{AcquireFenceTag, RegistryError, SurfaceRegistry};

/// Presentation-path driver. Owns the consuming end of the acquire-fence
/// queue, so fence signals reach surfaces only from this actor's thread.
pub struct PresentationActor {
    registry: Arc<SurfaceRegistry>,
    poller: FencePoller<AcquireFenceTag>,
    events: FenceEventQueue<AcquireFenceTag>,
    scratch: Vec<FenceSignaled<AcquireFenceTag>>,
}

impl PresentationActor {
    pub(crate) fn new(
        registry: Arc<SurfaceRegistry>,
        poller: FencePoller<AcquireFenceTag>,
        events: FenceEventQueue<AcquireFenceTag>,
    ) -> Self {
        Self {
            registry,
            poller,
            events,
            scratch: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SurfaceRegistry> {
        &self.registry
    }

    /// Applies every acquire fence that has settled since the last pump.
    /// Returns the number of events applied to live surfaces.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let polled = self.poller.poll();
            self.scratch.clear();
            self.events.drain_into(&mut self.scratch);
            for event in &self.scratch {
                let tag = event.tag;
                match self.registry.surface(tag.surface) {
                    Ok(surface) => {
                        surface
                            .lock()
                            .on_acquire_fence_signaled(tag.frame_number, event.signal_time);
                        applied += 1;
                    }
                    Err(_) => {
                        tracing::debug!(
                            surface = ?tag.surface,
                            frame_number = tag.frame_number,
                            "acquire fence signaled for destroyed surface"
                        );
                    }
                }
            }
            if polled == 0 {
                break;
            }
        }
        applied
    }

    /// Latches every surface for the refresh expected at
    /// `expected_present_time`.
    pub fn latch_all(&mut self, expected_present_time: Nanos) -> Vec<DisplayableBuffer> {
        self.pump();
        let mut displayable = Vec::new();
        for surface in self.registry.surfaces() {
            let outcome = surface.lock().latch(expected_present_time);
            match outcome {
                LatchOutcome::Latched(buffer) | LatchOutcome::Refreshed(buffer) => {
                    displayable.push(buffer);
                }
                LatchOutcome::NothingToLatch => {}
                other => {
                    tracing::trace!(surface = surface.name(), outcome = ?other, "surface not latched");
                }
            }
        }
        displayable
    }

    pub fn on_displayed(
        &self,
        surface: SurfaceId,
        release_fence: Fence,
    ) -> Result<bool, RegistryError> {
        self.registry.on_displayed(surface, release_fence)
    }

    /// Hands finalized frames of every surface to `classifier`, surface by
    /// surface.
    pub fn drain_jank(&self, classifier: &mut dyn JankClassifier) -> usize {
        self.registry
            .surfaces()
            .iter()
            .map(|surface| surface.lock().drain_jank_classifications(classifier))
            .sum()
    }
}
