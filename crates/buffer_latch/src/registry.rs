use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use buffer_protocol::{CacheId, Clock, FrameNumber, Nanos, SurfaceId};
use buffer_state::{BufferState, BufferSubmission, LatchOutcome, SubmitOutcome, TeardownReport};
use fence::{Fence, FenceWatchList, fence_event_queue};
use hwc_slots::{ClientCacheNotifier, HwcSlotAllocator, HwcSlotAllocatorCreateError};
use slotmap::SlotMap;

use crate::actor::PresentationActor;
use crate::config::{BufferLatchConfig, ConfigError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown surface {0:?}")]
    UnknownSurface(SurfaceId),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    SlotAllocator(#[from] HwcSlotAllocatorCreateError),
}

/// Identifies the frame an acquire fence belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireFenceTag {
    pub surface: SurfaceId,
    pub frame_number: FrameNumber,
}

#[derive(Debug)]
pub struct Surface {
    id: SurfaceId,
    name: String,
    state: Mutex<BufferState>,
}

impl Surface {
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit, latch and release all run under this lock.
    pub fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state
            .lock()
            .expect("surface buffer state lock poisoned")
    }
}

/// Owns every surface together with the slot pool they share.
pub struct SurfaceRegistry {
    config: BufferLatchConfig,
    clock: Arc<dyn Clock>,
    allocator: Arc<HwcSlotAllocator>,
    notifier: ClientCacheNotifier,
    surfaces: RwLock<SlotMap<SurfaceId, Arc<Surface>>>,
    acquire_fences: FenceWatchList<AcquireFenceTag>,
}

impl SurfaceRegistry {
    /// Builds the registry and the actor that drives presentation for it.
    pub fn new(
        config: BufferLatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(Arc<Self>, PresentationActor), RegistryError> {
        config.validate()?;
        let allocator = Arc::new(HwcSlotAllocator::new(config.slots)?);
        let notifier = ClientCacheNotifier::new();
        notifier.register(&allocator);
        let (acquire_fences, poller, events) = fence_event_queue(config.fence_event_capacity);

        let registry = Arc::new(Self {
            config,
            clock,
            allocator,
            notifier,
            surfaces: RwLock::new(SlotMap::with_key()),
            acquire_fences,
        });
        let actor = PresentationActor::new(registry.clone(), poller, events);
        Ok((registry, actor))
    }

    pub fn config(&self) -> &BufferLatchConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn allocator(&self) -> &Arc<HwcSlotAllocator> {
        &self.allocator
    }

    pub fn notifier(&self) -> &ClientCacheNotifier {
        &self.notifier
    }

    pub fn create_surface(&self, name: &str) -> SurfaceId {
        let mut surfaces = self
            .surfaces
            .write()
            .expect("surface registry lock poisoned");
        let id = surfaces.insert_with_key(|id| {
            Arc::new(Surface {
                id,
                name: name.to_owned(),
                state: Mutex::new(BufferState::new(
                    id,
                    name,
                    self.config.buffer_state,
                    self.allocator.clone(),
                    self.clock.clone(),
                )),
            })
        });
        tracing::debug!(surface = name, ?id, "surface created");
        id
    }

    pub fn surface(&self, id: SurfaceId) -> Result<Arc<Surface>, RegistryError> {
        self.surfaces
            .read()
            .expect("surface registry lock poisoned")
            .get(id)
            .cloned()
            .ok_or(RegistryError::UnknownSurface(id))
    }

    /// Surfaces in registry order.
    pub fn surfaces(&self) -> Vec<Arc<Surface>> {
        self.surfaces
            .read()
            .expect("surface registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn submit(
        &self,
        id: SurfaceId,
        submission: BufferSubmission,
    ) -> Result<SubmitOutcome, RegistryError> {
        let surface = self.surface(id)?;
        let acquire_fence = submission.acquire_fence.clone();
        let frame_number = submission.frame_number();
        let outcome = surface.lock().submit(submission);
        if let SubmitOutcome::Queued {
            stomped: Some(stomped),
            ..
        } = outcome
        {
            self.acquire_fences.forget(|tag| {
                tag.surface == id && tag.frame_number == stomped.frame_number
            });
        }
        if matches!(outcome, SubmitOutcome::Queued { .. })
            && acquire_fence.is_valid()
            && !acquire_fence.is_signaled()
        {
            self.acquire_fences.watch(
                acquire_fence,
                AcquireFenceTag {
                    surface: id,
                    frame_number,
                },
            );
        }
        Ok(outcome)
    }

    pub fn latch(
        &self,
        id: SurfaceId,
        expected_present_time: Nanos,
    ) -> Result<LatchOutcome, RegistryError> {
        Ok(self.surface(id)?.lock().latch(expected_present_time))
    }

    pub fn on_displayed(&self, id: SurfaceId, release_fence: Fence) -> Result<bool, RegistryError> {
        Ok(self.surface(id)?.lock().on_displayed(release_fence))
    }

    /// Removes the surface and releases its buffers and unshared slots
    /// without waiting on any fence.
    pub fn destroy_surface(&self, id: SurfaceId) -> Result<TeardownReport, RegistryError> {
        let surface = self
            .surfaces
            .write()
            .expect("surface registry lock poisoned")
            .remove(id)
            .ok_or(RegistryError::UnknownSurface(id))?;
        let report = surface.lock().teardown();
        let forgotten = self.acquire_fences.forget(|tag| tag.surface == id);
        tracing::debug!(
            surface = surface.name(),
            forgotten_fences = forgotten,
            "surface destroyed"
        );
        Ok(report)
    }

    /// Entry point for client cache teardown.
    pub fn notify_cache_erased(&self, cache_id: CacheId) -> usize {
        self.notifier.notify_erased(cache_id)
    }

    pub fn watched_fence_count(&self) -> usize {
        self.acquire_fences.len()
    }

    pub fn len(&self) -> usize {
        self.surfaces
            .read()
            .expect("surface registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SurfaceRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SurfaceRegistry")
            .field("surfaces", &self.len())
            .field("allocator", &self.allocator)
            .field("notifier", &self.notifier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use buffer_protocol::{BufferId, BufferIdentity, ManualClock};

    use super::*;

    fn registry() -> (Arc<SurfaceRegistry>, PresentationActor) {
        let config = BufferLatchConfig {
            slots: hwc_slots::HwcSlotAllocatorConfig { capacity: 4 },
            ..BufferLatchConfig::default()
        };
        SurfaceRegistry::new(config, Arc::new(ManualClock::new(Nanos(0))))
            .expect("create registry")
    }

    fn submission(frame_number: FrameNumber, cache: CacheId) -> BufferSubmission {
        BufferSubmission::new(
            BufferIdentity::new(BufferId(frame_number), frame_number),
            cache,
        )
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = BufferLatchConfig {
            fence_event_capacity: 0,
            ..BufferLatchConfig::default()
        };
        let error = SurfaceRegistry::new(config, Arc::new(ManualClock::default()))
            .err()
            .expect("zero fence queue must fail");
        assert!(matches!(error, RegistryError::Config(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_surface_is_reported() {
        let (registry, _actor) = registry();
        let id = registry.create_surface("gone");
        registry.destroy_surface(id).expect("destroy surface");

        assert!(matches!(
            registry.submit(id, submission(1, CacheId::new(1, 1))),
            Err(RegistryError::UnknownSurface(missing)) if missing == id
        ));
        assert!(matches!(
            registry.destroy_surface(id),
            Err(RegistryError::UnknownSurface(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn destroying_surface_keeps_slots_shared_with_other_surfaces() {
        let (registry, _actor) = registry();
        let left = registry.create_surface("left");
        let right = registry.create_surface("right");
        let shared = CacheId::new(1, 1);
        let private = CacheId::new(1, 2);

        registry.submit(left, submission(1, shared)).expect("submit");
        registry.latch(left, Nanos(0)).expect("latch");
        registry.submit(left, submission(2, private)).expect("submit");
        registry.latch(left, Nanos(0)).expect("latch");
        registry.submit(right, submission(1, shared)).expect("submit");
        registry.latch(right, Nanos(0)).expect("latch");

        let report = registry.destroy_surface(left).expect("destroy left");
        assert_eq!(report.erased_cache_ids, vec![private]);
        assert_eq!(registry.allocator().slot_of(private), None);
        assert!(registry.allocator().slot_of(shared).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn cache_erasure_frees_slot_through_notifier() {
        let (registry, _actor) = registry();
        let id = registry.create_surface("client");
        let cache_id = CacheId::new(9, 1);
        registry.submit(id, submission(1, cache_id)).expect("submit");
        registry.latch(id, Nanos(0)).expect("latch");
        assert!(registry.allocator().slot_of(cache_id).is_some());

        assert_eq!(registry.notify_cache_erased(cache_id), 1);
        assert_eq!(registry.allocator().slot_of(cache_id), None);
        assert_eq!(registry.allocator().free_count(), 4);
    }

    #[test]
    fn destroyed_surface_forgets_only_its_acquire_fences() {
        let (registry, _actor) = registry();
        let id = registry.create_surface("watched");
        let (fence, _signaler) = Fence::pending();

        let mut pending = submission(1, CacheId::new(1, 1));
        pending.acquire_fence = fence;
        registry.submit(id, pending).expect("submit");
        assert_eq!(registry.watched_fence_count(), 1);
        let other = registry.create_surface("other");
        let (other_fence, _other_signaler) = Fence::pending();
        let mut elsewhere = submission(1, CacheId::new(1, 2));
        elsewhere.acquire_fence = other_fence;
        registry.submit(other, elsewhere).expect("submit");
        assert_eq!(registry.watched_fence_count(), 2);

        registry.destroy_surface(id).expect("destroy surface");
        assert_eq!(registry.watched_fence_count(), 1);
    }

    #[test]
    fn stomped_submission_stops_watching_its_acquire_fence() {
        let (registry, _actor) = registry();
        let id = registry.create_surface("stomping");

        for frame_number in 1..=3 {
            let (fence, _signaler) = Fence::pending();
            let mut pending = submission(frame_number, CacheId::new(1, 1));
            pending.acquire_fence = fence;
            registry.submit(id, pending).expect("submit");
            assert_eq!(registry.watched_fence_count(), 1);
        }

        let mut ready = submission(4, CacheId::new(1, 1));
        ready.acquire_fence = Fence::signaled_at(Nanos(3));
        registry.submit(id, ready).expect("submit");
        assert_eq!(registry.watched_fence_count(), 0);
    }
}
