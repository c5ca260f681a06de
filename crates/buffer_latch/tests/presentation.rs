use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use buffer_latch::{BufferLatchConfig, PresentationActor, SurfaceRegistry};
use buffer_protocol::{
    BufferId, BufferIdentity, CacheId, FrameNumber, HwcSlot, ManualClock, Nanos, SteadyClock,
};
use buffer_state::{
    BufferSubmission, ChannelListener, DropReason, LatchOutcome, ListenerEvent, ReleaseReason,
    SubmitOutcome, listener_channel,
};
use fence::Fence;
use frame_timeline::{ClassifiedFrame, JankType};
use hwc_slots::HwcSlotAllocatorConfig;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn build(capacity: u32, latch_unsignaled: bool) -> (Arc<SurfaceRegistry>, PresentationActor) {
    init_tracing();
    let mut config = BufferLatchConfig {
        slots: HwcSlotAllocatorConfig { capacity },
        ..BufferLatchConfig::default()
    };
    config.buffer_state.latch_unsignaled = latch_unsignaled;
    SurfaceRegistry::new(config, Arc::new(ManualClock::new(Nanos(0)))).expect("create registry")
}

fn submission(
    frame_number: FrameNumber,
    cache_id: CacheId,
    listener: &Arc<ChannelListener>,
) -> BufferSubmission {
    let mut submission = BufferSubmission::new(
        BufferIdentity::new(BufferId(frame_number), frame_number),
        cache_id,
    );
    submission.listeners.push(listener.clone());
    submission
}

#[test]
fn superseded_submission_never_gets_a_release() {
    let (registry, mut actor) = build(4, false);
    let (listener, notices) = listener_channel(16);
    let surface = registry.create_surface("app");
    let cache_a = CacheId::new(1, 0xA);

    registry
        .submit(surface, submission(1, cache_a, &listener))
        .expect("submit frame 1");
    let outcome = registry
        .submit(surface, submission(2, cache_a, &listener))
        .expect("submit frame 2");
    assert!(matches!(
        outcome,
        SubmitOutcome::Queued {
            pending_transactions: 1,
            ..
        }
    ));
    assert_eq!(
        registry
            .surface(surface)
            .expect("surface")
            .lock()
            .pending_transactions(),
        1
    );

    let latched = actor.latch_all(Nanos(100));
    assert_eq!(latched.len(), 1);
    assert_eq!(latched[0].buffer.frame_number, 2);
    assert!(!actor.on_displayed(surface, Fence::NO_FENCE).expect("on_displayed"));

    registry
        .submit(surface, submission(3, cache_a, &listener))
        .expect("submit frame 3");
    let latched = actor.latch_all(Nanos(200));
    assert!(latched[0].slot.cache_hit);
    assert!(actor.on_displayed(surface, Fence::NO_FENCE).expect("on_displayed"));

    let events = notices.try_iter().collect::<Vec<_>>();
    assert_eq!(events.len(), 2);
    match &events[0] {
        ListenerEvent::Dropped(notice) => {
            assert_eq!(notice.buffer.frame_number, 1);
            assert_eq!(notice.reason, DropReason::Stomped);
        }
        other => panic!("expected drop of frame 1, got {other:?}"),
    }
    match &events[1] {
        ListenerEvent::Released(notice) => {
            assert_eq!(notice.buffer.frame_number, 2);
            assert_eq!(notice.reason, ReleaseReason::Displayed);
        }
        other => panic!("expected release of frame 2, got {other:?}"),
    }
}

#[test]
fn surfaces_share_the_lru_slot_pool() {
    let (registry, mut actor) = build(2, false);
    let (listener, _notices) = listener_channel(16);
    let (a, b, c) = (CacheId::new(1, 1), CacheId::new(1, 2), CacheId::new(1, 3));
    let first = registry.create_surface("first");
    let second = registry.create_surface("second");

    let latch = |surface, frame_number, cache_id| {
        registry
            .submit(surface, submission(frame_number, cache_id, &listener))
            .expect("submit");
        let outcome = registry.latch(surface, Nanos(0)).expect("latch");
        outcome.into_displayable().expect("latched").slot
    };

    assert_eq!(latch(first, 1, a).slot, HwcSlot(0));
    assert_eq!(latch(second, 1, b).slot, HwcSlot(1));
    let hit = latch(first, 2, a);
    assert_eq!(hit.slot, HwcSlot(0));
    assert!(hit.cache_hit);

    let for_c = latch(second, 2, c);
    assert_eq!(for_c.slot, HwcSlot(1));
    assert!(!for_c.cache_hit);
    let for_b = latch(first, 3, b);
    assert_eq!(for_b.slot, HwcSlot(0));
    assert!(!for_b.cache_hit);
    assert!(registry.allocator().is_consistent());

    assert!(actor.latch_all(Nanos(0)).is_empty());
}

#[test]
fn unsignaled_acquire_fence_defers_latch_until_signaled() {
    let (registry, mut actor) = build(4, false);
    let (listener, _notices) = listener_channel(16);
    let surface = registry.create_surface("gpu-bound");
    let (fence, signaler) = Fence::pending();

    let mut pending = submission(1, CacheId::new(1, 1), &listener);
    pending.acquire_fence = fence;
    registry.submit(surface, pending).expect("submit");

    assert!(actor.latch_all(Nanos(10)).is_empty());
    assert!(matches!(
        registry.latch(surface, Nanos(10)).expect("latch"),
        LatchOutcome::FenceNotSignaled { frame_number: 1 }
    ));

    signaler.signal(Nanos(15));
    let latched = actor.latch_all(Nanos(20));
    assert_eq!(latched.len(), 1);
    assert_eq!(registry.watched_fence_count(), 0);
}

#[test]
fn pumped_fence_signal_completes_frame_classification() {
    let (registry, mut actor) = build(4, true);
    let (listener, _notices) = listener_channel(16);
    let surface = registry.create_surface("late");
    let (fence, signaler) = Fence::pending();

    let mut pending = submission(1, CacheId::new(1, 1), &listener);
    pending.acquire_fence = fence;
    pending.present = buffer_protocol::PresentTiming::At(Nanos(50));
    registry.submit(surface, pending).expect("submit");

    let latched = actor.latch_all(Nanos(50));
    assert_eq!(latched.len(), 1);
    assert!(!latched[0].acquire_fence.is_signaled());

    let mut classified: Vec<ClassifiedFrame> = Vec::new();
    assert_eq!(actor.drain_jank(&mut classified), 0);

    signaler.signal(Nanos(80));
    assert_eq!(actor.pump(), 1);
    let current = registry
        .surface(surface)
        .expect("surface")
        .lock()
        .current_buffer()
        .expect("current buffer");
    assert_eq!(current.acquire_time, Some(Nanos(80)));

    assert_eq!(actor.drain_jank(&mut classified), 1);
    assert_eq!(classified[0].jank, JankType::AppDeadlineMissed);
}

#[test]
fn concurrent_submission_and_presentation_account_for_every_buffer() {
    const FRAMES: FrameNumber = 200;
    init_tracing();

    let (registry, mut actor) = SurfaceRegistry::new(
        BufferLatchConfig {
            slots: HwcSlotAllocatorConfig { capacity: 3 },
            ..BufferLatchConfig::default()
        },
        Arc::new(SteadyClock::new()),
    )
    .expect("create registry");
    let (listener, notices) = listener_channel(FRAMES as usize * 2);
    let surface = registry.create_surface("stress");
    let done = Arc::new(AtomicBool::new(false));

    let submitter = {
        let registry = registry.clone();
        let listener = listener.clone();
        let done = done.clone();
        thread::spawn(move || {
            for frame_number in 1..=FRAMES {
                let cache_id = CacheId::new(7, frame_number % 5);
                registry
                    .submit(surface, submission(frame_number, cache_id, &listener))
                    .expect("submit");
                if frame_number % 3 == 0 {
                    thread::yield_now();
                }
            }
            done.store(true, Ordering::Release);
        })
    };

    let mut latched_frames = Vec::new();
    loop {
        let finished = done.load(Ordering::Acquire);
        for buffer in actor.latch_all(Nanos(0)) {
            latched_frames.push(buffer.buffer.frame_number);
            actor
                .on_displayed(buffer.surface, Fence::NO_FENCE)
                .expect("on_displayed");
        }
        let drained = registry
            .surface(surface)
            .expect("surface")
            .lock()
            .head_frame_number()
            .is_none();
        if finished && drained {
            break;
        }
        thread::yield_now();
    }
    submitter.join().expect("submitter panicked");

    assert!(latched_frames.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(latched_frames.last(), Some(&FRAMES));

    registry.destroy_surface(surface).expect("destroy surface");
    assert_eq!(registry.allocator().bound_count(), 0);

    let mut seen = HashSet::new();
    let mut released = 0;
    for event in notices.try_iter() {
        let frame_number = match event {
            ListenerEvent::Released(notice) => {
                released += 1;
                notice.buffer.frame_number
            }
            ListenerEvent::Dropped(notice) => notice.buffer.frame_number,
        };
        assert!(seen.insert(frame_number), "frame {frame_number} reported twice");
    }
    assert_eq!(seen.len(), FRAMES as usize);
    assert_eq!(released, latched_frames.len());
    assert_eq!(listener.lost_notices(), 0);
}
