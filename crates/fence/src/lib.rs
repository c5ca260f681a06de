//! Synchronization fences as seen by the latching core.
//!
//! The real fence backend (kernel sync files, GPU timelines, ...) lives
//! outside this workspace and plugs in through [`SyncPrimitive`]. Nothing in
//! here ever blocks waiting for a fence: callers poll [`Fence::is_signaled`]
//! or hand the fence to a [`monitor::FencePoller`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use buffer_protocol::Nanos;
use smallvec::SmallVec;

pub mod monitor;

pub use monitor::{FenceEventQueue, FencePoller, FenceSignaled, FenceWatchList, fence_event_queue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Unsignaled,
    Signaled(Nanos),
    /// The backend reported an error or lost track of the fence.
    Invalid,
}

pub trait SyncPrimitive: Send + Sync + fmt::Debug {
    fn status(&self) -> FenceStatus;
}

#[derive(Debug)]
enum FenceNode {
    Primitive(Arc<dyn SyncPrimitive>),
    Merged(SmallVec<[Fence; 4]>),
}

/// Immutable, cheaply clonable fence handle.
///
/// The default value is the null fence: it carries no primitive, counts as
/// signaled and has no signal time.
#[derive(Clone, Default)]
pub struct Fence {
    node: Option<Arc<FenceNode>>,
}

impl Fence {
    pub const NO_FENCE: Fence = Fence { node: None };

    pub fn from_primitive(primitive: Arc<dyn SyncPrimitive>) -> Self {
        Self {
            node: Some(Arc::new(FenceNode::Primitive(primitive))),
        }
    }

    /// Creates an unsignaled in-process fence and the handle that signals it.
    pub fn pending() -> (Fence, FenceSignaler) {
        let primitive = Arc::new(SoftwareFence::new());
        let fence = Fence::from_primitive(primitive.clone());
        (fence, FenceSignaler { primitive })
    }

    pub fn signaled_at(time: Nanos) -> Fence {
        let (fence, signaler) = Fence::pending();
        signaler.signal(time);
        fence
    }

    /// False only for the null fence.
    pub fn is_valid(&self) -> bool {
        self.node.is_some()
    }

    pub fn status(&self) -> FenceStatus {
        let Some(node) = &self.node else {
            return FenceStatus::Invalid;
        };
        match node.as_ref() {
            FenceNode::Primitive(primitive) => primitive.status(),
            FenceNode::Merged(parts) => merged_status(parts),
        }
    }

    /// Invalid fences count as signaled so a broken producer can never pin a
    /// buffer or a cache slot.
    pub fn is_signaled(&self) -> bool {
        !matches!(self.status(), FenceStatus::Unsignaled)
    }

    /// A real fence whose backend reported an error.
    pub fn is_stale(&self) -> bool {
        self.is_valid() && matches!(self.status(), FenceStatus::Invalid)
    }

    pub fn signal_time(&self) -> Option<Nanos> {
        match self.status() {
            FenceStatus::Signaled(time) => Some(time),
            FenceStatus::Unsignaled | FenceStatus::Invalid => None,
        }
    }

    /// Fence that signals once both `self` and `other` have signaled.
    pub fn merge(&self, other: &Fence) -> Fence {
        match (&self.node, &other.node) {
            (None, _) => other.clone(),
            (_, None) => self.clone(),
            (Some(left), Some(right)) if Arc::ptr_eq(left, right) => self.clone(),
            (Some(_), Some(_)) => {
                let mut parts = SmallVec::<[Fence; 4]>::new();
                self.push_leaves(&mut parts);
                other.push_leaves(&mut parts);
                Fence {
                    node: Some(Arc::new(FenceNode::Merged(parts))),
                }
            }
        }
    }

    pub fn ptr_eq(&self, other: &Fence) -> bool {
        match (&self.node, &other.node) {
            (None, None) => true,
            (Some(left), Some(right)) => Arc::ptr_eq(left, right),
            _ => false,
        }
    }

    fn push_leaves(&self, parts: &mut SmallVec<[Fence; 4]>) {
        let Some(node) = &self.node else {
            return;
        };
        match node.as_ref() {
            FenceNode::Primitive(_) => {
                if !parts.iter().any(|part| part.ptr_eq(self)) {
                    parts.push(self.clone());
                }
            }
            FenceNode::Merged(children) => {
                for child in children {
                    child.push_leaves(parts);
                }
            }
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return formatter.write_str("Fence::NO_FENCE");
        }
        formatter
            .debug_struct("Fence")
            .field("status", &self.status())
            .finish()
    }
}

fn merged_status(parts: &[Fence]) -> FenceStatus {
    let mut latest: Option<Nanos> = None;
    for part in parts {
        match part.status() {
            FenceStatus::Unsignaled => return FenceStatus::Unsignaled,
            FenceStatus::Signaled(time) => {
                latest = Some(latest.map_or(time, |current| current.max(time)));
            }
            FenceStatus::Invalid => {}
        }
    }
    match latest {
        Some(time) => FenceStatus::Signaled(time),
        None => FenceStatus::Invalid,
    }
}

const STATE_PENDING: i64 = -1;
const STATE_INVALID: i64 = -2;

/// In-process fence primitive. Timestamps are clamped to be non-negative;
/// negative values encode the pending and invalid states.
#[derive(Debug)]
pub struct SoftwareFence {
    state: AtomicI64,
}

impl SoftwareFence {
    fn new() -> Self {
        Self {
            state: AtomicI64::new(STATE_PENDING),
        }
    }

    fn settle(&self, value: i64) -> bool {
        self.state
            .compare_exchange(STATE_PENDING, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl SyncPrimitive for SoftwareFence {
    fn status(&self) -> FenceStatus {
        match self.state.load(Ordering::Acquire) {
            STATE_PENDING => FenceStatus::Unsignaled,
            STATE_INVALID => FenceStatus::Invalid,
            time => FenceStatus::Signaled(Nanos(time)),
        }
    }
}

/// Producer side of a [`SoftwareFence`]. The first settle wins.
#[derive(Debug, Clone)]
pub struct FenceSignaler {
    primitive: Arc<SoftwareFence>,
}

impl FenceSignaler {
    pub fn signal(&self, time: Nanos) -> bool {
        self.primitive.settle(time.0.max(0))
    }

    pub fn fail(&self) -> bool {
        self.primitive.settle(STATE_INVALID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_fence_is_signaled_without_time() {
        let fence = Fence::NO_FENCE;
        assert!(!fence.is_valid());
        assert!(fence.is_signaled());
        assert!(!fence.is_stale());
        assert_eq!(fence.signal_time(), None);
    }

    #[test]
    fn software_fence_reports_first_signal_only() {
        let (fence, signaler) = Fence::pending();
        assert!(!fence.is_signaled());
        assert!(signaler.signal(Nanos(40)));
        assert!(!signaler.signal(Nanos(90)));
        assert!(!signaler.fail());
        assert_eq!(fence.signal_time(), Some(Nanos(40)));
    }

    #[test]
    fn failed_fence_counts_as_signaled_and_stale() {
        let (fence, signaler) = Fence::pending();
        signaler.fail();
        assert!(fence.is_signaled());
        assert!(fence.is_stale());
        assert_eq!(fence.signal_time(), None);
    }

    #[test]
    fn merged_fence_waits_for_both_inputs() {
        let (first, first_signaler) = Fence::pending();
        let (second, second_signaler) = Fence::pending();
        let merged = first.merge(&second);

        first_signaler.signal(Nanos(70));
        assert!(!merged.is_signaled());

        second_signaler.signal(Nanos(50));
        assert!(merged.is_signaled());
        assert_eq!(merged.signal_time(), Some(Nanos(70)));
    }

    #[test]
    fn merge_with_null_fence_returns_other_side() {
        let (fence, _signaler) = Fence::pending();
        assert!(Fence::NO_FENCE.merge(&fence).ptr_eq(&fence));
        assert!(fence.merge(&Fence::NO_FENCE).ptr_eq(&fence));
        assert!(fence.merge(&fence).ptr_eq(&fence));
    }

    #[test]
    fn merged_fence_tolerates_stale_input() {
        let (stale, stale_signaler) = Fence::pending();
        stale_signaler.fail();
        let merged = stale.merge(&Fence::signaled_at(Nanos(12)));
        assert!(merged.is_signaled());
        assert_eq!(merged.signal_time(), Some(Nanos(12)));
    }

    #[test]
    fn nested_merges_flatten_duplicate_leaves() {
        let (a, a_signaler) = Fence::pending();
        let (b, b_signaler) = Fence::pending();
        let ab = a.merge(&b);
        let aba = ab.merge(&a);

        a_signaler.signal(Nanos(1));
        b_signaler.signal(Nanos(2));
        assert_eq!(aba.signal_time(), Some(Nanos(2)));
        match aba.node.as_deref() {
            Some(FenceNode::Merged(parts)) => assert_eq!(parts.len(), 2),
            other => panic!("expected merged node, got {other:?}"),
        }
    }
}
