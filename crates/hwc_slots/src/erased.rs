use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use buffer_protocol::CacheId;

use crate::HwcSlotAllocator;

/// Receives client cache teardown, either because the owning process died or
/// because the client released the cache entry explicitly.
pub trait CacheErasedRecipient: Send + Sync {
    fn buffer_erased(&self, cache_id: CacheId);
}

impl CacheErasedRecipient for HwcSlotAllocator {
    fn buffer_erased(&self, cache_id: CacheId) {
        if !self.erase(cache_id) {
            tracing::trace!(cache_id = %cache_id, "erased cache id had no hwc slot");
        }
    }
}

/// Fans cache teardown out to recipients without owning them.
#[derive(Default)]
pub struct ClientCacheNotifier {
    recipients: Mutex<Vec<Weak<dyn CacheErasedRecipient>>>,
}

impl ClientCacheNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<Recipient>(&self, recipient: &Arc<Recipient>)
    where
        Recipient: CacheErasedRecipient + 'static,
    {
        let weak = Arc::downgrade(recipient) as Weak<dyn CacheErasedRecipient>;
        self.recipients
            .lock()
            .expect("client cache notifier lock poisoned")
            .push(weak);
    }

    /// Notifies every live recipient and prunes the dead ones. Recipients are
    /// called after the notifier lock is released.
    pub fn notify_erased(&self, cache_id: CacheId) -> usize {
        let live = {
            let mut recipients = self
                .recipients
                .lock()
                .expect("client cache notifier lock poisoned");
            let mut live = Vec::with_capacity(recipients.len());
            recipients.retain(|weak| match weak.upgrade() {
                Some(recipient) => {
                    live.push(recipient);
                    true
                }
                None => false,
            });
            live
        };
        for recipient in &live {
            recipient.buffer_erased(cache_id);
        }
        live.len()
    }

    pub fn recipient_count(&self) -> usize {
        self.recipients
            .lock()
            .expect("client cache notifier lock poisoned")
            .len()
    }
}

impl fmt::Debug for ClientCacheNotifier {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ClientCacheNotifier")
            .field("recipients", &self.recipient_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_erases_binding_in_allocator() {
        let allocator = Arc::new(HwcSlotAllocator::with_capacity(2).expect("create allocator"));
        let notifier = ClientCacheNotifier::new();
        notifier.register(&allocator);

        let cache_id = CacheId::new(3, 1);
        allocator.resolve_slot(cache_id);
        assert_eq!(notifier.notify_erased(cache_id), 1);
        assert_eq!(allocator.slot_of(cache_id), None);
        assert_eq!(allocator.free_count(), 2);
    }

    #[test]
    fn notifier_does_not_keep_recipients_alive() {
        let notifier = ClientCacheNotifier::new();
        let allocator = Arc::new(HwcSlotAllocator::with_capacity(1).expect("create allocator"));
        let weak_allocator = Arc::downgrade(&allocator);
        notifier.register(&allocator);
        drop(allocator);

        assert!(weak_allocator.upgrade().is_none());
        assert_eq!(notifier.notify_erased(CacheId::new(1, 1)), 0);
        assert_eq!(notifier.recipient_count(), 0);
    }
}
