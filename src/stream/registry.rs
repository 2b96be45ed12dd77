//! Subscription bookkeeping for the multiplexer.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::stream::proto::{StreamEvent, StreamKind};

/// Type-erased subscriber. Receives the event and the arguments bound at
/// subscription time.
pub type StreamHandler = Arc<dyn Fn(StreamEvent, Arc<[Value]>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    kind: StreamKind,
    handler: StreamHandler,
    args: Arc<[Value]>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F, Fut>(&self, kind: StreamKind, args: Vec<Value>, handler: F) -> SubscriptionId
    where
        F: Fn(StreamEvent, Arc<[Value]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: StreamHandler = Arc::new(
            move |event: StreamEvent, args: Arc<[Value]>| -> BoxFuture<'static, ()> {
                Box::pin(handler(event, args))
            },
        );
        self.insert_boxed(kind, args, handler)
    }

    pub fn insert_boxed(
        &self,
        kind: StreamKind,
        args: Vec<Value>,
        handler: StreamHandler,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                kind,
                handler,
                args: args.into(),
            });
        id
    }

    /// Returns `false` when the id was already removed.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Snapshot of the handlers for `kind`, in subscription order.
    pub fn matching(&self, kind: StreamKind) -> Vec<(StreamHandler, Arc<[Value]>)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| (Arc::clone(&entry.handler), Arc::clone(&entry.args)))
            .collect()
    }

    pub fn kinds(&self) -> BTreeSet<StreamKind> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.kind)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::SubscriptionRegistry;
    use crate::stream::proto::StreamKind;

    #[test]
    fn multiple_handlers_per_kind_are_kept_in_order() {
        let registry = SubscriptionRegistry::new();
        let first = registry.insert(StreamKind::Console, vec![json!(1)], |_, _| async {});
        let second = registry.insert(StreamKind::Console, vec![json!(2)], |_, _| async {});
        registry.insert(StreamKind::Heap, Vec::new(), |_, _| async {});

        assert_ne!(first, second);
        let console = registry.matching(StreamKind::Console);
        assert_eq!(console.len(), 2);
        assert_eq!(&*console[0].1, &[json!(1)]);
        assert_eq!(&*console[1].1, &[json!(2)]);
        assert!(registry.matching(StreamKind::Tick).is_empty());
    }

    #[test]
    fn remove_drops_only_the_given_subscription() {
        let registry = SubscriptionRegistry::new();
        let first = registry.insert(StreamKind::Console, Vec::new(), |_, _| async {});
        registry.insert(StreamKind::Console, Vec::new(), |_, _| async {});

        assert!(registry.remove(first));
        assert!(!registry.remove(first));
        assert_eq!(registry.matching(StreamKind::Console).len(), 1);
    }

    #[test]
    fn kinds_reflect_current_subscriptions() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.is_empty());
        let heap = registry.insert(StreamKind::Heap, Vec::new(), |_, _| async {});
        registry.insert(StreamKind::Status, Vec::new(), |_, _| async {});

        assert_eq!(
            registry.kinds(),
            BTreeSet::from([StreamKind::Status, StreamKind::Heap])
        );
        registry.remove(heap);
        assert_eq!(registry.kinds(), BTreeSet::from([StreamKind::Status]));
    }
}
