//! The tracked-resources registry (§3 "TrackedResources", §5 "Shared-resource
//! policy").
//!
//! The only cross-task mutable state in either controller. Every resource
//! created with a lifetime shorter than the process run is registered
//! before the creating call is made, and deregistered only after its
//! deletion is observed (a 404 counts as observed) or explicitly skipped.

use std::collections::HashSet;
use std::future::Future;

use tokio::sync::Mutex;
use tracing::warn;

/// The kind of a tracked resource. Ordered so that a drain naturally walks
/// pod → PVC → secret, since pod deletion releases volume mounts and lets
/// the PVC be removed without forcing, and the secret is only needed while
/// the pod is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// A runner or hook-target pod
    Pod,
    /// A clone persistent volume claim
    Pvc,
    /// An ephemeral runner-config secret
    Secret,
}

/// A tracked resource identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    /// Resource kind
    pub kind: ResourceKind,
    /// Namespace the resource lives in
    pub namespace: String,
    /// Resource name
    pub name: String,
}

impl ResourceId {
    /// Construct a new resource id
    #[must_use]
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Process-local registry of resources that must not outlive the run
#[derive(Debug, Default)]
pub struct TrackedResources {
    inner: Mutex<HashSet<ResourceId>>,
}

impl TrackedResources {
    /// Construct an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashSet::new()),
        }
    }

    /// Register a resource before the creating API call is issued
    pub async fn register(&self, id: ResourceId) {
        let _ = self.inner.lock().await.insert(id);
    }

    /// Remove a resource once its deletion has been observed, or it is
    /// being explicitly skipped (e.g. it was never actually created)
    pub async fn deregister(&self, id: &ResourceId) {
        let _ = self.inner.lock().await.remove(id);
    }

    /// Whether the registry is empty (the cleanup-totality invariant, §8)
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Snapshot the registry, ordered pod → PVC → secret, for a drain.
    /// Copies the contents under the mutex, then the caller operates
    /// outside it.
    async fn snapshot(&self) -> Vec<ResourceId> {
        let guard = self.inner.lock().await;
        let mut ids: Vec<ResourceId> = guard.iter().cloned().collect();
        drop(guard);
        ids.sort_by_key(|id| id.kind);
        ids
    }

    /// Unconditionally drain the registry, invoking `delete` for every
    /// tracked resource in pod → PVC → secret order. Each deletion is
    /// best-effort: an error is logged but does not stop the drain, and the
    /// resource is deregistered regardless so a re-run is never blocked by
    /// a stuck entry.
    pub async fn drain<F, Fut, E>(&self, mut delete: F)
    where
        F: FnMut(ResourceId) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        for id in self.snapshot().await {
            if let Err(err) = delete(id.clone()).await {
                warn!(
                    kind = ?id.kind,
                    namespace = %id.namespace,
                    name = %id.name,
                    "cleanup failed: {err}"
                );
            }
            self.deregister(&id).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn drain_empties_registry_in_kind_order() {
        let tracked = TrackedResources::new();
        tracked
            .register(ResourceId::new(ResourceKind::Secret, "ns", "sec"))
            .await;
        tracked
            .register(ResourceId::new(ResourceKind::Pvc, "ns", "pvc"))
            .await;
        tracked
            .register(ResourceId::new(ResourceKind::Pod, "ns", "pod"))
            .await;

        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let order2 = order.clone();
        tracked
            .drain(move |id| {
                let order = order2.clone();
                async move {
                    order.lock().await.push(id.kind);
                    Ok::<_, anyhow::Error>(())
                }
            })
            .await;

        assert!(tracked.is_empty().await);
        let seen = order.lock().await.clone();
        assert_eq!(
            seen,
            vec![ResourceKind::Pod, ResourceKind::Pvc, ResourceKind::Secret]
        );
    }

    #[tokio::test]
    async fn drain_deregisters_even_on_error() {
        let tracked = TrackedResources::new();
        tracked
            .register(ResourceId::new(ResourceKind::Pod, "ns", "pod"))
            .await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        tracked
            .drain(move |_id| {
                attempts2.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(anyhow::anyhow!("boom")) }
            })
            .await;

        assert!(tracked.is_empty().await);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
