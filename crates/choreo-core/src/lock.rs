//! Named-resource lock: a keyed async mutex with FIFO hand-off.
//!
//! Design:
//! - One fair `tokio::sync::Mutex<()>` per resource name, created on first use.
//! - The name -> mutex map is behind a std mutex that is held only for the
//!   lookup; waiting happens on the per-name mutex, so unrelated names never
//!   contend.
//! - A granted lock is a `Lease`. Releasing consumes it, so a lease can only
//!   be released once. Dropping a lease releases it too.
//! - No acquisition timeout. A long wait logs a warning every `warn_after`
//!   while the request keeps its place in the queue.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Name of a shared resource whose mutation must be serialized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resource(Cow<'static, str>);

impl Resource {
    /// For resource constants: `const PROPOSALS: Resource = Resource::from_static("proposals");`
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for Resource {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for Resource {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl From<&Resource> for Resource {
    fn from(resource: &Resource) -> Self {
        resource.clone()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-resource queue.
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    /// Requesters currently waiting (not counting the holder).
    waiting: AtomicUsize,
}

struct Inner {
    slots: Mutex<HashMap<Resource, Arc<Slot>>>,
    warn_after: Option<Duration>,
}

/// Keyed async mutex shared by every flow of one scenario run.
///
/// Cloning is cheap; clones share the same queues.
#[derive(Clone)]
pub struct ResourceLock {
    inner: Arc<Inner>,
}

impl ResourceLock {
    /// Lock without long-wait warnings.
    pub fn new() -> Self {
        Self::with_warn_after(None)
    }

    /// Lock that logs a warning each time a request has waited `warn_after`.
    pub fn with_warn_after(warn_after: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                warn_after: warn_after.filter(|d| !d.is_zero()),
            }),
        }
    }

    fn slot(&self, resource: &Resource) -> Arc<Slot> {
        // A poisoned map is still structurally valid: entries are only ever inserted.
        let mut slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(resource.clone()).or_insert_with(|| {
            Arc::new(Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                waiting: AtomicUsize::new(0),
            })
        }))
    }

    fn existing_slot(&self, resource: &Resource) -> Option<Arc<Slot>> {
        let slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.get(resource).cloned()
    }

    /// Wait for exclusive access to `resource`.
    ///
    /// Never fails. Requests for the same resource are granted in the order
    /// they were made.
    pub async fn acquire(&self, resource: impl Into<Resource>) -> Lease {
        let resource = resource.into();
        let slot = self.slot(&resource);

        let guard = {
            let _waiting = WaitingGuard::enter(&slot.waiting);
            let acquire = Arc::clone(&slot.mutex).lock_owned();
            tokio::pin!(acquire);

            match self.inner.warn_after {
                None => acquire.await,
                Some(warn_after) => {
                    let started = Instant::now();
                    loop {
                        tokio::select! {
                            guard = &mut acquire => break guard,
                            _ = tokio::time::sleep(warn_after) => {
                                warn!(
                                    resource = %resource,
                                    waited_secs = started.elapsed().as_secs(),
                                    queued = slot.waiting.load(Ordering::SeqCst),
                                    "still waiting for resource lock"
                                );
                            }
                        }
                    }
                }
            }
        };

        debug!(resource = %resource, "resource lock granted");
        Lease {
            resource,
            acquired_at: Instant::now(),
            _guard: guard,
        }
    }

    /// Number of requests queued behind the current holder.
    pub fn waiting(&self, resource: impl Into<Resource>) -> usize {
        self.existing_slot(&resource.into())
            .map(|slot| slot.waiting.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Is a lease for `resource` outstanding?
    pub fn is_held(&self, resource: impl Into<Resource>) -> bool {
        self.existing_slot(&resource.into())
            .is_some_and(|slot| slot.mutex.try_lock().is_err())
    }
}

impl Default for ResourceLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLock")
            .field("warn_after", &self.inner.warn_after)
            .finish_non_exhaustive()
    }
}

/// Keeps the waiting counter right even if the acquiring future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive access to one resource.
///
/// The next queued requester is granted the resource when this lease is
/// released or dropped.
#[must_use = "dropping a lease releases the resource immediately"]
pub struct Lease {
    resource: Resource,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl Lease {
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Hand the resource to the next requester.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        debug!(
            resource = %self.resource,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "resource lock released"
        );
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("resource", &self.resource)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}
