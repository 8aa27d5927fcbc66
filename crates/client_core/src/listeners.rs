//! Fan-out of inbound messages to whoever is currently interested.
//!
//! Listeners are identified by the [`ListenerHandle`] returned on
//! registration, or by `Arc` identity of the callback itself. Dispatch runs
//! over a snapshot, so a listener may register or remove listeners (itself
//! included) while being invoked.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use shared::domain::InboundMessage;
use tracing::error;

pub type Listener = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub panicked: usize,
}

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerHandle, Listener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Listener) -> ListenerHandle {
        let handle = ListenerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((handle, listener));
        handle
    }

    /// Registers `listener` until the returned guard is dropped.
    pub fn scoped(self: &Arc<Self>, listener: Listener) -> ListenerGuard {
        let handle = self.add_listener(listener);
        ListenerGuard {
            registry: Arc::clone(self),
            handle,
        }
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != handle);
        entries.len() != before
    }

    /// Removes every registration of this exact callback and returns how
    /// many there were.
    pub fn remove_callback(&self, listener: &Listener) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(_, existing)| !Arc::ptr_eq(existing, listener));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(&self, message: &InboundMessage) -> DispatchReport {
        let snapshot: Vec<(ListenerHandle, Listener)> = self.entries().clone();
        let mut report = DispatchReport::default();
        for (handle, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(message))) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    report.panicked += 1;
                    error!(
                        listener = handle.0,
                        message_id = message.id.0,
                        "chat: listener panicked during dispatch"
                    );
                }
            }
        }
        report
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(ListenerHandle, Listener)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration that lasts as long as the guard.
pub struct ListenerGuard {
    registry: Arc<ListenerRegistry>,
    handle: ListenerHandle,
}

impl ListenerGuard {
    pub fn handle(&self) -> ListenerHandle {
        self.handle
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.registry.remove_listener(self.handle);
    }
}

#[cfg(test)]
#[path = "tests/listeners_tests.rs"]
mod tests;
