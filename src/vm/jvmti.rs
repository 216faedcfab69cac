//! Method entry and exit events for debugging agents.
//!
//! Events are only posted by generated code when `jvmti_support` is on
//! and the thread is in interpreter-only mode. Posted events are kept in
//! order until an agent takes them, and an optional listener sees each
//! one as it is posted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum JvmtiEvent {
    MethodEntry { thread: usize, method: String },
    MethodExit { thread: usize, method: String },
}

impl JvmtiEvent {
    pub fn method(&self) -> &str {
        match self {
            JvmtiEvent::MethodEntry { method, .. } | JvmtiEvent::MethodExit { method, .. } => method,
        }
    }
}

pub type EventListener = dyn Fn(&JvmtiEvent) + Send + Sync;

#[derive(Default)]
pub struct JvmtiState {
    events: Mutex<Vec<JvmtiEvent>>,
    listener: Mutex<Option<Arc<EventListener>>>,
    posted: AtomicU64,
}

impl JvmtiState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, event: JvmtiEvent) {
        log::trace!("jvmti: {:?}", event);
        self.posted.fetch_add(1, Ordering::Relaxed);
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(&event);
        }
        self.events.lock().push(event);
    }

    pub fn set_listener(&self, listener: Option<Arc<EventListener>>) {
        *self.listener.lock() = listener;
    }

    /// Events posted since the last call, oldest first.
    pub fn take_events(&self) -> Vec<JvmtiEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn posted_count(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_taken_in_order() {
        let jvmti = JvmtiState::new();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        jvmti.set_listener(Some(Arc::new(move |_: &JvmtiEvent| {
            counter.fetch_add(1, Ordering::Relaxed);
        })));
        jvmti.post(JvmtiEvent::MethodEntry { thread: 1, method: "A.f()V".into() });
        jvmti.post(JvmtiEvent::MethodExit { thread: 1, method: "A.f()V".into() });
        let events = jvmti.take_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], JvmtiEvent::MethodEntry { .. }));
        assert_eq!(events[1].method(), "A.f()V");
        assert!(jvmti.take_events().is_empty());
        assert_eq!(jvmti.posted_count(), 2);
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }
}
