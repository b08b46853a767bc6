//! Line router
//!
//! Every decoded line from the printer passes through [`LineRouter::route`].
//! The instruction queue's matcher sees it first and may claim it as the
//! verdict of the in-flight instruction. Independently, every registered
//! listener whose pattern matches is called with the captures, in
//! registration order. A claimed line still reaches the listeners: an
//! `ok T:...` both confirms `M105` and carries the temperatures.
//!
//! Routing runs on the serial reader task. A listener that panics is logged
//! and skipped; the line still reaches the listeners after it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use regex::{Captures, Regex};

/// Compile a pattern literal written in this crate.
#[allow(clippy::expect_used)]
pub(crate) fn literal_regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("pattern literal must compile")
}

/// Callback invoked with the captures of a matching line.
pub type ListenerFn = Arc<dyn Fn(&Captures<'_>) + Send + Sync>;

/// Something that may claim a line as its own.
pub trait LineConsumer: Send + Sync {
    /// Returns `true` if the line was consumed.
    fn consume(&self, line: &str) -> bool;
}

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    pattern: Regex,
    callback: ListenerFn,
}

/// Dispatches printer output to the instruction matcher and to listeners.
pub struct LineRouter {
    listeners: RwLock<Vec<Listener>>,
    matcher: RwLock<Option<Weak<dyn LineConsumer>>>,
    next_id: AtomicU64,
}

impl Default for LineRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl LineRouter {
    /// Router without listeners or matcher.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            matcher: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for lines matching `pattern`.
    pub fn register_listener<F>(&self, pattern: Regex, callback: F) -> ListenerId
    where
        F: Fn(&Captures<'_>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(pattern = %pattern, ?id, "Registering listener");
        self.listeners.write().push(Listener {
            id,
            pattern,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Install the consumer offered every line before the listeners.
    ///
    /// Held weakly; once the consumer is dropped lines go to listeners only.
    pub fn set_instruction_matcher(&self, matcher: Weak<dyn LineConsumer>) {
        *self.matcher.write() = Some(matcher);
    }

    /// Route one line. Returns whether the matcher consumed it.
    pub fn route(&self, line: &str) -> bool {
        let matcher = self.matcher.read().as_ref().and_then(Weak::upgrade);
        let consumed = matcher.map(|m| m.consume(line)).unwrap_or(false);

        // Snapshot so callbacks may register or remove listeners.
        let matching: Vec<(Regex, ListenerFn)> = self
            .listeners
            .read()
            .iter()
            .filter(|listener| listener.pattern.is_match(line))
            .map(|listener| (listener.pattern.clone(), Arc::clone(&listener.callback)))
            .collect();

        for (pattern, callback) in matching {
            if let Some(captures) = pattern.captures(line) {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(&captures))).is_err() {
                    tracing::error!(pattern = %pattern, line, "Listener panicked on a printer line");
                }
            }
        }
        consumed
    }
}
