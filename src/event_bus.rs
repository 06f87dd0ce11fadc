//! Prioritized, synchronous publish/subscribe used to glue the scheduler,
//! uploader, and error center together and to let plugins observe or
//! transform pipeline state.
//!
//! Handlers for one event fire in descending priority order (ties keep
//! registration order), a panicking handler is caught and logged rather
//! than aborting the rest of the dispatch, and one-shot handlers are
//! removed atomically within the same `emit`.

use dashmap::DashMap;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;
pub type PipeHandler = Arc<dyn Fn(Value) -> Value + Send + Sync>;

struct Subscription {
    id: u64,
    handler: Handler,
    once: bool,
    priority: i32,
    tag: Option<String>,
}

struct PipeSubscription {
    id: u64,
    handler: PipeHandler,
    priority: i32,
    tag: Option<String>,
}

#[derive(Default)]
struct EventSlot {
    subs: Vec<Subscription>,
    pipes: Vec<PipeSubscription>,
}

/// Options accepted by [`EventBus::on`].
#[derive(Default, Clone)]
pub struct SubscribeOptions {
    pub once: bool,
    pub priority: i32,
    pub tag: Option<String>,
}

/// A handle returned by `on`/`once`/`pipe_on` that removes the
/// subscription when invoked.
pub struct Unsubscribe {
    bus: Arc<EventBusInner>,
    name: String,
    id: u64,
    pipe: bool,
}

impl Unsubscribe {
    pub fn call(self) {
        self.bus.remove_by_id(&self.name, self.id, self.pipe);
    }
}

struct EventBusInner {
    prefix: String,
    slots: DashMap<String, EventSlot>,
    next_id: AtomicU64,
}

impl EventBusInner {
    fn remove_by_id(&self, name: &str, id: u64, pipe: bool) {
        if let Some(mut slot) = self.slots.get_mut(name) {
            if pipe {
                slot.pipes.retain(|p| p.id != id);
            } else {
                slot.subs.retain(|s| s.id != id);
            }
        }
    }

    fn full_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", self.prefix, name)
        }
    }
}

/// The event bus. Cheap to clone (shares internal state via `Arc`);
/// `create_namespace` returns a child that prefixes every event name.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                prefix: String::new(),
                slots: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// A child bus whose event names are prefixed with `namespace:`.
    /// Parent and child do not observe each other's events.
    pub fn create_namespace(&self, namespace: &str) -> EventBus {
        let prefix = if self.inner.prefix.is_empty() {
            namespace.to_string()
        } else {
            format!("{}:{}", self.inner.prefix, namespace)
        };
        EventBus {
            inner: Arc::new(EventBusInner {
                prefix,
                slots: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn on(
        &self,
        name: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
        opts: SubscribeOptions,
    ) -> Unsubscribe {
        let full = self.inner.full_name(name);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Subscription {
            id,
            handler: Arc::new(handler),
            once: opts.once,
            priority: opts.priority,
            tag: opts.tag,
        };
        let mut slot = self.inner.slots.entry(full.clone()).or_default();
        slot.subs.push(sub);
        slot.subs.sort_by_key(|s| std::cmp::Reverse(s.priority));
        Unsubscribe {
            bus: self.inner.clone(),
            name: full,
            id,
            pipe: false,
        }
    }

    pub fn once(
        &self,
        name: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.on(
            name,
            handler,
            SubscribeOptions {
                once: true,
                ..Default::default()
            },
        )
    }

    /// Register a pipe-style handler for `pipe(name, seed)`.
    pub fn pipe_on(
        &self,
        name: &str,
        handler: impl Fn(Value) -> Value + Send + Sync + 'static,
        priority: i32,
        tag: Option<String>,
    ) -> Unsubscribe {
        let full = self.inner.full_name(name);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = PipeSubscription {
            id,
            handler: Arc::new(handler),
            priority,
            tag,
        };
        let mut slot = self.inner.slots.entry(full.clone()).or_default();
        slot.pipes.push(sub);
        slot.pipes.sort_by_key(|s| std::cmp::Reverse(s.priority));
        Unsubscribe {
            bus: self.inner.clone(),
            name: full,
            id,
            pipe: true,
        }
    }

    /// Unsubscribe every handler (plain or pipe) carrying this tag
    /// across every event name. Returns the number removed.
    pub fn off_by_tag(&self, tag: &str) -> usize {
        let mut removed = 0;
        for mut entry in self.inner.slots.iter_mut() {
            let before_subs = entry.subs.len();
            entry.subs.retain(|s| s.tag.as_deref() != Some(tag));
            removed += before_subs - entry.subs.len();
            let before_pipes = entry.pipes.len();
            entry.pipes.retain(|p| p.tag.as_deref() != Some(tag));
            removed += before_pipes - entry.pipes.len();
        }
        removed
    }

    pub fn listener_count(&self, name: &str) -> usize {
        let full = self.inner.full_name(name);
        self.inner
            .slots
            .get(&full)
            .map(|s| s.subs.len())
            .unwrap_or(0)
    }

    /// Dispatch to every handler for `name` in priority order. Returns
    /// whether any handler ran. A handler snapshot is taken up front so
    /// handlers registered mid-emit do not participate in this emit.
    pub fn emit(&self, name: &str, payload: Value) -> bool {
        let full = self.inner.full_name(name);
        let snapshot: Vec<(u64, Handler, bool)> = match self.inner.slots.get(&full) {
            Some(slot) => slot.subs.iter().map(|s| (s.id, s.handler.clone(), s.once)).collect(),
            None => return false,
        };
        if snapshot.is_empty() {
            return false;
        }
        let mut once_ids = Vec::new();
        for (id, handler, once) in &snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&payload)));
            if result.is_err() {
                warn!(target: "event_bus", event = %full, "handler panicked, continuing dispatch");
            }
            if *once {
                once_ids.push(*id);
            }
        }
        if !once_ids.is_empty() {
            if let Some(mut slot) = self.inner.slots.get_mut(&full) {
                slot.subs.retain(|s| !once_ids.contains(&s.id));
            }
        }
        debug!(target: "event_bus", event = %full, handlers = snapshot.len(), "emitted");
        true
    }

    /// Chain pipe handlers over `seed`, folding each handler's return
    /// value into the next. A panicking handler keeps the prior value.
    pub fn pipe(&self, name: &str, seed: Value) -> Value {
        let full = self.inner.full_name(name);
        let snapshot: Vec<PipeHandler> = match self.inner.slots.get(&full) {
            Some(slot) => slot.pipes.iter().map(|p| p.handler.clone()).collect(),
            None => return seed,
        };
        let mut acc = seed;
        for handler in snapshot {
            let prior = acc.clone();
            acc = match catch_unwind(AssertUnwindSafe(|| handler(acc))) {
                Ok(next) => next,
                Err(_) => {
                    warn!(target: "event_bus", event = %full, "pipe handler panicked, keeping prior value");
                    prior
                }
            };
        }
        acc
    }

    pub fn off(&self, name: &str) {
        let full = self.inner.full_name(name);
        self.inner.slots.remove(&full);
    }
}

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// Convenience generator for unique tags, used by components that want
/// to group-unsubscribe their own handlers on dispose.
pub fn fresh_tag(prefix: &str) -> String {
    format!("{}-{}", prefix, NEXT_TAG.fetch_add(1, Ordering::Relaxed))
}
