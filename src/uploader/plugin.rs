//! Named plugin interception points, given one obvious home instead of
//! being reconstructed ad hoc at each pipeline call site. A thin
//! wrapper over [`EventBus::pipe`] scoped to the `plugin:` namespace —
//! a plugin only ever sees the payload for its hook, never scheduler or
//! network internals.

use crate::event_bus::EventBus;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeUpload,
    AfterFingerprint,
    AfterPrecheck,
    BeforeChunk,
    AfterChunk,
    BeforeMerge,
    AfterUpload,
}

impl HookPoint {
    fn name(&self) -> &'static str {
        match self {
            HookPoint::BeforeUpload => "beforeUpload",
            HookPoint::AfterFingerprint => "afterFingerprint",
            HookPoint::AfterPrecheck => "afterPrecheck",
            HookPoint::BeforeChunk => "beforeChunk",
            HookPoint::AfterChunk => "afterChunk",
            HookPoint::BeforeMerge => "beforeMerge",
            HookPoint::AfterUpload => "afterUpload",
        }
    }
}

/// Implemented by plugins; registration happens once, at construction.
pub trait UploadPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Wire this plugin's handlers onto the scoped plugin bus.
    fn register(&self, bus: &EventBus);
}

#[derive(Clone)]
pub struct PluginManager {
    bus: EventBus,
}

impl PluginManager {
    pub fn new(parent_bus: &EventBus) -> Self {
        Self {
            bus: parent_bus.create_namespace("plugin"),
        }
    }

    pub fn register(&self, plugin: &dyn UploadPlugin) {
        plugin.register(&self.bus);
    }

    /// Run every registered handler for `hook` over `payload`, folding
    /// each handler's return value into the next.
    pub fn dispatch(&self, hook: HookPoint, payload: Value) -> Value {
        self.bus.pipe(hook.name(), payload)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}
