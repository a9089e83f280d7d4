//! Event boundary towards the rendering frontend.
//!
//! The launcher core never talks to the UI directly; it emits named events
//! through this trait and the embedding shell forwards them over its IPC
//! bus.

use serde_json::Value;

pub const EVENT_RELOAD: &str = "reload";
pub const EVENT_LOGOUT: &str = "logout";
pub const EVENT_LOGIN_SUCCESS: &str = "login_success";
pub const EVENT_LOGIN_ERROR: &str = "login_error";
pub const EVENT_PROFILE_CHANGED: &str = "profile_changed";
pub const EVENT_NETWORK_MODE: &str = "setNetworkMode";
pub const EVENT_UPDATE_STATUS: &str = "update:status";
pub const EVENT_HINT_UPDATES: &str = "hint:updates_available";
pub const EVENT_HINT_NEWS: &str = "hint:news_available";

pub trait EventSink: Send + Sync {
    fn emit(&self, name: &str, payload: Value);
}

/// Default sink used when no frontend is attached: events go to the log.
/// `update:status` is deliberately not logged to avoid spam.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, name: &str, payload: Value) {
        if name != EVENT_UPDATE_STATUS {
            log::debug!("emitting event: name={} payload={}", name, payload);
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every emitted event for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<(String, Value)>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, name: &str, payload: Value) {
            self.events.lock().unwrap().push((name.to_string(), payload));
        }
    }

    impl RecordingSink {
        pub fn names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(n, _)| n.clone())
                .collect()
        }
    }
}
