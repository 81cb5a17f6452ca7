//! Routing of inbound events to caller-supplied handlers.
//!
//! Every slot is optional. An update without a handler is logged and
//! dropped; it is never an error.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

/// Handler for match and past-ball updates.
pub type UpdateHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Handler for lifecycle events: `(name, args)`.
pub type EventHandler = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

/// At most one handler per event kind.
#[derive(Clone, Default)]
pub struct Dispatcher {
    on_update: Option<UpdateHandler>,
    on_past_ball_update: Option<UpdateHandler>,
    on_event: Option<EventHandler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the handler for full match card updates.
    pub fn on_update<F>(mut self, handler: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(handler));
        self
    }

    /// Sets the handler for past-ball updates.
    pub fn on_past_ball_update<F>(mut self, handler: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.on_past_ball_update = Some(Arc::new(handler));
        self
    }

    /// Sets the handler observing `connect_failed`, `auth_failed` and
    /// `disconnect`.
    pub fn on_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &[Value]) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(handler));
        self
    }

    /// Delivers a match card. Returns `false` when no handler is set.
    pub fn dispatch_update(&self, card: Value) -> bool {
        match &self.on_update {
            Some(handler) => {
                handler(card);
                true
            }
            None => {
                warn!(event = "no_listener", kind = "match_update");
                false
            }
        }
    }

    /// Delivers a past-ball update. Returns `false` when no handler is set.
    pub fn dispatch_past_ball_update(&self, ball: Value) -> bool {
        match &self.on_past_ball_update {
            Some(handler) => {
                handler(ball);
                true
            }
            None => {
                warn!(event = "no_listener", kind = "past_ball_update");
                false
            }
        }
    }

    /// Surfaces a lifecycle event.
    pub fn raise_event(&self, name: &str, args: &[Value]) {
        info!(event = "lifecycle_event", name, args = ?args);
        if let Some(handler) = &self.on_event {
            handler(name, args);
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("on_update", &self.on_update.is_some())
            .field("on_past_ball_update", &self.on_past_ball_update.is_some())
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::{json, Value};

    use super::Dispatcher;

    #[test]
    fn routes_each_kind_to_its_handler() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new()
            .on_update({
                let seen = Arc::clone(&seen);
                move |card: Value| seen.lock().expect("seen").push(format!("card:{}", card["key"]))
            })
            .on_past_ball_update({
                let seen = Arc::clone(&seen);
                move |ball: Value| seen.lock().expect("seen").push(format!("ball:{}", ball["over"]))
            })
            .on_event({
                let seen = Arc::clone(&seen);
                move |name: &str, args: &[Value]| {
                    seen.lock()
                        .expect("seen")
                        .push(format!("event:{name}:{}", args.len()))
                }
            });

        assert!(dispatcher.dispatch_update(json!({"key": "m1"})));
        assert!(dispatcher.dispatch_past_ball_update(json!({"over": 3})));
        dispatcher.raise_event("disconnect", &[json!("transport close")]);

        assert_eq!(
            *seen.lock().expect("seen"),
            vec![
                "card:\"m1\"".to_string(),
                "ball:3".to_string(),
                "event:disconnect:1".to_string(),
            ]
        );
    }

    #[test]
    fn missing_handlers_drop_updates() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.dispatch_update(json!({"key": "m1"})));
        assert!(!dispatcher.dispatch_past_ball_update(json!({})));
        dispatcher.raise_event("auth_failed", &[]);
    }

    #[test]
    fn debug_output_lists_registered_slots() {
        let dispatcher = Dispatcher::new().on_update(|_| {});
        let debug = format!("{dispatcher:?}");
        assert!(debug.contains("on_update: true"));
        assert!(debug.contains("on_event: false"));
    }
}
