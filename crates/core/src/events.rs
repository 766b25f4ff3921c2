//! Name-keyed event dispatchers
//!
//! Global in-process pub/sub: `get_event_dispatcher(name)` returns the
//! dispatcher for that name, creating it on first use. Each dispatcher
//! carries an optional type tag identifying its payload type. Triggering
//! is synchronous, in subscription order, on the calling thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::types::TypeInfo;
use crate::value::Var;

type Handler = Box<dyn Fn(&Var) + Send + Sync>;

pub struct EventDispatcher {
    name: String,
    type_info: RwLock<Option<TypeInfo>>,
    handlers: RwLock<Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_info: RwLock::new(None),
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload type carried by this dispatcher, if one was declared.
    pub fn type_info(&self) -> Option<TypeInfo> {
        self.type_info.read().unwrap().clone()
    }

    /// Declare the payload type. A conflicting re-declaration is
    /// reported; the first declaration wins.
    pub fn set_type_info(&self, info: TypeInfo) {
        let mut slot = self.type_info.write().unwrap();
        match &*slot {
            Some(existing) if *existing != info => {
                tracing::warn!(
                    dispatcher = %self.name,
                    "conflicting event payload type declaration ignored"
                );
            }
            Some(_) => {}
            None => *slot = Some(info),
        }
    }

    /// Subscribe; returns a token for `unsubscribe`.
    pub fn subscribe(&self, handler: impl Fn(&Var) + Send + Sync + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().unwrap().push((id, Box::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    /// Invoke every handler synchronously, in subscription order.
    pub fn trigger(&self, payload: &Var) {
        let handlers = self.handlers.read().unwrap();
        for (_, handler) in handlers.iter() {
            handler(payload);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap().len()
    }
}

static DISPATCHERS: OnceLock<RwLock<HashMap<String, Arc<EventDispatcher>>>> = OnceLock::new();

fn dispatchers() -> &'static RwLock<HashMap<String, Arc<EventDispatcher>>> {
    DISPATCHERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Look up (or create) the global dispatcher registered under `name`.
pub fn get_event_dispatcher(name: &str) -> Arc<EventDispatcher> {
    {
        let map = dispatchers().read().unwrap();
        if let Some(dispatcher) = map.get(name) {
            return dispatcher.clone();
        }
    }
    let mut map = dispatchers().write().unwrap();
    map.entry(name.to_string())
        .or_insert_with(|| Arc::new(EventDispatcher::new(name)))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_same_name_same_dispatcher() {
        let a = get_event_dispatcher("events-test-same");
        let b = get_event_dispatcher("events-test-same");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_trigger_in_subscription_order() {
        let dispatcher = get_event_dispatcher("events-test-order");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        dispatcher.subscribe(move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        dispatcher.subscribe(move |_| o2.lock().unwrap().push(2));

        dispatcher.trigger(&Var::None);
        assert_eq!(&*order.lock().unwrap(), &[1, 2]);
    }

    #[test]
    fn test_unsubscribe() {
        static FIRED: AtomicU32 = AtomicU32::new(0);
        let dispatcher = get_event_dispatcher("events-test-unsub");
        let id = dispatcher.subscribe(|_| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.trigger(&Var::None);
        assert!(dispatcher.unsubscribe(id));
        dispatcher.trigger(&Var::None);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.unsubscribe(id));
    }

    #[test]
    fn test_payload_type_first_declaration_wins() {
        let dispatcher = get_event_dispatcher("events-test-type");
        dispatcher.set_type_info(TypeInfo::Int);
        dispatcher.set_type_info(TypeInfo::String);
        assert_eq!(dispatcher.type_info(), Some(TypeInfo::Int));
    }

    #[test]
    fn test_payload_delivered() {
        let dispatcher = get_event_dispatcher("events-test-payload");
        let seen = Arc::new(std::sync::Mutex::new(Var::None));
        let sink = seen.clone();
        dispatcher.subscribe(move |payload| {
            *sink.lock().unwrap() = payload.clone();
        });
        dispatcher.trigger(&Var::Int(11));
        assert_eq!(*seen.lock().unwrap(), Var::Int(11));
    }
}
