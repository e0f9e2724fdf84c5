use super::engine::Dht;
use super::error::DhtError;
use super::message::Message;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A registered message handler.
///
/// Handlers get the engine back so they can reply, start transactions or
/// consult the routing table.
pub type Handler = Arc<dyn Fn(&mut Dht, &Message) -> Result<(), DhtError> + Send + Sync>;

#[derive(Default)]
struct Table {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl Table {
    fn insert(&self, kind: &str, name: &str, handler: Handler) -> Option<Handler> {
        let previous = self.handlers.write().insert(name.to_owned(), handler);
        if previous.is_some() {
            debug!("Replaced {} handler for {:?}", kind, name);
        }
        previous
    }

    fn remove(&self, name: &str) -> Option<Handler> {
        self.handlers.write().remove(name)
    }

    fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.read().get(name).cloned()
    }
}

/// The three dispatch tables: by message type, by query method and by
/// error description.
///
/// Registration goes through a lock so another thread holding an
/// `Arc<Registry>` can (re)register handlers while the pulse loop runs;
/// lookups clone the handler out so no lock is held while it executes.
#[derive(Default)]
pub struct Registry {
    types: Table,
    queries: Table,
    errors: Table,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook run for every inbound message whose `y` equals `name`.
    pub fn register_type<F>(&self, name: &str, handler: F) -> Option<Handler>
    where
        F: Fn(&mut Dht, &Message) -> Result<(), DhtError> + Send + Sync + 'static,
    {
        self.types.insert("type", name, Arc::new(handler))
    }

    /// Handler answering queries for method `name`.
    pub fn register_query<F>(&self, name: &str, handler: F) -> Option<Handler>
    where
        F: Fn(&mut Dht, &Message) -> Result<(), DhtError> + Send + Sync + 'static,
    {
        self.queries.insert("query", name, Arc::new(handler))
    }

    /// Handler for matched error replies whose description equals `name`.
    pub fn register_error<F>(&self, name: &str, handler: F) -> Option<Handler>
    where
        F: Fn(&mut Dht, &Message) -> Result<(), DhtError> + Send + Sync + 'static,
    {
        self.errors.insert("error", name, Arc::new(handler))
    }

    pub fn unregister_type(&self, name: &str) -> Option<Handler> {
        self.types.remove(name)
    }

    pub fn unregister_query(&self, name: &str) -> Option<Handler> {
        self.queries.remove(name)
    }

    pub fn unregister_error(&self, name: &str) -> Option<Handler> {
        self.errors.remove(name)
    }

    pub fn type_handler(&self, name: &str) -> Option<Handler> {
        self.types.get(name)
    }

    pub fn query_handler(&self, name: &str) -> Option<Handler> {
        self.queries.get(name)
    }

    pub fn error_handler(&self, name: &str) -> Option<Handler> {
        self.errors.get(name)
    }
}
