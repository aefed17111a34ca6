use super::handler::{CollectorHandler, HandlerConfig};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<String, Arc<CollectorHandler>>,
    default: Option<String>,
}

/// Named collector handlers, one of which may be the default.
///
/// Registrations are serialized by a single lock, when several threads register a default
/// handler concurrently the last one to take the lock wins.
#[derive(Default)]
pub struct HandlerRegistry {
    state: Mutex<RegistryState>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a handler for `config` and store it under its name, replacing (and closing) any
    /// handler previously registered with that name.
    pub fn register(&self, config: HandlerConfig) -> Arc<CollectorHandler> {
        let name = config.name.clone();
        let is_default = config.is_default;
        let handler = Arc::new(CollectorHandler::new(config));

        let mut state = self.state();
        if let Some(previous) = state.handlers.insert(name.clone(), Arc::clone(&handler)) {
            previous.close();
        }
        if is_default {
            state.default = Some(name);
        }
        handler
    }

    pub fn get(&self, name: &str) -> Option<Arc<CollectorHandler>> {
        self.state().handlers.get(name).cloned()
    }

    pub fn default_handler(&self) -> Option<Arc<CollectorHandler>> {
        let state = self.state();
        state
            .default
            .as_ref()
            .and_then(|name| state.handlers.get(name))
            .cloned()
    }

    pub fn set_default(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if !state.handlers.contains_key(name) {
            return Err(Error::InvalidArgument(format!(
                "no handler registered as {name:?}"
            )));
        }
        state.default = Some(name.to_string());
        Ok(())
    }

    /// Unregister and close a handler. Removing the default leaves the registry without one.
    pub fn remove(&self, name: &str) -> Option<Arc<CollectorHandler>> {
        let mut state = self.state();
        let handler = state.handlers.remove(name)?;
        if state.default.as_deref() == Some(name) {
            state.default = None;
        }
        handler.close();
        Some(handler)
    }

    pub fn close_all(&self) {
        let mut state = self.state();
        state.default = None;
        for (_, handler) in state.handlers.drain() {
            handler.close();
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_default_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.default_handler().is_none());

        registry.register(HandlerConfig::new("plain"));
        assert!(registry.default_handler().is_none());

        let main = registry.register(HandlerConfig::new("main").with_default(true));
        let default = registry.default_handler().unwrap();
        assert!(Arc::ptr_eq(&default, &main));

        registry.set_default("plain").unwrap();
        assert_eq!(registry.default_handler().unwrap().name(), "plain");
        assert!(matches!(
            registry.set_default("unknown"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let registry = HandlerRegistry::new();
        let first = registry.register(HandlerConfig::new("app").with_port(9100));
        let second = registry.register(HandlerConfig::new("app").with_port(9200));

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.get("app").unwrap().config().port, 9200);
        assert_eq!(registry.names(), vec!["app".to_string()]);
    }

    #[test]
    fn test_remove_and_close_all() {
        let registry = HandlerRegistry::new();
        registry.register(HandlerConfig::new("a").with_default(true));
        registry.register(HandlerConfig::new("b"));

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.default_handler().is_none());
        assert_eq!(registry.names(), vec!["b".to_string()]);

        registry.close_all();
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_concurrent_default_registration() {
        let registry = Arc::new(HandlerRegistry::new());

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    registry.register(HandlerConfig::new(format!("worker-{i}")).with_default(true));
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(registry.names().len(), 8);
        let default = registry.default_handler().unwrap();
        assert!(registry.names().contains(&default.name().to_string()));
    }
}
