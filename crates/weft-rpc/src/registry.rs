//! Service registry interface
//!
//! Only the abstract shape is pinned here, plus an always-local static
//! implementation. Dynamic registries (etcd, consul, ...) plug in behind
//! the same trait.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use weft_core::WeftResult;
use weft_runtime::FiberMutex;

/// One advertised endpoint of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service_name: String,
    pub addr: String,
    pub port: u16,
    pub metadata: BTreeMap<String, String>,
    pub register_time_ms: i64,
}

impl ServiceInstance {
    pub fn new(service_name: &str, addr: &str, port: u16) -> Self {
        Self {
            service_name: service_name.to_string(),
            addr: addr.to_string(),
            port,
            metadata: BTreeMap::new(),
            register_time_ms: 0,
        }
    }

    /// "addr:port" form
    pub fn full_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// Callback invoked when a watched service's instance list changes
pub type WatchCallback = Arc<dyn Fn(&str, &[ServiceInstance]) + Send + Sync>;

/// Abstract registry contract
pub trait ServiceRegistry: Send + Sync {
    fn register(
        &self,
        service_name: &str,
        addr: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
    ) -> WeftResult<()>;

    fn unregister(&self, service_name: &str) -> WeftResult<()>;

    fn discover(&self, service_name: &str) -> Vec<ServiceInstance>;

    fn watch(&self, service_name: &str, callback: WatchCallback);

    /// Heartbeat for registries with ephemeral entries
    fn keep_alive(&self) -> bool;

    fn is_connected(&self) -> bool;

    fn close(&self);
}

#[derive(Default)]
struct StaticState {
    services: HashMap<String, Vec<ServiceInstance>>,
    watchers: HashMap<String, Vec<WatchCallback>>,
}

/// In-process registry backed by a plain map
///
/// Always "connected"; registration takes effect immediately and fires
/// any watchers for the service.
#[derive(Default)]
pub struct StaticRegistry {
    state: FiberMutex<StaticState>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the instance list for a service wholesale
    pub fn set_services(&self, service_name: &str, instances: Vec<ServiceInstance>) {
        let watchers = {
            let mut state = self.state.lock();
            state
                .services
                .insert(service_name.to_string(), instances.clone());
            state.watchers.get(service_name).cloned().unwrap_or_default()
        };
        for watcher in watchers {
            watcher(service_name, &instances);
        }
    }
}

impl ServiceRegistry for StaticRegistry {
    fn register(
        &self,
        service_name: &str,
        addr: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
    ) -> WeftResult<()> {
        let mut instance = ServiceInstance::new(service_name, addr, port);
        instance.metadata = metadata;

        let (instances, watchers) = {
            let mut state = self.state.lock();
            let list = state
                .services
                .entry(service_name.to_string())
                .or_default();
            list.retain(|i| i.full_addr() != instance.full_addr());
            list.push(instance);
            (
                list.clone(),
                state.watchers.get(service_name).cloned().unwrap_or_default(),
            )
        };

        for watcher in watchers {
            watcher(service_name, &instances);
        }
        Ok(())
    }

    fn unregister(&self, service_name: &str) -> WeftResult<()> {
        let watchers = {
            let mut state = self.state.lock();
            state.services.remove(service_name);
            state.watchers.get(service_name).cloned().unwrap_or_default()
        };
        for watcher in watchers {
            watcher(service_name, &[]);
        }
        Ok(())
    }

    fn discover(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.state
            .lock()
            .services
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }

    fn watch(&self, service_name: &str, callback: WatchCallback) {
        self.state
            .lock()
            .watchers
            .entry(service_name.to_string())
            .or_default()
            .push(callback);
    }

    fn keep_alive(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_then_discover() {
        let registry = StaticRegistry::new();
        registry
            .register("echo", "127.0.0.1", 9000, BTreeMap::new())
            .unwrap();
        registry
            .register("echo", "127.0.0.1", 9001, BTreeMap::new())
            .unwrap();

        let found = registry.discover("echo");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].full_addr(), "127.0.0.1:9000");
        assert_eq!(found[1].full_addr(), "127.0.0.1:9001");
    }

    #[test]
    fn test_reregister_replaces_same_addr() {
        let registry = StaticRegistry::new();
        let mut meta = BTreeMap::new();
        meta.insert("zone".to_string(), "a".to_string());
        registry
            .register("kv", "10.0.0.1", 7000, BTreeMap::new())
            .unwrap();
        registry.register("kv", "10.0.0.1", 7000, meta).unwrap();

        let found = registry.discover("kv");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.get("zone").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_unregister_and_unknown_service() {
        let registry = StaticRegistry::new();
        registry
            .register("gone", "127.0.0.1", 1, BTreeMap::new())
            .unwrap();
        registry.unregister("gone").unwrap();
        assert!(registry.discover("gone").is_empty());
        assert!(registry.discover("never-registered").is_empty());
    }

    #[test]
    fn test_watch_fires_on_register() {
        let registry = StaticRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        registry.watch(
            "watched",
            Arc::new(move |name, instances| {
                assert_eq!(name, "watched");
                h.store(instances.len(), Ordering::SeqCst);
            }),
        );

        registry
            .register("watched", "127.0.0.1", 5, BTreeMap::new())
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        registry.unregister("watched").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_static_registry_is_always_connected() {
        let registry = StaticRegistry::new();
        assert!(registry.is_connected());
        assert!(registry.keep_alive());
        registry.close();
        assert!(registry.is_connected());
    }
}
