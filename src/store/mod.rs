//! Config snapshot store — versioned, watch-driven entity collections
//!
//! One typed collection per entity kind, swapped atomically on change so
//! readers are lock-free and see a consistent snapshot per access. The
//! source revision of each applied event becomes the entity `version`,
//! which downstream derivations (compiled router, DNS clones, balancer
//! state) use as their cache key.

pub mod types;
pub mod watch;

pub use types::{
    ActiveCheck, BalanceKind, Consumer, GlobalRule, HashOn, HealthChecks, PassiveCheck, PluginMap,
    ProbeKind, Route, Service, Ssl, StreamRoute, Upstream, UpstreamNode, UpstreamTimeout, VarOp,
    VarPredicate,
};
pub use watch::{Kind, WatchEvent, WatchSource, YamlSource};

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// A consistent snapshot of one entity kind
#[derive(Debug)]
pub struct Collection<T> {
    items: HashMap<String, Arc<T>>,
    /// Highest source revision applied to this collection
    revision: u64,
}

impl<T> Collection<T> {
    fn empty() -> Self {
        Self {
            items: HashMap::new(),
            revision: 0,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<T>> {
        self.items.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

type ChangeCallback = Box<dyn Fn() + Send + Sync>;

/// In-memory view of the external configuration store
pub struct ConfigStore {
    routes: ArcSwap<Collection<Route>>,
    services: ArcSwap<Collection<Service>>,
    upstreams: ArcSwap<Collection<Upstream>>,
    consumers: ArcSwap<Collection<Consumer>>,
    ssls: ArcSwap<Collection<Ssl>>,
    global_rules: ArcSwap<Collection<GlobalRule>>,
    stream_routes: ArcSwap<Collection<StreamRoute>>,
    subscribers: RwLock<Vec<(Kind, ChangeCallback)>>,
    /// False while the watch source is disconnected
    healthy: AtomicBool,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(Collection::empty()),
            services: ArcSwap::from_pointee(Collection::empty()),
            upstreams: ArcSwap::from_pointee(Collection::empty()),
            consumers: ArcSwap::from_pointee(Collection::empty()),
            ssls: ArcSwap::from_pointee(Collection::empty()),
            global_rules: ArcSwap::from_pointee(Collection::empty()),
            stream_routes: ArcSwap::from_pointee(Collection::empty()),
            subscribers: RwLock::new(Vec::new()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Apply one watch event: swap in an updated collection, then notify
    /// subscribers of that kind.
    pub fn apply_event(&self, ev: WatchEvent) {
        let applied = match ev.kind {
            Kind::Routes => apply_to(&self.routes, &ev, |v, version| {
                let mut route: Route = serde_json::from_value(v)?;
                route.version = version;
                route.validate()?;
                Ok(route)
            }),
            Kind::Services => apply_to(&self.services, &ev, |v, version| {
                let mut service: Service = serde_json::from_value(v)?;
                service.version = version;
                Ok(service)
            }),
            Kind::Upstreams => apply_to(&self.upstreams, &ev, |v, version| {
                let mut upstream: Upstream = serde_json::from_value(v)?;
                upstream.version = version;
                upstream.validate()?;
                Ok(upstream)
            }),
            Kind::Consumers => apply_to(&self.consumers, &ev, |v, version| {
                let mut consumer: Consumer = serde_json::from_value(v)?;
                consumer.version = version;
                Ok(consumer)
            }),
            Kind::Ssls => apply_to(&self.ssls, &ev, |v, version| {
                let mut ssl: Ssl = serde_json::from_value(v)?;
                ssl.version = version;
                Ok(ssl)
            }),
            Kind::GlobalRules => apply_to(&self.global_rules, &ev, |v, version| {
                let mut rule: GlobalRule = serde_json::from_value(v)?;
                rule.version = version;
                Ok(rule)
            }),
            Kind::StreamRoutes => apply_to(&self.stream_routes, &ev, |v, version| {
                let mut sr: StreamRoute = serde_json::from_value(v)?;
                sr.version = version;
                Ok(sr)
            }),
        };

        if !applied {
            return;
        }

        tracing::debug!(
            kind = %ev.kind,
            key = ev.key,
            revision = ev.revision,
            deleted = ev.value.is_none(),
            "Applied config event"
        );
        self.notify(ev.kind);
    }

    /// Register a callback fired after the index of `kind` is updated
    pub fn on_change(&self, kind: Kind, callback: impl Fn() + Send + Sync + 'static) {
        self.subscribers
            .write()
            .unwrap()
            .push((kind, Box::new(callback)));
    }

    fn notify(&self, kind: Kind) {
        let subs = self.subscribers.read().unwrap();
        for (k, cb) in subs.iter() {
            if *k == kind {
                cb();
            }
        }
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Highest applied revision of a kind
    pub fn revision(&self, kind: Kind) -> u64 {
        match kind {
            Kind::Routes => self.routes.load().revision,
            Kind::Services => self.services.load().revision,
            Kind::Upstreams => self.upstreams.load().revision,
            Kind::Consumers => self.consumers.load().revision,
            Kind::Ssls => self.ssls.load().revision,
            Kind::GlobalRules => self.global_rules.load().revision,
            Kind::StreamRoutes => self.stream_routes.load().revision,
        }
    }

    // --- Typed accessors: O(1) point reads and whole-snapshot loads ---

    pub fn route(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.load().get(id).cloned()
    }

    pub fn routes(&self) -> Arc<Collection<Route>> {
        self.routes.load_full()
    }

    pub fn service(&self, id: &str) -> Option<Arc<Service>> {
        self.services.load().get(id).cloned()
    }

    pub fn services(&self) -> Arc<Collection<Service>> {
        self.services.load_full()
    }

    pub fn upstream(&self, id: &str) -> Option<Arc<Upstream>> {
        self.upstreams.load().get(id).cloned()
    }

    pub fn upstreams(&self) -> Arc<Collection<Upstream>> {
        self.upstreams.load_full()
    }

    pub fn consumer(&self, username: &str) -> Option<Arc<Consumer>> {
        self.consumers.load().get(username).cloned()
    }

    pub fn consumers(&self) -> Arc<Collection<Consumer>> {
        self.consumers.load_full()
    }

    pub fn ssls(&self) -> Arc<Collection<Ssl>> {
        self.ssls.load_full()
    }

    pub fn global_rules(&self) -> Arc<Collection<GlobalRule>> {
        self.global_rules.load_full()
    }

    pub fn stream_routes(&self) -> Arc<Collection<StreamRoute>> {
        self.stream_routes.load_full()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Clone-and-swap one collection with the event applied. Returns false if
/// the event was a no-op (stale revision or undecodable payload) so the
/// caller can skip notifications.
fn apply_to<T>(
    slot: &ArcSwap<Collection<T>>,
    ev: &WatchEvent,
    decode: impl Fn(serde_json::Value, u64) -> crate::error::Result<T>,
) -> bool {
    let current = slot.load();

    let mut items = current.items.clone();
    match &ev.value {
        Some(value) => {
            match decode(value.clone(), ev.revision) {
                Ok(entity) => {
                    items.insert(ev.key.clone(), Arc::new(entity));
                }
                Err(e) => {
                    tracing::warn!(
                        kind = %ev.kind,
                        key = ev.key,
                        error = %e,
                        "Rejected config entity, keeping previous value"
                    );
                    return false;
                }
            }
        }
        None => {
            if items.remove(&ev.key).is_none() {
                return false;
            }
        }
    }

    slot.store(Arc::new(Collection {
        items,
        revision: current.revision.max(ev.revision),
    }));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn route_event(id: &str, uri: &str, revision: u64) -> WatchEvent {
        WatchEvent {
            kind: Kind::Routes,
            key: id.to_string(),
            value: Some(serde_json::json!({"id": id, "uri": uri})),
            revision,
        }
    }

    fn tombstone(kind: Kind, key: &str, revision: u64) -> WatchEvent {
        WatchEvent {
            kind,
            key: key.to_string(),
            value: None,
            revision,
        }
    }

    // --- Apply / read ---

    #[test]
    fn test_apply_and_get() {
        let store = ConfigStore::new();
        store.apply_event(route_event("1", "/hello", 10));

        let route = store.route("1").unwrap();
        assert_eq!(route.uri.as_deref(), Some("/hello"));
        assert_eq!(route.version, 10);
        assert_eq!(store.revision(Kind::Routes), 10);
        assert!(store.route("2").is_none());
    }

    #[test]
    fn test_apply_update_replaces() {
        let store = ConfigStore::new();
        store.apply_event(route_event("1", "/a", 1));
        store.apply_event(route_event("1", "/b", 2));

        let route = store.route("1").unwrap();
        assert_eq!(route.uri.as_deref(), Some("/b"));
        assert_eq!(route.version, 2);
        assert_eq!(store.routes().len(), 1);
    }

    #[test]
    fn test_apply_tombstone() {
        let store = ConfigStore::new();
        store.apply_event(route_event("1", "/a", 1));
        store.apply_event(tombstone(Kind::Routes, "1", 2));
        assert!(store.route("1").is_none());
        assert!(store.routes().is_empty());
    }

    #[test]
    fn test_tombstone_for_unknown_key_is_noop() {
        let store = ConfigStore::new();
        store.apply_event(tombstone(Kind::Routes, "ghost", 5));
        assert_eq!(store.revision(Kind::Routes), 0);
    }

    #[test]
    fn test_invalid_entity_rejected() {
        let store = ConfigStore::new();
        // Route without uri fails validation and must not land
        store.apply_event(WatchEvent {
            kind: Kind::Routes,
            key: "1".into(),
            value: Some(serde_json::json!({"id": "1"})),
            revision: 3,
        });
        assert!(store.route("1").is_none());
        assert_eq!(store.revision(Kind::Routes), 0);
    }

    #[test]
    fn test_snapshot_isolation() {
        let store = ConfigStore::new();
        store.apply_event(route_event("1", "/a", 1));

        let snapshot = store.routes();
        store.apply_event(route_event("2", "/b", 2));

        // The earlier snapshot is unaffected by later writes
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.routes().len(), 2);
    }

    #[test]
    fn test_consumers_keyed_by_username() {
        let store = ConfigStore::new();
        store.apply_event(WatchEvent {
            kind: Kind::Consumers,
            key: "jack".into(),
            value: Some(serde_json::json!({"username": "jack"})),
            revision: 1,
        });
        assert!(store.consumer("jack").is_some());
    }

    #[test]
    fn test_all_kinds_apply() {
        let store = ConfigStore::new();
        store.apply_event(WatchEvent {
            kind: Kind::Upstreams,
            key: "u1".into(),
            value: Some(serde_json::json!({"id":"u1","nodes":[{"host":"127.0.0.1","port":80}]})),
            revision: 1,
        });
        store.apply_event(WatchEvent {
            kind: Kind::Services,
            key: "s1".into(),
            value: Some(serde_json::json!({"id":"s1","upstream_id":"u1"})),
            revision: 2,
        });
        store.apply_event(WatchEvent {
            kind: Kind::Ssls,
            key: "ssl1".into(),
            value: Some(serde_json::json!({"id":"ssl1","sni":"a.com","cert":"C","key":"K"})),
            revision: 3,
        });
        store.apply_event(WatchEvent {
            kind: Kind::GlobalRules,
            key: "g1".into(),
            value: Some(serde_json::json!({"id":"g1","plugins":{}})),
            revision: 4,
        });
        store.apply_event(WatchEvent {
            kind: Kind::StreamRoutes,
            key: "sr1".into(),
            value: Some(serde_json::json!({"id":"sr1","server_port":9100})),
            revision: 5,
        });

        assert!(store.upstream("u1").is_some());
        assert!(store.service("s1").is_some());
        assert_eq!(store.ssls().len(), 1);
        assert_eq!(store.global_rules().len(), 1);
        assert_eq!(store.stream_routes().len(), 1);
    }

    // --- Idempotence ---

    #[test]
    fn test_replay_same_events_identical_state() {
        let events = vec![
            route_event("1", "/a", 1),
            route_event("2", "/b", 2),
            route_event("1", "/a2", 3),
        ];

        let store_a = ConfigStore::new();
        let store_b = ConfigStore::new();
        for ev in &events {
            store_a.apply_event(ev.clone());
        }
        for ev in &events {
            store_b.apply_event(ev.clone());
            store_b.apply_event(ev.clone()); // replay each event twice
        }

        assert_eq!(store_a.revision(Kind::Routes), store_b.revision(Kind::Routes));
        assert_eq!(store_a.routes().len(), store_b.routes().len());
        assert_eq!(
            store_a.route("1").unwrap().uri,
            store_b.route("1").unwrap().uri
        );
        assert_eq!(
            store_a.route("1").unwrap().version,
            store_b.route("1").unwrap().version
        );
    }

    // --- Change notification ---

    #[test]
    fn test_on_change_fires_for_matching_kind() {
        let store = ConfigStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        store.on_change(Kind::Routes, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.apply_event(route_event("1", "/a", 1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Other kinds do not fire route subscribers
        store.apply_event(WatchEvent {
            kind: Kind::Upstreams,
            key: "u1".into(),
            value: Some(serde_json::json!({"id":"u1","nodes":[{"host":"127.0.0.1","port":80}]})),
            revision: 2,
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_change_sees_updated_index() {
        let store = Arc::new(ConfigStore::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let store_clone = store.clone();
        let seen_clone = seen.clone();
        store.on_change(Kind::Routes, move || {
            seen_clone.store(store_clone.routes().len(), Ordering::SeqCst);
        });

        store.apply_event(route_event("1", "/a", 1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    // --- Health flag ---

    #[test]
    fn test_health_flag() {
        let store = ConfigStore::new();
        assert!(store.healthy());
        store.set_healthy(false);
        assert!(!store.healthy());
        store.set_healthy(true);
        assert!(store.healthy());
    }
}
