//! Merge engine — combines plugin configuration across scopes
//!
//! Per plugin name the precedence is consumer > route > service; global
//! rules form a separate map compiled into their own chain. The service
//! map is merged under the route at match time; the consumer overlay is
//! applied only after the rewrite phase has identified a consumer.

use crate::store::{Collection, GlobalRule, PluginMap};

/// Route over service: the route's entry wins per plugin name
pub fn merge_route_service(route: Option<&PluginMap>, service: Option<&PluginMap>) -> PluginMap {
    let mut merged = service.cloned().unwrap_or_default();
    if let Some(route_plugins) = route {
        for (name, conf) in route_plugins {
            merged.insert(name.clone(), conf.clone());
        }
    }
    merged
}

/// Consumer over the already-merged map: the consumer's entry wins
pub fn overlay_consumer(base: &PluginMap, consumer: &PluginMap) -> PluginMap {
    let mut merged = base.clone();
    for (name, conf) in consumer {
        merged.insert(name.clone(), conf.clone());
    }
    merged
}

/// Union of every global rule's plugins. Rules are visited in id order;
/// on a name collision the smaller rule id wins, keeping the result
/// independent of map iteration order.
pub fn merge_global_rules(rules: &Collection<GlobalRule>) -> PluginMap {
    let mut sorted: Vec<_> = rules.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut merged = PluginMap::new();
    for rule in sorted {
        for (name, conf) in &rule.plugins {
            merged.entry(name.clone()).or_insert_with(|| conf.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::watch::{Kind, WatchEvent};
    use crate::store::ConfigStore;
    use serde_json::json;

    fn map(entries: &[(&str, serde_json::Value)]) -> PluginMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_route_wins_over_service() {
        let route = map(&[("limit-count", json!({"count": 5}))]);
        let service = map(&[
            ("limit-count", json!({"count": 100})),
            ("key-auth", json!({})),
        ]);

        let merged = merge_route_service(Some(&route), Some(&service));
        assert_eq!(merged["limit-count"]["count"], 5);
        assert!(merged.contains_key("key-auth"));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_with_missing_sides() {
        let route = map(&[("key-auth", json!({}))]);
        assert_eq!(merge_route_service(Some(&route), None).len(), 1);
        assert_eq!(merge_route_service(None, Some(&route)).len(), 1);
        assert!(merge_route_service(None, None).is_empty());
    }

    #[test]
    fn test_consumer_wins_over_merged() {
        let base = map(&[
            ("limit-count", json!({"count": 5})),
            ("proxy-rewrite", json!({"uri": "/a"})),
        ]);
        let consumer = map(&[("limit-count", json!({"count": 50}))]);

        let merged = overlay_consumer(&base, &consumer);
        assert_eq!(merged["limit-count"]["count"], 50);
        assert_eq!(merged["proxy-rewrite"]["uri"], "/a");
    }

    #[test]
    fn test_full_precedence_chain() {
        // service < route < consumer for the same plugin name
        let service = map(&[("limit-count", json!({"count": 1}))]);
        let route = map(&[("limit-count", json!({"count": 2}))]);
        let consumer = map(&[("limit-count", json!({"count": 3}))]);

        let merged = merge_route_service(Some(&route), Some(&service));
        assert_eq!(merged["limit-count"]["count"], 2);
        let merged = overlay_consumer(&merged, &consumer);
        assert_eq!(merged["limit-count"]["count"], 3);
    }

    #[test]
    fn test_merge_global_rules() {
        let store = ConfigStore::new();
        store.apply_event(WatchEvent {
            kind: Kind::GlobalRules,
            key: "g2".into(),
            value: Some(json!({"id":"g2","plugins":{"limit-count":{"count":9},"key-auth":{}}})),
            revision: 1,
        });
        store.apply_event(WatchEvent {
            kind: Kind::GlobalRules,
            key: "g1".into(),
            value: Some(json!({"id":"g1","plugins":{"limit-count":{"count":1}}})),
            revision: 2,
        });

        let merged = merge_global_rules(&store.global_rules());
        // g1 sorts before g2, so its limit-count wins
        assert_eq!(merged["limit-count"]["count"], 1);
        assert!(merged.contains_key("key-auth"));
    }

    #[test]
    fn test_merge_global_rules_empty() {
        let store = ConfigStore::new();
        assert!(merge_global_rules(&store.global_rules()).is_empty());
    }
}
