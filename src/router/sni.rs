//! SNI sub-router — selects a certificate entity by handshake server name
//!
//! Exact names win over wildcards; a `*.example.com` pattern matches
//! exactly one extra label. Among wildcard candidates the longest suffix
//! wins.

use crate::store::{Collection, Ssl};
use std::collections::HashMap;
use std::sync::Arc;

/// Compiled SNI matcher over the ssl collection
pub struct SniRouter {
    exact: HashMap<String, Arc<Ssl>>,
    /// (".example.com" suffix, entity), sorted longest suffix first
    wildcard: Vec<(String, Arc<Ssl>)>,
}

impl SniRouter {
    pub fn build(ssls: &Collection<Ssl>) -> Self {
        let mut exact = HashMap::new();
        let mut wildcard: Vec<(String, Arc<Ssl>)> = Vec::new();

        for ssl in ssls.iter() {
            for pattern in ssl.sni_patterns() {
                let pattern = pattern.to_ascii_lowercase();
                if let Some(suffix) = pattern.strip_prefix("*.") {
                    wildcard.push((format!(".{}", suffix), ssl.clone()));
                } else {
                    exact.insert(pattern, ssl.clone());
                }
            }
        }

        wildcard.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.1.id.cmp(&b.1.id)));

        Self { exact, wildcard }
    }

    /// Find the best certificate for a server name
    pub fn find(&self, sni: &str) -> Option<Arc<Ssl>> {
        let sni = sni.to_ascii_lowercase();
        if let Some(ssl) = self.exact.get(&sni) {
            return Some(ssl.clone());
        }

        for (suffix, ssl) in &self.wildcard {
            if let Some(label) = sni.strip_suffix(suffix.as_str()) {
                // The wildcard covers a single label only
                if !label.is_empty() && !label.contains('.') {
                    return Some(ssl.clone());
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::watch::{Kind, WatchEvent};
    use crate::store::ConfigStore;

    fn build_router(entries: &[(&str, serde_json::Value)]) -> SniRouter {
        let store = ConfigStore::new();
        for (i, (id, snis)) in entries.iter().enumerate() {
            store.apply_event(WatchEvent {
                kind: Kind::Ssls,
                key: id.to_string(),
                value: Some(serde_json::json!({
                    "id": id, "snis": snis, "cert": "CERT", "key": "KEY"
                })),
                revision: i as u64 + 1,
            });
        }
        SniRouter::build(&store.ssls())
    }

    #[test]
    fn test_exact_match() {
        let router = build_router(&[("s1", serde_json::json!(["api.example.com"]))]);
        assert_eq!(router.find("api.example.com").unwrap().id, "s1");
        assert!(router.find("www.example.com").is_none());
    }

    #[test]
    fn test_exact_match_case_insensitive() {
        let router = build_router(&[("s1", serde_json::json!(["API.Example.COM"]))]);
        assert!(router.find("api.example.com").is_some());
        assert!(router.find("Api.exAmple.com").is_some());
    }

    #[test]
    fn test_wildcard_single_label() {
        let router = build_router(&[("s1", serde_json::json!(["*.example.com"]))]);
        assert_eq!(router.find("api.example.com").unwrap().id, "s1");
        assert!(router.find("example.com").is_none());
        assert!(router.find("a.b.example.com").is_none());
    }

    #[test]
    fn test_exact_beats_wildcard() {
        let router = build_router(&[
            ("wild", serde_json::json!(["*.example.com"])),
            ("exact", serde_json::json!(["api.example.com"])),
        ]);
        assert_eq!(router.find("api.example.com").unwrap().id, "exact");
        assert_eq!(router.find("www.example.com").unwrap().id, "wild");
    }

    #[test]
    fn test_longest_wildcard_suffix_wins() {
        let router = build_router(&[
            ("short", serde_json::json!(["*.com"])),
            ("long", serde_json::json!(["*.example.com"])),
        ]);
        assert_eq!(router.find("api.example.com").unwrap().id, "long");
        assert_eq!(router.find("example.com").unwrap().id, "short");
    }

    #[test]
    fn test_empty_router() {
        let router = build_router(&[]);
        assert!(router.is_empty());
        assert!(router.find("any.com").is_none());
    }
}
