//! Configuration watch sources
//!
//! A [`WatchSource`] delivers ordered `(key, value, revision)` events for
//! each entity kind, with tombstones for deletions. Two sources are
//! provided: a local YAML file reloaded on filesystem events, and a
//! static in-memory source used by tests. The pump keeps the snapshot
//! store fed, reconnecting with exponential backoff on transient errors;
//! while disconnected the last snapshot stays authoritative.

use crate::error::{GatewayError, Result};
use crate::store::ConfigStore;
use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Entity kinds tracked by the snapshot store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Routes,
    Services,
    Upstreams,
    Consumers,
    Ssls,
    GlobalRules,
    StreamRoutes,
}

impl Kind {
    pub const ALL: [Kind; 7] = [
        Kind::Routes,
        Kind::Services,
        Kind::Upstreams,
        Kind::Consumers,
        Kind::Ssls,
        Kind::GlobalRules,
        Kind::StreamRoutes,
    ];

    /// Key prefix of this kind in the external config store
    pub fn prefix(&self) -> &'static str {
        match self {
            Kind::Routes => "/routes",
            Kind::Services => "/services",
            Kind::Upstreams => "/upstreams",
            Kind::Consumers => "/consumers",
            Kind::Ssls => "/ssl",
            Kind::GlobalRules => "/global_rules",
            Kind::StreamRoutes => "/stream_routes",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix().trim_start_matches('/'))
    }
}

/// A single configuration change
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: Kind,
    /// Entity id (username for consumers)
    pub key: String,
    /// `None` is a tombstone: the entity was deleted
    pub value: Option<serde_json::Value>,
    /// Source revision; becomes the entity's `version`
    pub revision: u64,
}

/// A stream of configuration events
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// Deliver a full initial listing followed by incremental events into
    /// `tx`. Returns `Ok(())` on graceful end of stream, `Err` on a
    /// transient failure (the pump will reconnect).
    async fn run(&self, tx: mpsc::Sender<WatchEvent>) -> Result<()>;
}

/// Feed a store from a source until the source ends gracefully.
///
/// Transient source errors flip the store's health flag and trigger an
/// exponential-backoff reconnect (capped, jittered). Events received at
/// any point reset the backoff.
pub async fn pump(source: Arc<dyn WatchSource>, store: Arc<ConfigStore>) {
    let mut backoff = Duration::from_millis(500);

    loop {
        let (tx, mut rx) = mpsc::channel(1024);
        let src = Arc::clone(&source);
        let handle = tokio::spawn(async move { src.run(tx).await });

        while let Some(ev) = rx.recv().await {
            store.apply_event(ev);
            store.set_healthy(true);
            backoff = Duration::from_millis(500);
        }

        match handle.await {
            Ok(Ok(())) => {
                tracing::info!("Configuration watch source ended");
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Config watch disconnected, serving last snapshot");
            }
            Err(e) => {
                tracing::error!(error = %e, "Config watch task aborted");
            }
        }

        store.set_healthy(false);
        let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
        tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
        backoff = (backoff * 2).min(Duration::from_secs(30));
    }
}

/// Shape of the on-disk YAML configuration document
#[derive(Debug, Default, serde::Deserialize)]
struct YamlDocument {
    #[serde(default)]
    routes: Vec<serde_json::Value>,
    #[serde(default)]
    services: Vec<serde_json::Value>,
    #[serde(default)]
    upstreams: Vec<serde_json::Value>,
    #[serde(default)]
    consumers: Vec<serde_json::Value>,
    #[serde(default)]
    ssls: Vec<serde_json::Value>,
    #[serde(default)]
    global_rules: Vec<serde_json::Value>,
    #[serde(default)]
    stream_routes: Vec<serde_json::Value>,
}

/// Debounce interval to coalesce rapid file changes
const DEBOUNCE_MS: u64 = 300;

/// Watch source backed by a local YAML file.
///
/// The whole document is re-read on change; only entities whose content
/// actually changed are re-emitted, so replaying an identical file leaves
/// every entity's revision untouched.
pub struct YamlSource {
    path: PathBuf,
    revision: AtomicU64,
    /// Last emitted content per (kind, key); used to diff reloads
    seen: Mutex<HashMap<(Kind, String), serde_json::Value>>,
}

impl YamlSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            revision: AtomicU64::new(0),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<(Kind, String, serde_json::Value)>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            GatewayError::ConfigTransient(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let doc: YamlDocument = serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::ConfigTransient(format!("Invalid YAML config: {}", e)))?;

        let mut out = Vec::new();
        let sections: [(Kind, &Vec<serde_json::Value>); 7] = [
            (Kind::Routes, &doc.routes),
            (Kind::Services, &doc.services),
            (Kind::Upstreams, &doc.upstreams),
            (Kind::Consumers, &doc.consumers),
            (Kind::Ssls, &doc.ssls),
            (Kind::GlobalRules, &doc.global_rules),
            (Kind::StreamRoutes, &doc.stream_routes),
        ];
        for (kind, entries) in sections {
            for entry in entries {
                let key = entity_key(kind, entry).ok_or_else(|| {
                    GatewayError::ConfigTransient(format!(
                        "Entity under '{}' is missing its id",
                        kind.prefix()
                    ))
                })?;
                out.push((kind, key, entry.clone()));
            }
        }
        Ok(out)
    }

    /// Diff the current document against the previously emitted state and
    /// send events for additions, updates, and deletions.
    async fn emit_diff(&self, tx: &mpsc::Sender<WatchEvent>) -> Result<()> {
        let entries = self.load()?;

        let mut events = Vec::new();
        {
            let mut seen = self.seen.lock().unwrap();
            let mut current: HashMap<(Kind, String), serde_json::Value> = HashMap::new();

            for (kind, key, value) in entries {
                let slot = (kind, key.clone());
                if seen.get(&slot) != Some(&value) {
                    let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
                    events.push(WatchEvent {
                        kind,
                        key,
                        value: Some(value.clone()),
                        revision,
                    });
                }
                current.insert(slot, value);
            }

            // Tombstones for entities that disappeared from the document
            for slot in seen.keys() {
                if !current.contains_key(slot) {
                    let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
                    events.push(WatchEvent {
                        kind: slot.0,
                        key: slot.1.clone(),
                        value: None,
                        revision,
                    });
                }
            }

            *seen = current;
        }

        for ev in events {
            tx.send(ev)
                .await
                .map_err(|_| GatewayError::ConfigTransient("event channel closed".into()))?;
        }
        Ok(())
    }
}

fn entity_key(kind: Kind, value: &serde_json::Value) -> Option<String> {
    let field = if kind == Kind::Consumers { "username" } else { "id" };
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[async_trait]
impl WatchSource for YamlSource {
    async fn run(&self, tx: mpsc::Sender<WatchEvent>) -> Result<()> {
        self.emit_diff(&tx).await?;

        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(16);
        let watched = self.path.clone();
        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let relevant = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == watched.file_name());
                    if relevant {
                        let _ = notify_tx.try_send(());
                    }
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| GatewayError::ConfigTransient(format!("file watcher: {}", e)))?;

        // Watch the parent directory: editors replace files atomically
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::ConfigTransient(format!("file watcher: {}", e)))?;

        while notify_rx.recv().await.is_some() {
            // Coalesce bursts of events from one save
            tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS)).await;
            while notify_rx.try_recv().is_ok() {}

            if let Err(e) = self.emit_diff(&tx).await {
                tracing::warn!(error = %e, "Config file reload failed, keeping current state");
            } else {
                tracing::info!(path = %self.path.display(), "Configuration file reloaded");
            }
        }

        Ok(())
    }
}

/// In-memory source that emits a fixed event list and ends; test plumbing
pub struct StaticSource {
    events: Vec<WatchEvent>,
}

impl StaticSource {
    pub fn new(events: Vec<WatchEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl WatchSource for StaticSource {
    async fn run(&self, tx: mpsc::Sender<WatchEvent>) -> Result<()> {
        for ev in &self.events {
            tx.send(ev.clone())
                .await
                .map_err(|_| GatewayError::ConfigTransient("event channel closed".into()))?;
        }
        Ok(())
    }
}
