use crate::config::CoopcamConfig;
use crate::error::ProxyError;
use crate::mjpeg::MjpegProxy;
use crate::motion::MotionEngine;
use crate::pool::FrameBufferPool;
use crate::recording::RecordingController;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Wire-facing source listing entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub id: String,
    pub name: String,
    pub display_url: String,
    pub is_default: bool,
}

/// Directory of per-source proxies keyed by canonical source id.
///
/// Proxies are created lazily on first lookup, connect eagerly, and persist
/// until shutdown. The literal id "default" always resolves to the default
/// source before any map access and is never itself a key.
pub struct StreamManager {
    proxies: RwLock<HashMap<String, Arc<MjpegProxy>>>,
    sources: HashMap<String, crate::config::SourceConfig>,
    ordered_ids: Vec<String>,
    default_id: String,
    pool: Arc<FrameBufferPool>,
    engine: Option<Arc<MotionEngine>>,
    recorder: Option<Arc<RecordingController>>,
    motion_fps: u32,
    pre_buffer_seconds: u32,
    cancel: CancellationToken,
}

impl StreamManager {
    pub fn new(
        config: &CoopcamConfig,
        pool: Arc<FrameBufferPool>,
        engine: Option<Arc<MotionEngine>>,
        recorder: Option<Arc<RecordingController>>,
        cancel: CancellationToken,
    ) -> Self {
        let default_id = config.default_source_id().to_string();
        let ordered_ids = config.sources.iter().map(|s| s.id.clone()).collect();
        let sources = config
            .sources
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();

        Self {
            proxies: RwLock::new(HashMap::new()),
            sources,
            ordered_ids,
            default_id,
            pool,
            engine,
            recorder,
            motion_fps: config.motion.fps,
            pre_buffer_seconds: config.recording.pre_buffer_seconds,
            cancel,
        }
    }

    /// Resolve the "default" alias to the configured default source id
    pub fn canonical_id<'a>(&'a self, id: &'a str) -> &'a str {
        if id == "default" {
            &self.default_id
        } else {
            id
        }
    }

    /// Get (or lazily create) the proxy for a source.
    ///
    /// At most one proxy ever exists per canonical id; creation is
    /// double-checked under the write lock.
    pub fn get_proxy(&self, id: &str) -> Result<Arc<MjpegProxy>, ProxyError> {
        let canonical = self.canonical_id(id).to_string();

        if let Some(proxy) = self.proxies.read().get(&canonical) {
            return Ok(Arc::clone(proxy));
        }

        let source = self
            .sources
            .get(&canonical)
            .ok_or_else(|| ProxyError::UnknownSource {
                id: id.to_string(),
            })?
            .clone();

        let mut proxies = self.proxies.write();
        if let Some(proxy) = proxies.get(&canonical) {
            return Ok(Arc::clone(proxy));
        }

        debug!(source = %canonical, "Creating MJPEG proxy");
        let pre_buffer_capacity = (self.pre_buffer_seconds * source.fps).max(1) as usize;
        let (proxy, sample_rx) = MjpegProxy::new(
            source,
            Arc::clone(&self.pool),
            self.motion_fps,
            pre_buffer_capacity,
            self.cancel.child_token(),
        );
        let proxy = Arc::new(proxy);
        proxy.connect();

        if let Some(engine) = &self.engine {
            engine.attach(canonical.clone(), sample_rx, self.cancel.child_token());
        }
        if let Some(recorder) = &self.recorder {
            recorder.attach(
                canonical.clone(),
                proxy.frame_events(),
                proxy.pre_buffer(),
                self.cancel.child_token(),
            );
        }

        proxies.insert(canonical, Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Look up an existing proxy without creating one
    pub fn existing_proxy(&self, id: &str) -> Option<Arc<MjpegProxy>> {
        let canonical = self.canonical_id(id);
        self.proxies.read().get(canonical).cloned()
    }

    /// Eagerly create proxies for every configured source
    pub fn prewarm(&self) {
        for id in &self.ordered_ids {
            if let Err(e) = self.get_proxy(id) {
                debug!(source = %id, "Prewarm skipped: {}", e);
            }
        }
        info!("Prewarmed {} stream proxies", self.proxies.read().len());
    }

    /// All configured sources, in configuration order
    pub fn list_sources(&self) -> Vec<SourceSummary> {
        self.ordered_ids
            .iter()
            .filter_map(|id| self.sources.get(id))
            .map(|s| SourceSummary {
                id: s.id.clone(),
                name: s.name.clone(),
                display_url: display_url(&s.url),
                is_default: s.is_default,
            })
            .collect()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.ordered_ids.clone()
    }

    pub fn default_source_id(&self) -> &str {
        &self.default_id
    }

    /// Disconnect every proxy and drop all references
    pub fn shutdown(&self) {
        let mut proxies = self.proxies.write();
        info!("Shutting down {} stream proxies", proxies.len());
        for proxy in proxies.values() {
            proxy.disconnect();
        }
        proxies.clear();
        self.cancel.cancel();
    }
}

/// Cosmetic listing URL: the upstream URL minus a trailing /video segment
fn display_url(url: &str) -> String {
    url.strip_suffix("/video").unwrap_or(url).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoopcamConfig, SourceConfig};

    fn test_config() -> CoopcamConfig {
        let mut config = CoopcamConfig::default();
        config.sources = vec![
            SourceConfig {
                id: "coop".to_string(),
                name: "Coop".to_string(),
                url: "http://127.0.0.1:1/video".to_string(),
                is_default: true,
                fps: 30,
            },
            SourceConfig {
                id: "run".to_string(),
                name: "Run".to_string(),
                url: "http://127.0.0.1:2/stream".to_string(),
                is_default: false,
                fps: 15,
            },
        ];
        config
    }

    fn test_manager() -> StreamManager {
        StreamManager::new(
            &test_config(),
            Arc::new(FrameBufferPool::with_capacity(4, 1024)),
            None,
            None,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_default_alias_resolves_to_same_proxy() {
        let manager = test_manager();

        let by_alias = manager.get_proxy("default").unwrap();
        let by_id = manager.get_proxy("coop").unwrap();
        assert!(Arc::ptr_eq(&by_alias, &by_id));

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_alias_is_never_a_map_key() {
        let manager = test_manager();
        manager.get_proxy("default").unwrap();

        assert!(manager.proxies.read().contains_key("coop"));
        assert!(!manager.proxies.read().contains_key("default"));

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_at_most_one_proxy_per_source() {
        let manager = test_manager();

        let first = manager.get_proxy("run").unwrap();
        let second = manager.get_proxy("run").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.proxies.read().len(), 1);

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_source_is_an_error() {
        let manager = test_manager();
        assert!(matches!(
            manager.get_proxy("barn"),
            Err(ProxyError::UnknownSource { .. })
        ));
    }

    #[test]
    fn test_list_sources_strips_video_suffix() {
        let manager = test_manager();
        let sources = manager.list_sources();

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].id, "coop");
        assert_eq!(sources[0].display_url, "http://127.0.0.1:1");
        assert!(sources[0].is_default);
        assert_eq!(sources[1].display_url, "http://127.0.0.1:2/stream");
    }

    #[tokio::test]
    async fn test_shutdown_drops_all_proxies() {
        let manager = test_manager();
        manager.prewarm();
        assert_eq!(manager.proxies.read().len(), 2);

        manager.shutdown();
        assert!(manager.proxies.read().is_empty());
    }
}
