//! Registry service: the only way the routing model changes.
//!
//! Every mutation runs under a single write lock and follows the same order:
//! apply to a copy of the model (validation), render and write the affected
//! proxy configuration files, persist the full model, commit the copy, and
//! reload the proxy. Reads take a snapshot under the read lock.

use crate::model::{Endpoint, EntryPoint, ModelError, Node, NodeActivity, RoutingModel};
use crate::render::{ConfigWriter, RenderError, RenderedFile};
use crate::state::{StateError, StateStore};
use crate::supervisor::{ReloadReport, Reloader, SupervisorError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ModelError),

    #[error("failed to write proxy configuration: {0}")]
    Render(#[from] RenderError),

    #[error("failed to persist state, registry is now read-only: {0}")]
    Persist(#[source] StateError),

    #[error("registry is read-only after a state persistence failure")]
    Degraded,

    #[error("change was saved but the proxy reload failed: {0}")]
    Reload(#[source] SupervisorError),
}

pub struct Registry {
    model: RwLock<RoutingModel>,
    writer: ConfigWriter,
    store: StateStore,
    reloader: Arc<dyn Reloader>,
    degraded: AtomicBool,
}

impl Registry {
    pub fn new(
        model: RoutingModel,
        writer: ConfigWriter,
        store: StateStore,
        reloader: Arc<dyn Reloader>,
    ) -> Arc<Self> {
        Arc::new(Self {
            model: RwLock::new(model),
            writer,
            store,
            reloader,
            degraded: AtomicBool::new(false),
        })
    }

    /// True once a persistence failure has switched the registry to read-only
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// A consistent copy of the current model
    pub async fn snapshot(&self) -> RoutingModel {
        self.model.read().await.clone()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.model.read().await.nodes().to_vec()
    }

    pub async fn entry_points(&self) -> Vec<EntryPoint> {
        self.model.read().await.entry_points().to_vec()
    }

    /// Compare a node's claimed endpoint with the recorded one
    pub async fn check_node_active(&self, node_id: &str, claimed: &str) -> NodeActivity {
        self.model.read().await.check_node_active(node_id, claimed)
    }

    /// Register a new node, writing its own file and the aggregate file
    pub async fn add_node(&self, node: Node) -> Result<ReloadReport, RegistryError> {
        if node.node_id == self.writer.aggregate_name() {
            return Err(ModelError::ReservedNodeId(node.node_id).into());
        }
        let node_id = node.node_id.clone();

        self.mutate("add_node", |model, writer| {
            model.add_node(node)?;
            let node = model
                .find_node(&node_id)
                .ok_or_else(|| ModelError::NodeNotFound(node_id.clone()))?;
            Ok(vec![writer.render_node_file(node)?, writer.render_aggregate_file(model)?])
        })
        .await
    }

    /// Replace a node's first endpoint
    pub async fn update_node(&self, node_id: &str, endpoint: Endpoint) -> Result<ReloadReport, RegistryError> {
        self.update_node_endpoint_at(node_id, 0, endpoint).await
    }

    /// Replace the endpoint at `index` of a node
    pub async fn update_node_endpoint_at(
        &self,
        node_id: &str,
        index: usize,
        endpoint: Endpoint,
    ) -> Result<ReloadReport, RegistryError> {
        self.mutate("update_node", |model, writer| {
            model.update_endpoint_at(node_id, index, endpoint)?;
            let node = model
                .find_node(node_id)
                .ok_or_else(|| ModelError::NodeNotFound(node_id.to_string()))?;
            Ok(vec![writer.render_node_file(node)?, writer.render_aggregate_file(model)?])
        })
        .await
    }

    pub async fn add_entry_point(&self, entry_point: EntryPoint) -> Result<ReloadReport, RegistryError> {
        self.mutate("add_entry_point", |model, writer| {
            model.add_entry_point(entry_point)?;
            Ok(vec![writer.render_aggregate_file(model)?])
        })
        .await
    }

    /// Write every configuration file for the current model without reloading.
    ///
    /// Used at startup, before the proxy is launched.
    pub async fn render_current(&self) -> Result<(), RegistryError> {
        let model = self.model.write().await;
        let files = self.writer.render_all(&model)?;
        self.writer.write(&files)?;
        info!(files = files.len(), "Rendered proxy configuration");
        Ok(())
    }

    /// Rewrite every configuration file and reload the proxy
    pub async fn resync(&self) -> Result<ReloadReport, RegistryError> {
        let model = self.model.write().await;
        let files = self.writer.render_all(&model)?;
        self.writer.write(&files)?;
        info!(files = files.len(), "Resynchronised proxy configuration");
        self.reloader.reload().await.map_err(RegistryError::Reload)
    }

    /// Put the files of an abandoned change back in line with `live`.
    ///
    /// Files that `live` does not render (a node that was never committed) are
    /// removed; the rest are re-rendered from `live`.
    fn restore_files(&self, live: &RoutingModel, written: &[RenderedFile]) {
        let rendered = match self.writer.render_all(live) {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(error = %e, "Failed to re-render configuration after aborted change");
                return;
            }
        };

        let mut restore = Vec::new();
        for file in written {
            match rendered.iter().find(|r| r.path == file.path) {
                Some(current) => restore.push(current.clone()),
                None => {
                    if let Err(e) = std::fs::remove_file(&file.path) {
                        error!(path = %file.path.display(), error = %e, "Failed to remove configuration of aborted change");
                    }
                }
            }
        }
        if let Err(e) = self.writer.write(&restore) {
            error!(error = %e, "Failed to restore configuration after aborted change");
        }
    }

    async fn mutate<F>(&self, operation: &'static str, apply: F) -> Result<ReloadReport, RegistryError>
    where
        F: FnOnce(&mut RoutingModel, &ConfigWriter) -> Result<Vec<RenderedFile>, RegistryError>,
    {
        let mut live = self.model.write().await;
        if self.is_degraded() {
            return Err(RegistryError::Degraded);
        }

        let mut candidate = live.clone();
        let files = match apply(&mut candidate, &self.writer) {
            Ok(files) => files,
            Err(e) => {
                warn!(operation, error = %e, "Mutation rejected");
                return Err(e);
            }
        };

        if let Err(e) = self.writer.write(&files) {
            error!(operation, error = %e, "Failed to write proxy configuration");
            return Err(e.into());
        }

        if let Err(e) = self.store.save(&candidate) {
            self.degraded.store(true, Ordering::SeqCst);
            error!(
                operation,
                path = %self.store.path().display(),
                error = %e,
                "Failed to persist state; refusing further mutations"
            );
            self.restore_files(&live, &files);
            return Err(RegistryError::Persist(e));
        }

        *live = candidate;
        info!(
            operation,
            nodes = live.nodes().len(),
            entry_points = live.entry_points().len(),
            "Routing model updated"
        );

        // Held across the reload so the next mutation sees this one fully applied
        self.reloader.reload().await.map_err(RegistryError::Reload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingReloader {
        count: AtomicUsize,
        fail: AtomicBool,
    }

    impl Reloader for CountingReloader {
        fn reload(&self) -> BoxFuture<'_, Result<ReloadReport, SupervisorError>> {
            self.count.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail.load(Ordering::SeqCst) {
                Err(SupervisorError::ConfigRejected {
                    output: vec!["nginx: [emerg] test".to_string()],
                })
            } else {
                Ok(ReloadReport::default())
            };
            futures::future::ready(result).boxed()
        }
    }

    struct Fixture {
        dir: TempDir,
        registry: Arc<Registry>,
        reloader: Arc<CountingReloader>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let state_path = dir.path().join("state").join("routekeeper.state");
            Self::with_paths(dir, state_path)
        }

        fn with_paths(dir: TempDir, state_path: std::path::PathBuf) -> Self {
            let reloader = Arc::new(CountingReloader::default());
            let writer = ConfigWriter::new(dir.path().join("conf.d"), "routekeeper", 80);
            let registry = Registry::new(
                RoutingModel::new(),
                writer,
                StateStore::new(state_path),
                reloader.clone(),
            );
            Self {
                dir,
                registry,
                reloader,
            }
        }

        fn conf(&self, name: &str) -> String {
            std::fs::read_to_string(self.dir.path().join("conf.d").join(name)).unwrap()
        }

        fn reloads(&self) -> usize {
            self.reloader.count.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_add_node_writes_persists_and_reloads() {
        let fx = Fixture::new();

        fx.registry
            .add_node(Node::new("k", "svc1", "http://127.0.0.1:8081"))
            .await
            .unwrap();

        assert!(fx.conf("svc1.conf").contains("proxy_pass http://127.0.0.1:8081;"));
        assert!(fx.dir.path().join("conf.d/routekeeper.conf").exists());
        assert_eq!(fx.reloads(), 1);

        let stored = StateStore::new(fx.dir.path().join("state/routekeeper.state"))
            .load()
            .unwrap();
        assert_eq!(stored, fx.registry.snapshot().await);
    }

    #[tokio::test]
    async fn test_duplicate_node_rejected_without_side_effects() {
        let fx = Fixture::new();
        fx.registry
            .add_node(Node::new("k", "svc1", "http://127.0.0.1:8081"))
            .await
            .unwrap();
        let before = fx.registry.snapshot().await;

        let err = fx
            .registry
            .add_node(Node::new("k", "svc1", "http://127.0.0.1:9999"))
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Validation(ModelError::DuplicateNodeId(_))));
        assert_eq!(fx.registry.snapshot().await, before);
        assert_eq!(fx.reloads(), 1);
        assert!(fx.conf("svc1.conf").contains("8081"));
    }

    #[tokio::test]
    async fn test_reserved_node_id_rejected() {
        let fx = Fixture::new();
        let err = fx
            .registry
            .add_node(Node::new("k", "routekeeper", "http://127.0.0.1:8081"))
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Validation(ModelError::ReservedNodeId(_))));
        assert_eq!(fx.reloads(), 0);
    }

    #[tokio::test]
    async fn test_add_entry_point_unknown_node() {
        let fx = Fixture::new();
        let err = fx
            .registry
            .add_entry_point(EntryPoint::new("a.example.com", "/", "ghost"))
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Validation(ModelError::UnknownNodeId(_))));
        assert!(fx.registry.entry_points().await.is_empty());
        assert_eq!(fx.reloads(), 0);
    }

    #[tokio::test]
    async fn test_update_node_rewrites_node_and_aggregate() {
        let fx = Fixture::new();
        fx.registry
            .add_node(Node::new("k", "svc1", "http://127.0.0.1:8081"))
            .await
            .unwrap();
        fx.registry
            .add_entry_point(EntryPoint::new("svc1.example.com", "/", "svc1"))
            .await
            .unwrap();

        fx.registry
            .update_node("svc1", Endpoint::new("http://127.0.0.1:9090"))
            .await
            .unwrap();

        assert!(fx.conf("svc1.conf").contains("proxy_pass http://127.0.0.1:9090;"));
        assert!(fx.conf("routekeeper.conf").contains("proxy_pass http://127.0.0.1:9090;"));
        assert_eq!(fx.reloads(), 3);
        assert_eq!(
            fx.registry
                .check_node_active("svc1", "http://127.0.0.1:9090")
                .await,
            NodeActivity::Match
        );
    }

    #[tokio::test]
    async fn test_update_unknown_node() {
        let fx = Fixture::new();
        let err = fx
            .registry
            .update_node("ghost", Endpoint::new("http://x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(ModelError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_reload_failure_is_reported_but_change_kept() {
        let fx = Fixture::new();
        fx.reloader.fail.store(true, Ordering::SeqCst);

        let err = fx
            .registry
            .add_node(Node::new("k", "svc1", "http://127.0.0.1:8081"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Reload(_)));
        assert!(fx.registry.snapshot().await.find_node("svc1").is_some());
        assert!(!fx.registry.is_degraded());

        // The next mutation reloads independently
        fx.reloader.fail.store(false, Ordering::SeqCst);
        fx.registry
            .add_node(Node::new("k", "svc2", "http://127.0.0.1:8082"))
            .await
            .unwrap();
        assert_eq!(fx.reloads(), 2);
    }

    #[tokio::test]
    async fn test_render_failure_leaves_model_and_state_untouched() {
        let dir = TempDir::new().unwrap();
        // A file where the config directory should be
        std::fs::write(dir.path().join("conf.d"), "not a directory").unwrap();
        let state_path = dir.path().join("routekeeper.state");
        let fx = Fixture::with_paths(dir, state_path.clone());

        let err = fx
            .registry
            .add_node(Node::new("k", "svc1", "http://127.0.0.1:8081"))
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Render(_)));
        assert!(fx.registry.nodes().await.is_empty());
        assert!(!state_path.exists());
        assert_eq!(fx.reloads(), 0);
        assert!(!fx.registry.is_degraded());
    }

    #[tokio::test]
    async fn test_persist_failure_switches_to_read_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blocker"), "file").unwrap();
        let state_path = dir.path().join("blocker").join("routekeeper.state");
        let fx = Fixture::with_paths(dir, state_path);

        let err = fx
            .registry
            .add_node(Node::new("k", "svc1", "http://127.0.0.1:8081"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Persist(_)));
        assert!(fx.registry.is_degraded());
        assert!(fx.registry.nodes().await.is_empty());
        assert_eq!(fx.reloads(), 0);

        // The uncommitted node leaves no file behind
        assert!(!fx.dir.path().join("conf.d/svc1.conf").exists());
        assert!(!fx.conf("routekeeper.conf").contains("8081"));

        let err = fx
            .registry
            .add_node(Node::new("k", "svc2", "http://127.0.0.1:8082"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Degraded));

        // Reads keep working
        assert_eq!(
            fx.registry.check_node_active("svc1", "http://127.0.0.1:8081").await,
            NodeActivity::Unknown
        );
    }

    #[tokio::test]
    async fn test_persist_failure_restores_previous_files() {
        let fx = Fixture::new();
        fx.registry
            .add_node(Node::new("k", "svc1", "http://127.0.0.1:8081"))
            .await
            .unwrap();
        fx.registry
            .add_entry_point(EntryPoint::new("svc1.example.com", "/", "svc1"))
            .await
            .unwrap();

        // Make the state directory unusable
        let state_dir = fx.dir.path().join("state");
        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, "file").unwrap();

        let err = fx
            .registry
            .update_node("svc1", Endpoint::new("http://127.0.0.1:9090"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Persist(_)));

        assert!(fx.conf("svc1.conf").contains("proxy_pass http://127.0.0.1:8081;"));
        assert!(fx.conf("routekeeper.conf").contains("proxy_pass http://127.0.0.1:8081;"));
        assert!(!fx.conf("routekeeper.conf").contains("9090"));
        assert_eq!(fx.reloads(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_entry_point_rejected() {
        let fx = Fixture::new();
        fx.registry
            .add_node(Node::new("k", "svc1", "http://127.0.0.1:8081"))
            .await
            .unwrap();
        fx.registry
            .add_entry_point(EntryPoint::new("x.example.com", "/api", "svc1"))
            .await
            .unwrap();

        let err = fx
            .registry
            .add_entry_point(EntryPoint::new("x.example.com", "/api", "svc1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Validation(ModelError::DuplicateEntryPoint { .. })
        ));
        assert_eq!(fx.registry.entry_points().await.len(), 1);
        assert_eq!(fx.reloads(), 2);
    }

    #[tokio::test]
    async fn test_render_current_rejects_reserved_node_from_state() {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("routekeeper.state");
        std::fs::write(
            &state_path,
            "version = \"0.1\"\n\n[[node]]\nkey = \"k\"\nnode_id = \"routekeeper\"\n\n[[node.endpoint]]\ndestination = \"http://127.0.0.1:8081\"\n",
        )
        .unwrap();
        let store = StateStore::new(&state_path);
        let model = store.load().unwrap();

        let registry = Registry::new(
            model,
            ConfigWriter::new(dir.path().join("conf.d"), "routekeeper", 80),
            store,
            Arc::new(CountingReloader::default()),
        );
        assert!(matches!(
            registry.render_current().await,
            Err(RegistryError::Render(RenderError::ReservedNodeId(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_node_loses_no_updates() {
        let fx = Fixture::new();
        let n = 24;

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let registry = Arc::clone(&fx.registry);
                tokio::spawn(async move {
                    registry
                        .add_node(Node::new("k", format!("node{}", i), format!("http://10.0.0.{}:80", i)))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let model = fx.registry.snapshot().await;
        assert_eq!(model.nodes().len(), n);
        assert_eq!(fx.reloads(), n);

        let stored = StateStore::new(fx.dir.path().join("state/routekeeper.state"))
            .load()
            .unwrap();
        assert_eq!(stored, model);
    }

    #[tokio::test]
    async fn test_resync_rewrites_all_files() {
        let fx = Fixture::new();
        fx.registry
            .add_node(Node::new("k", "svc1", "http://127.0.0.1:8081"))
            .await
            .unwrap();
        std::fs::remove_file(fx.dir.path().join("conf.d/svc1.conf")).unwrap();

        fx.registry.resync().await.unwrap();

        assert!(fx.conf("svc1.conf").contains("8081"));
        assert_eq!(fx.reloads(), 2);
    }
}
