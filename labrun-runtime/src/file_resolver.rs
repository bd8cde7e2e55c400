//! File Resolver Chain (spec §4.K): chain-of-responsibility over
//! `ResolveSource -> ResolveResult`.
//!
//! Grounded on the same object-safe, `BoxFuture`-returning trait style as
//! [`crate::device_status::DeviceStatusProvider`]; each node either resolves
//! a source or declares it doesn't apply, in which case the chain tries the
//! next one. [`crate::job_manager::JobManager::start_resolve_job_files`]
//! already does the per-job once-only caching (spec: "a `ResolveSource` that
//! resolves once per job is shared across all tests in that job"), so this
//! module's own [`FileResolverChain::cache_node`] models the node-local
//! cache the original chain also has (by content checksum tag), a distinct
//! concern from the job-scoped cache.

use crate::job_manager::{ResolveErr, ResolveSource};
use camino::Utf8PathBuf;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{instrument, warn};

/// One link in the chain. `try_resolve` returns `None` to delegate to the
/// next node, `Some(Err(_))` for a hard failure that stops the chain, and
/// `Some(Ok(_))` once resolved.
pub trait ResolverNode: Send + Sync {
    fn name(&self) -> &'static str;

    fn try_resolve<'a>(
        &'a self,
        source: &'a ResolveSource,
    ) -> BoxFuture<'a, Option<Result<Utf8PathBuf, ResolveErr>>>;
}

/// Resolves a source already present on local disk (tag `local` paths are
/// filesystem-absolute already).
pub struct LocalNode;

impl ResolverNode for LocalNode {
    fn name(&self) -> &'static str {
        "local"
    }

    fn try_resolve<'a>(
        &'a self,
        source: &'a ResolveSource,
    ) -> BoxFuture<'a, Option<Result<Utf8PathBuf, ResolveErr>>> {
        Box::pin(async move {
            if source.tag != "local" {
                return None;
            }
            let path = Utf8PathBuf::from(source.path.as_str());
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                Some(Ok(path))
            } else {
                Some(Err(ResolveErr(Arc::from(format!(
                    "local file {path} does not exist"
                )))))
            }
        })
    }
}

/// A node-local cache keyed by `ResolveSource` equality, checked before any
/// node that would otherwise re-fetch. Populated as later nodes resolve.
pub struct CacheNode {
    entries: Mutex<HashMap<ResolveSource, Utf8PathBuf>>,
}

impl CacheNode {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, source: ResolveSource, path: Utf8PathBuf) {
        self.entries.lock().expect("cache lock poisoned").insert(source, path);
    }
}

impl Default for CacheNode {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverNode for CacheNode {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn try_resolve<'a>(
        &'a self,
        source: &'a ResolveSource,
    ) -> BoxFuture<'a, Option<Result<Utf8PathBuf, ResolveErr>>> {
        Box::pin(async move {
            self.entries
                .lock()
                .expect("cache lock poisoned")
                .get(source)
                .cloned()
                .map(Ok)
        })
    }
}

/// A remote-fetch node whose actual transport (ATS file server, GCS, ...) is
/// supplied by the host as a blocking closure, the same pattern
/// [`crate::proxy_device::LeaseFn`] uses for device leasing.
pub struct RemoteFetchNode {
    node_name: &'static str,
    tag_prefix: &'static str,
    fetch: Arc<dyn Fn(&ResolveSource) -> Result<Utf8PathBuf, ResolveErr> + Send + Sync>,
}

impl RemoteFetchNode {
    pub fn new(
        node_name: &'static str,
        tag_prefix: &'static str,
        fetch: Arc<dyn Fn(&ResolveSource) -> Result<Utf8PathBuf, ResolveErr> + Send + Sync>,
    ) -> Self {
        Self {
            node_name,
            tag_prefix,
            fetch,
        }
    }
}

impl ResolverNode for RemoteFetchNode {
    fn name(&self) -> &'static str {
        self.node_name
    }

    fn try_resolve<'a>(
        &'a self,
        source: &'a ResolveSource,
    ) -> BoxFuture<'a, Option<Result<Utf8PathBuf, ResolveErr>>> {
        Box::pin(async move {
            if !source.tag.starts_with(self.tag_prefix) {
                return None;
            }
            let fetch = self.fetch.clone();
            let source = source.clone();
            let result = tokio::task::spawn_blocking(move || (fetch)(&source))
                .await
                .unwrap_or_else(|_| Err(ResolveErr(Arc::from("fetch task panicked"))));
            Some(result)
        })
    }
}

/// The ordered chain: local, then node-local cache, then remote nodes in
/// registration order.
pub struct FileResolverChain {
    nodes: Vec<Arc<dyn ResolverNode>>,
    cache: Arc<CacheNode>,
}

impl FileResolverChain {
    pub fn new(cache: Arc<CacheNode>) -> Self {
        Self {
            nodes: vec![Arc::new(LocalNode), cache.clone() as Arc<dyn ResolverNode>],
            cache,
        }
    }

    pub fn push_node(&mut self, node: Arc<dyn ResolverNode>) {
        self.nodes.push(node);
    }

    /// Tries every node in order; the first to return `Some` wins. A node
    /// that claims the source (returns `Some`) but fails stops the chain
    /// immediately rather than falling through to a later node — claiming a
    /// source is a statement that this node is authoritative for it, so a
    /// node further down the chain is never a valid substitute. Caches a
    /// success against the original `source` so a future lookup skips
    /// straight to [`CacheNode`].
    #[instrument(level = "debug", skip(self), fields(tag = %source.tag))]
    pub async fn resolve(&self, source: ResolveSource) -> Result<Utf8PathBuf, ResolveErr> {
        for node in &self.nodes {
            if let Some(result) = node.try_resolve(&source).await {
                match &result {
                    Ok(path) => self.cache.insert(source.clone(), path.clone()),
                    Err(error) => {
                        warn!(node = node.name(), tag = %source.tag, %error, "resolver node failed, stopping chain");
                    }
                }
                return result;
            }
        }
        Err(ResolveErr(Arc::from(format!(
            "no resolver node matched tag `{}`",
            source.tag
        ))))
    }

    /// Adapter matching [`crate::job_manager::JobManager::start_resolve_job_files`]'s
    /// `resolve_fn` parameter shape.
    pub fn as_resolve_fn(
        self: &Arc<Self>,
    ) -> impl Fn(ResolveSource) -> BoxFuture<'static, Result<Utf8PathBuf, ResolveErr>> + Send + Sync + Clone + 'static
    {
        let chain = self.clone();
        move |source| {
            let chain = chain.clone();
            Box::pin(async move { chain.resolve(source).await })
        }
    }
}
