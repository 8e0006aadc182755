//! evq kubehub: feeds a kube watch stream into an [`EventQueue`].

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use evq_core::KeyError;
use evq_store::EventQueue;

mod reflector;

pub use reflector::Reflector;

/// Queue keyed by `namespace/name` of kube resources.
pub type ResourceQueue<K> = EventQueue<K, fn(&K) -> Result<String, KeyError>>;

/// How often objects held back behind a pending deletion are retried.
const PARKED_RETRY: Duration = Duration::from_millis(500);

pub fn resource_queue<K: Resource + Clone>() -> ResourceQueue<K> {
    EventQueue::new(object_key::<K> as fn(&K) -> Result<String, KeyError>)
}

/// `namespace/name` for namespaced resources, `name` for cluster-scoped ones.
pub fn object_key<K: Resource>(obj: &K) -> Result<String, KeyError> {
    let meta = obj.meta();
    let name = meta.name.as_deref().filter(|n| !n.is_empty()).ok_or(KeyError::MissingName)?;
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => Ok(format!("{}/{}", ns, name)),
        _ => Ok(name.to_string()),
    }
}

/// Parse `v1/ConfigMap` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Watch scope and selectors for a reflector.
#[derive(Debug, Clone, Default)]
pub struct ReflectorConfig {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl ReflectorConfig {
    pub fn watcher_config(&self) -> watcher::Config {
        let mut cfg = watcher::Config::default();
        if let Some(labels) = self.label_selector.as_deref() {
            cfg = cfg.labels(labels);
        }
        if let Some(fields) = self.field_selector.as_deref() {
            cfg = cfg.fields(fields);
        }
        cfg
    }
}

/// Resolve a GVK key through discovery and build a dynamic API for it.
pub async fn dynamic_api(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
    let gvk = parse_gvk_key(gvk_key)?;
    let discovery = Discovery::new(client.clone()).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group != gvk.group || ar.version != gvk.version || ar.kind != gvk.kind {
                continue;
            }
            let api = match (&caps.scope, namespace) {
                (Scope::Namespaced, Some(ns)) => Api::namespaced_with(client.clone(), ns, &ar),
                _ => Api::all_with(client.clone(), &ar),
            };
            debug!(gvk = %gvk_key, plural = %ar.plural, "resolved api resource");
            return Ok(api);
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// List+watch `api` into `queue` until the stream ends or the queue is cancelled.
///
/// Watch errors are logged and retried with the watcher's default backoff.
pub async fn run_reflector<K>(api: Api<K>, config: ReflectorConfig, queue: Arc<ResourceQueue<K>>) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let stream = watcher::watcher(api, config.watcher_config()).default_backoff();
    futures::pin_mut!(stream);
    let mut reflector = Reflector::new(queue);
    let mut retry = tokio::time::interval(PARKED_RETRY);
    info!(ns = ?config.namespace, labels = ?config.label_selector, "reflector started");
    loop {
        if reflector.queue().is_cancelled() {
            info!("queue cancelled; stopping reflector");
            return Ok(());
        }
        tokio::select! {
            next = stream.try_next() => match next {
                Ok(Some(ev)) => reflector.apply(ev),
                Ok(None) => break,
                Err(e) => {
                    metrics::counter!("reflector_watch_errors_total", 1u64);
                    warn!(error = %e, "watch error; backing off");
                }
            },
            _ = retry.tick() => reflector.flush_parked(),
        }
    }
    warn!("watcher stream ended");
    Ok(())
}
