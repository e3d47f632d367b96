//! # Controller module
//!
//! This module provide the meta controller supervisors and the per
//! definition watch controller, supervisors own the set of watch controllers
//! and keep it aligned with the declared definitions.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::join_all;
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};

use crate::svc::{k8s::informer, k8s::registry, webhook};

pub mod config;
pub mod crd;
pub mod watch;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "metac_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["controller"]
    )
    .expect("metrics 'metac_reconciliation_success' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "metac_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["controller"]
    )
    .expect("metrics 'metac_reconciliation_failed' to not be already initialized")
});

#[cfg(feature = "metrics")]
static HOOK_REQUEST: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("metac_hook_request", "number of hook invocations"),
        &["controller", "hook", "result"]
    )
    .expect("metrics 'metac_hook_request' to not be already initialized")
});

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("definition '{0}' declares no sync hook")]
    MissingSyncHook(String),
    #[error("failed to resolve a resource declared by definition '{0}', {1}")]
    Resolve(String, registry::Error),
    #[error("informer caches for definition '{0}' did not sync, {1}")]
    CacheSync(String, informer::Error),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to call hook, {0}")]
    Hook(webhook::Error),
    #[error("failed to serialize object, {0}")]
    Serialize(serde_json::Error),
    #[error("definition '{0}' received a desired attachment without type information")]
    UntypedAttachment(String),
    #[error("definition '{0}' received a desired attachment of undeclared kind '{1}'")]
    UndeclaredAttachment(String, String),
    #[error("definition '{0}' received a desired attachment without a name")]
    UnnamedAttachment(String),
    #[error("failed to read definitions from '{0}', {1}")]
    ReadDefinitions(PathBuf, std::io::Error),
    #[error("failed to parse definition from '{0}', {1}")]
    ParseDefinition(PathBuf, serde_yaml::Error),
    #[error("definition from '{0}' has no name")]
    AnonymousDefinition(PathBuf),
    #[error("config mode requires a definitions path or a loader function")]
    MissingSource,
    #[error("could not start all configured controllers within {0:?}")]
    StartDeadline(Duration),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<webhook::Error> for Error {
    fn from(err: webhook::Error) -> Self {
        Self::Hook(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(err)
    }
}

// -----------------------------------------------------------------------------
// Supervisor trait

/// common lifecycle surface of the meta controller variants
#[async_trait]
pub trait Supervisor {
    /// bring the supervisor up, returns once its controllers are managed
    async fn start(&self) -> Result<(), Error>;

    /// tear the supervisor and all its controllers down
    async fn stop(&self);
}

// -----------------------------------------------------------------------------
// ControllerMap structure

/// holds the running watch controllers keyed by definition, supervisors own
/// an instance and mutate it from a single task so no lock is involved
#[derive(Default)]
pub struct ControllerMap {
    inner: HashMap<String, Arc<watch::WatchController>>,
}

impl ControllerMap {
    pub fn get(&self, key: &str) -> Option<&Arc<watch::WatchController>> {
        self.inner.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn insert(&mut self, key: String, controller: Arc<watch::WatchController>) {
        self.inner.insert(key, controller);
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<watch::WatchController>> {
        self.inner.remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// stop every controller concurrently and join them
    pub async fn shutdown(self) {
        join_all(
            self.inner
                .into_values()
                .map(|controller| async move { controller.stop().await }),
        )
        .await;
    }
}
