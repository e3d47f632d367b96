//! # Kubernetes module
//!
//! This module provide helpers to interact with the kubernetes cluster, the
//! dynamic resource registry, the shared informer factory and the work queue
//! used by controllers.

use std::sync::Arc;

use crate::svc::{cfg::Configuration, k8s::registry::Registry, webhook};

pub mod client;
pub mod finalizer;
pub mod informer;
pub mod queue;
pub mod registry;
pub mod resource;

// -----------------------------------------------------------------------------
// Context structure

/// contains the clients and shared caches given to each controller
#[derive(Clone)]
pub struct Context {
    pub kube: kube::Client,
    pub registry: Arc<Registry>,
    pub informers: Arc<informer::SharedInformerFactory>,
    pub hooks: webhook::Client,
    pub config: Arc<Configuration>,
}

impl Context {
    pub fn new(kube: kube::Client, config: Arc<Configuration>) -> Self {
        let registry = Arc::new(Registry::new(kube.to_owned()));
        let informers = Arc::new(informer::SharedInformerFactory::new(kube.to_owned()));
        let hooks = webhook::Client::new(config.controllers.hook_timeout());

        Self {
            kube,
            registry,
            informers,
            hooks,
            config,
        }
    }
}
