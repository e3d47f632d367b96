//! # Registry module
//!
//! This module resolves the '(apiVersion, resource)' pairs declared by
//! definitions into typed rest metadata using the kubernetes discovery api

use std::collections::HashMap;

use kube::{
    api::{Api, DynamicObject},
    discovery::{self, ApiResource, Scope},
    Client,
};
use tokio::sync::RwLock;
use tracing::debug;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to discover api group '{0}', {1}")]
    Discover(String, kube::Error),
    #[error("resource '{0}' is not served by api version '{1}'")]
    NotFound(String, String),
}

// -----------------------------------------------------------------------------
// ResolvedResource structure

/// rest metadata of a resource declared by a definition
#[derive(Clone, Debug)]
pub struct ResolvedResource {
    pub api_resource: ApiResource,
    pub namespaced: bool,
    pub has_status: bool,
}

impl ResolvedResource {
    /// returns an api handle bound to the given namespace when the resource
    /// is namespaced, or to the whole cluster otherwise
    pub fn api(&self, client: Client, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(namespace) if self.namespaced => {
                Api::namespaced_with(client, namespace, &self.api_resource)
            }
            _ => Api::all_with(client, &self.api_resource),
        }
    }
}

// -----------------------------------------------------------------------------
// Registry structure

/// resolves and caches rest metadata for dynamically declared resources,
/// resolution failures are not cached so a resource kind registered later is
/// picked up on the next attempt
pub struct Registry {
    client: Client,
    cache: RwLock<HashMap<(String, String), ResolvedResource>>,
}

impl Registry {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// resolve the given api version and lowercase plural resource name into
    /// rest metadata
    pub async fn resolve(&self, api_version: &str, resource: &str) -> Result<ResolvedResource, Error> {
        let key = (api_version.to_string(), resource.to_string());
        if let Some(resolved) = self.cache.read().await.get(&key) {
            return Ok(resolved.to_owned());
        }

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };

        let apigroup = discovery::group(&self.client, group)
            .await
            .map_err(|err| Error::Discover(group.to_string(), err))?;

        let (api_resource, caps) = apigroup
            .versioned_resources(version)
            .into_iter()
            .find(|(ar, _)| {
                ar.plural == resource || ar.kind.to_lowercase() == resource.to_lowercase()
            })
            .ok_or_else(|| Error::NotFound(resource.to_string(), api_version.to_string()))?;

        let resolved = ResolvedResource {
            namespaced: matches!(caps.scope, Scope::Namespaced),
            has_status: caps
                .subresources
                .iter()
                .any(|(sub, _)| sub.plural == "status" || sub.plural.ends_with("/status")),
            api_resource,
        };

        debug!(
            api_version = api_version,
            resource = resource,
            kind = resolved.api_resource.kind,
            namespaced = resolved.namespaced,
            "resolved resource through discovery"
        );

        self.cache
            .write()
            .await
            .insert(key, resolved.to_owned());

        Ok(resolved)
    }
}
