//! # Resource module
//!
//! This module provide helpers on kubernetes resources handled dynamically

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, DynamicObject, Patch, PatchParams},
    core::ErrorResponse,
    discovery::ApiResource,
    Resource, ResourceExt,
};
use serde::Serialize;
use tracing::debug;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as
/// deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the '{namespace}/{name}' key of the resource, the namespace part
/// is empty for cluster scoped resources
pub fn object_key<T>(obj: &T) -> String
where
    T: ResourceExt,
{
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// splits a '{namespace}/{name}' key, an empty namespace yields none
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some(("", name)) => (None, name),
        Some((namespace, name)) => (Some(namespace), name),
        None => (None, key),
    }
}

/// returns difference between the two given objects serialized as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// make a patch request on the given dynamic resource using the given patch
pub async fn patch(
    api: &Api<DynamicObject>,
    obj: &DynamicObject,
    patch: json_patch::Patch,
) -> Result<DynamicObject, kube::Error> {
    let name = obj.name_any();

    if patch.0.is_empty() {
        debug!(
            name = name,
            "skip patch request on resource, no operation to apply"
        );
        return Ok(obj.to_owned());
    }

    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Json::<DynamicObject>(patch),
    )
    .await
}

/// returns an owner reference pointing to the given resource marking it as
/// the managing controller, or none when the resource has no identifier yet
pub fn owner_reference(obj: &DynamicObject, resource: &ApiResource) -> Option<OwnerReference> {
    let uid = obj.uid()?;

    Some(OwnerReference {
        api_version: resource.api_version.to_owned(),
        block_owner_deletion: Some(true),
        controller: Some(true),
        kind: resource.kind.to_owned(),
        name: obj.name_any(),
        uid,
    })
}

/// returns if the given kubernetes api error carries the given http status
/// code
pub fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { code: c, .. }) if *c == code)
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn object(namespace: Option<&str>, name: &str) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: namespace.map(str::to_string),
                uid: Some("uid-1".to_string()),
                ..ObjectMeta::default()
            },
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn object_key_round_trips_through_split() {
        let namespaced = object(Some("ns1"), "t1");
        assert_eq!(object_key(&namespaced), "ns1/t1");
        assert_eq!(split_key("ns1/t1"), (Some("ns1"), "t1"));

        let cluster = object(None, "node-1");
        assert_eq!(object_key(&cluster), "/node-1");
        assert_eq!(split_key("/node-1"), (None, "node-1"));
        assert_eq!(split_key("node-1"), (None, "node-1"));
    }

    #[test]
    fn owner_reference_marks_controller() {
        let resource = ApiResource {
            group: "examples.metac.io".to_string(),
            version: "v1".to_string(),
            api_version: "examples.metac.io/v1".to_string(),
            kind: "Thing".to_string(),
            plural: "things".to_string(),
        };

        let or = owner_reference(&object(Some("ns1"), "t1"), &resource).expect("owner reference");
        assert_eq!(or.api_version, "examples.metac.io/v1");
        assert_eq!(or.kind, "Thing");
        assert_eq!(or.name, "t1");
        assert_eq!(or.uid, "uid-1");
        assert_eq!(or.controller, Some(true));

        let mut orphan = object(Some("ns1"), "t1");
        orphan.metadata.uid = None;
        assert!(owner_reference(&orphan, &resource).is_none());
    }
}
