//! # Finalizer module
//!
//! This module provide helpers methods to interact with kubernetes' resource
//! finalizer

use kube::Resource;

/// returns if there is the given finalizer on the resource
pub fn contains<T>(obj: &T, finalizer: &str) -> bool
where
    T: Resource,
{
    obj.meta()
        .finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|f| f == finalizer)
}

/// add finalizer to the resource
pub fn add<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    if !contains(&obj, finalizer) {
        obj.meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
    }

    obj
}

/// remove finalizer from the resource
pub fn remove<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }

    obj
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;
    use kube::{api::DynamicObject, core::ObjectMeta};

    fn object() -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta::default(),
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn add_is_idempotent() {
        let obj = add(object(), "metac.openebs.io/ns1-ctrl");
        let obj = add(obj, "metac.openebs.io/ns1-ctrl");

        assert!(contains(&obj, "metac.openebs.io/ns1-ctrl"));
        assert_eq!(obj.metadata.finalizers.as_deref().unwrap_or_default().len(), 1);
    }

    #[test]
    fn remove_keeps_other_finalizers() {
        let obj = add(object(), "metac.openebs.io/ns1-ctrl");
        let obj = add(obj, "other.io/keep");
        let obj = remove(obj, "metac.openebs.io/ns1-ctrl");

        assert!(!contains(&obj, "metac.openebs.io/ns1-ctrl"));
        assert!(contains(&obj, "other.io/keep"));
    }
}
