//! # Apply module
//!
//! This module provide the three way merge used to converge attachments, it
//! combines the last applied state recorded on the object, the live state
//! observed on the cluster and the desired state returned by a hook.

use kube::{api::DynamicObject, ResourceExt};
use serde_json::{Map, Value};

// -----------------------------------------------------------------------------
// Constants

/// metadata fields assigned by the api server, ignored when comparing a
/// merged object against the live one
const SERVER_MANAGED_METADATA: [&str; 5] = [
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
];

/// merge key used for lists of objects, e.g. containers and ports
const LIST_MERGE_KEY: &str = "name";

// -----------------------------------------------------------------------------
// Three way merge

/// returns the result of merging the desired state into the live state, the
/// last applied state decides which absent fields are cleared and which are
/// preserved:
///
/// - a field present in desired always wins over live
/// - a field present in last but absent from desired is removed, the
///   controller owned it and relinquishes it
/// - a field absent from both last and desired keeps its live value, it
///   belongs to the cluster or to another actor
pub fn merge(last: &Value, live: &Value, desired: &Value) -> Value {
    merge_values(last, live, desired)
}

fn merge_values(last: &Value, live: &Value, desired: &Value) -> Value {
    match (live, desired) {
        (Value::Object(live_map), Value::Object(desired_map)) => {
            merge_maps(last.as_object(), live_map, desired_map)
        }
        (Value::Array(live_items), Value::Array(desired_items))
            if is_named_list(live_items) && is_named_list(desired_items) =>
        {
            let empty = vec![];
            let last_items = last.as_array().unwrap_or(&empty);

            Value::Array(merge_named_lists(last_items, live_items, desired_items))
        }
        _ => desired.to_owned(),
    }
}

fn merge_maps(
    last: Option<&Map<String, Value>>,
    live: &Map<String, Value>,
    desired: &Map<String, Value>,
) -> Value {
    let null = Value::Null;
    let mut merged = Map::new();

    // live keys the controller never owned are preserved, keys recorded in
    // the last applied state but dropped from desired are removed
    for (key, live_value) in live {
        if desired.contains_key(key) {
            continue;
        }

        if last.map(|map| map.contains_key(key)).unwrap_or(false) {
            continue;
        }

        merged.insert(key.to_owned(), live_value.to_owned());
    }

    for (key, desired_value) in desired {
        // an explicit null in desired removes the field
        if desired_value.is_null() {
            continue;
        }

        let last_value = last.and_then(|map| map.get(key)).unwrap_or(&null);
        let value = match live.get(key) {
            Some(live_value) => merge_values(last_value, live_value, desired_value),
            None => desired_value.to_owned(),
        };

        merged.insert(key.to_owned(), value);
    }

    Value::Object(merged)
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(|item| element_name(item).is_some())
}

fn element_name(item: &Value) -> Option<&str> {
    item.as_object()
        .and_then(|map| map.get(LIST_MERGE_KEY))
        .and_then(Value::as_str)
}

fn merge_named_lists(last: &[Value], live: &[Value], desired: &[Value]) -> Vec<Value> {
    let find = |items: &[Value], name: &str| -> Option<Value> {
        items
            .iter()
            .find(|item| element_name(item) == Some(name))
            .map(|item| (*item).to_owned())
    };

    let mut merged = vec![];

    for desired_item in desired {
        let name = match element_name(desired_item) {
            Some(name) => name,
            None => continue,
        };

        let item = match find(live, name) {
            Some(live_item) => merge_values(
                &find(last, name).unwrap_or(Value::Null),
                &live_item,
                desired_item,
            ),
            None => desired_item.to_owned(),
        };

        merged.push(item);
    }

    // elements owned by the cluster or another actor are preserved
    for live_item in live {
        if let Some(name) = element_name(live_item) {
            if find(desired, name).is_none() && find(last, name).is_none() {
                merged.push(live_item.to_owned());
            }
        }
    }

    merged
}

// -----------------------------------------------------------------------------
// Structural comparison

/// returns a copy of the given object stripped of the fields assigned by the
/// api server
pub fn prune(obj: &Value) -> Value {
    let mut pruned = obj.to_owned();

    if let Some(map) = pruned.as_object_mut() {
        map.remove("status");
    }

    if let Some(metadata) = pruned
        .pointer_mut("/metadata")
        .and_then(Value::as_object_mut)
    {
        for field in SERVER_MANAGED_METADATA {
            metadata.remove(field);
        }
    }

    pruned
}

/// returns if the two objects are structurally equal once the server
/// assigned fields are ignored
pub fn is_same(origin: &Value, modified: &Value) -> bool {
    json_patch::diff(&prune(origin), &prune(modified)).0.is_empty()
}

// -----------------------------------------------------------------------------
// Last applied state

/// returns the last applied state recorded on the object under the given
/// annotation key, an absent or unreadable annotation yields none so every
/// field of the live object is treated as non owned
pub fn get_last_applied(obj: &DynamicObject, key: &str) -> Option<Value> {
    obj.annotations()
        .get(key)
        .and_then(|text| serde_json::from_str(text).ok())
}

/// record the canonical serialization of the object under the given
/// annotation key, the annotation itself is excluded from the serialization
pub fn set_last_applied(obj: &mut DynamicObject, key: &str) -> Result<(), serde_json::Error> {
    let mut value = serde_json::to_value(&*obj)?;

    if let Some(annotations) = value
        .pointer_mut("/metadata/annotations")
        .and_then(Value::as_object_mut)
    {
        annotations.remove(key);
    }

    let text = serde_json::to_string(&value)?;
    obj.annotations_mut().insert(key.to_string(), text);

    Ok(())
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn desired_fields_win_over_live() {
        let last = json!({"spec": {"image": "nginx:1.24"}});
        let live = json!({"spec": {"image": "nginx:1.24", "nodeName": "node-a"}});
        let desired = json!({"spec": {"image": "nginx:1.25"}});

        let merged = merge(&last, &live, &desired);

        assert_eq!(
            merged,
            json!({"spec": {"nodeName": "node-a", "image": "nginx:1.25"}})
        );
    }

    #[test]
    fn fields_unknown_to_last_and_desired_are_preserved() {
        let live = json!({"spec": {"image": "nginx"}, "metadata": {"labels": {"added-by-user": "yes"}}});
        let desired = json!({"spec": {"image": "nginx"}});

        let merged = merge(&Value::Null, &live, &desired);

        assert_eq!(
            merged.pointer("/metadata/labels/added-by-user"),
            Some(&json!("yes"))
        );
    }

    #[test]
    fn fields_dropped_from_desired_are_cleared() {
        let last = json!({"spec": {"image": "nginx", "replicas": 3}});
        let live = json!({"spec": {"image": "nginx", "replicas": 3, "paused": true}});
        let desired = json!({"spec": {"image": "nginx"}});

        let merged = merge(&last, &live, &desired);

        assert_eq!(merged.pointer("/spec/replicas"), None);
        assert_eq!(merged.pointer("/spec/paused"), Some(&json!(true)));
    }

    #[test]
    fn explicit_null_in_desired_removes_the_field() {
        let live = json!({"spec": {"suspend": true}});
        let desired = json!({"spec": {"suspend": null}});

        let merged = merge(&Value::Null, &live, &desired);

        assert_eq!(merged.pointer("/spec/suspend"), None);
    }

    #[test]
    fn merge_is_idempotent() {
        let last = json!({"spec": {"image": "nginx"}});
        let live = json!({"spec": {"image": "nginx", "nodeName": "node-a"}});
        let desired = json!({"spec": {"image": "nginx"}});

        let merged = merge(&last, &live, &desired);
        let again = merge(&desired, &merged, &desired);

        assert!(is_same(&merged, &again));
        assert!(is_same(&live, &merged));
    }

    #[test]
    fn lists_of_named_objects_merge_element_wise() {
        let last = json!({"containers": [
            {"name": "app", "image": "app:v1"},
            {"name": "helper", "image": "helper:v1"}
        ]});
        let live = json!({"containers": [
            {"name": "app", "image": "app:v1", "imagePullPolicy": "IfNotPresent"},
            {"name": "helper", "image": "helper:v1"},
            {"name": "sidecar-injected", "image": "mesh:v3"}
        ]});
        let desired = json!({"containers": [
            {"name": "app", "image": "app:v2"}
        ]});

        let merged = merge(&last, &live, &desired);

        // the app container is updated keeping the cluster defaulted field,
        // the helper container was relinquished, the injected sidecar stays
        assert_eq!(
            merged,
            json!({"containers": [
                {"name": "app", "imagePullPolicy": "IfNotPresent", "image": "app:v2"},
                {"name": "sidecar-injected", "image": "mesh:v3"}
            ]})
        );
    }

    #[test]
    fn lists_without_merge_key_are_atomic() {
        let live = json!({"spec": {"args": ["--a", "--b"]}});
        let desired = json!({"spec": {"args": ["--c"]}});

        let merged = merge(&Value::Null, &live, &desired);

        assert_eq!(merged.pointer("/spec/args"), Some(&json!(["--c"])));
    }

    #[test]
    fn comparison_ignores_server_assigned_fields() {
        let origin = json!({
            "metadata": {"name": "t1-pod", "resourceVersion": "42", "uid": "u-1", "generation": 1},
            "spec": {"image": "nginx"},
            "status": {"phase": "Running"}
        });
        let modified = json!({
            "metadata": {"name": "t1-pod", "resourceVersion": "43", "uid": "u-1", "generation": 2},
            "spec": {"image": "nginx"},
            "status": {"phase": "Pending"}
        });

        assert!(is_same(&origin, &modified));

        let drifted = json!({
            "metadata": {"name": "t1-pod"},
            "spec": {"image": "nginx:next"}
        });
        assert!(!is_same(&origin, &drifted));
    }

    #[test]
    fn last_applied_round_trip_excludes_itself() {
        let mut obj = DynamicObject {
            types: None,
            metadata: kube::core::ObjectMeta {
                name: Some("t1-pod".to_string()),
                namespace: Some("ns1".to_string()),
                ..kube::core::ObjectMeta::default()
            },
            data: serde_json::json!({"spec": {"image": "nginx"}}),
        };

        let key = "metac.ns1-ctrl/last-applied-config";
        set_last_applied(&mut obj, key).expect("serializable object");

        let recorded = get_last_applied(&obj, key).expect("recorded state");
        assert_eq!(recorded.pointer("/spec/image"), Some(&json!("nginx")));
        assert_eq!(
            recorded.pointer("/metadata/annotations"),
            None,
            "the annotation must not contain itself"
        );

        assert_eq!(get_last_applied(&obj, "metac.other/last-applied-config"), None);
    }
}
