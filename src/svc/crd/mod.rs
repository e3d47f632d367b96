//! # Custom resource definition module
//!
//! This module provide the GenericController custom resource, the declarative
//! description of a watched resource, its attachments and the webhooks that
//! compute the desired state.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Constants

pub const API_GROUP: &str = "metac.openebs.io";

/// label stamped on attachments when `generateSelector` is enabled
pub const CONTROLLER_LABEL: &str = "metac.openebs.io/controller";

// -----------------------------------------------------------------------------
// Selector structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SelectorRequirement {
    #[serde(rename = "key")]
    pub key: String,
    #[serde(rename = "operator")]
    pub operator: SelectorOperator,
    #[serde(rename = "values", default)]
    pub values: Vec<String>,
}

impl SelectorRequirement {
    pub fn matches(&self, entries: &BTreeMap<String, String>) -> bool {
        match self.operator {
            SelectorOperator::In => entries
                .get(&self.key)
                .map(|value| self.values.iter().any(|v| v == value))
                .unwrap_or(false),
            SelectorOperator::NotIn => entries
                .get(&self.key)
                .map(|value| !self.values.iter().any(|v| v == value))
                .unwrap_or(true),
            SelectorOperator::Exists => entries.contains_key(&self.key),
            SelectorOperator::DoesNotExist => !entries.contains_key(&self.key),
        }
    }

    /// render the requirement using the kubernetes selector syntax
    pub fn as_selector(&self) -> String {
        match self.operator {
            SelectorOperator::In => format!("{} in ({})", self.key, self.values.join(",")),
            SelectorOperator::NotIn => format!("{} notin ({})", self.key, self.values.join(",")),
            SelectorOperator::Exists => self.key.to_owned(),
            SelectorOperator::DoesNotExist => format!("!{}", self.key),
        }
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct LabelSelector {
    #[serde(rename = "matchLabels", default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(rename = "matchExpressions", default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
            && self.match_expressions.iter().all(|req| req.matches(labels))
    }

    /// returns the selector rendered as a kubernetes label selector string
    /// suitable for list and watch requests, or none when it is empty
    pub fn as_selector(&self) -> Option<String> {
        let mut parts = self
            .match_labels
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>();

        parts.extend(self.match_expressions.iter().map(|req| req.as_selector()));
        if parts.is_empty() {
            return None;
        }

        Some(parts.join(","))
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct AnnotationSelector {
    #[serde(rename = "matchAnnotations", default)]
    pub match_annotations: BTreeMap<String, String>,
    #[serde(rename = "matchExpressions", default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl AnnotationSelector {
    pub fn matches(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.match_annotations
            .iter()
            .all(|(key, value)| annotations.get(key) == Some(value))
            && self
                .match_expressions
                .iter()
                .all(|req| req.matches(annotations))
    }
}

// -----------------------------------------------------------------------------
// ResourceRule structure

/// names one resource kind the controller interacts with, either as the
/// watched resource or as an attachment
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct ResourceRule {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// lowercase plural name of the resource, e.g. 'pods'
    #[serde(rename = "resource")]
    pub resource: String,
    #[serde(rename = "nameSelector")]
    pub name_selector: Option<Vec<String>>,
    #[serde(rename = "labelSelector")]
    pub label_selector: Option<LabelSelector>,
    #[serde(rename = "annotationSelector")]
    pub annotation_selector: Option<AnnotationSelector>,
}

impl ResourceRule {
    /// returns if the given object passes the name, label and annotation
    /// selectors of this rule
    pub fn matches<T>(&self, obj: &T) -> bool
    where
        T: ResourceExt,
    {
        if let Some(names) = &self.name_selector {
            if !names.iter().any(|name| name == &obj.name_any()) {
                return false;
            }
        }

        if let Some(selector) = &self.label_selector {
            if !selector.matches(obj.labels()) {
                return false;
            }
        }

        if let Some(selector) = &self.annotation_selector {
            if !selector.matches(obj.annotations()) {
                return false;
            }
        }

        true
    }
}

// -----------------------------------------------------------------------------
// Hook structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Webhook {
    #[serde(rename = "url")]
    pub url: String,
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: Option<u32>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Hook {
    #[serde(rename = "webhook")]
    pub webhook: Webhook,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Hooks {
    #[serde(rename = "sync")]
    pub sync: Option<Hook>,
    #[serde(rename = "finalize")]
    pub finalize: Option<Hook>,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "metac.openebs.io")]
#[kube(version = "v1alpha1")]
#[kube(kind = "GenericController")]
#[kube(singular = "genericcontroller")]
#[kube(plural = "genericcontrollers")]
#[kube(shortname = "gctl")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct GenericControllerSpec {
    #[serde(rename = "watch")]
    pub watch: ResourceRule,
    #[serde(rename = "attachments", default)]
    pub attachments: Vec<ResourceRule>,
    #[serde(rename = "hooks", default)]
    pub hooks: Hooks,
    /// optional forced re-enqueue interval for all watched objects
    #[serde(rename = "resyncPeriodSeconds")]
    pub resync_period_seconds: Option<u32>,
    /// when enabled the controller synthesizes a unique label and stamps it
    /// on attachments to claim ownership
    #[serde(rename = "generateSelector", default)]
    pub generate_selector: bool,
}

// -----------------------------------------------------------------------------
// GenericController implementation

impl GenericController {
    /// returns the '{namespace}/{name}' key identifying the definition,
    /// the namespace part is empty for definitions loaded without one
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// returns the namespace and name joined by a dash, used to derive the
    /// finalizer, the ownership label value and the last applied annotation
    pub fn qualified_name(&self) -> String {
        match self.namespace() {
            Some(namespace) if !namespace.is_empty() => {
                format!("{}-{}", namespace, self.name_any())
            }
            _ => self.name_any(),
        }
    }

    /// returns the finalizer stamped on watched objects when a finalize hook
    /// is declared
    pub fn finalizer_name(&self) -> String {
        format!("{}/{}", API_GROUP, self.qualified_name())
    }

    /// returns the annotation key under which the last desired state of an
    /// attachment is recorded
    pub fn last_applied_key(&self) -> String {
        format!("metac.{}/last-applied-config", self.qualified_name())
    }

    /// returns the value of the synthesized ownership label
    pub fn controller_label_value(&self) -> String {
        self.qualified_name()
    }
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn definition(namespace: Option<&str>) -> GenericController {
        let mut ctrl = GenericController::new(
            "thing-controller",
            GenericControllerSpec {
                watch: ResourceRule {
                    api_version: "examples.metac.io/v1".to_string(),
                    resource: "things".to_string(),
                    name_selector: None,
                    label_selector: None,
                    annotation_selector: None,
                },
                attachments: vec![],
                hooks: Hooks::default(),
                resync_period_seconds: None,
                generate_selector: false,
            },
        );

        ctrl.metadata.namespace = namespace.map(str::to_string);
        ctrl
    }

    #[test]
    fn definition_key_includes_namespace() {
        assert_eq!(definition(Some("ns1")).key(), "ns1/thing-controller");
        assert_eq!(definition(None).key(), "/thing-controller");
    }

    #[test]
    fn definition_derived_names() {
        let ctrl = definition(Some("ns1"));

        assert_eq!(
            ctrl.finalizer_name(),
            "metac.openebs.io/ns1-thing-controller"
        );
        assert_eq!(
            ctrl.last_applied_key(),
            "metac.ns1-thing-controller/last-applied-config"
        );
        assert_eq!(definition(None).qualified_name(), "thing-controller");
    }

    #[test]
    fn label_selector_matches_labels_and_expressions() {
        let selector = LabelSelector {
            match_labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            match_expressions: vec![
                SelectorRequirement {
                    key: "tier".to_string(),
                    operator: SelectorOperator::In,
                    values: vec!["frontend".to_string(), "backend".to_string()],
                },
                SelectorRequirement {
                    key: "legacy".to_string(),
                    operator: SelectorOperator::DoesNotExist,
                    values: vec![],
                },
            ],
        };

        let mut labels = BTreeMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "frontend".to_string()),
        ]);
        assert!(selector.matches(&labels));

        labels.insert("legacy".to_string(), "true".to_string());
        assert!(!selector.matches(&labels));

        labels.remove("legacy");
        labels.insert("app".to_string(), "batch".to_string());
        assert!(!selector.matches(&labels));
    }

    #[test]
    fn label_selector_renders_kubernetes_syntax() {
        let selector = LabelSelector {
            match_labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            match_expressions: vec![SelectorRequirement {
                key: "tier".to_string(),
                operator: SelectorOperator::NotIn,
                values: vec!["cache".to_string()],
            }],
        };

        assert_eq!(
            selector.as_selector(),
            Some("app=web,tier notin (cache)".to_string())
        );
        assert_eq!(LabelSelector::default().as_selector(), None);
    }

    #[test]
    fn resource_rule_applies_every_selector() {
        let rule = ResourceRule {
            api_version: "v1".to_string(),
            resource: "pods".to_string(),
            name_selector: Some(vec!["t1-pod".to_string()]),
            label_selector: Some(LabelSelector {
                match_labels: BTreeMap::from([("owner".to_string(), "t1".to_string())]),
                match_expressions: vec![],
            }),
            annotation_selector: None,
        };

        let mut obj = kube::api::DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("t1-pod".to_string()),
                labels: Some(BTreeMap::from([("owner".to_string(), "t1".to_string())])),
                ..ObjectMeta::default()
            },
            data: serde_json::json!({}),
        };
        assert!(rule.matches(&obj));

        obj.metadata.name = Some("t2-pod".to_string());
        assert!(!rule.matches(&obj));
    }

    #[test]
    fn spec_deserializes_from_declarative_yaml() {
        let text = r#"
apiVersion: metac.openebs.io/v1alpha1
kind: GenericController
metadata:
  name: thing-controller
  namespace: ns1
spec:
  watch:
    apiVersion: examples.metac.io/v1
    resource: things
  attachments:
    - apiVersion: v1
      resource: pods
      labelSelector:
        matchLabels:
          owner: thing
  hooks:
    sync:
      webhook:
        url: http://hooks.svc/sync
        timeoutSeconds: 10
  resyncPeriodSeconds: 30
  generateSelector: true
"#;

        let ctrl: GenericController = serde_yaml::from_str(text).expect("valid definition");

        assert_eq!(ctrl.key(), "ns1/thing-controller");
        assert_eq!(ctrl.spec.watch.resource, "things");
        assert_eq!(ctrl.spec.attachments.len(), 1);
        assert_eq!(
            ctrl.spec
                .hooks
                .sync
                .as_ref()
                .expect("sync hook")
                .webhook
                .timeout_seconds,
            Some(10)
        );
        assert_eq!(ctrl.spec.resync_period_seconds, Some(30));
        assert!(ctrl.spec.generate_selector);
    }
}
