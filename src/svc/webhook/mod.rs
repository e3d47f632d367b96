//! # Webhook module
//!
//! This module provide the client invoking the remote sync and finalize
//! hooks, together with the json envelopes exchanged with them.

use std::{collections::BTreeMap, time::Duration};

use hyper::{
    client::HttpConnector,
    header::{self, HeaderValue},
    Body, Method, StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::svc::{
    crd::{GenericController, Webhook},
    k8s::resource,
};
use kube::api::DynamicObject;

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------------
// Request envelope

/// observed state sent to a sync or finalize hook
#[derive(Serialize, Clone, Debug)]
pub struct Request {
    #[serde(rename = "controller")]
    pub controller: GenericController,
    #[serde(rename = "watched")]
    pub watched: DynamicObject,
    /// observed attachments grouped by '{apiVersion}/{kind}' and then by
    /// '{namespace}/{name}'
    #[serde(rename = "attachments")]
    pub attachments: BTreeMap<String, BTreeMap<String, DynamicObject>>,
    #[serde(rename = "finalizing")]
    pub finalizing: bool,
}

impl Request {
    pub fn new(
        controller: GenericController,
        watched: DynamicObject,
        attachments: &[DynamicObject],
        finalizing: bool,
    ) -> Self {
        let mut grouped: BTreeMap<String, BTreeMap<String, DynamicObject>> = BTreeMap::new();

        for obj in attachments {
            let (api_version, kind) = obj
                .types
                .as_ref()
                .map(|types| (types.api_version.as_str(), types.kind.as_str()))
                .unwrap_or_default();
            let group = format!("{}/{}", api_version, kind);

            grouped
                .entry(group)
                .or_default()
                .insert(resource::object_key(obj), obj.to_owned());
        }

        Self {
            controller,
            watched,
            attachments: grouped,
            finalizing,
        }
    }
}

// -----------------------------------------------------------------------------
// Response envelope

/// desired state returned by a sync or finalize hook, the attachments are
/// the complete desired set for the watched object and omissions mean delete
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Response {
    #[serde(rename = "status", default)]
    pub status: Option<Value>,
    #[serde(rename = "attachments", default)]
    pub attachments: Vec<DynamicObject>,
    #[serde(rename = "finalized", default)]
    pub finalized: Option<bool>,
    #[serde(rename = "resyncAfterSeconds", default)]
    pub resync_after_seconds: Option<f64>,
}

/// body a hook may answer with on a 4xx status to stop retries
#[derive(Deserialize, Debug)]
struct Rejection {
    #[serde(rename = "permanent", default)]
    permanent: bool,
    #[serde(rename = "message", default)]
    message: String,
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize hook request, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to build http request for hook '{0}', {1}")]
    Request(String, hyper::http::Error),
    #[error("hook '{0}' did not answer within {1:?}")]
    Timeout(String, Duration),
    #[error("failed to reach hook '{0}', {1}")]
    Transport(String, hyper::Error),
    #[error("hook '{0}' answered with status '{1}'")]
    Status(String, StatusCode),
    #[error("hook '{0}' permanently rejected the request, {1}")]
    Rejected(String, String),
    #[error("failed to deserialize response of hook '{0}', {1}")]
    Deserialize(String, serde_json::Error),
}

impl Error {
    /// returns if retrying the call may succeed, a permanent rejection is
    /// the only fatal answer
    pub fn retriable(&self) -> bool {
        !matches!(self, Self::Rejected(_, _))
    }
}

// -----------------------------------------------------------------------------
// Client structure

/// http client invoking hooks with the json envelopes
#[derive(Clone)]
pub struct Client {
    http: hyper::Client<HttpConnector>,
    timeout: Duration,
}

impl Client {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: hyper::Client::new(),
            timeout,
        }
    }

    /// post the given request to the webhook and returns its decoded
    /// response
    pub async fn call(&self, webhook: &Webhook, request: &Request) -> Result<Response, Error> {
        let url = webhook.url.to_owned();
        let body = serde_json::to_vec(request).map_err(Error::Serialize)?;

        let req = hyper::Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .body(Body::from(body))
            .map_err(|err| Error::Request(url.to_owned(), err))?;

        let timeout = webhook
            .timeout_seconds
            .map(|secs| Duration::from_secs(u64::from(secs)))
            .unwrap_or(self.timeout);

        let res = tokio::time::timeout(timeout, self.http.request(req))
            .await
            .map_err(|_| Error::Timeout(url.to_owned(), timeout))?
            .map_err(|err| Error::Transport(url.to_owned(), err))?;

        let status = res.status();
        let bytes = hyper::body::to_bytes(res.into_body())
            .await
            .map_err(|err| Error::Transport(url.to_owned(), err))?;

        if !status.is_success() {
            if status.is_client_error() {
                if let Ok(rejection) = serde_json::from_slice::<Rejection>(&bytes) {
                    if rejection.permanent {
                        return Err(Error::Rejected(url, rejection.message));
                    }
                }
            }

            return Err(Error::Status(url, status));
        }

        serde_json::from_slice(&bytes).map_err(|err| Error::Deserialize(url, err))
    }
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::crd::{GenericControllerSpec, Hooks, ResourceRule};
    use hyper::{
        service::{make_service_fn, service_fn},
        Server,
    };
    use kube::core::ObjectMeta;
    use std::net::SocketAddr;

    fn controller() -> GenericController {
        GenericController::new(
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
        )
    }

    fn watched() -> DynamicObject {
        DynamicObject {
            types: Some(kube::core::TypeMeta {
                api_version: "examples.metac.io/v1".to_string(),
                kind: "Thing".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some("t1".to_string()),
                namespace: Some("ns1".to_string()),
                ..ObjectMeta::default()
            },
            data: serde_json::json!({}),
        }
    }

    fn pod(name: &str) -> DynamicObject {
        DynamicObject {
            types: Some(kube::core::TypeMeta {
                api_version: "v1".to_string(),
                kind: "Pod".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                ..ObjectMeta::default()
            },
            data: serde_json::json!({}),
        }
    }

    async fn answer_with(status: StatusCode, body: &'static str) -> SocketAddr {
        let make = make_service_fn(move |_| async move {
            Ok::<_, hyper::Error>(service_fn(move |_req| async move {
                hyper::Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
            }))
        });

        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make);
        let addr = server.local_addr();

        tokio::spawn(server);
        addr
    }

    #[test]
    fn request_groups_attachments_by_kind_then_key() {
        let request = Request::new(
            controller(),
            watched(),
            &[pod("t1-pod"), pod("t1-sidecar")],
            false,
        );

        let value = serde_json::to_value(&request).expect("serializable request");

        assert!(value
            .pointer("/attachments/v1~1Pod/ns1~1t1-pod")
            .is_some());
        assert!(value
            .pointer("/attachments/v1~1Pod/ns1~1t1-sidecar")
            .is_some());
        assert_eq!(value.pointer("/finalizing"), Some(&serde_json::json!(false)));
    }

    #[test]
    fn response_fields_all_default() {
        let response: Response = serde_json::from_str("{}").expect("empty response");

        assert!(response.status.is_none());
        assert!(response.attachments.is_empty());
        assert!(response.finalized.is_none());
        assert!(response.resync_after_seconds.is_none());
    }

    #[tokio::test]
    async fn call_round_trips_the_envelope() {
        let addr = answer_with(
            StatusCode::OK,
            r#"{"attachments": [{"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "t1-pod", "namespace": "ns1"}}], "resyncAfterSeconds": 5}"#,
        )
        .await;

        let client = Client::new(DEFAULT_TIMEOUT);
        let webhook = Webhook {
            url: format!("http://{}/sync", addr),
            timeout_seconds: Some(5),
        };

        let request = Request::new(controller(), watched(), &[], false);
        let response = client.call(&webhook, &request).await.expect("hook answer");

        assert_eq!(response.attachments.len(), 1);
        assert_eq!(response.resync_after_seconds, Some(5.0));
    }

    #[tokio::test]
    async fn server_errors_are_retriable() {
        let addr = answer_with(StatusCode::INTERNAL_SERVER_ERROR, "{}").await;

        let client = Client::new(DEFAULT_TIMEOUT);
        let webhook = Webhook {
            url: format!("http://{}/sync", addr),
            timeout_seconds: None,
        };

        let request = Request::new(controller(), watched(), &[], false);
        let err = client
            .call(&webhook, &request)
            .await
            .expect_err("an error");

        assert!(matches!(err, Error::Status(_, StatusCode::INTERNAL_SERVER_ERROR)));
        assert!(err.retriable());
    }

    #[tokio::test]
    async fn permanent_rejections_are_fatal() {
        let addr = answer_with(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"permanent": true, "message": "unknown attachment kind"}"#,
        )
        .await;

        let client = Client::new(DEFAULT_TIMEOUT);
        let webhook = Webhook {
            url: format!("http://{}/sync", addr),
            timeout_seconds: None,
        };

        let request = Request::new(controller(), watched(), &[], false);
        let err = client
            .call(&webhook, &request)
            .await
            .expect_err("an error");

        assert!(matches!(err, Error::Rejected(_, _)));
        assert!(!err.retriable());
    }

    #[tokio::test]
    async fn malformed_bodies_are_reported() {
        let addr = answer_with(StatusCode::OK, "not json at all").await;

        let client = Client::new(DEFAULT_TIMEOUT);
        let webhook = Webhook {
            url: format!("http://{}/sync", addr),
            timeout_seconds: None,
        };

        let request = Request::new(controller(), watched(), &[], false);
        let err = client
            .call(&webhook, &request)
            .await
            .expect_err("an error");

        assert!(matches!(err, Error::Deserialize(_, _)));
        assert!(err.retriable());
    }
}
