//! # Metrics module
//!
//! This module renders the prometheus registry for the telemetry endpoint

use hyper::{header, Body, Request, Response, StatusCode};
use prometheus::{gather, Encoder, TextEncoder};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to encode prometheus registry, {0}")]
    Encode(prometheus::Error),
    #[error("failed to build metrics response, {0}")]
    Response(hyper::http::Error),
}

// -----------------------------------------------------------------------------
// Helper methods

/// answers with every metric family currently registered, rendered in the
/// prometheus text exposition format
pub async fn handler(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let encoder = TextEncoder::new();
    let mut buf = vec![];

    encoder
        .encode(&gather(), &mut buf)
        .map_err(Error::Encode)?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buf))
        .map_err(Error::Response)
}
