//! # Services module
//!
//! This module provide the services composing the meta controller, the
//! kubernetes plumbing, the apply engine, the webhook client and the
//! controllers themselves.

pub mod apply;
pub mod cfg;
pub mod controller;
pub mod crd;
pub mod http;
pub mod k8s;
pub mod webhook;
