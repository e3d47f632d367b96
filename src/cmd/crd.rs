//! # Custom resource definition module
//!
//! This module provides the command printing the GenericController custom
//! resource definition so it can be applied on a cluster

use std::sync::Arc;

use async_trait::async_trait;
use kube::CustomResourceExt;

use crate::{
    cmd::Executor,
    svc::{cfg::Configuration, crd::GenericController},
};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// CustomResourceDefinition command

#[derive(clap::Args, Clone, Debug)]
pub struct CustomResourceDefinition {}

#[async_trait]
impl Executor for CustomResourceDefinition {
    type Error = Error;

    async fn execute(&self, _config: Arc<Configuration>) -> Result<(), Self::Error> {
        let crd = serde_yaml::to_string(&GenericController::crd()).map_err(Error::Serialize)?;

        print!("{}", crd);
        Ok(())
    }
}
