//! # Command module
//!
//! This module provide command line interface structures and helpers

use std::{path::PathBuf, process::abort, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info};

use crate::svc::{
    cfg::{Configuration, Mode},
    controller::{self, Supervisor},
    http,
    k8s::{client, Context},
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(crd::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to run supervisor, {0}")]
    Supervisor(controller::Error),
    #[error("failed to handle termination signal, {0}")]
    SigTerm(std::io::Error),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with the custom resource definition
    #[command(name = "custom-resource-definition", alias = "crd")]
    CustomResourceDefinition(crd::CustomResourceDefinition),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(config)
                .await
                .map_err(Error::CustomResourceDefinition),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version)]
pub struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[arg(short = 't', long = "check", global = true)]
    pub check: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), Error> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube = client::try_new(kubeconfig).await.map_err(Error::Client)?;

    // -------------------------------------------------------------------------
    // Create the shared context and the supervisor matching the configured
    // mode
    let context = Context::new(kube, config.to_owned());

    let supervisor: Box<dyn Supervisor + Send + Sync> = match config.controllers.mode {
        Mode::Crd => Box::new(controller::crd::Supervisor::new(context)),
        Mode::Config => Box::new(
            controller::config::Supervisor::new(
                context,
                config.controllers.definitions.to_owned(),
                None,
            )
            .map_err(Error::Supervisor)?,
        ),
    };

    // -------------------------------------------------------------------------
    // Create http server for health and telemetry endpoints
    let server = tokio::spawn({
        let config = config.to_owned();

        async move {
            if let Err(err) = http::server::serve(config).await {
                error!(
                    error = err.to_string(),
                    "could not serve health and telemetry endpoints"
                );
                abort();
            }
        }
    });

    // -------------------------------------------------------------------------
    // Bring the supervisor up, a startup failure is fatal when definitions
    // are static
    if let Err(err) = supervisor.start().await {
        match config.controllers.mode {
            Mode::Config => {
                server.abort();
                return Err(Error::Supervisor(err));
            }
            Mode::Crd => {
                error!(error = err.to_string(), "supervisor could not start");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c().await.map_err(Error::SigTerm)?;
    info!("received termination signal, shutting down");

    // -------------------------------------------------------------------------
    // Stop the supervisor and all its watch controllers
    supervisor.stop().await;

    // -------------------------------------------------------------------------
    // Cancel http server
    server.abort();
    if let Err(err) = server.await {
        if !err.is_cancelled() {
            error!(
                error = err.to_string(),
                "could not wait for the http server to gracefully close"
            );
        }
    }

    Ok(())
}
