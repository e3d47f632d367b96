//! # CRD supervisor module
//!
//! This module provide the meta controller variant driven by GenericController
//! custom resources, watch controllers are started, recreated and stopped as
//! definitions appear, change and disappear on the cluster.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::Api,
    runtime::{
        reflector,
        reflector::{store::Writer, ObjectRef, Store},
        watcher,
        watcher::Event,
        WatchStreamExt,
    },
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::svc::{
    controller::{watch::WatchController, ControllerMap, Error},
    crd::GenericController,
    k8s::{informer, queue::RateLimitingQueue, resource, Context},
};

// -----------------------------------------------------------------------------
// Supervisor structure

#[derive(Default)]
struct Tasks {
    informer: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<ControllerMap>>,
}

/// meta controller variant subscribing to GenericController custom resources
pub struct Supervisor {
    context: Context,
    queue: RateLimitingQueue,
    tasks: tokio::sync::Mutex<Tasks>,
}

impl Supervisor {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            queue: RateLimitingQueue::new(),
            tasks: tokio::sync::Mutex::new(Tasks::default()),
        }
    }
}

#[async_trait]
impl super::Supervisor for Supervisor {
    /// subscribe to the definitions, wait for the initial list and spawn the
    /// single reconciliation worker owning the controller map
    async fn start(&self) -> Result<(), Error> {
        let api = Api::<GenericController>::all(self.context.kube.to_owned());
        let writer = Writer::<GenericController>::default();
        let store = writer.as_reader();
        let (ready_tx, mut ready_rx) = watch::channel(false);

        let informer = tokio::spawn({
            let queue = self.queue.to_owned();

            async move {
                let mut stream = reflector(
                    writer,
                    watcher(api, watcher::Config::default()).default_backoff(),
                )
                .boxed();

                loop {
                    match stream.try_next().await {
                        Ok(Some(event)) => match &event {
                            Event::Applied(obj) | Event::Deleted(obj) => queue.add(obj.key()),
                            Event::Restarted(objs) => {
                                let _ = ready_tx.send(true);
                                objs.iter().for_each(|obj| queue.add(obj.key()));
                            }
                        },
                        Ok(None) => {
                            debug!("definition watch stream completed");
                            break;
                        }
                        Err(err) => {
                            warn!(
                                error = err.to_string(),
                                "definition watch stream reported an error"
                            );
                        }
                    }
                }
            }
        });

        let timeout = self.context.config.controllers.cache_sync_timeout();
        if tokio::time::timeout(timeout, ready_rx.wait_for(|synced| *synced))
            .await
            .map(|result| result.is_err())
            .unwrap_or(true)
        {
            informer.abort();
            return Err(Error::CacheSync(
                "genericcontrollers".to_string(),
                informer::Error::CacheSync("genericcontrollers".to_string(), timeout),
            ));
        }

        let worker = tokio::spawn({
            let context = self.context.to_owned();
            let queue = self.queue.to_owned();

            async move {
                let mut controllers = ControllerMap::default();

                while let Some(key) = queue.get().await {
                    match reconcile_definition(&context, &store, &mut controllers, &key).await {
                        Ok(()) => queue.forget(&key),
                        Err(err) => {
                            error!(
                                controller = key,
                                error = err.to_string(),
                                "failed to reconcile definition"
                            );
                            queue.add_rate_limited(&key);
                        }
                    }

                    queue.done(&key);
                }

                controllers
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.informer = Some(informer);
        tasks.worker = Some(worker);

        info!("crd driven supervisor is running");
        Ok(())
    }

    /// stop the reconciliation worker first so no definition is processed
    /// anymore, then stop all watch controllers concurrently
    async fn stop(&self) {
        let (informer, worker) = {
            let mut tasks = self.tasks.lock().await;
            (tasks.informer.take(), tasks.worker.take())
        };

        self.queue.shutdown();

        if let Some(worker) = worker {
            if let Ok(controllers) = worker.await {
                controllers.shutdown().await;
            }
        }

        if let Some(informer) = informer {
            informer.abort();
        }

        info!("crd driven supervisor stopped");
    }
}

// -----------------------------------------------------------------------------
// helpers

/// align the watch controller registered under the given key with the
/// definition currently stored on the cluster
async fn reconcile_definition(
    context: &Context,
    store: &Store<GenericController>,
    controllers: &mut ControllerMap,
    key: &str,
) -> Result<(), Error> {
    let (namespace, name) = resource::split_key(key);
    let mut obj_ref = ObjectRef::<GenericController>::new(name);
    if let Some(namespace) = namespace {
        obj_ref = obj_ref.within(namespace);
    }

    let definition = match store.get(&obj_ref) {
        Some(definition) => (*definition).to_owned(),
        None => {
            if let Some(controller) = controllers.remove(key) {
                info!(controller = key, "definition deleted, stop watch controller");
                controller.stop().await;
            }

            return Ok(());
        }
    };

    if let Some(existing) = controllers.get(key) {
        if existing.definition().spec == definition.spec {
            return Ok(());
        }

        info!(controller = key, "definition changed, recreate watch controller");
        if let Some(existing) = controllers.remove(key) {
            existing.stop().await;
        }
    }

    let controller = WatchController::new(context.to_owned(), definition).await?;
    if let Err(err) = controller.start(context.config.controllers.workers).await {
        controller.stop().await;
        return Err(err);
    }

    controllers.insert(key.to_string(), controller);
    Ok(())
}
