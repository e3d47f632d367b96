//! # Informer module
//!
//! This module provide a factory lending shared, reference counted informers
//! over dynamically resolved resources, each informer maintains a local cache
//! of the watched objects and notifies registered event handlers.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, DynamicObject},
    runtime::{
        reflector,
        reflector::{store::Writer, ObjectRef, Store},
        watcher,
        watcher::Event,
        WatchStreamExt,
    },
    Client,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use crate::svc::k8s::registry::ResolvedResource;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("informer cache for resource '{0}' did not sync within {1:?}")]
    CacheSync(String, Duration),
}

// -----------------------------------------------------------------------------
// Event handler

/// callback invoked with every object seen by an informer, list restarts
/// replay the whole cache
pub type EventHandler = Box<dyn Fn(&DynamicObject) + Send + Sync>;

// -----------------------------------------------------------------------------
// SharedInformer structure

#[derive(Hash, PartialEq, Eq, Clone, Debug)]
struct InformerKey {
    api_version: String,
    plural: String,
    label_selector: Option<String>,
}

struct Handlers {
    entries: RwLock<Vec<EventHandler>>,
}

impl Handlers {
    fn notify(&self, obj: &DynamicObject) {
        if let Ok(entries) = self.entries.read() {
            entries.iter().for_each(|handler| handler(obj));
        }
    }
}

/// shared watch over a single resource type, holding a local cache and a set
/// of event handlers
pub struct SharedInformer {
    key: InformerKey,
    resource: ResolvedResource,
    store: Store<DynamicObject>,
    handlers: Arc<Handlers>,
    ready: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl SharedInformer {
    /// returns the read view over the informer cache
    pub fn store(&self) -> &Store<DynamicObject> {
        &self.store
    }

    /// returns the object with the given namespace and name from the cache
    pub fn lookup(&self, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let mut obj_ref =
            ObjectRef::<DynamicObject>::new_with(name, self.resource.api_resource.to_owned());

        if let Some(namespace) = namespace {
            obj_ref = obj_ref.within(namespace);
        }

        self.store.get(&obj_ref).map(|obj| (*obj).to_owned())
    }

    /// register a callback invoked for every event seen by the informer
    pub fn add_event_handler(&self, handler: EventHandler) {
        if let Ok(mut entries) = self.handlers.entries.write() {
            entries.push(handler);
        }
    }

    /// blocks until the informer performed its initial list, fails once the
    /// given deadline is exceeded
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<(), Error> {
        let mut ready = self.ready.to_owned();

        let result = match tokio::time::timeout(timeout, ready.wait_for(|synced| *synced)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(Error::CacheSync(
                self.resource.api_resource.plural.to_owned(),
                timeout,
            )),
        };
        result
    }
}

// -----------------------------------------------------------------------------
// SharedInformerFactory structure

struct Entry {
    informer: Arc<SharedInformer>,
    refs: usize,
}

/// lends shared informers keyed by resource type and label selector, the
/// underlying watch task is started on first use and stopped once the last
/// borrower released it
pub struct SharedInformerFactory {
    client: Client,
    informers: tokio::sync::Mutex<HashMap<InformerKey, Entry>>,
}

impl SharedInformerFactory {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            informers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// borrow the shared informer matching the given resource and label
    /// selector, starting it if needed
    pub async fn lend(
        &self,
        resource: &ResolvedResource,
        label_selector: Option<String>,
    ) -> Arc<SharedInformer> {
        let key = InformerKey {
            api_version: resource.api_resource.api_version.to_owned(),
            plural: resource.api_resource.plural.to_owned(),
            label_selector: label_selector.to_owned(),
        };

        let mut informers = self.informers.lock().await;
        if let Some(entry) = informers.get_mut(&key) {
            entry.refs += 1;
            return entry.informer.to_owned();
        }

        debug!(
            resource = key.plural,
            api_version = key.api_version,
            "start shared informer"
        );

        let informer = Arc::new(spawn(
            self.client.to_owned(),
            resource.to_owned(),
            key.to_owned(),
            label_selector,
        ));

        informers.insert(
            key,
            Entry {
                informer: informer.to_owned(),
                refs: 1,
            },
        );

        informer
    }

    /// release a previously lent informer, the watch task is stopped once no
    /// borrower remains
    pub async fn release(&self, informer: &Arc<SharedInformer>) {
        let mut informers = self.informers.lock().await;

        if let Some(entry) = informers.get_mut(&informer.key) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                debug!(resource = informer.key.plural, "stop shared informer");
                entry.informer.task.abort();
                informers.remove(&informer.key);
            }
        }
    }
}

// -----------------------------------------------------------------------------
// helpers

fn spawn(
    client: Client,
    resource: ResolvedResource,
    key: InformerKey,
    label_selector: Option<String>,
) -> SharedInformer {
    let writer = Writer::new(resource.api_resource.to_owned());
    let store = writer.as_reader();
    let handlers = Arc::new(Handlers {
        entries: RwLock::new(vec![]),
    });
    let (ready_tx, ready_rx) = watch::channel(false);

    let api: Api<DynamicObject> = Api::all_with(client, &resource.api_resource);
    let mut config = watcher::Config::default();
    if let Some(selector) = &label_selector {
        config = config.labels(selector);
    }

    let task = tokio::spawn({
        let handlers = handlers.to_owned();
        let plural = resource.api_resource.plural.to_owned();

        async move {
            let mut stream = reflector(writer, watcher(api, config).default_backoff()).boxed();

            loop {
                match stream.try_next().await {
                    Ok(Some(event)) => match &event {
                        Event::Applied(obj) | Event::Deleted(obj) => handlers.notify(obj),
                        Event::Restarted(objs) => {
                            let _ = ready_tx.send(true);
                            debug!(resource = plural, count = objs.len(), "replay listed objects");
                            objs.iter().for_each(|obj| handlers.notify(obj));
                        }
                    },
                    Ok(None) => {
                        debug!(resource = plural, "watch stream completed");
                        break;
                    }
                    Err(err) => {
                        warn!(
                            resource = plural,
                            error = err.to_string(),
                            "watch stream reported an error"
                        );
                    }
                }
            }
        }
    });

    SharedInformer {
        key,
        resource,
        store,
        handlers,
        ready: ready_rx,
        task,
    }
}
