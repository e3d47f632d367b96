//! # Watch controller module
//!
//! This module provide the reconcile engine bound to a single definition, it
//! watches the declared resources, invokes the remote hooks with the observed
//! state and converges the cluster toward the desired state they return.

use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::FutureExt;
use kube::{
    api::{DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    Resource, ResourceExt,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::svc::{
    apply,
    controller::Error,
    crd::{self, GenericController, Hook, ResourceRule},
    k8s::{finalizer, informer::SharedInformer, queue::RateLimitingQueue, registry::ResolvedResource, resource, Context},
    webhook,
};

// -----------------------------------------------------------------------------
// Phase enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Phase {
    Constructed,
    Running,
    Stopping,
    Stopped,
}

// -----------------------------------------------------------------------------
// Target structure

/// one resolved resource declared by the definition together with its shared
/// informer
struct Target {
    rule: ResourceRule,
    resource: ResolvedResource,
    informer: Arc<SharedInformer>,
}

// -----------------------------------------------------------------------------
// Tasks structure

#[derive(Default)]
struct Tasks {
    workers: Vec<JoinHandle<()>>,
    resync: Option<JoinHandle<()>>,
}

// -----------------------------------------------------------------------------
// WatchController structure

/// reconcile engine bound to a single definition
pub struct WatchController {
    definition: GenericController,
    key: String,
    finalizer: String,
    last_applied_key: String,
    label_value: String,
    context: Context,
    watched: Target,
    attachments: Vec<Target>,
    queue: RateLimitingQueue,
    tasks: tokio::sync::Mutex<Tasks>,
    phase: Mutex<Phase>,
}

impl WatchController {
    /// resolve the declared resources and subscribe to their informers, the
    /// returned controller is constructed but does not process events yet
    pub async fn new(context: Context, definition: GenericController) -> Result<Arc<Self>, Error> {
        let key = definition.key();

        if definition.spec.hooks.sync.is_none() {
            return Err(Error::MissingSyncHook(key));
        }

        let watched_resource = context
            .registry
            .resolve(
                &definition.spec.watch.api_version,
                &definition.spec.watch.resource,
            )
            .await
            .map_err(|err| Error::Resolve(key.to_owned(), err))?;

        let watched_selector = definition
            .spec
            .watch
            .label_selector
            .as_ref()
            .and_then(|selector| selector.as_selector());

        let watched = Target {
            rule: definition.spec.watch.to_owned(),
            informer: context.informers.lend(&watched_resource, watched_selector).await,
            resource: watched_resource,
        };

        let mut attachments: Vec<Target> = vec![];
        for rule in &definition.spec.attachments {
            let resolved = match context
                .registry
                .resolve(&rule.api_version, &rule.resource)
                .await
            {
                Ok(resolved) => resolved,
                Err(err) => {
                    // release everything lent so far, the supervisor retries
                    // the construction with backoff
                    context.informers.release(&watched.informer).await;
                    for target in &attachments {
                        context.informers.release(&target.informer).await;
                    }

                    return Err(Error::Resolve(key, err));
                }
            };

            // attachment informers are scoped to the labels the definition
            // may own
            let mut parts = rule
                .label_selector
                .as_ref()
                .and_then(|selector| selector.as_selector())
                .into_iter()
                .collect::<Vec<_>>();

            if definition.spec.generate_selector {
                parts.push(format!(
                    "{}={}",
                    crd::CONTROLLER_LABEL,
                    definition.controller_label_value()
                ));
            }

            let selector = match parts.is_empty() {
                true => None,
                false => Some(parts.join(",")),
            };

            attachments.push(Target {
                rule: rule.to_owned(),
                informer: context.informers.lend(&resolved, selector).await,
                resource: resolved,
            });
        }

        let controller = Arc::new(Self {
            finalizer: definition.finalizer_name(),
            last_applied_key: definition.last_applied_key(),
            label_value: definition.controller_label_value(),
            key,
            definition,
            context,
            watched,
            attachments,
            queue: RateLimitingQueue::new(),
            tasks: tokio::sync::Mutex::new(Tasks::default()),
            phase: Mutex::new(Phase::Constructed),
        });

        controller.register_handlers();
        Ok(controller)
    }

    pub fn definition(&self) -> &GenericController {
        &self.definition
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn phase(&self) -> Phase {
        *self
            .phase
            .lock()
            .expect("watch controller phase lock to not be poisoned")
    }

    fn set_phase(&self, phase: Phase) {
        *self
            .phase
            .lock()
            .expect("watch controller phase lock to not be poisoned") = phase;
    }

    /// wire the informer events onto the work queue, watched events enqueue
    /// the object itself while attachment events enqueue their owner
    fn register_handlers(self: &Arc<Self>) {
        let queue = self.queue.to_owned();
        self.watched
            .informer
            .add_event_handler(Box::new(move |obj| {
                queue.add(resource::object_key(obj));
            }));

        for target in &self.attachments {
            let queue = self.queue.to_owned();
            let api_version = self.watched.resource.api_resource.api_version.to_owned();
            let kind = self.watched.resource.api_resource.kind.to_owned();
            let namespaced = self.watched.resource.namespaced;

            target.informer.add_event_handler(Box::new(move |obj| {
                for owner in obj.owner_references() {
                    if owner.api_version != api_version || owner.kind != kind {
                        continue;
                    }

                    let key = match namespaced {
                        true => format!("{}/{}", obj.namespace().unwrap_or_default(), owner.name),
                        false => format!("/{}", owner.name),
                    };

                    queue.add(key);
                }
            }));
        }
    }

    /// blocks until every informer cache listed once, seed the queue with
    /// the current watched objects and spawn the workers
    pub async fn start(self: &Arc<Self>, workers: usize) -> Result<(), Error> {
        let timeout = self.context.config.controllers.cache_sync_timeout();

        self.watched
            .informer
            .wait_for_sync(timeout)
            .await
            .map_err(|err| Error::CacheSync(self.key.to_owned(), err))?;

        for target in &self.attachments {
            target
                .informer
                .wait_for_sync(timeout)
                .await
                .map_err(|err| Error::CacheSync(self.key.to_owned(), err))?;
        }

        for obj in self.watched.informer.store().state() {
            self.queue.add(resource::object_key(obj.as_ref()));
        }

        let mut tasks = self.tasks.lock().await;
        for index in 0..workers.max(1) {
            let controller = self.to_owned();

            tasks.workers.push(tokio::spawn(async move {
                controller.worker(index).await;
            }));
        }

        if let Some(period) = self.definition.spec.resync_period_seconds.filter(|p| *p > 0) {
            let controller = self.to_owned();
            let period = Duration::from_secs(u64::from(period));

            tasks.resync = Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    for obj in controller.watched.informer.store().state() {
                        controller.queue.add(resource::object_key(obj.as_ref()));
                    }
                }
            }));
        }

        self.set_phase(Phase::Running);
        info!(
            controller = self.key,
            workers = workers.max(1),
            "watch controller is running"
        );

        Ok(())
    }

    /// drain the workers and release the informer subscriptions
    pub async fn stop(&self) {
        {
            let mut phase = self
                .phase
                .lock()
                .expect("watch controller phase lock to not be poisoned");

            if matches!(*phase, Phase::Stopping | Phase::Stopped) {
                return;
            }

            *phase = Phase::Stopping;
        }

        self.queue.shutdown();

        let (workers, resync) = {
            let mut tasks = self.tasks.lock().await;
            (std::mem::take(&mut tasks.workers), tasks.resync.take())
        };

        if let Some(resync) = resync {
            resync.abort();
        }

        // workers finish their in flight reconciliation before exiting
        for worker in workers {
            let _ = worker.await;
        }

        self.context.informers.release(&self.watched.informer).await;
        for target in &self.attachments {
            self.context.informers.release(&target.informer).await;
        }

        self.set_phase(Phase::Stopped);
        info!(controller = self.key, "watch controller stopped");
    }

    async fn worker(&self, index: usize) {
        debug!(controller = self.key, worker = index, "start worker");

        while let Some(key) = self.queue.get().await {
            match AssertUnwindSafe(self.reconcile(&key)).catch_unwind().await {
                Ok(Ok(requeue_after)) => {
                    self.queue.forget(&key);

                    #[cfg(feature = "metrics")]
                    super::RECONCILIATION_SUCCESS
                        .with_label_values(&[&self.key])
                        .inc();

                    if let Some(delay) = requeue_after {
                        self.queue.add_after(key.to_owned(), delay);
                    }
                }
                Ok(Err(err)) => {
                    error!(
                        controller = self.key,
                        key = key,
                        error = err.to_string(),
                        "failed to reconcile watched object"
                    );

                    #[cfg(feature = "metrics")]
                    super::RECONCILIATION_FAILED
                        .with_label_values(&[&self.key])
                        .inc();

                    self.queue.add_rate_limited(&key);
                }
                Err(_) => {
                    error!(
                        controller = self.key,
                        key = key,
                        "reconciliation panicked, the worker continues with the next key"
                    );

                    #[cfg(feature = "metrics")]
                    super::RECONCILIATION_FAILED
                        .with_label_values(&[&self.key])
                        .inc();

                    self.queue.add_rate_limited(&key);
                }
            }

            self.queue.done(&key);
        }

        debug!(controller = self.key, worker = index, "worker exits");
    }

    /// reconcile a single watched key, observe the current state, call the
    /// matching hook and converge the attachments toward the desired state
    async fn reconcile(&self, key: &str) -> Result<Option<Duration>, Error> {
        let (namespace, name) = resource::split_key(key);

        let watched = match self.watched.informer.lookup(namespace, name) {
            Some(watched) => watched,
            None => {
                // owned attachments are garbage collected through their
                // owner references
                debug!(controller = self.key, key = key, "watched object is gone");
                return Ok(None);
            }
        };

        if !self.watched.rule.matches(&watched) {
            return Ok(None);
        }

        let finalizing = resource::deleted(&watched);

        let watched = match !finalizing
            && self.definition.spec.hooks.finalize.is_some()
            && !finalizer::contains(&watched, &self.finalizer)
        {
            true => self.add_finalizer(&watched).await?,
            false => watched,
        };

        let observed = self.observed_attachments(&watched);
        let request = webhook::Request::new(
            self.definition.to_owned(),
            watched.to_owned(),
            &observed,
            finalizing,
        );

        let response = match finalizing {
            false => {
                let hook = self
                    .definition
                    .spec
                    .hooks
                    .sync
                    .as_ref()
                    .ok_or_else(|| Error::MissingSyncHook(self.key.to_owned()))?;

                self.call_hook("sync", hook, &request).await?
            }
            true => match &self.definition.spec.hooks.finalize {
                Some(hook) => self.call_hook("finalize", hook, &request).await?,
                None => {
                    if observed.is_empty() {
                        self.remove_finalizer(&watched).await?;
                        return Ok(None);
                    }

                    // without a finalize hook the desired set of a deleted
                    // watched object is empty
                    webhook::Response {
                        finalized: Some(true),
                        ..webhook::Response::default()
                    }
                }
            },
        };

        let webhook::Response {
            status,
            attachments,
            finalized,
            resync_after_seconds,
        } = response;

        let desired = self.desired_attachments(&watched, attachments)?;
        self.converge(&observed, &desired).await?;

        if finalizing {
            if finalized.unwrap_or(false) && desired.is_empty() {
                self.remove_finalizer(&watched).await?;
            }
        } else if let Some(status) = status {
            self.update_status(&watched, status).await?;
        }

        Ok(resync_after_seconds
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64))
    }

    async fn call_hook(
        &self,
        name: &str,
        hook: &Hook,
        request: &webhook::Request,
    ) -> Result<webhook::Response, Error> {
        debug!(
            controller = self.key,
            hook = name,
            url = hook.webhook.url,
            "invoke hook"
        );

        let result = self.context.hooks.call(&hook.webhook, request).await;

        #[cfg(feature = "metrics")]
        super::HOOK_REQUEST
            .with_label_values(&[
                &self.key,
                name,
                match &result {
                    Ok(_) => "success",
                    Err(_) => "failure",
                },
            ])
            .inc();

        result.map_err(Error::Hook)
    }

    /// returns the attachments owned by the definition and by the given
    /// watched object, the ownership is re-computed from the informer caches
    /// on every reconciliation
    fn observed_attachments(&self, watched: &DynamicObject) -> Vec<DynamicObject> {
        let uid = watched.uid();
        let mut observed = vec![];

        for target in &self.attachments {
            for obj in target.informer.store().state() {
                let obj = obj.as_ref();

                if !target.rule.matches(obj) {
                    continue;
                }

                if !self.controller_owned(obj) {
                    continue;
                }

                let owned = obj
                    .owner_references()
                    .iter()
                    .any(|owner| Some(owner.uid.as_str()) == uid.as_deref());

                if owned {
                    observed.push(obj.to_owned());
                }
            }
        }

        observed
    }

    fn controller_owned(&self, obj: &DynamicObject) -> bool {
        let labeled = self.definition.spec.generate_selector
            && obj.labels().get(crd::CONTROLLER_LABEL) == Some(&self.label_value);

        labeled || obj.annotations().contains_key(&self.last_applied_key)
    }

    /// validate and decorate the desired attachments returned by a hook,
    /// each one is stamped with the owner reference, the ownership label and
    /// the last applied annotation
    fn desired_attachments(
        &self,
        watched: &DynamicObject,
        attachments: Vec<DynamicObject>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let owner = resource::owner_reference(watched, &self.watched.resource.api_resource);
        let mut seen = HashSet::new();
        let mut desired = vec![];

        for mut obj in attachments {
            let types = obj
                .types
                .to_owned()
                .ok_or_else(|| Error::UntypedAttachment(self.key.to_owned()))?;

            let target = self
                .attachments
                .iter()
                .find(|target| {
                    target.resource.api_resource.api_version == types.api_version
                        && target.resource.api_resource.kind == types.kind
                })
                .ok_or_else(|| {
                    Error::UndeclaredAttachment(
                        self.key.to_owned(),
                        format!("{}/{}", types.api_version, types.kind),
                    )
                })?;

            if obj.metadata.name.is_none() {
                return Err(Error::UnnamedAttachment(self.key.to_owned()));
            }

            if target.resource.namespaced && obj.metadata.namespace.is_none() {
                obj.metadata.namespace = watched.namespace();
            }

            let identity = identity(&obj);
            if !seen.insert(identity) {
                warn!(
                    controller = self.key,
                    name = obj.name_any(),
                    "skip duplicate desired attachment"
                );
                continue;
            }

            if let Some(owner) = &owner {
                let refs = obj.meta_mut().owner_references.get_or_insert_with(Vec::new);
                if !refs.iter().any(|existing| existing.uid == owner.uid) {
                    refs.push(owner.to_owned());
                }
            }

            if self.definition.spec.generate_selector {
                obj.labels_mut()
                    .insert(crd::CONTROLLER_LABEL.to_string(), self.label_value.to_owned());
            }

            apply::set_last_applied(&mut obj, &self.last_applied_key).map_err(Error::Serialize)?;
            desired.push(obj);
        }

        Ok(desired)
    }

    /// converge the observed attachments toward the desired set, deletes run
    /// first to free names, failures are collected and the first one is
    /// returned once every operation was attempted
    async fn converge(
        &self,
        observed: &[DynamicObject],
        desired: &[DynamicObject],
    ) -> Result<(), Error> {
        let (deletes, creates, updates) = plan(observed, desired);
        let mut errors = vec![];

        for obj in deletes {
            let target = match self.target_for(obj) {
                Some(target) => target,
                None => continue,
            };

            info!(
                controller = self.key,
                kind = target.resource.api_resource.kind,
                name = obj.name_any(),
                "delete attachment"
            );

            let namespace = obj.namespace();
            let api = target
                .resource
                .api(self.context.kube.to_owned(), namespace.as_deref());

            match api.delete(&obj.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(err) if resource::is_status(&err, 404) => {}
                Err(err) => {
                    error!(
                        controller = self.key,
                        name = obj.name_any(),
                        error = err.to_string(),
                        "failed to delete attachment"
                    );
                    errors.push(Error::KubeClient(err));
                }
            }
        }

        for obj in creates {
            let target = match self.target_for(obj) {
                Some(target) => target,
                None => continue,
            };

            info!(
                controller = self.key,
                kind = target.resource.api_resource.kind,
                name = obj.name_any(),
                "create attachment"
            );

            let namespace = obj.namespace();
            let api = target
                .resource
                .api(self.context.kube.to_owned(), namespace.as_deref());

            if let Err(err) = api.create(&PostParams::default(), obj).await {
                error!(
                    controller = self.key,
                    name = obj.name_any(),
                    error = err.to_string(),
                    "failed to create attachment"
                );
                errors.push(Error::KubeClient(err));
            }
        }

        for (live, obj) in updates {
            if let Err(err) = self.update_attachment(live, obj).await {
                error!(
                    controller = self.key,
                    name = obj.name_any(),
                    error = err.to_string(),
                    "failed to update attachment"
                );
                errors.push(err);
            }
        }

        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// three way merge of the live attachment and the desired one, the
    /// cluster is only written when the merged object differs from the live
    /// one
    async fn update_attachment(
        &self,
        live: &DynamicObject,
        desired: &DynamicObject,
    ) -> Result<(), Error> {
        let target = match self.target_for(desired) {
            Some(target) => target,
            None => return Ok(()),
        };

        let last = apply::get_last_applied(live, &self.last_applied_key).unwrap_or(Value::Null);
        let live_value = serde_json::to_value(live).map_err(Error::Serialize)?;
        let desired_value = serde_json::to_value(desired).map_err(Error::Serialize)?;

        let merged = apply::merge(&last, &live_value, &desired_value);
        if apply::is_same(&live_value, &merged) {
            return Ok(());
        }

        let mut merged: DynamicObject = serde_json::from_value(merged).map_err(Error::Serialize)?;
        // optimistic concurrency, a conflict surfaces as a retriable error
        merged.metadata.resource_version = live.resource_version();

        info!(
            controller = self.key,
            kind = target.resource.api_resource.kind,
            name = live.name_any(),
            "update attachment"
        );

        let namespace = live.namespace();
        let api = target
            .resource
            .api(self.context.kube.to_owned(), namespace.as_deref());

        api.replace(&live.name_any(), &PostParams::default(), &merged)
            .await
            .map_err(Error::KubeClient)?;

        Ok(())
    }

    fn target_for(&self, obj: &DynamicObject) -> Option<&Target> {
        let types = obj.types.as_ref()?;

        self.attachments.iter().find(|target| {
            target.resource.api_resource.api_version == types.api_version
                && target.resource.api_resource.kind == types.kind
        })
    }

    async fn add_finalizer(&self, watched: &DynamicObject) -> Result<DynamicObject, Error> {
        info!(
            controller = self.key,
            name = watched.name_any(),
            finalizer = self.finalizer,
            "set finalizer on watched object"
        );

        let modified = finalizer::add(watched.to_owned(), &self.finalizer);
        let patch = resource::diff(watched, &modified).map_err(Error::Serialize)?;

        let namespace = watched.namespace();
        let api = self
            .watched
            .resource
            .api(self.context.kube.to_owned(), namespace.as_deref());

        resource::patch(&api, &modified, patch)
            .await
            .map_err(Error::KubeClient)
    }

    async fn remove_finalizer(&self, watched: &DynamicObject) -> Result<(), Error> {
        if !finalizer::contains(watched, &self.finalizer) {
            return Ok(());
        }

        info!(
            controller = self.key,
            name = watched.name_any(),
            finalizer = self.finalizer,
            "remove finalizer from watched object"
        );

        let modified = finalizer::remove(watched.to_owned(), &self.finalizer);
        let patch = resource::diff(watched, &modified).map_err(Error::Serialize)?;

        let namespace = watched.namespace();
        let api = self
            .watched
            .resource
            .api(self.context.kube.to_owned(), namespace.as_deref());

        match resource::patch(&api, &modified, patch).await {
            Ok(_) => Ok(()),
            // the object vanished meanwhile, nothing left to release
            Err(err) if resource::is_status(&err, 404) => Ok(()),
            Err(err) => Err(Error::KubeClient(err)),
        }
    }

    /// patch the status reported by the sync hook onto the watched object,
    /// an unchanged status performs no write
    async fn update_status(&self, watched: &DynamicObject, status: Value) -> Result<(), Error> {
        if watched.data.get("status") == Some(&status) {
            return Ok(());
        }

        info!(
            controller = self.key,
            name = watched.name_any(),
            "update status of watched object"
        );

        let name = watched.name_any();
        let namespace = watched.namespace();
        let api = self
            .watched
            .resource
            .api(self.context.kube.to_owned(), namespace.as_deref());

        let patch = serde_json::json!({ "status": status });
        let result = match self.watched.resource.has_status {
            true => {
                api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
            }
            false => {
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
            }
        };

        result.map(|_| ()).map_err(Error::KubeClient)
    }
}

// -----------------------------------------------------------------------------
// helpers

type Identity = (String, String, Option<String>, String);

fn identity(obj: &DynamicObject) -> Identity {
    let (api_version, kind) = obj
        .types
        .as_ref()
        .map(|types| (types.api_version.to_owned(), types.kind.to_owned()))
        .unwrap_or_default();

    (api_version, kind, obj.namespace(), obj.name_any())
}

/// split the observed and desired sets into the operations converging one
/// toward the other, deletes come first, then creates, then updates
#[allow(clippy::type_complexity)]
fn plan<'a>(
    observed: &'a [DynamicObject],
    desired: &'a [DynamicObject],
) -> (
    Vec<&'a DynamicObject>,
    Vec<&'a DynamicObject>,
    Vec<(&'a DynamicObject, &'a DynamicObject)>,
) {
    let observed_index: HashMap<Identity, &DynamicObject> =
        observed.iter().map(|obj| (identity(obj), obj)).collect();
    let desired_index: HashMap<Identity, &DynamicObject> =
        desired.iter().map(|obj| (identity(obj), obj)).collect();

    let deletes = observed
        .iter()
        .filter(|obj| !desired_index.contains_key(&identity(obj)))
        .collect();

    let creates = desired
        .iter()
        .filter(|obj| !observed_index.contains_key(&identity(obj)))
        .collect();

    let updates = desired
        .iter()
        .filter_map(|obj| {
            observed_index
                .get(&identity(obj))
                .map(|live| (*live, obj))
        })
        .collect();

    (deletes, creates, updates)
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ObjectMeta, TypeMeta};

    fn pod(name: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
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

    fn config_map(name: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                ..ObjectMeta::default()
            },
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn empty_desired_set_deletes_every_observed_attachment() {
        let observed = vec![pod("t1-pod"), pod("t1-sidecar"), config_map("t1-env")];

        let (deletes, creates, updates) = plan(&observed, &[]);

        assert_eq!(deletes.len(), 3);
        assert!(creates.is_empty());
        assert!(updates.is_empty());
    }

    #[test]
    fn new_desired_attachments_are_created() {
        let desired = vec![pod("t1-pod")];

        let (deletes, creates, updates) = plan(&[], &desired);

        assert!(deletes.is_empty());
        assert_eq!(creates.len(), 1);
        assert!(updates.is_empty());
    }

    #[test]
    fn stable_sets_produce_updates_only() {
        let observed = vec![pod("t1-pod")];
        let desired = vec![pod("t1-pod")];

        let (deletes, creates, updates) = plan(&observed, &desired);

        assert!(deletes.is_empty());
        assert!(creates.is_empty());
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn identity_distinguishes_kinds_sharing_a_name() {
        let observed = vec![pod("t1-res"), config_map("t1-res")];
        let desired = vec![pod("t1-res")];

        let (deletes, creates, updates) = plan(&observed, &desired);

        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].types.as_ref().map(|t| t.kind.as_str()), Some("ConfigMap"));
        assert!(creates.is_empty());
        assert_eq!(updates.len(), 1);
    }
}
