//! # Config supervisor module
//!
//! This module provide the meta controller variant fed by static definitions
//! loaded from the filesystem or from a caller supplied function, definitions
//! do not change for the life of the process.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::svc::{
    controller::{watch::WatchController, ControllerMap, Error},
    crd::GenericController,
    k8s::Context,
};

// -----------------------------------------------------------------------------
// Source enumeration

/// caller supplied loader returning the full list of definitions
pub type DefinitionsFn = Box<dyn Fn() -> Result<Vec<GenericController>, Error> + Send + Sync>;

enum Source {
    Path(PathBuf),
    Func(DefinitionsFn),
}

// -----------------------------------------------------------------------------
// Supervisor structure

/// meta controller variant started from a static set of definitions, the
/// wait loop retries failed starts until every configured controller runs or
/// the deadline is exceeded
pub struct Supervisor {
    context: Context,
    source: Source,
    controllers: tokio::sync::Mutex<Option<ControllerMap>>,
}

impl Supervisor {
    /// a non empty path always takes precedence over a loader function
    pub fn new(
        context: Context,
        path: Option<PathBuf>,
        load: Option<DefinitionsFn>,
    ) -> Result<Self, Error> {
        let source = match (path, load) {
            (Some(path), _) => Source::Path(path),
            (None, Some(load)) => Source::Func(load),
            (None, None) => return Err(Error::MissingSource),
        };

        Ok(Self {
            context,
            source,
            controllers: tokio::sync::Mutex::new(None),
        })
    }

    fn load(&self) -> Result<Vec<GenericController>, Error> {
        let definitions = match &self.source {
            Source::Path(path) => load_from_path(path)?,
            Source::Func(load) => load()?,
        };

        Ok(dedupe(definitions))
    }
}

#[async_trait]
impl super::Supervisor for Supervisor {
    /// load the definitions once and run the wait loop until every watch
    /// controller is running, a deadline overrun is fatal for the process
    async fn start(&self) -> Result<(), Error> {
        let definitions = self.load()?;
        info!(count = definitions.len(), "loaded definitions");

        let interval = self.context.config.controllers.wait_interval();
        let timeout = self.context.config.controllers.wait_timeout();
        let deadline = Instant::now() + timeout;

        let mut controllers = self.controllers.lock().await;
        let map = controllers.get_or_insert_with(ControllerMap::default);

        loop {
            let mut pending = false;

            for definition in &definitions {
                let key = definition.key();
                if map.contains(&key) {
                    continue;
                }

                let started: Result<(), Error> = async {
                    let controller =
                        WatchController::new(self.context.to_owned(), definition.to_owned())
                            .await?;

                    if let Err(err) = controller
                        .start(self.context.config.controllers.workers)
                        .await
                    {
                        controller.stop().await;
                        return Err(err);
                    }

                    map.insert(key.to_owned(), controller);
                    Ok(())
                }
                .await;

                if let Err(err) = started {
                    warn!(
                        controller = key,
                        error = err.to_string(),
                        "could not start watch controller yet"
                    );
                    pending = true;
                }
            }

            if !pending {
                break;
            }

            if Instant::now() >= deadline {
                return Err(Error::StartDeadline(timeout));
            }

            tokio::time::sleep(interval).await;
        }

        info!(
            count = map.len(),
            "all configured watch controllers are running"
        );
        Ok(())
    }

    async fn stop(&self) {
        if let Some(controllers) = self.controllers.lock().await.take() {
            controllers.shutdown().await;
        }

        info!("config driven supervisor stopped");
    }
}

// -----------------------------------------------------------------------------
// helpers

/// later definitions sharing the key of an earlier one are skipped
fn dedupe(definitions: Vec<GenericController>) -> Vec<GenericController> {
    let mut seen = HashSet::new();
    let mut unique = vec![];

    for definition in definitions {
        let key = definition.key();

        if !seen.insert(key.to_owned()) {
            warn!(controller = key, "skip duplicate definition");
            continue;
        }

        unique.push(definition);
    }

    unique
}

/// read every yaml or json document found at the given path, a directory is
/// read as its sorted yaml and json files
pub fn load_from_path(path: &Path) -> Result<Vec<GenericController>, Error> {
    let metadata =
        fs::metadata(path).map_err(|err| Error::ReadDefinitions(path.to_path_buf(), err))?;

    let files = match metadata.is_dir() {
        false => vec![path.to_path_buf()],
        true => {
            let mut files = fs::read_dir(path)
                .map_err(|err| Error::ReadDefinitions(path.to_path_buf(), err))?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| {
                    matches!(
                        path.extension().and_then(|ext| ext.to_str()),
                        Some("yaml" | "yml" | "json")
                    )
                })
                .collect::<Vec<_>>();

            files.sort();
            files
        }
    };

    let mut definitions = vec![];
    for file in files {
        let text =
            fs::read_to_string(&file).map_err(|err| Error::ReadDefinitions(file.to_owned(), err))?;

        for document in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|err| Error::ParseDefinition(file.to_owned(), err))?;

            if value.is_null() {
                continue;
            }

            let definition: GenericController = serde_yaml::from_value(value)
                .map_err(|err| Error::ParseDefinition(file.to_owned(), err))?;

            if definition.metadata.name.is_none() {
                return Err(Error::AnonymousDefinition(file.to_owned()));
            }

            definitions.push(definition);
        }
    }

    Ok(definitions)
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DEFINITION: &str = r#"
apiVersion: metac.openebs.io/v1alpha1
kind: GenericController
metadata:
  name: thing-controller
  namespace: ns1
spec:
  watch:
    apiVersion: examples.metac.io/v1
    resource: things
  hooks:
    sync:
      webhook:
        url: http://hooks.svc/sync
"#;

    const OTHER: &str = r#"
apiVersion: metac.openebs.io/v1alpha1
kind: GenericController
metadata:
  name: other-controller
  namespace: ns1
spec:
  watch:
    apiVersion: v1
    resource: configmaps
  hooks:
    sync:
      webhook:
        url: http://hooks.svc/other
"#;

    #[test]
    fn single_file_with_multiple_documents() {
        let mut file = tempfile::Builder::new()
            .prefix("definitions")
            .tempfile()
            .expect("a temporary file");
        write!(file, "{}---{}", DEFINITION, OTHER).expect("definitions written");

        // the loader only considers yaml or json extensions on directories,
        // a plain file is read as is
        let definitions = load_from_path(file.path()).expect("two definitions");

        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0].key(), "ns1/thing-controller");
        assert_eq!(definitions[1].key(), "ns1/other-controller");
    }

    #[test]
    fn directory_reads_sorted_yaml_and_json_files() {
        let dir = tempfile::tempdir().expect("a temporary directory");

        fs::write(dir.path().join("b.yaml"), OTHER).expect("definition written");
        fs::write(dir.path().join("a.yaml"), DEFINITION).expect("definition written");
        fs::write(dir.path().join("ignored.txt"), "not a definition")
            .expect("ignored file written");

        let definitions = load_from_path(dir.path()).expect("two definitions");

        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0].key(), "ns1/thing-controller");
        assert_eq!(definitions[1].key(), "ns1/other-controller");
    }

    #[test]
    fn unnamed_definitions_are_rejected() {
        let dir = tempfile::tempdir().expect("a temporary directory");
        fs::write(
            dir.path().join("bad.yaml"),
            "apiVersion: metac.openebs.io/v1alpha1\nkind: GenericController\nmetadata: {}\nspec:\n  watch:\n    apiVersion: v1\n    resource: pods\n",
        )
        .expect("definition written");

        assert!(matches!(
            load_from_path(dir.path()),
            Err(Error::AnonymousDefinition(_))
        ));
    }

    #[test]
    fn duplicate_keys_keep_the_first_definition() {
        let first: GenericController = serde_yaml::from_str(DEFINITION).expect("a definition");
        let mut second = first.to_owned();
        second.spec.watch.resource = "services".to_string();
        let third: GenericController = serde_yaml::from_str(OTHER).expect("a definition");

        let unique = dedupe(vec![first, second, third]);

        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].spec.watch.resource, "things");
        assert_eq!(unique[1].key(), "ns1/other-controller");
    }
}
