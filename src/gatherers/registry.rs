use super::Gatherer;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RegistryErrors {
    #[error("gatherer `{0}` not found")]
    GathererNotFoundError(String),
    #[error("could not extract the gatherer version from {0}, version should follow <gathererName>@<version> syntax")]
    GathererNameAndVersionError(String),
}

type VersionedGatherers = HashMap<String, Arc<dyn Gatherer>>;

/// Gatherers by name and version. Read-mostly: it only changes when a plugin
/// is registered at startup or ejected after its process died.
pub struct GatherersRegistry {
    gatherers: RwLock<HashMap<String, VersionedGatherers>>,
}

impl GatherersRegistry {
    /// Looks up `name` or `name@version`. Dead gatherers met on the way are
    /// ejected; a bare name falls back to the next highest live version.
    pub fn get_gatherer(&self, name: &str) -> Result<Arc<dyn Gatherer>, RegistryErrors> {
        let (gatherer_name, version) = extract_version_and_gatherer_name(name)?;

        loop {
            let (gatherer, found_version) = self
                .lookup(&gatherer_name, version.as_deref())
                .ok_or_else(|| RegistryErrors::GathererNotFoundError(name.to_owned()))?;

            if gatherer.is_alive() {
                return Ok(gatherer);
            }

            warn!("gatherer {}@{} is dead, removing it", gatherer_name, found_version);
            self.remove_version(&gatherer_name, &found_version);

            if version.is_some() {
                return Err(RegistryErrors::GathererNotFoundError(name.to_owned()));
            }
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Gatherer>> {
        self.get_gatherer(name).ok()
    }

    /// Adds a gatherer, replacing any previous entry with the same name and
    /// version.
    pub fn register(&self, name: &str, version: &str, gatherer: Arc<dyn Gatherer>) {
        let mut gatherers = self.gatherers.write();
        if let Some(previous) = gatherers
            .entry(name.to_owned())
            .or_default()
            .insert(version.to_owned(), gatherer)
        {
            info!("gatherer {}@{} ({}) overridden", name, version, previous.name());
        }
    }

    /// Removes every version of `name`, returns whether anything was removed.
    pub fn deregister(&self, name: &str) -> bool {
        self.gatherers.write().remove(name).is_some()
    }

    pub fn inspect_gatherers(&self) -> Vec<String> {
        let gatherers = self.gatherers.read();
        let mut gatherers_list: Vec<String> = vec![];
        for (gatherer_name, versions) in gatherers.iter() {
            let mut sorted_versions: Vec<String> = versions.keys().cloned().collect();
            sorted_versions.sort_by(|a, b| compare_versions(a, b));

            gatherers_list.push(format!("{} - {}", gatherer_name, sorted_versions.join("/")));
        }
        gatherers_list.sort();

        gatherers_list
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.gatherers.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str, version: Option<&str>) -> Option<(Arc<dyn Gatherer>, String)> {
        let gatherers = self.gatherers.read();
        let versioned_gatherers = gatherers.get(name)?;

        let version = match version {
            Some(version) => version.to_owned(),
            None => latest_version(versioned_gatherers)?,
        };

        versioned_gatherers
            .get(&version)
            .map(|gatherer| (gatherer.clone(), version))
    }

    fn remove_version(&self, name: &str, version: &str) {
        let mut gatherers = self.gatherers.write();
        if let Some(versioned_gatherers) = gatherers.get_mut(name) {
            versioned_gatherers.remove(version);
            if versioned_gatherers.is_empty() {
                gatherers.remove(name);
            }
        }
    }
}

fn latest_version(versioned_gatherers: &VersionedGatherers) -> Option<String> {
    versioned_gatherers
        .keys()
        .max_by(|a, b| compare_versions(a, b))
        .cloned()
}

/// Orders `v2` before `v10`; falls back to plain string order.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let numeric = |v: &str| v.trim_start_matches('v').parse::<u64>().ok();
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn extract_version_and_gatherer_name(
    gatherer_name: &str,
) -> Result<(String, Option<String>), RegistryErrors> {
    let parts: Vec<&str> = gatherer_name.split('@').collect();

    if parts.len() == 1 {
        return Ok((parts[0].to_owned(), None));
    }
    if parts.len() != 2 {
        return Err(RegistryErrors::GathererNameAndVersionError(
            gatherer_name.to_owned(),
        ));
    }
    Ok((parts[0].to_owned(), Some(parts[1].to_owned())))
}

pub struct GatherersRegistryBuilder {
    gatherers: Vec<(String, String, Arc<dyn Gatherer>)>,
}

impl GatherersRegistryBuilder {
    pub fn new() -> GatherersRegistryBuilder {
        GatherersRegistryBuilder {
            gatherers: Vec::new(),
        }
    }

    pub fn add_gatherer(
        &mut self,
        name: &str,
        version: &str,
        gatherer: impl Gatherer + 'static,
    ) -> &mut GatherersRegistryBuilder {
        self.gatherers
            .push((name.to_owned(), version.to_owned(), Arc::new(gatherer)));

        self
    }

    pub fn build_registry(self) -> GatherersRegistry {
        let mut gatherers_map: HashMap<String, VersionedGatherers> = HashMap::new();

        for (name, version, gatherer) in self.gatherers {
            gatherers_map
                .entry(name)
                .or_default()
                .insert(version, gatherer);
        }

        GatherersRegistry {
            gatherers: RwLock::new(gatherers_map),
        }
    }
}

impl Default for GatherersRegistryBuilder {
    fn default() -> Self {
        GatherersRegistryBuilder::new()
    }
}
