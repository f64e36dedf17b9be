#[cfg(test)]
use mockall::automock;

mod facts;
mod os_release;
mod package_version;
mod plugin;
mod registry;
mod sbd_config;
mod sysctl;
mod systemd;
mod value;

use std::path::Path;
use std::sync::Arc;

pub(crate) use facts::*;
pub(crate) use os_release::OsReleaseGatherer;
pub(crate) use package_version::PackageVersionGatherer;
pub(crate) use plugin::{PluginError, PluginLoader};
pub(crate) use registry::{GatherersRegistry, GatherersRegistryBuilder};
pub(crate) use sbd_config::{load_sbd_config, SbdConfigGatherer};
pub(crate) use sysctl::SysctlGatherer;
pub(crate) use systemd::SystemdGatherer;
pub(crate) use value::*;

use crate::command::CommandExecutor;

pub const BUILTIN_GATHERER_VERSION: &str = "v1";

/// A named capability answering fact requests.
///
/// `gather` returns exactly one [`GatheredFact`] per request, in request
/// order. Per-request problems are carried in the fact; `Err` means the whole
/// capability failed and nothing in the batch could be answered.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Gatherer: Sync + Send {
    async fn gather(
        &self,
        fact_requests: Vec<FactRequest>,
    ) -> Result<Vec<GatheredFact>, FactGatheringError>;

    fn name(&self) -> String;

    fn is_alive(&self) -> bool {
        true
    }
}

/// Gathers every request independently through `gather_one`.
pub(crate) async fn gather_each<F, Fut>(fact_requests: Vec<FactRequest>, gather_one: F) -> Vec<GatheredFact>
where
    F: Fn(FactRequest) -> Fut,
    Fut: std::future::Future<Output = Result<FactValue, FactGatheringError>>,
{
    let mut facts = Vec::with_capacity(fact_requests.len());
    for request in fact_requests {
        let result = gather_one(request.clone()).await;
        if let Err(err) = &result {
            debug!("fact {} for check {} failed: {}", request.name, request.check_id, err);
        }
        facts.push(GatheredFact::from_result(&request, result));
    }
    facts
}

/// Registry builder preloaded with the built-in gatherers.
pub fn builtin_gatherers(executor: Arc<dyn CommandExecutor>) -> GatherersRegistryBuilder {
    let mut builder = GatherersRegistryBuilder::new();
    builder
        .add_gatherer(
            package_version::GATHERER_NAME,
            BUILTIN_GATHERER_VERSION,
            PackageVersionGatherer::new(executor.clone()),
        )
        .add_gatherer(
            systemd::GATHERER_NAME,
            BUILTIN_GATHERER_VERSION,
            SystemdGatherer::new(executor.clone()),
        )
        .add_gatherer(
            sysctl::GATHERER_NAME,
            BUILTIN_GATHERER_VERSION,
            SysctlGatherer::new(executor),
        )
        .add_gatherer(
            sbd_config::GATHERER_NAME,
            BUILTIN_GATHERER_VERSION,
            SbdConfigGatherer::new(Path::new(sbd_config::SBD_CONFIG_PATH)),
        )
        .add_gatherer(
            os_release::GATHERER_NAME,
            BUILTIN_GATHERER_VERSION,
            OsReleaseGatherer::new(Path::new(os_release::OS_RELEASE_PATH)),
        );
    builder
}

/// Parses `KEY=value` files such as `/etc/sysconfig/sbd` or
/// `/etc/os-release`. Comments, blank lines and surrounding quotes are dropped.
pub(crate) fn parse_key_value_file(content: &str) -> indexmap::IndexMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (key.trim().to_owned(), value.to_owned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value_file() {
        let content = r#"
# comment
SBD_DEVICE="/dev/vdc;/dev/vdd"
SBD_PACEMAKER=yes
SBD_WATCHDOG_TIMEOUT='5'
broken line
"#;

        let parsed = parse_key_value_file(content);

        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["SBD_DEVICE"], "/dev/vdc;/dev/vdd");
        assert_eq!(parsed["SBD_PACEMAKER"], "yes");
        assert_eq!(parsed["SBD_WATCHDOG_TIMEOUT"], "5");
    }

    #[tokio::test]
    async fn test_gather_each_keeps_one_fact_per_request() {
        let requests = vec![
            FactRequest {
                argument: "1".to_owned(),
                check_id: "c1".to_owned(),
                gatherer: "noop".to_owned(),
                name: "n1".to_owned(),
            },
            FactRequest {
                argument: String::new(),
                check_id: "c2".to_owned(),
                gatherer: "noop".to_owned(),
                name: "n2".to_owned(),
            },
        ];

        let facts = gather_each(requests, |request| async move {
            if request.argument.is_empty() {
                Err(FactGatheringError::undefined_configuration("missing argument"))
            } else {
                Ok(parse_string_to_value(&request.argument))
            }
        })
        .await;

        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].value, Some(FactValue::Int(1)));
        assert_eq!(facts[1].error.as_ref().unwrap().kind, UNDEFINED_CONFIGURATION);
    }
}
