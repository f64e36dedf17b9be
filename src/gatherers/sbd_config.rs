use std::path::{Path, PathBuf};

use super::{
    get_value, parse_key_value_file, parse_string_to_value, FactGatheringError, FactRequest,
    FactValue, GatheredFact, Gatherer,
};

pub const GATHERER_NAME: &str = "sbd_config";
pub const SBD_CONFIG_PATH: &str = "/etc/sysconfig/sbd";

/// Values from the SBD sysconfig file. An empty argument returns the whole
/// file as a map.
pub struct SbdConfigGatherer {
    config_path: PathBuf,
}

impl SbdConfigGatherer {
    pub fn new(config_path: &Path) -> SbdConfigGatherer {
        SbdConfigGatherer {
            config_path: config_path.to_owned(),
        }
    }
}

pub(crate) fn load_sbd_config(path: &Path) -> Result<FactValue, FactGatheringError> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        FactGatheringError::undefined_configuration(format!(
            "could not open sbd config file {}: {}",
            path.display(),
            err
        ))
    })?;

    Ok(FactValue::Map(
        parse_key_value_file(&content)
            .into_iter()
            .map(|(key, value)| (key, parse_string_to_value(&value)))
            .collect(),
    ))
}

#[async_trait::async_trait]
impl Gatherer for SbdConfigGatherer {
    async fn gather(
        &self,
        fact_requests: Vec<FactRequest>,
    ) -> Result<Vec<GatheredFact>, FactGatheringError> {
        let config = load_sbd_config(&self.config_path);

        Ok(fact_requests
            .iter()
            .map(|request| {
                let value = config
                    .as_ref()
                    .map_err(Clone::clone)
                    .and_then(|config| get_value(config, &request.argument).cloned());
                GatheredFact::from_result(request, value)
            })
            .collect())
    }

    fn name(&self) -> String {
        GATHERER_NAME.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatherers::{UNDEFINED_CONFIGURATION, VALUE_NOT_FOUND};
    use std::io::Write;

    fn request(argument: &str) -> FactRequest {
        FactRequest {
            argument: argument.to_owned(),
            check_id: "check".to_owned(),
            gatherer: GATHERER_NAME.to_owned(),
            name: format!("sbd_{}", argument),
        }
    }

    #[tokio::test]
    async fn test_sbd_config_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "SBD_DEVICE=\"/dev/vdc\"\nSBD_PACEMAKER=yes\nSBD_WATCHDOG_TIMEOUT=5").unwrap();

        let gatherer = SbdConfigGatherer::new(file.path());
        let facts = gatherer
            .gather(vec![
                request("SBD_DEVICE"),
                request("SBD_WATCHDOG_TIMEOUT"),
                request("SBD_STARTMODE"),
                request(""),
            ])
            .await
            .unwrap();

        assert_eq!(facts[0].value, Some(FactValue::from("/dev/vdc")));
        assert_eq!(facts[1].value, Some(FactValue::Int(5)));
        assert_eq!(facts[2].error.as_ref().unwrap().kind, VALUE_NOT_FOUND);
        match facts[3].value.as_ref().unwrap() {
            FactValue::Map(entries) => assert_eq!(entries.len(), 3),
            other => panic!("expected a map, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sbd_config_missing_file() {
        let gatherer = SbdConfigGatherer::new(Path::new("/nonexistent/sbd"));

        let facts = gatherer.gather(vec![request("SBD_DEVICE")]).await.unwrap();

        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].error.as_ref().unwrap().kind, UNDEFINED_CONFIGURATION);
    }
}
