use std::path::{Path, PathBuf};

use super::{
    get_value, parse_key_value_file, FactGatheringError, FactRequest, FactValue, GatheredFact,
    Gatherer,
};

pub const GATHERER_NAME: &str = "os_release";
pub const OS_RELEASE_PATH: &str = "/etc/os-release";

pub struct OsReleaseGatherer {
    path: PathBuf,
}

impl OsReleaseGatherer {
    pub fn new(path: &Path) -> OsReleaseGatherer {
        OsReleaseGatherer {
            path: path.to_owned(),
        }
    }

    fn load(&self) -> Result<FactValue, FactGatheringError> {
        let content = std::fs::read_to_string(&self.path).map_err(|err| {
            FactGatheringError::parse(format!("could not read {}: {}", self.path.display(), err))
        })?;

        // values stay strings, VERSION_ID="15.10" is not a number
        Ok(FactValue::Map(
            parse_key_value_file(&content)
                .into_iter()
                .map(|(key, value)| (key, FactValue::String(value)))
                .collect(),
        ))
    }
}

#[async_trait::async_trait]
impl Gatherer for OsReleaseGatherer {
    async fn gather(
        &self,
        fact_requests: Vec<FactRequest>,
    ) -> Result<Vec<GatheredFact>, FactGatheringError> {
        let os_release = self.load();

        Ok(fact_requests
            .iter()
            .map(|request| {
                let value = os_release
                    .as_ref()
                    .map_err(Clone::clone)
                    .and_then(|os_release| get_value(os_release, &request.argument).cloned());
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
    use crate::gatherers::VALUE_NOT_FOUND;

    #[tokio::test]
    async fn test_os_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("os-release");
        std::fs::write(
            &path,
            "NAME=\"SLES\"\nVERSION_ID=\"15.5\"\nID_LIKE=\"suse\"\n",
        )
        .unwrap();

        let gatherer = OsReleaseGatherer::new(&path);
        let requests = ["VERSION_ID", "PRETTY_NAME"]
            .iter()
            .map(|key| FactRequest {
                argument: key.to_string(),
                check_id: "check".to_owned(),
                gatherer: GATHERER_NAME.to_owned(),
                name: key.to_lowercase(),
            })
            .collect();

        let facts = gatherer.gather(requests).await.unwrap();

        assert_eq!(facts[0].value, Some(FactValue::from("15.5")));
        assert_eq!(facts[0].name, "version_id");
        assert_eq!(facts[1].error.as_ref().unwrap().kind, VALUE_NOT_FOUND);
    }
}
