use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub const API_KEY_HEADER: &str = "X-Trento-apiKey";

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("request to {0} failed: {1}")]
    RequestError(String, reqwest::Error),
    #[error("unexpected status {1} from {0}")]
    UnexpectedStatus(String, StatusCode),
}

/// The remote service receiving discovery payloads and heartbeats. No
/// retries here: the periodic loops try again on their next tick.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Collector: Send + Sync {
    async fn publish(
        &self,
        discovery_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), CollectorError>;

    async fn heartbeat(&self) -> Result<(), CollectorError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectorConfig {
    pub server_url: String,
    pub api_key: String,
    pub agent_id: String,
}

#[derive(Serialize)]
struct DiscoveredData<'a> {
    agent_id: &'a str,
    discovery_type: &'a str,
    payload: &'a serde_json::Value,
}

pub struct CollectorClient {
    config: CollectorConfig,
    http: reqwest::Client,
}

impl CollectorClient {
    /// `http` is shared by every publisher, its timeout bounds each call.
    pub fn new(config: CollectorConfig, http: reqwest::Client) -> CollectorClient {
        CollectorClient { config, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.server_url.trim_end_matches('/'), path)
    }
}

fn expect_status(
    url: String,
    response: Result<reqwest::Response, reqwest::Error>,
    expected: StatusCode,
) -> Result<(), CollectorError> {
    let response = response.map_err(|err| CollectorError::RequestError(url.clone(), err))?;

    if response.status() != expected {
        return Err(CollectorError::UnexpectedStatus(url, response.status()));
    }
    Ok(())
}

#[async_trait::async_trait]
impl Collector for CollectorClient {
    async fn publish(
        &self,
        discovery_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), CollectorError> {
        let url = self.url("/api/collect");
        let body = DiscoveredData {
            agent_id: &self.config.agent_id,
            discovery_type,
            payload: &payload,
        };

        debug!("publishing {} to {}", discovery_type, url);

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&body)
            .send()
            .await;

        expect_status(url, response, StatusCode::ACCEPTED)
    }

    async fn heartbeat(&self) -> Result<(), CollectorError> {
        let url = self.url(&format!("/api/hosts/{}/heartbeat", self.config.agent_id));

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .send()
            .await;

        expect_status(url, response, StatusCode::NO_CONTENT)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::stub_server;
    use super::*;
    use serde_json::json;

    fn client(server_url: &str) -> CollectorClient {
        CollectorClient::new(
            CollectorConfig {
                server_url: server_url.to_owned(),
                api_key: "k".to_owned(),
                agent_id: "AID".to_owned(),
            },
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn test_publish_posts_discovered_data() {
        let (url, mut requests) = stub_server(202).await;

        client(&url)
            .publish("ha_cluster_discovery", json!({"name": "hana", "id": "H"}))
            .await
            .unwrap();

        let request = requests.recv().await.unwrap();
        assert_eq!(request.request_line, "POST /api/collect HTTP/1.1");
        assert_eq!(request.header("x-trento-apikey"), Some("k"));
        assert_eq!(request.header("content-type"), Some("application/json"));

        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(
            body,
            json!({
                "agent_id": "AID",
                "discovery_type": "ha_cluster_discovery",
                "payload": {"name": "hana", "id": "H"}
            })
        );
    }

    #[tokio::test]
    async fn test_publish_requires_accepted() {
        let (url, _requests) = stub_server(200).await;

        let result = client(&url).publish("host_discovery", json!({})).await;

        assert!(matches!(
            result,
            Err(CollectorError::UnexpectedStatus(_, StatusCode::OK))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat() {
        let (url, mut requests) = stub_server(204).await;

        client(&format!("{}/", url)).heartbeat().await.unwrap();

        let request = requests.recv().await.unwrap();
        assert_eq!(request.request_line, "POST /api/hosts/AID/heartbeat HTTP/1.1");
        assert_eq!(request.header("x-trento-apikey"), Some("k"));
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_unexpected_status() {
        let (url, _requests) = stub_server(500).await;

        let result = client(&url).heartbeat().await;

        assert!(matches!(
            result,
            Err(CollectorError::UnexpectedStatus(_, StatusCode::INTERNAL_SERVER_ERROR))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let result = client("http://127.0.0.1:1").heartbeat().await;

        assert!(matches!(result, Err(CollectorError::RequestError(_, _))));
    }
}
