use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CLOUD_EVENTS_SPEC_VERSION: &str = "1.0";
pub const EVENT_SOURCE: &str = "https://github.com/trento-project/agent";
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Error, Debug)]
pub enum EventError {
    #[error("malformed event envelope: {0}")]
    MalformedEnvelope(serde_json::Error),
    #[error("malformed {0} event data: {1}")]
    MalformedData(String, serde_json::Error),
    #[error("unsupported cloudevents spec version {0}")]
    UnsupportedSpecVersion(String),
    #[error("could not encode {0} event: {1}")]
    EncodingError(String, serde_json::Error),
}

/// CloudEvents 1.0 envelope in structured JSON mode. `expiration` is an
/// extension attribute; consumers drop events past it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CloudEvent {
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CloudEvent {
    pub fn new<T: Serialize>(event_type: &str, data: &T) -> Result<CloudEvent, EventError> {
        let data = serde_json::to_value(data)
            .map_err(|err| EventError::EncodingError(event_type.to_owned(), err))?;

        Ok(CloudEvent {
            specversion: CLOUD_EVENTS_SPEC_VERSION.to_owned(),
            id: Uuid::new_v4().to_string(),
            source: EVENT_SOURCE.to_owned(),
            event_type: event_type.to_owned(),
            time: Utc::now(),
            datacontenttype: Some(JSON_CONTENT_TYPE.to_owned()),
            expiration: None,
            data,
        })
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> CloudEvent {
        self.expiration = Some(expiration);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration, Some(expiration) if expiration <= now)
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        T::deserialize(&self.data)
            .map_err(|err| EventError::MalformedData(self.event_type.clone(), err))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|err| EventError::EncodingError(self.event_type.clone(), err))
    }
}

pub fn decode_event(raw_event: &[u8]) -> Result<CloudEvent, EventError> {
    let event: CloudEvent =
        serde_json::from_slice(raw_event).map_err(EventError::MalformedEnvelope)?;

    if event.specversion != CLOUD_EVENTS_SPEC_VERSION {
        return Err(EventError::UnsupportedSpecVersion(event.specversion));
    }

    Ok(event)
}

pub fn encode_event<T: Serialize>(event_type: &str, data: &T) -> Result<Vec<u8>, EventError> {
    CloudEvent::new(event_type, data)?.to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[derive(Deserialize, Serialize, Debug, PartialEq)]
    struct Payload {
        discovery_type: String,
    }

    #[test]
    fn test_encode_decode_envelope() {
        let payload = Payload {
            discovery_type: "host_discovery".to_owned(),
        };

        let raw = encode_event("Trento.Test", &payload).unwrap();
        let event = decode_event(&raw).unwrap();

        assert_eq!(event.event_type, "Trento.Test");
        assert_eq!(event.source, EVENT_SOURCE);
        assert_eq!(event.datacontenttype.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(event.data_as::<Payload>().unwrap(), payload);
        assert!(!event.is_expired(Utc::now()));
    }

    #[test]
    fn test_expiration() {
        let now = Utc::now();
        let event = CloudEvent::new("Trento.Test", &json!({}))
            .unwrap()
            .with_expiration(now - Duration::seconds(1));

        assert!(event.is_expired(now));
        assert!(!event
            .with_expiration(now + Duration::minutes(5))
            .is_expired(now));
    }

    #[test]
    fn test_decode_rejects_malformed_envelopes() {
        assert!(matches!(
            decode_event(b"not json"),
            Err(EventError::MalformedEnvelope(_))
        ));

        let wrong_version = json!({
            "specversion": "0.3",
            "id": "1",
            "source": "test",
            "type": "Trento.Test",
            "time": "2024-01-01T00:00:00Z",
            "data": {}
        });
        assert!(matches!(
            decode_event(wrong_version.to_string().as_bytes()),
            Err(EventError::UnsupportedSpecVersion(_))
        ));
    }

    #[test]
    fn test_data_mismatch() {
        let event = CloudEvent::new("Trento.Test", &json!({"other": 1})).unwrap();

        assert!(matches!(
            event.data_as::<Payload>(),
            Err(EventError::MalformedData(_, _))
        ));
    }
}
