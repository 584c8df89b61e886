//! HTTP transport for [`RemoteBackend`], speaking the tripsync server API.

use crate::{
    error::Result,
    remote::{CreateEntityRequest, ErrorBody, RemoteBackend, UpdateEntityRequest},
    EntityType, Error, RemoteEntity, Version,
};
use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use std::time::Duration;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// [`RemoteBackend`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpBackend {
    /// Create a backend for the server at `base_url` with a default client.
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Remote(e.to_string()))?;
        Self::with_client(base_url, http)
    }

    /// Create a backend reusing an existing client.
    pub fn with_client(base_url: &str, http: reqwest::Client) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| Error::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidUrl(base_url.to_string()));
        }
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// Base URL extended by `segments`, each percent-encoded as a single
    /// path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in the constructor: a base URL always has path segments.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn trip_entities_url(&self, trip_id: &str, entity_type: EntityType) -> Url {
        self.url(&["trips", trip_id, "entities", entity_type.as_str()])
    }

    fn entity_url(&self, entity_type: EntityType, entity_id: &str) -> Url {
        self.url(&["entities", entity_type.as_str(), entity_id])
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<Response> {
    request.send().await.map_err(|e| Error::Remote(e.to_string()))
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::Remote(format!("invalid response body: {e}")))
}

async fn error_for(
    response: Response,
    entity_type: EntityType,
    entity_id: &str,
    sent_version: Option<Version>,
) -> Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    map_status(status, &text, entity_type, entity_id, sent_version)
}

/// Map a non-success status and its body onto the engine's error taxonomy.
fn map_status(
    status: StatusCode,
    text: &str,
    entity_type: EntityType,
    entity_id: &str,
    sent_version: Option<Version>,
) -> Error {
    let body: Option<ErrorBody> = serde_json::from_str(text).ok();

    match status {
        StatusCode::CONFLICT => Error::VersionConflict {
            entity_type,
            entity_id: entity_id.to_string(),
            expected: sent_version.unwrap_or_default(),
            actual: body.and_then(|b| b.current_version),
        },
        StatusCode::NOT_FOUND => Error::EntityNotFound {
            entity_type,
            entity_id: entity_id.to_string(),
        },
        status if status.is_server_error() => Error::Remote(format!("server error {status}: {text}")),
        status => Error::Rejected {
            status: status.as_u16(),
            message: body.map(|b| b.error).unwrap_or_else(|| text.to_string()),
        },
    }
}

/// Whether a delete response means the entity no longer exists.
fn is_deleted(status: StatusCode) -> bool {
    // 404: already gone
    status.is_success() || status == StatusCode::NOT_FOUND
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn create(
        &self,
        entity_type: EntityType,
        trip_id: &str,
        payload: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> Result<RemoteEntity> {
        let url = self.trip_entities_url(trip_id, entity_type);
        tracing::debug!(url = %url, entity_type = %entity_type, trip_id, "Creating entity");

        let body = CreateEntityRequest {
            payload,
            idempotency_key: idempotency_key.map(str::to_string),
        };
        let response = send(self.http.post(url).json(&body)).await?;

        if response.status().is_success() {
            read_json(response).await
        } else {
            Err(error_for(response, entity_type, "", None).await)
        }
    }

    async fn update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
        version: Version,
    ) -> Result<RemoteEntity> {
        let url = self.entity_url(entity_type, entity_id);
        tracing::debug!(url = %url, version, "Updating entity");

        let body = UpdateEntityRequest { payload, version };
        let response = send(self.http.put(url).json(&body)).await?;

        if response.status().is_success() {
            read_json(response).await
        } else {
            Err(error_for(response, entity_type, entity_id, Some(version)).await)
        }
    }

    async fn delete(&self, entity_type: EntityType, entity_id: &str) -> Result<()> {
        let url = self.entity_url(entity_type, entity_id);
        tracing::debug!(url = %url, "Deleting entity");

        let response = send(self.http.delete(url)).await?;
        if is_deleted(response.status()) {
            Ok(())
        } else {
            Err(error_for(response, entity_type, entity_id, None).await)
        }
    }

    async fn fetch(&self, entity_type: EntityType, entity_id: &str) -> Result<RemoteEntity> {
        let url = self.entity_url(entity_type, entity_id);
        let response = send(self.http.get(url)).await?;

        if response.status().is_success() {
            read_json(response).await
        } else {
            Err(error_for(response, entity_type, entity_id, None).await)
        }
    }

    async fn list(&self, trip_id: &str, entity_type: EntityType) -> Result<Vec<RemoteEntity>> {
        let url = self.trip_entities_url(trip_id, entity_type);
        let response = send(self.http.get(url)).await?;

        if response.status().is_success() {
            read_json(response).await
        } else {
            Err(error_for(response, entity_type, "", None).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HttpBackend {
        HttpBackend::with_client("http://localhost:3000/", reqwest::Client::new()).unwrap()
    }

    #[test]
    fn urls() {
        let backend = backend();
        assert_eq!(backend.base_url(), "http://localhost:3000");
        assert_eq!(
            backend
                .trip_entities_url("trip-1", EntityType::CalendarEvent)
                .as_str(),
            "http://localhost:3000/trips/trip-1/entities/calendar_event"
        );
        assert_eq!(
            backend.entity_url(EntityType::Task, "srv-1").as_str(),
            "http://localhost:3000/entities/task/srv-1"
        );
    }

    #[test]
    fn url_segments_are_encoded() {
        let backend = backend();
        assert_eq!(
            backend.entity_url(EntityType::Task, "a/b?c#d").as_str(),
            "http://localhost:3000/entities/task/a%2Fb%3Fc%23d"
        );
        assert_eq!(
            backend
                .trip_entities_url("trip 1", EntityType::Task)
                .as_str(),
            "http://localhost:3000/trips/trip%201/entities/task"
        );
    }

    #[test]
    fn base_path_is_kept() {
        let backend =
            HttpBackend::with_client("https://api.example.com/v1", reqwest::Client::new()).unwrap();
        assert_eq!(
            backend.entity_url(EntityType::PollVote, "v-1").as_str(),
            "https://api.example.com/v1/entities/poll_vote/v-1"
        );
    }

    #[test]
    fn invalid_base_url() {
        let client = reqwest::Client::new();
        assert!(matches!(
            HttpBackend::with_client("not a url", client.clone()),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpBackend::with_client("mailto:ops@example.com", client),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn conflict_carries_server_version() {
        let err = map_status(
            StatusCode::CONFLICT,
            r#"{"error":"Version conflict","currentVersion":7}"#,
            EntityType::Task,
            "t-1",
            Some(5),
        );
        assert_eq!(
            err,
            Error::VersionConflict {
                entity_type: EntityType::Task,
                entity_id: "t-1".into(),
                expected: 5,
                actual: Some(7),
            }
        );
        assert!(err.is_version_conflict());

        let err = map_status(StatusCode::CONFLICT, "", EntityType::Task, "t-1", Some(5));
        assert!(matches!(err, Error::VersionConflict { actual: None, .. }));
    }

    #[test]
    fn not_found() {
        let err = map_status(
            StatusCode::NOT_FOUND,
            r#"{"error":"task not found: t-1"}"#,
            EntityType::Task,
            "t-1",
            None,
        );
        assert!(matches!(err, Error::EntityNotFound { ref entity_id, .. } if entity_id == "t-1"));
        assert!(!err.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let err = map_status(status, "", EntityType::ChatMessage, "m-1", None);
            assert!(err.is_transient(), "{status}: {err:?}");
        }
    }

    #[test]
    fn other_client_errors_are_rejected() {
        let err = map_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":"invalid task payload: missing field `title`"}"#,
            EntityType::Task,
            "",
            None,
        );
        assert_eq!(
            err,
            Error::Rejected {
                status: 422,
                message: "invalid task payload: missing field `title`".into(),
            }
        );
        assert!(!err.is_transient());

        let err = map_status(StatusCode::BAD_REQUEST, "plain text", EntityType::Task, "", None);
        assert_eq!(
            err,
            Error::Rejected {
                status: 400,
                message: "plain text".into(),
            }
        );
    }

    #[test]
    fn delete_treats_missing_as_done() {
        assert!(is_deleted(StatusCode::NO_CONTENT));
        assert!(is_deleted(StatusCode::OK));
        assert!(is_deleted(StatusCode::NOT_FOUND));
        assert!(!is_deleted(StatusCode::CONFLICT));
        assert!(!is_deleted(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        // Port 9 (discard) on localhost is essentially never served.
        let backend = HttpBackend::new("http://127.0.0.1:9").unwrap();
        let err = backend.fetch(EntityType::Task, "srv-1").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }
}
