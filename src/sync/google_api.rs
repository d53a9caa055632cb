use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

use crate::calendar::{RemoteEvent, TimeWindow};
use crate::sync::batch::{
    self, BatchPart, BatchResults, MAX_BATCH_SIZE, ResponsePart, interpret_create,
    interpret_delete,
};
use crate::sync::google_auth::{AuthError, TokenSource};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";
const DEFAULT_BATCH_URL: &str = "https://www.googleapis.com/batch/calendar/v3";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Request failed with status {status}: {message}")]
    RequestError { status: u16, message: String },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rate limit exceeded (status {status}): {message}")]
    RateLimited { status: u16, message: String },
    #[error("Authentication failed")]
    AuthenticationFailed,
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

fn mentions_rate_limit(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    ["ratelimitexceeded", "rate limit", "quota", "too many requests"]
        .iter()
        .any(|marker| lowered.contains(marker))
}

impl ApiError {
    pub fn from_status(status: u16, message: &str) -> Self {
        match status {
            401 => ApiError::AuthenticationFailed,
            404 | 410 => ApiError::NotFound(message.to_string()),
            403 | 429 => ApiError::RateLimited {
                status,
                message: message.to_string(),
            },
            _ if mentions_rate_limit(message) => ApiError::RateLimited {
                status,
                message: message.to_string(),
            },
            _ => ApiError::RequestError {
                status,
                message: message.to_string(),
            },
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Failures no retry inside the pass can fix.
    pub fn is_authentication(&self) -> bool {
        matches!(self, ApiError::AuthenticationFailed | ApiError::AuthError(_))
    }

    /// Copy of this error for attaching to every item of a failed batch.
    /// Wrapped transport and auth errors keep only their message.
    pub fn replicate(&self) -> ApiError {
        match self {
            ApiError::RequestError { status, message } => ApiError::RequestError {
                status: *status,
                message: message.clone(),
            },
            ApiError::RateLimited { status, message } => ApiError::RateLimited {
                status: *status,
                message: message.clone(),
            },
            ApiError::NotFound(message) => ApiError::NotFound(message.clone()),
            ApiError::AuthenticationFailed => ApiError::AuthenticationFailed,
            ApiError::ParseError(message) => ApiError::ParseError(message.clone()),
            ApiError::InvalidArgument(message) => ApiError::InvalidArgument(message.clone()),
            ApiError::HttpError(e) => ApiError::RequestError {
                status: e.status().map(|status| status.as_u16()).unwrap_or(0),
                message: e.to_string(),
            },
            ApiError::AuthError(e) => ApiError::RequestError {
                status: 401,
                message: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListResponse {
    items: Option<Vec<RemoteEvent>>,
    next_page_token: Option<String>,
}

#[async_trait]
pub trait CalendarApi: Send + Sync {
    async fn create_event(&self, event: &RemoteEvent) -> Result<String, ApiError>;

    async fn update_event(&self, remote_id: &str, event: &RemoteEvent) -> Result<(), ApiError>;

    async fn delete_event(&self, remote_id: &str) -> Result<(), ApiError>;

    async fn list_events(&self, window: &TimeWindow) -> Result<Vec<RemoteEvent>, ApiError>;

    async fn batch_create(&self, events: &[RemoteEvent]) -> Result<BatchResults<String>, ApiError>;

    async fn batch_delete(&self, remote_ids: &[String]) -> Result<BatchResults<()>, ApiError>;
}

/// Google Calendar v3 client bound to one target calendar.
pub struct GoogleCalendarClient {
    base_url: String,
    batch_url: String,
    calendar_id: String,
    tokens: Arc<dyn TokenSource>,
    client: reqwest::Client,
}

impl GoogleCalendarClient {
    pub fn new(tokens: Arc<dyn TokenSource>, calendar_id: String) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            batch_url: DEFAULT_BATCH_URL.to_string(),
            calendar_id,
            tokens,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_batch_url(mut self, batch_url: String) -> Self {
        self.batch_url = batch_url;
        self
    }

    fn events_url(&self) -> String {
        format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(&self.calendar_id)
        )
    }

    fn event_url(&self, remote_id: &str) -> String {
        format!("{}/{}", self.events_url(), urlencoding::encode(remote_id))
    }

    /// Path of the events collection as seen from the batch endpoint's host.
    fn events_path(&self) -> String {
        let prefix = url::Url::parse(&self.base_url)
            .map(|url| url.path().trim_end_matches('/').to_string())
            .unwrap_or_default();
        format!(
            "{}/calendars/{}/events",
            prefix,
            urlencoding::encode(&self.calendar_id)
        )
    }

    async fn error_for(response: reqwest::Response) -> ApiError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ApiError::from_status(status, &body)
    }

    async fn send_batch(&self, parts: &[BatchPart]) -> Result<Vec<ResponsePart>, ApiError> {
        let token = self.tokens.bearer_token().await?;
        let boundary = batch::new_boundary();
        let body = batch::encode_batch(&boundary, parts);

        tracing::debug!("POST {} with {} parts", self.batch_url, parts.len());

        let response = self
            .client
            .post(&self.batch_url)
            .bearer_auth(token)
            .header(
                CONTENT_TYPE,
                format!("multipart/mixed; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await?;

        let status = response.status();
        tracing::info!("Batch response status: {}", status);

        if !status.is_success() {
            let error = Self::error_for(response).await;
            tracing::error!("Batch request failed: {}", error);
            return Err(error);
        }

        let response_boundary = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(batch::boundary_from_content_type)
            .ok_or_else(|| ApiError::ParseError("batch response without boundary".to_string()))?;
        let text = response.text().await?;

        Ok(batch::parse_multipart(&text, &response_boundary))
    }

    fn check_batch_size(len: usize) -> Result<(), ApiError> {
        if len > MAX_BATCH_SIZE {
            return Err(ApiError::InvalidArgument(format!(
                "batch of {} items exceeds the limit of {}",
                len, MAX_BATCH_SIZE
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CalendarApi for GoogleCalendarClient {
    async fn create_event(&self, event: &RemoteEvent) -> Result<String, ApiError> {
        let token = self.tokens.bearer_token().await?;
        let url = self.events_url();

        tracing::info!("Creating event: {:?}", event.summary);
        tracing::debug!("POST {} with payload: {:?}", url, event);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(event)
            .send()
            .await?;

        let status = response.status();
        tracing::info!("Create event response status: {}", status);

        if !status.is_success() {
            return Err(Self::error_for(response).await);
        }

        let created: RemoteEvent = response.json().await?;
        created
            .id
            .ok_or_else(|| ApiError::ParseError("create response without id".to_string()))
    }

    async fn update_event(&self, remote_id: &str, event: &RemoteEvent) -> Result<(), ApiError> {
        let token = self.tokens.bearer_token().await?;
        let url = self.event_url(remote_id);

        tracing::info!("Updating event {}: {:?}", remote_id, event.summary);
        tracing::debug!("PUT {} with payload: {:?}", url, event);

        let response = self
            .client
            .put(&url)
            .bearer_auth(token)
            .json(event)
            .send()
            .await?;

        let status = response.status();
        tracing::info!("Update event response status: {}", status);

        if !status.is_success() {
            let error = Self::error_for(response).await;
            tracing::error!("Failed to update event {}: {}", remote_id, error);
            return Err(error);
        }

        Ok(())
    }

    async fn delete_event(&self, remote_id: &str) -> Result<(), ApiError> {
        let token = self.tokens.bearer_token().await?;
        let url = self.event_url(remote_id);

        let response = self.client.delete(&url).bearer_auth(token).send().await?;

        if response.status().is_success() {
            return Ok(());
        }

        match Self::error_for(response).await {
            ApiError::NotFound(_) => {
                tracing::debug!("Event {} already gone", remote_id);
                Ok(())
            }
            error => Err(error),
        }
    }

    async fn list_events(&self, window: &TimeWindow) -> Result<Vec<RemoteEvent>, ApiError> {
        let url = self.events_url();
        let time_min = window.start.to_rfc3339();
        let time_max = window.end.to_rfc3339();
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        tracing::info!("Listing events from {} to {}", window.start, window.end);

        loop {
            let token = self.tokens.bearer_token().await?;
            let mut query = vec![
                ("timeMin", time_min.clone()),
                ("timeMax", time_max.clone()),
                ("singleEvents", "true".to_string()),
                ("maxResults", "2500".to_string()),
            ];
            if let Some(page) = &page_token {
                query.push(("pageToken", page.clone()));
            }

            let response = self
                .client
                .get(&url)
                .bearer_auth(token)
                .query(&query)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(Self::error_for(response).await);
            }

            let page: EventListResponse = response.json().await?;
            events.extend(page.items.unwrap_or_default());

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        tracing::info!("Listed {} events", events.len());
        Ok(events)
    }

    async fn batch_create(&self, events: &[RemoteEvent]) -> Result<BatchResults<String>, ApiError> {
        Self::check_batch_size(events.len())?;
        if events.is_empty() {
            return Ok(BatchResults::default());
        }

        let path = self.events_path();
        let parts = events
            .iter()
            .map(|event| Ok(BatchPart::post(path.clone(), serde_json::to_string(event)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()
            .map_err(|e| ApiError::ParseError(e.to_string()))?;

        let responses = self.send_batch(&parts).await?;
        let results = batch::correlate(&responses, events.len(), interpret_create);

        tracing::info!(
            "Batch create: {} succeeded, {} failed",
            results.successes.len(),
            results.failures.len()
        );
        Ok(results)
    }

    async fn batch_delete(&self, remote_ids: &[String]) -> Result<BatchResults<()>, ApiError> {
        Self::check_batch_size(remote_ids.len())?;
        if remote_ids.is_empty() {
            return Ok(BatchResults::default());
        }

        let path = self.events_path();
        let parts: Vec<BatchPart> = remote_ids
            .iter()
            .map(|id| BatchPart::delete(format!("{}/{}", path, urlencoding::encode(id))))
            .collect();

        let responses = self.send_batch(&parts).await?;
        let results = batch::correlate(&responses, remote_ids.len(), interpret_delete);

        tracing::info!(
            "Batch delete: {} succeeded, {} failed",
            results.successes.len(),
            results.failures.len()
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::fingerprint::to_remote;
    use crate::calendar::event::tests::sample_event;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticToken;

    #[async_trait]
    impl TokenSource for StaticToken {
        async fn bearer_token(&self) -> Result<String, AuthError> {
            Ok("test-token".to_string())
        }
    }

    struct NoToken;

    #[async_trait]
    impl TokenSource for NoToken {
        async fn bearer_token(&self) -> Result<String, AuthError> {
            Err(AuthError::AuthorizationRequired)
        }
    }

    fn client(server: &MockServer) -> GoogleCalendarClient {
        GoogleCalendarClient::new(Arc::new(StaticToken), "primary".to_string())
            .with_base_url(server.uri())
            .with_batch_url(format!("{}/batch", server.uri()))
    }

    fn remote(title: &str) -> RemoteEvent {
        to_remote(&sample_event("base", title))
    }

    #[test]
    fn google_calendar_client_has_default_urls() {
        let client = GoogleCalendarClient::new(Arc::new(StaticToken), "primary".to_string());

        assert_eq!(client.base_url, "https://www.googleapis.com/calendar/v3");
        assert_eq!(client.batch_url, "https://www.googleapis.com/batch/calendar/v3");
        assert_eq!(client.events_path(), "/calendar/v3/calendars/primary/events");
    }

    #[test]
    fn calendar_ids_are_url_encoded() {
        let client = GoogleCalendarClient::new(Arc::new(StaticToken), "team@group.calendar.google.com".to_string());

        assert_eq!(
            client.events_url(),
            "https://www.googleapis.com/calendar/v3/calendars/team%40group.calendar.google.com/events"
        );
    }

    #[test]
    fn status_classification() {
        assert!(ApiError::from_status(403, "Forbidden").is_rate_limited());
        assert!(ApiError::from_status(429, "").is_rate_limited());
        assert!(ApiError::from_status(400, "Quota exceeded for quota metric").is_rate_limited());
        assert!(ApiError::from_status(404, "").is_not_found());
        assert!(ApiError::from_status(410, "").is_not_found());
        assert!(ApiError::from_status(401, "").is_authentication());
        assert!(!ApiError::from_status(400, "Invalid value").is_rate_limited());
        assert!(!ApiError::from_status(503, "Backend Error").is_rate_limited());
    }

    #[tokio::test]
    async fn create_event_returns_remote_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/calendars/primary/events"))
            .and(header("authorization", "Bearer test-token"))
            .and(body_string_contains("occurrenceKey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "remote-1",
                "summary": "Planning"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server).create_event(&remote("Planning")).await.unwrap();

        assert_eq!(id, "remote-1");
    }

    #[tokio::test]
    async fn update_missing_event_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/calendars/primary/events/gone-id"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;

        let result = client(&server).update_event("gone-id", &remote("Planning")).await;

        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/calendars/primary/events/a"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/calendars/primary/events/b"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/calendars/primary/events/c"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Backend Error"))
            .mount(&server)
            .await;
        let client = client(&server);

        assert!(client.delete_event("a").await.is_ok());
        assert!(client.delete_event("b").await.is_ok());
        assert!(matches!(
            client.delete_event("c").await,
            Err(ApiError::RequestError { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn list_events_follows_page_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "id": "b", "summary": "Second", "start": {}, "end": {} }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(query_param("singleEvents", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "id": "a", "summary": "First", "start": {}, "end": {} }],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;
        let window = TimeWindow::around(chrono::Utc::now(), 1, 1);

        let events = client(&server).list_events(&window).await.unwrap();

        let ids: Vec<_> = events.iter().filter_map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn batch_create_posts_multipart_and_correlates_results() {
        let server = MockServer::start().await;
        let response_body = "--batch_resp\r\n\
            Content-Type: application/http\r\n\
            Content-ID: <response-item1>\r\n\
            \r\n\
            HTTP/1.1 200 OK\r\n\
            Content-Type: application/json\r\n\
            \r\n\
            {\"id\": \"second\"}\r\n\
            --batch_resp\r\n\
            Content-Type: application/http\r\n\
            Content-ID: <response-item0>\r\n\
            \r\n\
            HTTP/1.1 200 OK\r\n\
            Content-Type: application/json\r\n\
            \r\n\
            {\"id\": \"first\"}\r\n\
            --batch_resp--\r\n";
        Mock::given(method("POST"))
            .and(path("/batch"))
            .and(body_string_contains("Content-ID: <item0>"))
            .and(body_string_contains("Content-ID: <item1>"))
            .and(body_string_contains("POST /calendars/primary/events HTTP/1.1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(response_body, "multipart/mixed; boundary=batch_resp"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let results = client(&server)
            .batch_create(&[remote("One"), remote("Two")])
            .await
            .unwrap();

        assert_eq!(results.successes[&0], "first");
        assert_eq!(results.successes[&1], "second");
        assert!(results.failures.is_empty());
    }

    #[tokio::test]
    async fn batch_delete_encodes_delete_lines() {
        let server = MockServer::start().await;
        let response_body = "--r\r\n\
            Content-Type: application/http\r\n\
            Content-ID: <response-item0>\r\n\
            \r\n\
            HTTP/1.1 204 No Content\r\n\
            \r\n\
            \r\n\
            --r--\r\n";
        Mock::given(method("POST"))
            .and(path("/batch"))
            .and(body_string_contains("DELETE /calendars/primary/events/abc HTTP/1.1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(response_body, "multipart/mixed; boundary=r"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let results = client(&server).batch_delete(&["abc".to_string()]).await.unwrap();

        assert!(results.successes.contains_key(&0));
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let ids: Vec<String> = (0..=MAX_BATCH_SIZE).map(|i| i.to_string()).collect();

        let result = client(&server).batch_delete(&ids).await;

        assert!(matches!(result, Err(ApiError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn outer_batch_failure_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/batch"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
            .mount(&server)
            .await;

        let result = client(&server).batch_create(&[remote("One")]).await;

        assert!(result.unwrap_err().is_rate_limited());
    }

    #[tokio::test]
    async fn token_failure_surfaces_as_auth_error() {
        let server = MockServer::start().await;
        let client = GoogleCalendarClient::new(Arc::new(NoToken), "primary".to_string())
            .with_base_url(server.uri());

        let result = client.create_event(&remote("One")).await;

        assert!(result.unwrap_err().is_authentication());
    }
}
