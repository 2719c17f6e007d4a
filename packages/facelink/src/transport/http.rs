// Stateless HTTP transport
//
// Each operation is one POST. Replies are JSON objects carrying a `code`
// field; both `200` and `"200"` count as success. Every public operation
// without a `try_` prefix maps any failure to a sentinel value and logs it:
//
//   detect    -> DetectionBox (0,0,0,0)
//   recognize -> vec![0.0]
//   search    -> None
//
// `SessionCommitClient` is the odd one out: it binds a submission to the
// WebSocket session id and reports failures as errors.

use super::websocket::WebSocketTransport;
use super::{Detector, Recognizer, Submitter};
use crate::config::HttpConfig;
use crate::error::{ClientError, ClientResult};
use crate::types::{DetectionBox, Image, RecognitionVector, SearchResult, Task};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Header carrying the WebSocket session id on session-bound submissions
pub const SESSION_ID_HEADER: &str = "X-WebSocket-Session-Id";

fn build_client(config: &HttpConfig) -> ClientResult<Client> {
    Client::builder()
        .timeout(config.timeout())
        .build()
        .map_err(|e| ClientError::InvalidConfig(format!("Failed to build HTTP client: {}", e)))
}

/// Detection, recognition and search over plain HTTP
#[derive(Debug, Clone)]
pub struct HttpRecognitionClient {
    client: Client,
    detection_url: String,
    recognition_url: String,
    search_url: Option<String>,
    topk: u32,
    vector_name: String,
}

impl HttpRecognitionClient {
    /// Build a client from configuration. An empty search URL disables search.
    pub fn new(config: &HttpConfig) -> ClientResult<Self> {
        let search_url = Some(config.search.trim())
            .filter(|url| !url.is_empty())
            .map(str::to_string);

        Ok(Self {
            client: build_client(config)?,
            detection_url: config.detection.clone(),
            recognition_url: config.recognition.clone(),
            search_url,
            topk: config.topk,
            vector_name: config.vector_name.clone(),
        })
    }

    pub fn search_enabled(&self) -> bool {
        self.search_url.is_some()
    }

    /// Detect a face, returning the sentinel box on any failure
    pub async fn detect(&self, image: &Image) -> DetectionBox {
        match self.try_detect(image).await {
            Ok(region) => region,
            Err(e) => {
                warn!("Detection service failed: {}", e);
                DetectionBox::default()
            }
        }
    }

    pub async fn try_detect(&self, image: &Image) -> ClientResult<DetectionBox> {
        let body = self.post_image(&self.detection_url, image).await?;
        check_code(&body)?;

        let coords = number_array(&body, "box")?;
        match coords.as_slice() {
            [x1, y1, x2, y2] => Ok(DetectionBox::new(*x1, *y1, *x2, *y2)),
            other => Err(ClientError::UnexpectedResponse(format!(
                "expected 4 box coordinates, got {}",
                other.len()
            ))),
        }
    }

    /// Compute an embedding, returning a single zero element on any failure
    pub async fn recognize(&self, image: &Image) -> RecognitionVector {
        match self.try_recognize(image).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!("Recognition service failed: {}", e);
                vec![0.0]
            }
        }
    }

    pub async fn try_recognize(&self, image: &Image) -> ClientResult<RecognitionVector> {
        let body = self.post_image(&self.recognition_url, image).await?;
        check_code(&body)?;

        Ok(number_array(&body, "result")?
            .into_iter()
            .map(|v| v as f32)
            .collect())
    }

    /// Search for the closest labels; `None` on failure or when search is disabled
    pub async fn search(&self, vector: &[f32]) -> Option<Vec<SearchResult>> {
        self.search_url.as_ref()?;

        match self.try_search(vector).await {
            Ok(results) => Some(results),
            Err(e) => {
                warn!("Search service failed: {}", e);
                None
            }
        }
    }

    /// Results are returned in backend order.
    pub async fn try_search(&self, vector: &[f32]) -> ClientResult<Vec<SearchResult>> {
        let url = self
            .search_url
            .as_deref()
            .ok_or_else(|| ClientError::InvalidConfig("search endpoint not configured".to_string()))?;

        let mut vectors = serde_json::Map::new();
        vectors.insert(self.vector_name.clone(), json!(vector));
        let request = json!({
            "count": 1,
            "topk": self.topk,
            "vectors": vectors,
        });

        let response = self.client.post(url).json(&request).send().await?;
        let body = read_json(response).await?;
        check_code(&body)?;

        let results = body
            .get("result")
            .and_then(|result| result.get(self.vector_name.as_str()))
            .cloned()
            .ok_or_else(|| {
                ClientError::UnexpectedResponse(format!("missing result.{}", self.vector_name))
            })?;

        if !results.is_array() {
            return Err(ClientError::UnexpectedResponse(format!(
                "result.{} is not an array",
                self.vector_name
            )));
        }

        Ok(serde_json::from_value(results)?)
    }

    async fn post_image(&self, url: &str, image: &Image) -> ClientResult<Value> {
        debug!("POST {} ({} bytes)", url, image.len());
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, image.content_type.as_str())
            .body(image.data.clone())
            .send()
            .await?;

        read_json(response).await
    }
}

#[async_trait]
impl Detector for HttpRecognitionClient {
    async fn detect(&self, image: &Image) -> ClientResult<DetectionBox> {
        self.try_detect(image).await
    }
}

#[async_trait]
impl Recognizer for HttpRecognitionClient {
    async fn recognize(&self, image: &Image, region: DetectionBox) -> ClientResult<Task> {
        // The sentinel vector is never searched
        match self.try_recognize(image).await {
            Ok(vector) => {
                let results = HttpRecognitionClient::search(self, &vector).await;
                Ok(Task::from_recognition(region, vector, results))
            }
            Err(e) => {
                warn!("Recognition service failed: {}", e);
                Ok(Task::from_recognition(region, vec![0.0], None))
            }
        }
    }
}

/// Session-bound submissions for hybrid mode
#[derive(Debug, Clone)]
pub struct SessionCommitClient {
    client: Client,
    url: String,
}

impl SessionCommitClient {
    pub fn new(config: &HttpConfig) -> ClientResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            url: config.commit.clone(),
        })
    }

    /// Submit an image tagged with the current session id.
    ///
    /// Fails with `SessionNotReady` before any I/O when there is no session.
    pub async fn commit(&self, image: &Image, session_id: Option<&str>) -> ClientResult<Task> {
        let session_id = session_id.ok_or(ClientError::SessionNotReady)?;

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, image.content_type.as_str())
            .header(SESSION_ID_HEADER, session_id)
            .body(image.data.clone())
            .send()
            .await?;

        let body = read_json(response).await?;
        Ok(serde_json::from_value(body)?)
    }
}

/// Commits over HTTP using the session id of a live WebSocket transport
pub struct HybridSubmitter {
    commit: SessionCommitClient,
    transport: Arc<WebSocketTransport>,
}

impl HybridSubmitter {
    pub fn new(commit: SessionCommitClient, transport: Arc<WebSocketTransport>) -> Self {
        Self { commit, transport }
    }
}

#[async_trait]
impl Submitter for HybridSubmitter {
    async fn submit(&self, image: Image) -> ClientResult<Option<Task>> {
        let session_id = self.transport.session_id();
        self.commit
            .commit(&image, session_id.as_deref())
            .await
            .map(Some)
    }
}

async fn read_json(response: Response) -> ClientResult<Value> {
    let status = response.status();
    if !status.is_success() {
        let message = status
            .canonical_reason()
            .unwrap_or("unknown status")
            .to_string();
        return Err(ClientError::HttpStatus {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response.json::<Value>().await?)
}

/// Accepts `200` and `"200"`; a missing code is a failure.
fn check_code(body: &Value) -> ClientResult<()> {
    let ok = match body.get("code") {
        Some(Value::Number(n)) => n.as_i64() == Some(200),
        Some(Value::String(s)) => s.trim() == "200",
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(ClientError::UnexpectedResponse(format!(
            "non-success code: {}",
            body.get("code").unwrap_or(&Value::Null)
        )))
    }
}

fn number_array(body: &Value, field: &str) -> ClientResult<Vec<f64>> {
    let values = body
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| ClientError::UnexpectedResponse(format!("'{}' is not an array", field)))?;

    values
        .iter()
        .map(|v| {
            v.as_f64().ok_or_else(|| {
                ClientError::UnexpectedResponse(format!("non-numeric value in '{}'", field))
            })
        })
        .collect()
}
