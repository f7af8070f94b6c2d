//! HTTP client for the build queue server
//!
//! Implements [`BuildQueueApi`] over the server's REST endpoints. Every
//! worker-scoped route lives under `{url}/build-worker/{user}/{queue}`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::api::{BuildQueueApi, LogMetadata, LogResponse, LogTarget, WorkerRegistration};
use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};
use crate::job::{BuildStatus, Job};
use crate::queue::QueueName;

/// Build queue API client
#[derive(Clone)]
pub struct HttpBuildQueue {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    worker_id: String,
}

#[derive(Debug, Serialize)]
struct FinishRequest<'a> {
    status: &'a str,
    failed: bool,
}

#[derive(Debug, Serialize)]
struct LogRequest<'a> {
    msg: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<&'a LogMetadata>,
}

impl HttpBuildQueue {
    /// Create a new client from the API configuration
    pub fn new(config: &ApiConfig) -> ApiResult<Self> {
        let mut headers = HeaderMap::new();

        if let Some(ref token) = config.token {
            let auth_value = format!("token {}", token);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| ApiError::Transport(format!("invalid token header: {}", e)))?,
            );
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn queue_url(&self, queue: &QueueName) -> String {
        format!(
            "{}/build-worker/{}/{}",
            self.base_url,
            urlencoding::encode(&queue.username),
            urlencoding::encode(&queue.queue)
        )
    }

    fn worker_url(&self, queue: &QueueName, worker_id: &str) -> String {
        format!(
            "{}/{}",
            self.queue_url(queue),
            urlencoding::encode(worker_id)
        )
    }

    fn job_url(&self, queue: &QueueName, worker_id: &str, job_id: &str, action: &str) -> String {
        format!(
            "{}/jobs/{}/{}",
            self.worker_url(queue, worker_id),
            urlencoding::encode(job_id),
            action
        )
    }

    async fn post_log(
        &self,
        target: &LogTarget,
        body: LogRequest<'_>,
        action: &str,
    ) -> ApiResult<LogResponse> {
        let url = self.job_url(&target.queue, &target.worker_id, &target.job_id, action);

        let response = self.client.post(&url).json(&body).send().await?;
        let response = check_status(response).await?;

        // Older servers answer with an empty body
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(LogResponse::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Map non-success statuses onto the API error taxonomy
async fn check_status(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());

    Err(match status {
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized(message),
        _ => ApiError::Server {
            status: status.as_u16(),
            message,
        },
    })
}

/// An empty JSON object means the queue had no work
fn parse_job(value: serde_json::Value) -> ApiResult<Option<Job>> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(ref map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(|e| ApiError::Decode(e.to_string())),
    }
}

#[async_trait]
impl BuildQueueApi for HttpBuildQueue {
    async fn register_worker(
        &self,
        queue: &QueueName,
        registration: &WorkerRegistration,
    ) -> ApiResult<String> {
        let url = self.queue_url(queue);
        debug!("POST {}: {:?}", url, registration);

        let response = self.client.post(&url).json(registration).send().await?;
        let response = check_status(response).await?;
        let body: RegisterResponse = response.json().await?;

        Ok(body.worker_id)
    }

    async fn remove_worker(&self, queue: &QueueName, worker_id: &str) -> ApiResult<bool> {
        let url = self.worker_url(queue, worker_id);
        debug!("DELETE {}", url);

        let response = self.client.delete(&url).send().await?;
        match check_status(response).await {
            Ok(_) => Ok(true),
            Err(ApiError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pop_build_job(&self, queue: &QueueName, worker_id: &str) -> ApiResult<Option<Job>> {
        let url = format!("{}/jobs", self.worker_url(queue, worker_id));

        let response = self.client.get(&url).send().await?;
        let response = check_status(response).await?;
        let value: serde_json::Value = response.json().await?;

        parse_job(value)
    }

    async fn push_build_job(
        &self,
        queue: &QueueName,
        worker_id: &str,
        job_id: &str,
    ) -> ApiResult<()> {
        let url = self.job_url(queue, worker_id, job_id, "push");
        debug!("POST {}", url);

        let response = self.client.post(&url).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn finish_build(
        &self,
        queue: &QueueName,
        worker_id: &str,
        job_id: &str,
        status: BuildStatus,
        failed: bool,
    ) -> ApiResult<()> {
        let url = self.job_url(queue, worker_id, job_id, "finish");
        let body = FinishRequest {
            status: status.as_str(),
            failed,
        };
        debug!("POST {}: {:?}", url, body);

        let response = self.client.post(&url).json(&body).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn log_build_output(&self, target: &LogTarget, text: &str) -> ApiResult<LogResponse> {
        let body = LogRequest {
            msg: text,
            tags: None,
        };
        self.post_log(target, body, "log").await
    }

    async fn log_build_output_structured(
        &self,
        target: &LogTarget,
        text: &str,
        metadata: &LogMetadata,
    ) -> ApiResult<LogResponse> {
        let body = LogRequest {
            msg: text,
            tags: Some(metadata),
        };
        self.post_log(target, body, "tagged-log").await
    }

    async fn fetch_build_source(
        &self,
        queue: &QueueName,
        worker_id: &str,
        job_id: &str,
        dest: &Path,
    ) -> ApiResult<bool> {
        let url = self.job_url(queue, worker_id, job_id, "build-source");

        let response = self.client.get(&url).send().await?;
        if matches!(
            response.status(),
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND
        ) {
            return Ok(false);
        }

        let mut response = check_status(response).await?;
        let write_err = |source| ApiError::Write {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(dest).await.map_err(write_err)?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await.map_err(write_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(write_err)?;

        debug!(job_id = %job_id, bytes = written, "Downloaded build source");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpBuildQueue {
        let config = ApiConfig {
            url: "http://queue.local:8080/api/".to_string(),
            token: Some("secret".to_string()),
            timeout: 5,
        };
        HttpBuildQueue::new(&config).unwrap()
    }

    #[test]
    fn test_urls() {
        let api = client();
        let queue = QueueName::new("alice", "linux");

        assert_eq!(
            api.queue_url(&queue),
            "http://queue.local:8080/api/build-worker/alice/linux"
        );
        assert_eq!(
            api.job_url(&queue, "w1", "j 1", "finish"),
            "http://queue.local:8080/api/build-worker/alice/linux/w1/jobs/j%201/finish"
        );
    }

    #[test]
    fn test_parse_job_empty_means_no_work() {
        assert_eq!(parse_job(serde_json::json!({})).unwrap(), None);
        assert_eq!(parse_job(serde_json::Value::Null).unwrap(), None);

        let job = parse_job(serde_json::json!({"job_id": "j1", "job_name": "pkg"}))
            .unwrap()
            .unwrap();
        assert_eq!(job.job_id, "j1");

        let err = parse_job(serde_json::json!({"job_name": 3})).unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    /// Serve one canned response per connection, then close it
    async fn serve(responses: Vec<&'static str>) -> std::net::SocketAddr {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_build_source_streams_to_file() {
        let addr = serve(vec![
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
             5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n",
        ])
        .await;
        let api = HttpBuildQueue::new(&ApiConfig {
            url: format!("http://{}/api/", addr),
            token: None,
            timeout: 5,
        })
        .unwrap();
        let queue = QueueName::new("alice", "linux");
        let dir = tempfile::tempdir().unwrap();

        let tarball = dir.path().join("build_source.tar");
        assert!(api
            .fetch_build_source(&queue, "w1", "j1", &tarball)
            .await
            .unwrap());
        assert_eq!(std::fs::read_to_string(&tarball).unwrap(), "hello world");

        let missing = dir.path().join("none.tar");
        assert!(!api
            .fetch_build_source(&queue, "w1", "j2", &missing)
            .await
            .unwrap());
        assert!(!missing.exists());
    }

    #[test]
    fn test_log_request_serialization() {
        let mut tags = LogMetadata::new();
        tags.insert("section".to_string(), "install".to_string());

        let plain = serde_json::to_string(&LogRequest {
            msg: "hello",
            tags: None,
        })
        .unwrap();
        assert_eq!(plain, r#"{"msg":"hello"}"#);

        let tagged = serde_json::to_string(&LogRequest {
            msg: "hello",
            tags: Some(&tags),
        })
        .unwrap();
        assert!(tagged.contains(r#""section":"install""#));
    }
}
