//! Compute control API client.
//!
//! Every reply is wrapped in a `{status, message, payload}` envelope.
//! A non-`OK` status is an `Api` error, a 5xx response a `Server` error,
//! and a transport failure an `Http` error. All three are retried with
//! exponential backoff up to `retry_attempts` attempts: transport and 5xx
//! failures inside the client middleware, envelope failures around it.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Response;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{
    default_on_request_failure, default_on_request_success, RetryTransientMiddleware, Retryable,
    RetryableStrategy,
};
use retry_policies::policies::ExponentialBackoff;
use retry_policies::{Jitter, RetryDecision, RetryPolicy};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use gridscale_core::{GridScaleError, Result};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
const CAPACITY_MARKERS: &[&str] = &["insufficient instance capacity", "insufficientinstancecapacity"];

/// Lifecycle status of a compute run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopped,
    Failure,
    Success,
    #[serde(other)]
    Unknown,
}

/// Node details of a run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInstance {
    pub node_type: Option<String>,
    pub node_name: Option<String>,
}

/// A compute run as reported by the control API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    #[serde(default)]
    pub status: RunStatus,
    #[serde(rename = "podIP")]
    pub pod_ip: Option<String>,
    pub pod_id: Option<String>,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub instance: RunInstance,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub state_reason_message: Option<String>,
}

impl RunInfo {
    pub fn started_at(&self) -> Option<NaiveDateTime> {
        self.start_date.as_deref().and_then(parse_date)
    }

    pub fn stopped_at(&self) -> Option<NaiveDateTime> {
        self.end_date.as_deref().and_then(parse_date)
    }

    /// Whether the run failed because the provider ran out of capacity.
    pub fn had_capacity_failure(&self) -> bool {
        self.state_reason_message.as_deref().is_some_and(|reason| {
            let reason = reason.to_ascii_lowercase();
            CAPACITY_MARKERS.iter().any(|marker| reason.contains(marker))
        })
    }
}

fn parse_date(value: &str) -> Option<NaiveDateTime> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
}

/// Status of a run task such as the node setup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Success,
    Failure,
    Stopped,
    #[serde(other)]
    Unknown,
}

/// One log entry of a run task.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub status: TaskStatus,
    pub log_text: Option<String>,
}

/// An instance type the provider allows in a region.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeInfo {
    pub name: String,
    pub vcpu: u32,
    #[serde(default)]
    pub gpu: u32,
    /// Memory in GiB.
    #[serde(default)]
    pub memory: f64,
    pub term_type: Option<String>,
}

#[derive(Deserialize)]
struct AllowedInstanceTypes {
    #[serde(rename = "cluster.allowed.instance.types", default)]
    instance_types: Vec<InstanceTypeInfo>,
}

#[derive(Deserialize)]
struct Preference {
    value: Option<String>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    status: String,
    message: Option<String>,
    payload: Option<T>,
}

/// Operations of the compute control API the autoscaler needs.
#[async_trait]
pub trait PipelineApi: Send + Sync {
    async fn load_run(&self, run_id: &str) -> Result<RunInfo>;

    async fn load_task(&self, run_id: &str, task: &str) -> Result<Vec<TaskInfo>>;

    async fn get_allowed_instance_types(
        &self,
        region_id: u64,
        spot: bool,
    ) -> Result<Vec<InstanceTypeInfo>>;

    async fn get_preference(&self, name: &str) -> Result<Option<String>>;
}

/// Connection settings for the control API.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL ending with `/`, e.g. `https://host/pipeline/restapi/`.
    pub url: String,
    pub token: String,
    /// Attempts per request, the first one included.
    pub retry_attempts: u32,
    /// Delay before the first retry; each further retry doubles it.
    pub retry_delay: Duration,
}

/// Longest wait between two attempts, as a multiple of `retry_delay`.
const MAX_DELAY_FACTOR: u32 = 32;

impl ApiConfig {
    fn backoff(&self) -> ExponentialBackoff {
        let min = self.retry_delay;
        let max = min.saturating_mul(MAX_DELAY_FACTOR);
        ExponentialBackoff::builder()
            .retry_bounds(min, max)
            .jitter(Jitter::None)
            .build_with_max_retries(self.retry_attempts.saturating_sub(1))
    }
}

/// Retries transport failures, timeouts and 5xx responses.
struct RetryOnServerError;

impl RetryableStrategy for RetryOnServerError {
    fn handle(&self, res: &reqwest_middleware::Result<Response>) -> Option<Retryable> {
        match res {
            Err(reqwest_middleware::Error::Middleware(_)) => Some(Retryable::Transient),
            Err(e @ reqwest_middleware::Error::Reqwest(_)) => default_on_request_failure(e),
            Ok(response) => default_on_request_success(response),
        }
    }
}

/// `PipelineApi` over HTTP.
pub struct HttpPipelineApi {
    client: ClientWithMiddleware,
    backoff: ExponentialBackoff,
    config: ApiConfig,
}

impl HttpPipelineApi {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GridScaleError::Http(e.to_string()))?;
        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                config.backoff(),
                RetryOnServerError,
            ))
            .build();
        let backoff = config.backoff();
        Ok(Self {
            client,
            backoff,
            config,
        })
    }

    /// GET `path` and unwrap the envelope, retrying non-`OK` envelopes.
    async fn get<T: DeserializeOwned + Send>(&self, path: &str) -> Result<Option<T>> {
        let started = SystemTime::now();
        let mut past_retries = 0;
        loop {
            let e = match self.get_once(path).await {
                Err(e @ GridScaleError::Api(_)) => e,
                result => return result,
            };
            match self.backoff.should_retry(started, past_retries) {
                RetryDecision::Retry { execute_after } => {
                    let wait = execute_after
                        .duration_since(SystemTime::now())
                        .unwrap_or_default();
                    warn!(%path, retry = past_retries + 1, ?wait, error = %e, "api request failed, retrying");
                    tokio::time::sleep(wait).await;
                    past_retries += 1;
                }
                RetryDecision::DoNotRetry => return Err(e),
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.config.url, path);
        debug!(%url, "api request");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| GridScaleError::Http(e.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(GridScaleError::Server(format!("{status} from {path}")));
        }
        if !status.is_success() {
            return Err(GridScaleError::Http(format!("{status} from {path}")));
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| GridScaleError::Http(format!("bad response body from {path}: {e}")))?;
        unwrap_envelope(envelope)
    }

    async fn require<T: DeserializeOwned + Send>(&self, path: &str) -> Result<T> {
        self.get(path)
            .await?
            .ok_or_else(|| GridScaleError::Api(format!("empty payload from {path}")))
    }
}

fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<Option<T>> {
    if envelope.status != "OK" {
        return Err(GridScaleError::Api(
            envelope
                .message
                .unwrap_or_else(|| format!("status {}", envelope.status)),
        ));
    }
    Ok(envelope.payload)
}

#[async_trait]
impl PipelineApi for HttpPipelineApi {
    async fn load_run(&self, run_id: &str) -> Result<RunInfo> {
        self.require(&format!("run/{run_id}")).await
    }

    async fn load_task(&self, run_id: &str, task: &str) -> Result<Vec<TaskInfo>> {
        Ok(self
            .get(&format!("run/{run_id}/task?taskName={task}"))
            .await?
            .unwrap_or_default())
    }

    async fn get_allowed_instance_types(
        &self,
        region_id: u64,
        spot: bool,
    ) -> Result<Vec<InstanceTypeInfo>> {
        let allowed: AllowedInstanceTypes = self
            .require(&format!("cluster/instance/allowed?regionId={region_id}&spot={spot}"))
            .await?;
        Ok(allowed.instance_types)
    }

    async fn get_preference(&self, name: &str) -> Result<Option<String>> {
        let preference: Option<Preference> = self.get(&format!("preferences/{name}")).await?;
        Ok(preference.and_then(|p| p.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn parses_run_payload() {
        let json = r#"{
            "status": "OK",
            "payload": {
                "id": 12,
                "status": "STOPPED",
                "podIP": "10.0.0.7",
                "podId": "pipeline-12",
                "initialized": true,
                "instance": {"nodeType": "m5.large", "nodeName": "ip-10-0-0-7"},
                "startDate": "2024-01-18 10:00:00.123",
                "endDate": "2024-01-18 10:05:00.000",
                "stateReasonMessage": "Insufficient instance capacity."
            }
        }"#;
        let envelope: Envelope<RunInfo> = serde_json::from_str(json).unwrap();
        let run = unwrap_envelope(envelope).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
        assert_eq!(run.pod_ip.as_deref(), Some("10.0.0.7"));
        assert!(run.initialized);
        assert_eq!(run.instance.node_type.as_deref(), Some("m5.large"));
        assert!(run.started_at().is_some());
        assert!(run.stopped_at().is_some());
        assert!(run.had_capacity_failure());
    }

    #[test]
    fn unknown_run_status_does_not_fail_parsing() {
        let run: RunInfo = serde_json::from_str(r#"{"status": "SCHEDULED"}"#).unwrap();
        assert_eq!(run.status, RunStatus::Unknown);
        assert!(!run.initialized);
        assert!(!run.had_capacity_failure());
    }

    #[test]
    fn non_ok_envelope_is_an_api_error() {
        let envelope: Envelope<RunInfo> =
            serde_json::from_str(r#"{"status": "ERROR", "message": "Run 12 not found"}"#).unwrap();
        let err = unwrap_envelope(envelope).unwrap_err();
        assert!(matches!(err, GridScaleError::Api(ref m) if m == "Run 12 not found"));
    }

    #[test]
    fn parses_allowed_instance_types() {
        let json = r#"{
            "status": "OK",
            "payload": {
                "cluster.allowed.instance.types": [
                    {"name": "m5.large", "vcpu": 2, "gpu": 0, "memory": 8, "termType": "OnDemand"},
                    {"name": "p3.2xlarge", "vcpu": 8, "gpu": 1, "memory": 61.0}
                ]
            }
        }"#;
        let envelope: Envelope<AllowedInstanceTypes> = serde_json::from_str(json).unwrap();
        let allowed = unwrap_envelope(envelope).unwrap().unwrap();
        assert_eq!(allowed.instance_types.len(), 2);
        assert_eq!(allowed.instance_types[1].gpu, 1);
        assert_eq!(allowed.instance_types[1].memory, 61.0);
    }

    #[test]
    fn parses_task_logs() {
        let json = r#"[{"status": "SUCCESS", "logText": "done"}, {"status": "RUNNING"}]"#;
        let tasks: Vec<TaskInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Success);
        assert_eq!(tasks[1].log_text, None);
    }

    /// Answers every request with `reply` and records when each arrived.
    async fn serve(reply: String) -> (String, Arc<Mutex<Vec<Instant>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let seen = arrivals.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                seen.lock().unwrap().push(Instant::now());
                stream.write_all(reply.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
        });
        (url, arrivals)
    }

    fn client(url: String, retry_attempts: u32, retry_delay: Duration) -> HttpPipelineApi {
        HttpPipelineApi::new(ApiConfig {
            url,
            token: "secret".to_string(),
            retry_attempts,
            retry_delay,
        })
        .unwrap()
    }

    fn gaps(arrivals: &Mutex<Vec<Instant>>) -> Vec<Duration> {
        let arrivals = arrivals.lock().unwrap();
        arrivals.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test]
    async fn server_errors_are_retried_with_growing_delays() {
        let reply = "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
        let (url, arrivals) = serve(reply.to_string()).await;
        let api = client(url, 4, Duration::from_millis(40));

        let err = api.load_run("12").await.unwrap_err();

        assert!(matches!(err, GridScaleError::Server(_)));
        let gaps = gaps(&arrivals);
        assert_eq!(gaps.len(), 3);
        assert!(gaps[0] >= Duration::from_millis(40));
        assert!(gaps[1] > gaps[0]);
        assert!(gaps[2] > gaps[1]);
    }

    #[tokio::test]
    async fn error_envelopes_are_retried_with_growing_delays() {
        let body = r#"{"status": "ERROR", "message": "busy"}"#;
        let reply = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let (url, arrivals) = serve(reply).await;
        let api = client(url, 3, Duration::from_millis(40));

        let err = api.load_run("12").await.unwrap_err();

        assert!(matches!(err, GridScaleError::Api(ref m) if m == "busy"));
        let gaps = gaps(&arrivals);
        assert_eq!(gaps.len(), 2);
        assert!(gaps[0] >= Duration::from_millis(40));
        assert!(gaps[1] > gaps[0]);
    }

    #[tokio::test]
    async fn single_attempt_is_not_retried() {
        let reply = "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
        let (url, arrivals) = serve(reply.to_string()).await;
        let api = client(url, 1, Duration::from_millis(40));

        assert!(api.get_allowed_instance_types(1, true).await.is_err());
        assert_eq!(arrivals.lock().unwrap().len(), 1);
    }
}
