//! JSON-RPC client for a running service instance
//!
//! Every request gets a fresh, strictly increasing id and the response must
//! echo it. All network waits race the run's cancellation token, so teardown
//! never has to wait for a socket error to unblock a caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::common::{Error, Result};

use super::protocol::{Request, Response, EXECUTE_COMMAND_METHOD, RPC_PATH, STATUS_METHOD};

/// Where a service listens and how to authenticate
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Endpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, RPC_PATH)
    }
}

/// Polling intervals used while waiting for a service to come up
///
/// Each phase is `(until, interval)`: while less than `until` has elapsed,
/// retry every `interval`. Past `ceiling` the wait gives up.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    phases: Vec<(Duration, Duration)>,
    ceiling: Duration,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            phases: vec![
                (Duration::from_secs(10), Duration::from_millis(250)),
                (Duration::from_secs(20), Duration::from_secs(1)),
                (Duration::from_secs(60), Duration::from_secs(10)),
                (Duration::from_secs(300), Duration::from_secs(15)),
            ],
            ceiling: Duration::from_secs(300),
        }
    }
}

impl BackoffSchedule {
    pub fn new(phases: Vec<(Duration, Duration)>, ceiling: Duration) -> Self {
        Self { phases, ceiling }
    }

    /// Default phases cut off at a different ceiling
    pub fn with_ceiling(ceiling: Duration) -> Self {
        Self {
            ceiling,
            ..Self::default()
        }
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Delay before the next attempt, or `None` once the ceiling is reached
    pub fn delay_after(&self, elapsed: Duration) -> Option<Duration> {
        if elapsed >= self.ceiling {
            return None;
        }
        let interval = self
            .phases
            .iter()
            .find(|(until, _)| elapsed < *until)
            .or(self.phases.last())
            .map(|(_, interval)| *interval)?;
        Some(interval.min(self.ceiling - elapsed))
    }
}

/// Channel a script's `>>>` commands are sent through
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run one command line and return its textual output
    async fn execute_command_line(&self, line: &str) -> Result<String>;

    /// Wait until the other end accepts commands
    async fn ready(&self, _schedule: &BackoffSchedule) -> Result<()> {
        Ok(())
    }
}

/// HTTP JSON-RPC client
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: Endpoint,
    url: String,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl RpcClient {
    /// Create a client; `request_timeout` bounds each HTTP exchange
    pub fn new(
        endpoint: Endpoint,
        request_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        let url = endpoint.url();
        Ok(Self {
            http,
            endpoint,
            url,
            next_id: AtomicU64::new(1),
            cancel,
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Call `method`, retrying once if the reply carries the wrong id
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        match self.call_once(method, &params).await {
            Err(Error::IdMismatch { expected, got }) => {
                tracing::warn!(method, expected, got = %got, "response id mismatch, retrying once");
                self.call_once(method, &params).await
            }
            other => other,
        }
    }

    async fn call_once(&self, method: &str, params: &[Value]) -> Result<Value> {
        let id = self.next_id();
        let request = Request::new(method, params.to_vec(), id);
        tracing::debug!(id, method, url = %self.url, "RPC request");

        let send = self
            .http
            .post(&self.url)
            .basic_auth(&self.endpoint.username, Some(&self.endpoint.password))
            .json(&request)
            .send();

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            response = send => response?,
        };
        let status = response.status();

        let body = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            body = response.text() => body?,
        };
        tracing::debug!(id, %status, body = %body, "RPC response");

        let parsed: Response = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) if status.is_success() => {
                return Err(Error::Transport(format!("malformed response body: {e}")))
            }
            Err(_) => return Err(Error::Transport(format!("HTTP {status}"))),
        };

        if let Some(error) = parsed.error {
            return Err(Error::Protocol {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("HTTP {status}")));
        }
        if !parsed.echoes(id) {
            return Err(Error::IdMismatch {
                expected: id,
                got: parsed.id.to_string(),
            });
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }

    /// Poll the status method until it answers, following `schedule`
    pub async fn wait_until_ready(&self, schedule: &BackoffSchedule) -> Result<()> {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.call(STATUS_METHOD, Vec::new()).await {
                Ok(_) => {
                    tracing::info!(url = %self.url, attempts, elapsed = ?start.elapsed(), "service ready");
                    return Ok(());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => tracing::debug!(attempts, error = %e, "service not ready"),
            }

            let Some(delay) = schedule.delay_after(start.elapsed()) else {
                return Err(Error::ReadyTimeout(schedule.ceiling().as_secs()));
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl CommandChannel for RpcClient {
    async fn execute_command_line(&self, line: &str) -> Result<String> {
        let result = self
            .call(EXECUTE_COMMAND_METHOD, vec![Value::String(line.to_string())])
            .await?;
        match result {
            Value::String(text) => Ok(text),
            Value::Null => Ok(String::new()),
            other => Ok(serde_json::to_string_pretty(&other)?),
        }
    }

    async fn ready(&self, schedule: &BackoffSchedule) -> Result<()> {
        self.wait_until_ready(schedule).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, Request as MockRequest, ResponseTemplate};

    fn client_for(server: &MockServer) -> RpcClient {
        let port = server.address().port();
        RpcClient::new(
            Endpoint {
                host: "127.0.0.1".to_string(),
                port,
                username: "username".to_string(),
                password: "password".to_string(),
            },
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .unwrap()
    }

    /// Echo the request id back with a fixed result
    fn echo_id(result: Value) -> impl Fn(&MockRequest) -> ResponseTemplate {
        move |req: &MockRequest| {
            let request: Request = serde_json::from_slice(&req.body).unwrap();
            ResponseTemplate::new(200)
                .set_body_json(Response::success(request.id, result.clone()))
        }
    }

    #[test]
    fn test_default_backoff_phases() {
        let schedule = BackoffSchedule::default();
        assert_eq!(
            schedule.delay_after(Duration::from_secs(0)),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            schedule.delay_after(Duration::from_secs(15)),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            schedule.delay_after(Duration::from_secs(30)),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            schedule.delay_after(Duration::from_secs(100)),
            Some(Duration::from_secs(15))
        );
        assert_eq!(
            schedule.delay_after(Duration::from_secs(295)),
            Some(Duration::from_secs(5))
        );
        assert_eq!(schedule.delay_after(Duration::from_secs(300)), None);
    }

    #[test]
    fn test_shorter_ceiling_truncates() {
        let schedule = BackoffSchedule::with_ceiling(Duration::from_secs(2));
        assert_eq!(
            schedule.delay_after(Duration::from_millis(1900)),
            Some(Duration::from_millis(100))
        );
        assert_eq!(schedule.delay_after(Duration::from_secs(2)), None);
    }

    #[tokio::test]
    async fn test_call_sends_basic_auth_and_increasing_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(header_exists("authorization"))
            .and(body_partial_json(serde_json::json!({"jsonrpc": "2.0"})))
            .respond_with(echo_id(serde_json::json!({"blocks": 12})))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let first = client.call("get_info", Vec::new()).await.unwrap();
        assert_eq!(first["blocks"], 12);
        client.call("get_info", Vec::new()).await.unwrap();

        let ids: Vec<u64> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| serde_json::from_slice::<Request>(&r.body).unwrap().id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_id_mismatch_retries_once_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(Response::success(999, Value::Null)),
            )
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.call("get_info", Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::IdMismatch { expected: 2, .. }));
    }

    #[tokio::test]
    async fn test_error_object_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(
                Response::failure(1, 20005, "unknown command: bogus"),
            ))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.call("bogus", Vec::new()).await.unwrap_err();
        match err {
            Error::Protocol { code, message, .. } => {
                assert_eq!(code, 20005);
                assert_eq!(message, "unknown command: bogus");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bare_http_error_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.call("get_info", Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_command_output_is_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "method": "execute_command_line",
                "params": ["balance"]
            })))
            .respond_with(echo_id(Value::from("1000.00001 XTS\n")))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let output = client.execute_command_line("balance").await.unwrap();
        assert_eq!(output, "1000.00001 XTS\n");
    }

    #[tokio::test]
    async fn test_structured_command_output_is_pretty_printed() {
        let server = MockServer::start().await;
        let raw = r#"{"amount":12.340000000000000001}"#;
        let result: Value = serde_json::from_str(raw).unwrap();
        Mock::given(method("POST"))
            .respond_with(echo_id(result))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let output = client.execute_command_line("balance").await.unwrap();
        assert_eq!(output, "{\n  \"amount\": 12.340000000000000001\n}");
    }

    #[tokio::test]
    async fn test_wait_until_ready_times_out_without_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = RpcClient::new(
            Endpoint {
                host: "127.0.0.1".to_string(),
                port,
                username: "u".to_string(),
                password: "p".to_string(),
            },
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .unwrap();

        let schedule = BackoffSchedule::new(
            vec![(Duration::from_secs(1), Duration::from_millis(50))],
            Duration::from_millis(400),
        );
        let started = Instant::now();
        let err = client.wait_until_ready(&schedule).await.unwrap_err();
        assert!(matches!(err, Error::ReadyTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_ready_wait() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let client = RpcClient::new(
            Endpoint {
                host: "127.0.0.1".to_string(),
                port: server.address().port(),
                username: "u".to_string(),
                password: "p".to_string(),
            },
            Duration::from_secs(1),
            cancel.clone(),
        )
        .unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
        let err = client
            .wait_until_ready(&BackoffSchedule::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        canceller.await.unwrap();
    }
}
