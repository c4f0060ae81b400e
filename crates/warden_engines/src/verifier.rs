#![forbid(unsafe_code)]

use std::env;
use std::io;
use std::time::Duration;

use base64::Engine as _;
use sha2::{Digest, Sha256};
use warden_kernel_contracts::bioverify::{
    BiometricSample, MatchScore, SampleQuality, VerificationFailureKind, VerifierMatch,
};
use warden_kernel_contracts::report::SubjectId;
use warden_kernel_contracts::Validate;

pub const VERIFIER_CONNECT_TIMEOUT_MS_DEFAULT: u64 = 3_000;
pub const VERIFIER_REQUEST_TIMEOUT_MS_DEFAULT: u64 = 10_000;
const ERROR_DETAIL_MAX_CHARS: usize = 256;

/// Typed failure of a single verifier call. Only `Unreachable` and `Timeout` are retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("verifier unreachable: {detail}")]
    Unreachable { detail: String },
    #[error("verifier rejected the sample: {detail}")]
    InvalidSample { detail: String },
    #[error("verifier fault (status {status:?}): {detail}")]
    ServerFault { status: Option<u16>, detail: String },
    #[error("verifier timeout: {detail}")]
    Timeout { detail: String },
}

impl VerificationError {
    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self::Unreachable {
            detail: bounded_detail(detail.into()),
        }
    }

    pub fn invalid_sample(detail: impl Into<String>) -> Self {
        Self::InvalidSample {
            detail: bounded_detail(detail.into()),
        }
    }

    pub fn server_fault(status: Option<u16>, detail: impl Into<String>) -> Self {
        Self::ServerFault {
            status,
            detail: bounded_detail(detail.into()),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::Timeout {
            detail: bounded_detail(detail.into()),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable { .. } | Self::Timeout { .. } => true,
            Self::InvalidSample { .. } | Self::ServerFault { .. } => false,
        }
    }

    pub fn failure_kind(&self) -> VerificationFailureKind {
        match self {
            Self::Unreachable { .. } => VerificationFailureKind::Unreachable,
            Self::InvalidSample { .. } => VerificationFailureKind::InvalidSample,
            Self::ServerFault { .. } => VerificationFailureKind::ServerFault,
            Self::Timeout { .. } => VerificationFailureKind::Timeout,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Unreachable { detail }
            | Self::InvalidSample { detail }
            | Self::ServerFault { detail, .. }
            | Self::Timeout { detail } => detail,
        }
    }
}

fn bounded_detail(detail: String) -> String {
    if detail.chars().count() > ERROR_DETAIL_MAX_CHARS {
        detail.chars().take(ERROR_DETAIL_MAX_CHARS).collect()
    } else {
        detail
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifierResponse {
    pub verifier_match: VerifierMatch,
    /// Verbatim response body, kept on the verification record for audit.
    pub raw_response: String,
}

/// Seam between the workflow and whatever performs the biometric comparison.
pub trait VerificationClient: Send + Sync {
    fn verify(
        &self,
        subject_id: &SubjectId,
        sample: &BiometricSample,
    ) -> Result<VerifierResponse, VerificationError>;

    /// Upper bound on how long one `verify` call blocks before it returns.
    fn call_timeout(&self) -> Duration {
        Duration::from_millis(
            VERIFIER_CONNECT_TIMEOUT_MS_DEFAULT + VERIFIER_REQUEST_TIMEOUT_MS_DEFAULT,
        )
    }
}

impl<T: VerificationClient + ?Sized> VerificationClient for std::sync::Arc<T> {
    fn verify(
        &self,
        subject_id: &SubjectId,
        sample: &BiometricSample,
    ) -> Result<VerifierResponse, VerificationError> {
        (**self).verify(subject_id, sample)
    }

    fn call_timeout(&self) -> Duration {
        (**self).call_timeout()
    }
}

impl<T: VerificationClient + ?Sized> VerificationClient for Box<T> {
    fn verify(
        &self,
        subject_id: &SubjectId,
        sample: &BiometricSample,
    ) -> Result<VerifierResponse, VerificationError> {
        (**self).verify(subject_id, sample)
    }

    fn call_timeout(&self) -> Duration {
        (**self).call_timeout()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpVerifierConfig {
    pub endpoint: String,
    pub bearer_token: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl HttpVerifierConfig {
    pub fn from_env() -> Option<Self> {
        Self::from_env_lookup(|key| env::var(key).ok())
    }

    pub fn from_env_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let endpoint = lookup("WARDEN_VERIFIER_ENDPOINT")?.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }
        let bearer_token = lookup("WARDEN_VERIFIER_BEARER").and_then(|v| {
            let s = v.trim().to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        });
        let connect_timeout_ms = lookup("WARDEN_VERIFIER_CONNECT_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| (100..=60_000).contains(v))
            .unwrap_or(VERIFIER_CONNECT_TIMEOUT_MS_DEFAULT);
        let request_timeout_ms = lookup("WARDEN_VERIFIER_REQUEST_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| (100..=120_000).contains(v))
            .unwrap_or(VERIFIER_REQUEST_TIMEOUT_MS_DEFAULT);
        Some(Self {
            endpoint,
            bearer_token,
            connect_timeout_ms,
            request_timeout_ms,
        })
    }
}

#[derive(Debug, serde::Serialize)]
struct VerifyRequestBody<'a> {
    subject_id: &'a str,
    sample_b64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_format: Option<&'static str>,
}

#[derive(Debug, serde::Deserialize)]
struct VerifyResponseBody {
    matched: bool,
    score: f32,
    quality: f32,
}

/// Calls a remote verifier over HTTP with JSON in both directions.
pub struct HttpVerificationClient {
    config: HttpVerifierConfig,
    agent: ureq::Agent,
}

impl HttpVerificationClient {
    pub fn new(config: HttpVerifierConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .try_proxy_from_env(false)
            .build();
        Self { config, agent }
    }

    pub fn config(&self) -> &HttpVerifierConfig {
        &self.config
    }
}

impl std::fmt::Debug for HttpVerificationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVerificationClient")
            .field("endpoint", &self.config.endpoint)
            .finish()
    }
}

impl VerificationClient for HttpVerificationClient {
    fn verify(
        &self,
        subject_id: &SubjectId,
        sample: &BiometricSample,
    ) -> Result<VerifierResponse, VerificationError> {
        sample
            .validate()
            .map_err(|err| VerificationError::invalid_sample(err.to_string()))?;
        let body = VerifyRequestBody {
            subject_id: subject_id.as_str(),
            sample_b64: base64::engine::general_purpose::STANDARD.encode(sample.bytes()),
            sample_format: sample.format().map(|f| f.as_str()),
        };
        let payload = serde_json::to_string(&body).map_err(|err| {
            VerificationError::server_fault(None, format!("request encode failed: {err}"))
        })?;
        let mut req = self
            .agent
            .post(&self.config.endpoint)
            .set("content-type", "application/json")
            .set("accept", "application/json");
        if let Some(token) = self.config.bearer_token.as_ref() {
            req = req.set("authorization", &format!("Bearer {token}"));
        }
        tracing::debug!(
            subject_id = subject_id.as_str(),
            sample_len = sample.len(),
            "calling remote verifier"
        );
        match req.send_string(&payload) {
            Ok(resp) => {
                let status = resp.status();
                let raw = resp.into_string().map_err(|err| classify_io_error(&err))?;
                parse_verifier_body(status, raw)
            }
            Err(ureq::Error::Status(status, resp)) => {
                let raw = resp.into_string().unwrap_or_default();
                Err(classify_status(status, &raw))
            }
            Err(ureq::Error::Transport(transport)) => Err(classify_transport(&transport)),
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(
            self.config
                .connect_timeout_ms
                .saturating_add(self.config.request_timeout_ms),
        )
    }
}

fn parse_verifier_body(status: u16, raw: String) -> Result<VerifierResponse, VerificationError> {
    let parsed: VerifyResponseBody = serde_json::from_str(&raw).map_err(|err| {
        VerificationError::server_fault(Some(status), format!("malformed verifier body: {err}"))
    })?;
    let score = MatchScore::new(parsed.score).map_err(|err| {
        VerificationError::server_fault(Some(status), format!("verifier score: {err}"))
    })?;
    let quality = SampleQuality::new(parsed.quality).map_err(|err| {
        VerificationError::server_fault(Some(status), format!("verifier quality: {err}"))
    })?;
    Ok(VerifierResponse {
        verifier_match: VerifierMatch {
            matched: parsed.matched,
            score,
            quality,
        },
        raw_response: raw,
    })
}

/// Maps a non-2xx verifier status onto the failure taxonomy.
pub fn classify_status(status: u16, body: &str) -> VerificationError {
    let detail = if body.trim().is_empty() {
        format!("http status {status}")
    } else {
        format!("http status {status}: {}", body.trim())
    };
    match status {
        408 | 504 => VerificationError::timeout(detail),
        429 | 502 | 503 => VerificationError::unreachable(detail),
        400..=499 => VerificationError::invalid_sample(detail),
        _ => VerificationError::server_fault(Some(status), detail),
    }
}

fn classify_transport(transport: &ureq::Transport) -> VerificationError {
    let io_kind = std::error::Error::source(transport)
        .and_then(|src| src.downcast_ref::<io::Error>())
        .map(|e| e.kind());
    if matches!(io_kind, Some(io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)) {
        return VerificationError::timeout(transport.to_string());
    }
    match transport.kind() {
        ureq::ErrorKind::Dns
        | ureq::ErrorKind::ConnectionFailed
        | ureq::ErrorKind::Io
        | ureq::ErrorKind::ProxyConnect => VerificationError::unreachable(transport.to_string()),
        _ => VerificationError::server_fault(None, transport.to_string()),
    }
}

fn classify_io_error(err: &io::Error) -> VerificationError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            VerificationError::timeout(format!("reading verifier body: {err}"))
        }
        _ => VerificationError::unreachable(format!("reading verifier body: {err}")),
    }
}

/// In-process verifier used when no endpoint is configured, and by tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopbackVerifier {
    pub matched: bool,
    pub score: f32,
    pub quality: f32,
}

impl LoopbackVerifier {
    pub fn accepting() -> Self {
        Self {
            matched: true,
            score: 100.0,
            quality: 100.0,
        }
    }
}

impl VerificationClient for LoopbackVerifier {
    fn verify(
        &self,
        subject_id: &SubjectId,
        sample: &BiometricSample,
    ) -> Result<VerifierResponse, VerificationError> {
        sample
            .validate()
            .map_err(|err| VerificationError::invalid_sample(err.to_string()))?;
        let score = MatchScore::new(self.score)
            .map_err(|err| VerificationError::server_fault(None, err.to_string()))?;
        let quality = SampleQuality::new(self.quality)
            .map_err(|err| VerificationError::server_fault(None, err.to_string()))?;
        Ok(VerifierResponse {
            verifier_match: VerifierMatch {
                matched: self.matched,
                score,
                quality,
            },
            raw_response: format!(
                "loopback:{}:matched={}:score={}:quality={}",
                subject_id.as_str(),
                self.matched,
                score,
                quality
            ),
        })
    }

    fn call_timeout(&self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug)]
pub enum VerifierRuntime {
    Loopback(LoopbackVerifier),
    Http(HttpVerificationClient),
}

impl Default for VerifierRuntime {
    fn default() -> Self {
        Self::from_env_or_loopback()
    }
}

impl VerifierRuntime {
    pub fn from_env_or_loopback() -> Self {
        if let Some(config) = HttpVerifierConfig::from_env() {
            return Self::Http(HttpVerificationClient::new(config));
        }
        tracing::warn!("WARDEN_VERIFIER_ENDPOINT not set; using loopback verifier");
        Self::Loopback(LoopbackVerifier::accepting())
    }
}

impl VerificationClient for VerifierRuntime {
    fn verify(
        &self,
        subject_id: &SubjectId,
        sample: &BiometricSample,
    ) -> Result<VerifierResponse, VerificationError> {
        match self {
            Self::Loopback(v) => v.verify(subject_id, sample),
            Self::Http(v) => v.verify(subject_id, sample),
        }
    }

    fn call_timeout(&self) -> Duration {
        match self {
            Self::Loopback(v) => v.call_timeout(),
            Self::Http(v) => v.call_timeout(),
        }
    }
}

/// Hex digest of the sample, the only trace of it that is ever stored.
pub fn sample_sha256_hex(sample: &BiometricSample) -> String {
    let digest = Sha256::digest(sample.bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::ErrorKind;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;
    use warden_kernel_contracts::bioverify::SampleFormat;

    fn subject() -> SubjectId {
        SubjectId::new("subj_1").unwrap()
    }

    fn sample() -> BiometricSample {
        BiometricSample::v1(vec![7_u8; 64], Some(SampleFormat::Wsq)).unwrap()
    }

    fn client(endpoint: String, request_timeout_ms: u64) -> HttpVerificationClient {
        HttpVerificationClient::new(HttpVerifierConfig {
            endpoint,
            bearer_token: Some("test_token".to_string()),
            connect_timeout_ms: 500,
            request_timeout_ms,
        })
    }

    /// Serves one request with a canned status/body and hands the captured request back.
    fn verifier_mock_server(
        status_line: &'static str,
        body: &'static str,
        delay: Duration,
    ) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        listener
            .set_nonblocking(true)
            .expect("set nonblocking listener");
        let handle = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(3);
            loop {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
                        let mut req_buf = [0_u8; 8192];
                        let bytes = stream.read(&mut req_buf).unwrap_or(0);
                        let req_text = String::from_utf8_lossy(&req_buf[..bytes]).to_string();
                        thread::sleep(delay);
                        let response = format!(
                            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                            status_line,
                            body.len(),
                            body
                        );
                        let _ = stream.write_all(response.as_bytes());
                        let _ = stream.flush();
                        return req_text;
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        if Instant::now() >= deadline {
                            return String::new();
                        }
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => return String::new(),
                }
            }
        });
        (format!("http://{addr}/verify"), handle)
    }

    #[test]
    fn at_verifier_01_http_success_parses_match() {
        let (endpoint, handle) = verifier_mock_server(
            "200 OK",
            r#"{"matched":true,"score":92.0,"quality":80.0}"#,
            Duration::ZERO,
        );
        let resp = client(endpoint, 2_000).verify(&subject(), &sample()).unwrap();
        assert!(resp.verifier_match.matched);
        assert_eq!(resp.verifier_match.score.value(), 92.0);
        assert_eq!(resp.verifier_match.quality.value(), 80.0);
        assert!(resp.raw_response.contains("\"score\":92.0"));
        let req = handle.join().unwrap();
        assert!(req.contains("\"subject_id\":\"subj_1\""));
        assert!(req.contains("\"sample_format\":\"wsq\""));
        assert!(req.to_ascii_lowercase().contains("authorization: bearer test_token"));
    }

    #[test]
    fn at_verifier_02_status_mapping() {
        assert!(matches!(
            classify_status(400, "bad image"),
            VerificationError::InvalidSample { .. }
        ));
        assert!(matches!(
            classify_status(422, ""),
            VerificationError::InvalidSample { .. }
        ));
        assert!(matches!(
            classify_status(408, ""),
            VerificationError::Timeout { .. }
        ));
        assert!(matches!(
            classify_status(504, ""),
            VerificationError::Timeout { .. }
        ));
        for s in [429, 502, 503] {
            assert!(matches!(
                classify_status(s, ""),
                VerificationError::Unreachable { .. }
            ));
        }
        assert!(matches!(
            classify_status(500, ""),
            VerificationError::ServerFault {
                status: Some(500),
                ..
            }
        ));
    }

    #[test]
    fn at_verifier_03_only_unreachable_and_timeout_are_transient() {
        assert!(VerificationError::unreachable("x").is_transient());
        assert!(VerificationError::timeout("x").is_transient());
        assert!(!VerificationError::invalid_sample("x").is_transient());
        assert!(!VerificationError::server_fault(Some(500), "x").is_transient());
    }

    #[test]
    fn at_verifier_04_http_4xx_is_invalid_sample() {
        let (endpoint, handle) = verifier_mock_server(
            "400 Bad Request",
            r#"{"error":"unreadable capture"}"#,
            Duration::ZERO,
        );
        let err = client(endpoint, 2_000)
            .verify(&subject(), &sample())
            .unwrap_err();
        assert_eq!(err.failure_kind(), VerificationFailureKind::InvalidSample);
        assert!(err.detail().contains("unreadable capture"));
        let _ = handle.join();
    }

    #[test]
    fn at_verifier_05_malformed_or_out_of_range_body_is_server_fault() {
        let (endpoint, handle) = verifier_mock_server("200 OK", "not json", Duration::ZERO);
        let err = client(endpoint, 2_000)
            .verify(&subject(), &sample())
            .unwrap_err();
        assert_eq!(err.failure_kind(), VerificationFailureKind::ServerFault);
        let _ = handle.join();

        let (endpoint, handle) = verifier_mock_server(
            "200 OK",
            r#"{"matched":true,"score":140.0,"quality":80.0}"#,
            Duration::ZERO,
        );
        let err = client(endpoint, 2_000)
            .verify(&subject(), &sample())
            .unwrap_err();
        assert_eq!(err.failure_kind(), VerificationFailureKind::ServerFault);
        let _ = handle.join();
    }

    #[test]
    fn at_verifier_06_slow_verifier_is_timeout() {
        let (endpoint, handle) = verifier_mock_server(
            "200 OK",
            r#"{"matched":true,"score":92.0,"quality":80.0}"#,
            Duration::from_millis(800),
        );
        let err = client(endpoint, 200)
            .verify(&subject(), &sample())
            .unwrap_err();
        assert_eq!(err.failure_kind(), VerificationFailureKind::Timeout);
        let _ = handle.join();
    }

    #[test]
    fn at_verifier_07_refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = client(format!("http://{addr}/verify"), 1_000)
            .verify(&subject(), &sample())
            .unwrap_err();
        assert_eq!(err.failure_kind(), VerificationFailureKind::Unreachable);
    }

    #[test]
    fn at_verifier_08_env_lookup() {
        let mut vars = BTreeMap::new();
        assert_eq!(
            HttpVerifierConfig::from_env_lookup(|k| vars.get(k).map(|v: &&str| v.to_string())),
            None
        );
        vars.insert("WARDEN_VERIFIER_ENDPOINT", " http://verifier.local/v1/match ");
        vars.insert("WARDEN_VERIFIER_BEARER", "  ");
        vars.insert("WARDEN_VERIFIER_CONNECT_TIMEOUT_MS", "5");
        vars.insert("WARDEN_VERIFIER_REQUEST_TIMEOUT_MS", "2500");
        let cfg =
            HttpVerifierConfig::from_env_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.endpoint, "http://verifier.local/v1/match");
        assert_eq!(cfg.bearer_token, None);
        assert_eq!(cfg.connect_timeout_ms, VERIFIER_CONNECT_TIMEOUT_MS_DEFAULT);
        assert_eq!(cfg.request_timeout_ms, 2_500);
    }

    #[test]
    fn at_verifier_09_loopback_and_digest() {
        let v = LoopbackVerifier {
            matched: false,
            score: 40.0,
            quality: 80.0,
        };
        let resp = v.verify(&subject(), &sample()).unwrap();
        assert!(!resp.verifier_match.matched);
        let digest = sample_sha256_hex(&sample());
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, sample_sha256_hex(&sample()));
    }

    #[test]
    fn at_verifier_10_call_timeout_reflects_transport_budget() {
        let http = HttpVerificationClient::new(HttpVerifierConfig {
            endpoint: "http://127.0.0.1:9/verify".to_string(),
            bearer_token: None,
            connect_timeout_ms: 500,
            request_timeout_ms: 2_500,
        });
        assert_eq!(http.call_timeout(), Duration::from_millis(3_000));
        let boxed: Box<dyn VerificationClient> = Box::new(VerifierRuntime::Http(http));
        assert_eq!(boxed.call_timeout(), Duration::from_millis(3_000));
        assert_eq!(
            VerifierRuntime::Loopback(LoopbackVerifier::accepting()).call_timeout(),
            Duration::ZERO
        );
    }
}
