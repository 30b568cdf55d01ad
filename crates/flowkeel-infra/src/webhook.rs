//! Webhook request authentication in front of the worker adapter.
//!
//! Provides:
//! - `verify_hmac_sha256()` -- constant-time HMAC-SHA256 signature verification
//! - `verify_bearer_token()` -- constant-time bearer token comparison
//! - `WebhookGate` -- path -> auth method lookup that admits a request and
//!   hands its body to `WorkerAdapter::handle_webhook`

use dashmap::DashMap;
use flowkeel_core::flow::engine::RunOutcome;
use flowkeel_core::flow::substrate::DurableSubstrate;
use flowkeel_core::flow::worker::{TriggerError, WorkerAdapter};
use flowkeel_core::repository::FlowStore;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("HMAC signature verification failed")]
    HmacVerificationFailed,

    #[error("bearer token verification failed")]
    BearerVerificationFailed,

    #[error("no webhook registered at path: {0}")]
    PathNotFound(String),

    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),

    #[error("missing authentication: {0}")]
    MissingAuth(String),

    #[error("request body is not valid JSON: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

// ---------------------------------------------------------------------------
// HMAC-SHA256 verification
// ---------------------------------------------------------------------------

/// Verify a hex-encoded HMAC-SHA256 signature of `body`.
///
/// Comparison is constant-time (the hmac crate's `verify_slice`).
pub fn verify_hmac_sha256(secret: &[u8], body: &[u8], signature_hex: &str) -> Result<(), WebhookError> {
    let expected = hex_decode(signature_hex).ok_or(WebhookError::HmacVerificationFailed)?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::HmacVerificationFailed)
}

/// Like [`verify_hmac_sha256`], also accepting GitHub-style `sha256=<hex>`.
pub fn verify_hmac_sha256_with_prefix(
    secret: &[u8],
    body: &[u8],
    signature: &str,
) -> Result<(), WebhookError> {
    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    verify_hmac_sha256(secret, body, hex_sig)
}

/// Hex-encoded HMAC-SHA256 of `body`, for signing outgoing requests and tests.
pub fn compute_hmac_sha256_hex(secret: &[u8], body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

// ---------------------------------------------------------------------------
// Bearer token verification
// ---------------------------------------------------------------------------

/// Compare a bearer token (optionally prefixed `Bearer `) in constant time.
pub fn verify_bearer_token(expected: &str, provided: &str) -> Result<(), WebhookError> {
    let token = provided.strip_prefix("Bearer ").unwrap_or(provided);

    if constant_time_eq(expected.as_bytes(), token.as_bytes()) {
        Ok(())
    } else {
        Err(WebhookError::BearerVerificationFailed)
    }
}

/// Returns true iff `a == b`, in time independent of where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---------------------------------------------------------------------------
// WebhookGate
// ---------------------------------------------------------------------------

/// Authentication method for a webhook path.
#[derive(Debug, Clone)]
pub enum WebhookAuthMethod {
    HmacSha256 { secret: Vec<u8> },
    BearerToken { token: String },
    None,
}

/// An inbound webhook request as seen by the gate.
#[derive(Debug, Clone, Copy)]
pub struct WebhookRequest<'a> {
    pub path: &'a str,
    pub body: &'a [u8],
    /// `X-Hub-Signature-256` (or equivalent) header value.
    pub signature: Option<&'a str>,
    /// `Authorization` header value.
    pub authorization: Option<&'a str>,
}

/// Maps webhook paths to their authentication and admits requests.
///
/// Paths are normalized to start with `/` and carry no trailing slash, the
/// same shape the flow compiler requires of webhook triggers.
#[derive(Default)]
pub struct WebhookGate {
    routes: DashMap<String, WebhookAuthMethod>,
}

impl WebhookGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the auth method for a path, replacing any previous one.
    pub fn register(&self, path: &str, auth: WebhookAuthMethod) {
        let normalized = normalize_path(path);
        tracing::info!(path = %normalized, "registered webhook authentication");
        self.routes.insert(normalized, auth);
    }

    pub fn unregister(&self, path: &str) -> Option<WebhookAuthMethod> {
        self.routes.remove(&normalize_path(path)).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Check a request against the auth method registered for its path.
    pub fn verify(&self, request: &WebhookRequest<'_>) -> Result<(), WebhookError> {
        let normalized = normalize_path(request.path);
        let auth = self
            .routes
            .get(&normalized)
            .map(|r| r.value().clone())
            .ok_or(WebhookError::PathNotFound(normalized))?;

        match auth {
            WebhookAuthMethod::HmacSha256 { secret } => {
                let sig = request.signature.ok_or_else(|| {
                    WebhookError::MissingAuth("X-Hub-Signature-256 header required".to_string())
                })?;
                verify_hmac_sha256_with_prefix(&secret, request.body, sig)
            }
            WebhookAuthMethod::BearerToken { token } => {
                let provided = request.authorization.ok_or_else(|| {
                    WebhookError::MissingAuth("Authorization header required".to_string())
                })?;
                verify_bearer_token(&token, provided)
            }
            WebhookAuthMethod::None => Ok(()),
        }
    }

    /// Verify a request, parse its body, and start the bound flow.
    ///
    /// An empty body becomes a `null` payload.
    pub async fn dispatch<S: DurableSubstrate, R: FlowStore + 'static>(
        &self,
        adapter: &WorkerAdapter<S, R>,
        request: WebhookRequest<'_>,
    ) -> Result<RunOutcome, WebhookError> {
        if let Err(e) = self.verify(&request) {
            tracing::warn!(path = request.path, error = %e, "webhook request rejected");
            return Err(e);
        }
        let payload = if request.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(request.body)
                .map_err(|e| WebhookError::InvalidBody(e.to_string()))?
        };
        Ok(adapter
            .handle_webhook(&normalize_path(request.path), payload)
            .await?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn normalize_path(path: &str) -> String {
    let mut normalized = path.to_string();
    if !normalized.starts_with('/') {
        normalized = format!("/{normalized}");
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkeel_core::flow::builder::FlowBuilder;
    use flowkeel_core::flow::engine::FlowEngine;
    use flowkeel_core::flow::node::{HandlerError, Node, handler_fn};
    use flowkeel_core::flow::substrate::LocalSubstrate;
    use flowkeel_core::flow::worker::NodeRegistry;
    use flowkeel_core::repository::{InMemoryFlowStore, RunRepository};
    use flowkeel_types::config::EngineConfig;
    use flowkeel_types::run::RunStatus;
    use serde_json::json;
    use std::sync::Arc;

    // -------------------------------------------------------------------
    // HMAC-SHA256
    // -------------------------------------------------------------------

    #[test]
    fn test_verify_hmac_sha256_valid_and_tampered() {
        let secret = b"my-webhook-secret";
        let body = b"Hello, world!";
        let sig = compute_hmac_sha256_hex(secret, body).unwrap();

        assert!(verify_hmac_sha256(secret, body, &sig).is_ok());
        assert!(verify_hmac_sha256(secret, b"Different body", &sig).is_err());
        assert!(verify_hmac_sha256(b"wrong-secret", body, &sig).is_err());
    }

    #[test]
    fn test_verify_hmac_sha256_with_prefix() {
        let secret = b"my-webhook-secret";
        let body = b"payload data";
        let sig = compute_hmac_sha256_hex(secret, body).unwrap();

        assert!(verify_hmac_sha256_with_prefix(secret, body, &format!("sha256={sig}")).is_ok());
        assert!(verify_hmac_sha256_with_prefix(secret, body, &sig).is_ok());
    }

    #[test]
    fn test_verify_hmac_sha256_rejects_bad_hex() {
        let secret = b"my-webhook-secret";
        assert!(verify_hmac_sha256(secret, b"x", "not-hex").is_err());
        assert!(verify_hmac_sha256(secret, b"x", "zz").is_err());
        assert!(verify_hmac_sha256(secret, b"x", "é0").is_err());
    }

    // RFC 4231 test vector 2
    #[test]
    fn test_hmac_sha256_rfc4231_vector2() {
        let expected = "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843";
        let computed = compute_hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(computed, expected);
    }

    // -------------------------------------------------------------------
    // Bearer tokens
    // -------------------------------------------------------------------

    #[test]
    fn test_verify_bearer_token() {
        assert!(verify_bearer_token("s3cret", "Bearer s3cret").is_ok());
        assert!(verify_bearer_token("s3cret", "s3cret").is_ok());
        assert!(verify_bearer_token("s3cret", "Bearer s3creT").is_err());
        assert!(verify_bearer_token("s3cret", "Bearer s3cret-longer").is_err());
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"a", b""));
    }

    // -------------------------------------------------------------------
    // Gate
    // -------------------------------------------------------------------

    #[test]
    fn test_gate_normalizes_paths_and_requires_headers() {
        let gate = WebhookGate::new();
        gate.register("hooks/orders/", WebhookAuthMethod::BearerToken {
            token: "tok".to_string(),
        });
        assert_eq!(gate.len(), 1);

        let mut request = WebhookRequest {
            path: "/hooks/orders",
            body: b"{}",
            signature: None,
            authorization: None,
        };
        assert!(matches!(gate.verify(&request), Err(WebhookError::MissingAuth(_))));
        request.authorization = Some("Bearer tok");
        assert!(gate.verify(&request).is_ok());

        request.path = "/hooks/unknown";
        assert!(matches!(gate.verify(&request), Err(WebhookError::PathNotFound(_))));

        assert!(gate.unregister("/hooks/orders").is_some());
        assert!(gate.is_empty());
    }

    async fn adapter() -> Arc<WorkerAdapter<LocalSubstrate, InMemoryFlowStore>> {
        let registry = NodeRegistry::new()
            .with(
                "ingest",
                handler_fn(|_ctx, order: Value| async move {
                    Ok::<_, HandlerError>(json!({ "received": order }))
                }),
            )
            .unwrap();
        let engine = FlowEngine::new(
            Arc::new(LocalSubstrate::new(registry)),
            Arc::new(InMemoryFlowStore::new()),
            EngineConfig::default(),
        );
        let adapter = WorkerAdapter::new(Arc::new(engine));
        let flow = FlowBuilder::new("orders")
            .webhook("/hooks/orders")
            .step(Node::new("ingest").input_path("trigger.order"))
            .build()
            .unwrap();
        adapter.register_flow(flow).await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_dispatch_starts_run_for_signed_request() {
        let adapter = adapter().await;
        let gate = WebhookGate::new();
        gate.register("/hooks/orders", WebhookAuthMethod::HmacSha256 {
            secret: b"shh".to_vec(),
        });

        let body = br#"{"order": 42}"#;
        let sig = format!("sha256={}", compute_hmac_sha256_hex(b"shh", body).unwrap());
        let outcome = gate
            .dispatch(&adapter, WebhookRequest {
                path: "/hooks/orders",
                body,
                signature: Some(&sig),
                authorization: None,
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(
            outcome.state.get_value("ingest").unwrap(),
            &json!({ "received": 42 })
        );
    }

    #[tokio::test]
    async fn test_dispatch_rejects_before_starting_a_run() {
        let adapter = adapter().await;
        let gate = WebhookGate::new();
        gate.register("/hooks/orders", WebhookAuthMethod::HmacSha256 {
            secret: b"shh".to_vec(),
        });

        let result = gate
            .dispatch(&adapter, WebhookRequest {
                path: "/hooks/orders",
                body: br#"{"order": 42}"#,
                signature: Some("sha256=00"),
                authorization: None,
            })
            .await;
        assert!(matches!(result, Err(WebhookError::HmacVerificationFailed)));

        let unsigned_gate = WebhookGate::new();
        unsigned_gate.register("/hooks/orders", WebhookAuthMethod::None);
        let result = unsigned_gate
            .dispatch(&adapter, WebhookRequest {
                path: "/hooks/orders",
                body: b"not json",
                signature: None,
                authorization: None,
            })
            .await;
        assert!(matches!(result, Err(WebhookError::InvalidBody(_))));

        let runs = adapter.engine().store().list_runs("orders", 10).await.unwrap();
        assert!(runs.is_empty());
    }
}
