//! Request routing
//!
//! All security decisions live here, not in handlers: the pair route is the
//! single unauthenticated entry point, everything else passes the bearer
//! token gate and the per-token rate limiter before any handler runs.
//! Handlers themselves are thin: they call into PairingService, the data
//! provider or the store and format a response.

use super::http::{Request, Response};
use super::ServerState;
use crate::audit::{token_prefix, AuditEvent, AuditSink};
use crate::pairing::{hash_token, PairingService};
use crate::provider::{DataProvider, ProviderError};
use crate::ratelimit::RateDecision;
use chrono::Utc;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Body of a pairing submission
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairRequestBody {
    code: String,
    client_name: String,
}

/// Routes requests after TLS termination
pub(crate) struct Router {
    pairing: Arc<PairingService>,
    provider: Arc<dyn DataProvider>,
    audit: Arc<dyn AuditSink>,
    state: Arc<Mutex<ServerState>>,
    device_name: String,
}

impl Router {
    pub(crate) fn new(
        pairing: Arc<PairingService>,
        provider: Arc<dyn DataProvider>,
        audit: Arc<dyn AuditSink>,
        state: Arc<Mutex<ServerState>>,
        device_name: String,
    ) -> Self {
        Self {
            pairing,
            provider,
            audit,
            state,
            device_name,
        }
    }

    /// Dispatch one parsed request
    ///
    /// Ordering within a connection is strict: authentication, then rate
    /// limit, then handler. Audit events are recorded before the response
    /// goes back to the connection handler for writing.
    pub(crate) async fn dispatch(&self, request: &Request, remote_addr: SocketAddr) -> Response {
        debug!("{} {} from {}", request.method, request.path, remote_addr);

        // The one unauthenticated route
        if request.method == "POST" && request.path == "/api/v1/pair" {
            return self.handle_pair(request).await;
        }

        let token = match request.bearer_token() {
            Some(token) => token,
            None => {
                self.audit.record(AuditEvent::AuthFailure {
                    remote_addr: remote_addr.to_string(),
                });
                return Response::error(401, "unauthorized", "Authentication required.");
            }
        };

        if !self.pairing.validate_token(token).await {
            self.audit.record(AuditEvent::AuthFailure {
                remote_addr: remote_addr.to_string(),
            });
            return Response::error(401, "unauthorized", "Authentication required.");
        }

        let token_hash = hash_token(token);
        let prefix = token_prefix(&token_hash);

        let decision = {
            let mut state = self.state.lock().await;
            state.rate.check(&token_hash)
        };
        if decision == RateDecision::Limited {
            warn!("Rate limit exceeded for token {}", prefix);
            self.audit.record(AuditEvent::RateLimited {
                token_prefix: prefix,
            });
            return Response::error(429, "rate_limited", "Rate limit exceeded. Slow down.");
        }

        let response = self.route_authenticated(request).await;

        self.audit.record(AuditEvent::RequestServed {
            method: request.method.clone(),
            path: request.path.clone(),
            token_prefix: prefix,
            status: response.status,
        });

        response
    }

    /// Pairing submission handler
    async fn handle_pair(&self, request: &Request) -> Response {
        let body: PairRequestBody = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(e) => {
                debug!("Unparseable pair request body: {}", e);
                self.audit.record(AuditEvent::PairingFailed {
                    reason: "invalid_body".into(),
                });
                return Response::error(400, "invalid_body", "Request body could not be decoded.");
            }
        };

        match self
            .pairing
            .handle_pair_request(&body.code, &body.client_name)
            .await
        {
            Ok((grant, device)) => {
                self.audit.record(AuditEvent::PairingSucceeded {
                    device_id: device.id,
                    anonymized_name: device.anonymized_name,
                });
                Response::json(200, &grant)
            }
            Err(e) => {
                self.audit.record(AuditEvent::PairingFailed {
                    reason: e.error_code().into(),
                });
                Response::from_protocol_error(&e)
            }
        }
    }

    /// Routes behind the auth and rate-limit gates
    async fn route_authenticated(&self, request: &Request) -> Response {
        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/api/v1/status") => Response::json(
                200,
                &serde_json::json!({
                    "status": "ok",
                    "version": env!("CARGO_PKG_VERSION"),
                    "deviceName": self.device_name,
                    "serverTime": Utc::now(),
                }),
            ),

            ("GET", "/api/v1/devices") => match self.pairing.list_devices().await {
                Ok(devices) => Response::json(200, &devices),
                Err(e) => {
                    error!("Device listing failed: {}", e);
                    Response::error(500, "internal_error", "Internal server error.")
                }
            },

            ("GET", path) => match path.strip_prefix("/api/v1/data/") {
                Some(resource) if !resource.is_empty() => {
                    self.handle_data_query(resource, request.query.as_deref())
                        .await
                }
                _ => Response::not_found(),
            },

            _ => Response::not_found(),
        }
    }

    /// Delegate to the data provider; detail never leaks to the client
    async fn handle_data_query(&self, resource: &str, params: Option<&str>) -> Response {
        match self.provider.query(resource, params).await {
            Ok(value) => Response::json(200, &value),
            Err(ProviderError::NotFound(resource)) => {
                debug!("Unknown data resource: {}", resource);
                Response::not_found()
            }
            Err(ProviderError::Query(detail)) => {
                error!("Data provider query failed: {}", detail);
                Response::error(500, "internal_error", "Internal server error.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::pairing::PairingConfig;
    use crate::provider::StaticProvider;
    use crate::ratelimit::{RateLimitConfig, RateLimiter};
    use crate::server::http::{RequestLimits, RequestReader};
    use crate::store::SqliteDeviceStore;
    use serde_json::json;

    struct Fixture {
        router: Router,
        pairing: Arc<PairingService>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture() -> Fixture {
        let pairing = Arc::new(PairingService::new(
            PairingConfig::default(),
            Box::new(SqliteDeviceStore::in_memory().unwrap()),
        ));
        let audit = Arc::new(MemoryAuditSink::new());
        let provider =
            Arc::new(StaticProvider::new().with_resource("summary", json!({"steps": 8400})));
        let state = Arc::new(Mutex::new(ServerState {
            rate: RateLimiter::new(RateLimitConfig::default()),
            bound_port: Some(8471),
            fingerprint: Some("AB:CD".into()),
        }));

        let router = Router::new(
            pairing.clone(),
            provider,
            audit.clone(),
            state,
            "Test Server".into(),
        );

        Fixture {
            router,
            pairing,
            audit,
        }
    }

    fn request(raw: &[u8]) -> Request {
        RequestReader::new(RequestLimits::default())
            .feed(raw)
            .unwrap()
            .expect("complete request")
    }

    fn get(path: &str, token: Option<&str>) -> Request {
        let auth = token
            .map(|t| format!("Authorization: Bearer {t}\r\n"))
            .unwrap_or_default();
        request(format!("GET {path} HTTP/1.1\r\n{auth}\r\n").as_bytes())
    }

    fn post_pair(code: &str, name: &str) -> Request {
        let body = serde_json::to_string(&json!({"code": code, "clientName": name})).unwrap();
        request(
            format!(
                "POST /api/v1/pair HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .as_bytes(),
        )
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn paired_token(fx: &Fixture) -> String {
        let payload = fx
            .pairing
            .begin_pairing("127.0.0.1", 8471, "AB:CD")
            .await
            .unwrap();
        let response = fx.router.dispatch(&post_pair(&payload.code, "phone"), addr()).await;
        assert_eq!(response.status, 200);

        let text = String::from_utf8(response.to_bytes()).unwrap();
        let json_start = text.find("\r\n\r\n").unwrap() + 4;
        let body: serde_json::Value = serde_json::from_str(&text[json_start..]).unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_pair_route_requires_no_token() {
        let fx = fixture();
        let payload = fx
            .pairing
            .begin_pairing("127.0.0.1", 8471, "AB:CD")
            .await
            .unwrap();

        let response = fx.router.dispatch(&post_pair(&payload.code, "phone"), addr()).await;
        assert_eq!(response.status, 200);
        assert_eq!(fx.audit.count_of("pairing_succeeded"), 1);
    }

    #[tokio::test]
    async fn test_missing_token_yields_401_and_audit() {
        let fx = fixture();
        let response = fx.router.dispatch(&get("/api/v1/status", None), addr()).await;
        assert_eq!(response.status, 401);
        assert_eq!(fx.audit.count_of("auth_failure"), 1);
        assert_eq!(fx.audit.count_of("request_served"), 0);
    }

    #[tokio::test]
    async fn test_invalid_token_yields_401_and_audit() {
        let fx = fixture();
        let response = fx
            .router
            .dispatch(&get("/api/v1/status", Some("bogus")), addr())
            .await;
        assert_eq!(response.status, 401);
        assert_eq!(fx.audit.count_of("auth_failure"), 1);
    }

    #[tokio::test]
    async fn test_status_route_with_valid_token() {
        let fx = fixture();
        let token = paired_token(&fx).await;

        let response = fx
            .router
            .dispatch(&get("/api/v1/status", Some(&token)), addr())
            .await;
        assert_eq!(response.status, 200);

        let text = String::from_utf8(response.to_bytes()).unwrap();
        assert!(text.contains(r#""deviceName":"Test Server""#));
        assert!(text.contains(r#""status":"ok""#));
        assert_eq!(fx.audit.count_of("request_served"), 1);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404_after_auth() {
        let fx = fixture();
        let token = paired_token(&fx).await;

        let response = fx
            .router
            .dispatch(&get("/api/v1/nope", Some(&token)), addr())
            .await;
        assert_eq!(response.status, 404);

        // Still audited as a served (authenticated) request
        assert_eq!(fx.audit.count_of("request_served"), 1);
    }

    #[tokio::test]
    async fn test_data_route_delegates_to_provider() {
        let fx = fixture();
        let token = paired_token(&fx).await;

        let response = fx
            .router
            .dispatch(&get("/api/v1/data/summary", Some(&token)), addr())
            .await;
        assert_eq!(response.status, 200);
        let text = String::from_utf8(response.to_bytes()).unwrap();
        assert!(text.contains("8400"));

        let response = fx
            .router
            .dispatch(&get("/api/v1/data/workouts", Some(&token)), addr())
            .await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_devices_route_redacts_hashes() {
        let fx = fixture();
        let token = paired_token(&fx).await;

        let response = fx
            .router
            .dispatch(&get("/api/v1/devices", Some(&token)), addr())
            .await;
        assert_eq!(response.status, 200);

        let text = String::from_utf8(response.to_bytes()).unwrap();
        assert!(text.contains("anonymizedName"));
        assert!(!text.contains("tokenHash"));
        assert!(!text.contains(&hash_token(&token)));
    }

    #[tokio::test]
    async fn test_rate_limit_yields_429_and_audit() {
        let fx = fixture();
        let token = paired_token(&fx).await;

        for _ in 0..60 {
            let response = fx
                .router
                .dispatch(&get("/api/v1/status", Some(&token)), addr())
                .await;
            assert_eq!(response.status, 200);
        }

        let response = fx
            .router
            .dispatch(&get("/api/v1/status", Some(&token)), addr())
            .await;
        assert_eq!(response.status, 429);
        assert_eq!(fx.audit.count_of("rate_limited"), 1);
        assert_eq!(fx.audit.count_of("request_served"), 60);
    }

    #[tokio::test]
    async fn test_pair_failure_audited_with_stable_code() {
        let fx = fixture();
        let response = fx.router.dispatch(&post_pair("WRONG123", "phone"), addr()).await;
        assert_eq!(response.status, 403);

        let events = fx.audit.events();
        assert!(events.iter().any(|e| matches!(
            e,
            AuditEvent::PairingFailed { reason } if reason == "no_pending_session"
        )));
    }
}
