//! Common test utilities for z-metering integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use axum_test::TestServer;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};

use z_metering_core::{BillingPeriod, UserId};
use z_metering_engine::{ManualClock, MeteringEngine};
use z_metering_service::{create_router, AppState, ServiceConfig};
use z_metering_store::MemoryStore;

/// Header carrying the service API key.
pub const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// Header naming the calling service.
pub const X_SERVICE_NAME: HeaderName = HeaderName::from_static("x-service-name");

const JWT_SECRET: &str = "test-jwt-secret";
const AUDIENCE: &str = "z-metering";

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The engine behind the server.
    pub engine: Arc<MeteringEngine>,
    /// The engine's clock.
    pub clock: Arc<ManualClock>,
    /// A test user ID for authenticated requests.
    pub test_user_id: UserId,
    /// The service API key for service-to-service requests.
    pub service_api_key: String,
}

impl TestHarness {
    /// Create a new test harness with a fresh in-memory store.
    pub fn new() -> Self {
        let service_api_key = "test-service-key".to_string();
        let clock = Arc::new(ManualClock::new(period_start() + Duration::hours(1)));

        let engine = Arc::new(
            MeteringEngine::builder(Arc::new(MemoryStore::new()))
                .clock(clock.clone())
                .build(),
        );

        let config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            service_api_key: Some(service_api_key.clone()),
            auth_jwt_secret: Some(JWT_SECRET.into()),
            auth_audience: AUDIENCE.into(),
            ..ServiceConfig::default()
        };

        let state = AppState::new(engine.clone(), config);
        let router: Router = create_router(state);

        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            engine,
            clock,
            test_user_id: UserId::generate(),
            service_api_key,
        }
    }

    /// Authorization header for the test user.
    pub fn user_auth_header(&self) -> HeaderValue {
        Self::auth_header_for(&self.test_user_id)
    }

    /// Authorization header for any user.
    pub fn auth_header_for(user_id: &UserId) -> HeaderValue {
        let claims = json!({
            "sub": user_id.to_string(),
            "aud": AUDIENCE,
            "exp": Utc::now().timestamp() + 3600,
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("Failed to sign test token");

        HeaderValue::from_str(&format!("Bearer {token}")).expect("Invalid header value")
    }

    /// The service API key as a header value.
    pub fn api_key_header(&self) -> HeaderValue {
        HeaderValue::from_str(&self.service_api_key).expect("Invalid header value")
    }

    /// Deliver a gateway event and return the response body.
    pub async fn deliver(&self, event: Value) -> Value {
        let response = self
            .server
            .post("/webhooks/gateway")
            .add_header(X_API_KEY, self.api_key_header())
            .add_header(X_SERVICE_NAME, HeaderValue::from_static("gateway-adapter"))
            .json(&event)
            .await;
        response.assert_status_ok();
        response.json()
    }

    /// Subscribe the test user to `plan_id` for March 2026.
    pub async fn subscribe(&self, plan_id: &str) {
        let body = self
            .deliver(created_event("evt_created", &self.test_user_id, plan_id))
            .await;
        assert_eq!(body["outcome"], "applied");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Start of the first billing period used by the harness.
pub fn period_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

/// The harness's first billing period.
pub fn march() -> BillingPeriod {
    BillingPeriod::new(period_start(), period_start() + Duration::days(31)).unwrap()
}

/// The period following [`march`].
pub fn april() -> BillingPeriod {
    let start = march().end;
    BillingPeriod::new(start, start + Duration::days(30)).unwrap()
}

/// A `created` gateway event for March.
pub fn created_event(event_id: &str, user_id: &UserId, plan_id: &str) -> Value {
    json!({
        "event_id": event_id,
        "user_id": user_id.to_string(),
        "gateway_subscription_id": "sub_test",
        "type": "created",
        "plan_id": plan_id,
        "period": march(),
        "occurred_at": period_start(),
    })
}

/// A `renewed` gateway event.
pub fn renewed_event(event_id: &str, user_id: &UserId, period: BillingPeriod) -> Value {
    json!({
        "event_id": event_id,
        "user_id": user_id.to_string(),
        "gateway_subscription_id": "sub_test",
        "type": "renewed",
        "period": period,
        "occurred_at": period.start,
    })
}

/// A gateway event without payload fields.
pub fn bare_event(event_id: &str, user_id: &UserId, kind: &str) -> Value {
    json!({
        "event_id": event_id,
        "user_id": user_id.to_string(),
        "gateway_subscription_id": "sub_test",
        "type": kind,
        "occurred_at": period_start(),
    })
}
