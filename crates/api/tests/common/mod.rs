//! Common test utilities for integration tests.
//!
//! The application runs over the in-memory store with a manual clock, so
//! these tests need no database. Store-level behavior against PostgreSQL is
//! covered in the persistence crate.

// Not every integration test uses every helper.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use domain::clock::ManualClock;
use domain::models::{InvitationStatus, Order};
use domain::services::invitation::ScriptedInviteExecutor;
use domain::services::{InviteExecutor, NoopInviteExecutor, RecordingNotifier};
use domain::store::{AllocationStore, InMemoryStore};
use fake::faker::internet::en::SafeEmail;
use fake::Fake;
use seatlease_api::app::{create_app, AppState};
use seatlease_api::config::{
    AllocationConfig, Config, DatabaseConfig, InvitationConfig, JobsConfig, LoggingConfig,
    NotificationConfig, PackageConfig, PaymentConfig, SecurityConfig, ServerConfig,
};
use seatlease_api::routes::payments::{EVENT_HEADER, SIGNATURE_HEADER};
use serde_json::Value;
use shared::crypto::hmac_sha256_hex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const ADMIN_KEY: &str = "integration-admin-key";
pub const CALLBACK_KEY: &str = "integration-callback-key";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Test configuration with a short catalogue and immediate invite retries.
pub fn test_config(invitations_enabled: bool) -> Config {
    let mut packages = HashMap::new();
    packages.insert(
        "1_week".to_string(),
        PackageConfig {
            name: "1 Week".to_string(),
            price: 15_000,
            duration_days: 7,
        },
    );
    packages.insert(
        "1_month".to_string(),
        PackageConfig {
            name: "1 Month".to_string(),
            price: 50_000,
            duration_days: 30,
        },
    );

    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            request_timeout_secs: 30,
        },
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 0,
            connect_timeout_secs: 1,
            idle_timeout_secs: 60,
        },
        logging: LoggingConfig {
            level: "warn".to_string(),
            format: "pretty".to_string(),
        },
        security: SecurityConfig {
            cors_origins: vec![],
            admin_api_key: ADMIN_KEY.to_string(),
        },
        allocation: AllocationConfig {
            default_lease_days: 30,
        },
        payment: PaymentConfig {
            callback_private_key: CALLBACK_KEY.to_string(),
            provider_name: "test_gateway".to_string(),
            pending_order_ttl_hours: 24,
        },
        invitation: InvitationConfig {
            enabled: invitations_enabled,
            executor_url: String::new(),
            max_retries: 2,
            base_backoff_secs: 0,
            attempt_timeout_secs: 5,
        },
        notification: NotificationConfig::default(),
        jobs: JobsConfig {
            lease_expiry_interval_minutes: 60,
            stock_retry_interval_minutes: 30,
            invitation_resume_interval_minutes: 15,
        },
        packages,
    }
}

/// A running application over the in-memory store.
pub struct TestApp {
    pub state: AppState,
    pub store: InMemoryStore,
    pub clock: Arc<ManualClock>,
    pub notifier: RecordingNotifier,
}

impl TestApp {
    /// Invitations disabled; assigned orders stay at `account_assigned`.
    pub fn new() -> Self {
        Self::build(test_config(false), Arc::new(NoopInviteExecutor))
    }

    /// Invitations enabled against a scripted executor.
    pub fn with_executor(executor: ScriptedInviteExecutor) -> Self {
        Self::build(test_config(true), Arc::new(executor))
    }

    fn build(config: Config, executor: Arc<dyn InviteExecutor>) -> Self {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(start_time()));
        let notifier = RecordingNotifier::new();
        let state = AppState::new(
            config,
            Arc::new(store.clone()),
            clock.clone(),
            executor,
            Arc::new(notifier.clone()),
        );
        Self {
            state,
            store,
            clock,
            notifier,
        }
    }

    pub fn router(&self) -> Router {
        create_app(self.state.clone())
    }

    pub async fn request(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn admin(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("X-Admin-Key", ADMIN_KEY)
            .header("X-Admin-Actor", "integration");
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.request(request).await
    }

    /// Posts a payment callback signed with the configured key.
    pub async fn callback(&self, payload: Value) -> (StatusCode, Value) {
        let body = payload.to_string();
        let signature = sign(&body);
        self.request(
            Request::post("/api/v1/payments/callback")
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, signature)
                .header(EVENT_HEADER, "payment_status")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    pub async fn add_account(&self, identity: &str, capacity: i32) -> Value {
        let (status, json) = self
            .admin(
                "POST",
                "/api/v1/admin/accounts",
                Some(serde_json::json!({ "identity": identity, "capacity": capacity })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create account: {}", json);
        json
    }

    pub async fn create_order(&self, email: &str, package_id: &str) -> String {
        let (status, json) = self
            .post_json(
                "/api/v1/orders",
                serde_json::json!({ "customer_email": email, "package_id": package_id }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create order: {}", json);
        json["order_ref"].as_str().unwrap().to_string()
    }

    /// Creates an order and delivers a signed `PAID` callback for it.
    pub async fn paid_order(&self, email: &str, package_id: &str) -> String {
        let order_ref = self.create_order(email, package_id).await;
        let (status, json) = self
            .callback(serde_json::json!({
                "reference": format!("TX-{}", order_ref),
                "merchant_ref": order_ref,
                "status": "PAID",
                "paid_at": start_time().timestamp(),
            }))
            .await;
        assert_eq!(status, StatusCode::OK, "paid callback: {}", json);
        order_ref
    }

    pub async fn order(&self, order_ref: &str) -> Order {
        self.store
            .find_order_by_ref(order_ref)
            .await
            .unwrap()
            .expect("order exists")
    }

    /// Polls until the order reaches `status` or two seconds pass.
    pub async fn wait_for_invitation(&self, order_ref: &str, status: InvitationStatus) -> Order {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let order = self.order(order_ref).await;
            if order.invitation_status == status || tokio::time::Instant::now() > deadline {
                return order;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn random_email() -> String {
    SafeEmail().fake::<String>().to_lowercase()
}

pub fn sign(body: &str) -> String {
    hmac_sha256_hex(CALLBACK_KEY, body.as_bytes())
}
