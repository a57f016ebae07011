use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use domain::clock::{Clock, SystemClock};
use domain::services::{
    Allocator, ExpirySweeper, InvitationPipeline, InviteExecutor, LogNotifier, NoopInviteExecutor,
    OperatorNotifier, OrderService, PackageCatalog, PaymentReconciler, RetryPolicy,
};
use domain::store::AllocationStore;
use shared::crypto::sha256_hex;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::Config;
use crate::middleware::{metrics_handler, metrics_middleware, require_admin, trace_id};
use crate::routes::{
    admin_accounts, admin_leases, admin_operations, admin_orders, audit_logs, health, orders,
    packages, payments,
};
use crate::services::{HttpInviteExecutor, WebhookNotifier};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn AllocationStore>,
    pub allocator: Allocator,
    pub orders: OrderService,
    pub reconciler: PaymentReconciler,
    pub invitations: InvitationPipeline,
    pub sweeper: ExpirySweeper,
    /// SHA-256 of the configured admin key; `None` disables admin routes.
    pub admin_key_digest: Option<Arc<str>>,
}

impl AppState {
    /// Wires the engine over `store` with explicit collaborators.
    pub fn new(
        config: Config,
        store: Arc<dyn AllocationStore>,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn InviteExecutor>,
        notifier: Arc<dyn OperatorNotifier>,
    ) -> Self {
        let catalog = Arc::new(PackageCatalog::new(config.package_list()));
        let allocator = Allocator::new(store.clone(), clock.clone());
        let orders = OrderService::new(store.clone(), clock.clone(), catalog.clone());

        let invitation = &config.invitation;
        let policy = RetryPolicy {
            max_retries: invitation.max_retries,
            base_backoff: Duration::from_secs(invitation.base_backoff_secs),
            attempt_timeout: Duration::from_secs(invitation.attempt_timeout_secs),
        };
        let pipeline = InvitationPipeline::new(
            store.clone(),
            clock,
            executor,
            notifier.clone(),
            policy,
        )
        .with_enabled(invitation.enabled);

        let reconciler = PaymentReconciler::new(
            allocator.clone(),
            catalog,
            pipeline.clone(),
            notifier,
            config.payment.callback_private_key.clone(),
            chrono::Duration::days(config.allocation.default_lease_days),
        )
        .with_provider_name(config.payment.provider_name.clone());

        let sweeper = ExpirySweeper::new(
            allocator.clone(),
            orders.clone(),
            chrono::Duration::hours(config.payment.pending_order_ttl_hours),
        );

        let admin_key_digest = Some(config.security.admin_api_key.as_str())
            .filter(|key| !key.is_empty())
            .map(|key| Arc::from(sha256_hex(key)));

        Self {
            config: Arc::new(config),
            store,
            allocator,
            orders,
            reconciler,
            invitations: pipeline,
            sweeper,
            admin_key_digest,
        }
    }

    /// Production wiring: system clock, the HTTP invite executor when the
    /// pipeline is enabled, and the operator webhook when one is configured.
    pub fn from_config(
        config: Config,
        store: Arc<dyn AllocationStore>,
    ) -> Result<Self, reqwest::Error> {
        let executor: Arc<dyn InviteExecutor> = if config.invitation.enabled {
            Arc::new(HttpInviteExecutor::new(
                config.invitation.executor_url.clone(),
                Duration::from_secs(config.invitation.attempt_timeout_secs),
            )?)
        } else {
            Arc::new(NoopInviteExecutor)
        };

        let notifier: Arc<dyn OperatorNotifier> = if config.notification.webhook_url.is_empty() {
            Arc::new(LogNotifier)
        } else {
            Arc::new(WebhookNotifier::new(
                config.notification.webhook_url.clone(),
                Some(config.notification.webhook_secret.clone()),
            )?)
        };

        Ok(Self::new(config, store, Arc::new(SystemClock), executor, notifier))
    }
}

pub fn create_app(state: AppState) -> Router {
    let config = state.config.clone();

    let cors = if config.security.cors_origins.is_empty() {
        // Default: allow any origin (for development)
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        use tower_http::cors::AllowOrigin;
        let origins: Vec<_> = config
            .security
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // Admin routes (require X-Admin-Key)
    let admin_routes = Router::new()
        .nest("/api/v1/admin/accounts", admin_accounts::router())
        .nest("/api/v1/admin/leases", admin_leases::router())
        .nest("/api/v1/admin/audit-logs", audit_logs::router())
        .merge(admin_orders::router())
        .merge(admin_operations::router())
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    // Public routes (no authentication required)
    let public_routes = Router::new()
        .route("/api/health", get(health::health_check))
        .route("/api/health/ready", get(health::ready))
        .route("/api/health/live", get(health::live))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/packages", get(packages::list_packages))
        .route("/api/v1/orders", post(orders::create_order))
        .route(
            "/api/v1/orders/:order_ref/status",
            get(orders::get_order_status),
        )
        .route("/api/v1/payments/callback", post(payments::payment_callback));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        // Global middleware (order matters: bottom layers run first)
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.request_timeout_secs,
        )))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_id))
        .layer(cors)
        .with_state(state)
}
