//! Application startup and lifecycle management.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::Router;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::SubscriptionConfig;
use crate::handlers;
use crate::services::{
    BillingRunner, BillingStore, HttpPaymentProvider, HttpUsageReader, PaymentProvider,
    PhaseStateMachine, PostgresStore, SubscriptionChangeCoordinator, TransitionGuard, UsageReader,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: SubscriptionConfig,
    pub store: Arc<dyn BillingStore>,
    pub machine: Arc<PhaseStateMachine>,
    pub coordinator: Arc<SubscriptionChangeCoordinator>,
    pub runner: Arc<BillingRunner>,
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build against Postgres, running migrations first.
    pub async fn build(config: SubscriptionConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build without running migrations. Use this when migrations are
    /// already applied out of band.
    pub async fn build_without_migrations(config: SubscriptionConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: SubscriptionConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        let store = PostgresStore::connect(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            AppError::from(e)
        })?;

        if run_migrations {
            store.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                AppError::from(e)
            })?;
        }

        let usage: Arc<dyn UsageReader> = Arc::new(HttpUsageReader::new(&config.usage_reader)?);
        let payments: Arc<dyn PaymentProvider> =
            Arc::new(HttpPaymentProvider::new(&config.payment_provider)?);

        Self::build_with_store(config, Arc::new(store), usage, payments).await
    }

    /// Build against any store and collaborators. Tests use this with
    /// the in-memory store and mock clients.
    pub async fn build_with_store(
        config: SubscriptionConfig,
        store: Arc<dyn BillingStore>,
        usage: Arc<dyn UsageReader>,
        payments: Arc<dyn PaymentProvider>,
    ) -> Result<Self, AppError> {
        // The state machine and the change coordinator must share one
        // guard, or concurrent transitions on the same subscription
        // would not contend.
        let guard = TransitionGuard::new();
        let machine = Arc::new(PhaseStateMachine::new(
            store.clone(),
            usage,
            payments,
            guard.clone(),
        ));
        let coordinator = Arc::new(SubscriptionChangeCoordinator::new(store.clone(), guard));
        let runner = Arc::new(BillingRunner::new(store.clone(), machine.clone()));

        let state = AppState {
            config: config.clone(),
            store,
            machine,
            coordinator,
            runner,
        };

        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_endpoint))
            .route(
                "/plans",
                post(handlers::plans::create_plan).get(handlers::plans::list_plans),
            )
            .route("/plans/:id", get(handlers::plans::get_plan))
            .route("/plans/:id/price", get(handlers::plans::get_plan_price))
            .route(
                "/subscriptions",
                post(handlers::subscriptions::create_subscription)
                    .get(handlers::subscriptions::list_subscriptions),
            )
            .route(
                "/subscriptions/:id",
                get(handlers::subscriptions::get_subscription),
            )
            .route(
                "/subscriptions/:id/end-trial",
                post(handlers::subscriptions::end_trial),
            )
            .route(
                "/subscriptions/:id/invoice",
                post(handlers::invoices::invoice_subscription),
            )
            .route(
                "/subscriptions/:id/renew",
                post(handlers::subscriptions::renew),
            )
            .route(
                "/subscriptions/:id/cancel",
                post(handlers::subscriptions::cancel),
            )
            .route(
                "/subscriptions/:id/invoices",
                get(handlers::invoices::list_subscription_invoices),
            )
            .route(
                "/subscriptions/:id/changes",
                post(handlers::changes::propose_change).get(handlers::changes::list_changes),
            )
            .route("/changes/:id/apply", post(handlers::changes::apply_change))
            .route(
                "/changes/:id/cancel",
                post(handlers::changes::cancel_change),
            )
            .route("/invoices/:id", get(handlers::invoices::get_invoice))
            .route("/invoices/:id/pay", post(handlers::invoices::pay_invoice))
            .route("/billing/run", post(handlers::billing::run_billing))
            .layer(from_fn(metrics_middleware))
            .layer(from_fn(request_id_middleware))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");

                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                        project_id = tracing::field::Empty,
                    )
                }),
            )
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        Ok(Self {
            port,
            listener,
            router,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        axum::serve(self.listener, self.router).await
    }
}
