//! Postgres-backed billing store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::{
    BillingRun, BillingRunResult, CreatePlanVersion, Invoice, InvoiceLine, ListInvoicesFilter,
    ListPlanVersionsFilter, ListSubscriptionsFilter, PlanVersion, PlanVersionFeature, Subscription,
    SubscriptionChange, SubscriptionItem, SubscriptionItemChange, SubscriptionPhase,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{BillingStore, StoreTx, SubscriptionSeed};

/// Phase statuses counted as live by the partial unique index.
const LIVE_STATUSES: &str = "'trialing', 'trial_ended', 'active', 'past_due', 'changing'";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-service"))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, BillingError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| {
                BillingError::Storage(anyhow::anyhow!("Failed to connect: {}", e))
            })?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), BillingError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

fn lock_failed(subscription_id: Uuid, context: &str, e: sqlx::Error) -> BillingError {
    match &e {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("55P03") => {
            BillingError::ConcurrentModification(subscription_id)
        }
        _ => BillingError::Storage(anyhow::anyhow!("Failed to lock {}: {}", context, e)),
    }
}

#[async_trait]
impl BillingStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, BillingError> {
        let tx = self.pool.begin().await.map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;
        Ok(Box::new(PostgresTx { tx }))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, input), fields(project_id = %input.project_id))]
    async fn create_plan_version(
        &self,
        input: CreatePlanVersion,
    ) -> Result<(PlanVersion, Vec<PlanVersionFeature>), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_plan_version"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let plan_version_id = Uuid::new_v4();
        let plan = sqlx::query_as::<_, PlanVersion>(
            r#"
            INSERT INTO plan_versions (plan_version_id, project_id, name, description, version, currency, billing_period, plan_type, trial_days)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING plan_version_id, project_id, name, description, version, currency, billing_period, plan_type, trial_days, created_utc
            "#,
        )
        .bind(plan_version_id)
        .bind(input.project_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.version)
        .bind(&input.currency)
        .bind(input.billing_period.as_str())
        .bind(input.plan_type.as_str())
        .bind(input.trial_days)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to create plan version: {}", e))
        })?;

        let mut features = Vec::with_capacity(input.features.len());
        for (position, feature) in input.features.iter().enumerate() {
            let row = sqlx::query_as::<_, PlanVersionFeature>(
                r#"
                INSERT INTO plan_version_features (feature_id, plan_version_id, feature_slug, name, feature_type, pricing, default_units, usage_limit, aggregation, position)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING feature_id, plan_version_id, feature_slug, name, feature_type, pricing, default_units, usage_limit, aggregation, position, created_utc
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(plan_version_id)
            .bind(&feature.feature_slug)
            .bind(&feature.name)
            .bind(feature.feature_type.as_str())
            .bind(&feature.pricing)
            .bind(feature.default_units)
            .bind(feature.usage_limit)
            .bind(&feature.aggregation)
            .bind(position as i32)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                BillingError::Storage(anyhow::anyhow!("Failed to create plan feature: {}", e))
            })?;
            features.push(row);
        }

        tx.commit().await.map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            plan_version_id = %plan.plan_version_id,
            features = features.len(),
            "Plan version created"
        );
        Ok((plan, features))
    }

    #[instrument(skip(self), fields(project_id = %project_id, plan_version_id = %plan_version_id))]
    async fn get_plan_version(
        &self,
        project_id: Uuid,
        plan_version_id: Uuid,
    ) -> Result<PlanVersion, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan_version"])
            .start_timer();

        let plan = sqlx::query_as::<_, PlanVersion>(
            r#"
            SELECT plan_version_id, project_id, name, description, version, currency, billing_period, plan_type, trial_days, created_utc
            FROM plan_versions
            WHERE project_id = $1 AND plan_version_id = $2
            "#,
        )
        .bind(project_id)
        .bind(plan_version_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to get plan version: {}", e)))?;

        timer.observe_duration();

        plan.ok_or_else(|| BillingError::not_found("plan version", plan_version_id))
    }

    #[instrument(skip(self), fields(plan_version_id = %plan_version_id))]
    async fn plan_features(
        &self,
        plan_version_id: Uuid,
    ) -> Result<Vec<PlanVersionFeature>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["plan_features"])
            .start_timer();

        let features = sqlx::query_as::<_, PlanVersionFeature>(
            r#"
            SELECT feature_id, plan_version_id, feature_slug, name, feature_type, pricing, default_units, usage_limit, aggregation, position, created_utc
            FROM plan_version_features
            WHERE plan_version_id = $1
            ORDER BY position
            "#,
        )
        .bind(plan_version_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to get plan features: {}", e)))?;

        timer.observe_duration();

        Ok(features)
    }

    #[instrument(skip(self, filter), fields(project_id = %project_id))]
    async fn list_plan_versions(
        &self,
        project_id: Uuid,
        filter: ListPlanVersionsFilter,
    ) -> Result<Vec<PlanVersion>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_plan_versions"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let plans = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, PlanVersion>(
                r#"
                SELECT plan_version_id, project_id, name, description, version, currency, billing_period, plan_type, trial_days, created_utc
                FROM plan_versions
                WHERE project_id = $1 AND plan_version_id > $2
                ORDER BY plan_version_id
                LIMIT $3
                "#,
            )
            .bind(project_id)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, PlanVersion>(
                r#"
                SELECT plan_version_id, project_id, name, description, version, currency, billing_period, plan_type, trial_days, created_utc
                FROM plan_versions
                WHERE project_id = $1
                ORDER BY plan_version_id
                LIMIT $2
                "#,
            )
            .bind(project_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to list plan versions: {}", e))
        })?;

        timer.observe_duration();

        Ok(plans)
    }

    #[instrument(skip(self, seed), fields(subscription_id = %seed.subscription.subscription_id))]
    async fn create_subscription(
        &self,
        seed: SubscriptionSeed,
    ) -> Result<Subscription, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let s = &seed.subscription;
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (subscription_id, project_id, customer_id, status, plan_version_id, current_cycle_start_at, current_cycle_end_at, invoice_at, timezone, proration_factor, cancel_at, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING subscription_id, project_id, customer_id, status, plan_version_id, current_cycle_start_at, current_cycle_end_at, invoice_at, timezone, proration_factor, cancel_at, created_utc, updated_utc
            "#,
        )
        .bind(s.subscription_id)
        .bind(s.project_id)
        .bind(s.customer_id)
        .bind(&s.status)
        .bind(s.plan_version_id)
        .bind(s.current_cycle_start_at)
        .bind(s.current_cycle_end_at)
        .bind(s.invoice_at)
        .bind(&s.timezone)
        .bind(s.proration_factor)
        .bind(s.cancel_at)
        .bind(s.created_utc)
        .bind(s.updated_utc)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to create subscription: {}", e))
        })?;

        insert_phase_row(&mut tx, &seed.phase).await?;
        for item in &seed.items {
            insert_item_row(&mut tx, item).await?;
        }

        tx.commit().await.map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    #[instrument(skip(self), fields(project_id = %project_id, subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Subscription, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subscription_id, project_id, customer_id, status, plan_version_id, current_cycle_start_at, current_cycle_end_at, invoice_at, timezone, proration_factor, cancel_at, created_utc, updated_utc
            FROM subscriptions
            WHERE project_id = $1 AND subscription_id = $2
            "#,
        )
        .bind(project_id)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to get subscription: {}", e)))?;

        timer.observe_duration();

        subscription.ok_or_else(|| BillingError::not_found("subscription", subscription_id))
    }

    #[instrument(skip(self, filter), fields(project_id = %project_id))]
    async fn list_subscriptions(
        &self,
        project_id: Uuid,
        filter: ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscriptions"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let status = filter.status.map(|s| s.as_str());

        let subscriptions = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, Subscription>(
                r#"
                SELECT subscription_id, project_id, customer_id, status, plan_version_id, current_cycle_start_at, current_cycle_end_at, invoice_at, timezone, proration_factor, cancel_at, created_utc, updated_utc
                FROM subscriptions
                WHERE project_id = $1
                  AND ($2::text IS NULL OR status = $2)
                  AND ($3::uuid IS NULL OR customer_id = $3)
                  AND subscription_id > $4
                ORDER BY subscription_id
                LIMIT $5
                "#,
            )
            .bind(project_id)
            .bind(status)
            .bind(filter.customer_id)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Subscription>(
                r#"
                SELECT subscription_id, project_id, customer_id, status, plan_version_id, current_cycle_start_at, current_cycle_end_at, invoice_at, timezone, proration_factor, cancel_at, created_utc, updated_utc
                FROM subscriptions
                WHERE project_id = $1
                  AND ($2::text IS NULL OR status = $2)
                  AND ($3::uuid IS NULL OR customer_id = $3)
                ORDER BY subscription_id
                LIMIT $4
                "#,
            )
            .bind(project_id)
            .bind(status)
            .bind(filter.customer_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to list subscriptions: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscriptions)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn subscription_items(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionItem>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["subscription_items"])
            .start_timer();

        let items = sqlx::query_as::<_, SubscriptionItem>(
            r#"
            SELECT item_id, subscription_id, feature_plan_version_id, units, created_utc, updated_utc
            FROM subscription_items
            WHERE subscription_id = $1
            ORDER BY created_utc, item_id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to get subscription items: {}", e))
        })?;

        timer.observe_duration();

        Ok(items)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn live_phase(&self, subscription_id: Uuid) -> Result<SubscriptionPhase, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["live_phase"])
            .start_timer();

        let phase = sqlx::query_as::<_, SubscriptionPhase>(&format!(
            r#"
            SELECT phase_id, subscription_id, plan_version_id, status, when_to_bill, billing_cycle_start, grace_period_days, trial_days, trial_ends_at, started_at, end_at, ended_at, created_utc, updated_utc
            FROM subscription_phases
            WHERE subscription_id = $1 AND status IN ({LIVE_STATUSES})
            "#,
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to get live phase: {}", e)))?;

        timer.observe_duration();

        phase.ok_or_else(|| BillingError::not_found("live phase", subscription_id))
    }

    #[instrument(skip(self), fields(project_id = %project_id, invoice_id = %invoice_id))]
    async fn get_invoice(
        &self,
        project_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, subscription_id, project_id, customer_id, cycle_start_at, cycle_end_at, invoice_type, status, currency, total, due_at, past_due_at, paid_at, created_utc, updated_utc
            FROM invoices
            WHERE project_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(project_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        invoice.ok_or_else(|| BillingError::not_found("invoice", invoice_id))
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn invoice_lines(&self, invoice_id: Uuid) -> Result<Vec<InvoiceLine>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["invoice_lines"])
            .start_timer();

        let lines = sqlx::query_as::<_, InvoiceLine>(
            r#"
            SELECT line_id, invoice_id, feature_plan_version_id, line_type, description, quantity, unit_price, amount, is_prorated, proration_factor, created_utc
            FROM invoice_lines
            WHERE invoice_id = $1
            ORDER BY line_id
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to get invoice lines: {}", e)))?;

        timer.observe_duration();

        Ok(lines)
    }

    #[instrument(skip(self, filter), fields(project_id = %project_id, subscription_id = %subscription_id))]
    async fn list_invoices(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        filter: ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let status = filter.status.map(|s| s.as_str());

        let invoices = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, Invoice>(
                r#"
                SELECT invoice_id, subscription_id, project_id, customer_id, cycle_start_at, cycle_end_at, invoice_type, status, currency, total, due_at, past_due_at, paid_at, created_utc, updated_utc
                FROM invoices
                WHERE project_id = $1 AND subscription_id = $2
                  AND ($3::text IS NULL OR status = $3)
                  AND invoice_id > $4
                ORDER BY invoice_id
                LIMIT $5
                "#,
            )
            .bind(project_id)
            .bind(subscription_id)
            .bind(status)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Invoice>(
                r#"
                SELECT invoice_id, subscription_id, project_id, customer_id, cycle_start_at, cycle_end_at, invoice_type, status, currency, total, due_at, past_due_at, paid_at, created_utc, updated_utc
                FROM invoices
                WHERE project_id = $1 AND subscription_id = $2
                  AND ($3::text IS NULL OR status = $3)
                ORDER BY invoice_id
                LIMIT $4
                "#,
            )
            .bind(project_id)
            .bind(subscription_id)
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to list invoices: {}", e)))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self), fields(project_id = %project_id, change_id = %change_id))]
    async fn get_change(
        &self,
        project_id: Uuid,
        change_id: Uuid,
    ) -> Result<SubscriptionChange, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_change"])
            .start_timer();

        let change = sqlx::query_as::<_, SubscriptionChange>(
            r#"
            SELECT change_id, subscription_id, project_id, previous_plan_version_id, new_plan_version_id, change_type, status, change_at, applied_at, created_utc, updated_utc
            FROM subscription_changes
            WHERE project_id = $1 AND change_id = $2
            "#,
        )
        .bind(project_id)
        .bind(change_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to get change: {}", e)))?;

        timer.observe_duration();

        change.ok_or_else(|| BillingError::not_found("change", change_id))
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn list_changes(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionChange>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_changes"])
            .start_timer();

        let changes = sqlx::query_as::<_, SubscriptionChange>(
            r#"
            SELECT change_id, subscription_id, project_id, previous_plan_version_id, new_plan_version_id, change_type, status, change_at, applied_at, created_utc, updated_utc
            FROM subscription_changes
            WHERE subscription_id = $1
            ORDER BY created_utc, change_id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to list changes: {}", e)))?;

        timer.observe_duration();

        Ok(changes)
    }

    #[instrument(skip(self), fields(change_id = %change_id))]
    async fn item_changes(
        &self,
        change_id: Uuid,
    ) -> Result<Vec<SubscriptionItemChange>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["item_changes"])
            .start_timer();

        let items = sqlx::query_as::<_, SubscriptionItemChange>(
            r#"
            SELECT item_change_id, change_id, change_type, feature_slug, previous_feature_plan_version_id, new_feature_plan_version_id, previous_units, new_units, created_utc
            FROM subscription_item_changes
            WHERE change_id = $1
            ORDER BY item_change_id
            "#,
        )
        .bind(change_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to get item changes: {}", e)))?;

        timer.observe_duration();

        Ok(items)
    }

    #[instrument(skip(self), fields(as_of = %as_of))]
    async fn due_subscriptions(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["due_subscriptions"])
            .start_timer();

        let due = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT s.subscription_id, s.project_id, s.customer_id, s.status, s.plan_version_id, s.current_cycle_start_at, s.current_cycle_end_at, s.invoice_at, s.timezone, s.proration_factor, s.cancel_at, s.created_utc, s.updated_utc
            FROM subscriptions s
            JOIN subscription_phases p
              ON p.subscription_id = s.subscription_id AND p.status IN ({LIVE_STATUSES})
            WHERE s.status IN ({LIVE_STATUSES})
              AND (
                (s.status = 'trialing' AND p.trial_ends_at IS NOT NULL AND p.trial_ends_at <= $1)
                OR (s.invoice_at IS NOT NULL AND s.invoice_at <= $1)
                OR s.current_cycle_end_at <= $1
              )
            ORDER BY s.subscription_id
            LIMIT $2
            "#,
        ))
        .bind(as_of)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to list due subscriptions: {}", e))
        })?;

        timer.observe_duration();

        Ok(due)
    }

    #[instrument(skip(self), fields(as_of = %as_of))]
    async fn open_invoices_past_due(
        &self,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["open_invoices_past_due"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, subscription_id, project_id, customer_id, cycle_start_at, cycle_end_at, invoice_type, status, currency, total, due_at, past_due_at, paid_at, created_utc, updated_utc
            FROM invoices
            WHERE status IN ('draft', 'open') AND past_due_at < $1
            ORDER BY past_due_at, invoice_id
            "#,
        )
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to list past due invoices: {}", e))
        })?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    async fn create_billing_run(&self, run: BillingRun) -> Result<BillingRun, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_billing_run"])
            .start_timer();

        let created = sqlx::query_as::<_, BillingRun>(
            r#"
            INSERT INTO billing_runs (run_id, run_type, status, as_of, started_utc, completed_utc, subscriptions_processed, subscriptions_succeeded, subscriptions_failed, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING run_id, run_type, status, as_of, started_utc, completed_utc, subscriptions_processed, subscriptions_succeeded, subscriptions_failed, error_message
            "#,
        )
        .bind(run.run_id)
        .bind(&run.run_type)
        .bind(&run.status)
        .bind(run.as_of)
        .bind(run.started_utc)
        .bind(run.completed_utc)
        .bind(run.subscriptions_processed)
        .bind(run.subscriptions_succeeded)
        .bind(run.subscriptions_failed)
        .bind(&run.error_message)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to create billing run: {}", e))
        })?;

        timer.observe_duration();

        Ok(created)
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    async fn finish_billing_run(&self, run: &BillingRun) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finish_billing_run"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE billing_runs
            SET status = $2,
                completed_utc = $3,
                subscriptions_processed = $4,
                subscriptions_succeeded = $5,
                subscriptions_failed = $6,
                error_message = $7
            WHERE run_id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(&run.status)
        .bind(run.completed_utc)
        .bind(run.subscriptions_processed)
        .bind(run.subscriptions_succeeded)
        .bind(run.subscriptions_failed)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to finish billing run: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self, result), fields(run_id = %result.run_id))]
    async fn insert_run_result(&self, result: BillingRunResult) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_run_result"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO billing_run_results (result_id, run_id, subscription_id, status, action, invoice_id, error_message, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(result.result_id)
        .bind(result.run_id)
        .bind(result.subscription_id)
        .bind(&result.status)
        .bind(&result.action)
        .bind(result.invoice_id)
        .bind(&result.error_message)
        .bind(result.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to insert run result: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }
}

async fn insert_phase_row(
    tx: &mut Transaction<'static, Postgres>,
    phase: &SubscriptionPhase,
) -> Result<(), BillingError> {
    sqlx::query(
        r#"
        INSERT INTO subscription_phases (phase_id, subscription_id, plan_version_id, status, when_to_bill, billing_cycle_start, grace_period_days, trial_days, trial_ends_at, started_at, end_at, ended_at, created_utc, updated_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(phase.phase_id)
    .bind(phase.subscription_id)
    .bind(phase.plan_version_id)
    .bind(&phase.status)
    .bind(&phase.when_to_bill)
    .bind(phase.billing_cycle_start)
    .bind(phase.grace_period_days)
    .bind(phase.trial_days)
    .bind(phase.trial_ends_at)
    .bind(phase.started_at)
    .bind(phase.end_at)
    .bind(phase.ended_at)
    .bind(phase.created_utc)
    .bind(phase.updated_utc)
    .execute(&mut **tx)
    .await
    .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to insert phase: {}", e)))?;
    Ok(())
}

async fn insert_item_row(
    tx: &mut Transaction<'static, Postgres>,
    item: &SubscriptionItem,
) -> Result<(), BillingError> {
    sqlx::query(
        r#"
        INSERT INTO subscription_items (item_id, subscription_id, feature_plan_version_id, units, created_utc, updated_utc)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(item.item_id)
    .bind(item.subscription_id)
    .bind(item.feature_plan_version_id)
    .bind(item.units)
    .bind(item.created_utc)
    .bind(item.updated_utc)
    .execute(&mut **tx)
    .await
    .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to insert item: {}", e)))?;
    Ok(())
}

/// One open Postgres transaction. Row locks taken here use NOWAIT so a
/// transition racing another process fails fast instead of queueing.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PostgresTx {
    async fn subscription_for_update(
        &mut self,
        subscription_id: Uuid,
    ) -> Result<Subscription, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["subscription_for_update"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subscription_id, project_id, customer_id, status, plan_version_id, current_cycle_start_at, current_cycle_end_at, invoice_at, timezone, proration_factor, cancel_at, created_utc, updated_utc
            FROM subscriptions
            WHERE subscription_id = $1
            FOR UPDATE NOWAIT
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| lock_failed(subscription_id, "subscription", e))?;

        timer.observe_duration();

        subscription.ok_or_else(|| BillingError::not_found("subscription", subscription_id))
    }

    async fn live_phase_for_update(
        &mut self,
        subscription_id: Uuid,
    ) -> Result<SubscriptionPhase, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["live_phase_for_update"])
            .start_timer();

        let phase = sqlx::query_as::<_, SubscriptionPhase>(&format!(
            r#"
            SELECT phase_id, subscription_id, plan_version_id, status, when_to_bill, billing_cycle_start, grace_period_days, trial_days, trial_ends_at, started_at, end_at, ended_at, created_utc, updated_utc
            FROM subscription_phases
            WHERE subscription_id = $1 AND status IN ({LIVE_STATUSES})
            FOR UPDATE NOWAIT
            "#,
        ))
        .bind(subscription_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| lock_failed(subscription_id, "live phase", e))?;

        timer.observe_duration();

        phase.ok_or_else(|| BillingError::not_found("live phase", subscription_id))
    }

    async fn items_for_subscription(
        &mut self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionItem>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["items_for_subscription"])
            .start_timer();

        let items = sqlx::query_as::<_, SubscriptionItem>(
            r#"
            SELECT item_id, subscription_id, feature_plan_version_id, units, created_utc, updated_utc
            FROM subscription_items
            WHERE subscription_id = $1
            ORDER BY created_utc, item_id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to get subscription items: {}", e))
        })?;

        timer.observe_duration();

        Ok(items)
    }

    async fn plan_version(&mut self, plan_version_id: Uuid) -> Result<PlanVersion, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["plan_version"])
            .start_timer();

        let plan = sqlx::query_as::<_, PlanVersion>(
            r#"
            SELECT plan_version_id, project_id, name, description, version, currency, billing_period, plan_type, trial_days, created_utc
            FROM plan_versions
            WHERE plan_version_id = $1
            "#,
        )
        .bind(plan_version_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to get plan version: {}", e)))?;

        timer.observe_duration();

        plan.ok_or_else(|| BillingError::not_found("plan version", plan_version_id))
    }

    async fn plan_features(
        &mut self,
        plan_version_id: Uuid,
    ) -> Result<Vec<PlanVersionFeature>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["plan_features"])
            .start_timer();

        let features = sqlx::query_as::<_, PlanVersionFeature>(
            r#"
            SELECT feature_id, plan_version_id, feature_slug, name, feature_type, pricing, default_units, usage_limit, aggregation, position, created_utc
            FROM plan_version_features
            WHERE plan_version_id = $1
            ORDER BY position
            "#,
        )
        .bind(plan_version_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to get plan features: {}", e)))?;

        timer.observe_duration();

        Ok(features)
    }

    async fn invoice_for_cycle(
        &mut self,
        subscription_id: Uuid,
        cycle_start_at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["invoice_for_cycle"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, subscription_id, project_id, customer_id, cycle_start_at, cycle_end_at, invoice_type, status, currency, total, due_at, past_due_at, paid_at, created_utc, updated_utc
            FROM invoices
            WHERE subscription_id = $1 AND cycle_start_at = $2 AND status <> 'void'
            "#,
        )
        .bind(subscription_id)
        .bind(cycle_start_at)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to get cycle invoice: {}", e))
        })?;

        timer.observe_duration();

        Ok(invoice)
    }

    async fn insert_invoice(
        &mut self,
        invoice: &Invoice,
        lines: &[InvoiceLine],
    ) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO invoices (invoice_id, subscription_id, project_id, customer_id, cycle_start_at, cycle_end_at, invoice_type, status, currency, total, due_at, past_due_at, paid_at, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.subscription_id)
        .bind(invoice.project_id)
        .bind(invoice.customer_id)
        .bind(invoice.cycle_start_at)
        .bind(invoice.cycle_end_at)
        .bind(&invoice.invoice_type)
        .bind(&invoice.status)
        .bind(&invoice.currency)
        .bind(invoice.total)
        .bind(invoice.due_at)
        .bind(invoice.past_due_at)
        .bind(invoice.paid_at)
        .bind(invoice.created_utc)
        .bind(invoice.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                BillingError::ConcurrentModification(invoice.subscription_id)
            }
            _ => BillingError::Storage(anyhow::anyhow!("Failed to insert invoice: {}", e)),
        })?;

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO invoice_lines (line_id, invoice_id, feature_plan_version_id, line_type, description, quantity, unit_price, amount, is_prorated, proration_factor, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(line.line_id)
            .bind(line.invoice_id)
            .bind(line.feature_plan_version_id)
            .bind(&line.line_type)
            .bind(&line.description)
            .bind(line.quantity)
            .bind(line.unit_price)
            .bind(line.amount)
            .bind(line.is_prorated)
            .bind(line.proration_factor)
            .bind(line.created_utc)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                BillingError::Storage(anyhow::anyhow!("Failed to insert invoice line: {}", e))
            })?;
        }

        timer.observe_duration();

        Ok(())
    }

    async fn invoice_for_update(&mut self, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["invoice_for_update"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, subscription_id, project_id, customer_id, cycle_start_at, cycle_end_at, invoice_type, status, currency, total, due_at, past_due_at, paid_at, created_utc, updated_utc
            FROM invoices
            WHERE invoice_id = $1
            FOR UPDATE
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to lock invoice: {}", e)))?;

        timer.observe_duration();

        invoice.ok_or_else(|| BillingError::not_found("invoice", invoice_id))
    }

    async fn update_invoice(&mut self, invoice: &Invoice) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, paid_at = $3, updated_utc = $4
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(&invoice.status)
        .bind(invoice.paid_at)
        .bind(invoice.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to update invoice: {}", e)))?;

        timer.observe_duration();

        Ok(())
    }

    async fn update_subscription(
        &mut self,
        subscription: &Subscription,
    ) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2,
                plan_version_id = $3,
                current_cycle_start_at = $4,
                current_cycle_end_at = $5,
                invoice_at = $6,
                proration_factor = $7,
                cancel_at = $8,
                updated_utc = $9
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(&subscription.status)
        .bind(subscription.plan_version_id)
        .bind(subscription.current_cycle_start_at)
        .bind(subscription.current_cycle_end_at)
        .bind(subscription.invoice_at)
        .bind(subscription.proration_factor)
        .bind(subscription.cancel_at)
        .bind(subscription.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to update subscription: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    async fn insert_phase(&mut self, phase: &SubscriptionPhase) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_phase"])
            .start_timer();

        insert_phase_row(&mut self.tx, phase).await?;

        timer.observe_duration();

        Ok(())
    }

    async fn update_phase(&mut self, phase: &SubscriptionPhase) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_phase"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE subscription_phases
            SET status = $2, ended_at = $3, updated_utc = $4
            WHERE phase_id = $1
            "#,
        )
        .bind(phase.phase_id)
        .bind(&phase.status)
        .bind(phase.ended_at)
        .bind(phase.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to update phase: {}", e)))?;

        timer.observe_duration();

        Ok(())
    }

    async fn insert_item(&mut self, item: &SubscriptionItem) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_item"])
            .start_timer();

        insert_item_row(&mut self.tx, item).await?;

        timer.observe_duration();

        Ok(())
    }

    async fn update_item(&mut self, item: &SubscriptionItem) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_item"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE subscription_items
            SET feature_plan_version_id = $2, units = $3, updated_utc = $4
            WHERE item_id = $1
            "#,
        )
        .bind(item.item_id)
        .bind(item.feature_plan_version_id)
        .bind(item.units)
        .bind(item.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to update item: {}", e)))?;

        timer.observe_duration();

        Ok(())
    }

    async fn delete_item(&mut self, item_id: Uuid) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_item"])
            .start_timer();

        sqlx::query("DELETE FROM subscription_items WHERE item_id = $1")
            .bind(item_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to delete item: {}", e)))?;

        timer.observe_duration();

        Ok(())
    }

    async fn insert_change(
        &mut self,
        change: &SubscriptionChange,
        item_changes: &[SubscriptionItemChange],
    ) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_change"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO subscription_changes (change_id, subscription_id, project_id, previous_plan_version_id, new_plan_version_id, change_type, status, change_at, applied_at, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(change.change_id)
        .bind(change.subscription_id)
        .bind(change.project_id)
        .bind(change.previous_plan_version_id)
        .bind(change.new_plan_version_id)
        .bind(&change.change_type)
        .bind(&change.status)
        .bind(change.change_at)
        .bind(change.applied_at)
        .bind(change.created_utc)
        .bind(change.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to insert change: {}", e)))?;

        for item in item_changes {
            sqlx::query(
                r#"
                INSERT INTO subscription_item_changes (item_change_id, change_id, change_type, feature_slug, previous_feature_plan_version_id, new_feature_plan_version_id, previous_units, new_units, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(item.item_change_id)
            .bind(item.change_id)
            .bind(&item.change_type)
            .bind(&item.feature_slug)
            .bind(item.previous_feature_plan_version_id)
            .bind(item.new_feature_plan_version_id)
            .bind(item.previous_units)
            .bind(item.new_units)
            .bind(item.created_utc)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                BillingError::Storage(anyhow::anyhow!("Failed to insert item change: {}", e))
            })?;
        }

        timer.observe_duration();

        Ok(())
    }

    async fn change_for_update(
        &mut self,
        change_id: Uuid,
    ) -> Result<SubscriptionChange, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["change_for_update"])
            .start_timer();

        let change = sqlx::query_as::<_, SubscriptionChange>(
            r#"
            SELECT change_id, subscription_id, project_id, previous_plan_version_id, new_plan_version_id, change_type, status, change_at, applied_at, created_utc, updated_utc
            FROM subscription_changes
            WHERE change_id = $1
            FOR UPDATE
            "#,
        )
        .bind(change_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to lock change: {}", e)))?;

        timer.observe_duration();

        change.ok_or_else(|| BillingError::not_found("change", change_id))
    }

    async fn update_change(&mut self, change: &SubscriptionChange) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_change"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE subscription_changes
            SET status = $2, applied_at = $3, updated_utc = $4
            WHERE change_id = $1
            "#,
        )
        .bind(change.change_id)
        .bind(&change.status)
        .bind(change.applied_at)
        .bind(change.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to update change: {}", e)))?;

        timer.observe_duration();

        Ok(())
    }

    async fn item_changes(
        &mut self,
        change_id: Uuid,
    ) -> Result<Vec<SubscriptionItemChange>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["item_changes"])
            .start_timer();

        let items = sqlx::query_as::<_, SubscriptionItemChange>(
            r#"
            SELECT item_change_id, change_id, change_type, feature_slug, previous_feature_plan_version_id, new_feature_plan_version_id, previous_units, new_units, created_utc
            FROM subscription_item_changes
            WHERE change_id = $1
            ORDER BY item_change_id
            "#,
        )
        .bind(change_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| BillingError::Storage(anyhow::anyhow!("Failed to get item changes: {}", e)))?;

        timer.observe_duration();

        Ok(items)
    }

    async fn commit(self: Box<Self>) -> Result<(), BillingError> {
        self.tx.commit().await.map_err(|e| {
            BillingError::Storage(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })
    }
}
