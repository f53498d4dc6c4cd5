//! Billing run integration tests for subscription-service.
//!
//! The runner sweeps due subscriptions in trial-end, invoice, renew
//! order and then flags overdue invoices, recording one result row per
//! action taken.

mod common;

use common::{TestApp, TEST_CUSTOMER_ID};

const T0: &str = "2026-01-01T00:00:00Z";

/// Helper to create a monthly flat-fee plan.
async fn create_flat_plan(app: &TestApp, trial_days: i32) -> String {
    let response = app
        .post(
            "/plans",
            &serde_json::json!({
                "name": "Sweep Test Plan",
                "currency": "USD",
                "billing_period": "month",
                "plan_type": "recurring",
                "trial_days": trial_days,
                "features": [{
                    "feature_slug": "base",
                    "name": "Base fee",
                    "feature_type": "flat",
                    "pricing": {"type": "flat", "price": "50"},
                    "default_units": "1"
                }]
            }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    body["plan"]["plan_version_id"]
        .as_str()
        .expect("plan_version_id missing")
        .to_string()
}

/// Helper to create a plan with a metered feature.
async fn create_metered_plan(app: &TestApp) -> String {
    let response = app
        .post(
            "/plans",
            &serde_json::json!({
                "name": "Metered Sweep Plan",
                "currency": "USD",
                "billing_period": "month",
                "plan_type": "recurring",
                "features": [{
                    "feature_slug": "api_calls",
                    "name": "API calls",
                    "feature_type": "usage",
                    "pricing": {"type": "usage", "mode": "unit", "rate": "0.10"},
                    "aggregation": "sum"
                }]
            }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    body["plan"]["plan_version_id"]
        .as_str()
        .expect("plan_version_id missing")
        .to_string()
}

/// Helper to create an arrear subscription starting at T0.
async fn create_test_subscription(
    app: &TestApp,
    plan_version_id: &str,
    grace_period_days: i32,
) -> String {
    let response = app
        .post(
            "/subscriptions",
            &serde_json::json!({
                "customer_id": TEST_CUSTOMER_ID,
                "plan_version_id": plan_version_id,
                "when_to_bill": "pay_in_arrear",
                "grace_period_days": grace_period_days,
                "start_at": T0,
                "as_of": T0
            }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    body["subscription"]["subscription_id"]
        .as_str()
        .expect("subscription_id missing")
        .to_string()
}

async fn run_billing(app: &TestApp, as_of: &str) -> serde_json::Value {
    let response = app
        .post("/billing/run", &serde_json::json!({"as_of": as_of}))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    response.json().await.expect("Failed to parse JSON")
}

fn actions(body: &serde_json::Value, subscription_id: &str) -> Vec<(String, String)> {
    body["results"]
        .as_array()
        .expect("results missing")
        .iter()
        .filter(|row| row["subscription_id"] == subscription_id)
        .map(|row| {
            (
                row["action"].as_str().unwrap().to_string(),
                row["status"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn billing_run_advances_a_trial_subscription_end_to_end() {
    let app = TestApp::spawn().await;
    let plan = create_flat_plan(&app, 14).await;
    let id = create_test_subscription(&app, &plan, 3).await;

    let body = run_billing(&app, "2026-02-01T00:00:00Z").await;

    assert_eq!(body["run"]["status"], "completed");
    assert_eq!(body["run"]["run_type"], "manual");
    assert_eq!(body["run"]["subscriptions_processed"], 1);
    assert_eq!(body["run"]["subscriptions_succeeded"], 1);
    assert_eq!(body["run"]["subscriptions_failed"], 0);

    assert_eq!(
        actions(&body, &id),
        vec![
            ("end_trial".to_string(), "succeeded".to_string()),
            ("invoice".to_string(), "succeeded".to_string()),
            ("renew".to_string(), "succeeded".to_string()),
        ]
    );

    let response = app.get(&format!("/subscriptions/{}", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "active");
    assert_eq!(
        body["subscription"]["current_cycle_start_at"],
        "2026-02-01T00:00:00Z"
    );
    assert_eq!(
        body["subscription"]["current_cycle_end_at"],
        "2026-03-01T00:00:00Z"
    );

    // The post-trial stub cycle got its invoice
    let response = app.get(&format!("/subscriptions/{}/invoices", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let invoices = body["invoices"].as_array().unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0]["cycle_start_at"], "2026-01-15T00:00:00Z");
    assert_eq!(invoices[0]["due_at"], "2026-02-01T00:00:00Z");
}

#[tokio::test]
async fn billing_run_without_due_work_completes_empty() {
    let app = TestApp::spawn().await;
    let plan = create_flat_plan(&app, 0).await;
    create_test_subscription(&app, &plan, 3).await;

    // Mid-cycle: nothing is due yet
    let body = run_billing(&app, "2026-01-15T00:00:00Z").await;

    assert_eq!(body["run"]["status"], "completed");
    assert_eq!(body["run"]["subscriptions_processed"], 0);
    assert_eq!(body["results"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn billing_run_defaults_to_manual() {
    let app = TestApp::spawn().await;

    let response = app.post_empty("/billing/run").await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["run"]["run_type"], "manual");
    assert_eq!(body["run"]["status"], "completed");
}

#[tokio::test]
async fn scheduled_run_records_its_type() {
    let app = TestApp::spawn().await;

    let response = app
        .post(
            "/billing/run",
            &serde_json::json!({"run_type": "scheduled", "as_of": "2026-01-15T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["run"]["run_type"], "scheduled");
}

#[tokio::test]
async fn billing_run_marks_overdue_invoices_past_due() {
    let app = TestApp::spawn().await;
    let plan = create_flat_plan(&app, 0).await;
    let id = create_test_subscription(&app, &plan, 0).await;

    // First sweep invoices the completed cycle and renews
    let body = run_billing(&app, "2026-02-01T00:00:00Z").await;
    assert_eq!(
        actions(&body, &id),
        vec![
            ("invoice".to_string(), "succeeded".to_string()),
            ("renew".to_string(), "succeeded".to_string()),
        ]
    );

    // A day later the unpaid invoice crosses its zero-day grace period
    let body = run_billing(&app, "2026-02-02T00:00:00Z").await;
    assert_eq!(
        actions(&body, &id),
        vec![("mark_past_due".to_string(), "succeeded".to_string())]
    );

    let response = app.get(&format!("/subscriptions/{}", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "past_due");

    let response = app.get(&format!("/subscriptions/{}/invoices", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoices"][0]["status"], "past_due");

    // A past-due subscription is swept but no transition applies
    let body = run_billing(&app, "2026-03-01T00:00:00Z").await;
    assert_eq!(
        actions(&body, &id),
        vec![("noop".to_string(), "skipped".to_string())]
    );
}

#[tokio::test]
async fn failed_subscription_does_not_abort_the_run() {
    let app = TestApp::spawn().await;
    let flat_plan = create_flat_plan(&app, 0).await;
    let healthy = create_test_subscription(&app, &flat_plan, 3).await;
    let metered_plan = create_metered_plan(&app).await;
    let failing = create_test_subscription(&app, &metered_plan, 3).await;

    app.usage.set_failing(true);
    let body = run_billing(&app, "2026-02-01T00:00:00Z").await;

    assert_eq!(body["run"]["status"], "completed");
    assert_eq!(body["run"]["subscriptions_processed"], 2);
    assert_eq!(body["run"]["subscriptions_succeeded"], 1);
    assert_eq!(body["run"]["subscriptions_failed"], 1);

    assert_eq!(
        actions(&body, &healthy),
        vec![
            ("invoice".to_string(), "succeeded".to_string()),
            ("renew".to_string(), "succeeded".to_string()),
        ]
    );
    let failed = actions(&body, &failing);
    assert_eq!(failed, vec![("invoice".to_string(), "failed".to_string())]);

    // The failed subscription is left intact for the next sweep
    let response = app.get(&format!("/subscriptions/{}", failing)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "active");
    assert_eq!(
        body["subscription"]["current_cycle_end_at"],
        "2026-02-01T00:00:00Z"
    );

    let response = app.get(&format!("/subscriptions/{}/invoices", failing)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoices"].as_array().unwrap().len(), 0);

    // Recovers once the reader is back
    app.usage.set_failing(false);
    let body = run_billing(&app, "2026-02-01T00:00:00Z").await;
    assert_eq!(
        actions(&body, &failing),
        vec![
            ("invoice".to_string(), "succeeded".to_string()),
            ("renew".to_string(), "succeeded".to_string()),
        ]
    );
}
