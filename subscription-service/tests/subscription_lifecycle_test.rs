//! Subscription lifecycle integration tests for subscription-service.
//!
//! Drives transitions through the HTTP API with explicit `as_of`
//! instants, so every assertion works on fixed dates.

mod common;

use common::{TestApp, TEST_CUSTOMER_ID};
use rust_decimal::Decimal;
use std::str::FromStr;

const T0: &str = "2026-01-01T00:00:00Z";

/// Helper to create a monthly flat-fee plan for lifecycle tests.
async fn create_test_plan(app: &TestApp, trial_days: i32) -> String {
    let response = app
        .post(
            "/plans",
            &serde_json::json!({
                "name": "Lifecycle Test Plan",
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

/// Helper to create a subscription starting at T0.
async fn create_test_subscription(
    app: &TestApp,
    plan_version_id: &str,
    when_to_bill: &str,
) -> serde_json::Value {
    let response = app
        .post(
            "/subscriptions",
            &serde_json::json!({
                "customer_id": TEST_CUSTOMER_ID,
                "plan_version_id": plan_version_id,
                "when_to_bill": when_to_bill,
                "grace_period_days": 3,
                "start_at": T0,
                "as_of": T0
            }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);
    response.json().await.expect("Failed to parse JSON")
}

fn subscription_id(body: &serde_json::Value) -> String {
    body["subscription"]["subscription_id"]
        .as_str()
        .expect("subscription_id missing")
        .to_string()
}

#[tokio::test]
async fn create_trial_subscription_starts_trialing() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 14).await;

    let body = create_test_subscription(&app, &plan, "pay_in_arrear").await;

    assert_eq!(body["subscription"]["status"], "trialing");
    assert_eq!(body["phase"]["status"], "trialing");
    assert_eq!(body["phase"]["trial_ends_at"], "2026-01-15T00:00:00Z");
    assert!(body["subscription"]["invoice_at"].is_null());
    assert_eq!(body["subscription"]["current_cycle_start_at"], T0);
    assert_eq!(
        body["subscription"]["current_cycle_end_at"],
        "2026-02-01T00:00:00Z"
    );

    let items = body["items"].as_array().expect("items missing");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["units"], "1");
}

#[tokio::test]
async fn arrear_subscription_without_trial_bills_at_cycle_end() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 0).await;

    let body = create_test_subscription(&app, &plan, "pay_in_arrear").await;

    assert_eq!(body["subscription"]["status"], "active");
    assert!(body["phase"]["trial_ends_at"].is_null());
    assert_eq!(body["subscription"]["invoice_at"], "2026-02-01T00:00:00Z");
}

#[tokio::test]
async fn advance_subscription_without_trial_bills_at_cycle_start() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 0).await;

    let body = create_test_subscription(&app, &plan, "pay_in_advance").await;

    assert_eq!(body["subscription"]["status"], "active");
    assert_eq!(body["subscription"]["invoice_at"], T0);
}

#[tokio::test]
async fn end_trial_before_trial_ends_fails() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 14).await;
    let body = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    let id = subscription_id(&body);

    let response = app
        .post(
            &format!("/subscriptions/{}/end-trial", id),
            &serde_json::json!({"as_of": "2026-01-10T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 400);
    let error: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert!(error["error"]
        .as_str()
        .unwrap()
        .contains("trial runs until"));

    // Still trialing
    let response = app.get(&format!("/subscriptions/{}", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "trialing");
}

#[tokio::test]
async fn end_trial_activates_arrear_subscription() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 14).await;
    let body = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    let id = subscription_id(&body);

    let response = app
        .post(
            &format!("/subscriptions/{}/end-trial", id),
            &serde_json::json!({"as_of": "2026-01-15T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "active");

    // Billing restarts at the trial end and runs to the next anchor day.
    assert_eq!(
        body["subscription"]["current_cycle_start_at"],
        "2026-01-15T00:00:00Z"
    );
    assert_eq!(
        body["subscription"]["current_cycle_end_at"],
        "2026-02-01T00:00:00Z"
    );
    assert_eq!(body["subscription"]["invoice_at"], "2026-02-01T00:00:00Z");

    // 17 of the 31 days of the anchored month
    let factor =
        Decimal::from_str(body["subscription"]["proration_factor"].as_str().unwrap()).unwrap();
    assert_eq!(factor, Decimal::from_str("0.548387097").unwrap());
}

#[tokio::test]
async fn end_trial_in_advance_waits_for_payment() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 14).await;
    let body = create_test_subscription(&app, &plan, "pay_in_advance").await;
    let id = subscription_id(&body);

    let response = app
        .post(
            &format!("/subscriptions/{}/end-trial", id),
            &serde_json::json!({"as_of": "2026-01-15T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "trial_ended");
    assert_eq!(body["subscription"]["invoice_at"], "2026-01-15T00:00:00Z");
}

#[tokio::test]
async fn renew_before_cycle_end_fails() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 0).await;
    let body = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    let id = subscription_id(&body);

    let response = app
        .post(
            &format!("/subscriptions/{}/renew", id),
            &serde_json::json!({"as_of": "2026-01-20T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 400);
    let error: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert!(error["error"].as_str().unwrap().contains("has not ended"));
}

#[tokio::test]
async fn renew_arrear_requires_the_cycle_invoice() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 0).await;
    let body = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    let id = subscription_id(&body);

    let response = app
        .post(
            &format!("/subscriptions/{}/renew", id),
            &serde_json::json!({"as_of": "2026-02-01T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 400);
    let error: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert!(error["error"]
        .as_str()
        .unwrap()
        .contains("invoice the current cycle first"));
}

#[tokio::test]
async fn renew_rolls_the_cycle_forward() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 0).await;
    let body = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    let id = subscription_id(&body);

    let response = app
        .post(
            &format!("/subscriptions/{}/invoice", id),
            &serde_json::json!({"as_of": "2026-02-01T00:00:00Z"}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);

    let response = app
        .post(
            &format!("/subscriptions/{}/renew", id),
            &serde_json::json!({"as_of": "2026-02-01T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
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
    assert_eq!(body["subscription"]["invoice_at"], "2026-03-01T00:00:00Z");
}

#[tokio::test]
async fn renew_advance_subscription_works_without_invoice() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 0).await;
    let body = create_test_subscription(&app, &plan, "pay_in_advance").await;
    let id = subscription_id(&body);

    let response = app
        .post(
            &format!("/subscriptions/{}/renew", id),
            &serde_json::json!({"as_of": "2026-02-01T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(
        body["subscription"]["current_cycle_end_at"],
        "2026-03-01T00:00:00Z"
    );
    assert_eq!(body["subscription"]["invoice_at"], "2026-02-01T00:00:00Z");
}

#[tokio::test]
async fn cancel_immediately_ends_the_subscription() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 0).await;
    let body = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    let id = subscription_id(&body);

    let response = app
        .post(
            &format!("/subscriptions/{}/cancel", id),
            &serde_json::json!({"effective": "immediate", "as_of": "2026-01-10T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "canceled");
    assert_eq!(body["subscription"]["cancel_at"], "2026-01-10T00:00:00Z");

    // Terminal subscriptions have no live phase
    assert!(body["phase"].is_null());
}

#[tokio::test]
async fn cancel_at_end_of_cycle_runs_out_the_clock() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 0).await;
    let body = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    let id = subscription_id(&body);

    let response = app
        .post(
            &format!("/subscriptions/{}/cancel", id),
            &serde_json::json!({"effective": "end_of_cycle", "as_of": "2026-01-10T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "active");
    assert_eq!(body["subscription"]["cancel_at"], "2026-02-01T00:00:00Z");

    // The last cycle still gets invoiced, then renewal retires it.
    let response = app
        .post(
            &format!("/subscriptions/{}/invoice", id),
            &serde_json::json!({"as_of": "2026-02-01T00:00:00Z"}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);

    let response = app
        .post(
            &format!("/subscriptions/{}/renew", id),
            &serde_json::json!({"as_of": "2026-02-01T00:00:00Z"}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "canceled");
    assert!(body["phase"].is_null());
}

#[tokio::test]
async fn canceled_subscription_rejects_transitions() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 0).await;
    let body = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    let id = subscription_id(&body);

    let response = app
        .post(
            &format!("/subscriptions/{}/cancel", id),
            &serde_json::json!({"effective": "immediate", "as_of": "2026-01-10T00:00:00Z"}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let response = app
        .post(
            &format!("/subscriptions/{}/renew", id),
            &serde_json::json!({"as_of": "2026-02-01T00:00:00Z"}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 400);

    let response = app
        .post(
            &format!("/subscriptions/{}/cancel", id),
            &serde_json::json!({"effective": "immediate", "as_of": "2026-02-01T00:00:00Z"}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn subscription_is_scoped_to_its_project() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 0).await;
    let body = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    let id = subscription_id(&body);

    let response = app
        .get_as(
            "33333333-3333-3333-3333-333333333333",
            &format!("/subscriptions/{}", id),
        )
        .await;

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn list_subscriptions_filters_by_status() {
    let app = TestApp::spawn().await;
    let plan = create_test_plan(&app, 14).await;
    create_test_subscription(&app, &plan, "pay_in_arrear").await;

    let no_trial_plan = create_test_plan(&app, 0).await;
    create_test_subscription(&app, &no_trial_plan, "pay_in_arrear").await;

    let response = app.get("/subscriptions?status=trialing").await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let subscriptions = body["subscriptions"].as_array().unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0]["status"], "trialing");

    let response = app.get("/subscriptions").await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscriptions"].as_array().unwrap().len(), 2);
}
