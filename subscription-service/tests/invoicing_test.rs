//! Invoicing and payment integration tests for subscription-service.

mod common;

use chrono::{DateTime, Utc};
use common::{TestApp, TEST_CUSTOMER_ID};
use rust_decimal::Decimal;
use std::str::FromStr;
use subscription_service::services::ChargeOutcome;

const T0: &str = "2026-01-01T00:00:00Z";

/// Helper to create a plan with a flat fee and a metered feature.
async fn create_metered_plan(app: &TestApp, trial_days: i32, usage_limit: Option<&str>) -> String {
    let response = app
        .post(
            "/plans",
            &serde_json::json!({
                "name": "Metered Test Plan",
                "currency": "USD",
                "billing_period": "month",
                "plan_type": "recurring",
                "trial_days": trial_days,
                "features": [
                    {
                        "feature_slug": "base",
                        "name": "Base fee",
                        "feature_type": "flat",
                        "pricing": {"type": "flat", "price": "50"},
                        "default_units": "1"
                    },
                    {
                        "feature_slug": "api_calls",
                        "name": "API calls",
                        "feature_type": "usage",
                        "pricing": {"type": "usage", "mode": "unit", "rate": "0.10"},
                        "usage_limit": usage_limit,
                        "aggregation": "sum"
                    }
                ]
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
) -> String {
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
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    body["subscription"]["subscription_id"]
        .as_str()
        .expect("subscription_id missing")
        .to_string()
}

async fn invoice(app: &TestApp, subscription_id: &str, as_of: &str) -> reqwest::Response {
    app.post(
        &format!("/subscriptions/{}/invoice", subscription_id),
        &serde_json::json!({"as_of": as_of}),
    )
    .await
}

fn amount(value: &serde_json::Value) -> Decimal {
    Decimal::from_str(value.as_str().expect("expected a decimal string")).unwrap()
}

fn line<'a>(body: &'a serde_json::Value, line_type: &str) -> &'a serde_json::Value {
    body["lines"]
        .as_array()
        .expect("lines missing")
        .iter()
        .find(|line| line["line_type"] == line_type)
        .unwrap_or_else(|| panic!("no {} line", line_type))
}

#[tokio::test]
async fn invoice_before_billing_instant_fails() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 0, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_arrear").await;

    let response = invoice(&app, &id, "2026-01-15T00:00:00Z").await;

    assert_eq!(response.status().as_u16(), 400);
    let error: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert!(error["error"]
        .as_str()
        .unwrap()
        .contains("not ready to be invoiced"));

    // Nothing was persisted
    let response = app.get(&format!("/subscriptions/{}/invoices", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoices"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn arrear_invoice_bills_flat_and_usage() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 0, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    app.usage
        .set_sum(app.customer_id(), "api_calls", Decimal::from(120));

    let response = invoice(&app, &id, "2026-02-01T00:00:00Z").await;

    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoice"]["invoice_type"], "hybrid");
    assert_eq!(body["invoice"]["status"], "draft");
    assert_eq!(body["invoice"]["currency"], "USD");
    assert_eq!(amount(&body["invoice"]["total"]), Decimal::from(62));
    assert_eq!(body["invoice"]["due_at"], "2026-02-01T00:00:00Z");
    assert_eq!(body["invoice"]["past_due_at"], "2026-02-04T00:00:00Z");

    let flat = line(&body, "flat");
    assert_eq!(amount(&flat["amount"]), Decimal::from(50));
    assert_eq!(flat["is_prorated"], false);

    let usage = line(&body, "usage");
    assert_eq!(amount(&usage["quantity"]), Decimal::from(120));
    assert_eq!(amount(&usage["unit_price"]), Decimal::from_str("0.10").unwrap());
    assert_eq!(amount(&usage["amount"]), Decimal::from(12));

    // Usage was read over the completed cycle
    let windows = app.usage.queried_windows();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].0, "api_calls");
    assert_eq!(windows[0].1, T0.parse::<DateTime<Utc>>().unwrap());
    assert_eq!(
        windows[0].2,
        "2026-02-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
    );

    // The billing instant is consumed until the next renewal
    let response = app.get(&format!("/subscriptions/{}", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert!(body["subscription"]["invoice_at"].is_null());
}

#[tokio::test]
async fn advance_first_invoice_skips_usage() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 0, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_advance").await;
    app.usage
        .set_sum(app.customer_id(), "api_calls", Decimal::from(120));

    let response = invoice(&app, &id, T0).await;

    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoice"]["invoice_type"], "flat");
    assert_eq!(body["lines"].as_array().unwrap().len(), 1);
    assert_eq!(amount(&body["invoice"]["total"]), Decimal::from(50));

    // No consumption exists before the subscription started
    assert!(app.usage.queried_windows().is_empty());

    let response = app.get(&format!("/subscriptions/{}", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["invoice_at"], "2026-02-01T00:00:00Z");
}

#[tokio::test]
async fn advance_second_invoice_bills_the_previous_cycle_usage() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 0, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_advance").await;

    let response = invoice(&app, &id, T0).await;
    assert_eq!(response.status().as_u16(), 201);

    let response = app
        .post(
            &format!("/subscriptions/{}/renew", id),
            &serde_json::json!({"as_of": "2026-02-01T00:00:00Z"}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 200);

    app.usage
        .set_sum(app.customer_id(), "api_calls", Decimal::from(200));
    let response = invoice(&app, &id, "2026-02-01T00:00:00Z").await;

    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    // Billing in advance keeps the flat label even with trailing usage lines
    assert_eq!(body["invoice"]["invoice_type"], "flat");
    assert_eq!(body["lines"].as_array().unwrap().len(), 2);

    let usage = line(&body, "usage");
    assert_eq!(amount(&usage["quantity"]), Decimal::from(200));
    assert_eq!(amount(&usage["amount"]), Decimal::from(20));

    // Usage is billed one cycle behind
    let windows = app.usage.queried_windows();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].1, T0.parse::<DateTime<Utc>>().unwrap());
    assert_eq!(
        windows[0].2,
        "2026-02-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
    );
}

#[tokio::test]
async fn invoicing_twice_returns_the_same_invoice() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 0, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_arrear").await;

    let response = invoice(&app, &id, "2026-02-01T00:00:00Z").await;
    assert_eq!(response.status().as_u16(), 201);
    let first: serde_json::Value = response.json().await.expect("Failed to parse JSON");

    let response = invoice(&app, &id, "2026-02-01T00:00:00Z").await;
    assert_eq!(response.status().as_u16(), 201);
    let second: serde_json::Value = response.json().await.expect("Failed to parse JSON");

    assert_eq!(
        first["invoice"]["invoice_id"],
        second["invoice"]["invoice_id"]
    );

    let response = app.get(&format!("/subscriptions/{}/invoices", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoices"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn usage_reader_outage_fails_invoicing() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 0, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    app.usage.set_failing(true);

    let response = invoice(&app, &id, "2026-02-01T00:00:00Z").await;

    assert_eq!(response.status().as_u16(), 502);
    let error: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert!(error["error"].as_str().unwrap().contains("Bad Gateway"));

    let response = app.get(&format!("/subscriptions/{}/invoices", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoices"].as_array().unwrap().len(), 0);

    // Recovers once the reader is back
    app.usage.set_failing(false);
    let response = invoice(&app, &id, "2026-02-01T00:00:00Z").await;
    assert_eq!(response.status().as_u16(), 201);
}

#[tokio::test]
async fn usage_is_clamped_to_the_limit() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 0, Some("100")).await;
    let id = create_test_subscription(&app, &plan, "pay_in_arrear").await;
    app.usage
        .set_sum(app.customer_id(), "api_calls", Decimal::from(250));

    let response = invoice(&app, &id, "2026-02-01T00:00:00Z").await;

    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let usage = line(&body, "usage");
    assert_eq!(amount(&usage["quantity"]), Decimal::from(100));
    assert_eq!(amount(&usage["amount"]), Decimal::from(10));
}

#[tokio::test]
async fn advance_invoice_prorates_a_partial_first_cycle() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 14, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_advance").await;

    let response = app
        .post(
            &format!("/subscriptions/{}/end-trial", id),
            &serde_json::json!({"as_of": "2026-01-15T00:00:00Z"}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let response = invoice(&app, &id, "2026-01-15T00:00:00Z").await;

    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let flat = line(&body, "flat");
    assert_eq!(flat["is_prorated"], true);
    // 50 scaled by 17/31 of the anchored month
    assert_eq!(amount(&flat["amount"]), Decimal::from_str("27.42").unwrap());
    assert_eq!(
        amount(&flat["proration_factor"]),
        Decimal::from_str("0.548387097").unwrap()
    );
    assert_eq!(
        amount(&body["invoice"]["total"]),
        Decimal::from_str("27.42").unwrap()
    );
}

#[tokio::test]
async fn paying_the_first_invoice_activates_a_trial_ended_subscription() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 14, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_advance").await;

    app.post(
        &format!("/subscriptions/{}/end-trial", id),
        &serde_json::json!({"as_of": "2026-01-15T00:00:00Z"}),
    )
    .await;
    let response = invoice(&app, &id, "2026-01-15T00:00:00Z").await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let invoice_id = body["invoice"]["invoice_id"].as_str().unwrap().to_string();

    let response = app
        .post(
            &format!("/invoices/{}/pay", invoice_id),
            &serde_json::json!({"as_of": "2026-01-15T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoice"]["status"], "paid");
    assert_eq!(body["invoice"]["paid_at"], "2026-01-15T00:00:00Z");

    let response = app.get(&format!("/subscriptions/{}", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "active");
    assert_eq!(body["phase"]["status"], "active");
}

#[tokio::test]
async fn declined_payment_leaves_the_invoice_open() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 0, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_arrear").await;

    let response = invoice(&app, &id, "2026-02-01T00:00:00Z").await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let invoice_id = body["invoice"]["invoice_id"].as_str().unwrap().to_string();

    app.payments.push_outcome(Ok(ChargeOutcome::Declined {
        reason: "card_declined".to_string(),
    }));

    let response = app
        .post(
            &format!("/invoices/{}/pay", invoice_id),
            &serde_json::json!({"as_of": "2026-02-02T00:00:00Z"}),
        )
        .await;

    // A decline is an outcome, not an error
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoice"]["status"], "open");
    assert!(body["invoice"]["paid_at"].is_null());

    let response = app.get(&format!("/subscriptions/{}", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "active");
}

#[tokio::test]
async fn declined_payment_past_the_grace_period_goes_past_due() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 0, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_arrear").await;

    let response = invoice(&app, &id, "2026-02-01T00:00:00Z").await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let invoice_id = body["invoice"]["invoice_id"].as_str().unwrap().to_string();

    app.payments.push_outcome(Ok(ChargeOutcome::Declined {
        reason: "card_declined".to_string(),
    }));

    // Grace is 3 days past the 2026-02-01 due date
    let response = app
        .post(
            &format!("/invoices/{}/pay", invoice_id),
            &serde_json::json!({"as_of": "2026-02-05T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoice"]["status"], "past_due");

    let response = app.get(&format!("/subscriptions/{}", id)).await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription"]["status"], "past_due");
}

#[tokio::test]
async fn paying_a_paid_invoice_is_idempotent() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 0, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_arrear").await;

    let response = invoice(&app, &id, "2026-02-01T00:00:00Z").await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let invoice_id = body["invoice"]["invoice_id"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let response = app
            .post(
                &format!("/invoices/{}/pay", invoice_id),
                &serde_json::json!({"as_of": "2026-02-01T00:00:00Z"}),
            )
            .await;
        assert_eq!(response.status().as_u16(), 200);
        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["invoice"]["status"], "paid");
    }

    // The provider was only charged once
    assert_eq!(app.payments.charged_invoices().len(), 1);
}

#[tokio::test]
async fn missing_payment_method_fails_the_payment() {
    let app = TestApp::spawn().await;
    let plan = create_metered_plan(&app, 0, None).await;
    let id = create_test_subscription(&app, &plan, "pay_in_arrear").await;

    let response = invoice(&app, &id, "2026-02-01T00:00:00Z").await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let invoice_id = body["invoice"]["invoice_id"].as_str().unwrap().to_string();

    app.payments.without_payment_method();

    let response = app
        .post(
            &format!("/invoices/{}/pay", invoice_id),
            &serde_json::json!({"as_of": "2026-02-01T00:00:00Z"}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 404);
    assert!(app.payments.charged_invoices().is_empty());
}
