//! Plan catalog and price endpoint integration tests.

mod common;

use common::TestApp;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Helper to publish a plan version with the given features.
async fn create_plan(app: &TestApp, name: &str, features: serde_json::Value) -> String {
    let response = app
        .post(
            "/plans",
            &serde_json::json!({
                "name": name,
                "currency": "USD",
                "billing_period": "month",
                "plan_type": "recurring",
                "features": features
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

async fn plan_price(app: &TestApp, plan_version_id: &str) -> reqwest::Response {
    app.get(&format!("/plans/{}/price", plan_version_id)).await
}

#[tokio::test]
async fn plan_price_sums_fixed_features_at_defaults() {
    let app = TestApp::spawn().await;
    let plan = create_plan(
        &app,
        "Mixed",
        serde_json::json!([
            {
                "feature_slug": "base",
                "name": "Base fee",
                "feature_type": "flat",
                "pricing": {"type": "flat", "price": "49"},
                "default_units": "1"
            },
            {
                "feature_slug": "seats",
                "name": "Seats",
                "feature_type": "tier",
                "pricing": {
                    "type": "tier",
                    "mode": "graduated",
                    "tiers": [
                        {"first_unit": "1", "last_unit": "10", "unit_price": "1"},
                        {"first_unit": "11", "unit_price": "2"}
                    ]
                },
                "default_units": "5"
            },
            {
                "feature_slug": "api_calls",
                "name": "API calls",
                "feature_type": "usage",
                "pricing": {"type": "usage", "mode": "unit", "rate": "0.01"},
                "aggregation": "sum"
            }
        ]),
    )
    .await;

    let response = plan_price(&app, &plan).await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["plan_version_id"], plan.as_str());
    assert_eq!(
        Decimal::from_str(body["total"]["amount"].as_str().unwrap()).unwrap(),
        Decimal::from(54)
    );
    assert_eq!(body["total"]["currency"], "USD");
    // The metered feature prices at invoice time, not here
    assert_eq!(body["has_usage"], true);
}

#[tokio::test]
async fn plan_price_without_metered_features_is_final() {
    let app = TestApp::spawn().await;
    let plan = create_plan(
        &app,
        "Fixed",
        serde_json::json!([{
            "feature_slug": "base",
            "name": "Base fee",
            "feature_type": "flat",
            "pricing": {"type": "flat", "price": "49"},
            "default_units": "1"
        }]),
    )
    .await;

    let response = plan_price(&app, &plan).await;

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(
        Decimal::from_str(body["total"]["amount"].as_str().unwrap()).unwrap(),
        Decimal::from(49)
    );
    assert_eq!(body["has_usage"], false);
}

#[tokio::test]
async fn plan_price_charges_packages_per_started_block() {
    let app = TestApp::spawn().await;
    let plan = create_plan(
        &app,
        "Blocks",
        serde_json::json!([{
            "feature_slug": "storage",
            "name": "Storage blocks",
            "feature_type": "package",
            "pricing": {"type": "package", "units": "100", "price": "9"},
            "default_units": "250"
        }]),
    )
    .await;

    let response = plan_price(&app, &plan).await;

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    // 250 units need three blocks of 100
    assert_eq!(
        Decimal::from_str(body["total"]["amount"].as_str().unwrap()).unwrap(),
        Decimal::from(27)
    );
}

#[tokio::test]
async fn malformed_pricing_config_fails_the_price_endpoint() {
    let app = TestApp::spawn().await;
    let plan = create_plan(
        &app,
        "Broken",
        serde_json::json!([{
            "feature_slug": "base",
            "name": "Base fee",
            "feature_type": "flat",
            "pricing": {"type": "mystery"},
            "default_units": "1"
        }]),
    )
    .await;

    let response = plan_price(&app, &plan).await;

    assert_eq!(response.status().as_u16(), 400);
    let error: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert!(error["error"]
        .as_str()
        .unwrap()
        .contains("pricing configuration error"));
}

#[tokio::test]
async fn invalid_tier_configuration_fails_the_price_endpoint() {
    let app = TestApp::spawn().await;
    let plan = create_plan(
        &app,
        "Gappy",
        serde_json::json!([{
            "feature_slug": "seats",
            "name": "Seats",
            "feature_type": "tier",
            "pricing": {
                "type": "tier",
                "mode": "graduated",
                "tiers": [
                    {"first_unit": "1", "last_unit": "10", "unit_price": "1"},
                    {"first_unit": "12", "unit_price": "2"}
                ]
            },
            "default_units": "5"
        }]),
    )
    .await;

    let response = plan_price(&app, &plan).await;

    assert_eq!(response.status().as_u16(), 400);
    let error: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert!(error["error"]
        .as_str()
        .unwrap()
        .contains("does not start where the previous tier ends"));
}

#[tokio::test]
async fn create_plan_requires_features() {
    let app = TestApp::spawn().await;

    let response = app
        .post(
            "/plans",
            &serde_json::json!({
                "name": "Empty",
                "currency": "USD",
                "billing_period": "month",
                "plan_type": "recurring",
                "features": []
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn create_plan_rejects_a_malformed_currency() {
    let app = TestApp::spawn().await;

    let response = app
        .post(
            "/plans",
            &serde_json::json!({
                "name": "Odd currency",
                "currency": "USDD",
                "billing_period": "month",
                "plan_type": "recurring",
                "features": [{
                    "feature_slug": "base",
                    "name": "Base fee",
                    "feature_type": "flat",
                    "pricing": {"type": "flat", "price": "10"}
                }]
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn plans_paginate_with_a_next_page_token() {
    let app = TestApp::spawn().await;
    let mut created = Vec::new();
    for name in ["One", "Two", "Three"] {
        created.push(
            create_plan(
                &app,
                name,
                serde_json::json!([{
                    "feature_slug": "base",
                    "name": "Base fee",
                    "feature_type": "flat",
                    "pricing": {"type": "flat", "price": "10"},
                    "default_units": "1"
                }]),
            )
            .await,
        );
    }

    let response = app.get("/plans?page_size=2").await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let first_page = body["plans"].as_array().unwrap();
    assert_eq!(first_page.len(), 2);
    let token = body["next_page_token"].as_str().expect("token missing");

    let response = app
        .get(&format!("/plans?page_size=2&page_token={}", token))
        .await;
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let second_page = body["plans"].as_array().unwrap();
    assert_eq!(second_page.len(), 1);
    assert!(body["next_page_token"].is_null());

    let mut seen: Vec<String> = first_page
        .iter()
        .chain(second_page.iter())
        .map(|plan| plan["plan_version_id"].as_str().unwrap().to_string())
        .collect();
    seen.sort();
    created.sort();
    assert_eq!(seen, created);
}

#[tokio::test]
async fn plans_are_scoped_to_their_project() {
    let app = TestApp::spawn().await;
    let plan = create_plan(
        &app,
        "Private",
        serde_json::json!([{
            "feature_slug": "base",
            "name": "Base fee",
            "feature_type": "flat",
            "pricing": {"type": "flat", "price": "10"},
            "default_units": "1"
        }]),
    )
    .await;

    let response = app
        .get_as(
            "33333333-3333-3333-3333-333333333333",
            &format!("/plans/{}", plan),
        )
        .await;

    assert_eq!(response.status().as_u16(), 404);
}
