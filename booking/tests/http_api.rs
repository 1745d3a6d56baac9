//! HTTP API integration tests.
//!
//! Requests go through the full router (routing, JSON extraction, error
//! mapping) via `tower::ServiceExt::oneshot`; no socket is opened.

#![allow(clippy::unwrap_used)]

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::Harness;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use skymarket_booking::api::{AppState, router};
use skymarket_booking::webhook::{SIGNATURE_HEADER, WebhookVerifier};
use skymarket_core::environment::Clock;
use tower::ServiceExt;

const SECRET: &str = "whsec_http_tests";

fn app(h: &Harness) -> Router {
    router(AppState::new(
        h.service.clone(),
        WebhookVerifier::new(SECRET),
        h.clock.clone(),
    ))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn party(id: impl std::fmt::Display) -> Value {
    json!({ "kind": "party", "id": id.to_string() })
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = Harness::new();

    let (status, body) = send(app(&h), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_and_fetch_booking() {
    let h = Harness::new();
    let request = serde_json::to_value(h.request()).unwrap();

    let (status, created) = send(app(&h), post("/api/v1/bookings", &request)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "pending");
    assert_eq!(created["quoted_amount"], 4250);

    let id = created["id"].as_str().unwrap();
    let (status, fetched) = send(app(&h), get(&format!("/api/v1/bookings/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], created["id"]);

    let (status, payment) = send(app(&h), get(&format!("/api/v1/bookings/{id}/payment"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payment["status"], "authorized");
    assert_eq!(payment["authorized"], 4250);
}

#[tokio::test]
async fn test_wrong_quote_is_unprocessable() {
    let h = Harness::new();
    let mut request = serde_json::to_value(h.request()).unwrap();
    request["quoted_amount"] = json!(9999);

    let (status, body) = send(app(&h), post("/api/v1/bookings", &request)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["category"], "validation");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn test_transition_permissions_over_http() {
    let h = Harness::new();
    let booking = h.pending().await;
    let uri = format!("/api/v1/bookings/{}/transitions", booking.id);

    let (status, _) = send(
        app(&h),
        post(&uri, &json!({ "status": "accepted", "actor": party(h.requester) })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        app(&h),
        post(&uri, &json!({ "status": "accepted", "actor": party(h.provider) })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");

    let (status, _) = send(
        app(&h),
        post(&uri, &json!({ "status": "resolved_captured", "actor": party(h.provider) })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_booking_is_not_found() {
    let h = Harness::new();

    let (status, body) = send(
        app(&h),
        get(&format!("/api/v1/bookings/{}", uuid::Uuid::new_v4())),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_refund_requires_token() {
    let h = Harness::new();
    let booking = h.completed().await;

    let (status, _) = send(
        app(&h),
        post(
            &format!("/api/v1/bookings/{}/refunds", booking.id),
            &json!({ "token": "  ", "actor": party(h.provider) }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_dispute_flow_over_http() {
    let h = Harness::new();
    let booking = h.completed().await;

    let (status, dispute) = send(
        app(&h),
        post(
            &format!("/api/v1/bookings/{}/disputes", booking.id),
            &json!({
                "initiator": party(h.requester),
                "reason": "damaged_goods",
                "description": "package dropped from height",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let dispute_id = dispute["id"].as_str().unwrap().to_string();

    let (status, responded) = send(
        app(&h),
        post(
            &format!("/api/v1/disputes/{dispute_id}/responses"),
            &json!({ "responder": party(h.provider), "message": "winch failure" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(responded["status"], "responded");

    let (status, resolved) = send(
        app(&h),
        post(
            &format!("/api/v1/disputes/{dispute_id}/resolution"),
            &json!({
                "resolution": "partial_refund",
                "refund_amount": 1500,
                "actor": { "kind": "admin", "id": h.admin.to_string() },
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "resolved");

    let (_, payment) = send(
        app(&h),
        get(&format!("/api/v1/bookings/{}/payment", booking.id)),
    )
    .await;
    assert_eq!(payment["refunded"], 1500);
}

#[tokio::test]
async fn test_signed_webhook_is_applied_and_unsigned_is_dropped() {
    let h = Harness::new();
    let booking = h.pending().await;
    let body = json!({
        "event_id": "evt_http_1",
        "sequence": 1,
        "authorization_id": booking.payment_reference.clone().unwrap(),
        "occurred_at": h.clock.now(),
        "type": "authorization.expired",
    })
    .to_string();

    let unsigned = Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/payments")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, ack) = send(app(&h), unsigned).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["received"], true);
    assert!(ack["rejected"].is_string());
    assert_eq!(
        h.service.booking(booking.id).await.unwrap().status,
        skymarket_booking::BookingStatus::Pending
    );

    let signature = WebhookVerifier::new(SECRET).sign(body.as_bytes(), h.clock.now());
    let signed = Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/payments")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(body))
        .unwrap();
    let (status, ack) = send(app(&h), signed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"]["outcome"], "applied");
    assert_eq!(ack["outcome"]["changed"], true);

    let stored = h.service.booking(booking.id).await.unwrap();
    assert_eq!(stored.status, skymarket_booking::BookingStatus::Cancelled);
    assert_eq!(
        stored.cancellation_reason,
        Some(skymarket_booking::CancellationReason::AuthorizationExpired)
    );
}
