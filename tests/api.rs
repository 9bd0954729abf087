use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use rewards_ledger::{
    AppState, Config, Ledger, LedgerBackend, MemoryLedger, TASK_DURATION_SECS, init_router,
};
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

const USER_ID_HEADER: &str = "x-user-id";

struct TestApp {
    router: Router,
    state: AppState,
    ledger: Arc<MemoryLedger>,
}

fn test_app() -> TestApp {
    let ledger = Arc::new(MemoryLedger::new());
    let config = Config {
        server_port: 0,
        database_url: None,
        db_max_connections: 1,
        ledger_backend: LedgerBackend::Memory,
        task_duration_secs: TASK_DURATION_SECS,
    };
    let state = AppState::new(ledger.clone(), config);
    TestApp {
        router: init_router(state.clone()),
        state,
        ledger,
    }
}

impl TestApp {
    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let res = self.router.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn get(&self, uri: &str, user: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::builder().uri(uri);
        if let Some(user) = user {
            req = req.header(USER_ID_HEADER, user);
        }
        self.send(req.body(Body::empty()).unwrap()).await
    }

    async fn post(&self, uri: &str, user: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user) = user {
            req = req.header(USER_ID_HEADER, user);
        }
        self.send(req.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn register(&self, name: &str) -> String {
        let (status, body) = self
            .post(
                "/users",
                None,
                json!({ "name": name, "email": format!("{}@example.com", name.to_lowercase()) }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["data"]["id"].as_str().unwrap().to_string()
    }
}

fn assert_error(body: &Value, code: &str) {
    assert_eq!(body["code"], code);
    assert!(body["request_id"].is_string());
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn health_is_public() {
    let app = test_app();
    let res = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_or_malformed_user_id_is_unauthorized() {
    let app = test_app();

    let (status, body) = app.get("/me", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_error(&body, "UNAUTHORIZED");

    let (status, body) = app.get("/me", Some("not-a-uuid")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_error(&body, "UNAUTHORIZED");
}

#[tokio::test]
async fn unknown_users_get_no_session() {
    let app = test_app();
    for _ in 0..100 {
        let id = Uuid::new_v4().to_string();
        let (status, body) = app.get("/me", Some(&id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_error(&body, "USER_NOT_FOUND");
    }
    assert!(app.state.sessions.is_empty());

    let id = Uuid::new_v4().to_string();
    let (status, body) = app.post("/earn/start", Some(&id), json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_error(&body, "USER_NOT_FOUND");
    assert!(app.state.sessions.is_empty());
}

#[tokio::test]
async fn success_envelope_carries_message_data_and_meta() {
    let app = test_app();
    let id = app.register("Ada").await;

    let (status, body) = app.get("/me", Some(&id)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].is_string());
    assert!(body["meta"]["request_id"].is_string());
    assert!(body["meta"]["timestamp"].is_i64());
    assert_eq!(body["data"]["balance"], "0");
    assert_eq!(body["data"]["tasks_completed"], 0);

    // Reads leave no session behind.
    assert!(app.state.sessions.is_empty());
}

#[tokio::test]
async fn second_start_conflicts_until_sign_out() {
    let app = test_app();
    let id = app.register("Ben").await;

    let (status, body) = app.post("/earn/start", Some(&id), json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["state"], "watching");
    assert_eq!(body["data"]["remaining"], TASK_DURATION_SECS);
    assert_eq!(app.state.sessions.len(), 1);

    let (status, body) = app.post("/earn/start", Some(&id), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&body, "TASK_IN_PROGRESS");

    let (status, body) = app.post("/session/sign-out", Some(&id), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["signed_out"], true);

    let (_, body) = app.post("/session/sign-out", Some(&id), json!({})).await;
    assert_eq!(body["data"]["signed_out"], false);
}

#[tokio::test]
async fn sign_out_without_live_session_reports_false() {
    let app = test_app();
    let id = app.register("Cleo").await;
    app.get("/me", Some(&id)).await;

    let (status, body) = app.post("/session/sign-out", Some(&id), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["signed_out"], false);

    let stranger = Uuid::new_v4().to_string();
    let (_, body) = app.post("/session/sign-out", Some(&stranger), json!({})).await;
    assert_eq!(body["data"]["signed_out"], false);
}

#[tokio::test]
async fn withdrawal_errors_map_to_stable_codes() {
    let app = test_app();
    let id = app.register("Dana").await;
    let user_id = Uuid::parse_str(&id).unwrap();
    app.ledger.complete_task(user_id, dec!(10.00)).await.unwrap();

    let cases = [
        (json!({ "amount": "ten", "payment_method": "paypal" }), "BAD_AMOUNT"),
        (json!({ "amount": "4.99", "payment_method": "paypal" }), "BELOW_MINIMUM"),
        (json!({ "amount": "20.00", "payment_method": "paypal" }), "INSUFFICIENT_BALANCE"),
        (json!({ "amount": "6.00" }), "PAYMENT_METHOD"),
        (json!({ "amount": "6.00", "payment_method": "cheque" }), "PAYMENT_METHOD"),
    ];
    for (req, code) in cases {
        let (status, body) = app.post("/withdrawals", Some(&id), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{code}");
        assert_error(&body, code);
    }

    let (status, body) = app
        .post(
            "/withdrawals",
            Some(&id),
            json!({ "amount": "6.00", "payment_method": "bank" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["withdrawal"]["status"], "pending");
    assert_eq!(body["data"]["withdrawal"]["payment_method"], "bank");
    assert_eq!(body["data"]["balance"], "4.00");

    let (status, body) = app.get("/withdrawals", Some(&id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (_, body) = app.get("/audit", Some(&id)).await;
    assert_eq!(body["data"]["balance"], "4.00");
}

#[tokio::test]
async fn duplicate_email_conflicts() {
    let app = test_app();
    app.register("Eve").await;

    let (status, body) = app
        .post(
            "/users",
            None,
            json!({ "name": "Eve", "email": "eve@example.com" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&body, "USER_CONFLICT");
}
