use axum::http::{self, Request, StatusCode};
use http_body_util::BodyExt;
use mock_server::{app, app_with_state, AppState, Item, AUTH_CODE, CODE_VERIFIER, DEVICE_CODE, ITEM_COUNT, LOGID_HEADER, PENDING_POLLS};
use serde_json::Value;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn authed(method: &str, uri: &str, body: &str) -> Request<String> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::AUTHORIZATION, "Bearer pat_test")
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body.to_string())
        .unwrap()
}

fn anonymous(method: &str, uri: &str, body: &str) -> Request<String> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body.to_string())
        .unwrap()
}

// --- auth & tracing ---

#[tokio::test]
async fn missing_token_is_rejected_with_logid() {
    let resp = app().oneshot(anonymous("GET", "/v1/bots/b1", "")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().get(LOGID_HEADER).is_some());
    let body = body_json(resp).await;
    assert_eq!(body["code"], 4100);
}

#[tokio::test]
async fn request_logid_is_echoed() {
    let mut req = authed("GET", "/v1/bots/b1", "");
    req.headers_mut().insert(LOGID_HEADER, "trace-abc".parse().unwrap());
    let resp = app().oneshot(req).await.unwrap();

    assert_eq!(resp.headers()[LOGID_HEADER], "trace-abc");
}

// --- resources ---

#[tokio::test]
async fn bot_is_wrapped_in_envelope() {
    let resp = app().oneshot(authed("GET", "/v1/bots/b1", "")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["bot_id"], "b1");
}

#[tokio::test]
async fn missing_bot_is_a_business_error_on_200() {
    let resp = app().oneshot(authed("GET", "/v1/bots/missing", "")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["code"], 4200);
}

#[tokio::test]
async fn number_pages_split_items() {
    let state = AppState::default();
    let resp = app_with_state(state.clone())
        .oneshot(authed("GET", "/v1/items?page_num=2&page_size=10", ""))
        .await
        .unwrap();

    let body = body_json(resp).await;
    let items: Vec<Item> = serde_json::from_value(body["data"]["items"].clone()).unwrap();
    assert_eq!(items.len(), ITEM_COUNT - 10);
    assert_eq!(items[0].id, 10);
    assert_eq!(body["data"]["has_more"], false);
    assert_eq!(body["data"]["total"], ITEM_COUNT);
    assert_eq!(state.list_calls(), 1);
}

#[tokio::test]
async fn cursor_pages_hand_out_next_token() {
    let resp = app()
        .oneshot(authed("GET", "/v1/cursor_items?page_size=5", ""))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["data"]["next_page_token"], "5");
    assert_eq!(body["data"]["has_more"], true);

    let resp = app()
        .oneshot(authed("GET", "/v1/cursor_items?page_size=5&page_token=10", ""))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 3);
    assert!(body["data"]["next_page_token"].is_null());
}

#[tokio::test]
async fn gateway_error_is_plain_text() {
    let resp = app().oneshot(authed("GET", "/v1/gateway_error", "")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_text(resp).await, "upstream unavailable");
}

// --- streams ---

#[tokio::test]
async fn chat_streams_events_until_done() {
    let resp = app()
        .oneshot(authed("POST", "/v3/chat", r#"{"bot_id":"b1","user_id":"u1","stream":true}"#))
        .await
        .unwrap();

    assert_eq!(resp.headers()[http::header::CONTENT_TYPE], "text/event-stream");
    let body = body_text(resp).await;
    assert!(body.starts_with("event: conversation.chat.created\n"));
    assert!(body.contains("\"content\":\"hi\""));
    assert!(body.ends_with("event: done\ndata: \"[DONE]\"\n\n"));
}

#[tokio::test]
async fn chat_for_missing_bot_answers_json() {
    let resp = app()
        .oneshot(authed("POST", "/v3/chat", r#"{"bot_id":"missing"}"#))
        .await
        .unwrap();

    assert!(resp.headers()[http::header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("application/json"));
    assert_eq!(body_json(resp).await["code"], 4200);
}

#[tokio::test]
async fn workflow_run_interrupts() {
    let resp = app()
        .oneshot(authed("POST", "/v1/workflow/stream_run", r#"{"workflow_id":"wf"}"#))
        .await
        .unwrap();

    let body = body_text(resp).await;
    assert!(body.contains("id: 1\nevent: Interrupt\n"));
    assert!(body.contains("\"event_id\":\"evt-1\""));
    assert!(body.ends_with("event: Done\ndata: {}\n\n"));
}

#[tokio::test]
async fn workflow_resume_echoes_answer() {
    let resp = app()
        .oneshot(authed(
            "POST",
            "/v1/workflow/stream_resume",
            r#"{"workflow_id":"wf","event_id":"evt-1","resume_data":"yes","interrupt_type":2}"#,
        ))
        .await
        .unwrap();

    assert!(body_text(resp).await.contains("\"content\":\"evt-1:2:yes\""));
}

#[tokio::test]
async fn truncated_stream_has_no_terminator() {
    let resp = app().oneshot(authed("GET", "/v1/stream/truncated", "")).await.unwrap();

    let body = body_text(resp).await;
    assert!(!body.ends_with('\n'));
    assert!(!body.contains("done"));
}

// --- oauth ---

#[tokio::test]
async fn device_code_needs_no_token() {
    let resp = app()
        .oneshot(anonymous("POST", "/api/permission/oauth2/device/code", r#"{"client_id":"cid"}"#))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["device_code"], DEVICE_CODE);
    assert_eq!(body["interval"], 0);
}

#[tokio::test]
async fn device_token_is_pending_then_issued() {
    let state = AppState::default();
    let poll = format!(
        r#"{{"grant_type":"urn:ietf:params:oauth:grant-type:device_code","client_id":"cid","device_code":"{DEVICE_CODE}"}}"#
    );

    for _ in 0..PENDING_POLLS {
        let resp = app_with_state(state.clone())
            .oneshot(anonymous("POST", "/api/permission/oauth2/token", &poll))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error_code"], "authorization_pending");
    }

    let resp = app_with_state(state.clone())
        .oneshot(anonymous("POST", "/api/permission/oauth2/token", &poll))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["access_token"], "at-0");
    assert_eq!(state.token_polls(), PENDING_POLLS + 1);
}

#[tokio::test]
async fn refresh_grant_rotates_tokens() {
    let state = AppState::default();
    let resp = app_with_state(state.clone())
        .oneshot(anonymous(
            "POST",
            "/api/permission/oauth2/token",
            r#"{"grant_type":"refresh_token","client_id":"cid","refresh_token":"rt-0"}"#,
        ))
        .await
        .unwrap();

    let body = body_json(resp).await;
    assert_eq!(body["access_token"], "at-1");
    assert_eq!(body["refresh_token"], "rt-1");
    assert_eq!(state.refreshes(), 1);
}

#[tokio::test]
async fn bad_refresh_token_is_invalid_grant() {
    let resp = app()
        .oneshot(anonymous(
            "POST",
            "/api/permission/oauth2/token",
            r#"{"grant_type":"refresh_token","client_id":"cid","refresh_token":"nope"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["error_code"], "invalid_grant");
}

#[tokio::test]
async fn authorization_code_grant_checks_verifier() {
    let grant = |verifier: &str| {
        format!(
            r#"{{"grant_type":"authorization_code","client_id":"cid","code":"{AUTH_CODE}","redirect_uri":"https://app.example/cb","code_verifier":"{verifier}"}}"#
        )
    };

    let resp = app()
        .oneshot(anonymous("POST", "/api/permission/oauth2/token", &grant(CODE_VERIFIER)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["access_token"], "at-0");

    let resp = app()
        .oneshot(anonymous("POST", "/api/permission/oauth2/token", &grant("wrong")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["error_code"], "invalid_grant");
}
