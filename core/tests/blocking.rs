//! End-to-end tests of the blocking client against the live mock server.

mod common;

use std::io::Write;
use std::time::Duration;

use coze_core::chat::{self, ChatMessage, StreamChat};
use coze_core::oauth::{CodeChallenge, DeviceFlow, PkceFlow, RefreshTokenSource};
use coze_core::workflow::{self, RunWorkflow};
use coze_core::{
    CachedAuth, ChatEvent, ClientConfig, CozeClient, CozeError, OAuthErrorCode, PageState, RequestDescriptor, StreamError,
    TokenAuth, TransportKind, WorkflowEvent,
};
use mock_server::{AppState, Item, AUTH_CODE, CODE_VERIFIER, ITEM_COUNT, PENDING_POLLS};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Bot {
    bot_id: String,
    name: String,
}

fn client(base_url: &str) -> CozeClient {
    CozeClient::new(&common::config(base_url), TokenAuth::new("pat_test"))
}

#[test]
fn envelope_data_and_logid() {
    let base = common::start_blocking(AppState::default());
    let desc = RequestDescriptor::get("/v1/bots/b1").header("x-tt-logid", "trace-1");

    let response = client(&base).get_data::<Bot>(&desc).unwrap();
    assert_eq!(response.logid(), "trace-1");
    assert_eq!(response.data.bot_id, "b1");
    assert_eq!(response.data.name, "Helper");
}

#[test]
fn missing_credentials_are_classified() {
    let base = common::start_blocking(AppState::default());
    let client = CozeClient::anonymous(&common::config(&base));

    let err = client.get_data::<Bot>(&RequestDescriptor::get("/v1/bots/b1")).unwrap_err();
    match &err {
        CozeError::Api(e) => {
            assert_eq!(e.status, 401);
            assert_eq!(e.code, Some(4100));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(err.logid().is_some());
}

#[test]
fn business_code_on_200_is_an_error() {
    let base = common::start_blocking(AppState::default());

    let err = client(&base).get_data::<Bot>(&RequestDescriptor::get("/v1/bots/missing")).unwrap_err();
    assert!(matches!(err, CozeError::Api(ref e) if e.status == 200 && e.code == Some(4200)));
}

#[test]
fn plain_text_gateway_error_falls_back_to_raw_body() {
    let base = common::start_blocking(AppState::default());

    let err = client(&base)
        .get_data::<serde_json::Value>(&RequestDescriptor::get("/v1/gateway_error"))
        .unwrap_err();
    match err {
        CozeError::Api(e) => {
            assert_eq!(e.status, 502);
            assert_eq!(e.code, Some(502));
            assert_eq!(e.msg, "upstream unavailable");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn chat_stream_yields_typed_events() {
    let base = common::start_blocking(AppState::default());
    let desc = chat::stream_request(&StreamChat::new("b1", "u1").message(ChatMessage::user("hello"))).unwrap();

    let stream = client(&base).stream::<ChatEvent>(&desc).unwrap();
    assert!(!stream.logid().is_empty());
    let events: Vec<ChatEvent> = stream.map(Result::unwrap).collect();

    assert_eq!(events.len(), 4);
    assert!(matches!(events[0], ChatEvent::Created(_)));
    match &events[1] {
        ChatEvent::MessageDelta(message) => assert_eq!(message.content, "hi"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(events[2], ChatEvent::MessageCompleted(_)));
    match &events[3] {
        ChatEvent::Completed(chat) => assert_eq!(chat.usage.as_ref().map(|u| u.token_count), Some(2)),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn json_answer_to_stream_call_is_raised_on_open() {
    let base = common::start_blocking(AppState::default());
    let desc = chat::stream_request(&StreamChat::new("missing", "u1")).unwrap();

    let Err(err) = client(&base).stream::<ChatEvent>(&desc) else {
        panic!("stream opened on a JSON answer");
    };
    assert!(matches!(err, CozeError::Api(ref e) if e.code == Some(4200)));
}

#[test]
fn truncated_stream_is_an_error() {
    let base = common::start_blocking(AppState::default());

    let mut stream = client(&base)
        .stream::<ChatEvent>(&RequestDescriptor::get("/v1/stream/truncated"))
        .unwrap();
    assert!(matches!(
        stream.next(),
        Some(Err(CozeError::Stream(StreamError::UnexpectedEof { .. })))
    ));
    assert!(stream.next().is_none());
}

#[test]
fn error_frame_ends_workflow_stream() {
    let base = common::start_blocking(AppState::default());

    let mut stream = client(&base)
        .stream::<WorkflowEvent>(&RequestDescriptor::post("/v1/workflow/stream_error"))
        .unwrap();
    assert!(matches!(stream.next(), Some(Ok(WorkflowEvent::Message { .. }))));
    match stream.next() {
        Some(Err(CozeError::Api(e))) => {
            assert_eq!(e.code, Some(4200));
            assert_eq!(e.msg, "workflow not published");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(stream.next().is_none());
}

#[test]
fn closing_a_stream_releases_the_connection() {
    let state = AppState::default();
    let base = common::start_blocking(state.clone());

    let mut stream = client(&base)
        .stream::<ChatEvent>(&RequestDescriptor::get("/v1/stream/endless"))
        .unwrap();
    for _ in 0..2 {
        assert!(matches!(stream.next(), Some(Ok(ChatEvent::MessageDelta(_)))));
    }
    stream.close();

    assert!(common::eventually(Duration::from_secs(5), || state.stream_closed()));
}

#[test]
fn timeout_mid_stream_ends_with_transport_timeout() {
    let base = common::start_blocking(AppState::default());
    let desc = RequestDescriptor::get("/v1/stream/endless").timeout(Duration::from_millis(300));

    let results: Vec<_> = client(&base).stream::<ChatEvent>(&desc).unwrap().collect();
    let (last, events) = results.split_last().unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(Result::is_ok));
    assert!(matches!(
        last,
        Err(CozeError::Transport {
            kind: TransportKind::Timeout,
            ..
        })
    ));
}

#[test]
fn number_pagination_fetches_lazily() {
    let state = AppState::default();
    let base = common::start_blocking(state.clone());
    let client = client(&base);

    let mut items = client
        .list::<Item>(RequestDescriptor::get("/v1/items"), PageState::number(10))
        .items();
    let ids: Vec<usize> = items.by_ref().map(|item| item.unwrap().id).collect();

    assert_eq!(ids, (0..ITEM_COUNT).collect::<Vec<_>>());
    assert_eq!(items.fetch_count(), 2);
    assert_eq!(state.list_calls(), 2);
}

#[test]
fn single_page_listing_fetches_once() {
    let state = AppState::default();
    let base = common::start_blocking(state.clone());
    let client = client(&base);

    let pages: Vec<_> = client
        .list::<Item>(RequestDescriptor::get("/v1/items"), PageState::number(50))
        .pages()
        .map(Result::unwrap)
        .collect();

    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].total, Some(ITEM_COUNT as u64));
    assert!(!pages[0].logid().is_empty());
    assert_eq!(state.list_calls(), 1);
}

#[test]
fn cursor_pagination_follows_tokens() {
    let base = common::start_blocking(AppState::default());
    let client = client(&base);

    let mut items = client
        .list::<Item>(RequestDescriptor::get("/v1/cursor_items"), PageState::cursor(5))
        .items();
    assert_eq!(items.by_ref().count(), ITEM_COUNT);
    assert_eq!(items.fetch_count(), 3);
}

#[test]
fn workflow_interrupts_are_resumed_in_order() {
    let base = common::start_blocking(AppState::default());
    let mut messages = Vec::new();
    let mut interrupts = Vec::new();

    workflow::run_with_interrupts(&client(&base), &RunWorkflow::new("wf-1"), |event| match event {
        WorkflowEvent::Message { message, .. } => {
            messages.push(message.content.clone());
            Ok(None)
        }
        WorkflowEvent::Interrupt { interrupt, .. } => {
            let event_id = interrupt.interrupt_data.event_id.clone();
            let answer = if event_id == "evt-1" { "again" } else { "yes" };
            interrupts.push(event_id);
            Ok(Some(answer.to_string()))
        }
        _ => Ok(None),
    })
    .unwrap();

    assert_eq!(interrupts, vec!["evt-1", "evt-1-again"]);
    assert_eq!(messages, vec!["thinking", "evt-1-again:2:yes"]);
}

#[test]
fn device_flow_polls_until_authorized() {
    let state = AppState::default();
    let base = common::start_blocking(state.clone());
    let flow = DeviceFlow::new(&common::config(&base), "cid");

    let code = flow.get_device_code().unwrap();
    assert_eq!(code.verification_url(), "https://www.coze.com/device?user_code=USER-CODE");

    let err = flow.get_access_token(&code, false).unwrap_err();
    assert_eq!(err.oauth_code(), Some(OAuthErrorCode::AuthorizationPending));

    let token = flow.get_access_token(&code, true).unwrap();
    assert_eq!(token.access_token, "at-0");
    assert_eq!(state.token_polls(), PENDING_POLLS + 1);
}

#[test]
fn pkce_code_is_redeemed_with_its_verifier() {
    let base = common::start_blocking(AppState::default());
    let flow = PkceFlow::new(&common::config(&base), "cid");
    let redirect = "https://app.example/cb";

    let url = flow.get_oauth_url(redirect, "st-1", &CodeChallenge::plain(CODE_VERIFIER), None);
    assert!(url.starts_with(&format!("{base}/api/permission/oauth2/authorize?")));
    assert!(url.contains(&format!("code_challenge={CODE_VERIFIER}")));

    let token = flow.get_access_token(redirect, AUTH_CODE, CODE_VERIFIER).unwrap();
    assert_eq!(token.access_token, "at-0");

    let err = flow.get_access_token(redirect, AUTH_CODE, "other-verifier").unwrap_err();
    match err {
        CozeError::Api(e) => {
            assert_eq!(e.status, 400);
            assert!(e.msg.starts_with("invalid_grant"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn refresh_token_source_feeds_cached_auth() {
    let state = AppState::default();
    let base = common::start_blocking(state.clone());
    let config = common::config(&base);
    let auth = CachedAuth::new(RefreshTokenSource::new(&config, "cid", "rt-0"));
    let client = CozeClient::new(&config, auth);

    #[derive(Deserialize)]
    struct WhoAmI {
        token: String,
    }

    for _ in 0..3 {
        let who = client.get_data::<WhoAmI>(&RequestDescriptor::get("/v1/whoami")).unwrap();
        assert_eq!(who.data.token, "at-1");
    }
    assert_eq!(state.refreshes(), 1);
}

#[test]
fn file_upload_is_streamed_as_multipart() {
    let base = common::start_blocking(AppState::default());
    let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
    file.write_all(&[b'x'; 4096]).unwrap();
    let file_name = file.path().file_name().unwrap().to_string_lossy().into_owned();

    let desc = RequestDescriptor::post("/v1/files/upload").file("file", file.path());
    let response = client(&base).get_data::<serde_json::Value>(&desc).unwrap();

    assert_eq!(response.data["field"], "file");
    assert_eq!(response.data["file_name"], file_name.as_str());
    assert_eq!(response.data["bytes"], 4096);
}

#[test]
fn unreadable_upload_is_a_request_error() {
    let base = common::start_blocking(AppState::default());
    let desc = RequestDescriptor::post("/v1/files/upload").file("file", "/nonexistent/coze-upload.bin");

    let err = client(&base).get_data::<serde_json::Value>(&desc).unwrap_err();
    assert!(matches!(err, CozeError::Request(_)));
}

#[test]
fn per_call_timeout_is_a_transport_error() {
    let base = common::start_blocking(AppState::default());
    let desc = RequestDescriptor::get("/v1/slow").timeout(Duration::from_millis(300));

    let err = client(&base).get_data::<serde_json::Value>(&desc).unwrap_err();
    assert!(matches!(
        err,
        CozeError::Transport {
            kind: TransportKind::Timeout,
            ..
        }
    ));
    assert_eq!(err.logid(), None);
}

#[test]
fn refused_connection_is_a_connect_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(&format!("http://{addr}"))
        .get_data::<Bot>(&RequestDescriptor::get("/v1/bots/b1"))
        .unwrap_err();
    assert!(matches!(
        err,
        CozeError::Transport {
            kind: TransportKind::Connect,
            ..
        }
    ));
}

#[test]
fn connect_timeout_is_a_connect_error() {
    // Non-routable address: the handshake never completes.
    let config = ClientConfig::new("http://10.255.255.1:81").connect_timeout(Duration::from_millis(250));
    let client = CozeClient::new(&config, TokenAuth::new("pat_test"));

    let err = client.get_data::<Bot>(&RequestDescriptor::get("/v1/bots/b1")).unwrap_err();
    assert!(matches!(
        err,
        CozeError::Transport {
            kind: TransportKind::Connect,
            ..
        }
    ));
}
