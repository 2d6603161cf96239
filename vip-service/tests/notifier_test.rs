//! Telegram notifier against a mock Bot API.

use chrono::{TimeZone, Utc};
use secrecy::Secret;
use serde_json::json;
use vip_service::config::TelegramConfig;
use vip_service::services::notifier::payment_success_message;
use vip_service::services::{Notifier, NotifyError, TelegramNotifier};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn notifier_for(server: &MockServer, token: &str) -> TelegramNotifier {
    TelegramNotifier::new(&TelegramConfig {
        bot_token: Secret::new(token.to_string()),
        api_url: server.uri(),
        auth_max_age_secs: 86_400,
        allow_dev_user_header: false,
        allowed_origins: Vec::new(),
    })
    .expect("Failed to build notifier")
}

#[tokio::test]
async fn test_send_message_posts_html() {
    let server = MockServer::start().await;
    let text = payment_success_message(
        "VIP 7 Hari",
        Utc.with_ymd_and_hms(2024, 5, 8, 10, 0, 0).unwrap(),
    );

    Mock::given(method("POST"))
        .and(path("/bot123:ABC/sendMessage"))
        .and(body_json(json!({
            "chat_id": "987654321",
            "text": text,
            "parse_mode": "HTML"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": {} })))
        .expect(1)
        .mount(&server)
        .await;

    notifier_for(&server, "123:ABC")
        .send_message("987654321", &text)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_api_rejection_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "ok": false,
            "error_code": 403,
            "description": "Forbidden: bot was blocked by the user"
        })))
        .mount(&server)
        .await;

    let err = notifier_for(&server, "123:ABC")
        .send_message("987654321", "hi")
        .await
        .unwrap_err();
    match err {
        NotifyError::Rejected(msg) => assert!(msg.contains("blocked")),
        other => panic!("expected Rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_token_sends_nothing() {
    let server = MockServer::start().await;
    let notifier = notifier_for(&server, "");

    assert!(!notifier.is_enabled());
    assert!(matches!(
        notifier.send_message("1", "hi").await,
        Err(NotifyError::Disabled)
    ));
    assert!(server.received_requests().await.unwrap().is_empty());
}
