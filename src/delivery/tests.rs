use super::*;
use crate::bus::{ChannelType, ConversationKey};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn payload() -> WebhookPayload {
    WebhookPayload::from_message(&CombinedMessage {
        key: ConversationKey::new(ChannelType::Web, "u1"),
        text: "hello world".into(),
        fragment_count: 2,
        truncated: false,
    })
}

fn delivery_for(server: &MockServer) -> WebhookDelivery {
    WebhookDelivery::with_client(Client::new(), format!("{}/hook", server.uri()))
}

#[test]
fn test_payload_shape() {
    let json = serde_json::to_value(payload()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"user_id": "u1", "channel": "web", "text": "hello world"})
    );

    let mut retried = payload();
    retried.retry = true;
    assert_eq!(serde_json::to_value(retried).unwrap()["retry"], true);
}

#[test]
fn test_error_classification() {
    assert!(!DeliveryError::NotConfigured.is_retryable());
    assert!(DeliveryError::Timeout.is_retryable());
    assert!(DeliveryError::Transport("reset".into()).is_retryable());
    let status = |s| DeliveryError::Status {
        status: s,
        body: String::new(),
    };
    assert!(status(500).is_retryable());
    assert!(status(503).is_retryable());
    assert!(status(429).is_retryable());
    assert!(!status(400).is_retryable());
    assert!(!status(404).is_retryable());
}

#[test]
fn test_extract_reply() {
    assert_eq!(extract_reply(""), None);
    assert_eq!(extract_reply("  Accepted \n"), Some("Accepted".into()));
    assert_eq!(
        extract_reply(r#"{"reply": "Hi there"}"#),
        Some("Hi there".into())
    );
    assert_eq!(
        extract_reply(r#"{"message": "ok", "text": "ignored"}"#),
        Some("ok".into())
    );
    assert_eq!(extract_reply(r#"{"count": 3}"#), None);
    assert_eq!(extract_reply(r#""quoted""#), Some("quoted".into()));
}

#[tokio::test]
async fn test_unconfigured_fails_terminally() {
    let delivery = WebhookDelivery::with_client(Client::new(), "");
    assert!(!delivery.is_configured());
    let err = delivery.deliver(&payload()).await.unwrap_err();
    assert_eq!(err, DeliveryError::NotConfigured);
}

#[tokio::test]
async fn test_posts_json_and_returns_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .and(body_json(serde_json::json!({
            "user_id": "u1",
            "channel": "web",
            "text": "hello world"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string("Accepted"))
        .expect(1)
        .mount(&server)
        .await;

    let ack = delivery_for(&server).deliver(&payload()).await.unwrap();
    assert_eq!(ack.status, 200);
    assert_eq!(ack.reply.as_deref(), Some("Accepted"));
}

#[tokio::test]
async fn test_server_error_is_retryable_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let err = delivery_for(&server).deliver(&payload()).await.unwrap_err();
    assert_eq!(
        err,
        DeliveryError::Status {
            status: 502,
            body: "bad gateway".into()
        }
    );
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_client_error_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let err = delivery_for(&server).deliver(&payload()).await.unwrap_err();
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_timeout_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let client = http_client(Duration::from_millis(200));
    let delivery = WebhookDelivery::with_client(client, server.uri());
    let err = delivery.deliver(&payload()).await.unwrap_err();
    assert_eq!(err, DeliveryError::Timeout);
}

#[tokio::test]
async fn test_webhook_sends_fixed_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_json(serde_json::json!({
            "user_id": "test_user",
            "channel": "test",
            "text": "Test message from chatcoalesce"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let ack = delivery_for(&server).test_webhook().await.unwrap();
    assert_eq!(ack.status, 200);
    assert_eq!(ack.reply, None);
}
