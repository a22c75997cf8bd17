use super::*;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn resolver(server: &MockServer, api_key: &str) -> OpenAiMediaResolver {
    OpenAiMediaResolver::new(&MediaConfig {
        api_key: api_key.to_string(),
        api_base: format!("{}/v1/", server.uri()),
        whisper_prompt: "pedido, envío".to_string(),
        ..MediaConfig::default()
    })
}

#[tokio::test]
async fn test_transcribe_downloads_and_posts_multipart() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/voice.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/transcriptions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_string_contains("pedido"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "  hola mundo "})))
        .expect(1)
        .mount(&server)
        .await;

    let text = resolver(&server, "sk-test")
        .transcribe(&format!("{}/files/voice.mp3", server.uri()))
        .await
        .unwrap();
    assert_eq!(text, "hola mundo");
}

#[tokio::test]
async fn test_transcribe_download_failure_is_media_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = resolver(&server, "sk-test")
        .transcribe(&format!("{}/missing.mp3", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoalesceError::Media(_)));
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn test_transcription_api_error_surfaces_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 8]))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/transcriptions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let err = resolver(&server, "sk-test")
        .transcribe(&format!("{}/a.mp3", server.uri()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("429"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_extract_image_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("image_url"))
        .and(body_string_contains("https://cdn.example/receipt.png"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "TOTAL $42\n"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let text = resolver(&server, "sk-test")
        .extract_image_text("https://cdn.example/receipt.png")
        .await
        .unwrap();
    assert_eq!(text, "TOTAL $42");
}

#[tokio::test]
async fn test_missing_api_key_fails_without_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let r = resolver(&server, "");
    assert!(matches!(
        r.transcribe("https://x/a.mp3").await,
        Err(CoalesceError::Media(_))
    ));
    assert!(matches!(
        r.extract_image_text("https://x/a.png").await,
        Err(CoalesceError::Media(_))
    ));
}
