use super::*;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Response;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use tokio::net::TcpListener;

/// Serves every request with `status` and echoes the request's
/// authorization header back in the body.
async fn spawn_echo_server(status: u16) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let service = service_fn(move |req: hyper::Request<Incoming>| async move {
                    let auth = req
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    let echo = format!("{}|{}", auth, String::from_utf8_lossy(&body));
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(status)
                            .body(Full::new(Bytes::from(echo)))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    format!("http://{}", addr)
}

#[test]
fn test_http_client_user_agent() {
    install_crypto_provider();
    let client = HttpClient::new(Duration::from_secs(5)).unwrap();

    let expected_user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    assert_eq!(client.user_agent, expected_user_agent);
}

#[test]
fn test_reply_success_range() {
    let reply = |status| HttpReply {
        status,
        body: Bytes::from_static(b"ok"),
    };
    assert!(reply(200).is_success());
    assert!(reply(204).is_success());
    assert!(!reply(302).is_success());
    assert!(!reply(401).is_success());
    assert!(!reply(500).is_success());
    assert_eq!(reply(200).text(), "ok");
}

#[test]
fn test_redact_hides_bot_token() {
    assert_eq!(
        redact("https://api.telegram.org/bot123:secret/sendMessage"),
        "https://api.telegram.org/bot***"
    );
    assert_eq!(
        redact("https://api.openai.com/v1/chat/completions"),
        "https://api.openai.com/v1/chat/completions"
    );
}

#[tokio::test]
async fn test_post_json_sends_body_and_bearer() {
    install_crypto_provider();
    let base = spawn_echo_server(200).await;
    let client = HttpClient::new(Duration::from_secs(5)).unwrap();

    let reply = client
        .post_json(&format!("{}/echo", base), Some("sk-test"), &serde_json::json!({"k": "v"}))
        .await
        .expect("request should succeed");

    assert!(reply.is_success());
    assert_eq!(reply.text(), r#"Bearer sk-test|{"k":"v"}"#);
}

#[tokio::test]
async fn test_post_json_returns_error_statuses_as_replies() {
    install_crypto_provider();
    let base = spawn_echo_server(503).await;
    let client = HttpClient::new(Duration::from_secs(5)).unwrap();

    let reply = client
        .post_json(&format!("{}/echo", base), None, &serde_json::json!({}))
        .await
        .expect("a 503 is still a reply");

    assert_eq!(reply.status, 503);
    assert!(!reply.is_success());
    assert!(reply.text().starts_with("none|"));
}

#[tokio::test]
async fn test_post_json_connection_refused_is_error() {
    install_crypto_provider();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = HttpClient::new(Duration::from_secs(5)).unwrap();
    let result = client
        .post_json(&format!("http://127.0.0.1:{}/", port), None, &serde_json::json!({}))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_post_json_oversized_response_is_error() {
    install_crypto_provider();
    let base = spawn_echo_server(200).await;
    let client = HttpClient::new(Duration::from_secs(5)).unwrap();

    // The echo server returns the request body, so the reply exceeds the cap.
    let payload = serde_json::json!({ "blob": "x".repeat(MAX_RESPONSE_BYTES + 16) });
    let result = client.post_json(&format!("{}/echo", base), None, &payload).await;

    let err = result.expect_err("an oversized body should not be collected");
    assert!(err.to_string().contains("Response body rejected"));
}

#[tokio::test]
async fn test_post_json_response_under_cap_is_collected() {
    install_crypto_provider();
    let base = spawn_echo_server(200).await;
    let client = HttpClient::new(Duration::from_secs(5)).unwrap();

    let payload = serde_json::json!({ "blob": "x".repeat(64 * 1024) });
    let reply = client
        .post_json(&format!("{}/echo", base), None, &payload)
        .await
        .expect("a body under the cap is collected");

    assert!(reply.body.len() > 64 * 1024);
}
