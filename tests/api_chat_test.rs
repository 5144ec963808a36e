//! Integration tests for the streaming chat exchange

mod test_utils;

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use futures_util::StreamExt;
    use mockito::Matcher;
    use serde_json::{Value, json};
    use serial_test::serial;
    use tower::util::ServiceExt;

    use llamachat::chat::ConversationStore;
    use llamachat::chat::models::NewTurn;
    use crate::test_utils::{HELLO_STREAM, body_to_string, test_app, wait_for_finalized};

    fn chat_request(payload: Value) -> Request<Body> {
        Request::builder()
            .uri("/api/ollama/chat")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    fn chat_id(response: &axum::response::Response) -> String {
        response
            .headers()
            .get("X-Chat-ID")
            .expect("Missing X-Chat-ID header")
            .to_str()
            .unwrap()
            .to_string()
    }

    /// Tests a full exchange is relayed and saved once
    #[tokio::test]
    #[serial]
    async fn it_streams_and_saves_a_new_chat() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat")
            .match_body(Matcher::PartialJson(json!({
                "model": "llama3",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .with_status(200)
            .with_header("content-type", "application/x-ndjson")
            .with_body(HELLO_STREAM)
            .create_async()
            .await;
        let app = test_app(&server.url()).await;

        let response = app
            .router
            .clone()
            .oneshot(chat_request(json!({
                "model": "llama3",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/x-ndjson"
        );
        let id = chat_id(&response);

        let body = body_to_string(response.into_body()).await;
        let lines: Vec<&str> = body.lines().filter(|l| !l.trim().is_empty()).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"content\":\"He\""));
        assert!(lines[1].contains("\"done\":true"));
        mock.assert_async().await;

        let chat = wait_for_finalized(&app.store, &id).await;
        assert_eq!(chat.name, "hi");
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].user, "hi");
        assert_eq!(chat.messages[0].ai, "Hello");
        assert_eq!(app.store.count().await.unwrap(), 1);
    }

    /// Tests a follow up exchange keeps the chat id and appends a turn
    #[tokio::test]
    #[serial]
    async fn it_continues_an_existing_chat() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body(HELLO_STREAM)
            .expect(2)
            .create_async()
            .await;
        let app = test_app(&server.url()).await;

        let response = app
            .router
            .clone()
            .oneshot(chat_request(json!({
                "model": "llama3",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        let id = chat_id(&response);
        body_to_string(response.into_body()).await;

        let response = app
            .router
            .clone()
            .oneshot(chat_request(json!({
                "model": "llama3",
                "chatId": id,
                "messages": [
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "Hello"},
                    {"role": "user", "content": "again"}
                ]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(chat_id(&response), id);
        body_to_string(response.into_body()).await;

        let chat = wait_for_finalized(&app.store, &id).await;
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[1].user, "again");
        assert_eq!(chat.messages[1].ai, "Hello");
        assert_eq!(app.store.count().await.unwrap(), 1);
    }

    /// Tests the partial response is saved when the client goes away
    #[tokio::test]
    #[serial]
    async fn it_saves_partial_response_on_disconnect() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_chunked_body(|w| {
                w.write_all(b"{\"message\":{\"role\":\"assistant\",\"content\":\"He\"},\"done\":false}\n")?;
                w.flush()?;
                std::thread::sleep(Duration::from_secs(2));
                w.write_all(b"{\"message\":{\"role\":\"assistant\",\"content\":\"llo\"},\"done\":true}\n")
            })
            .create_async()
            .await;
        let app = test_app(&server.url()).await;

        let response = app
            .router
            .clone()
            .oneshot(chat_request(json!({
                "model": "llama3",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        // The id is known before any of the body has been read
        let id = chat_id(&response);

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert!(std::str::from_utf8(&first).unwrap().contains("\"He\""));
        drop(body);

        let chat = wait_for_finalized(&app.store, &id).await;
        assert_eq!(chat.messages[0].ai, "He\n[Error: Client Disconnected]");
    }

    /// Tests an unknown model is reported without creating a chat
    #[tokio::test]
    #[serial]
    async fn it_rejects_unknown_model() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"model \"nope\" not found, try pulling it first"}"#)
            .create_async()
            .await;
        let app = test_app(&server.url()).await;

        let response = app
            .router
            .clone()
            .oneshot(chat_request(json!({
                "model": "nope",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("X-Chat-ID").is_none());
        let body: Value = serde_json::from_str(&body_to_string(response.into_body()).await).unwrap();
        assert!(body["error"].as_str().unwrap().contains("not found"));
        assert_eq!(app.store.count().await.unwrap(), 0);
    }

    /// Tests backend failures before streaming map to gateway errors
    #[tokio::test]
    #[serial]
    async fn it_maps_backend_failures() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat")
            .with_status(500)
            .with_body(r#"{"error":"out of memory"}"#)
            .create_async()
            .await;
        let app = test_app(&server.url()).await;

        let response = app
            .router
            .clone()
            .oneshot(chat_request(json!({
                "model": "llama3",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        // Nothing listens on the discard port
        let app = test_app("http://127.0.0.1:9").await;
        let response = app
            .router
            .clone()
            .oneshot(chat_request(json!({
                "model": "llama3",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(app.store.count().await.unwrap(), 0);
    }

    /// Tests malformed requests are rejected with a 400
    #[tokio::test]
    async fn it_validates_requests() {
        let app = test_app("http://127.0.0.1:9").await;

        for payload in [
            json!({"messages": [{"role": "user", "content": "hi"}]}),
            json!({"model": "llama3", "messages": []}),
            json!({"model": "llama3", "messages": [{"role": "assistant", "content": "hi"}]}),
            json!({"model": "llama3", "messages": [{"role": "user", "content": ""}]}),
            json!({"model": "llama3", "messages": "hi"}),
        ] {
            let response = app
                .router
                .clone()
                .oneshot(chat_request(payload.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", payload);
            let body: Value =
                serde_json::from_str(&body_to_string(response.into_body()).await).unwrap();
            assert!(body["error"].is_string());
        }
    }

    /// Tests a second exchange on a busy chat is refused
    #[tokio::test]
    #[serial]
    async fn it_rejects_concurrent_exchange_on_a_chat() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body(HELLO_STREAM)
            .create_async()
            .await;
        let app = test_app(&server.url()).await;
        let id = app.store.create(NewTurn::new("first")).await.unwrap();

        let inflight = app.state.read().unwrap().inflight.clone();
        let claim = inflight.claim(&id, Duration::ZERO).await.unwrap();

        let response = app
            .router
            .clone()
            .oneshot(chat_request(json!({
                "model": "llama3",
                "chatId": id,
                "messages": [{"role": "user", "content": "second"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        drop(claim);

        let chat = app.store.get(&id).await.unwrap();
        assert_eq!(chat.messages.len(), 1);
    }

    /// Tests a turn left open by a dead exchange is closed first
    #[tokio::test]
    #[serial]
    async fn it_recovers_orphaned_turn() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body(HELLO_STREAM)
            .create_async()
            .await;
        let app = test_app(&server.url()).await;
        let id = app.store.create(NewTurn::new("first")).await.unwrap();

        let response = app
            .router
            .clone()
            .oneshot(chat_request(json!({
                "model": "llama3",
                "chatId": id,
                "messages": [{"role": "user", "content": "second"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_to_string(response.into_body()).await;

        let chat = wait_for_finalized(&app.store, &id).await;
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].ai, "[Error: Interrupted]");
        assert_eq!(chat.messages[1].ai, "Hello");
    }

    /// Tests an unknown chat id starts a new chat
    #[tokio::test]
    #[serial]
    async fn it_starts_new_chat_for_unknown_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body(HELLO_STREAM)
            .create_async()
            .await;
        let app = test_app(&server.url()).await;

        let response = app
            .router
            .clone()
            .oneshot(chat_request(json!({
                "model": "llama3",
                "chatId": "does-not-exist",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = chat_id(&response);
        assert_ne!(id, "does-not-exist");
        body_to_string(response.into_body()).await;

        let chat = wait_for_finalized(&app.store, &id).await;
        assert_eq!(chat.messages[0].ai, "Hello");
    }

    /// Tests a failure mid-stream ends the body with an error line
    #[tokio::test]
    #[serial]
    async fn it_reports_mid_stream_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body(concat!(
                "{\"message\":{\"role\":\"assistant\",\"content\":\"He\"},\"done\":false}\n",
                "{\"error\":\"model runner crashed\"}\n",
            ))
            .create_async()
            .await;
        let app = test_app(&server.url()).await;

        let response = app
            .router
            .clone()
            .oneshot(chat_request(json!({
                "model": "llama3",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        let id = chat_id(&response);
        let body = body_to_string(response.into_body()).await;
        let last: Value = serde_json::from_str(body.lines().last().unwrap()).unwrap();
        assert_eq!(last, json!({"error": "model runner crashed", "done": true}));

        let chat = wait_for_finalized(&app.store, &id).await;
        assert_eq!(chat.messages[0].ai, "He\n[Error: model runner crashed]");
    }

    /// Tests the model catalog is passed through
    #[tokio::test]
    #[serial]
    async fn it_lists_models() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"llama3:latest","size":1},{"name":"llava:7b"}]}"#)
            .create_async()
            .await;
        let app = test_app(&server.url()).await;

        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/ollama/list")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_to_string(response.into_body()).await).unwrap();
        assert_eq!(body, json!({"models": ["llama3:latest", "llava:7b"]}));
    }
}
