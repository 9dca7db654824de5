use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::Value;

/// Excerpts containing this marker get a non-retryable 400.
#[allow(dead_code)]
pub const FAIL_MARKER: &str = "FAIL_THIS_CHUNK";

#[derive(Debug, Clone, Default)]
pub struct OpenAiStubConfig {
    /// Sleep before answering, so concurrent callers overlap.
    pub delay: Duration,
}

pub struct OpenAiStub {
    pub base_url: String,
    calls: Arc<AtomicUsize>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OpenAiStub {
    pub fn spawn(config: OpenAiStubConfig) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start openai stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1");
        let calls = Arc::new(AtomicUsize::new(0));

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let counter = Arc::clone(&calls);

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let counter = Arc::clone(&counter);
                let delay = config.delay;
                thread::spawn(move || handle_request(request, &counter, delay));
            }
        });

        Self {
            base_url,
            calls,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Chat completions served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Drop for OpenAiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_request(mut request: tiny_http::Request, calls: &AtomicUsize, delay: Duration) {
    let path = request.url().to_string();
    if request.method() != &tiny_http::Method::Post || path != "/v1/chat/completions" {
        let _ =
            request.respond(tiny_http::Response::from_string("not found").with_status_code(404));
        return;
    }

    let mut body = String::new();
    if request.as_reader().read_to_string(&mut body).is_err() {
        let _ = request.respond(
            tiny_http::Response::from_string("invalid request body").with_status_code(400),
        );
        return;
    }
    let Ok(parsed) = serde_json::from_str::<Value>(&body) else {
        let _ = request
            .respond(tiny_http::Response::from_string("invalid json").with_status_code(400));
        return;
    };

    calls.fetch_add(1, Ordering::SeqCst);
    if !delay.is_zero() {
        thread::sleep(delay);
    }

    let user = parsed
        .pointer("/messages/1/content")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let excerpt = user
        .split_once("## Excerpt\n")
        .map(|(_, rest)| rest)
        .unwrap_or(user);

    if excerpt.contains(FAIL_MARKER) {
        let error = serde_json::json!({ "error": { "message": "excerpt refused by stub" } });
        let _ = request.respond(json_response(error.to_string(), 400));
        return;
    }

    let first_words: Vec<&str> = excerpt.split_whitespace().take(4).collect();
    let first_word = first_words.first().copied().unwrap_or("nothing");
    let analysis = serde_json::json!({
        "summary": format!("Stub summary of: {}", first_words.join(" ")),
        "key_points": [format!("starts with {first_word}")],
        "topics": ["stub"],
        "sentiment": "neutral",
        "seo_analysis": "stub seo",
        "readability": "stub readability"
    });
    let response_body = serde_json::json!({
        "id": "chatcmpl_stub",
        "object": "chat.completion",
        "model": parsed.get("model").cloned().unwrap_or(Value::String("stub-model".to_owned())),
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": analysis.to_string() },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120 }
    });
    let _ = request.respond(json_response(response_body.to_string(), 200));
}

fn json_response(body: String, status: u16) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("build header");
    tiny_http::Response::from_string(body)
        .with_status_code(status)
        .with_header(header)
}
