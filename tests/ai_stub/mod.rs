use std::io::Read as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::Value;

#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum StubBehavior {
    /// Reply with a fenced JSON payload wrapped in chatty prose.
    Payload,
    /// Reply with prose that contains no JSON object at all.
    Prose,
    /// Reply with HTTP 401 and a provider-style error body.
    Unauthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Api {
    OpenAiResponses,
    AnthropicMessages,
}

/// Serves `POST /v1/responses` (OpenAI) and `POST /v1/messages` (Anthropic).
pub struct ProviderStub {
    pub base_url: String,
    requests: Arc<AtomicUsize>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProviderStub {
    pub fn spawn(behavior: StubBehavior) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start provider stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1");
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let is_post = request.method() == &tiny_http::Method::Post;
                let path = request.url().to_owned();
                let api = match path.as_str() {
                    "/v1/responses" if is_post => Api::OpenAiResponses,
                    "/v1/messages" if is_post => Api::AnthropicMessages,
                    _ => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("not found").with_status_code(404),
                        );
                        continue;
                    }
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let authorized = request.headers().iter().any(|h| match api {
                    Api::OpenAiResponses => {
                        h.field.equiv("Authorization") && h.value.as_str() == "Bearer test-key"
                    }
                    Api::AnthropicMessages => {
                        h.field.equiv("x-api-key") && h.value.as_str() == "test-key"
                    }
                });
                if matches!(behavior, StubBehavior::Unauthorized) || !authorized {
                    let body = match api {
                        Api::OpenAiResponses => {
                            r#"{"error":{"message":"Incorrect API key provided"}}"#
                        }
                        Api::AnthropicMessages => {
                            r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#
                        }
                    };
                    let _ = request
                        .respond(tiny_http::Response::from_string(body).with_status_code(401));
                    continue;
                }

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }

                let parsed: Value = match serde_json::from_str(&body) {
                    Ok(value) => value,
                    Err(_) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("invalid json").with_status_code(400),
                        );
                        continue;
                    }
                };

                let prompt = match api {
                    Api::OpenAiResponses => parsed.get("input").and_then(|v| v.as_str()),
                    Api::AnthropicMessages => parsed
                        .get("messages")
                        .and_then(|m| m.get(0))
                        .and_then(|m| m.get("content"))
                        .and_then(|v| v.as_str()),
                };
                let Some(prompt) = prompt else {
                    let _ = request.respond(
                        tiny_http::Response::from_string("missing input").with_status_code(400),
                    );
                    continue;
                };

                let output_text = if prompt == "Respond with only: OK" {
                    "OK".to_owned()
                } else {
                    let Some(section) = section_name(prompt) else {
                        let _ = request.respond(
                            tiny_http::Response::from_string("missing section line")
                                .with_status_code(400),
                        );
                        continue;
                    };
                    if !prompt.contains("BEGIN_SECTION_TEXT\n") {
                        let _ = request.respond(
                            tiny_http::Response::from_string("missing section text markers")
                                .with_status_code(400),
                        );
                        continue;
                    }
                    match behavior {
                        StubBehavior::Payload => payload_response(&section),
                        StubBehavior::Prose => "I am unable to summarize this section.".to_owned(),
                        StubBehavior::Unauthorized => unreachable!("handled above"),
                    }
                };

                let model = parsed
                    .get("model")
                    .cloned()
                    .unwrap_or(Value::String("stub-model".to_owned()));
                let response_body = match api {
                    Api::OpenAiResponses => serde_json::json!({
                        "id": "resp_stub",
                        "object": "response",
                        "model": model,
                        "output": [
                            {
                                "type": "message",
                                "role": "assistant",
                                "content": [
                                    { "type": "output_text", "text": output_text }
                                ]
                            }
                        ]
                    }),
                    Api::AnthropicMessages => {
                        if parsed.get("max_tokens").and_then(Value::as_u64).is_none() {
                            let _ = request.respond(
                                tiny_http::Response::from_string("max_tokens is required")
                                    .with_status_code(400),
                            );
                            continue;
                        }
                        serde_json::json!({
                            "id": "msg_stub",
                            "type": "message",
                            "role": "assistant",
                            "model": model,
                            "content": [{ "type": "text", "text": output_text }],
                            "stop_reason": "end_turn"
                        })
                    }
                };

                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("build header");
                let response = tiny_http::Response::from_string(response_body.to_string())
                    .with_status_code(200)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    #[allow(dead_code)]
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for ProviderStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// `Section: <title> (<name>)` → `<name>`.
fn section_name(prompt: &str) -> Option<String> {
    let line = prompt.lines().find(|l| l.starts_with("Section: "))?;
    let open = line.rfind('(')?;
    let close = line.rfind(')')?;
    (open < close).then(|| line[open + 1..close].to_owned())
}

fn payload_response(section: &str) -> String {
    let payload = serde_json::json!({
        "summary_markdown": format!(
            "## Overview\n\nStub overview of the {section} section, long enough to pass the short-summary check.\n\n## Key Concepts\n\n- {section} concept\n\n## Glossary\n\n- stub: a stand-in\n"
        ),
        "index": {
            "concepts": [{ "name": format!("{section}-concept"), "description": "stub" }],
            "terms": [{ "term": "stub", "definition": "a stand-in" }],
            "topics": [{ "category": "Testing", "subtopics": ["stubs"] }],
        },
    });
    format!("Here is the summary you asked for:\n\n```json\n{payload:#}\n```\n")
}
