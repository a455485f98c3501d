use async_trait::async_trait;
use chatgpt::client::ChatGPT;
use chatgpt::types::{ChatMessage, CompletionResponse, ResponseChunk, Role as ChatRole};
use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ModelSettings;
use crate::conversation::Role;

use super::backend::{ChatRequest, CompletionRequest, FragmentStream, ModelBackend};
use super::GatewayError;

const SCHEMA_INSTRUCTION: &str =
    "Réponds uniquement avec un document JSON valide, sans texte autour, conforme à ce schéma JSON :";

/// Fragments buffered between the HTTP stream and the consumer.
const FRAGMENT_BUFFER: usize = 64;

/// OpenAI chat completions through `chatgpt_rs`.
pub struct OpenAiBackend {
    chat_gpt: ChatGPT,
}

impl OpenAiBackend {
    pub fn new(api_key: &str, settings: &ModelSettings) -> Result<Self, GatewayError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(GatewayError::SessionInit("the API key is empty".to_string()));
        }

        let mut chat_gpt =
            ChatGPT::new(api_key).map_err(|err| GatewayError::SessionInit(err.to_string()))?;
        chat_gpt.config.engine = settings.engine;
        chat_gpt.config.temperature = settings.temperature;
        chat_gpt.config.timeout = settings.timeout;

        Ok(Self { chat_gpt })
    }
}

/// Forwards content deltas until the service marks the end of the reply.
/// A stream that stops before `[DONE]` is a transport failure.
async fn forward_reply(
    chat_gpt: ChatGPT,
    history: Vec<ChatMessage>,
    sender: mpsc::Sender<Result<String, GatewayError>>,
) -> Result<(), GatewayError> {
    let stream = chat_gpt
        .send_history_streaming(&history)
        .await
        .map_err(|err| GatewayError::Transport(err.to_string()))?;
    futures::pin_mut!(stream);

    while let Some(chunk) = stream.next().await {
        match chunk {
            ResponseChunk::Content { delta, .. } => {
                if sender.send(Ok(delta)).await.is_err() {
                    debug!("Reply consumer went away, dropping the rest of the stream");
                    return Ok(());
                }
            }
            ResponseChunk::Done => return Ok(()),
            _ => {}
        }
    }

    Err(GatewayError::Transport(
        "reply stream ended before completion".to_string(),
    ))
}

fn to_history(request: ChatRequest) -> Vec<ChatMessage> {
    let mut history = Vec::with_capacity(request.history.len() + 2);
    history.push(ChatMessage {
        role: ChatRole::System,
        content: request.system_instructions,
    });
    history.extend(request.history.into_iter().map(|turn| ChatMessage {
        role: match turn.role {
            Role::User => ChatRole::User,
            Role::Model => ChatRole::Assistant,
        },
        content: turn.text,
    }));
    history.push(ChatMessage {
        role: ChatRole::User,
        content: request.message,
    });
    history
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    async fn open_stream(&self, request: ChatRequest) -> Result<FragmentStream, GatewayError> {
        let mut chat_gpt = self.chat_gpt.clone();
        chat_gpt.config.temperature = request.temperature;
        let history = to_history(request);

        // The HTTP stream is driven by its own task so the reply outlives this call
        let (sender, receiver) = mpsc::channel(FRAGMENT_BUFFER);
        let pump = tokio::spawn(forward_reply(chat_gpt, history, sender.clone()));
        tokio::spawn(async move {
            // chatgpt_rs panics inside its stream when the connection breaks
            // mid-reply, so a dead pump task is a failed reply too
            let outcome = match pump.await {
                Ok(outcome) => outcome,
                Err(err) => Err(GatewayError::Transport(format!(
                    "reply stream aborted: {}",
                    err
                ))),
            };
            if let Err(err) = outcome {
                warn!("Reply stream failed: {}", err);
                let _ = sender.send(Err(err)).await;
            }
        });

        Ok(ReceiverStream::new(receiver).boxed())
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, GatewayError> {
        let prompt = format!(
            "{}\n\n{}\n{}",
            request.prompt, SCHEMA_INSTRUCTION, request.schema
        );

        let response: CompletionResponse = self
            .chat_gpt
            .send_message(prompt)
            .await
            .map_err(|err| {
                warn!("Completion request failed: {}", err);
                GatewayError::Transport(err.to_string())
            })?;

        Ok(response.message().content.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::backend::Turn;
    use crate::gateway::{ModelGateway, FALLBACK_FRAGMENT};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn history_starts_with_instructions_and_ends_with_the_message() {
        let history = to_history(ChatRequest {
            system_instructions: "Tu es un tuteur.".to_string(),
            temperature: 0.7,
            history: vec![Turn::user("Bonjour"), Turn::model("Salut !")],
            message: "Le diaphragme ?".to_string(),
        });

        let roles: Vec<_> = history.iter().map(|m| m.role.clone()).collect();
        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::User]
        );
        assert_eq!(history[0].content, "Tu es un tuteur.");
        assert_eq!(history[3].content, "Le diaphragme ?");
    }

    /// Answers one chat completion request with `events`, announcing
    /// `declared_len` bytes of body. Declaring more than is sent makes the
    /// connection close in the middle of the reply.
    async fn serve_once(events: String, declared_len: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\n\r\n",
                declared_len
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(events.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
        });
        format!("http://{}/v1/chat/completions", address)
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut request = Vec::new();
        let mut buffer = [0u8; 4096];
        loop {
            let read = socket.read(&mut buffer).await.unwrap();
            if read == 0 {
                return;
            }
            request.extend_from_slice(&buffer[..read]);
            let text = String::from_utf8_lossy(&request);
            if let Some(end) = text.find("\r\n\r\n") {
                let body_len = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        if name.eq_ignore_ascii_case("content-length") {
                            value.trim().parse::<usize>().ok()
                        } else {
                            None
                        }
                    })
                    .unwrap_or(0);
                if request.len() >= end + 4 + body_len {
                    return;
                }
            }
        }
    }

    fn content_event(delta: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "index": 0, "delta": { "content": delta } }] })
        )
    }

    fn gateway_for(api_url: &str) -> ModelGateway<OpenAiBackend> {
        let mut backend = OpenAiBackend::new("sk-test", &ModelSettings::default()).unwrap();
        backend.chat_gpt.config.api_url = api_url.parse().unwrap();
        let mut gateway = ModelGateway::new("Tu es un tuteur.", 0.7);
        gateway.connect(backend).unwrap();
        gateway
    }

    #[tokio::test]
    async fn completed_reply_streams_every_fragment() {
        let events = format!(
            "{}{}data: [DONE]\n\n",
            content_event("Le cœur"),
            content_event(" pompe le sang.")
        );
        let url = serve_once(events.clone(), events.len()).await;
        let mut gateway = gateway_for(&url);

        let stream = gateway.stream_reply("Le cœur ?").await.unwrap();
        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments, vec!["Le cœur", " pompe le sang."]);
        assert_eq!(gateway.session().unwrap().turns(), 2);
    }

    #[tokio::test]
    async fn connection_lost_mid_reply_ends_with_the_fallback() {
        let events = content_event("Le cœur");
        let url = serve_once(events.clone(), events.len() + 200).await;
        let mut gateway = gateway_for(&url);

        let stream = gateway.stream_reply("Le cœur ?").await.unwrap();
        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments, vec!["Le cœur", FALLBACK_FRAGMENT]);
        assert_eq!(gateway.session().unwrap().turns(), 0);
    }

    #[tokio::test]
    async fn reply_without_end_marker_is_a_failure() {
        let events = content_event("Le cœur");
        let url = serve_once(events.clone(), events.len()).await;
        let mut gateway = gateway_for(&url);

        let stream = gateway.stream_reply("Le cœur ?").await.unwrap();
        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments.last().map(String::as_str), Some(FALLBACK_FRAGMENT));
        assert_eq!(gateway.session().unwrap().turns(), 0);
    }

    #[test]
    fn empty_key_is_refused() {
        let settings = ModelSettings::default();
        assert!(matches!(
            OpenAiBackend::new("   ", &settings),
            Err(GatewayError::SessionInit(_))
        ));
    }
}
