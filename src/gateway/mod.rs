pub mod backend;
pub mod openai;
#[cfg(test)]
pub mod testing;

use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, Stream, StreamExt};
use log::{debug, info, warn};
use thiserror::Error;

use crate::quiz::{schema, QuizQuestion};
use backend::{ChatRequest, CompletionRequest, FragmentStream, ModelBackend, Turn};

/// A quiz round trip in flight.
pub type QuizFuture = BoxFuture<'static, Result<Vec<QuizQuestion>, GatewayError>>;

/// Shown in place of the rest of a reply when the service fails mid-answer.
pub const FALLBACK_FRAGMENT: &str = "Désolé, j'ai rencontré une erreur. Veuillez réessayer.";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("model session could not be initialized: {0}")]
    SessionInit(String),
    #[error("model service request failed: {0}")]
    Transport(String),
    #[error("quiz generation failed: {0}")]
    QuizGeneration(String),
}

/// Conversation memory held for the model. A reset replaces the whole handle.
#[derive(Debug)]
pub struct ChatSession {
    number: u64,
    system_instructions: String,
    temperature: f32,
    history: Arc<Mutex<Vec<Turn>>>,
}

impl ChatSession {
    fn new(number: u64, system_instructions: String, temperature: f32) -> Self {
        Self {
            number,
            system_instructions,
            temperature,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn request(&self, message: &str) -> ChatRequest {
        let history = match self.history.lock() {
            Ok(history) => history.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        ChatRequest {
            system_instructions: self.system_instructions.clone(),
            temperature: self.temperature,
            history,
            message: message.to_string(),
        }
    }

    #[cfg(test)]
    pub fn turns(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or(0)
    }
}

pub struct ModelGateway<B> {
    backend: Option<Arc<B>>,
    session: Option<ChatSession>,
    system_instructions: String,
    temperature: f32,
    sessions_started: u64,
}

impl<B: ModelBackend> ModelGateway<B> {
    /// A gateway without a client. Every call fails until `connect` succeeds.
    pub fn new(system_instructions: impl Into<String>, temperature: f32) -> Self {
        Self {
            backend: None,
            session: None,
            system_instructions: system_instructions.into(),
            temperature,
            sessions_started: 0,
        }
    }

    pub fn connect(&mut self, backend: B) -> Result<(), GatewayError> {
        info!("Model client connected");
        self.backend = Some(Arc::new(backend));
        self.reset_session()
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    /// Replaces the current session with an empty one using these settings.
    pub fn initialize(
        &mut self,
        system_instructions: impl Into<String>,
        temperature: f32,
    ) -> Result<(), GatewayError> {
        self.system_instructions = system_instructions.into();
        self.temperature = temperature;
        self.session = None;

        if self.backend.is_none() {
            return Err(GatewayError::SessionInit(
                "no model client, an API key is required".to_string(),
            ));
        }

        self.sessions_started += 1;
        debug!("Starting chat session #{}", self.sessions_started);
        self.session = Some(ChatSession::new(
            self.sessions_started,
            self.system_instructions.clone(),
            self.temperature,
        ));
        Ok(())
    }

    pub fn reset_session(&mut self) -> Result<(), GatewayError> {
        let instructions = self.system_instructions.clone();
        self.initialize(instructions, self.temperature)
    }

    #[cfg(test)]
    pub fn session(&self) -> Option<&ChatSession> {
        self.session.as_ref()
    }

    #[cfg(test)]
    pub fn sessions_started(&self) -> u64 {
        self.sessions_started
    }

    /// Sends `message` in the current session and returns the reply as fragments.
    ///
    /// Service failures never surface here: the stream ends with
    /// [`FALLBACK_FRAGMENT`] instead. Only a missing client is an error.
    pub async fn stream_reply(&mut self, message: &str) -> Result<ReplyStream, GatewayError> {
        if self.session.is_none() {
            debug!("No chat session yet, starting one");
            self.reset_session()?;
        }
        let (backend, session) = match (&self.backend, &self.session) {
            (Some(backend), Some(session)) => (Arc::clone(backend), session),
            _ => {
                return Err(GatewayError::SessionInit(
                    "no active chat session".to_string(),
                ))
            }
        };

        let request = session.request(message);
        let history = Arc::downgrade(&session.history);
        debug!(
            "Streaming reply in session #{} with {} prior turns",
            session.number,
            request.history.len()
        );

        let fragments = match backend.open_stream(request).await {
            Ok(fragments) => fragments,
            Err(err) => stream::iter(vec![Err(err)]).boxed(),
        };
        Ok(ReplyStream::new(fragments, Turn::user(message), history))
    }

    /// Asks for a complete quiz about `topic_title`. Either every question is
    /// valid or nothing is returned.
    ///
    /// The returned future owns what it needs, so it can be awaited after the
    /// gateway itself is no longer borrowed.
    pub fn generate_quiz(&self, topic_title: &str) -> QuizFuture {
        let backend = self.backend.clone();
        let topic_title = topic_title.to_string();

        async move {
            let backend = backend.ok_or_else(|| {
                GatewayError::QuizGeneration("no model client, an API key is required".to_string())
            })?;

            info!("Generating quiz for {:?}", topic_title);
            let request = CompletionRequest {
                prompt: schema::quiz_prompt(&topic_title),
                schema: schema::quiz_schema(),
            };
            let raw = backend.complete(request).await.map_err(|err| {
                warn!("Quiz request failed: {}", err);
                GatewayError::QuizGeneration(err.to_string())
            })?;

            schema::parse_questions(&raw).map_err(|err| {
                warn!("Quiz response rejected: {}", err);
                GatewayError::QuizGeneration(err.to_string())
            })
        }
        .boxed()
    }
}

/// The fragments of one model reply, in the order the service produced them.
///
/// Finite and single-use: once it has returned `None` it keeps doing so. When
/// the reply completes normally the exchange is added to the session memory,
/// unless that session has been replaced in the meantime.
pub struct ReplyStream {
    fragments: Option<FragmentStream>,
    prompt: Option<Turn>,
    reply: String,
    history: Weak<Mutex<Vec<Turn>>>,
}

impl ReplyStream {
    fn new(fragments: FragmentStream, prompt: Turn, history: Weak<Mutex<Vec<Turn>>>) -> Self {
        Self {
            fragments: Some(fragments),
            prompt: Some(prompt),
            reply: String::new(),
            history,
        }
    }

    fn remember_exchange(&mut self) {
        let Some(prompt) = self.prompt.take() else {
            return;
        };
        let Some(history) = self.history.upgrade() else {
            debug!("Session was replaced before the reply finished, not recording it");
            return;
        };
        let mut history = match history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push(prompt);
        history.push(Turn::model(std::mem::take(&mut self.reply)));
    }
}

impl Stream for ReplyStream {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let this = self.get_mut();
        loop {
            let Some(fragments) = this.fragments.as_mut() else {
                return Poll::Ready(None);
            };
            match fragments.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(fragment))) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    this.reply.push_str(&fragment);
                    return Poll::Ready(Some(fragment));
                }
                Poll::Ready(Some(Err(err))) => {
                    warn!("Reply stream failed: {}", err);
                    this.fragments = None;
                    this.prompt = None;
                    return Poll::Ready(Some(FALLBACK_FRAGMENT.to_string()));
                }
                Poll::Ready(None) => {
                    this.fragments = None;
                    this.remember_exchange();
                    return Poll::Ready(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Script, ScriptedBackend};
    use super::*;

    const INSTRUCTIONS: &str = "Tu es un tuteur.";

    fn connected(backend: &ScriptedBackend) -> ModelGateway<ScriptedBackend> {
        let mut gateway = ModelGateway::new(INSTRUCTIONS, 0.7);
        gateway.connect(backend.clone()).unwrap();
        gateway
    }

    async fn collect(stream: ReplyStream) -> Vec<String> {
        stream.collect().await
    }

    #[tokio::test]
    async fn fragments_arrive_in_service_order() {
        let backend = ScriptedBackend::new();
        backend.push_reply(Script::Fragments(vec!["Le cœur", " pompe", " le sang."]));
        let mut gateway = connected(&backend);

        let fragments = collect(gateway.stream_reply("Le cœur ?").await.unwrap()).await;
        assert_eq!(fragments, vec!["Le cœur", " pompe", " le sang."]);
    }

    #[tokio::test]
    async fn request_carries_instructions_temperature_and_message() {
        let backend = ScriptedBackend::new();
        backend.push_reply(Script::Fragments(vec!["ok"]));
        let mut gateway = connected(&backend);

        collect(gateway.stream_reply("Qu'est-ce qu'un neurone ?").await.unwrap()).await;

        let requests = backend.chat_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system_instructions, INSTRUCTIONS);
        assert_eq!(requests[0].temperature, 0.7);
        assert_eq!(requests[0].message, "Qu'est-ce qu'un neurone ?");
        assert!(requests[0].history.is_empty());
    }

    #[tokio::test]
    async fn completed_exchanges_become_session_memory() {
        let backend = ScriptedBackend::new();
        backend.push_reply(Script::Fragments(vec!["Les ", "poumons."]));
        backend.push_reply(Script::Fragments(vec!["Oui."]));
        let mut gateway = connected(&backend);

        collect(gateway.stream_reply("Où respire-t-on ?").await.unwrap()).await;
        collect(gateway.stream_reply("Vraiment ?").await.unwrap()).await;

        let second = &backend.chat_requests()[1];
        assert_eq!(
            second.history,
            vec![Turn::user("Où respire-t-on ?"), Turn::model("Les poumons.")]
        );
        assert_eq!(gateway.session().unwrap().turns(), 4);
    }

    #[tokio::test]
    async fn reset_session_forgets_previous_turns() {
        let backend = ScriptedBackend::new();
        backend.push_reply(Script::Fragments(vec!["Réponse sur la digestion."]));
        backend.push_reply(Script::Fragments(vec!["Réponse sur les muscles."]));
        let mut gateway = connected(&backend);

        collect(gateway.stream_reply("La digestion ?").await.unwrap()).await;
        gateway.reset_session().unwrap();
        collect(gateway.stream_reply("Les muscles ?").await.unwrap()).await;

        let requests = backend.chat_requests();
        assert!(requests[1].history.is_empty());
        assert!(requests[1]
            .history
            .iter()
            .all(|t| !t.text.contains("digestion")));
    }

    #[tokio::test]
    async fn reply_finishing_after_reset_is_not_recorded() {
        let backend = ScriptedBackend::new();
        backend.push_reply(Script::Fragments(vec!["ancien"]));
        let mut gateway = connected(&backend);

        let stream = gateway.stream_reply("avant").await.unwrap();
        gateway.reset_session().unwrap();
        collect(stream).await;

        assert_eq!(gateway.session().unwrap().turns(), 0);
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_one_fallback_fragment() {
        let backend = ScriptedBackend::new();
        backend.push_reply(Script::FailAfter(vec!["Le sang"]));
        let mut gateway = connected(&backend);

        let fragments = collect(gateway.stream_reply("Le sang ?").await.unwrap()).await;
        assert_eq!(fragments, vec!["Le sang".to_string(), FALLBACK_FRAGMENT.to_string()]);
        assert_eq!(gateway.session().unwrap().turns(), 0);
    }

    #[tokio::test]
    async fn failure_to_open_yields_only_the_fallback() {
        let backend = ScriptedBackend::new();
        backend.push_reply(Script::FailToOpen);
        let mut gateway = connected(&backend);

        let fragments = collect(gateway.stream_reply("Bonjour").await.unwrap()).await;
        assert_eq!(fragments, vec![FALLBACK_FRAGMENT.to_string()]);
    }

    #[tokio::test]
    async fn exhausted_stream_stays_exhausted() {
        let backend = ScriptedBackend::new();
        backend.push_reply(Script::Fragments(vec!["un"]));
        let mut gateway = connected(&backend);

        let mut stream = gateway.stream_reply("?").await.unwrap();
        assert_eq!(stream.next().await.as_deref(), Some("un"));
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn empty_fragments_are_skipped() {
        let backend = ScriptedBackend::new();
        backend.push_reply(Script::Fragments(vec!["", "a", "", "b"]));
        let mut gateway = connected(&backend);

        let fragments = collect(gateway.stream_reply("?").await.unwrap()).await;
        assert_eq!(fragments, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stream_without_session_starts_one() {
        let backend = ScriptedBackend::new();
        backend.push_reply(Script::Fragments(vec!["ok"]));
        let mut gateway = connected(&backend);
        gateway.session = None;

        collect(gateway.stream_reply("?").await.unwrap()).await;
        assert_eq!(gateway.sessions_started(), 2);
    }

    #[tokio::test]
    async fn missing_client_is_a_session_init_failure() {
        let mut gateway: ModelGateway<ScriptedBackend> = ModelGateway::new(INSTRUCTIONS, 0.7);

        assert!(matches!(gateway.reset_session(), Err(GatewayError::SessionInit(_))));
        assert!(matches!(
            gateway.stream_reply("?").await,
            Err(GatewayError::SessionInit(_))
        ));
        assert!(matches!(
            gateway.generate_quiz("Système Nerveux").await,
            Err(GatewayError::QuizGeneration(_))
        ));
    }

    #[tokio::test]
    async fn initialize_replaces_settings() {
        let backend = ScriptedBackend::new();
        backend.push_reply(Script::Fragments(vec!["ok"]));
        let mut gateway = connected(&backend);

        gateway.initialize("Autre consigne", 0.2).unwrap();
        collect(gateway.stream_reply("?").await.unwrap()).await;

        let request = &backend.chat_requests()[0];
        assert_eq!(request.system_instructions, "Autre consigne");
        assert_eq!(request.temperature, 0.2);
    }

    #[tokio::test]
    async fn valid_quiz_is_returned_whole() {
        let backend = ScriptedBackend::new();
        backend.push_quiz(Ok(testing::quiz_json(5)));
        let gateway = connected(&backend);

        let questions = gateway.generate_quiz("Système Digestif").await.unwrap();
        assert_eq!(questions.len(), 5);
        assert_eq!(questions[0].question, "Question 1 ?");

        let request = &backend.completion_requests()[0];
        assert!(request.prompt.contains("Système Digestif"));
        assert_eq!(request.schema["type"], "array");
    }

    #[tokio::test]
    async fn malformed_quiz_is_a_quiz_generation_failure() {
        let backend = ScriptedBackend::new();
        backend.push_quiz(Ok("[{\"question\": \"Incomplet".to_string()));
        let gateway = connected(&backend);

        let err = gateway.generate_quiz("Système Digestif").await.unwrap_err();
        assert!(matches!(err, GatewayError::QuizGeneration(_)));
    }

    #[tokio::test]
    async fn transport_failure_during_quiz_is_a_quiz_generation_failure() {
        let backend = ScriptedBackend::new();
        backend.push_quiz(Err("timeout".to_string()));
        let gateway = connected(&backend);

        let err = gateway.generate_quiz("Système Digestif").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::QuizGeneration(ref reason) if reason.contains("timeout")
        ));
    }
}
