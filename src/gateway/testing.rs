//! A scripted model service that records what it was asked.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use super::backend::{ChatRequest, CompletionRequest, FragmentStream, ModelBackend};
use super::GatewayError;

pub enum Script {
    Fragments(Vec<&'static str>),
    /// Sends the fragments, then fails.
    FailAfter(Vec<&'static str>),
    FailToOpen,
}

#[derive(Default)]
struct State {
    replies: VecDeque<Script>,
    quizzes: VecDeque<Result<String, String>>,
    chat_requests: Vec<ChatRequest>,
    completion_requests: Vec<CompletionRequest>,
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<State>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, script: Script) {
        self.state.lock().unwrap().replies.push_back(script);
    }

    pub fn push_quiz(&self, response: Result<String, String>) {
        self.state.lock().unwrap().quizzes.push_back(response);
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.state.lock().unwrap().chat_requests.clone()
    }

    pub fn completion_requests(&self) -> Vec<CompletionRequest> {
        self.state.lock().unwrap().completion_requests.clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn open_stream(&self, request: ChatRequest) -> Result<FragmentStream, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.chat_requests.push(request);
        let script = state
            .replies
            .pop_front()
            .unwrap_or(Script::Fragments(Vec::new()));

        let items: Vec<Result<String, GatewayError>> = match script {
            Script::Fragments(fragments) => {
                fragments.into_iter().map(|f| Ok(f.to_string())).collect()
            }
            Script::FailAfter(fragments) => fragments
                .into_iter()
                .map(|f| Ok(f.to_string()))
                .chain(std::iter::once(Err(GatewayError::Transport(
                    "connection reset".to_string(),
                ))))
                .collect(),
            Script::FailToOpen => {
                return Err(GatewayError::Transport("connection refused".to_string()))
            }
        };
        Ok(stream::iter(items).boxed())
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.completion_requests.push(request);
        match state.quizzes.pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(reason)) => Err(GatewayError::Transport(reason)),
            None => Err(GatewayError::Transport("no scripted quiz".to_string())),
        }
    }
}

/// A well-formed quiz payload whose correct answer is always option `i % 4`.
pub fn quiz_json(count: usize) -> String {
    let questions: Vec<serde_json::Value> = (0..count)
        .map(|i| {
            serde_json::json!({
                "question": format!("Question {} ?", i + 1),
                "options": ["A", "B", "C", "D"],
                "correctAnswerIndex": i % 4,
                "explanation": format!("Explication {}", i + 1),
            })
        })
        .collect();
    serde_json::Value::Array(questions).to_string()
}
