use log::{debug, info};
use thiserror::Error;

use crate::conversation::{Conversation, MessageId};
use crate::gateway::{backend::ModelBackend, GatewayError, ModelGateway, QuizFuture, ReplyStream};
use crate::quiz::{QuizQuestion, QuizSession};
use crate::topics::TopicId;

pub const SYSTEM_INSTRUCTION: &str = "
Tu es un tuteur éducatif spécialisé en biologie humaine, plus précisément en physiologie humaine, pour un niveau lycée.

Ton objectif principal est d'aider l'élève à comprendre les mécanismes du corps humain de manière claire, progressive et pédagogique.

Règles de comportement :
- Adapte toujours ton langage à un niveau lycée.
- Explique les notions étape par étape.
- Utilise des exemples concrets (sport, respiration, etc.).
- Pose des questions simples pour vérifier la compréhension.
- Sois encourageant et bienveillant.

Pédagogie :
- Décompose chaque thème.
- Explique le rôle, le fonctionnement, puis les interactions.
- Utilise des analogies simples.
- Résume les points clés à la fin.

Interaction :
- Ne donne pas tout d'un coup (réponses concises mais complètes).
- Attends la réponse de l'élève.
- Propose des mini-exercices ou QCM courts.

Contraintes :
- Sujet strict : biologie/physiologie humaine.
- Pas de diagnostic médical.
";

pub fn priming_prompt(topic: TopicId) -> String {
    format!(
        "Bonjour. Je souhaite apprendre sur : {}. Peux-tu m'introduire ce sujet simplement ?",
        topic.topic().title
    )
}

#[derive(Debug, Error)]
pub enum TutorError {
    #[error("a reply is still being generated")]
    Busy,
    #[error("the message is empty")]
    EmptyInput,
    #[error("no quiz is in progress")]
    NoQuiz,
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// A model reply in flight: its message in the conversation and the fragments
/// still to be applied to it.
pub struct Exchange {
    pub message_id: MessageId,
    pub fragments: ReplyStream,
}

/// The tutoring state of the chat: model session, conversation and quiz.
///
/// At most one request is outstanding; while `is_loading` is set new
/// submissions are refused with [`TutorError::Busy`].
pub struct Tutor<B> {
    gateway: ModelGateway<B>,
    conversation: Conversation,
    quiz: Option<QuizSession>,
    topic: Option<TopicId>,
    loading: bool,
}

impl<B: ModelBackend> Tutor<B> {
    pub fn new(gateway: ModelGateway<B>) -> Self {
        Self {
            gateway,
            conversation: Conversation::new(),
            quiz: None,
            topic: None,
            loading: false,
        }
    }

    pub fn connect(&mut self, backend: B) -> Result<(), TutorError> {
        self.gateway.connect(backend)?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.gateway.is_connected()
    }

    #[cfg(test)]
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    #[cfg(test)]
    pub fn topic(&self) -> Option<TopicId> {
        self.topic
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn quiz(&self) -> Option<&QuizSession> {
        self.quiz.as_ref()
    }

    #[cfg(test)]
    pub fn gateway(&self) -> &ModelGateway<B> {
        &self.gateway
    }

    /// Opens a fresh lesson on `topic`: the model forgets everything and is
    /// asked to introduce the subject.
    pub async fn select_topic(&mut self, topic: TopicId) -> Result<Exchange, TutorError> {
        self.ensure_idle()?;
        info!("Starting lesson on {}", topic.slug());
        self.quiz = None;
        self.topic = Some(topic);
        self.gateway.reset_session()?;
        self.conversation.reset();

        self.open_exchange(&priming_prompt(topic)).await
    }

    /// A question asked from the topic menu starts a general lesson.
    pub async fn ask_question(&mut self, question: &str) -> Result<Exchange, TutorError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(TutorError::EmptyInput);
        }
        self.ensure_idle()?;
        info!("Direct question, starting a general lesson");
        self.quiz = None;
        self.topic = Some(TopicId::General);
        self.gateway.reset_session()?;
        self.conversation.reset();
        self.conversation.append_user(question);

        self.open_exchange(question).await
    }

    pub async fn send_message(&mut self, text: &str) -> Result<Exchange, TutorError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TutorError::EmptyInput);
        }
        self.ensure_idle()?;
        self.conversation.append_user(text);

        self.open_exchange(text).await
    }

    async fn open_exchange(&mut self, prompt: &str) -> Result<Exchange, TutorError> {
        let fragments = self.gateway.stream_reply(prompt).await?;
        let message_id = self.conversation.begin_model_message();
        self.loading = true;
        debug!("Reply {:?} started", message_id);
        Ok(Exchange {
            message_id,
            fragments,
        })
    }

    pub fn apply_fragment(&mut self, message_id: MessageId, fragment: &str) -> bool {
        self.conversation.append_fragment(message_id, fragment)
    }

    pub fn finish_exchange(&mut self, message_id: MessageId) {
        self.conversation.settle(message_id);
        self.loading = false;
        debug!("Reply {:?} settled", message_id);
    }

    /// Applies every fragment of `exchange` and settles its message.
    #[cfg(test)]
    pub async fn complete_exchange(&mut self, exchange: Exchange) -> MessageId {
        use futures::StreamExt;

        let Exchange {
            message_id,
            mut fragments,
        } = exchange;
        while let Some(fragment) = fragments.next().await {
            self.apply_fragment(message_id, &fragment);
        }
        self.finish_exchange(message_id);
        message_id
    }

    /// Opens a quiz on `topic` and returns its generation round trip.
    ///
    /// The tutor stays loading until the result is handed to
    /// [`Tutor::finish_quiz`], so the future can be awaited without holding
    /// the tutor while other submissions are refused.
    pub fn start_quiz(&mut self, topic: TopicId) -> Result<QuizFuture, TutorError> {
        self.ensure_idle()?;
        info!("Starting quiz on {}", topic.slug());
        self.topic = Some(topic);
        self.conversation.reset();

        let quiz = self.quiz.insert(QuizSession::new(topic));
        let pending = quiz.begin_load(&self.gateway);
        self.loading = true;
        Ok(pending)
    }

    /// Starts the current quiz over with new questions on the same topic.
    pub fn retry_quiz(&mut self) -> Result<QuizFuture, TutorError> {
        self.ensure_idle()?;
        let quiz = self.quiz.as_mut().ok_or(TutorError::NoQuiz)?;
        let pending = quiz.begin_load(&self.gateway);
        self.loading = true;
        Ok(pending)
    }

    /// Applies a finished round trip. Fails with [`TutorError::NoQuiz`] when
    /// the quiz was left while it was loading.
    pub fn finish_quiz(
        &mut self,
        result: Result<Vec<QuizQuestion>, GatewayError>,
    ) -> Result<&QuizSession, TutorError> {
        self.loading = false;
        let quiz = self.quiz.as_mut().ok_or(TutorError::NoQuiz)?;
        quiz.apply_loaded(result);
        Ok(quiz)
    }

    pub fn select_option(&mut self, index: usize) -> Result<Option<bool>, TutorError> {
        self.ensure_idle()?;
        let quiz = self.quiz.as_mut().ok_or(TutorError::NoQuiz)?;
        Ok(quiz.select_option(index))
    }

    pub fn advance(&mut self) -> Result<bool, TutorError> {
        self.ensure_idle()?;
        let quiz = self.quiz.as_mut().ok_or(TutorError::NoQuiz)?;
        Ok(quiz.advance())
    }

    pub fn back_to_topics(&mut self) {
        debug!("Back to the topic menu");
        self.topic = None;
        self.quiz = None;
        self.conversation.reset();
    }

    fn ensure_idle(&self) -> Result<(), TutorError> {
        if self.loading {
            return Err(TutorError::Busy);
        }
        Ok(())
    }
}
