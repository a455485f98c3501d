pub mod render;
pub mod streaming;

use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use log::{debug, info, warn};
use teloxide::{
    dispatching::{dialogue::ErasedStorage, UpdateHandler},
    prelude::*,
    types::ChatAction,
    utils::command::BotCommands,
};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::gateway::{openai::OpenAiBackend, GatewayError};
use crate::quiz::QuizQuestion;
use crate::topics::{self, Topic, TopicId, TOPICS};
use crate::tutor::{Exchange, Tutor, TutorError};
use render::{QuizAction, TopicChoice, View};
use streaming::StreamingView;

pub type TutorDialogue = Dialogue<State, ErasedStorage<State>>;
pub type DialogueStorage = Arc<ErasedStorage<State>>;
pub type SharedTutor = Arc<Mutex<Tutor<OpenAiBackend>>>;
type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Clone, Default)]
pub enum State {
    #[default]
    Start,
    ReceiveApiKey,
    ChooseTopic,
    Chatting {
        topic: TopicId,
    },
    Quiz {
        topic: TopicId,
    },
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Commandes disponibles :")]
pub enum Command {
    #[command(description = "recommencer depuis le début")]
    Start,
    #[command(description = "revenir au choix des sujets")]
    Sujets,
    #[command(description = "enregistrer votre clé API OpenAI")]
    Cle(String),
    #[command(description = "chercher un sujet par mot-clé")]
    Chercher(String),
    #[command(description = "afficher cette aide")]
    Aide,
}

/// The single chat the tutor talks to: the configured one, or the first that writes.
pub struct ChatOwner {
    chat: OnceLock<ChatId>,
}

impl ChatOwner {
    pub fn new(fixed: Option<ChatId>) -> Self {
        let chat = OnceLock::new();
        if let Some(id) = fixed {
            let _ = chat.set(id);
        }
        Self { chat }
    }

    pub fn admits(&self, chat_id: ChatId) -> bool {
        *self.chat.get_or_init(|| {
            info!("Tutor bound to chat {}", chat_id);
            chat_id
        }) == chat_id
    }
}

pub fn schema() -> UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    let commands = dptree::entry()
        .filter_command::<Command>()
        .endpoint(command);

    let dialogue = dptree::entry()
        .enter_dialogue::<Message, ErasedStorage<State>, State>()
        .branch(commands)
        .branch(dptree::case![State::Start].endpoint(start))
        .branch(dptree::case![State::ReceiveApiKey].endpoint(receive_api_key))
        .branch(dptree::case![State::ChooseTopic].endpoint(choose_topic))
        .branch(dptree::case![State::Chatting { topic }].endpoint(chat))
        .branch(dptree::case![State::Quiz { topic }].endpoint(quiz));

    Update::filter_message()
        .branch(dptree::filter(is_foreign_chat).endpoint(refuse_foreign_chat))
        .branch(dialogue)
}

fn is_foreign_chat(msg: Message, owner: Arc<ChatOwner>) -> bool {
    !owner.admits(msg.chat.id)
}

async fn refuse_foreign_chat(bot: Bot, msg: Message) -> HandlerResult {
    debug!("Ignoring chat {}", msg.chat.id);
    bot.send_message(msg.chat.id, render::FOREIGN_CHAT_TEXT)
        .await?;
    Ok(())
}

async fn send_view(bot: &Bot, chat_id: ChatId, view: View) -> HandlerResult {
    bot.send_message(chat_id, view.text.clone())
        .reply_markup(view.markup())
        .await?;
    Ok(())
}

async fn command(
    bot: Bot,
    dialogue: TutorDialogue,
    msg: Message,
    cmd: Command,
    tutor: SharedTutor,
    config: Arc<Config>,
) -> HandlerResult {
    match cmd {
        Command::Start => start(bot, dialogue, msg, tutor).await,
        Command::Sujets => open_menu(&bot, &dialogue, msg.chat.id, &tutor).await,
        Command::Cle(key) if key.trim().is_empty() => {
            bot.send_message(msg.chat.id, render::API_KEY_PROMPT).await?;
            dialogue.update(State::ReceiveApiKey).await?;
            Ok(())
        }
        Command::Cle(key) => register_api_key(&bot, &dialogue, &msg, &tutor, &config, &key).await,
        Command::Chercher(term) => {
            let found = topics::search(&term);
            if found.is_empty() {
                bot.send_message(msg.chat.id, render::NO_SEARCH_RESULTS)
                    .await?;
                return Ok(());
            }
            tutor.lock().await.back_to_topics();
            send_view(&bot, msg.chat.id, render::topic_menu(&found)).await?;
            dialogue.update(State::ChooseTopic).await?;
            Ok(())
        }
        Command::Aide => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .await?;
            Ok(())
        }
    }
}

async fn start(
    bot: Bot,
    dialogue: TutorDialogue,
    msg: Message,
    tutor: SharedTutor,
) -> HandlerResult {
    bot.send_message(msg.chat.id, render::GREETING_TEXT).await?;
    open_menu(&bot, &dialogue, msg.chat.id, &tutor).await
}

/// Back to topic selection, or to the key prompt while no model client exists.
async fn open_menu(
    bot: &Bot,
    dialogue: &TutorDialogue,
    chat_id: ChatId,
    tutor: &SharedTutor,
) -> HandlerResult {
    let connected = {
        let mut tutor = tutor.lock().await;
        tutor.back_to_topics();
        tutor.is_connected()
    };

    if !connected {
        send_view(
            bot,
            chat_id,
            View {
                text: render::API_KEY_PROMPT.to_string(),
                buttons: Vec::new(),
            },
        )
        .await?;
        dialogue.update(State::ReceiveApiKey).await?;
        return Ok(());
    }

    let all: Vec<&Topic> = TOPICS.iter().collect();
    send_view(bot, chat_id, render::topic_menu(&all)).await?;
    dialogue.update(State::ChooseTopic).await?;
    Ok(())
}

async fn receive_api_key(
    bot: Bot,
    dialogue: TutorDialogue,
    msg: Message,
    tutor: SharedTutor,
    config: Arc<Config>,
) -> HandlerResult {
    match msg.text() {
        Some(key) => register_api_key(&bot, &dialogue, &msg, &tutor, &config, key).await,
        None => {
            bot.send_message(msg.chat.id, render::API_KEY_PROMPT).await?;
            Ok(())
        }
    }
}

async fn register_api_key(
    bot: &Bot,
    dialogue: &TutorDialogue,
    msg: &Message,
    tutor: &SharedTutor,
    config: &Config,
    key: &str,
) -> HandlerResult {
    // The key should not stay in the chat history
    if let Err(err) = bot.delete_message(msg.chat.id, msg.id).await {
        debug!("Could not delete the message holding the API key: {}", err);
    }

    let connected = match OpenAiBackend::new(key, &config.model) {
        Ok(backend) => tutor.lock().await.connect(backend),
        Err(err) => Err(TutorError::from(err)),
    };

    match connected {
        Ok(()) => {
            info!("API key registered");
            bot.send_message(msg.chat.id, render::API_KEY_ACCEPTED)
                .await?;
            open_menu(bot, dialogue, msg.chat.id, tutor).await
        }
        Err(err) => {
            warn!("API key rejected: {}", err);
            bot.send_message(msg.chat.id, render::API_KEY_REJECTED)
                .await?;
            dialogue.update(State::ReceiveApiKey).await?;
            Ok(())
        }
    }
}

async fn choose_topic(
    bot: Bot,
    dialogue: TutorDialogue,
    msg: Message,
    tutor: SharedTutor,
    config: Arc<Config>,
) -> HandlerResult {
    let Some(text) = msg.text() else {
        bot.send_message(msg.chat.id, render::TEXT_ONLY).await?;
        return Ok(());
    };

    match render::parse_topic_choice(text) {
        Some(TopicChoice::Learn(topic)) => {
            start_lesson(&bot, &dialogue, msg.chat.id, &tutor, &config, topic).await
        }
        Some(TopicChoice::Quiz(topic)) => {
            start_quiz(&bot, &dialogue, msg.chat.id, &tutor, topic).await
        }
        None => {
            dialogue
                .update(State::Chatting {
                    topic: TopicId::General,
                })
                .await?;
            send_view(&bot, msg.chat.id, render::lesson_view(TopicId::General)).await?;
            let exchange = tutor.lock().await.ask_question(text).await;
            deliver(&bot, msg.chat.id, &tutor, &config, exchange).await
        }
    }
}

async fn start_lesson(
    bot: &Bot,
    dialogue: &TutorDialogue,
    chat_id: ChatId,
    tutor: &SharedTutor,
    config: &Config,
    topic: TopicId,
) -> HandlerResult {
    dialogue.update(State::Chatting { topic }).await?;
    send_view(bot, chat_id, render::lesson_view(topic)).await?;
    let exchange = tutor.lock().await.select_topic(topic).await;
    deliver(bot, chat_id, tutor, config, exchange).await
}

async fn chat(
    bot: Bot,
    dialogue: TutorDialogue,
    msg: Message,
    topic: TopicId,
    tutor: SharedTutor,
    config: Arc<Config>,
) -> HandlerResult {
    match msg.text() {
        None => {
            bot.send_message(msg.chat.id, render::TEXT_ONLY).await?;
            Ok(())
        }
        Some(render::BACK_BUTTON) => open_menu(&bot, &dialogue, msg.chat.id, &tutor).await,
        Some(render::QUIZ_BUTTON) => start_quiz(&bot, &dialogue, msg.chat.id, &tutor, topic).await,
        Some(text) => {
            let exchange = tutor.lock().await.send_message(text).await;
            deliver(&bot, msg.chat.id, &tutor, &config, exchange).await
        }
    }
}

/// Streams a reply into the chat, or explains why it could not start.
async fn deliver(
    bot: &Bot,
    chat_id: ChatId,
    tutor: &SharedTutor,
    config: &Config,
    exchange: Result<Exchange, TutorError>,
) -> HandlerResult {
    let Exchange {
        message_id,
        mut fragments,
    } = match exchange {
        Ok(exchange) => exchange,
        Err(err) => {
            debug!("Reply not started: {}", err);
            bot.send_message(chat_id, render::error_text(&err)).await?;
            return Ok(());
        }
    };

    let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
    let opened = StreamingView::open(bot.clone(), chat_id, config.stream_edit_interval).await;
    let mut view = match opened {
        Ok(view) => Some(view),
        Err(err) => {
            warn!("Could not open the reply message: {}", err);
            None
        }
    };

    // The lock is only held while a fragment is applied, so rendering never blocks the tutor
    while let Some(fragment) = fragments.next().await {
        let content = {
            let mut tutor = tutor.lock().await;
            tutor.apply_fragment(message_id, &fragment);
            tutor
                .conversation()
                .get(message_id)
                .map(|m| m.content.clone())
        };
        if let (Some(view), Some(content)) = (view.as_mut(), content) {
            view.update(&content).await;
        }
    }

    let content = {
        let mut tutor = tutor.lock().await;
        tutor.finish_exchange(message_id);
        tutor
            .conversation()
            .get(message_id)
            .map(|m| m.content.clone())
    };
    if let (Some(view), Some(content)) = (view.as_mut(), content) {
        view.finish(&content).await;
    }
    Ok(())
}

async fn start_quiz(
    bot: &Bot,
    dialogue: &TutorDialogue,
    chat_id: ChatId,
    tutor: &SharedTutor,
    topic: TopicId,
) -> HandlerResult {
    let pending = tutor.lock().await.start_quiz(topic);
    let pending = match pending {
        Ok(pending) => pending,
        Err(err) => {
            bot.send_message(chat_id, render::error_text(&err)).await?;
            return Ok(());
        }
    };

    dialogue.update(State::Quiz { topic }).await?;
    send_view(bot, chat_id, render::quiz_loading_view(topic)).await?;
    let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;

    // Generated without holding the tutor, which refuses other input meanwhile
    let questions = pending.await;
    show_loaded_quiz(bot, chat_id, tutor, questions).await
}

async fn show_loaded_quiz(
    bot: &Bot,
    chat_id: ChatId,
    tutor: &SharedTutor,
    questions: Result<Vec<QuizQuestion>, GatewayError>,
) -> HandlerResult {
    let view = tutor
        .lock()
        .await
        .finish_quiz(questions)
        .map(render::quiz_view);
    match view {
        Ok(view) => send_view(bot, chat_id, view).await,
        Err(TutorError::NoQuiz) => {
            debug!("Quiz left before its questions arrived");
            Ok(())
        }
        Err(err) => {
            bot.send_message(chat_id, render::error_text(&err)).await?;
            Ok(())
        }
    }
}

async fn quiz(
    bot: Bot,
    dialogue: TutorDialogue,
    msg: Message,
    tutor: SharedTutor,
) -> HandlerResult {
    let action = msg.text().and_then(QuizAction::parse);
    match action {
        Some(QuizAction::Leave) => return open_menu(&bot, &dialogue, msg.chat.id, &tutor).await,
        Some(QuizAction::Retry) => return retry_quiz(&bot, msg.chat.id, &tutor).await,
        _ => {}
    }

    let view = {
        let mut tutor = tutor.lock().await;
        let outcome = match action {
            Some(QuizAction::Choose(index)) => tutor.select_option(index).map(|_| ()),
            Some(QuizAction::Next) => tutor.advance().map(|_| ()),
            _ => Ok(()),
        };
        let view = outcome.map(|()| tutor.quiz().map(render::quiz_view));
        view
    };

    match view {
        Ok(Some(view)) => {
            if action.is_none() {
                bot.send_message(msg.chat.id, render::QUIZ_HINT).await?;
            }
            send_view(&bot, msg.chat.id, view).await
        }
        Ok(None) => open_menu(&bot, &dialogue, msg.chat.id, &tutor).await,
        Err(err) => {
            bot.send_message(msg.chat.id, render::error_text(&err))
                .await?;
            Ok(())
        }
    }
}

async fn retry_quiz(bot: &Bot, chat_id: ChatId, tutor: &SharedTutor) -> HandlerResult {
    let pending = {
        let mut tutor = tutor.lock().await;
        let pending = tutor
            .retry_quiz()
            .map(|pending| (pending, tutor.quiz().map(render::quiz_view)));
        pending
    };
    let (pending, loading_view) = match pending {
        Ok(pending) => pending,
        Err(err) => {
            bot.send_message(chat_id, render::error_text(&err)).await?;
            return Ok(());
        }
    };

    if let Some(view) = loading_view {
        send_view(bot, chat_id, view).await?;
    }
    let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
    let questions = pending.await;
    show_loaded_quiz(bot, chat_id, tutor, questions).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_chat_binds_the_tutor() {
        let owner = ChatOwner::new(None);
        assert!(owner.admits(ChatId(7)));
        assert!(owner.admits(ChatId(7)));
        assert!(!owner.admits(ChatId(8)));
    }

    #[test]
    fn configured_chat_is_the_only_one_admitted() {
        let owner = ChatOwner::new(Some(ChatId(-42)));
        assert!(!owner.admits(ChatId(7)));
        assert!(owner.admits(ChatId(-42)));
    }

    #[test]
    fn commands_parse_with_their_argument() {
        assert!(matches!(
            Command::parse("/cle sk-test", "biotutor_bot"),
            Ok(Command::Cle(key)) if key == "sk-test"
        ));
        assert!(matches!(
            Command::parse("/chercher cœur", "biotutor_bot"),
            Ok(Command::Chercher(term)) if term == "cœur"
        ));
        assert!(matches!(
            Command::parse("/sujets", "biotutor_bot"),
            Ok(Command::Sujets)
        ));
    }
}
