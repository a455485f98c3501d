mod bot;
mod config;
mod conversation;
mod gateway;
mod quiz;
mod topics;
mod tutor;

use std::sync::Arc;

use dotenv::dotenv;
use log::{error, info, warn};
use teloxide::{
    dispatching::dialogue::{InMemStorage, Storage},
    prelude::*,
};
use tokio::sync::Mutex;

use bot::{ChatOwner, DialogueStorage, SharedTutor, State};
use config::Config;
use gateway::{openai::OpenAiBackend, ModelGateway};
use tutor::{Tutor, SYSTEM_INSTRUCTION};

#[tokio::main]
async fn main() {
    let dotenv_loaded = dotenv().is_ok();

    pretty_env_logger::init();
    info!("Starting BioTutor bot...");
    if !dotenv_loaded {
        info!("No .env file found, reading the environment only");
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid configuration: {}", err);
            std::process::exit(1);
        }
    };

    let bot = Bot::new(config.telegram_token.clone());

    // Dialogue state lives for the process only
    let storage: DialogueStorage = InMemStorage::<State>::new().erase();

    let gateway = ModelGateway::new(SYSTEM_INSTRUCTION, config.model.temperature);
    let mut tutor = Tutor::new(gateway);
    match config.api_key.as_deref() {
        Some(key) => {
            match OpenAiBackend::new(key, &config.model).map(|backend| tutor.connect(backend)) {
                Ok(Ok(())) => info!("Model client ready"),
                Ok(Err(err)) => warn!("Could not start a model session: {}", err),
                Err(err) => warn!("OPENAI_API_KEY is unusable: {}", err),
            }
        }
        None => info!("OPENAI_API_KEY not set, the key will be asked for in the chat"),
    }
    let tutor: SharedTutor = Arc::new(Mutex::new(tutor));

    let owner = Arc::new(ChatOwner::new(config.chat_id.map(ChatId)));
    let config = Arc::new(config);

    Dispatcher::builder(bot, bot::schema())
        .dependencies(dptree::deps![storage, tutor, config, owner])
        // Updates run concurrently so input sent during a reply reaches the
        // tutor, which refuses it while busy instead of queueing it
        .distribution_function(|_| None::<std::convert::Infallible>)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}
