use std::time::{Duration, Instant};

use log::warn;
use teloxide::prelude::*;
use teloxide::types::MessageId;

/// Telegram refuses longer texts; pages stay a little below it.
const PAGE_CHARS: usize = 4000;
const PLACEHOLDER: &str = "…";

struct Page {
    id: MessageId,
    shown: String,
}

/// Shows a growing reply by editing the messages already sent.
///
/// Edits are spaced by `interval` except for the final one. Text beyond one
/// Telegram message continues in a new message.
pub struct StreamingView {
    bot: Bot,
    chat_id: ChatId,
    interval: Duration,
    pages: Vec<Page>,
    last_render: Option<Instant>,
}

impl StreamingView {
    pub async fn open(bot: Bot, chat_id: ChatId, interval: Duration) -> ResponseResult<Self> {
        let sent = bot.send_message(chat_id, PLACEHOLDER).await?;
        Ok(Self {
            bot,
            chat_id,
            interval,
            pages: vec![Page {
                id: sent.id,
                shown: PLACEHOLDER.to_string(),
            }],
            last_render: None,
        })
    }

    pub async fn update(&mut self, content: &str) {
        if let Some(last) = self.last_render {
            if last.elapsed() < self.interval {
                return;
            }
        }
        self.render(content).await;
    }

    pub async fn finish(&mut self, content: &str) {
        self.render(content).await;
    }

    async fn render(&mut self, content: &str) {
        self.last_render = Some(Instant::now());

        for (i, text) in split_pages(content, PAGE_CHARS).into_iter().enumerate() {
            match self.pages.get_mut(i) {
                Some(page) if page.shown == text => {}
                Some(page) => {
                    match self
                        .bot
                        .edit_message_text(self.chat_id, page.id, text.clone())
                        .await
                    {
                        Ok(_) => page.shown = text,
                        Err(err) => warn!("Could not update the streamed reply: {}", err),
                    }
                }
                None => match self.bot.send_message(self.chat_id, text.clone()).await {
                    Ok(sent) => self.pages.push(Page {
                        id: sent.id,
                        shown: text,
                    }),
                    Err(err) => {
                        warn!("Could not continue the streamed reply: {}", err);
                        return;
                    }
                },
            }
        }
    }
}

/// Cuts `content` into pages of at most `limit` characters, preferring to
/// break after a newline. Empty content still gives one placeholder page.
pub fn split_pages(content: &str, limit: usize) -> Vec<String> {
    if content.trim().is_empty() {
        return vec![PLACEHOLDER.to_string()];
    }

    let mut pages = Vec::new();
    let mut rest = content;
    while !rest.is_empty() {
        let Some((hard_cut, _)) = rest.char_indices().nth(limit) else {
            pages.push(rest.to_string());
            break;
        };
        let cut = match rest[..hard_cut].rfind('\n') {
            Some(newline) if newline >= hard_cut / 2 => newline + 1,
            _ => hard_cut,
        };
        pages.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    pages
}
