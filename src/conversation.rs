use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub is_streaming: bool,
}

/// Ordered list of chat messages. Model replies are written through
/// `append_fragment` and frozen with `settle`; nothing else mutates a message.
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    next_id: u64,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids keep increasing across resets so a stale id never matches a new message.
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    pub fn append_user(&mut self, text: impl Into<String>) -> MessageId {
        self.push(Role::User, text.into(), false)
    }

    pub fn begin_model_message(&mut self) -> MessageId {
        if let Some(stale) = self.streaming().map(|m| m.id) {
            warn!("Message {:?} was still streaming, settling it", stale);
            self.settle(stale);
        }
        self.push(Role::Model, String::new(), true)
    }

    /// Returns `false` when the id is unknown or the message is already settled.
    pub fn append_fragment(&mut self, id: MessageId, fragment: &str) -> bool {
        match self.find_mut(id) {
            Some(message) if message.is_streaming => {
                message.content.push_str(fragment);
                true
            }
            _ => false,
        }
    }

    pub fn settle(&mut self, id: MessageId) {
        if let Some(message) = self.find_mut(id) {
            message.is_streaming = false;
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.id == id)
    }

    #[cfg(test)]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn streaming(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.is_streaming)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn push(&mut self, role: Role, content: String, is_streaming: bool) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        self.messages.push(Message {
            id,
            role,
            content,
            is_streaming,
        });
        id
    }

    fn find_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        // The target is almost always the last message
        self.messages.iter_mut().rev().find(|m| m.id == id)
    }
}
