use tether_gateway::{Message, MessageId};

/// The message currently being replied to, if any.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    target: Option<Message>,
}

impl ReplyContext {
    pub fn set(&mut self, target: Option<Message>) {
        self.target = target;
    }

    pub fn current(&self) -> Option<&Message> {
        self.target.as_ref()
    }

    pub fn current_id(&self) -> Option<&MessageId> {
        self.target.as_ref().map(|message| &message.id)
    }

    /// Returns the target and clears it in one step.
    pub fn consume(&mut self) -> Option<Message> {
        self.target.take()
    }

    pub fn clear(&mut self) {
        self.target = None;
    }
}
