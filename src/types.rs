use serde::{Deserialize, Serialize};

/// Who produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    FromUser,
    FromBot,
}

impl Origin {
    pub fn is_user(self) -> bool {
        matches!(self, Origin::FromUser)
    }
}

/// One line of the conversation transcript. Serialized as
/// `{phone, message, from_user}` both on the wire and to live observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub phone: String,
    pub message: String,
    pub from_user: bool,
}

impl MessageRecord {
    pub fn new(phone: impl Into<String>, message: impl Into<String>, origin: Origin) -> Self {
        Self {
            phone: phone.into(),
            message: message.into(),
            from_user: origin.is_user(),
        }
    }

    pub fn from_user(phone: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(phone, message, Origin::FromUser)
    }

    pub fn from_bot(phone: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(phone, message, Origin::FromBot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactToggle {
    pub phone: String,
    pub bot_enabled: bool,
}

/// A well-formed inbound text pulled out of a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: String,
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SendMessageBody {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
