use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Inbound RTM event as delivered over the websocket.
///
/// Only the fields used for routing are typed; everything else is kept in
/// `extra`. `channel` and `user` are ids on message events but whole objects
/// on events such as `channel_created` or `team_join`, so they stay raw.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RtmEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RtmEvent {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Channel id, when the event carries one as a string.
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_ref().and_then(Value::as_str)
    }

    /// User id, when the event carries one as a string.
    pub fn user(&self) -> Option<&str> {
        self.user.as_ref().and_then(Value::as_str)
    }

    /// Whether the event reports an edit. Slack sends an object here; a bare
    /// `false` or `null` counts as not edited.
    pub fn is_edited(&self) -> bool {
        !matches!(self.edited, None | Some(Value::Null) | Some(Value::Bool(false)))
    }

    /// Whether the event acknowledges one of our own outbound frames.
    pub fn is_reply_ack(&self) -> bool {
        !matches!(self.reply_to, None | Some(Value::Null))
    }
}

/// Outbound websocket frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        id: u64,
        channel: String,
        text: String,
    },
}

impl ClientFrame {
    pub fn message(id: u64, channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Message {
            id,
            channel: channel.into(),
            text: text.into(),
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Message { id, .. } => *id,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Field-based predicate selecting which events a handler hears.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Required subtype. When unset, events carrying any subtype are skipped.
    pub subtype: Option<String>,
    /// Required channel id.
    pub channel: Option<String>,
    /// Also pass `hello` events, letting a conversation open on connect.
    pub include_hello: bool,
}

impl EventFilter {
    /// Plain user messages from any channel.
    pub fn messages() -> Self {
        Self::default()
    }

    pub fn in_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_hello(mut self, include_hello: bool) -> Self {
        self.include_hello = include_hello;
        self
    }

    pub fn matches(&self, event: &RtmEvent) -> bool {
        if self.include_hello && event.kind == "hello" {
            return true;
        }
        if event.kind != "message" || event.is_edited() || event.is_reply_ack() {
            return false;
        }
        match (&self.subtype, &event.subtype) {
            (Some(wanted), Some(actual)) if wanted != actual => return false,
            (Some(_), None) => return false,
            (None, Some(_)) => return false,
            _ => {}
        }
        match &self.channel {
            Some(channel) => event.channel() == Some(channel.as_str()),
            None => true,
        }
    }
}
