//! Structured transcript messages and the change events that announce them.

use serde::{Deserialize, Serialize};

/// Channel classification for a conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    User,
    Assistant,
    System,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::User => "user",
            Channel::Assistant => "assistant",
            Channel::System => "system",
        }
    }
}

/// Flavor tag for one content part of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFlavor {
    Text,
    Code,
    Narration,
}

/// One content part of a structured message.
///
/// `lines` takes precedence over `text` when rendering; extractors that only
/// capture a flat string leave `lines` empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    pub flavor: ContentFlavor,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub lines: Vec<String>,
}

impl ContentPart {
    /// Builds a plain text part from a flat string.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            flavor: ContentFlavor::Text,
            text: text.into(),
            lines: Vec::new(),
        }
    }

    /// Builds a narration part from a flat string.
    pub fn narration(text: impl Into<String>) -> Self {
        Self {
            flavor: ContentFlavor::Narration,
            text: text.into(),
            lines: Vec::new(),
        }
    }

    /// Returns the renderable lines of this part, trimmed of blank entries.
    pub fn rendered_lines(&self) -> Vec<String> {
        let source: Vec<String> = if self.lines.is_empty() {
            self.text.lines().map(|line| line.to_string()).collect()
        } else {
            self.lines.clone()
        };
        source
            .into_iter()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.trim().is_empty())
            .collect()
    }
}

/// One logical conversational turn.
///
/// `ordinal` is the 1-based position among all known turns of a session and
/// stays 0 until assigned; `index` is the raw position reported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredMessage {
    #[serde(default)]
    pub stable_id: Option<String>,
    pub speaker: String,
    pub channel: Channel,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
    #[serde(default)]
    pub ordinal: u64,
    #[serde(default)]
    pub index: u64,
}

impl StructuredMessage {
    /// Builds a minimal message with a single text part.
    pub fn text(channel: Channel, speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            stable_id: None,
            speaker: speaker.into(),
            channel,
            parts: vec![ContentPart::text(text)],
            ordinal: 0,
            index: 0,
        }
    }

    /// Returns all renderable content lines across parts, in order.
    pub fn content_lines(&self) -> Vec<String> {
        self.parts
            .iter()
            .flat_map(|part| part.rendered_lines())
            .collect()
    }

    /// Content signature used for batch dedup: `channel:speaker:lines`.
    pub fn signature(&self) -> String {
        format!(
            "{}:{}:{}",
            self.channel.as_str(),
            self.speaker.trim(),
            self.content_lines().join("\u{1f}")
        )
    }

    /// Returns true when the message carries any renderable text at all.
    pub fn has_renderable_text(&self) -> bool {
        !self.content_lines().is_empty()
    }

    /// Returns true for narration-only turns: system-channel messages, or
    /// messages whose every part is narration-flavored.
    pub fn is_narration(&self) -> bool {
        if self.channel == Channel::System {
            return true;
        }
        !self.parts.is_empty()
            && self
                .parts
                .iter()
                .all(|part| part.flavor == ContentFlavor::Narration)
    }
}

/// Stable arena id assigned to an observed host node the first time it is
/// seen. Cache entries key on this id rather than on live node references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle(pub u64);

/// Notification that a message became visible or renderable in the host tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub handle: NodeHandle,
    #[serde(default)]
    pub stable_id: Option<String>,
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub channel_hint: Option<Channel>,
    pub timestamp_unix_ms: u64,
}
