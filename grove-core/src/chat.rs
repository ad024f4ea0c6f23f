use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GroveError, Result};

const MARKER_OPEN: &str = "<!-- grove:";
const MARKER_CLOSE: &str = "-->";

pub const ACTION_COMPLETE: &str = "complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

/// The JSON payload of a `<!-- grove: {...} -->` marker. A directive with
/// a non-empty `template` tags a user turn (the user is requesting a
/// response with that persona); anything else tags an assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatDirective {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, serde_json::Value>,
}

impl ChatDirective {
    pub fn marks_user_turn(&self) -> bool {
        self.template.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn to_marker(&self) -> String {
        let payload = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("{MARKER_OPEN} {payload} {MARKER_CLOSE}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub speaker: Speaker,
    pub content: String,
    pub directive: Option<ChatDirective>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatTurn {
    fn user(content: String, directive: Option<ChatDirective>) -> Self {
        ChatTurn {
            speaker: Speaker::User,
            content,
            directive,
            timestamp: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

struct Marker {
    start: usize,
    end: usize,
    directive: Option<ChatDirective>,
}

fn scan_markers(body: &str) -> Vec<Marker> {
    let mut markers = Vec::new();
    let mut cursor = 0;
    while let Some(offset) = body[cursor..].find(MARKER_OPEN) {
        let start = cursor + offset;
        let payload_start = start + MARKER_OPEN.len();
        let Some(close_offset) = body[payload_start..].find(MARKER_CLOSE) else {
            break;
        };
        let end = payload_start + close_offset + MARKER_CLOSE.len();
        let payload = body[payload_start..payload_start + close_offset].trim();
        markers.push(Marker {
            start,
            end,
            directive: serde_json::from_str(payload).ok(),
        });
        cursor = end;
    }
    markers
}

/// Parse a chat job's body into ordered turns.
///
/// Text before the first marker (if non-empty) is an initial user turn.
/// Each marker opens a segment running to the next marker; its directive
/// decides the speaker. Segments under a malformed directive are skipped.
/// An empty body parses as a single empty user turn.
pub fn parse_conversation(body: &str) -> Vec<ChatTurn> {
    let markers = scan_markers(body);

    if markers.is_empty() {
        return vec![ChatTurn::user(body.trim().to_string(), None)];
    }

    let mut turns = Vec::new();
    let preamble = body[..markers[0].start].trim();
    if !preamble.is_empty() {
        turns.push(ChatTurn::user(preamble.to_string(), None));
    }

    for (index, marker) in markers.iter().enumerate() {
        let Some(directive) = &marker.directive else {
            continue;
        };
        let segment_end = markers
            .get(index + 1)
            .map(|next| next.start)
            .unwrap_or(body.len());
        let content = body[marker.end..segment_end].trim().to_string();
        let speaker = if directive.marks_user_turn() {
            Speaker::User
        } else {
            Speaker::Assistant
        };
        turns.push(ChatTurn {
            speaker,
            timestamp: extract_response_timestamp(&content),
            content,
            directive: Some(directive.clone()),
        });
    }

    if turns.is_empty() {
        turns.push(ChatTurn::user(String::new(), None));
    }
    turns
}

/// Timestamps ride in the `## LLM Response (<rfc3339>)` heading the chat
/// executor writes.
fn extract_response_timestamp(content: &str) -> Option<DateTime<Utc>> {
    let rest = content.strip_prefix("## LLM Response (")?;
    let end = rest.find(')')?;
    DateTime::parse_from_rfc3339(&rest[..end])
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// A chat job is ready to run one turn iff the conversation ends with a
/// non-empty user turn. A trailing assistant turn or an empty user turn
/// means the job is waiting on operator input.
pub fn conversation_is_ready(turns: &[ChatTurn]) -> bool {
    turns
        .last()
        .is_some_and(|turn| turn.speaker == Speaker::User && !turn.is_empty())
}

/// The last user turn's directive, if any; carries the template/model the
/// next response should use and a possible `action`.
pub fn trailing_user_directive(turns: &[ChatTurn]) -> Option<&ChatDirective> {
    turns
        .last()
        .filter(|turn| turn.speaker == Speaker::User)
        .and_then(|turn| turn.directive.as_ref())
}

/// Render turns back into chat-body form: markers followed by their
/// segments. The initial directive-less user turn renders bare.
pub fn render_chat_body(turns: &[ChatTurn]) -> String {
    let mut out = String::new();
    for turn in turns {
        match &turn.directive {
            None => {
                out.push_str(&turn.content);
                out.push('\n');
            }
            Some(directive) => {
                out.push('\n');
                out.push_str(&directive.to_marker());
                out.push('\n');
                if !turn.content.is_empty() {
                    out.push('\n');
                    out.push_str(&turn.content);
                    out.push('\n');
                }
            }
        }
    }
    out
}

/// Render the one-turn append the chat executor writes after a backend
/// response: the assistant segment tagged with the turn id, then a fresh
/// user directive carrying the template forward for the next exchange.
pub fn render_assistant_segment(
    turn_id: &str,
    response: &str,
    timestamp: DateTime<Utc>,
    next_template: &str,
) -> String {
    let assistant = ChatDirective {
        id: Some(turn_id.to_string()),
        ..Default::default()
    };
    let mut out = format!(
        "\n{}\n## LLM Response ({})\n\n{}\n",
        assistant.to_marker(),
        timestamp.to_rfc3339(),
        response.trim_end(),
    );
    let next = ChatDirective {
        // an empty template would read as an assistant marker; the caller
        // resolves the job's template or falls back to "default"
        template: Some(if next_template.is_empty() {
            "default".to_string()
        } else {
            next_template.to_string()
        }),
        ..Default::default()
    };
    out.push('\n');
    out.push_str(&next.to_marker());
    out.push('\n');
    out
}

/// Serialize turns to the `<conversation>` XML the prompt assembler embeds.
///
/// A `template` on a user directive annotates the *following* assistant
/// turn; the trailing user turn carries `status="awaiting_response"` and
/// `respond_as`. Turns whose directive is in a transient state
/// (`running`, `pending`) are filtered out.
pub fn format_conversation_xml(turns: &[ChatTurn]) -> String {
    let visible: Vec<&ChatTurn> = turns
        .iter()
        .filter(|turn| {
            !matches!(
                turn.directive
                    .as_ref()
                    .and_then(|d| d.state.as_deref()),
                Some("running") | Some("pending")
            )
        })
        .collect();

    let mut out = String::from("<conversation>\n");
    let mut pending_template: Option<String> = None;
    let last = visible.len().saturating_sub(1);
    for (index, turn) in visible.iter().enumerate() {
        let mut attrs = format!(
            " speaker=\"{}\"",
            match turn.speaker {
                Speaker::User => "user",
                Speaker::Assistant => "assistant",
            }
        );
        match turn.speaker {
            Speaker::User => {
                let template = turn
                    .directive
                    .as_ref()
                    .and_then(|d| d.template.clone())
                    .filter(|t| !t.is_empty());
                if index == last {
                    attrs.push_str(" status=\"awaiting_response\"");
                    if let Some(template) = &template {
                        attrs.push_str(&format!(" respond_as=\"{}\"", escape_xml(template)));
                    }
                }
                pending_template = template;
            }
            Speaker::Assistant => {
                if let Some(template) = pending_template.take() {
                    attrs.push_str(&format!(" template=\"{}\"", escape_xml(&template)));
                }
            }
        }
        if let Some(ts) = turn.timestamp {
            attrs.push_str(&format!(" timestamp=\"{}\"", ts.to_rfc3339()));
        }
        out.push_str(&format!(
            "  <turn{attrs}>{}</turn>\n",
            escape_xml(turn.content.trim())
        ));
    }
    out.push_str("</conversation>\n");
    out
}

/// Extract the turns whose directive ids match a `path#id1,id2` style
/// reference. Every requested id must be present.
pub fn extract_blocks(body: &str, ids: &[&str]) -> Result<Vec<String>> {
    let turns = parse_conversation(body);
    let mut blocks = Vec::with_capacity(ids.len());
    for id in ids {
        let found = turns.iter().find(|turn| {
            turn.directive
                .as_ref()
                .and_then(|d| d.id.as_deref())
                .is_some_and(|turn_id| turn_id == *id)
        });
        match found {
            Some(turn) => blocks.push(turn.content.clone()),
            None => {
                return Err(GroveError::other(format!(
                    "source block `{id}` not found in chat body"
                )));
            }
        }
    }
    Ok(blocks)
}

pub fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
