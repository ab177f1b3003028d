use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Line, SwitchConfigEntry, SwitchView};

pub const MAX_FRAME_BYTES: usize = 2048;

pub const TYPE_IDENTIFIED: &str = "identified";
pub const TYPE_AUTH_SUCCESS: &str = "auth_success";
pub const TYPE_CONFIG_UPDATE: &str = "config_update";
pub const TYPE_SWITCH_COMMAND: &str = "switch_command";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame of {len} bytes exceeds {max}")]
    Oversized { len: usize, max: usize },
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported message type `{0}`")]
    UnknownType(String),
    #[error("switch command names neither a switch nor a gpio")]
    MissingTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteCommand {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub gpio: Option<Line>,
    pub state: bool,
    #[serde(default)]
    pub seq: Option<u64>,
}

impl RemoteCommand {
    pub fn by_name(name: &str, state: bool, seq: Option<u64>) -> Self {
        Self {
            name: Some(name.to_string()),
            gpio: None,
            state,
            seq,
        }
    }

    pub fn by_line(line: Line, state: bool, seq: Option<u64>) -> Self {
        Self {
            name: None,
            gpio: Some(line),
            state,
            seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Identify handshake completed; `None` means the session carries no configuration.
    Identified(Option<Vec<SwitchConfigEntry>>),
    ConfigUpdate(Vec<SwitchConfigEntry>),
    SwitchCommand(RemoteCommand),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Entries stay untyped here and are decoded one by one.
#[derive(Deserialize)]
struct SwitchesBody {
    #[serde(default)]
    switches: Option<Vec<serde_json::Value>>,
}

impl SwitchesBody {
    fn into_entries(self) -> Option<Vec<SwitchConfigEntry>> {
        self.switches.map(|values| {
            values
                .into_iter()
                .map(SwitchConfigEntry::from_value)
                .collect()
        })
    }
}

pub fn decode_inbound(text: &str) -> Result<InboundMessage, DecodeError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::Oversized {
            len: text.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let envelope: Envelope = serde_json::from_str(text)?;
    match envelope.kind.as_str() {
        TYPE_IDENTIFIED | TYPE_AUTH_SUCCESS => {
            let body: SwitchesBody = serde_json::from_str(text)?;
            Ok(InboundMessage::Identified(body.into_entries()))
        }
        TYPE_CONFIG_UPDATE => {
            let body: SwitchesBody = serde_json::from_str(text)?;
            Ok(InboundMessage::ConfigUpdate(body.into_entries().unwrap_or_default()))
        }
        TYPE_SWITCH_COMMAND => {
            let command: RemoteCommand = serde_json::from_str(text)?;
            if command.name.is_none() && command.gpio.is_none() {
                return Err(DecodeError::MissingTarget);
            }
            Ok(InboundMessage::SwitchCommand(command))
        }
        other => Err(DecodeError::UnknownType(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnknownTarget,
    StaleSeq,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTarget => "unknown_target",
            Self::StaleSeq => "stale_seq",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifyPayload {
    pub mac: String,
    pub name: String,
    pub firmware: String,
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateReport {
    pub mac: String,
    pub switches: Vec<SwitchView>,
    pub report: u64,
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl StateReport {
    pub fn state_of(&self, line: Line) -> Option<bool> {
        self.switches
            .iter()
            .find(|switch| switch.gpio == line)
            .map(|switch| switch.state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpio: Option<Line>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "requestedState")]
    pub requested_state: bool,
    #[serde(rename = "actualState", skip_serializing_if = "Option::is_none")]
    pub actual_state: Option<bool>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Heartbeat {
    pub mac: String,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Identify(IdentifyPayload),
    StateUpdate(StateReport),
    SwitchResult(CommandResult),
    Heartbeat(Heartbeat),
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identify(_) => "identify",
            Self::StateUpdate(_) => "state_update",
            Self::SwitchResult(_) => "switch_result",
            Self::Heartbeat(_) => "heartbeat",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
