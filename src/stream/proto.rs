use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Literal heartbeat frame sent on the keepalive interval.
pub const HEARTBEAT_FRAME: &str = "{\"type\":\"\u{2764}\"}";

const MAX_TICK_RATE: f64 = 20.0;

/// Independent event streams multiplexed over one socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum StreamKind {
    /// Server lifecycle. Flows without activation.
    Status,
    Console,
    Heap,
    Tick,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [Self::Status, Self::Console, Self::Heap, Self::Tick];

    /// Name used in the activation frame, `None` for the implicit stream.
    pub fn activation_name(self) -> Option<&'static str> {
        match self {
            Self::Status => None,
            Self::Console => Some("console"),
            Self::Heap => Some("heap"),
            Self::Tick => Some("tick"),
        }
    }

    pub fn requires_activation(self) -> bool {
        self.activation_name().is_some()
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Status => "status",
            Self::Console => "console",
            Self::Heap => "heap",
            Self::Tick => "tick",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HeapData {
    pub usage: Number,
}

impl HeapData {
    /// Bytes in use. Integral values are read exactly, fractional ones are
    /// truncated.
    pub fn usage_bytes(&self) -> i64 {
        self.usage
            .as_i64()
            .or_else(|| {
                self.usage
                    .as_u64()
                    .map(|usage| i64::try_from(usage).unwrap_or(i64::MAX))
            })
            .unwrap_or_else(|| self.usage.as_f64().unwrap_or(0.0) as i64)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TickData {
    #[serde(rename = "averageTickTime")]
    pub average_tick_time: f64,
}

/// Frames as they arrive on the wire.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Line { data: String },
    Heap { data: HeapData },
    Tick { data: TickData },
    /// `message` holds the server info as a JSON-encoded string.
    Status { message: String },
    Connected,
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Frames sent to the stream endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Start { stream: String },
    Command { stream: String, data: String },
}

impl OutboundFrame {
    pub fn start(kind: StreamKind) -> Option<Self> {
        kind.activation_name().map(|stream| Self::Start {
            stream: stream.to_string(),
        })
    }

    pub fn console_command(command: impl Into<String>) -> Self {
        Self::Command {
            stream: "console".to_string(),
            data: command.into(),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decoded payload handed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Status(Value),
    ConsoleLine(String),
    HeapUsage(i64),
    TickRate(f64),
    Unknown,
}

impl StreamEvent {
    /// Stream whose subscribers receive this event.
    pub fn kind(&self) -> Option<StreamKind> {
        match self {
            Self::Status(_) => Some(StreamKind::Status),
            Self::ConsoleLine(_) => Some(StreamKind::Console),
            Self::HeapUsage(_) => Some(StreamKind::Heap),
            Self::TickRate(_) => Some(StreamKind::Tick),
            Self::Unknown => None,
        }
    }

    pub fn as_status(&self) -> Option<&Value> {
        match self {
            Self::Status(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_console_line(&self) -> Option<&str> {
        match self {
            Self::ConsoleLine(line) => Some(line),
            _ => None,
        }
    }
}

/// Decodes one text frame into a [`StreamEvent`].
pub fn decode_event(text: &str) -> Result<StreamEvent, serde_json::Error> {
    let event = match InboundFrame::from_text(text)? {
        InboundFrame::Line { data } => StreamEvent::ConsoleLine(
            data.trim_matches(|c: char| matches!(c, '\r' | '\n' | ' '))
                .to_string(),
        ),
        InboundFrame::Heap { data } => StreamEvent::HeapUsage(data.usage_bytes()),
        InboundFrame::Tick { data } => {
            StreamEvent::TickRate((1000.0 / data.average_tick_time).min(MAX_TICK_RATE))
        }
        InboundFrame::Status { message } => StreamEvent::Status(serde_json::from_str(&message)?),
        InboundFrame::Connected | InboundFrame::Unknown => StreamEvent::Unknown,
    };
    Ok(event)
}
