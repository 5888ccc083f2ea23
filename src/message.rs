//! Control channel messages.
//!
//! A message travels as a JSON 2-tuple `[type, attributes]` where `attributes`
//! is either `null` or a list of numbers, strings and booleans:
//!
//! ```text
//! ["init_stream", [1000]]
//! ["continue", [1752312345.25, true]]
//! ["close_stream", null]
//! ```

use crate::flow::Estimate;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    InitStream,
    CloseStream,
    CloseAck,
    Start,
    Finish,
    Continue,
    Stop,
    Prune,
    Turn,
    Switch,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::InitStream => "init_stream",
            MessageKind::CloseStream => "close_stream",
            MessageKind::CloseAck => "close_ack",
            MessageKind::Start => "start",
            MessageKind::Finish => "finish",
            MessageKind::Continue => "continue",
            MessageKind::Stop => "stop",
            MessageKind::Prune => "prune",
            MessageKind::Turn => "turn",
            MessageKind::Switch => "switch",
        }
    }
}

impl FromStr for MessageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "init_stream" => MessageKind::InitStream,
            "close_stream" => MessageKind::CloseStream,
            "close_ack" => MessageKind::CloseAck,
            "start" => MessageKind::Start,
            "finish" => MessageKind::Finish,
            "continue" => MessageKind::Continue,
            "stop" => MessageKind::Stop,
            "prune" => MessageKind::Prune,
            "turn" => MessageKind::Turn,
            "switch" => MessageKind::Switch,
            other => return Err(anyhow!("Unknown message type '{}'", other)),
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Open a flow expecting `bandwidth_kbps`.
    InitStream { bandwidth_kbps: u64 },
    CloseStream,
    /// Final statistics of a closed flow, `None` if no flow was open.
    CloseAck(Option<Estimate>),
    /// Chain hand-off, optionally carrying a rate.
    Start(Option<u64>),
    Finish(Option<u64>),
    /// Barrier announcement: probe at `at` if `proceed`.
    Continue { at: SystemTime, proceed: bool },
    Stop { stopped: bool },
    /// prune/turn/switch of the streaming coordination layer, passed through.
    Coordination {
        kind: MessageKind,
        attributes: Option<Vec<Value>>,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::InitStream { .. } => MessageKind::InitStream,
            Message::CloseStream => MessageKind::CloseStream,
            Message::CloseAck(_) => MessageKind::CloseAck,
            Message::Start(_) => MessageKind::Start,
            Message::Finish(_) => MessageKind::Finish,
            Message::Continue { .. } => MessageKind::Continue,
            Message::Stop { .. } => MessageKind::Stop,
            Message::Coordination { kind, .. } => *kind,
        }
    }

    fn attributes(&self) -> Option<Vec<Value>> {
        match self {
            Message::InitStream { bandwidth_kbps } => Some(vec![Value::from(*bandwidth_kbps)]),
            Message::CloseStream => None,
            Message::CloseAck(estimate) => {
                estimate.map(|e| vec![Value::from(e.rho), Value::from(e.sigma)])
            }
            Message::Start(rate) | Message::Finish(rate) => rate.map(|r| vec![Value::from(r)]),
            Message::Continue { at, proceed } => {
                Some(vec![Value::from(to_epoch_secs(*at)), Value::from(*proceed)])
            }
            Message::Stop { stopped } => Some(vec![Value::from(*stopped)]),
            Message::Coordination { attributes, .. } => attributes.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = (self.kind().as_str(), self.attributes());
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (kind, attributes): (String, Option<Vec<Value>>) =
            serde_json::from_slice(data).context("Malformed control message")?;
        let kind: MessageKind = kind.parse()?;
        let attrs = attributes.as_deref().unwrap_or(&[]);

        Ok(match kind {
            MessageKind::InitStream => Message::InitStream {
                bandwidth_kbps: rate_at(attrs, 0)?
                    .ok_or_else(|| anyhow!("init_stream without bandwidth"))?,
            },
            MessageKind::CloseStream => Message::CloseStream,
            MessageKind::CloseAck => match attributes.as_deref() {
                None | Some([]) => Message::CloseAck(None),
                Some(_) => Message::CloseAck(Some(Estimate::new(
                    integer_at(attrs, 0)?,
                    integer_at(attrs, 1)?,
                ))),
            },
            MessageKind::Start => Message::Start(rate_at(attrs, 0)?),
            MessageKind::Finish => Message::Finish(rate_at(attrs, 0)?),
            MessageKind::Continue => {
                let secs = attrs
                    .first()
                    .and_then(Value::as_f64)
                    .ok_or_else(|| anyhow!("continue without start time"))?;
                Message::Continue {
                    at: from_epoch_secs(secs)?,
                    proceed: bool_at(attrs, 1)?,
                }
            }
            MessageKind::Stop => Message::Stop {
                stopped: bool_at(attrs, 0)?,
            },
            MessageKind::Prune | MessageKind::Turn | MessageKind::Switch => {
                Message::Coordination { kind, attributes }
            }
        })
    }
}

/// Rates may arrive as floats from other implementations; they are truncated.
fn rate_at(attrs: &[Value], index: usize) -> Result<Option<u64>> {
    match attrs.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(|| anyhow!("Invalid rate attribute {}", v)),
    }
}

fn integer_at(attrs: &[Value], index: usize) -> Result<i64> {
    let v = attrs
        .get(index)
        .ok_or_else(|| anyhow!("Missing attribute {}", index))?;
    v.as_i64()
        .or_else(|| v.as_f64().map(|f| f as i64))
        .ok_or_else(|| anyhow!("Invalid integer attribute {}", v))
}

fn bool_at(attrs: &[Value], index: usize) -> Result<bool> {
    attrs
        .get(index)
        .and_then(Value::as_bool)
        .ok_or_else(|| anyhow!("Missing boolean attribute {}", index))
}

fn to_epoch_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn from_epoch_secs(secs: f64) -> Result<SystemTime> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(anyhow!("Invalid timestamp {}", secs));
    }
    Ok(UNIX_EPOCH + Duration::from_secs_f64(secs))
}
