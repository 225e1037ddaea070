//! Line-oriented text protocol spoken over a worker's stdin/stdout
//!
//! Host → worker:
//!
//! ```text
//! READY?
//! FRAME <seq> <timestamp_ms> <width>x<height> <format> shm:<path>:<offset>:<len>
//! FRAME <seq> <timestamp_ms> <width>x<height> <format> inline:<base64>
//! SET <key> <value>
//! STOP
//! ```
//!
//! Worker → host:
//!
//! ```text
//! READY [<version>]
//! RESULT <seq> <timestamp_ms> <label,confidence,left,top,right,bottom;...>
//! ERROR <reason>
//! ```
//!
//! Every line parses on its own; a bad line never poisons the stream.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;

use crate::capture::frame::{FrameMetadata, PixelFormat};
use crate::detection::{BoundingBox, DetectedObject};
use crate::error::ProtocolError;

pub const PROTOCOL_VERSION: u32 = 1;

/// Where a worker finds the pixels of a dispatched frame
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadRef {
    Shared {
        path: PathBuf,
        offset: u64,
        len: usize,
    },
    Inline(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameDescriptor {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub payload: PayloadRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    ReadyPoll,
    Frame(FrameDescriptor),
    Set { key: String, value: String },
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Ready {
        version: Option<u32>,
    },
    Result {
        sequence: u64,
        timestamp_ms: u64,
        objects: Vec<DetectedObject>,
    },
    Error(String),
}

impl FrameDescriptor {
    pub fn new(meta: &FrameMetadata, payload: PayloadRef) -> Self {
        Self {
            sequence: meta.sequence,
            timestamp_ms: meta.timestamp_ms,
            width: meta.width,
            height: meta.height,
            format: meta.format,
            payload,
        }
    }
}

fn split_command(line: &str) -> Result<(&str, &str), ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    })
}

fn parse_number<T: FromStr>(field: &'static str, value: Option<&str>) -> Result<T, ProtocolError> {
    let value = value.ok_or(ProtocolError::MissingField(field))?;
    value
        .parse()
        .map_err(|_| ProtocolError::invalid(field, value))
}

impl fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadRef::Shared { path, offset, len } => {
                write!(f, "shm:{}:{}:{}", path.display(), offset, len)
            }
            PayloadRef::Inline(data) => write!(f, "inline:{}", STANDARD.encode(data)),
        }
    }
}

impl FromStr for PayloadRef {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("shm:") {
            // The path may itself contain ':' so split from the right.
            let mut parts = rest.rsplitn(3, ':');
            let len = parse_number("payload length", parts.next())?;
            let offset = parse_number("payload offset", parts.next())?;
            let path = parts
                .next()
                .filter(|p| !p.is_empty())
                .ok_or(ProtocolError::MissingField("payload path"))?;
            Ok(PayloadRef::Shared {
                path: PathBuf::from(path),
                offset,
                len,
            })
        } else if let Some(encoded) = s.strip_prefix("inline:") {
            let data = STANDARD
                .decode(encoded)
                .map_err(|_| ProtocolError::invalid("inline payload", truncate(encoded)))?;
            Ok(PayloadRef::Inline(Bytes::from(data)))
        } else {
            Err(ProtocolError::invalid("payload", truncate(s)))
        }
    }
}

impl fmt::Display for HostMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostMessage::ReadyPoll => f.write_str("READY?"),
            HostMessage::Frame(frame) => write!(
                f,
                "FRAME {} {} {}x{} {} {}",
                frame.sequence,
                frame.timestamp_ms,
                frame.width,
                frame.height,
                frame.format,
                frame.payload
            ),
            HostMessage::Set { key, value } => write!(f, "SET {key} {value}"),
            HostMessage::Stop => f.write_str("STOP"),
        }
    }
}

impl FromStr for HostMessage {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (command, rest) = split_command(line)?;
        match command {
            "READY?" => Ok(HostMessage::ReadyPoll),
            "STOP" => Ok(HostMessage::Stop),
            "SET" => {
                let (key, value) = rest
                    .split_once(char::is_whitespace)
                    .ok_or(ProtocolError::MissingField("value"))?;
                Ok(HostMessage::Set {
                    key: key.to_owned(),
                    value: value.trim().to_owned(),
                })
            }
            "FRAME" => {
                let mut fields = rest.split_whitespace();
                let sequence = parse_number("sequence", fields.next())?;
                let timestamp_ms = parse_number("timestamp", fields.next())?;

                let dims = fields.next().ok_or(ProtocolError::MissingField("dimensions"))?;
                let (width, height) = dims
                    .split_once('x')
                    .ok_or_else(|| ProtocolError::invalid("dimensions", dims))?;
                let width = parse_number("width", Some(width))?;
                let height = parse_number("height", Some(height))?;

                let format = fields.next().ok_or(ProtocolError::MissingField("format"))?;
                let format = format
                    .parse()
                    .map_err(|_| ProtocolError::invalid("format", format))?;

                let payload = fields
                    .next()
                    .ok_or(ProtocolError::MissingField("payload"))?
                    .parse()?;

                if let Some(extra) = fields.next() {
                    return Err(ProtocolError::invalid("trailing field", extra));
                }

                Ok(HostMessage::Frame(FrameDescriptor {
                    sequence,
                    timestamp_ms,
                    width,
                    height,
                    format,
                    payload,
                }))
            }
            other => Err(ProtocolError::UnknownMessage(truncate(other))),
        }
    }
}

impl fmt::Display for WorkerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMessage::Ready { version: None } => f.write_str("READY"),
            WorkerMessage::Ready {
                version: Some(version),
            } => write!(f, "READY {version}"),
            WorkerMessage::Result {
                sequence,
                timestamp_ms,
                objects,
            } => {
                write!(f, "RESULT {sequence} {timestamp_ms} ")?;
                if objects.is_empty() {
                    return f.write_str("-");
                }
                for (i, object) in objects.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    write!(f, "{object}")?;
                }
                Ok(())
            }
            WorkerMessage::Error(reason) => write!(f, "ERROR {}", reason.replace('\n', " ")),
        }
    }
}

impl FromStr for WorkerMessage {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (command, rest) = split_command(line)?;
        match command {
            "READY" => {
                let version = match rest {
                    "" => None,
                    v => Some(parse_number("version", Some(v.trim_start_matches('v')))?),
                };
                Ok(WorkerMessage::Ready { version })
            }
            "RESULT" => {
                let mut fields = rest.splitn(3, char::is_whitespace);
                let sequence = parse_number("sequence", fields.next().filter(|f| !f.is_empty()))?;
                let timestamp_ms = parse_number("timestamp", fields.next())?;
                let objects = parse_objects(fields.next().unwrap_or(""))?;
                Ok(WorkerMessage::Result {
                    sequence,
                    timestamp_ms,
                    objects,
                })
            }
            "ERROR" => {
                let reason = if rest.is_empty() { "unspecified" } else { rest };
                Ok(WorkerMessage::Error(reason.to_owned()))
            }
            other => Err(ProtocolError::UnknownMessage(truncate(other))),
        }
    }
}

fn parse_objects(list: &str) -> Result<Vec<DetectedObject>, ProtocolError> {
    let list = list.trim();
    if list.is_empty() || list == "-" {
        return Ok(Vec::new());
    }

    list.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_object)
        .collect()
}

fn parse_object(entry: &str) -> Result<DetectedObject, ProtocolError> {
    // Labels may contain commas; the five numeric fields are taken from the right.
    let mut fields = entry.rsplitn(6, ',');
    let bottom: f32 = parse_number("bottom", fields.next())?;
    let right: f32 = parse_number("right", fields.next())?;
    let top: f32 = parse_number("top", fields.next())?;
    let left: f32 = parse_number("left", fields.next())?;
    let confidence: f32 = parse_number("confidence", fields.next())?;
    let label = fields
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or(ProtocolError::MissingField("label"))?;

    if !(0.0..=1.0).contains(&confidence) {
        return Err(ProtocolError::invalid("confidence", confidence.to_string()));
    }
    let bbox = BoundingBox::new(left, top, right, bottom)
        .ok_or_else(|| ProtocolError::invalid("bounding box", entry))?;

    Ok(DetectedObject::new(label, confidence, bbox))
}

/// Keep diagnostics short when a worker emits garbage
pub(crate) fn truncate(value: &str) -> String {
    const LIMIT: usize = 64;
    match value.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &value[..idx]),
        None => value.to_owned(),
    }
}
