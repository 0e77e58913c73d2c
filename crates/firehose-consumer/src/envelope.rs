//! Event envelopes and their compact binary framing.
//!
//! Every WebSocket message delivered by the traffic controller carries exactly
//! one envelope. The frame starts with a header byte (three version bits, five
//! event-kind bits) followed by the origin metadata and the event payload.
//! Integers are LEB128 varints, signed values are zig-zag encoded, strings and
//! byte blobs are length prefixed, and floats are little-endian `f64`.

use std::collections::BTreeMap;

use bytes::Bytes;

pub const PROTOCOL_VERSION: u8 = 1;

const VERSION_BITS: u8 = 3;
const VERSION_MASK: u8 = 0b1110_0000;
const TYPE_MASK: u8 = 0b0001_1111;

const KIND_LOG_MESSAGE: u8 = 1;
const KIND_VALUE_METRIC: u8 = 2;
const KIND_COUNTER_EVENT: u8 = 3;
const KIND_ERROR: u8 = 4;
const KIND_CONTAINER_METRIC: u8 = 5;

const MESSAGE_TYPE_OUT: u8 = 1;
const MESSAGE_TYPE_ERR: u8 = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),
    #[error("unknown event type: {0}")]
    UnknownEventType(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

/// Coarse discriminant used to filter one stream variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    LogMessage,
    ValueMetric,
    CounterEvent,
    Error,
    ContainerMetric,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::LogMessage => "LogMessage",
            EventType::ValueMetric => "ValueMetric",
            EventType::CounterEvent => "CounterEvent",
            EventType::Error => "Error",
            EventType::ContainerMetric => "ContainerMetric",
        }
    }

    fn kind(self) -> u8 {
        match self {
            EventType::LogMessage => KIND_LOG_MESSAGE,
            EventType::ValueMetric => KIND_VALUE_METRIC,
            EventType::CounterEvent => KIND_COUNTER_EVENT,
            EventType::Error => KIND_ERROR,
            EventType::ContainerMetric => KIND_CONTAINER_METRIC,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Out,
    Err,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub message: Bytes,
    pub message_type: MessageType,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub app_id: String,
    pub source_type: String,
    pub source_instance: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueMetric {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEvent {
    pub name: String,
    pub delta: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub source: String,
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerMetric {
    pub app_id: String,
    pub instance_index: i32,
    pub cpu_percentage: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    LogMessage(LogMessage),
    ValueMetric(ValueMetric),
    CounterEvent(CounterEvent),
    Error(ErrorEvent),
    ContainerMetric(ContainerMetric),
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::LogMessage(_) => EventType::LogMessage,
            Event::ValueMetric(_) => EventType::ValueMetric,
            Event::CounterEvent(_) => EventType::CounterEvent,
            Event::Error(_) => EventType::Error,
            Event::ContainerMetric(_) => EventType::ContainerMetric,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin: String,
    /// Nanoseconds since the Unix epoch, when the emitter stamped one.
    pub timestamp: Option<i64>,
    pub deployment: Option<String>,
    pub job: Option<String>,
    pub index: Option<String>,
    pub ip: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub event: Event,
}

impl Envelope {
    pub fn new(origin: impl Into<String>, event: Event) -> Self {
        Self {
            origin: origin.into(),
            timestamp: None,
            deployment: None,
            job: None,
            index: None,
            ip: None,
            tags: BTreeMap::new(),
            event,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }

    pub fn log_message(&self) -> Option<&LogMessage> {
        match &self.event {
            Event::LogMessage(message) => Some(message),
            _ => None,
        }
    }

    pub fn into_log_message(self) -> Option<LogMessage> {
        match self.event {
            Event::LogMessage(message) => Some(message),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        write_header(&mut buf, self.event_type().kind());
        write_str(&mut buf, &self.origin);
        match self.timestamp {
            Some(timestamp) => {
                buf.push(1);
                write_var_i64(&mut buf, timestamp);
            }
            None => buf.push(0),
        }
        for field in [&self.deployment, &self.job, &self.index, &self.ip] {
            write_str(&mut buf, field.as_deref().unwrap_or(""));
        }
        write_var_u64(&mut buf, self.tags.len() as u64);
        for (key, value) in &self.tags {
            write_str(&mut buf, key);
            write_str(&mut buf, value);
        }

        match &self.event {
            Event::LogMessage(log) => {
                write_blob(&mut buf, &log.message);
                buf.push(match log.message_type {
                    MessageType::Out => MESSAGE_TYPE_OUT,
                    MessageType::Err => MESSAGE_TYPE_ERR,
                });
                write_var_i64(&mut buf, log.timestamp);
                write_str(&mut buf, &log.app_id);
                write_str(&mut buf, &log.source_type);
                write_str(&mut buf, &log.source_instance);
            }
            Event::ValueMetric(metric) => {
                write_str(&mut buf, &metric.name);
                buf.extend_from_slice(&metric.value.to_le_bytes());
                write_str(&mut buf, &metric.unit);
            }
            Event::CounterEvent(counter) => {
                write_str(&mut buf, &counter.name);
                write_var_u64(&mut buf, counter.delta);
                write_var_u64(&mut buf, counter.total);
            }
            Event::Error(error) => {
                write_str(&mut buf, &error.source);
                write_var_i64(&mut buf, error.code as i64);
                write_str(&mut buf, &error.message);
            }
            Event::ContainerMetric(metric) => {
                write_str(&mut buf, &metric.app_id);
                write_var_i64(&mut buf, metric.instance_index as i64);
                buf.extend_from_slice(&metric.cpu_percentage.to_le_bytes());
                write_var_u64(&mut buf, metric.memory_bytes);
                write_var_u64(&mut buf, metric.disk_bytes);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(bytes);
        let (version, kind) = read_header(&mut cursor)?;
        if version != PROTOCOL_VERSION {
            return Err(WireError::InvalidVersion(version));
        }
        if !(KIND_LOG_MESSAGE..=KIND_CONTAINER_METRIC).contains(&kind) {
            return Err(WireError::UnknownEventType(kind));
        }

        let origin = cursor.read_string()?;
        let timestamp = if cursor.read_bool()? {
            Some(cursor.read_var_i64()?)
        } else {
            None
        };
        let deployment = non_empty(cursor.read_string()?);
        let job = non_empty(cursor.read_string()?);
        let index = non_empty(cursor.read_string()?);
        let ip = non_empty(cursor.read_string()?);
        let tag_count = cursor.read_var_u64()?;
        let mut tags = BTreeMap::new();
        for _ in 0..tag_count {
            let key = cursor.read_string()?;
            let value = cursor.read_string()?;
            tags.insert(key, value);
        }

        let event = match kind {
            KIND_LOG_MESSAGE => {
                let message = Bytes::copy_from_slice(cursor.read_blob()?);
                let message_type = match cursor.read_u8()? {
                    MESSAGE_TYPE_OUT => MessageType::Out,
                    MESSAGE_TYPE_ERR => MessageType::Err,
                    _ => return Err(WireError::InvalidData("invalid message type")),
                };
                Event::LogMessage(LogMessage {
                    message,
                    message_type,
                    timestamp: cursor.read_var_i64()?,
                    app_id: cursor.read_string()?,
                    source_type: cursor.read_string()?,
                    source_instance: cursor.read_string()?,
                })
            }
            KIND_VALUE_METRIC => Event::ValueMetric(ValueMetric {
                name: cursor.read_string()?,
                value: cursor.read_f64()?,
                unit: cursor.read_string()?,
            }),
            KIND_COUNTER_EVENT => Event::CounterEvent(CounterEvent {
                name: cursor.read_string()?,
                delta: cursor.read_var_u64()?,
                total: cursor.read_var_u64()?,
            }),
            KIND_ERROR => Event::Error(ErrorEvent {
                source: cursor.read_string()?,
                code: cursor.read_var_i32()?,
                message: cursor.read_string()?,
            }),
            _ => Event::ContainerMetric(ContainerMetric {
                app_id: cursor.read_string()?,
                instance_index: cursor.read_var_i32()?,
                cpu_percentage: cursor.read_f64()?,
                memory_bytes: cursor.read_var_u64()?,
                disk_bytes: cursor.read_var_u64()?,
            }),
        };

        if cursor.remaining() > 0 {
            return Err(WireError::TrailingBytes(cursor.remaining()));
        }

        Ok(Envelope {
            origin,
            timestamp,
            deployment,
            job,
            index,
            ip,
            tags,
            event,
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn write_header(buf: &mut Vec<u8>, kind: u8) {
    let version = PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1);
    buf.push((version << 5) | (kind & TYPE_MASK));
}

fn read_header(cursor: &mut Cursor<'_>) -> Result<(u8, u8), WireError> {
    let byte = cursor.read_u8()?;
    Ok(((byte & VERSION_MASK) >> 5, byte & TYPE_MASK))
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_var_i64(buf: &mut Vec<u8>, value: i64) {
    write_var_u64(buf, ((value << 1) ^ (value >> 63)) as u64);
}

fn write_blob(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn write_str(buf: &mut Vec<u8>, value: &str) {
    write_blob(buf, value.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidData("invalid boolean")),
        }
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarIntOverflow)
    }

    fn read_var_i64(&mut self) -> Result<i64, WireError> {
        let raw = self.read_var_u64()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    fn read_var_i32(&mut self) -> Result<i32, WireError> {
        let value = self.read_var_i64()?;
        i32::try_from(value).map_err(|_| WireError::InvalidData("i32 overflow"))
    }

    fn read_f64(&mut self) -> Result<f64, WireError> {
        let raw = self.read_bytes(8)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(raw);
        Ok(f64::from_le_bytes(le))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_blob(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_var_u64()?;
        let len = usize::try_from(len).map_err(|_| WireError::InvalidData("length overflow"))?;
        self.read_bytes(len)
    }

    fn read_string(&mut self) -> Result<String, WireError> {
        let raw = self.read_blob()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidData("invalid utf8"))
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }
}
