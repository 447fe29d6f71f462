//! Messages exchanged between producers, the broker and consumers

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Weak;
use std::time::SystemTime;

use crate::error::RavenClientError;
use crate::session::SessionInner;
use crate::wire_string::WireString;
use crate::Result;

/// Fixed part of an encoded message: id, durable, priority, timestamp,
/// expiration, delivery count and body length
const FIXED_HEADER_SIZE: usize = 8 + 1 + 1 + 8 + 8 + 4 + 4;

/// Default message priority
pub const DEFAULT_PRIORITY: u8 = 4;

/// Typed message property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(WireString),
    Bytes(Bytes),
}

impl PropertyValue {
    fn encode_size(&self) -> usize {
        1 + match self {
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) => 4,
            PropertyValue::Long(_) | PropertyValue::Double(_) => 8,
            PropertyValue::String(s) => s.size_of(),
            PropertyValue::Bytes(b) => 4 + b.len(),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(WireString::from(v))
    }
}

impl From<WireString> for PropertyValue {
    fn from(v: WireString) -> Self {
        PropertyValue::String(v)
    }
}

impl From<Bytes> for PropertyValue {
    fn from(v: Bytes) -> Self {
        PropertyValue::Bytes(v)
    }
}

/// Receipt attached to a consumed message so it can be acknowledged later
#[derive(Clone)]
pub(crate) struct AckToken {
    pub(crate) session: Weak<SessionInner>,
    pub(crate) consumer_id: u64,
    pub(crate) epoch: u64,
    pub(crate) consumption_seq: u64,
}

impl fmt::Debug for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckToken")
            .field("consumer_id", &self.consumer_id)
            .field("epoch", &self.epoch)
            .field("consumption_seq", &self.consumption_seq)
            .finish()
    }
}

/// A message as seen by the application
#[derive(Debug, Clone)]
pub struct ClientMessage {
    message_id: u64,
    address: Option<WireString>,
    body: Bytes,
    properties: HashMap<WireString, PropertyValue>,
    durable: bool,
    priority: u8,
    timestamp: u64,
    expiration: u64,
    group_id: Option<WireString>,
    delivery_count: u32,
    pub(crate) ack: Option<AckToken>,
}

impl ClientMessage {
    /// Empty message
    pub fn new(durable: bool) -> Self {
        Self {
            message_id: 0,
            address: None,
            body: Bytes::new(),
            properties: HashMap::new(),
            durable,
            priority: DEFAULT_PRIORITY,
            timestamp: now_millis(),
            expiration: 0,
            group_id: None,
            delivery_count: 0,
            ack: None,
        }
    }

    /// Builder-style body setter
    pub fn with_body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    /// Builder-style property setter
    pub fn with_property<K: Into<WireString>, V: Into<PropertyValue>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Replace the body
    pub fn set_body<B: Into<Bytes>>(&mut self, body: B) {
        self.body = body.into();
    }

    /// Replace the body with UTF-8 text
    pub fn set_text(&mut self, text: &str) {
        self.body = Bytes::copy_from_slice(text.as_bytes());
    }

    /// Set a property, replacing any previous value
    pub fn set_property<K: Into<WireString>, V: Into<PropertyValue>>(&mut self, key: K, value: V) {
        self.properties.insert(key.into(), value.into());
    }

    /// Pin the message to a group
    pub fn set_group_id<G: Into<WireString>>(&mut self, group_id: G) {
        self.group_id = Some(group_id.into());
    }

    /// Set the priority, 0 to 9
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority.min(9);
    }

    /// Absolute expiry time in epoch millis, 0 means never
    pub fn set_expiration(&mut self, expiration: u64) {
        self.expiration = expiration;
    }

    /// Server assigned identifier, 0 until the message has been delivered
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Address the message was sent to
    pub fn address(&self) -> Option<&WireString> {
        self.address.as_ref()
    }

    /// Raw body bytes
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|_| RavenClientError::protocol("Message body is not valid UTF-8"))
    }

    /// Property value by key
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(&WireString::from(key))
    }

    /// All properties
    pub fn properties(&self) -> &HashMap<WireString, PropertyValue> {
        &self.properties
    }

    /// Group the message belongs to
    pub fn group_id(&self) -> Option<&WireString> {
        self.group_id.as_ref()
    }

    /// Whether the message survives a server restart
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Priority, 0 to 9
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Send time in milliseconds since the epoch
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Expiry in milliseconds since the epoch; 0 never expires
    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    /// Number of times the server has handed this message out
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// True when a previous delivery of this message was not acknowledged
    pub fn is_redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    /// Acknowledge this message.
    ///
    /// On a client-acknowledge session this also acknowledges every message
    /// consumed earlier on the same session.
    pub async fn acknowledge(&self) -> Result<()> {
        let token = self
            .ack
            .as_ref()
            .ok_or_else(|| RavenClientError::illegal_state("Message was not received from a consumer"))?;
        let session = token
            .session
            .upgrade()
            .ok_or_else(|| RavenClientError::closed("Session"))?;
        session.acknowledge_token(token).await
    }

    /// Bytes this message occupies on the wire, used for credit accounting
    pub fn encode_size(&self) -> usize {
        FIXED_HEADER_SIZE
            + WireString::size_of_nullable(self.address.as_ref())
            + WireString::size_of_nullable(self.group_id.as_ref())
            + 4
            + self
                .properties
                .iter()
                .map(|(k, v)| k.size_of() + v.encode_size())
                .sum::<usize>()
            + self.body.len()
    }

    /// Size of the encoded header, excluding the body
    pub fn header_size(&self) -> usize {
        self.encode_size() - self.body.len()
    }

    /// Copy for the wire: stamped with the destination, stripped of receipts
    pub(crate) fn outbound(&self, address: WireString) -> ClientMessage {
        let mut message = self.clone();
        message.address = Some(address);
        message.ack = None;
        message.message_id = 0;
        message.delivery_count = 0;
        message
    }

    /// Server side stamping of a stored message
    pub(crate) fn stored(mut self, message_id: u64) -> ClientMessage {
        self.message_id = message_id;
        self
    }

    pub(crate) fn with_delivery_count(mut self, delivery_count: u32) -> ClientMessage {
        self.delivery_count = delivery_count;
        self
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
