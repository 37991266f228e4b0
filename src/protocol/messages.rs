//! MQTT-SN message types exchanged between the gateway and constrained clients
//!
//! Only the messages the publish forwarder and the session driver produce or
//! consume are modelled as typed structs. Any other message type is carried as
//! [`Message::Other`] so it can still act as a generic wake-up event.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// MQTT-SN message type identifiers (MQTT-SN v1.2, section 5.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Connect = 0x04,
    Connack = 0x05,
    Register = 0x0A,
    Regack = 0x0B,
    Publish = 0x0C,
    Puback = 0x0D,
    Pubcomp = 0x0E,
    Pubrec = 0x0F,
    Pubrel = 0x10,
    Pingreq = 0x16,
    Pingresp = 0x17,
    Disconnect = 0x18,
}

impl MsgType {
    /// Map a raw type byte to a modelled message type
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x04 => Some(Self::Connect),
            0x05 => Some(Self::Connack),
            0x0A => Some(Self::Register),
            0x0B => Some(Self::Regack),
            0x0C => Some(Self::Publish),
            0x0D => Some(Self::Puback),
            0x0E => Some(Self::Pubcomp),
            0x0F => Some(Self::Pubrec),
            0x10 => Some(Self::Pubrel),
            0x16 => Some(Self::Pingreq),
            0x17 => Some(Self::Pingresp),
            0x18 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// Return codes carried by REGACK and PUBACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Accepted,
    Congestion,
    InvalidTopicId,
    NotSupported,
    Other(u8),
}

impl From<u8> for ReturnCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Accepted,
            0x01 => Self::Congestion,
            0x02 => Self::InvalidTopicId,
            0x03 => Self::NotSupported,
            other => Self::Other(other),
        }
    }
}

impl From<ReturnCode> for u8 {
    fn from(code: ReturnCode) -> Self {
        match code {
            ReturnCode::Accepted => 0x00,
            ReturnCode::Congestion => 0x01,
            ReturnCode::InvalidTopicId => 0x02,
            ReturnCode::NotSupported => 0x03,
            ReturnCode::Other(other) => other,
        }
    }
}

/// Delivery guarantee of a publish as negotiated on the broker side
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// Convert a numeric level (0, 1 or 2) into a QoS
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

impl From<rumqttc::v5::mqttbytes::QoS> for QoS {
    fn from(qos: rumqttc::v5::mqttbytes::QoS) -> Self {
        match qos {
            rumqttc::v5::mqttbytes::QoS::AtMostOnce => Self::AtMostOnce,
            rumqttc::v5::mqttbytes::QoS::AtLeastOnce => Self::AtLeastOnce,
            rumqttc::v5::mqttbytes::QoS::ExactlyOnce => Self::ExactlyOnce,
        }
    }
}

impl From<QoS> for rumqttc::v5::mqttbytes::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Self::AtMostOnce,
            QoS::AtLeastOnce => Self::AtLeastOnce,
            QoS::ExactlyOnce => Self::ExactlyOnce,
        }
    }
}

/// QoS bits value meaning "QoS -1" (publish without connection)
pub const QOS_BITS_NO_CONNECTION: u8 = 0b11;

/// Translate a broker-side QoS into the 2-bit client-facing encoding
pub fn translate_qos_for_client(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0b00,
        QoS::AtLeastOnce => 0b01,
        QoS::ExactlyOnce => 0b10,
    }
}

/// Kind of topic identifier carried in a PUBLISH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicIdType {
    Normal,
    PreDefined,
    ShortName,
    Reserved,
}

impl TopicIdType {
    fn bits(self) -> u8 {
        match self {
            Self::Normal => 0b00,
            Self::PreDefined => 0b01,
            Self::ShortName => 0b10,
            Self::Reserved => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::Normal,
            0b01 => Self::PreDefined,
            0b10 => Self::ShortName,
            _ => Self::Reserved,
        }
    }
}

const FLAG_DUP: u8 = 0x80;
const FLAG_QOS_SHIFT: u8 = 5;
const FLAG_QOS_MASK: u8 = 0x60;
const FLAG_RETAIN: u8 = 0x10;
const FLAG_WILL: u8 = 0x08;
const FLAG_CLEAN_SESSION: u8 = 0x04;

/// The PUBLISH flags byte
///
/// ```
/// use mqttsn_gateway::protocol::{Flags, TopicIdType};
///
/// let flags = Flags {
///     dup: true,
///     qos_bits: 0b01,
///     retain: true,
///     topic_id_type: TopicIdType::PreDefined,
///     ..Default::default()
/// };
/// assert_eq!(flags.to_byte(), 0b1011_0001);
/// assert_eq!(Flags::from_byte(0b1011_0001), flags);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub dup: bool,
    /// Raw 2-bit QoS field, see [`translate_qos_for_client`]
    pub qos_bits: u8,
    pub retain: bool,
    pub will: bool,
    pub clean_session: bool,
    pub topic_id_type: TopicIdType,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            dup: false,
            qos_bits: 0,
            retain: false,
            will: false,
            clean_session: false,
            topic_id_type: TopicIdType::Normal,
        }
    }
}

impl Flags {
    pub fn to_byte(self) -> u8 {
        let mut byte = (self.qos_bits << FLAG_QOS_SHIFT) & FLAG_QOS_MASK;
        if self.dup {
            byte |= FLAG_DUP;
        }
        if self.retain {
            byte |= FLAG_RETAIN;
        }
        if self.will {
            byte |= FLAG_WILL;
        }
        if self.clean_session {
            byte |= FLAG_CLEAN_SESSION;
        }
        byte | self.topic_id_type.bits()
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            dup: byte & FLAG_DUP != 0,
            qos_bits: (byte & FLAG_QOS_MASK) >> FLAG_QOS_SHIFT,
            retain: byte & FLAG_RETAIN != 0,
            will: byte & FLAG_WILL != 0,
            clean_session: byte & FLAG_CLEAN_SESSION != 0,
            topic_id_type: TopicIdType::from_bits(byte),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub topic_id: u16,
    pub msg_id: u16,
    pub topic_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Regack {
    pub topic_id: u16,
    pub msg_id: u16,
    pub return_code: ReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub flags: Flags,
    pub topic_id: u16,
    pub msg_id: u16,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Puback {
    pub topic_id: u16,
    pub msg_id: u16,
    pub return_code: ReturnCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pubrec {
    pub msg_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pubrel {
    pub msg_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pubcomp {
    pub msg_id: u16,
}

/// PINGREQ; a sleeping client includes its client id to poll for messages
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pingreq {
    pub client_id: Option<String>,
}

/// DISCONNECT; a duration means the client is going to sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub duration: Option<u16>,
}

/// CONNACK answering a client's CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub return_code: ReturnCode,
}

/// Any MQTT-SN message seen by a client session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connack(Connack),
    Register(Register),
    Regack(Regack),
    Publish(Publish),
    Puback(Puback),
    Pubrec(Pubrec),
    Pubrel(Pubrel),
    Pubcomp(Pubcomp),
    Pingreq(Pingreq),
    Pingresp,
    Disconnect(Disconnect),
    /// A message type this gateway does not model, by raw type byte
    Other(u8),
}

impl Message {
    /// Raw MQTT-SN type byte of this message
    pub fn msg_type(&self) -> u8 {
        let known = match self {
            Message::Connack(_) => MsgType::Connack,
            Message::Register(_) => MsgType::Register,
            Message::Regack(_) => MsgType::Regack,
            Message::Publish(_) => MsgType::Publish,
            Message::Puback(_) => MsgType::Puback,
            Message::Pubrec(_) => MsgType::Pubrec,
            Message::Pubrel(_) => MsgType::Pubrel,
            Message::Pubcomp(_) => MsgType::Pubcomp,
            Message::Pingreq(_) => MsgType::Pingreq,
            Message::Pingresp => MsgType::Pingresp,
            Message::Disconnect(_) => MsgType::Disconnect,
            Message::Other(raw) => return *raw,
        };
        known as u8
    }

    /// A CONNECT, which this gateway only sees as a raw type byte
    pub fn is_connect(&self) -> bool {
        matches!(self, Message::Other(raw) if *raw == MsgType::Connect as u8)
    }

    /// Short uppercase name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Message::Connack(_) => "CONNACK",
            Message::Register(_) => "REGISTER",
            Message::Regack(_) => "REGACK",
            Message::Publish(_) => "PUBLISH",
            Message::Puback(_) => "PUBACK",
            Message::Pubrec(_) => "PUBREC",
            Message::Pubrel(_) => "PUBREL",
            Message::Pubcomp(_) => "PUBCOMP",
            Message::Pingreq(_) => "PINGREQ",
            Message::Pingresp => "PINGRESP",
            Message::Disconnect(_) => "DISCONNECT",
            Message::Other(_) => "OTHER",
        }
    }
}
