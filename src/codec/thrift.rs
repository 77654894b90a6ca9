/*
 * Copyright 2026 The Tiller Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Resumable Thrift protocol codecs.
//!
//! Every read operation either completes, consuming exactly the bytes of
//! the element it decoded, or reports [`Error::NeedMoreData`] leaving the
//! buffer untouched so the caller can retry once more bytes arrive.
//! Malformed input carries the violation message and the buffer length at
//! detection time.

use bytes::Bytes;

use crate::buffer::ByteQueue;

mod auto;
mod binary;
mod compact;
mod decoder;

pub use auto::AutoProtocol;
pub use binary::{BinaryProtocol, LaxBinaryProtocol};
pub use compact::CompactProtocol;
pub use decoder::{DecodeStatus, Decoder, DecoderCallbacks};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// The buffer does not yet hold a complete element. Nothing was
    /// consumed; retry with more data.
    #[error("need more data")]
    NeedMoreData,
    /// The bytes cannot be valid for this protocol. `offset` is the buffer
    /// length when the violation was detected.
    #[error("{reason}")]
    Malformed { reason: String, offset: usize },
}

impl Error {
    pub(crate) fn malformed(buffer: &ByteQueue, reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
            offset: buffer.len(),
        }
    }
}

/// Thrift message kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl MessageType {
    pub fn from_i8(value: i8) -> Option<Self> {
        Some(match value {
            1 => Self::Call,
            2 => Self::Reply,
            3 => Self::Exception,
            4 => Self::Oneway,
            _ => return None,
        })
    }
}

/// Thrift struct field value kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum FieldType {
    Stop = 0,
    Void = 1,
    Bool = 2,
    Byte = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
}

impl FieldType {
    pub fn from_i8(value: i8) -> Option<Self> {
        Some(match value {
            0 => Self::Stop,
            1 => Self::Void,
            2 => Self::Bool,
            3 => Self::Byte,
            4 => Self::Double,
            6 => Self::I16,
            8 => Self::I32,
            10 => Self::I64,
            11 => Self::String,
            12 => Self::Struct,
            13 => Self::Map,
            14 => Self::Set,
            15 => Self::List,
            _ => return None,
        })
    }
}

/// A decoded message header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub message_type: MessageType,
    pub sequence_id: i32,
}

/// A decoded field header. `field_id` defaults to zero for
/// [`FieldType::Stop`], which carries no id on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldHeader {
    pub field_type: FieldType,
    pub field_id: i16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapHeader {
    pub key_type: FieldType,
    pub value_type: FieldType,
    pub size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListHeader {
    pub elem_type: FieldType,
    pub size: u32,
}

/// The operations every Thrift protocol variant implements.
///
/// Protocols are stateful: the compact protocol tracks per-struct field id
/// deltas and pending boolean fields, and the auto protocol latches its
/// detected delegate. One instance therefore serves one message stream.
pub trait Protocol: Send {
    fn name(&self) -> &str;

    fn read_message_begin(&mut self, buffer: &mut ByteQueue) -> Result<MessageHeader>;
    fn read_message_end(&mut self, buffer: &mut ByteQueue) -> Result<()>;
    fn read_struct_begin(&mut self, buffer: &mut ByteQueue) -> Result<()>;
    fn read_struct_end(&mut self, buffer: &mut ByteQueue) -> Result<()>;
    fn read_field_begin(&mut self, buffer: &mut ByteQueue) -> Result<FieldHeader>;
    fn read_field_end(&mut self, buffer: &mut ByteQueue) -> Result<()>;
    fn read_map_begin(&mut self, buffer: &mut ByteQueue) -> Result<MapHeader>;
    fn read_map_end(&mut self, buffer: &mut ByteQueue) -> Result<()>;
    fn read_list_begin(&mut self, buffer: &mut ByteQueue) -> Result<ListHeader>;
    fn read_list_end(&mut self, buffer: &mut ByteQueue) -> Result<()>;
    fn read_set_begin(&mut self, buffer: &mut ByteQueue) -> Result<ListHeader>;
    fn read_set_end(&mut self, buffer: &mut ByteQueue) -> Result<()>;
    fn read_bool(&mut self, buffer: &mut ByteQueue) -> Result<bool>;
    fn read_byte(&mut self, buffer: &mut ByteQueue) -> Result<u8>;
    fn read_i16(&mut self, buffer: &mut ByteQueue) -> Result<i16>;
    fn read_i32(&mut self, buffer: &mut ByteQueue) -> Result<i32>;
    fn read_i64(&mut self, buffer: &mut ByteQueue) -> Result<i64>;
    fn read_double(&mut self, buffer: &mut ByteQueue) -> Result<f64>;
    fn read_string(&mut self, buffer: &mut ByteQueue) -> Result<String>;
    fn read_binary(&mut self, buffer: &mut ByteQueue) -> Result<Bytes>;

    fn write_message_begin(&mut self, buffer: &mut ByteQueue, header: &MessageHeader);
    fn write_message_end(&mut self, buffer: &mut ByteQueue);
    fn write_struct_begin(&mut self, buffer: &mut ByteQueue, name: &str);
    fn write_struct_end(&mut self, buffer: &mut ByteQueue) -> Result<()>;
    fn write_field_begin(
        &mut self,
        buffer: &mut ByteQueue,
        field_type: FieldType,
        field_id: i16,
    ) -> Result<()>;
    fn write_field_end(&mut self, buffer: &mut ByteQueue);
    fn write_map_begin(
        &mut self,
        buffer: &mut ByteQueue,
        key_type: FieldType,
        value_type: FieldType,
        size: u32,
    ) -> Result<()>;
    fn write_map_end(&mut self, buffer: &mut ByteQueue);
    fn write_list_begin(
        &mut self,
        buffer: &mut ByteQueue,
        elem_type: FieldType,
        size: u32,
    ) -> Result<()>;
    fn write_list_end(&mut self, buffer: &mut ByteQueue);
    fn write_set_begin(
        &mut self,
        buffer: &mut ByteQueue,
        elem_type: FieldType,
        size: u32,
    ) -> Result<()>;
    fn write_set_end(&mut self, buffer: &mut ByteQueue);
    fn write_bool(&mut self, buffer: &mut ByteQueue, value: bool);
    fn write_byte(&mut self, buffer: &mut ByteQueue, value: u8);
    fn write_i16(&mut self, buffer: &mut ByteQueue, value: i16);
    fn write_i32(&mut self, buffer: &mut ByteQueue, value: i32);
    fn write_i64(&mut self, buffer: &mut ByteQueue, value: i64);
    fn write_double(&mut self, buffer: &mut ByteQueue, value: f64);
    fn write_string(&mut self, buffer: &mut ByteQueue, value: &str);
    fn write_binary(&mut self, buffer: &mut ByteQueue, value: &[u8]);
}

/// Protocol variants selectable from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Binary,
    LaxBinary,
    Compact,
    #[default]
    Auto,
}

impl ProtocolKind {
    pub fn new_protocol(self) -> Box<dyn Protocol> {
        match self {
            Self::Binary => Box::new(BinaryProtocol::default()),
            Self::LaxBinary => Box::new(LaxBinaryProtocol::default()),
            Self::Compact => Box::new(CompactProtocol::default()),
            Self::Auto => Box::new(AutoProtocol::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_codes_round_trip() {
        for code in [0, 1, 2, 3, 4, 6, 8, 10, 11, 12, 13, 14, 15] {
            let field_type = FieldType::from_i8(code).unwrap();
            assert_eq!(field_type as i8, code);
        }
        for invalid in [5, 7, 9, 16, -1] {
            assert!(FieldType::from_i8(invalid).is_none());
        }
    }

    #[test]
    fn message_type_codes_round_trip() {
        for code in 1..=4 {
            assert_eq!(MessageType::from_i8(code).unwrap() as i8, code);
        }
        assert!(MessageType::from_i8(0).is_none());
        assert!(MessageType::from_i8(5).is_none());
    }

    #[test]
    fn protocol_kind_names() {
        assert_eq!(ProtocolKind::Binary.new_protocol().name(), "binary");
        assert_eq!(
            ProtocolKind::LaxBinary.new_protocol().name(),
            "binary/non-strict"
        );
        assert_eq!(ProtocolKind::Compact.new_protocol().name(), "compact");
        assert_eq!(ProtocolKind::Auto.new_protocol().name(), "auto");
    }
}
