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

use bytes::Bytes;

use super::{
    Error, FieldHeader, FieldType, ListHeader, MapHeader, MessageHeader, MessageType, Protocol,
    Result,
};
use crate::buffer::ByteQueue;

/// Protocol id and version of the compact protocol, and the mask selecting
/// them out of the first two bytes (the remaining bits carry the message
/// type).
pub const COMPACT_MAGIC: u16 = 0x8201;
pub const COMPACT_MAGIC_MASK: u16 = 0xFF1F;

/// Compact-protocol on-wire field type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum CompactFieldType {
    BoolTrue = 1,
    BoolFalse = 2,
    Byte = 3,
    I16 = 4,
    I32 = 5,
    I64 = 6,
    Double = 7,
    String = 8,
    List = 9,
    Set = 10,
    Map = 11,
    Struct = 12,
}

impl CompactFieldType {
    fn from_nibble(buffer: &ByteQueue, value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::BoolTrue,
            2 => Self::BoolFalse,
            3 => Self::Byte,
            4 => Self::I16,
            5 => Self::I32,
            6 => Self::I64,
            7 => Self::Double,
            8 => Self::String,
            9 => Self::List,
            10 => Self::Set,
            11 => Self::Map,
            12 => Self::Struct,
            other => {
                return Err(Error::malformed(
                    buffer,
                    format!("unknown compact protocol field type {other}"),
                ))
            }
        })
    }

    fn widen(self) -> FieldType {
        match self {
            Self::BoolTrue | Self::BoolFalse => FieldType::Bool,
            Self::Byte => FieldType::Byte,
            Self::I16 => FieldType::I16,
            Self::I32 => FieldType::I32,
            Self::I64 => FieldType::I64,
            Self::Double => FieldType::Double,
            Self::String => FieldType::String,
            Self::List => FieldType::List,
            Self::Set => FieldType::Set,
            Self::Map => FieldType::Map,
            Self::Struct => FieldType::Struct,
        }
    }

    fn narrow(buffer: &ByteQueue, field_type: FieldType) -> Result<Self> {
        Ok(match field_type {
            // Boolean fields encode their value in the type code; the
            // write path patches in BoolFalse as needed.
            FieldType::Bool => Self::BoolTrue,
            FieldType::Byte => Self::Byte,
            FieldType::I16 => Self::I16,
            FieldType::I32 => Self::I32,
            FieldType::I64 => Self::I64,
            FieldType::Double => Self::Double,
            FieldType::String => Self::String,
            FieldType::List => Self::List,
            FieldType::Set => Self::Set,
            FieldType::Map => Self::Map,
            FieldType::Struct => Self::Struct,
            FieldType::Stop | FieldType::Void => {
                return Err(Error::malformed(
                    buffer,
                    format!("unknown protocol field type {}", field_type as i8),
                ))
            }
        })
    }
}

/// A peeked variable-length integer: the decoded value and its encoded
/// width, or how many bytes were scanned before the queue ran out.
enum Varint {
    Value(u64, usize),
    Incomplete(usize),
}

/// Var ints are encoded little-endian, seven bits per byte, the high bit
/// flagging continuation. At most ten bytes encode 64 bits.
fn peek_varint(buffer: &ByteQueue, offset: usize) -> Varint {
    let available = buffer.len().saturating_sub(offset).min(10);
    let mut result: u64 = 0;
    let mut shift = 0;
    for index in 0..available {
        let byte = buffer
            .peek_u8(offset + index)
            .expect("peek within available length");
        result |= u64::from(byte & 0x7F) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Varint::Value(result, index + 1);
        }
    }
    Varint::Incomplete(available)
}

fn peek_varint_i32(buffer: &ByteQueue, offset: usize) -> Result<(i32, usize)> {
    match peek_varint(buffer, offset) {
        Varint::Value(value, size) if size <= 5 => Ok((value as u32 as i32, size)),
        Varint::Incomplete(scanned) if scanned < 5 => Err(Error::NeedMoreData),
        _ => Err(Error::malformed(buffer, "invalid compact protocol varint i32")),
    }
}

fn peek_zigzag_i32(buffer: &ByteQueue, offset: usize) -> Result<(i32, usize)> {
    match peek_varint(buffer, offset) {
        Varint::Value(value, size) if size <= 5 => {
            let zigzag = value as u32;
            Ok((((zigzag >> 1) as i32) ^ -((zigzag & 1) as i32), size))
        }
        Varint::Incomplete(scanned) if scanned < 5 => Err(Error::NeedMoreData),
        _ => Err(Error::malformed(
            buffer,
            "invalid compact protocol zig-zag i32",
        )),
    }
}

fn peek_zigzag_i64(buffer: &ByteQueue, offset: usize) -> Result<(i64, usize)> {
    match peek_varint(buffer, offset) {
        Varint::Value(value, size) => {
            Ok((((value >> 1) as i64) ^ -((value & 1) as i64), size))
        }
        Varint::Incomplete(scanned) if scanned < 10 => Err(Error::NeedMoreData),
        _ => Err(Error::malformed(
            buffer,
            "invalid compact protocol zig-zag i64",
        )),
    }
}

fn put_varint(buffer: &mut ByteQueue, mut value: u64) {
    let mut bytes = [0u8; 10];
    let mut len = 0;
    loop {
        if value & !0x7F == 0 {
            bytes[len] = value as u8;
            len += 1;
            break;
        }
        bytes[len] = (value as u8 & 0x7F) | 0x80;
        len += 1;
        value >>= 7;
    }
    buffer.put_slice(&bytes[..len]);
}

fn put_varint_i32(buffer: &mut ByteQueue, value: i32) {
    put_varint(buffer, u64::from(value as u32));
}

fn put_zigzag_i32(buffer: &mut ByteQueue, value: i32) {
    put_varint(buffer, u64::from(((value << 1) ^ (value >> 31)) as u32));
}

fn put_zigzag_i64(buffer: &mut ByteQueue, value: i64) {
    put_varint(buffer, ((value << 1) ^ (value >> 63)) as u64);
}

/// The compact protocol.
///
/// Field ids are encoded as deltas against the previous field of the same
/// struct; a stack tracks the enclosing structs. Boolean struct fields
/// carry their value in the field type code, so the value is latched
/// between the field header and the value read (or write).
#[derive(Debug, Default)]
pub struct CompactProtocol {
    last_field_id: i16,
    field_id_stack: Vec<i16>,
    pending_read_bool: Option<bool>,
    pending_write_bool_id: Option<i16>,
}

impl CompactProtocol {
    pub fn is_magic(version: u16) -> bool {
        version & COMPACT_MAGIC_MASK == COMPACT_MAGIC
    }

    fn write_field_header(
        &mut self,
        buffer: &mut ByteQueue,
        compact_type: CompactFieldType,
        field_id: i16,
    ) {
        let delta = field_id.wrapping_sub(self.last_field_id);
        if field_id > self.last_field_id && delta <= 15 {
            buffer.put_u8(((delta as u8) << 4) | compact_type as u8);
        } else {
            buffer.put_u8(compact_type as u8);
            put_zigzag_i32(buffer, field_id.into());
        }
        self.last_field_id = field_id;
    }
}

impl Protocol for CompactProtocol {
    fn name(&self) -> &str {
        "compact"
    }

    fn read_message_begin(&mut self, buffer: &mut ByteQueue) -> Result<MessageHeader> {
        // Minimum message length:
        //   protocol, message type, and version: 2 bytes +
        //   seq id (var int): 1 byte +
        //   name length (var int): 1 byte +
        //   name: 0 bytes
        if buffer.len() < 4 {
            return Err(Error::NeedMoreData);
        }

        let version = buffer.peek_u16(0).ok_or(Error::NeedMoreData)?;
        if !Self::is_magic(version) {
            return Err(Error::malformed(
                buffer,
                format!(
                    "invalid compact protocol version 0x{:04x} != 0x{COMPACT_MAGIC:04x}",
                    version & COMPACT_MAGIC_MASK
                ),
            ));
        }

        let raw_type = ((version & !COMPACT_MAGIC_MASK) >> 5) as i8;
        let message_type = MessageType::from_i8(raw_type).ok_or_else(|| {
            Error::malformed(
                buffer,
                format!("invalid compact protocol message type {raw_type}"),
            )
        })?;

        let (sequence_id, id_size) = peek_varint_i32(buffer, 2)?;
        let (name_len, name_len_size) = peek_varint_i32(buffer, 2 + id_size)?;
        if name_len < 0 {
            return Err(Error::malformed(
                buffer,
                format!("negative compact protocol message name length {name_len}"),
            ));
        }

        let name_len = name_len as usize;
        if buffer.len() < 2 + id_size + name_len_size + name_len {
            return Err(Error::NeedMoreData);
        }

        buffer.drain(2 + id_size + name_len_size);
        let name = String::from_utf8_lossy(&buffer.split_to(name_len)).into_owned();

        Ok(MessageHeader {
            name,
            message_type,
            sequence_id,
        })
    }

    fn read_message_end(&mut self, _buffer: &mut ByteQueue) -> Result<()> {
        Ok(())
    }

    fn read_struct_begin(&mut self, _buffer: &mut ByteQueue) -> Result<()> {
        self.field_id_stack.push(self.last_field_id);
        self.last_field_id = 0;
        Ok(())
    }

    fn read_struct_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.last_field_id = self.field_id_stack.pop().ok_or_else(|| {
            Error::malformed(buffer, "invalid check for compact protocol struct end")
        })?;
        Ok(())
    }

    fn read_field_begin(&mut self, buffer: &mut ByteQueue) -> Result<FieldHeader> {
        let delta_and_type = buffer.peek_u8(0).ok_or(Error::NeedMoreData)?;
        if delta_and_type & 0x0F == 0 {
            // Type is stop, no further decoding needed.
            buffer.drain(1);
            return Ok(FieldHeader {
                field_type: FieldType::Stop,
                field_id: 0,
            });
        }

        let (compact_type, field_id, id_size) = if delta_and_type >> 4 == 0 {
            // Zero delta marks the long form: a full zig-zag field id
            // follows the type byte.
            let (id, id_size) = peek_zigzag_i32(buffer, 1)?;
            if id < 0 || id > i16::MAX.into() {
                return Err(Error::malformed(
                    buffer,
                    format!("invalid compact protocol field id {id}"),
                ));
            }
            (
                CompactFieldType::from_nibble(buffer, delta_and_type)?,
                id as i16,
                id_size,
            )
        } else {
            // Short form: four bits of delta, four bits of type.
            (
                CompactFieldType::from_nibble(buffer, delta_and_type & 0x0F)?,
                self.last_field_id + (delta_and_type >> 4) as i16,
                0,
            )
        };

        let field_type = compact_type.widen();
        if field_type == FieldType::Bool {
            self.pending_read_bool = Some(compact_type == CompactFieldType::BoolTrue);
        }
        self.last_field_id = field_id;
        buffer.drain(id_size + 1);

        Ok(FieldHeader {
            field_type,
            field_id,
        })
    }

    fn read_field_end(&mut self, _buffer: &mut ByteQueue) -> Result<()> {
        self.pending_read_bool = None;
        Ok(())
    }

    fn read_map_begin(&mut self, buffer: &mut ByteQueue) -> Result<MapHeader> {
        let (size, size_len) = peek_varint_i32(buffer, 0)?;
        if size < 0 {
            return Err(Error::malformed(
                buffer,
                format!("negative compact protocol map size {size}"),
            ));
        }

        if size == 0 {
            // An empty map carries no type information.
            buffer.drain(size_len);
            return Ok(MapHeader {
                key_type: FieldType::Stop,
                value_type: FieldType::Stop,
                size: 0,
            });
        }

        let types = buffer.peek_u8(size_len).ok_or(Error::NeedMoreData)?;
        let key_type = CompactFieldType::from_nibble(buffer, types >> 4)?.widen();
        let value_type = CompactFieldType::from_nibble(buffer, types & 0x0F)?.widen();
        buffer.drain(size_len + 1);

        Ok(MapHeader {
            key_type,
            value_type,
            size: size as u32,
        })
    }

    fn read_map_end(&mut self, _buffer: &mut ByteQueue) -> Result<()> {
        Ok(())
    }

    fn read_list_begin(&mut self, buffer: &mut ByteQueue) -> Result<ListHeader> {
        let size_and_type = buffer.peek_u8(0).ok_or(Error::NeedMoreData)?;
        let (size, size_len) = if size_and_type & 0xF0 != 0xF0 {
            // Short form: size and type in one byte.
            (u32::from(size_and_type >> 4), 0)
        } else {
            // Long form: type byte followed by a var int size.
            let (size, size_len) = peek_varint_i32(buffer, 1)?;
            if size < 0 {
                return Err(Error::malformed(
                    buffer,
                    format!("negative compact protocol list/set size {size}"),
                ));
            }
            (size as u32, size_len)
        };

        let elem_type = CompactFieldType::from_nibble(buffer, size_and_type & 0x0F)?.widen();
        buffer.drain(size_len + 1);

        Ok(ListHeader { elem_type, size })
    }

    fn read_list_end(&mut self, _buffer: &mut ByteQueue) -> Result<()> {
        Ok(())
    }

    fn read_set_begin(&mut self, buffer: &mut ByteQueue) -> Result<ListHeader> {
        self.read_list_begin(buffer)
    }

    fn read_set_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.read_list_end(buffer)
    }

    fn read_bool(&mut self, buffer: &mut ByteQueue) -> Result<bool> {
        // Struct fields carry the value in the field type code.
        if let Some(value) = self.pending_read_bool {
            return Ok(value);
        }

        // Map, set, and list elements are encoded as single bytes.
        let value = buffer.peek_i8(0).ok_or(Error::NeedMoreData)?;
        buffer.drain(1);
        Ok(value != 0)
    }

    fn read_byte(&mut self, buffer: &mut ByteQueue) -> Result<u8> {
        let value = buffer.peek_u8(0).ok_or(Error::NeedMoreData)?;
        buffer.drain(1);
        Ok(value)
    }

    fn read_i16(&mut self, buffer: &mut ByteQueue) -> Result<i16> {
        let (value, size) = peek_zigzag_i32(buffer, 0)?;
        if value < i16::MIN.into() || value > i16::MAX.into() {
            return Err(Error::malformed(
                buffer,
                format!("compact protocol i16 exceeds allowable range {value}"),
            ));
        }
        buffer.drain(size);
        Ok(value as i16)
    }

    fn read_i32(&mut self, buffer: &mut ByteQueue) -> Result<i32> {
        let (value, size) = peek_zigzag_i32(buffer, 0)?;
        buffer.drain(size);
        Ok(value)
    }

    fn read_i64(&mut self, buffer: &mut ByteQueue) -> Result<i64> {
        let (value, size) = peek_zigzag_i64(buffer, 0)?;
        buffer.drain(size);
        Ok(value)
    }

    fn read_double(&mut self, buffer: &mut ByteQueue) -> Result<f64> {
        let value = buffer.peek_f64(0).ok_or(Error::NeedMoreData)?;
        buffer.drain(8);
        Ok(value)
    }

    fn read_string(&mut self, buffer: &mut ByteQueue) -> Result<String> {
        self.read_binary(buffer)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_binary(&mut self, buffer: &mut ByteQueue) -> Result<Bytes> {
        let (len, len_size) = peek_varint_i32(buffer, 0)?;
        if len < 0 {
            return Err(Error::malformed(
                buffer,
                format!("negative compact protocol string/binary length {len}"),
            ));
        }

        let len = len as usize;
        if buffer.len() < len + len_size {
            return Err(Error::NeedMoreData);
        }
        buffer.drain(len_size);
        Ok(buffer.split_to(len))
    }

    fn write_message_begin(&mut self, buffer: &mut ByteQueue, header: &MessageHeader) {
        let ptv = (COMPACT_MAGIC & COMPACT_MAGIC_MASK) | ((header.message_type as u16) << 5);
        debug_assert!(Self::is_magic(ptv));

        buffer.put_u16(ptv);
        put_varint_i32(buffer, header.sequence_id);
        self.write_string(buffer, &header.name);
    }

    fn write_message_end(&mut self, _buffer: &mut ByteQueue) {}

    fn write_struct_begin(&mut self, _buffer: &mut ByteQueue, _name: &str) {
        self.field_id_stack.push(self.last_field_id);
        self.last_field_id = 0;
    }

    fn write_struct_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.last_field_id = self.field_id_stack.pop().ok_or_else(|| {
            Error::malformed(buffer, "invalid write of compact protocol struct end")
        })?;
        Ok(())
    }

    fn write_field_begin(
        &mut self,
        buffer: &mut ByteQueue,
        field_type: FieldType,
        field_id: i16,
    ) -> Result<()> {
        if field_type == FieldType::Stop {
            buffer.put_u8(0);
            return Ok(());
        }

        if field_type == FieldType::Bool {
            // The value determines the type code; defer to write_bool.
            self.pending_write_bool_id = Some(field_id);
            return Ok(());
        }

        let compact_type = CompactFieldType::narrow(buffer, field_type)?;
        self.write_field_header(buffer, compact_type, field_id);
        Ok(())
    }

    fn write_field_end(&mut self, _buffer: &mut ByteQueue) {
        self.pending_write_bool_id = None;
    }

    fn write_map_begin(
        &mut self,
        buffer: &mut ByteQueue,
        key_type: FieldType,
        value_type: FieldType,
        size: u32,
    ) -> Result<()> {
        if size > i32::MAX as u32 {
            return Err(Error::malformed(
                buffer,
                format!("illegal compact protocol map size {size}"),
            ));
        }

        put_varint_i32(buffer, size as i32);
        if size == 0 {
            return Ok(());
        }

        let key = CompactFieldType::narrow(buffer, key_type)? as u8;
        let value = CompactFieldType::narrow(buffer, value_type)? as u8;
        buffer.put_u8((key << 4) | value);
        Ok(())
    }

    fn write_map_end(&mut self, _buffer: &mut ByteQueue) {}

    fn write_list_begin(
        &mut self,
        buffer: &mut ByteQueue,
        elem_type: FieldType,
        size: u32,
    ) -> Result<()> {
        if size > i32::MAX as u32 {
            return Err(Error::malformed(
                buffer,
                format!("illegal compact protocol list/set size {size}"),
            ));
        }

        let compact_type = CompactFieldType::narrow(buffer, elem_type)? as u8;
        if size < 0xF {
            buffer.put_u8(((size as u8) << 4) | compact_type);
        } else {
            buffer.put_u8(0xF0 | compact_type);
            put_varint_i32(buffer, size as i32);
        }
        Ok(())
    }

    fn write_list_end(&mut self, _buffer: &mut ByteQueue) {}

    fn write_set_begin(
        &mut self,
        buffer: &mut ByteQueue,
        elem_type: FieldType,
        size: u32,
    ) -> Result<()> {
        self.write_list_begin(buffer, elem_type, size)
    }

    fn write_set_end(&mut self, _buffer: &mut ByteQueue) {}

    fn write_bool(&mut self, buffer: &mut ByteQueue, value: bool) {
        if let Some(field_id) = self.pending_write_bool_id {
            let compact_type = if value {
                CompactFieldType::BoolTrue
            } else {
                CompactFieldType::BoolFalse
            };
            self.write_field_header(buffer, compact_type, field_id);
            return;
        }

        // Map, set, and list elements are encoded as bytes.
        buffer.put_u8(value.into());
    }

    fn write_byte(&mut self, buffer: &mut ByteQueue, value: u8) {
        buffer.put_u8(value);
    }

    fn write_i16(&mut self, buffer: &mut ByteQueue, value: i16) {
        put_zigzag_i32(buffer, value.into());
    }

    fn write_i32(&mut self, buffer: &mut ByteQueue, value: i32) {
        put_zigzag_i32(buffer, value);
    }

    fn write_i64(&mut self, buffer: &mut ByteQueue, value: i64) {
        put_zigzag_i64(buffer, value);
    }

    fn write_double(&mut self, buffer: &mut ByteQueue, value: f64) {
        buffer.put_f64(value);
    }

    fn write_string(&mut self, buffer: &mut ByteQueue, value: &str) {
        self.write_binary(buffer, value.as_bytes());
    }

    fn write_binary(&mut self, buffer: &mut ByteQueue, value: &[u8]) {
        put_varint_i32(buffer, value.len() as i32);
        buffer.put_slice(value);
    }
}
