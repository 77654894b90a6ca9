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

/// The strict binary protocol version magic.
pub const BINARY_MAGIC: u16 = 0x8001;

/// The strict binary protocol.
#[derive(Debug, Default)]
pub struct BinaryProtocol;

impl BinaryProtocol {
    pub fn is_magic(version: u16) -> bool {
        version == BINARY_MAGIC
    }
}

fn read_message_type(buffer: &ByteQueue, raw: i8, lax: bool) -> Result<MessageType> {
    MessageType::from_i8(raw).ok_or_else(|| {
        let variant = if lax { " (lax)" } else { "" };
        Error::malformed(
            buffer,
            format!("invalid{variant} binary protocol message type {raw}"),
        )
    })
}

fn read_field_type(buffer: &ByteQueue, raw: i8) -> Result<FieldType> {
    FieldType::from_i8(raw)
        .ok_or_else(|| Error::malformed(buffer, format!("unknown binary protocol field type {raw}")))
}

fn read_string_chunk(buffer: &mut ByteQueue) -> Result<Bytes> {
    // Encoded as size (4 bytes) followed by the bytes themselves.
    let len = buffer.peek_i32(0).ok_or(Error::NeedMoreData)?;
    if len < 0 {
        return Err(Error::malformed(
            buffer,
            format!("negative binary protocol string/binary length {len}"),
        ));
    }

    let len = len as usize;
    if buffer.len() < len + 4 {
        return Err(Error::NeedMoreData);
    }
    buffer.drain(4);
    Ok(buffer.split_to(len))
}

fn write_string_chunk(buffer: &mut ByteQueue, value: &[u8]) {
    buffer.put_u32(value.len() as u32);
    buffer.put_slice(value);
}

impl Protocol for BinaryProtocol {
    fn name(&self) -> &str {
        "binary"
    }

    fn read_message_begin(&mut self, buffer: &mut ByteQueue) -> Result<MessageHeader> {
        // Minimum message length:
        //   version: 2 bytes +
        //   unused: 1 byte +
        //   msg type: 1 byte +
        //   name len: 4 bytes +
        //   name: 0 bytes +
        //   seq id: 4 bytes
        if buffer.len() < 12 {
            return Err(Error::NeedMoreData);
        }

        let version = buffer.peek_u16(0).ok_or(Error::NeedMoreData)?;
        if !Self::is_magic(version) {
            return Err(Error::malformed(
                buffer,
                format!("invalid binary protocol version 0x{version:04x} != 0x{BINARY_MAGIC:04x}"),
            ));
        }

        // The byte at offset 2 is unused and ignored.
        let message_type =
            read_message_type(buffer, buffer.peek_i8(3).ok_or(Error::NeedMoreData)?, false)?;

        let name_len = buffer.peek_u32(4).ok_or(Error::NeedMoreData)? as usize;
        if buffer.len() < name_len + 12 {
            return Err(Error::NeedMoreData);
        }

        buffer.drain(8);
        let name = String::from_utf8_lossy(&buffer.split_to(name_len)).into_owned();
        let sequence_id = buffer.peek_i32(0).ok_or(Error::NeedMoreData)?;
        buffer.drain(4);

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
        // The binary protocol does not transmit struct names.
        Ok(())
    }

    fn read_struct_end(&mut self, _buffer: &mut ByteQueue) -> Result<()> {
        Ok(())
    }

    fn read_field_begin(&mut self, buffer: &mut ByteQueue) -> Result<FieldHeader> {
        // FieldType::Stop is encoded as a single byte.
        let raw = buffer.peek_i8(0).ok_or(Error::NeedMoreData)?;
        let field_type = read_field_type(buffer, raw)?;
        if field_type == FieldType::Stop {
            buffer.drain(1);
            return Ok(FieldHeader {
                field_type,
                field_id: 0,
            });
        }

        // Field type followed by 2 bytes of field id.
        let field_id = buffer.peek_i16(1).ok_or(Error::NeedMoreData)?;
        if field_id < 0 {
            return Err(Error::malformed(
                buffer,
                format!("invalid binary protocol field id {field_id}"),
            ));
        }
        buffer.drain(3);

        Ok(FieldHeader {
            field_type,
            field_id,
        })
    }

    fn read_field_end(&mut self, _buffer: &mut ByteQueue) -> Result<()> {
        Ok(())
    }

    fn read_map_begin(&mut self, buffer: &mut ByteQueue) -> Result<MapHeader> {
        // Key type (1) + value type (1) + size (4).
        if buffer.len() < 6 {
            return Err(Error::NeedMoreData);
        }

        let key_type = read_field_type(buffer, buffer.peek_i8(0).ok_or(Error::NeedMoreData)?)?;
        let value_type = read_field_type(buffer, buffer.peek_i8(1).ok_or(Error::NeedMoreData)?)?;
        let size = buffer.peek_i32(2).ok_or(Error::NeedMoreData)?;
        if size < 0 {
            return Err(Error::malformed(
                buffer,
                format!("negative binary protocol map size {size}"),
            ));
        }
        buffer.drain(6);

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
        // Element type (1) + size (4).
        if buffer.len() < 5 {
            return Err(Error::NeedMoreData);
        }

        let elem_type = read_field_type(buffer, buffer.peek_i8(0).ok_or(Error::NeedMoreData)?)?;
        let size = buffer.peek_i32(1).ok_or(Error::NeedMoreData)?;
        if size < 0 {
            return Err(Error::malformed(
                buffer,
                format!("negative binary protocol list/set size {size}"),
            ));
        }
        buffer.drain(5);

        Ok(ListHeader {
            elem_type,
            size: size as u32,
        })
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
        let value = buffer.peek_i16(0).ok_or(Error::NeedMoreData)?;
        buffer.drain(2);
        Ok(value)
    }

    fn read_i32(&mut self, buffer: &mut ByteQueue) -> Result<i32> {
        let value = buffer.peek_i32(0).ok_or(Error::NeedMoreData)?;
        buffer.drain(4);
        Ok(value)
    }

    fn read_i64(&mut self, buffer: &mut ByteQueue) -> Result<i64> {
        let value = buffer.peek_i64(0).ok_or(Error::NeedMoreData)?;
        buffer.drain(8);
        Ok(value)
    }

    fn read_double(&mut self, buffer: &mut ByteQueue) -> Result<f64> {
        let value = buffer.peek_f64(0).ok_or(Error::NeedMoreData)?;
        buffer.drain(8);
        Ok(value)
    }

    fn read_string(&mut self, buffer: &mut ByteQueue) -> Result<String> {
        read_string_chunk(buffer).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_binary(&mut self, buffer: &mut ByteQueue) -> Result<Bytes> {
        read_string_chunk(buffer)
    }

    fn write_message_begin(&mut self, buffer: &mut ByteQueue, header: &MessageHeader) {
        buffer.put_u16(BINARY_MAGIC);
        buffer.put_u16(header.message_type as u16);
        self.write_string(buffer, &header.name);
        buffer.put_i32(header.sequence_id);
    }

    fn write_message_end(&mut self, _buffer: &mut ByteQueue) {}

    fn write_struct_begin(&mut self, _buffer: &mut ByteQueue, _name: &str) {}

    fn write_struct_end(&mut self, _buffer: &mut ByteQueue) -> Result<()> {
        Ok(())
    }

    fn write_field_begin(
        &mut self,
        buffer: &mut ByteQueue,
        field_type: FieldType,
        field_id: i16,
    ) -> Result<()> {
        buffer.put_i8(field_type as i8);
        if field_type != FieldType::Stop {
            buffer.put_i16(field_id);
        }
        Ok(())
    }

    fn write_field_end(&mut self, _buffer: &mut ByteQueue) {}

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
                format!("illegal binary protocol map size {size}"),
            ));
        }
        buffer.put_i8(key_type as i8);
        buffer.put_i8(value_type as i8);
        buffer.put_i32(size as i32);
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
                format!("illegal binary protocol list/set size {size}"),
            ));
        }
        buffer.put_i8(elem_type as i8);
        buffer.put_i32(size as i32);
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
        buffer.put_i8(value.into());
    }

    fn write_byte(&mut self, buffer: &mut ByteQueue, value: u8) {
        buffer.put_u8(value);
    }

    fn write_i16(&mut self, buffer: &mut ByteQueue, value: i16) {
        buffer.put_i16(value);
    }

    fn write_i32(&mut self, buffer: &mut ByteQueue, value: i32) {
        buffer.put_i32(value);
    }

    fn write_i64(&mut self, buffer: &mut ByteQueue, value: i64) {
        buffer.put_i64(value);
    }

    fn write_double(&mut self, buffer: &mut ByteQueue, value: f64) {
        buffer.put_f64(value);
    }

    fn write_string(&mut self, buffer: &mut ByteQueue, value: &str) {
        write_string_chunk(buffer, value.as_bytes());
    }

    fn write_binary(&mut self, buffer: &mut ByteQueue, value: &[u8]) {
        write_string_chunk(buffer, value);
    }
}

/// The non-strict (lax) binary protocol: the same data encoding as
/// [`BinaryProtocol`] but with an unversioned message header.
#[derive(Debug, Default)]
pub struct LaxBinaryProtocol(BinaryProtocol);

impl Protocol for LaxBinaryProtocol {
    fn name(&self) -> &str {
        "binary/non-strict"
    }

    fn read_message_begin(&mut self, buffer: &mut ByteQueue) -> Result<MessageHeader> {
        // Minimum message length:
        //   name len: 4 bytes +
        //   name: 0 bytes +
        //   msg type: 1 byte +
        //   seq id: 4 bytes
        if buffer.len() < 9 {
            return Err(Error::NeedMoreData);
        }

        let name_len = buffer.peek_u32(0).ok_or(Error::NeedMoreData)? as usize;
        if buffer.len() < 9 + name_len {
            return Err(Error::NeedMoreData);
        }

        let message_type = read_message_type(
            buffer,
            buffer.peek_i8(name_len + 4).ok_or(Error::NeedMoreData)?,
            true,
        )?;

        buffer.drain(4);
        let name = String::from_utf8_lossy(&buffer.split_to(name_len)).into_owned();
        let sequence_id = buffer.peek_i32(1).ok_or(Error::NeedMoreData)?;
        buffer.drain(5);

        Ok(MessageHeader {
            name,
            message_type,
            sequence_id,
        })
    }

    fn read_message_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.0.read_message_end(buffer)
    }

    fn read_struct_begin(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.0.read_struct_begin(buffer)
    }

    fn read_struct_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.0.read_struct_end(buffer)
    }

    fn read_field_begin(&mut self, buffer: &mut ByteQueue) -> Result<FieldHeader> {
        self.0.read_field_begin(buffer)
    }

    fn read_field_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.0.read_field_end(buffer)
    }

    fn read_map_begin(&mut self, buffer: &mut ByteQueue) -> Result<MapHeader> {
        self.0.read_map_begin(buffer)
    }

    fn read_map_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.0.read_map_end(buffer)
    }

    fn read_list_begin(&mut self, buffer: &mut ByteQueue) -> Result<ListHeader> {
        self.0.read_list_begin(buffer)
    }

    fn read_list_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.0.read_list_end(buffer)
    }

    fn read_set_begin(&mut self, buffer: &mut ByteQueue) -> Result<ListHeader> {
        self.0.read_set_begin(buffer)
    }

    fn read_set_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.0.read_set_end(buffer)
    }

    fn read_bool(&mut self, buffer: &mut ByteQueue) -> Result<bool> {
        self.0.read_bool(buffer)
    }

    fn read_byte(&mut self, buffer: &mut ByteQueue) -> Result<u8> {
        self.0.read_byte(buffer)
    }

    fn read_i16(&mut self, buffer: &mut ByteQueue) -> Result<i16> {
        self.0.read_i16(buffer)
    }

    fn read_i32(&mut self, buffer: &mut ByteQueue) -> Result<i32> {
        self.0.read_i32(buffer)
    }

    fn read_i64(&mut self, buffer: &mut ByteQueue) -> Result<i64> {
        self.0.read_i64(buffer)
    }

    fn read_double(&mut self, buffer: &mut ByteQueue) -> Result<f64> {
        self.0.read_double(buffer)
    }

    fn read_string(&mut self, buffer: &mut ByteQueue) -> Result<String> {
        self.0.read_string(buffer)
    }

    fn read_binary(&mut self, buffer: &mut ByteQueue) -> Result<Bytes> {
        self.0.read_binary(buffer)
    }

    fn write_message_begin(&mut self, buffer: &mut ByteQueue, header: &MessageHeader) {
        self.write_string(buffer, &header.name);
        buffer.put_i8(header.message_type as i8);
        buffer.put_i32(header.sequence_id);
    }

    fn write_message_end(&mut self, buffer: &mut ByteQueue) {
        self.0.write_message_end(buffer)
    }

    fn write_struct_begin(&mut self, buffer: &mut ByteQueue, name: &str) {
        self.0.write_struct_begin(buffer, name)
    }

    fn write_struct_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.0.write_struct_end(buffer)
    }

    fn write_field_begin(
        &mut self,
        buffer: &mut ByteQueue,
        field_type: FieldType,
        field_id: i16,
    ) -> Result<()> {
        self.0.write_field_begin(buffer, field_type, field_id)
    }

    fn write_field_end(&mut self, buffer: &mut ByteQueue) {
        self.0.write_field_end(buffer)
    }

    fn write_map_begin(
        &mut self,
        buffer: &mut ByteQueue,
        key_type: FieldType,
        value_type: FieldType,
        size: u32,
    ) -> Result<()> {
        self.0.write_map_begin(buffer, key_type, value_type, size)
    }

    fn write_map_end(&mut self, buffer: &mut ByteQueue) {
        self.0.write_map_end(buffer)
    }

    fn write_list_begin(
        &mut self,
        buffer: &mut ByteQueue,
        elem_type: FieldType,
        size: u32,
    ) -> Result<()> {
        self.0.write_list_begin(buffer, elem_type, size)
    }

    fn write_list_end(&mut self, buffer: &mut ByteQueue) {
        self.0.write_list_end(buffer)
    }

    fn write_set_begin(
        &mut self,
        buffer: &mut ByteQueue,
        elem_type: FieldType,
        size: u32,
    ) -> Result<()> {
        self.0.write_set_begin(buffer, elem_type, size)
    }

    fn write_set_end(&mut self, buffer: &mut ByteQueue) {
        self.0.write_set_end(buffer)
    }

    fn write_bool(&mut self, buffer: &mut ByteQueue, value: bool) {
        self.0.write_bool(buffer, value)
    }

    fn write_byte(&mut self, buffer: &mut ByteQueue, value: u8) {
        self.0.write_byte(buffer, value)
    }

    fn write_i16(&mut self, buffer: &mut ByteQueue, value: i16) {
        self.0.write_i16(buffer, value)
    }

    fn write_i32(&mut self, buffer: &mut ByteQueue, value: i32) {
        self.0.write_i32(buffer, value)
    }

    fn write_i64(&mut self, buffer: &mut ByteQueue, value: i64) {
        self.0.write_i64(buffer, value)
    }

    fn write_double(&mut self, buffer: &mut ByteQueue, value: f64) {
        self.0.write_double(buffer, value)
    }

    fn write_string(&mut self, buffer: &mut ByteQueue, value: &str) {
        self.0.write_string(buffer, value)
    }

    fn write_binary(&mut self, buffer: &mut ByteQueue, value: &[u8]) {
        self.0.write_binary(buffer, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_message_decode() {
        let mut buffer = ByteQueue::from(
            &[
                0x80, 0x01, 0x00, 0x01, // version + unused + type (Call)
                0x00, 0x00, 0x00, 0x08, // name length
                b't', b'h', b'e', b'_', b'n', b'a', b'm', b'e', // name
                0x00, 0x00, 0x16, 0x2E, // sequence id 5678
            ][..],
        );

        let header = BinaryProtocol::default()
            .read_message_begin(&mut buffer)
            .unwrap();
        assert_eq!(
            header,
            MessageHeader {
                name: "the_name".into(),
                message_type: MessageType::Call,
                sequence_id: 5678,
            }
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn strict_message_round_trip() {
        let mut protocol = BinaryProtocol::default();
        let mut buffer = ByteQueue::new();
        let header = MessageHeader {
            name: "ping".into(),
            message_type: MessageType::Oneway,
            sequence_id: -42,
        };
        protocol.write_message_begin(&mut buffer, &header);
        assert_eq!(protocol.read_message_begin(&mut buffer).unwrap(), header);
        assert!(buffer.is_empty());
    }

    #[test]
    fn strict_message_incomplete_leaves_buffer() {
        let bytes = [
            0x80, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x08, b't', b'h', b'e',
        ];
        let mut buffer = ByteQueue::from(&bytes[..]);
        assert_eq!(
            BinaryProtocol::default()
                .read_message_begin(&mut buffer)
                .unwrap_err(),
            Error::NeedMoreData
        );
        assert_eq!(buffer.len(), bytes.len());
    }

    #[test]
    fn strict_message_bad_version() {
        let mut buffer =
            ByteQueue::from(&[0x01, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        let err = BinaryProtocol::default()
            .read_message_begin(&mut buffer)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid binary protocol version 0x0102 != 0x8001"
        );
        assert_eq!(buffer.len(), 12);
    }

    #[test]
    fn strict_message_bad_type() {
        let mut buffer =
            ByteQueue::from(&[0x80, 0x01, 0x00, 0x09, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        let err = BinaryProtocol::default()
            .read_message_begin(&mut buffer)
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid binary protocol message type 9");
    }

    #[test]
    fn lax_message_round_trip() {
        let mut protocol = LaxBinaryProtocol::default();
        let mut buffer = ByteQueue::new();
        let header = MessageHeader {
            name: "the_name".into(),
            message_type: MessageType::Reply,
            sequence_id: 5678,
        };
        protocol.write_message_begin(&mut buffer, &header);
        assert_eq!(protocol.read_message_begin(&mut buffer).unwrap(), header);
        assert!(buffer.is_empty());
    }

    #[test]
    fn lax_message_bad_type_keeps_buffer() {
        let bytes = [0x00, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00];
        let mut buffer = ByteQueue::from(&bytes[..]);
        let err = LaxBinaryProtocol::default()
            .read_message_begin(&mut buffer)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid (lax) binary protocol message type 5"
        );
        assert_eq!(buffer.len(), bytes.len());
    }

    #[test]
    fn field_header_round_trip() {
        let mut protocol = BinaryProtocol::default();
        let mut buffer = ByteQueue::new();
        protocol
            .write_field_begin(&mut buffer, FieldType::I32, 7)
            .unwrap();
        protocol
            .write_field_begin(&mut buffer, FieldType::Stop, 0)
            .unwrap();

        assert_eq!(
            protocol.read_field_begin(&mut buffer).unwrap(),
            FieldHeader {
                field_type: FieldType::I32,
                field_id: 7
            }
        );
        assert_eq!(
            protocol.read_field_begin(&mut buffer).unwrap(),
            FieldHeader {
                field_type: FieldType::Stop,
                field_id: 0
            }
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn negative_field_id_rejected() {
        let mut buffer = ByteQueue::new();
        buffer.put_i8(FieldType::Bool as i8);
        buffer.put_i16(-1);
        let err = BinaryProtocol::default()
            .read_field_begin(&mut buffer)
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid binary protocol field id -1");
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn map_list_set_round_trip() {
        let mut protocol = BinaryProtocol::default();
        let mut buffer = ByteQueue::new();
        protocol
            .write_map_begin(&mut buffer, FieldType::String, FieldType::I64, 3)
            .unwrap();
        protocol
            .write_list_begin(&mut buffer, FieldType::Bool, 0)
            .unwrap();
        protocol
            .write_set_begin(&mut buffer, FieldType::Double, 9)
            .unwrap();

        assert_eq!(
            protocol.read_map_begin(&mut buffer).unwrap(),
            MapHeader {
                key_type: FieldType::String,
                value_type: FieldType::I64,
                size: 3
            }
        );
        assert_eq!(
            protocol.read_list_begin(&mut buffer).unwrap(),
            ListHeader {
                elem_type: FieldType::Bool,
                size: 0
            }
        );
        assert_eq!(
            protocol.read_set_begin(&mut buffer).unwrap(),
            ListHeader {
                elem_type: FieldType::Double,
                size: 9
            }
        );
    }

    #[test]
    fn negative_sizes_rejected() {
        let mut buffer = ByteQueue::new();
        buffer.put_i8(FieldType::String as i8);
        buffer.put_i8(FieldType::I64 as i8);
        buffer.put_i32(-3);
        assert_eq!(
            BinaryProtocol::default()
                .read_map_begin(&mut buffer)
                .unwrap_err()
                .to_string(),
            "negative binary protocol map size -3"
        );

        let mut buffer = ByteQueue::new();
        buffer.put_i8(FieldType::Bool as i8);
        buffer.put_i32(-1);
        assert_eq!(
            BinaryProtocol::default()
                .read_list_begin(&mut buffer)
                .unwrap_err()
                .to_string(),
            "negative binary protocol list/set size -1"
        );

        let mut buffer = ByteQueue::new();
        buffer.put_i32(-9);
        assert_eq!(
            BinaryProtocol::default()
                .read_string(&mut buffer)
                .unwrap_err()
                .to_string(),
            "negative binary protocol string/binary length -9"
        );
    }

    #[test]
    fn oversized_write_rejected() {
        let mut protocol = BinaryProtocol::default();
        let mut buffer = ByteQueue::new();
        let too_big = i32::MAX as u32 + 1;
        assert!(protocol
            .write_map_begin(&mut buffer, FieldType::I32, FieldType::I32, too_big)
            .is_err());
        assert!(protocol
            .write_list_begin(&mut buffer, FieldType::I32, too_big)
            .is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn value_round_trips() {
        let mut protocol = BinaryProtocol::default();
        let mut buffer = ByteQueue::new();

        protocol.write_bool(&mut buffer, true);
        protocol.write_byte(&mut buffer, 0xC4);
        protocol.write_i16(&mut buffer, -200);
        protocol.write_i32(&mut buffer, 1 << 30);
        protocol.write_i64(&mut buffer, -(1 << 40));
        protocol.write_double(&mut buffer, 2.75);
        protocol.write_string(&mut buffer, "hello");
        protocol.write_binary(&mut buffer, b"\x00\x01");

        assert!(protocol.read_bool(&mut buffer).unwrap());
        assert_eq!(protocol.read_byte(&mut buffer).unwrap(), 0xC4);
        assert_eq!(protocol.read_i16(&mut buffer).unwrap(), -200);
        assert_eq!(protocol.read_i32(&mut buffer).unwrap(), 1 << 30);
        assert_eq!(protocol.read_i64(&mut buffer).unwrap(), -(1 << 40));
        assert_eq!(protocol.read_double(&mut buffer).unwrap(), 2.75);
        assert_eq!(protocol.read_string(&mut buffer).unwrap(), "hello");
        assert_eq!(
            protocol.read_binary(&mut buffer).unwrap(),
            Bytes::from_static(b"\x00\x01")
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn empty_string_allowed() {
        let mut protocol = BinaryProtocol::default();
        let mut buffer = ByteQueue::new();
        protocol.write_string(&mut buffer, "");
        assert_eq!(protocol.read_string(&mut buffer).unwrap(), "");
        assert!(buffer.is_empty());
    }

    #[test]
    fn string_prefix_not_consumed() {
        let mut protocol = BinaryProtocol::default();
        let mut full = ByteQueue::new();
        protocol.write_string(&mut full, "hello");
        let encoded = full.take_all();

        for cut in 1..encoded.len() {
            let mut partial = ByteQueue::from(encoded.slice(..cut));
            assert_eq!(
                protocol.read_string(&mut partial).unwrap_err(),
                Error::NeedMoreData
            );
            assert_eq!(partial.len(), cut);
        }
    }
}
