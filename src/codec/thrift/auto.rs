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

use super::binary::{BinaryProtocol, LaxBinaryProtocol};
use super::compact::CompactProtocol;
use super::{
    Error, FieldHeader, FieldType, ListHeader, MapHeader, MessageHeader, Protocol, Result,
};
use crate::buffer::ByteQueue;

/// Detects the concrete protocol from the first two bytes of the first
/// message and delegates to it from then on.
///
/// The strict-binary magic selects strict binary, the compact protocol id
/// selects compact, and anything else is taken to be the unversioned lax
/// binary framing.
pub struct AutoProtocol {
    protocol: Option<Box<dyn Protocol>>,
    name: String,
}

impl Default for AutoProtocol {
    fn default() -> Self {
        Self {
            protocol: None,
            name: "auto".into(),
        }
    }
}

impl AutoProtocol {
    fn detect(&mut self, buffer: &ByteQueue) -> Result<()> {
        if self.protocol.is_some() {
            return Ok(());
        }

        let version = buffer.peek_u16(0).ok_or(Error::NeedMoreData)?;
        let protocol: Box<dyn Protocol> = if BinaryProtocol::is_magic(version) {
            Box::new(BinaryProtocol::default())
        } else if CompactProtocol::is_magic(version) {
            Box::new(CompactProtocol::default())
        } else {
            Box::new(LaxBinaryProtocol::default())
        };
        self.name = format!("{}(auto)", protocol.name());
        self.protocol = Some(protocol);
        Ok(())
    }

    /// Reads delegate to the detected protocol; a message always starts
    /// with `read_message_begin`, so detection has happened by the time
    /// any other operation runs.
    fn active(&mut self) -> &mut dyn Protocol {
        self.protocol
            .as_deref_mut()
            .expect("auto protocol used before a message begin resolved it")
    }
}

impl Protocol for AutoProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_message_begin(&mut self, buffer: &mut ByteQueue) -> Result<MessageHeader> {
        self.detect(buffer)?;
        self.active().read_message_begin(buffer)
    }

    fn read_message_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.active().read_message_end(buffer)
    }

    fn read_struct_begin(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.active().read_struct_begin(buffer)
    }

    fn read_struct_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.active().read_struct_end(buffer)
    }

    fn read_field_begin(&mut self, buffer: &mut ByteQueue) -> Result<FieldHeader> {
        self.active().read_field_begin(buffer)
    }

    fn read_field_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.active().read_field_end(buffer)
    }

    fn read_map_begin(&mut self, buffer: &mut ByteQueue) -> Result<MapHeader> {
        self.active().read_map_begin(buffer)
    }

    fn read_map_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.active().read_map_end(buffer)
    }

    fn read_list_begin(&mut self, buffer: &mut ByteQueue) -> Result<ListHeader> {
        self.active().read_list_begin(buffer)
    }

    fn read_list_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.active().read_list_end(buffer)
    }

    fn read_set_begin(&mut self, buffer: &mut ByteQueue) -> Result<ListHeader> {
        self.active().read_set_begin(buffer)
    }

    fn read_set_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.active().read_set_end(buffer)
    }

    fn read_bool(&mut self, buffer: &mut ByteQueue) -> Result<bool> {
        self.active().read_bool(buffer)
    }

    fn read_byte(&mut self, buffer: &mut ByteQueue) -> Result<u8> {
        self.active().read_byte(buffer)
    }

    fn read_i16(&mut self, buffer: &mut ByteQueue) -> Result<i16> {
        self.active().read_i16(buffer)
    }

    fn read_i32(&mut self, buffer: &mut ByteQueue) -> Result<i32> {
        self.active().read_i32(buffer)
    }

    fn read_i64(&mut self, buffer: &mut ByteQueue) -> Result<i64> {
        self.active().read_i64(buffer)
    }

    fn read_double(&mut self, buffer: &mut ByteQueue) -> Result<f64> {
        self.active().read_double(buffer)
    }

    fn read_string(&mut self, buffer: &mut ByteQueue) -> Result<String> {
        self.active().read_string(buffer)
    }

    fn read_binary(&mut self, buffer: &mut ByteQueue) -> Result<Bytes> {
        self.active().read_binary(buffer)
    }

    fn write_message_begin(&mut self, buffer: &mut ByteQueue, header: &MessageHeader) {
        self.active().write_message_begin(buffer, header)
    }

    fn write_message_end(&mut self, buffer: &mut ByteQueue) {
        self.active().write_message_end(buffer)
    }

    fn write_struct_begin(&mut self, buffer: &mut ByteQueue, name: &str) {
        self.active().write_struct_begin(buffer, name)
    }

    fn write_struct_end(&mut self, buffer: &mut ByteQueue) -> Result<()> {
        self.active().write_struct_end(buffer)
    }

    fn write_field_begin(
        &mut self,
        buffer: &mut ByteQueue,
        field_type: FieldType,
        field_id: i16,
    ) -> Result<()> {
        self.active().write_field_begin(buffer, field_type, field_id)
    }

    fn write_field_end(&mut self, buffer: &mut ByteQueue) {
        self.active().write_field_end(buffer)
    }

    fn write_map_begin(
        &mut self,
        buffer: &mut ByteQueue,
        key_type: FieldType,
        value_type: FieldType,
        size: u32,
    ) -> Result<()> {
        self.active().write_map_begin(buffer, key_type, value_type, size)
    }

    fn write_map_end(&mut self, buffer: &mut ByteQueue) {
        self.active().write_map_end(buffer)
    }

    fn write_list_begin(
        &mut self,
        buffer: &mut ByteQueue,
        elem_type: FieldType,
        size: u32,
    ) -> Result<()> {
        self.active().write_list_begin(buffer, elem_type, size)
    }

    fn write_list_end(&mut self, buffer: &mut ByteQueue) {
        self.active().write_list_end(buffer)
    }

    fn write_set_begin(
        &mut self,
        buffer: &mut ByteQueue,
        elem_type: FieldType,
        size: u32,
    ) -> Result<()> {
        self.active().write_set_begin(buffer, elem_type, size)
    }

    fn write_set_end(&mut self, buffer: &mut ByteQueue) {
        self.active().write_set_end(buffer)
    }

    fn write_bool(&mut self, buffer: &mut ByteQueue, value: bool) {
        self.active().write_bool(buffer, value)
    }

    fn write_byte(&mut self, buffer: &mut ByteQueue, value: u8) {
        self.active().write_byte(buffer, value)
    }

    fn write_i16(&mut self, buffer: &mut ByteQueue, value: i16) {
        self.active().write_i16(buffer, value)
    }

    fn write_i32(&mut self, buffer: &mut ByteQueue, value: i32) {
        self.active().write_i32(buffer, value)
    }

    fn write_i64(&mut self, buffer: &mut ByteQueue, value: i64) {
        self.active().write_i64(buffer, value)
    }

    fn write_double(&mut self, buffer: &mut ByteQueue, value: f64) {
        self.active().write_double(buffer, value)
    }

    fn write_string(&mut self, buffer: &mut ByteQueue, value: &str) {
        self.active().write_string(buffer, value)
    }

    fn write_binary(&mut self, buffer: &mut ByteQueue, value: &[u8]) {
        self.active().write_binary(buffer, value)
    }
}

#[cfg(test)]
mod tests {
    use super::super::MessageType;
    use super::*;

    fn header(name: &str) -> MessageHeader {
        MessageHeader {
            name: name.into(),
            message_type: MessageType::Call,
            sequence_id: 7,
        }
    }

    #[test]
    fn detects_strict_binary() {
        let mut buffer = ByteQueue::new();
        BinaryProtocol::default().write_message_begin(&mut buffer, &header("strict"));

        let mut auto = AutoProtocol::default();
        assert_eq!(auto.name(), "auto");
        assert_eq!(auto.read_message_begin(&mut buffer).unwrap(), header("strict"));
        assert_eq!(auto.name(), "binary(auto)");
    }

    #[test]
    fn detects_compact() {
        let mut buffer = ByteQueue::new();
        CompactProtocol::default().write_message_begin(&mut buffer, &header("compact"));

        let mut auto = AutoProtocol::default();
        assert_eq!(
            auto.read_message_begin(&mut buffer).unwrap(),
            header("compact")
        );
        assert_eq!(auto.name(), "compact(auto)");
    }

    #[test]
    fn falls_back_to_lax_binary() {
        let mut buffer = ByteQueue::new();
        LaxBinaryProtocol::default().write_message_begin(&mut buffer, &header("lax"));

        let mut auto = AutoProtocol::default();
        assert_eq!(auto.read_message_begin(&mut buffer).unwrap(), header("lax"));
        assert_eq!(auto.name(), "binary/non-strict(auto)");
    }

    #[test]
    fn single_byte_needs_more_data() {
        let mut buffer = ByteQueue::from(&[0x80][..]);
        let mut auto = AutoProtocol::default();
        assert_eq!(
            auto.read_message_begin(&mut buffer).unwrap_err(),
            Error::NeedMoreData
        );
        assert_eq!(auto.name(), "auto");
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn detection_latches_across_messages() {
        let mut buffer = ByteQueue::new();
        BinaryProtocol::default().write_message_begin(&mut buffer, &header("first"));

        let mut auto = AutoProtocol::default();
        auto.read_message_begin(&mut buffer).unwrap();

        let mut second = ByteQueue::new();
        BinaryProtocol::default().write_message_begin(&mut second, &header("second"));
        assert_eq!(
            auto.read_message_begin(&mut second).unwrap(),
            header("second")
        );
        assert_eq!(auto.name(), "binary(auto)");
    }
}
