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

//! A resumable streaming decoder over any [`Protocol`].
//!
//! The decoder walks one message's structure and reports it through
//! synchronous callbacks. Because every protocol read either consumes a
//! whole element or nothing, the decoder can stop at any element boundary
//! when bytes run out and resume from exactly that point on the next call.

use super::{Error, FieldType, MessageHeader, Protocol, Result};
use crate::buffer::ByteQueue;

/// Structural events emitted while decoding. Callbacks are synchronous;
/// callers may not suspend inside them.
pub trait DecoderCallbacks {
    fn message_start(&mut self, header: &MessageHeader);
    fn struct_begin(&mut self, name: &str);
    fn struct_field(&mut self, name: &str, field_type: FieldType, field_id: i16);
    fn struct_end(&mut self);
    fn message_complete(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The buffer ran out mid-message; call again with more bytes.
    NeedMoreData,
    /// One complete message was decoded.
    Complete,
}

/// What to do after the value currently being read completes.
#[derive(Clone, Copy, Debug)]
enum Resume {
    /// The value was a struct field: read the field footer next.
    FieldEnd,
    /// The value was a container element: continue the container.
    Element,
    /// The value was the message's root struct: read the message footer.
    MessageEnd,
}

#[derive(Debug)]
enum Frame {
    Struct {
        resume: Resume,
    },
    List {
        remaining: u32,
        elem_type: FieldType,
        resume: Resume,
    },
    Set {
        remaining: u32,
        elem_type: FieldType,
        resume: Resume,
    },
    Map {
        remaining: u32,
        key_type: FieldType,
        value_type: FieldType,
        expecting_key: bool,
        resume: Resume,
    },
}

#[derive(Clone, Copy, Debug)]
enum State {
    MessageBegin,
    StructBegin(Resume),
    FieldBegin,
    FieldValue(FieldType),
    FieldEnd,
    StructEnd,
    MapBegin(Resume),
    ListBegin(Resume),
    SetBegin(Resume),
    Element,
    MessageEnd,
    Done,
}

impl From<Resume> for State {
    fn from(resume: Resume) -> Self {
        match resume {
            Resume::FieldEnd => State::FieldEnd,
            Resume::Element => State::Element,
            Resume::MessageEnd => State::MessageEnd,
        }
    }
}

pub struct Decoder {
    protocol: Box<dyn Protocol>,
    state: State,
    frames: Vec<Frame>,
}

impl Decoder {
    pub fn new(protocol: Box<dyn Protocol>) -> Self {
        Self {
            protocol,
            state: State::MessageBegin,
            frames: Vec::new(),
        }
    }

    pub fn protocol(&self) -> &dyn Protocol {
        self.protocol.as_ref()
    }

    /// Whether a full message has been decoded since the last reset.
    pub fn complete(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Prepares the decoder for the next message.
    pub fn reset(&mut self) {
        self.state = State::MessageBegin;
        self.frames.clear();
    }

    /// Consumes as much structure from `buffer` as possible, firing
    /// callbacks along the way. Returns [`DecodeStatus::Complete`] once the
    /// message footer has been read; the buffer keeps any bytes beyond it.
    pub fn decode(
        &mut self,
        buffer: &mut ByteQueue,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> Result<DecodeStatus> {
        loop {
            match self.step(buffer, callbacks) {
                Ok(DecodeStatus::Complete) => return Ok(DecodeStatus::Complete),
                Ok(DecodeStatus::NeedMoreData) => continue,
                Err(Error::NeedMoreData) => return Ok(DecodeStatus::NeedMoreData),
                Err(err) => return Err(err),
            }
        }
    }

    fn step(
        &mut self,
        buffer: &mut ByteQueue,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> Result<DecodeStatus> {
        match self.state {
            State::MessageBegin => {
                let header = self.protocol.read_message_begin(buffer)?;
                callbacks.message_start(&header);
                self.state = State::StructBegin(Resume::MessageEnd);
            }
            State::StructBegin(resume) => {
                self.protocol.read_struct_begin(buffer)?;
                callbacks.struct_begin("");
                self.frames.push(Frame::Struct { resume });
                self.state = State::FieldBegin;
            }
            State::FieldBegin => {
                let field = self.protocol.read_field_begin(buffer)?;
                if field.field_type == FieldType::Stop {
                    self.state = State::StructEnd;
                } else {
                    callbacks.struct_field("", field.field_type, field.field_id);
                    self.state = State::FieldValue(field.field_type);
                }
            }
            State::FieldValue(field_type) => {
                self.state = self.begin_value(buffer, field_type, Resume::FieldEnd)?;
            }
            State::FieldEnd => {
                self.protocol.read_field_end(buffer)?;
                self.state = State::FieldBegin;
            }
            State::StructEnd => {
                self.protocol.read_struct_end(buffer)?;
                callbacks.struct_end();
                let frame = self.frames.pop().expect("struct end without frame");
                let Frame::Struct { resume } = frame else {
                    unreachable!("struct end popped a container frame");
                };
                self.state = resume.into();
            }
            State::MapBegin(resume) => {
                let header = self.protocol.read_map_begin(buffer)?;
                self.frames.push(Frame::Map {
                    remaining: header.size,
                    key_type: header.key_type,
                    value_type: header.value_type,
                    expecting_key: true,
                    resume,
                });
                self.state = State::Element;
            }
            State::ListBegin(resume) => {
                let header = self.protocol.read_list_begin(buffer)?;
                self.frames.push(Frame::List {
                    remaining: header.size,
                    elem_type: header.elem_type,
                    resume,
                });
                self.state = State::Element;
            }
            State::SetBegin(resume) => {
                let header = self.protocol.read_set_begin(buffer)?;
                self.frames.push(Frame::Set {
                    remaining: header.size,
                    elem_type: header.elem_type,
                    resume,
                });
                self.state = State::Element;
            }
            State::Element => {
                self.state = self.continue_container(buffer)?;
            }
            State::MessageEnd => {
                self.protocol.read_message_end(buffer)?;
                callbacks.message_complete();
                self.state = State::Done;
            }
            State::Done => return Ok(DecodeStatus::Complete),
        }
        Ok(DecodeStatus::NeedMoreData)
    }

    /// Dispatches on a value type: primitives are read and discarded,
    /// containers and structs become a frame with `resume` recorded for
    /// when they finish.
    fn begin_value(
        &mut self,
        buffer: &mut ByteQueue,
        field_type: FieldType,
        resume: Resume,
    ) -> Result<State> {
        Ok(match field_type {
            FieldType::Struct => State::StructBegin(resume),
            FieldType::Map => State::MapBegin(resume),
            FieldType::List => State::ListBegin(resume),
            FieldType::Set => State::SetBegin(resume),
            _ => {
                self.read_primitive(buffer, field_type)?;
                resume.into()
            }
        })
    }

    fn read_primitive(&mut self, buffer: &mut ByteQueue, field_type: FieldType) -> Result<()> {
        match field_type {
            FieldType::Void => {}
            FieldType::Bool => {
                self.protocol.read_bool(buffer)?;
            }
            FieldType::Byte => {
                self.protocol.read_byte(buffer)?;
            }
            FieldType::Double => {
                self.protocol.read_double(buffer)?;
            }
            FieldType::I16 => {
                self.protocol.read_i16(buffer)?;
            }
            FieldType::I32 => {
                self.protocol.read_i32(buffer)?;
            }
            FieldType::I64 => {
                self.protocol.read_i64(buffer)?;
            }
            FieldType::String => {
                self.protocol.read_binary(buffer)?;
            }
            FieldType::Stop | FieldType::Struct | FieldType::Map | FieldType::List
            | FieldType::Set => {
                return Err(Error::malformed(
                    buffer,
                    format!("unexpected field type {}", field_type as i8),
                ));
            }
        }
        Ok(())
    }

    /// Advances the container on top of the frame stack by one element,
    /// or closes it when all elements have been read.
    fn continue_container(&mut self, buffer: &mut ByteQueue) -> Result<State> {
        let frame = self.frames.last_mut().expect("element without container");
        match frame {
            Frame::Struct { .. } => unreachable!("struct frames drive fields, not elements"),
            Frame::List {
                remaining,
                elem_type,
                resume,
            } => {
                if *remaining == 0 {
                    let resume = *resume;
                    self.protocol.read_list_end(buffer)?;
                    self.frames.pop();
                    return Ok(resume.into());
                }
                let elem_type = *elem_type;
                if is_container(elem_type) {
                    *remaining -= 1;
                    return self.begin_value(buffer, elem_type, Resume::Element);
                }
                self.read_primitive(buffer, elem_type)?;
                let Some(Frame::List { remaining, .. }) = self.frames.last_mut() else {
                    unreachable!();
                };
                *remaining -= 1;
                Ok(State::Element)
            }
            Frame::Set {
                remaining,
                elem_type,
                resume,
            } => {
                if *remaining == 0 {
                    let resume = *resume;
                    self.protocol.read_set_end(buffer)?;
                    self.frames.pop();
                    return Ok(resume.into());
                }
                let elem_type = *elem_type;
                if is_container(elem_type) {
                    *remaining -= 1;
                    return self.begin_value(buffer, elem_type, Resume::Element);
                }
                self.read_primitive(buffer, elem_type)?;
                let Some(Frame::Set { remaining, .. }) = self.frames.last_mut() else {
                    unreachable!();
                };
                *remaining -= 1;
                Ok(State::Element)
            }
            Frame::Map {
                remaining,
                key_type,
                value_type,
                expecting_key,
                resume,
            } => {
                if *remaining == 0 {
                    let resume = *resume;
                    self.protocol.read_map_end(buffer)?;
                    self.frames.pop();
                    return Ok(resume.into());
                }

                let elem_type = if *expecting_key { *key_type } else { *value_type };
                if is_container(elem_type) {
                    if *expecting_key {
                        *expecting_key = false;
                    } else {
                        *expecting_key = true;
                        *remaining -= 1;
                    }
                    return self.begin_value(buffer, elem_type, Resume::Element);
                }

                self.read_primitive(buffer, elem_type)?;
                let Some(Frame::Map {
                    remaining,
                    expecting_key,
                    ..
                }) = self.frames.last_mut()
                else {
                    unreachable!();
                };
                if *expecting_key {
                    *expecting_key = false;
                } else {
                    *expecting_key = true;
                    *remaining -= 1;
                }
                Ok(State::Element)
            }
        }
    }
}

fn is_container(field_type: FieldType) -> bool {
    matches!(
        field_type,
        FieldType::Struct | FieldType::Map | FieldType::List | FieldType::Set
    )
}

#[cfg(test)]
mod tests {
    use super::super::{
        AutoProtocol, BinaryProtocol, CompactProtocol, MessageType, Protocol as _,
    };
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Event {
        MessageStart(String, MessageType, i32),
        StructBegin,
        StructField(FieldType, i16),
        StructEnd,
        MessageComplete,
    }

    #[derive(Default)]
    struct Recorder(Vec<Event>);

    impl DecoderCallbacks for Recorder {
        fn message_start(&mut self, header: &MessageHeader) {
            self.0.push(Event::MessageStart(
                header.name.clone(),
                header.message_type,
                header.sequence_id,
            ));
        }

        fn struct_begin(&mut self, _name: &str) {
            self.0.push(Event::StructBegin);
        }

        fn struct_field(&mut self, _name: &str, field_type: FieldType, field_id: i16) {
            self.0.push(Event::StructField(field_type, field_id));
        }

        fn struct_end(&mut self) {
            self.0.push(Event::StructEnd);
        }

        fn message_complete(&mut self) {
            self.0.push(Event::MessageComplete);
        }
    }

    /// Encodes:
    ///   Call "the_name" seq 99 {
    ///     1: i32
    ///     2: list<string>[2]
    ///     3: map<i32, struct { 1: bool }>[1]
    ///     4: struct { 1: i64 }
    ///   }
    fn encode_message(protocol: &mut dyn super::super::Protocol) -> ByteQueue {
        let mut buffer = ByteQueue::new();
        protocol.write_message_begin(
            &mut buffer,
            &MessageHeader {
                name: "the_name".into(),
                message_type: MessageType::Call,
                sequence_id: 99,
            },
        );
        protocol.write_struct_begin(&mut buffer, "");

        protocol
            .write_field_begin(&mut buffer, FieldType::I32, 1)
            .unwrap();
        protocol.write_i32(&mut buffer, 42);
        protocol.write_field_end(&mut buffer);

        protocol
            .write_field_begin(&mut buffer, FieldType::List, 2)
            .unwrap();
        protocol
            .write_list_begin(&mut buffer, FieldType::String, 2)
            .unwrap();
        protocol.write_string(&mut buffer, "alpha");
        protocol.write_string(&mut buffer, "beta");
        protocol.write_list_end(&mut buffer);
        protocol.write_field_end(&mut buffer);

        protocol
            .write_field_begin(&mut buffer, FieldType::Map, 3)
            .unwrap();
        protocol
            .write_map_begin(&mut buffer, FieldType::I32, FieldType::Struct, 1)
            .unwrap();
        protocol.write_i32(&mut buffer, 7);
        protocol.write_struct_begin(&mut buffer, "");
        protocol
            .write_field_begin(&mut buffer, FieldType::Bool, 1)
            .unwrap();
        protocol.write_bool(&mut buffer, true);
        protocol.write_field_end(&mut buffer);
        protocol
            .write_field_begin(&mut buffer, FieldType::Stop, 0)
            .unwrap();
        protocol.write_struct_end(&mut buffer).unwrap();
        protocol.write_map_end(&mut buffer);
        protocol.write_field_end(&mut buffer);

        protocol
            .write_field_begin(&mut buffer, FieldType::Struct, 4)
            .unwrap();
        protocol.write_struct_begin(&mut buffer, "");
        protocol
            .write_field_begin(&mut buffer, FieldType::I64, 1)
            .unwrap();
        protocol.write_i64(&mut buffer, -1);
        protocol.write_field_end(&mut buffer);
        protocol
            .write_field_begin(&mut buffer, FieldType::Stop, 0)
            .unwrap();
        protocol.write_struct_end(&mut buffer).unwrap();
        protocol.write_field_end(&mut buffer);

        protocol
            .write_field_begin(&mut buffer, FieldType::Stop, 0)
            .unwrap();
        protocol.write_struct_end(&mut buffer).unwrap();
        protocol.write_message_end(&mut buffer);
        buffer
    }

    fn expected_events() -> Vec<Event> {
        vec![
            Event::MessageStart("the_name".into(), MessageType::Call, 99),
            Event::StructBegin,
            Event::StructField(FieldType::I32, 1),
            Event::StructField(FieldType::List, 2),
            Event::StructField(FieldType::Map, 3),
            Event::StructBegin,
            Event::StructField(FieldType::Bool, 1),
            Event::StructEnd,
            Event::StructField(FieldType::Struct, 4),
            Event::StructBegin,
            Event::StructField(FieldType::I64, 1),
            Event::StructEnd,
            Event::StructEnd,
            Event::MessageComplete,
        ]
    }

    #[test]
    fn binary_message_structure() {
        let mut writer = BinaryProtocol::default();
        let mut buffer = encode_message(&mut writer);

        let mut decoder = Decoder::new(Box::new(BinaryProtocol::default()));
        let mut recorder = Recorder::default();
        assert_eq!(
            decoder.decode(&mut buffer, &mut recorder).unwrap(),
            DecodeStatus::Complete
        );
        assert!(buffer.is_empty());
        assert_eq!(recorder.0, expected_events());
    }

    #[test]
    fn compact_message_structure() {
        let mut writer = CompactProtocol::default();
        let mut buffer = encode_message(&mut writer);

        let mut decoder = Decoder::new(Box::new(CompactProtocol::default()));
        let mut recorder = Recorder::default();
        assert_eq!(
            decoder.decode(&mut buffer, &mut recorder).unwrap(),
            DecodeStatus::Complete
        );
        assert!(buffer.is_empty());
        assert_eq!(recorder.0, expected_events());
    }

    #[test]
    fn resumes_across_arbitrary_splits() {
        let mut writer = BinaryProtocol::default();
        let encoded = encode_message(&mut writer).take_all();

        let mut decoder = Decoder::new(Box::new(AutoProtocol::default()));
        let mut recorder = Recorder::default();
        let mut buffer = ByteQueue::new();

        let mut completions = 0;
        for byte in encoded.iter() {
            buffer.push(bytes::Bytes::copy_from_slice(&[*byte]));
            match decoder.decode(&mut buffer, &mut recorder).unwrap() {
                DecodeStatus::Complete => completions += 1,
                DecodeStatus::NeedMoreData => {}
            }
        }

        assert_eq!(completions, 1);
        assert!(buffer.is_empty());
        assert_eq!(recorder.0, expected_events());
    }

    #[test]
    fn trailing_bytes_are_left_in_buffer() {
        let mut writer = BinaryProtocol::default();
        let mut buffer = encode_message(&mut writer);
        buffer.push(bytes::Bytes::from_static(b"extra"));

        let mut decoder = Decoder::new(Box::new(BinaryProtocol::default()));
        let mut recorder = Recorder::default();
        assert_eq!(
            decoder.decode(&mut buffer, &mut recorder).unwrap(),
            DecodeStatus::Complete
        );
        assert_eq!(buffer.len(), 5);
        assert!(decoder.complete());
    }

    #[test]
    fn reset_allows_back_to_back_messages() {
        let mut writer = BinaryProtocol::default();
        let mut buffer = encode_message(&mut writer);
        let mut second_writer = BinaryProtocol::default();
        let second = encode_message(&mut second_writer).take_all();
        buffer.push(second);

        let mut decoder = Decoder::new(Box::new(BinaryProtocol::default()));
        let mut recorder = Recorder::default();
        assert_eq!(
            decoder.decode(&mut buffer, &mut recorder).unwrap(),
            DecodeStatus::Complete
        );
        decoder.reset();
        assert_eq!(
            decoder.decode(&mut buffer, &mut recorder).unwrap(),
            DecodeStatus::Complete
        );
        assert!(buffer.is_empty());

        let expected: Vec<Event> = expected_events()
            .into_iter()
            .chain(expected_events())
            .collect();
        assert_eq!(recorder.0, expected);
    }

    #[test]
    fn malformed_input_is_fatal() {
        // A struct field whose declared type cannot appear as a value.
        let mut buffer = ByteQueue::new();
        let mut writer = BinaryProtocol::default();
        writer.write_message_begin(
            &mut buffer,
            &MessageHeader {
                name: "bad".into(),
                message_type: MessageType::Call,
                sequence_id: 1,
            },
        );
        // List of element type Stop with one claimed element.
        buffer.put_i8(FieldType::List as i8);
        buffer.put_i16(1);
        buffer.put_i8(FieldType::Stop as i8);
        buffer.put_i32(1);

        let mut decoder = Decoder::new(Box::new(BinaryProtocol::default()));
        let mut recorder = Recorder::default();
        let err = decoder.decode(&mut buffer, &mut recorder).unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }
}
