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

//! A segmented byte queue shared by the wire codecs and the proxy data path.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

/// An ordered queue of byte chunks with O(1) prepend and drain.
///
/// Peek operations address the queue by logical offset without consuming
/// anything, which is what lets codec reads back out with "need more data"
/// while leaving the buffer untouched. Write helpers append big-endian
/// encoded integers to a staging chunk so that a burst of small writes does
/// not fragment the queue.
#[derive(Debug, Default)]
pub struct ByteQueue {
    chunks: VecDeque<Bytes>,
    staging: BytesMut,
    len: usize,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a chunk to the back of the queue without copying.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.flush_staging();
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Puts a chunk back at the front of the queue without copying.
    pub fn prepend(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_front(chunk);
    }

    /// Removes the first `n` bytes from the queue.
    ///
    /// Draining past the end is a programming error: reads are expected to
    /// verify availability with peeks first.
    pub fn drain(&mut self, n: usize) {
        debug_assert!(n <= self.len, "drain({n}) exceeds queue length {}", self.len);
        let mut remaining = n.min(self.len);
        self.len -= remaining;
        while remaining > 0 {
            if let Some(front) = self.chunks.front_mut() {
                if front.len() > remaining {
                    front.advance(remaining);
                    return;
                }
                remaining -= front.len();
                self.chunks.pop_front();
            } else {
                self.staging.advance(remaining);
                return;
            }
        }
    }

    /// Removes and returns the first `n` bytes as one contiguous chunk.
    pub fn split_to(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.len, "split_to({n}) exceeds queue length {}", self.len);
        let n = n.min(self.len);
        if n == 0 {
            return Bytes::new();
        }

        // Fast path: the front chunk already covers the request.
        if let Some(front) = self.chunks.front_mut() {
            if front.len() >= n {
                self.len -= n;
                let out = front.split_to(n);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                return out;
            }
        }

        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        self.len -= n;
        while remaining > 0 {
            if let Some(front) = self.chunks.front_mut() {
                let take = front.len().min(remaining);
                out.extend_from_slice(&front[..take]);
                front.advance(take);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                remaining -= take;
            } else {
                out.extend_from_slice(&self.staging[..remaining]);
                self.staging.advance(remaining);
                remaining = 0;
            }
        }
        out.freeze()
    }

    /// Drains the whole queue into a single chunk.
    pub fn take_all(&mut self) -> Bytes {
        let len = self.len;
        self.split_to(len)
    }

    /// Copies `dst.len()` bytes starting at `offset` without consuming them.
    /// Returns `None` when the queue does not hold enough bytes.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> Option<()> {
        if offset + dst.len() > self.len {
            return None;
        }
        let mut skip = offset;
        let mut copied = 0;
        for chunk in self
            .chunks
            .iter()
            .map(|c| &c[..])
            .chain((!self.staging.is_empty()).then_some(&self.staging[..]))
        {
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            let avail = &chunk[skip..];
            skip = 0;
            let take = avail.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&avail[..take]);
            copied += take;
            if copied == dst.len() {
                return Some(());
            }
        }
        debug_assert_eq!(copied, dst.len());
        Some(())
    }

    pub fn peek_u8(&self, offset: usize) -> Option<u8> {
        let mut b = [0u8; 1];
        self.copy_out(offset, &mut b)?;
        Some(b[0])
    }

    pub fn peek_i8(&self, offset: usize) -> Option<i8> {
        self.peek_u8(offset).map(|b| b as i8)
    }

    pub fn peek_u16(&self, offset: usize) -> Option<u16> {
        let mut b = [0u8; 2];
        self.copy_out(offset, &mut b)?;
        Some(u16::from_be_bytes(b))
    }

    pub fn peek_i16(&self, offset: usize) -> Option<i16> {
        self.peek_u16(offset).map(|v| v as i16)
    }

    pub fn peek_u32(&self, offset: usize) -> Option<u32> {
        let mut b = [0u8; 4];
        self.copy_out(offset, &mut b)?;
        Some(u32::from_be_bytes(b))
    }

    pub fn peek_i32(&self, offset: usize) -> Option<i32> {
        self.peek_u32(offset).map(|v| v as i32)
    }

    pub fn peek_u64(&self, offset: usize) -> Option<u64> {
        let mut b = [0u8; 8];
        self.copy_out(offset, &mut b)?;
        Some(u64::from_be_bytes(b))
    }

    pub fn peek_i64(&self, offset: usize) -> Option<i64> {
        self.peek_u64(offset).map(|v| v as i64)
    }

    pub fn peek_f64(&self, offset: usize) -> Option<f64> {
        self.peek_u64(offset).map(f64::from_bits)
    }

    pub fn put_slice(&mut self, src: &[u8]) {
        self.staging.extend_from_slice(src);
        self.len += src.len();
    }

    pub fn put_u8(&mut self, value: u8) {
        self.put_slice(&[value]);
    }

    pub fn put_i8(&mut self, value: i8) {
        self.put_u8(value as u8);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_i16(&mut self, value: i16) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_f64(&mut self, value: f64) {
        self.put_u64(value.to_bits());
    }

    fn flush_staging(&mut self) {
        if !self.staging.is_empty() {
            let chunk = self.staging.split().freeze();
            self.chunks.push_back(chunk);
        }
    }
}

impl From<&[u8]> for ByteQueue {
    fn from(src: &[u8]) -> Self {
        let mut queue = Self::new();
        queue.push(Bytes::copy_from_slice(src));
        queue
    }
}

impl From<Bytes> for ByteQueue {
    fn from(chunk: Bytes) -> Self {
        let mut queue = Self::new();
        queue.push(chunk);
        queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_drain_ordering() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"hello "));
        queue.push(Bytes::from_static(b"world"));
        assert_eq!(queue.len(), 11);

        queue.drain(6);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.split_to(5), Bytes::from_static(b"world"));
        assert!(queue.is_empty());
    }

    #[test]
    fn prepend_is_front() {
        let mut queue = ByteQueue::from(&b"world"[..]);
        queue.prepend(Bytes::from_static(b"hello "));
        assert_eq!(queue.take_all(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn peeks_cross_chunk_boundaries() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(&[0x12]));
        queue.push(Bytes::from_static(&[0x34, 0x56]));
        queue.push(Bytes::from_static(&[0x78]));

        assert_eq!(queue.peek_u16(0), Some(0x1234));
        assert_eq!(queue.peek_u16(1), Some(0x3456));
        assert_eq!(queue.peek_u32(0), Some(0x12345678));
        assert_eq!(queue.peek_u32(1), None);
        // Nothing was consumed.
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn peeks_see_staged_writes() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(&[0xAB]));
        queue.put_u16(0xCDEF);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek_u8(0), Some(0xAB));
        assert_eq!(queue.peek_u16(1), Some(0xCDEF));
    }

    #[test]
    fn split_to_spans_chunks() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"ab"));
        queue.push(Bytes::from_static(b"cd"));
        queue.put_slice(b"ef");

        assert_eq!(queue.split_to(5), Bytes::from_static(b"abcde"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_u8(0), Some(b'f'));
    }

    #[test]
    fn big_endian_round_trip() {
        let mut queue = ByteQueue::new();
        queue.put_i32(-5678);
        queue.put_f64(3.5);
        queue.put_u8(0xFF);

        assert_eq!(queue.peek_i32(0), Some(-5678));
        assert_eq!(queue.peek_f64(4), Some(3.5));
        assert_eq!(queue.peek_u8(12), Some(0xFF));
        assert_eq!(queue.len(), 13);
    }
}
