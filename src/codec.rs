//! Binary wire codec for values crossing rank boundaries.
//!
//! Every value that travels through a collective call is encoded into a
//! [`ByteStream`] and decoded from one on the far side. A type becomes
//! transmissible by implementing [`Wire`]; built-in implementations cover
//! the fixed-size numerics, `String`, pairs, and sequences of transmissible
//! elements. A type without a `Wire` implementation is rejected by the
//! compiler at registration time.

use anyhow::{bail, Result};
use bytes::Bytes;

/// An append-only byte buffer with an independent sequential read cursor.
///
/// The write region only ever grows; the cursor only ever advances, except
/// through an explicit [`rewind`](ByteStream::rewind) back to offset zero.
/// Each pipeline phase owns the streams it touches, so no synchronization
/// is involved.
#[derive(Debug, Default)]
pub struct ByteStream {
    buf: Vec<u8>,
    cursor: usize,
}

impl ByteStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            cursor: 0,
        }
    }

    /// Total number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes left between the read cursor and the write bound.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// Append raw bytes to the write region.
    pub fn write_bytes(&mut self, raw: &[u8]) {
        self.buf.extend_from_slice(raw);
    }

    /// Consume `count` bytes at the cursor, advancing it.
    ///
    /// Reads never outrun the write bound; asking for more than
    /// [`remaining`](ByteStream::remaining) is an error rather than
    /// undefined data.
    pub fn read_bytes(&mut self, count: usize) -> Result<&[u8]> {
        if count > self.remaining() {
            bail!(
                "read of {count} bytes overruns stream ({} remaining of {})",
                self.remaining(),
                self.buf.len()
            );
        }
        let start = self.cursor;
        self.cursor += count;
        Ok(&self.buf[start..start + count])
    }

    /// Move the read cursor back to offset zero without touching the data.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Drop all data and reset the cursor.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.cursor = 0;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Hand the written bytes to the transport as a cheaply cloneable payload.
    pub fn freeze(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

impl From<Vec<u8>> for ByteStream {
    fn from(buf: Vec<u8>) -> Self {
        Self { buf, cursor: 0 }
    }
}

impl From<Bytes> for ByteStream {
    fn from(raw: Bytes) -> Self {
        Self {
            buf: Vec::from(raw.as_ref()),
            cursor: 0,
        }
    }
}

/// The capability contract for values that cross rank boundaries.
///
/// Encoding cannot fail; decoding validates every length against the
/// remaining buffer and returns an error on overrun or malformed content.
pub trait Wire: Sized {
    fn encode(&self, out: &mut ByteStream);
    fn decode(input: &mut ByteStream) -> Result<Self>;
}

macro_rules! wire_fixed {
    ($($ty:ty),* $(,)?) => {$(
        impl Wire for $ty {
            fn encode(&self, out: &mut ByteStream) {
                out.write_bytes(&self.to_le_bytes());
            }

            fn decode(input: &mut ByteStream) -> Result<Self> {
                let raw = input.read_bytes(std::mem::size_of::<$ty>())?;
                Ok(<$ty>::from_le_bytes(raw.try_into()?))
            }
        }
    )*};
}

wire_fixed!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl Wire for bool {
    fn encode(&self, out: &mut ByteStream) {
        u8::from(*self).encode(out);
    }

    fn decode(input: &mut ByteStream) -> Result<Self> {
        Ok(u8::decode(input)? != 0)
    }
}

impl Wire for () {
    fn encode(&self, _out: &mut ByteStream) {}

    fn decode(_input: &mut ByteStream) -> Result<Self> {
        Ok(())
    }
}

/// Text: an 8-byte byte length followed by the raw UTF-8, no terminator.
impl Wire for String {
    fn encode(&self, out: &mut ByteStream) {
        (self.len() as u64).encode(out);
        out.write_bytes(self.as_bytes());
    }

    fn decode(input: &mut ByteStream) -> Result<Self> {
        let len = u64::decode(input)? as usize;
        let raw = input.read_bytes(len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

/// Sequence: an 8-byte element count followed by each element in order.
impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, out: &mut ByteStream) {
        (self.len() as u64).encode(out);
        for item in self {
            item.encode(out);
        }
    }

    fn decode(input: &mut ByteStream) -> Result<Self> {
        let count = u64::decode(input)? as usize;
        let mut items = Vec::with_capacity(count.min(input.remaining()));
        for _ in 0..count {
            items.push(T::decode(input)?);
        }
        Ok(items)
    }
}

/// Pair: first's encoding directly followed by second's.
impl<A: Wire, B: Wire> Wire for (A, B) {
    fn encode(&self, out: &mut ByteStream) {
        self.0.encode(out);
        self.1.encode(out);
    }

    fn decode(input: &mut ByteStream) -> Result<Self> {
        let first = A::decode(input)?;
        let second = B::decode(input)?;
        Ok((first, second))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Wire + PartialEq + std::fmt::Debug>(value: T) {
        let mut bs = ByteStream::new();
        value.encode(&mut bs);
        assert_eq!(T::decode(&mut bs).unwrap(), value);
        assert_eq!(bs.remaining(), 0);
    }

    #[test]
    fn fixed_width_round_trips() {
        round_trip(0u8);
        round_trip(u16::MAX);
        round_trip(0xdead_beefu32);
        round_trip(u64::MAX);
        round_trip(-42i64);
        round_trip(3.5f64);
        round_trip(true);
        round_trip(());
    }

    #[test]
    fn string_round_trips() {
        round_trip(String::new());
        round_trip("the quick brown fox".to_string());
        // embedded NUL and other non-printable bytes survive verbatim
        round_trip("a\0b\x01\x7f".to_string());
    }

    #[test]
    fn nested_composites_round_trip() {
        round_trip(vec![
            ("counts".to_string(), vec![1u64, 2, 3]),
            (String::new(), Vec::new()),
        ]);
        round_trip(vec![(1u32, (2.5f64, "x".to_string()))]);
    }

    #[test]
    fn string_wire_layout() {
        let mut bs = ByteStream::new();
        "ab".to_string().encode(&mut bs);
        assert_eq!(bs.as_slice(), &[2, 0, 0, 0, 0, 0, 0, 0, b'a', b'b'][..]);
    }

    #[test]
    fn read_overrun_is_an_error() {
        let mut bs = ByteStream::from(vec![1u8, 2, 3]);
        assert!(bs.read_bytes(4).is_err());
        // a failed read consumes nothing
        assert_eq!(bs.read_bytes(3).unwrap(), &[1u8, 2, 3][..]);
    }

    #[test]
    fn truncated_sequence_is_an_error() {
        let mut bs = ByteStream::new();
        vec![7u64, 8, 9].encode(&mut bs);
        let truncated = bs.as_slice()[..bs.len() - 4].to_vec();
        assert!(Vec::<u64>::decode(&mut ByteStream::from(truncated)).is_err());
    }

    #[test]
    fn preallocated_stream_starts_empty() {
        let mut bs = ByteStream::with_capacity(16);
        assert!(bs.is_empty());
        9u64.encode(&mut bs);
        assert_eq!(u64::decode(&mut bs).unwrap(), 9);
    }

    #[test]
    fn rewind_replays_without_rewriting() {
        let mut bs = ByteStream::new();
        11u64.encode(&mut bs);
        assert_eq!(u64::decode(&mut bs).unwrap(), 11);
        bs.rewind();
        assert_eq!(u64::decode(&mut bs).unwrap(), 11);
        bs.clear();
        assert!(bs.is_empty());
    }
}
