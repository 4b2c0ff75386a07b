//! Control commands exchanged between the coordinator and worker ranks.
//!
//! Every rank consumes the same broadcast command sequence in lockstep.
//! A command is one opcode byte plus a 64-bit value whose meaning depends
//! on the opcode: the byte length for side-data opcodes, the packed
//! dispatch key for start-job, and the exit status for terminate.

use anyhow::{bail, Result};

use crate::codec::{ByteStream, Wire};

/// Command opcodes, in wire-tag order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    DistributeInput = 0,
    MapSideData = 1,
    ReduceSideData = 2,
    CombineSideData = 3,
    StartJob = 4,
    Terminate = 5,
}

impl OpCode {
    fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => OpCode::DistributeInput,
            1 => OpCode::MapSideData,
            2 => OpCode::ReduceSideData,
            3 => OpCode::CombineSideData,
            4 => OpCode::StartJob,
            5 => OpCode::Terminate,
            other => bail!("unknown command opcode {other}"),
        })
    }
}

/// A control command broadcast by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub code: OpCode,
    pub value: u64,
}

impl Command {
    /// Encoded size: a one-byte opcode followed by the 64-bit value.
    pub const WIRE_LEN: usize = 9;

    pub fn new(code: OpCode, value: u64) -> Self {
        Self { code, value }
    }

    pub fn encode(&self, out: &mut ByteStream) {
        (self.code as u8).encode(out);
        self.value.encode(out);
    }

    pub fn decode(input: &mut ByteStream) -> Result<Self> {
        let code = OpCode::from_u8(u8::decode(input)?)?;
        let value = u64::decode(input)?;
        Ok(Self { code, value })
    }
}

/// The three handler indices named by a start-job command.
///
/// On the wire this is a single 64-bit value: bits 32–47 hold the map
/// index, bits 16–31 the reduce index, bits 0–15 the combine index.
/// Index 0 means absent or unregistered. Internally the indices stay
/// unpacked; packing happens only at the protocol boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchKey {
    pub map: u16,
    pub reduce: u16,
    pub combine: u16,
}

impl DispatchKey {
    /// The all-zero key, broadcast when a submission is rejected before
    /// dispatch so workers stay in lockstep without running anything.
    pub const ABORT: DispatchKey = DispatchKey {
        map: 0,
        reduce: 0,
        combine: 0,
    };

    pub fn pack(self) -> u64 {
        (u64::from(self.map) << 32) | (u64::from(self.reduce) << 16) | u64::from(self.combine)
    }

    pub fn unpack(raw: u64) -> Self {
        Self {
            map: (raw >> 32) as u16,
            reduce: (raw >> 16) as u16,
            combine: raw as u16,
        }
    }

    /// A job cannot run without both a map and a reduce handler.
    pub fn is_abort(self) -> bool {
        self.map == 0 || self.reduce == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips() {
        let head = Command::new(OpCode::MapSideData, 128);
        let mut bs = ByteStream::new();
        head.encode(&mut bs);
        assert_eq!(bs.len(), Command::WIRE_LEN);
        assert_eq!(Command::decode(&mut bs).unwrap(), head);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut bs = ByteStream::from(vec![9u8, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(Command::decode(&mut bs).is_err());
    }

    #[test]
    fn dispatch_key_bit_layout() {
        let key = DispatchKey {
            map: 0x0001,
            reduce: 0x0002,
            combine: 0x0003,
        };
        assert_eq!(key.pack(), 0x0000_0001_0002_0003);
        assert_eq!(DispatchKey::unpack(0x0000_0001_0002_0003), key);
    }

    #[test]
    fn field_boundaries_do_not_bleed() {
        let key = DispatchKey {
            map: u16::MAX,
            reduce: 0,
            combine: u16::MAX,
        };
        assert_eq!(DispatchKey::unpack(key.pack()), key);
    }

    #[test]
    fn missing_map_or_reduce_means_abort() {
        assert!(DispatchKey::ABORT.is_abort());
        assert!(DispatchKey { map: 1, reduce: 0, combine: 0 }.is_abort());
        assert!(DispatchKey { map: 0, reduce: 1, combine: 0 }.is_abort());
        assert!(!DispatchKey { map: 1, reduce: 2, combine: 0 }.is_abort());
    }
}
