//! Canonical journal entry and its wire format.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::Error;

/// A one-byte magic prefixing every frame, so a framing violation is caught
/// before a bogus length is used to size an allocation.
pub(crate) const MAGIC: u8 = 0xD6;

/// Log sequence number. Monotonic per thread; zero means "no LSN".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const NONE: Lsn = Lsn(0);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

/// Closed set of journal opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Noop,
    Select,
    Command,
    MultiCommand,
    Exec,
    Ping,
    Lsn,
    Fin,
}

impl Op {
    fn to_byte(self) -> u8 {
        match self {
            Op::Noop => 0,
            Op::Select => 1,
            Op::Command => 2,
            Op::MultiCommand => 3,
            Op::Exec => 4,
            Op::Ping => 5,
            Op::Lsn => 6,
            Op::Fin => 7,
        }
    }

    fn from_byte(b: u8) -> Result<Self, Error> {
        Ok(match b {
            0 => Op::Noop,
            1 => Op::Select,
            2 => Op::Command,
            3 => Op::MultiCommand,
            4 => Op::Exec,
            5 => Op::Ping,
            6 => Op::Lsn,
            7 => Op::Fin,
            _ => return Err(Error::Malformed("unknown opcode")),
        })
    }
}

/// One logged operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub txid: u64,
    pub opcode: Op,
    pub dbid: u32,
    pub shard_cnt: u32,
    pub slot: Option<u64>,
    /// Opcode-dependent payload. For `Command`/`MultiCommand` this is the
    /// argv vector. For `Lsn` it is a single element: the target LSN's
    /// 8 little-endian bytes.
    pub payload: Vec<Bytes>,
    pub lsn: Lsn,
}

impl Entry {
    /// Build a shard-local, single-entry command (`shard_cnt == 1`).
    pub fn command(dbid: u32, txid: u64, argv: Vec<Bytes>) -> Self {
        Self {
            txid,
            opcode: Op::Command,
            dbid,
            shard_cnt: 1,
            slot: None,
            payload: argv,
            lsn: Lsn::NONE,
        }
    }

    /// Build a step of a multi-shard transaction.
    pub fn multi_command(dbid: u32, txid: u64, shard_cnt: u32, argv: Vec<Bytes>) -> Self {
        Self {
            txid,
            opcode: Op::MultiCommand,
            dbid,
            shard_cnt,
            slot: None,
            payload: argv,
            lsn: Lsn::NONE,
        }
    }

    /// Build the commit marker closing a multi-shard transaction.
    pub fn exec(dbid: u32, txid: u64, shard_cnt: u32) -> Self {
        Self {
            txid,
            opcode: Op::Exec,
            dbid,
            shard_cnt,
            slot: None,
            payload: Vec::new(),
            lsn: Lsn::NONE,
        }
    }

    /// Build a quiescence marker proposing finalization at `target`.
    pub fn lsn_marker(dbid: u32, target: Lsn) -> Self {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64_le(target.get());
        Self {
            txid: 0,
            opcode: Op::Lsn,
            dbid,
            shard_cnt: 1,
            slot: None,
            payload: vec![buf.freeze()],
            lsn: Lsn::NONE,
        }
    }

    pub fn ping(dbid: u32) -> Self {
        Self {
            txid: 0,
            opcode: Op::Ping,
            dbid,
            shard_cnt: 1,
            slot: None,
            payload: Vec::new(),
            lsn: Lsn::NONE,
        }
    }

    pub fn fin(dbid: u32) -> Self {
        Self {
            txid: 0,
            opcode: Op::Fin,
            dbid,
            shard_cnt: 1,
            slot: None,
            payload: Vec::new(),
            lsn: Lsn::NONE,
        }
    }

    /// Decode the target LSN carried by an `Op::Lsn` entry.
    pub fn target_lsn(&self) -> Option<Lsn> {
        if self.opcode != Op::Lsn {
            return None;
        }
        let bytes = self.payload.first()?;
        if bytes.len() != 8 {
            return None;
        }
        let mut b = bytes.clone();
        Some(Lsn(b.get_u64_le()))
    }

    /// Approximate byte size of this entry once serialized, for ring buffer accounting.
    pub fn approx_size(&self) -> usize {
        1 + 1 + 4 + 8 + 4 + 8 + 8 + 4 + self.payload.iter().map(|p| 4 + p.len()).sum::<usize>()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.approx_size());
        buf.put_u8(MAGIC);
        buf.put_u8(self.opcode.to_byte());
        buf.put_u32_le(self.dbid);
        buf.put_u64_le(self.txid);
        buf.put_u32_le(self.shard_cnt);
        buf.put_i64_le(self.slot.map(|s| s as i64).unwrap_or(-1));
        buf.put_u64_le(self.lsn.get());
        buf.put_u32_le(self.payload.len() as u32);
        for part in &self.payload {
            buf.put_u32_le(part.len() as u32);
            buf.put_slice(part);
        }
        buf.freeze()
    }

    /// Decode a single frame from an in-memory buffer (used by the reader
    /// once it has buffered a full frame, and directly by tests).
    pub fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        if buf.remaining() < 1 {
            return Err(Error::ShortRead);
        }
        let magic = buf.get_u8();
        if magic != MAGIC {
            return Err(Error::Malformed("bad magic byte"));
        }
        if buf.remaining() < 1 {
            return Err(Error::Malformed("truncated opcode"));
        }
        let opcode = Op::from_byte(buf.get_u8())?;

        if buf.remaining() < 4 + 8 + 4 + 8 + 8 + 4 {
            return Err(Error::Malformed("truncated header"));
        }
        let dbid = buf.get_u32_le();
        let txid = buf.get_u64_le();
        let shard_cnt = buf.get_u32_le();
        let raw_slot = buf.get_i64_le();
        let slot = if raw_slot < 0 {
            None
        } else {
            Some(raw_slot as u64)
        };
        let lsn = Lsn(buf.get_u64_le());
        let argc = buf.get_u32_le();

        // Bound argc so a corrupt length can't trigger a huge allocation loop.
        if argc > 1_000_000 {
            return Err(Error::Malformed("argc out of range"));
        }

        let mut payload = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            if buf.remaining() < 4 {
                return Err(Error::Malformed("truncated argv length"));
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(Error::Malformed("truncated argv value"));
            }
            payload.push(buf.copy_to_bytes(len));
        }

        Ok(Entry {
            txid,
            opcode,
            dbid,
            shard_cnt,
            slot,
            payload,
            lsn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_command() {
        let e = Entry::command(3, 42, vec![Bytes::from_static(b"SET"), Bytes::from_static(b"a")]);
        let mut bytes = e.encode();
        let decoded = Entry::decode(&mut bytes).unwrap();
        assert_eq!(decoded.txid, 42);
        assert_eq!(decoded.dbid, 3);
        assert_eq!(decoded.opcode, Op::Command);
        assert_eq!(decoded.payload, e.payload);
    }

    #[test]
    fn lsn_marker_round_trips_target() {
        let e = Entry::lsn_marker(0, Lsn(777));
        let mut bytes = e.encode();
        let decoded = Entry::decode(&mut bytes).unwrap();
        assert_eq!(decoded.target_lsn(), Some(Lsn(777)));
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut bytes = BytesMut::from(&b"\x00garbage"[..]);
        let err = Entry::decode(&mut bytes).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn slot_round_trips_through_sentinel() {
        let mut e = Entry::command(0, 1, vec![]);
        e.slot = Some(9);
        let mut bytes = e.encode();
        let decoded = Entry::decode(&mut bytes).unwrap();
        assert_eq!(decoded.slot, Some(9));
    }
}
