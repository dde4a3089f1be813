//! Transfer descriptors and completion delivery.

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use crate::error::CallbackError;

/// Most registers a single burst transfer may cover.
pub const MAX_REGS: usize = 8;
/// Largest on-wire frame (payload plus checksum bytes) a transfer may
/// occupy. Bounds the controller's scratch arena.
pub const MAX_FRAME: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferKind {
    Read,
    Write,
}

/// Payload storage for one transfer. Caller-owned buffers and the
/// embedded short-value buffer are mutually exclusive by construction.
pub(crate) enum Payload {
    /// Caller-owned data for a variable-length write.
    Out(&'static [u8]),
    /// Caller-owned destination for a variable-length read.
    In(&'static mut [u8]),
    /// Embedded buffer for 1/2/4-byte transfers, little-endian.
    Value { bytes: [u8; 4], len: u8 },
}

/// Callback run for a finished transfer, from the cooperative drain and
/// never from interrupt context. Receives the completion by value so
/// caller-owned buffers can be reclaimed.
pub type TransferCallback = fn(Completion) -> Result<(), CallbackError>;

/// One pending or finished register operation.
pub(crate) struct Transfer {
    pub(crate) kind: TransferKind,
    pub(crate) register: u8,
    pub(crate) payload: Payload,
    /// Logical payload bytes, checksum bytes excluded.
    pub(crate) len: usize,
    /// Per-register byte counts for bursts, copied from the caller.
    pub(crate) sizes: Option<Vec<u8, MAX_REGS>>,
    /// Attempts made so far, start failures and completion failures
    /// counted alike.
    pub(crate) retries: u8,
    /// `None` until the transfer is finalized.
    pub(crate) outcome: Option<bool>,
    pub(crate) callback: Option<TransferCallback>,
    pub(crate) token: u32,
}

impl Transfer {
    pub(crate) fn reg_count(&self) -> usize {
        self.sizes.as_ref().map_or(1, |s| s.len())
    }

    /// Bytes to put on the wire. Empty for read transfers.
    pub(crate) fn out_bytes(&self) -> &[u8] {
        match &self.payload {
            Payload::Out(data) => data,
            Payload::Value { bytes, len } => &bytes[..*len as usize],
            Payload::In(_) => &[],
        }
    }

    /// Destination for received payload bytes. Empty for write transfers,
    /// which lets the router reject a mis-built descriptor by length.
    pub(crate) fn in_bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.payload {
            Payload::In(buf) => buf,
            Payload::Value { bytes, len } => &mut bytes[..*len as usize],
            Payload::Out(_) => &mut [],
        }
    }

    /// Consumes the descriptor into its callback and completion record.
    pub(crate) fn finish(self) -> (Option<TransferCallback>, Completion) {
        let payload = match self.payload {
            Payload::Value { bytes, len } => {
                CompletedPayload::Value { bytes, len }
            }
            Payload::In(buf) => CompletedPayload::Read(buf),
            Payload::Out(data) => CompletedPayload::Written(data),
        };
        let completion = Completion {
            success: self.outcome.unwrap_or(false),
            kind: self.kind,
            register: self.register,
            len: self.len,
            token: self.token,
            payload,
        };
        (self.callback, completion)
    }
}

/// Payload handed back with a completion. Caller-owned buffers ride back
/// here so the application can reclaim them.
#[derive(Debug)]
pub enum CompletedPayload {
    /// Embedded 1/2/4-byte value; for reads it holds the received bytes.
    Value { bytes: [u8; 4], len: u8 },
    /// The read destination buffer, now filled on success.
    Read(&'static mut [u8]),
    /// The write source buffer, returned untouched.
    Written(&'static [u8]),
}

/// Outcome of one finished transfer, delivered to its callback.
#[derive(Debug)]
pub struct Completion {
    /// `false` after the retry budget was spent without a clean finish.
    pub success: bool,
    pub kind: TransferKind,
    pub register: u8,
    /// Logical payload length in bytes.
    pub len: usize,
    /// Caller's correlation token, returned verbatim.
    pub token: u32,
    pub payload: CompletedPayload,
}

impl Completion {
    /// Payload bytes, whichever variant carries them.
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            CompletedPayload::Value { bytes, len } => &bytes[..*len as usize],
            CompletedPayload::Read(buf) => buf,
            CompletedPayload::Written(data) => data,
        }
    }

    pub fn value_u8(&self) -> Option<u8> {
        let data = self.data();
        (data.len() == 1).then(|| data[0])
    }

    pub fn value_u16(&self) -> Option<u16> {
        let data = self.data();
        (data.len() == 2).then(|| LittleEndian::read_u16(data))
    }

    pub fn value_u32(&self) -> Option<u32> {
        let data = self.data();
        (data.len() == 4).then(|| LittleEndian::read_u32(data))
    }
}
