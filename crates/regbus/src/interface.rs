//! Logical interface: one endpoint per device sharing the bus.
//!
//! A [`Module`] is a cheap copyable handle into the controller's slot for
//! that device. All queue, registry, and state accesses go through the
//! controller's critical section, so handles may be used from the
//! cooperative context while the interrupt router runs.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use heapless::{Deque, Vec};

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::controller::{BusController, Inner};
use crate::error::{CallbackError, Error};
use crate::phy::BusPhy;
use crate::transfer::{
    Payload, Transfer, TransferCallback, TransferKind, MAX_FRAME, MAX_REGS,
};
use crate::crc;

/// Slots available for interface-level event callbacks.
pub const MAX_EVENT_CALLBACKS: usize = 4;

bitflags! {
    /// Event classes an interface-level callback can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u8 {
        /// A bus fault hit this interface's in-flight transfer.
        const ERROR = 1 << 0;
        /// The device's external interrupt line fired.
        const ALERT = 1 << 1;
    }
}

/// Interface-level event handler. Runs synchronously when the event
/// fires; a failure is logged and does not stop other handlers.
pub type EventCallback = fn(EventFlags) -> Result<(), CallbackError>;

pub(crate) struct EventSlot {
    pub(crate) id: u8,
    pub(crate) mask: EventFlags,
    pub(crate) handler: EventCallback,
}

/// Per-device state held inside the controller.
pub(crate) struct ModuleState<const DEPTH: usize> {
    pub(crate) address: u8,
    pub(crate) crc: bool,
    pub(crate) pending: Deque<Transfer, DEPTH>,
    pub(crate) completed: Deque<Transfer, DEPTH>,
    pub(crate) active: bool,
    pub(crate) callbacks: Vec<EventSlot, MAX_EVENT_CALLBACKS>,
}

impl<const DEPTH: usize> ModuleState<DEPTH> {
    pub(crate) fn new(address: u8, crc: bool) -> Self {
        Self {
            address,
            crc,
            pending: Deque::new(),
            completed: Deque::new(),
            active: false,
            callbacks: Vec::new(),
        }
    }
}

/// Invokes every registered handler whose mask intersects `flags`. A
/// failing handler never blocks the remaining ones.
pub(crate) fn dispatch_event<const DEPTH: usize>(
    state: &ModuleState<DEPTH>,
    flags: EventFlags,
) {
    for slot in state.callbacks.iter() {
        if slot.mask.intersects(flags) && (slot.handler)(flags).is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("event callback {} failed", slot.id);
        }
    }
}

/// Handle to one logical device endpoint on a shared bus.
///
/// Obtained from [`BusController::register`]. Asynchronous operations
/// enqueue a transfer and return immediately; outcomes arrive through the
/// transfer's callback when [`Module::drain_completed`] runs.
pub struct Module<'a, M: RawMutex, P: BusPhy, const IFACES: usize, const DEPTH: usize>
{
    bus: &'a BusController<M, P, IFACES, DEPTH>,
    index: usize,
}

impl<M: RawMutex, P: BusPhy, const IFACES: usize, const DEPTH: usize> Clone
    for Module<'_, M, P, IFACES, DEPTH>
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: RawMutex, P: BusPhy, const IFACES: usize, const DEPTH: usize> Copy
    for Module<'_, M, P, IFACES, DEPTH>
{
}

impl<'a, M: RawMutex, P: BusPhy, const IFACES: usize, const DEPTH: usize>
    Module<'a, M, P, IFACES, DEPTH>
{
    pub(crate) fn new(
        bus: &'a BusController<M, P, IFACES, DEPTH>,
        index: usize,
    ) -> Self {
        Self { bus, index }
    }

    // ------------------------------------------------------------------
    // Synchronous register access
    // ------------------------------------------------------------------

    /// Blocking register read, checksum-verified when CRC is enabled.
    ///
    /// Fails with [`Error::BusBusy`] while an asynchronous transfer is
    /// outstanding anywhere on the bus. Intended for initialization-time
    /// access before interrupt-driven operation starts.
    pub fn read(
        &self,
        register: u8,
        buf: &mut [u8],
    ) -> Result<(), Error<P::Error>> {
        if buf.is_empty() || crc::frame_len(buf.len(), 1) > MAX_FRAME {
            return Err(Error::InvalidArgument);
        }
        self.bus.with_inner(|inner| {
            if inner.active.is_some() || inner.phy.is_busy() {
                return Err(Error::BusBusy);
            }
            let Inner { phy, modules, rx_scratch, config, .. } = inner;
            let m = &modules[self.index];
            if m.crc {
                let total = crc::frame_len(buf.len(), 1);
                phy.read_sync(
                    m.address,
                    register,
                    &mut rx_scratch[..total],
                    config.sync_timeout_ms,
                )
                .map_err(Error::Phy)?;
                let seed = crc::seed_address(m.address, crc::DIR_READ);
                if !crc::verify_frame(seed, register, &rx_scratch[..total], None)
                {
                    return Err(Error::TransferFailed);
                }
                crc::compact_frame(&rx_scratch[..total], None, buf);
            } else {
                phy.read_sync(m.address, register, buf, config.sync_timeout_ms)
                    .map_err(Error::Phy)?;
            }
            Ok(())
        })
    }

    /// Blocking register write, checksummed when CRC is enabled.
    pub fn write(
        &self,
        register: u8,
        data: &[u8],
    ) -> Result<(), Error<P::Error>> {
        if data.is_empty() || crc::frame_len(data.len(), 1) > MAX_FRAME {
            return Err(Error::InvalidArgument);
        }
        self.bus.with_inner(|inner| {
            if inner.active.is_some() || inner.phy.is_busy() {
                return Err(Error::BusBusy);
            }
            let Inner { phy, modules, tx_scratch, config, .. } = inner;
            let m = &modules[self.index];
            if m.crc {
                let seed = crc::seed_address(m.address, crc::DIR_WRITE);
                let n =
                    crc::prepare_frame(seed, register, data, None, tx_scratch);
                phy.write_sync(
                    m.address,
                    register,
                    &tx_scratch[..n],
                    config.sync_timeout_ms,
                )
                .map_err(Error::Phy)?;
            } else {
                phy.write_sync(m.address, register, data, config.sync_timeout_ms)
                    .map_err(Error::Phy)?;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Asynchronous register access
    // ------------------------------------------------------------------

    /// Queues a variable-length read into a caller-owned buffer.
    pub fn read_async(
        &self,
        register: u8,
        buf: &'static mut [u8],
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        if buf.is_empty() || crc::frame_len(buf.len(), 1) > MAX_FRAME {
            return Err(Error::InvalidArgument);
        }
        let len = buf.len();
        self.enqueue(Transfer {
            kind: TransferKind::Read,
            register,
            payload: Payload::In(buf),
            len,
            sizes: None,
            retries: 0,
            outcome: None,
            callback,
            token,
        })
    }

    /// Queues a variable-length write of a caller-owned buffer.
    pub fn write_async(
        &self,
        register: u8,
        data: &'static [u8],
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        if data.is_empty() || crc::frame_len(data.len(), 1) > MAX_FRAME {
            return Err(Error::InvalidArgument);
        }
        let len = data.len();
        self.enqueue(Transfer {
            kind: TransferKind::Write,
            register,
            payload: Payload::Out(data),
            len,
            sizes: None,
            retries: 0,
            outcome: None,
            callback,
            token,
        })
    }

    /// Queues a one-byte read; the value arrives in the completion.
    pub fn read_u8_async(
        &self,
        register: u8,
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        self.enqueue_value_read(register, 1, callback, token)
    }

    /// Queues a two-byte little-endian read.
    pub fn read_u16_async(
        &self,
        register: u8,
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        self.enqueue_value_read(register, 2, callback, token)
    }

    /// Queues a four-byte little-endian read.
    pub fn read_u32_async(
        &self,
        register: u8,
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        self.enqueue_value_read(register, 4, callback, token)
    }

    /// Queues a one-byte write.
    pub fn write_u8_async(
        &self,
        register: u8,
        value: u8,
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        self.enqueue_value_write(register, [value, 0, 0, 0], 1, callback, token)
    }

    /// Queues a two-byte little-endian write.
    pub fn write_u16_async(
        &self,
        register: u8,
        value: u16,
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u16(&mut bytes, value);
        self.enqueue_value_write(register, bytes, 2, callback, token)
    }

    /// Queues a four-byte little-endian write.
    pub fn write_u32_async(
        &self,
        register: u8,
        value: u32,
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.enqueue_value_write(register, bytes, 4, callback, token)
    }

    /// Queues a burst read over consecutively addressed registers.
    ///
    /// `sizes` gives the byte count of each register; the sum must equal
    /// `buf.len()`. The size list is copied, the caller's slice need not
    /// outlive the call.
    pub fn read_regs_async(
        &self,
        register: u8,
        sizes: &[u8],
        buf: &'static mut [u8],
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        let copied = Self::copy_sizes(sizes, buf.len())?;
        let len = buf.len();
        self.enqueue(Transfer {
            kind: TransferKind::Read,
            register,
            payload: Payload::In(buf),
            len,
            sizes: Some(copied),
            retries: 0,
            outcome: None,
            callback,
            token,
        })
    }

    /// Queues a burst write over consecutively addressed registers.
    pub fn write_regs_async(
        &self,
        register: u8,
        sizes: &[u8],
        data: &'static [u8],
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        let copied = Self::copy_sizes(sizes, data.len())?;
        let len = data.len();
        self.enqueue(Transfer {
            kind: TransferKind::Write,
            register,
            payload: Payload::Out(data),
            len,
            sizes: Some(copied),
            retries: 0,
            outcome: None,
            callback,
            token,
        })
    }

    // ------------------------------------------------------------------
    // Completion drain
    // ------------------------------------------------------------------

    /// Runs the callbacks of finished transfers, oldest first.
    ///
    /// Must be called periodically from the cooperative context; the
    /// critical section is released before each callback runs, so
    /// callbacks may enqueue further transfers. If a callback fails the
    /// drain stops and returns its error: the failing entry has already
    /// run (exactly once) and the rest stay queued for the next drain.
    ///
    /// Returns the number of completions dispatched.
    pub fn drain_completed(&self) -> Result<usize, Error<P::Error>> {
        let mut drained = 0;
        loop {
            let next = self.bus.with_inner(|inner| {
                inner.modules[self.index].completed.pop_front()
            });
            let Some(xfer) = next else {
                return Ok(drained);
            };
            drained += 1;
            let (callback, completion) = xfer.finish();
            if let Some(cb) = callback {
                cb(completion)?;
            }
        }
    }

    // ------------------------------------------------------------------
    // Interface-level events
    // ------------------------------------------------------------------

    /// Registers `handler` for the events in `mask` under `id`.
    ///
    /// Id 0 is anonymous: several anonymous handlers may coexist and none
    /// can be unregistered. A non-zero id replaces any previous handler
    /// registered under the same id.
    pub fn register_event_callback(
        &self,
        handler: EventCallback,
        mask: EventFlags,
        id: u8,
    ) -> Result<(), Error<P::Error>> {
        self.bus.with_inner(|inner| {
            let m = &mut inner.modules[self.index];
            if id != 0 {
                if let Some(slot) =
                    m.callbacks.iter_mut().find(|s| s.id == id)
                {
                    *slot = EventSlot { id, mask, handler };
                    return Ok(());
                }
            }
            m.callbacks
                .push(EventSlot { id, mask, handler })
                .map_err(|_| Error::QueueFull)?;
            Ok(())
        })
    }

    /// Removes the handler registered under a non-zero `id`.
    pub fn unregister_event_callback(
        &self,
        id: u8,
    ) -> Result<(), Error<P::Error>> {
        if id == 0 {
            return Err(Error::InvalidArgument);
        }
        self.bus.with_inner(|inner| {
            let m = &mut inner.modules[self.index];
            let before = m.callbacks.len();
            m.callbacks.retain(|s| s.id != id);
            if m.callbacks.len() == before {
                Err(Error::InvalidArgument)
            } else {
                Ok(())
            }
        })
    }

    /// Delivers an event to this interface's registered handlers.
    ///
    /// Call from the GPIO handler wired to the device's interrupt line
    /// with [`EventFlags::ALERT`]. Handlers run synchronously inside the
    /// bus critical section and must not issue bus operations.
    pub fn raise_event(&self, flags: EventFlags) {
        self.bus.with_inner(|inner| {
            dispatch_event(&inner.modules[self.index], flags);
        });
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Whether this interface owns the bus's in-flight transfer.
    pub fn is_active(&self) -> bool {
        self.bus.with_inner(|inner| inner.modules[self.index].active)
    }

    pub fn pending_len(&self) -> usize {
        self.bus.with_inner(|inner| inner.modules[self.index].pending.len())
    }

    pub fn completed_len(&self) -> usize {
        self.bus.with_inner(|inner| inner.modules[self.index].completed.len())
    }

    /// The device's 7-bit bus address.
    pub fn address(&self) -> u8 {
        self.bus.with_inner(|inner| inner.modules[self.index].address)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn enqueue_value_read(
        &self,
        register: u8,
        width: u8,
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        self.enqueue(Transfer {
            kind: TransferKind::Read,
            register,
            payload: Payload::Value { bytes: [0; 4], len: width },
            len: width as usize,
            sizes: None,
            retries: 0,
            outcome: None,
            callback,
            token,
        })
    }

    fn enqueue_value_write(
        &self,
        register: u8,
        bytes: [u8; 4],
        width: u8,
        callback: Option<TransferCallback>,
        token: u32,
    ) -> Result<(), Error<P::Error>> {
        self.enqueue(Transfer {
            kind: TransferKind::Write,
            register,
            payload: Payload::Value { bytes, len: width },
            len: width as usize,
            sizes: None,
            retries: 0,
            outcome: None,
            callback,
            token,
        })
    }

    fn copy_sizes(
        sizes: &[u8],
        total_len: usize,
    ) -> Result<heapless::Vec<u8, MAX_REGS>, Error<P::Error>> {
        if sizes.is_empty()
            || sizes.len() > MAX_REGS
            || sizes.iter().any(|&s| s == 0)
        {
            return Err(Error::InvalidArgument);
        }
        let sum: usize = sizes.iter().map(|&s| s as usize).sum();
        if sum != total_len || crc::frame_len(sum, sizes.len()) > MAX_FRAME {
            return Err(Error::InvalidArgument);
        }
        let mut copied = heapless::Vec::new();
        // Length was checked against MAX_REGS above.
        let _ = copied.extend_from_slice(sizes);
        Ok(copied)
    }

    /// Appends a validated descriptor and immediately tries to start it
    /// if the bus is free. A start refusal is not an error here; the
    /// descriptor waits for the next arbitration pass.
    fn enqueue(&self, xfer: Transfer) -> Result<(), Error<P::Error>> {
        self.bus.with_inner(|inner| {
            let m = &mut inner.modules[self.index];
            if m.pending.len() + m.completed.len() >= DEPTH {
                return Err(Error::QueueFull);
            }
            // Cannot fail: the admission check above keeps the combined
            // queue population within DEPTH.
            let _ = m.pending.push_back(xfer);
            self.bus.try_start(inner, self.index);
            Ok(())
        })
    }
}
