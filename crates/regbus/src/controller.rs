//! Bus controller: owns the physical peripheral, arbitrates among the
//! registered interfaces, and recovers from hardware faults.
//!
//! All state shared with the interrupt handler lives behind one
//! critical-section mutex, so an application thread enqueueing a
//! transfer cannot race the interrupt completing the previous one.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;
use portable_atomic::{AtomicU32, Ordering};

use crate::crc;
use crate::error::Error;
use crate::interface::{dispatch_event, EventFlags, Module, ModuleState};
use crate::phy::BusPhy;
use crate::transfer::{TransferKind, MAX_FRAME};

/// Completion events the peripheral's interrupt handler feeds into
/// [`BusController::on_interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    /// A transmit operation finished.
    TxComplete,
    /// A receive operation finished; data is ready in the peripheral.
    RxComplete,
    /// The peripheral reported a fault.
    Error,
}

/// Tunable limits for one bus.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusConfig {
    /// Total attempts a transfer gets before it is finalized as failed.
    pub retry_limit: u8,
    /// Consecutive health checks with an operation in flight before the
    /// peripheral is reset.
    pub stuck_busy_checks: u32,
    /// Consecutive health checks seeing the peripheral busy while no
    /// transfer is in flight before the peripheral is reset.
    pub idle_busy_checks: u32,
    /// Busy-wait bound handed to the phy's synchronous operations.
    pub sync_timeout_ms: u32,
}

impl BusConfig {
    pub const fn new() -> Self {
        Self {
            retry_limit: 3,
            stuck_busy_checks: 10,
            idle_busy_checks: 3,
            sync_timeout_ms: 5,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Inner<P: BusPhy, const IFACES: usize, const DEPTH: usize> {
    pub(crate) phy: P,
    pub(crate) modules: Vec<ModuleState<DEPTH>, IFACES>,
    /// Index of the interface owning the in-flight transfer. `Some` iff
    /// the physical bus is mid-transfer.
    pub(crate) active: Option<usize>,
    pub(crate) config: BusConfig,
    pub(crate) busy_checks: u32,
    pub(crate) idle_busy_checks: u32,
    /// Checksummed frames are assembled here instead of per-transfer
    /// buffers, sized to the largest admissible transfer.
    pub(crate) tx_scratch: [u8; MAX_FRAME],
    pub(crate) rx_scratch: [u8; MAX_FRAME],
}

/// Owner of one physical bus shared by up to `IFACES` logical devices,
/// each with queues of depth `DEPTH`.
///
/// `M` selects the lock excluding the interrupt handler; use
/// `CriticalSectionRawMutex` when the completion events come from a real
/// interrupt.
pub struct BusController<M: RawMutex, P: BusPhy, const IFACES: usize, const DEPTH: usize>
{
    inner: Mutex<M, RefCell<Inner<P, IFACES, DEPTH>>>,
    completed_xfers: AtomicU32,
    resets: AtomicU32,
}

impl<M: RawMutex, P: BusPhy, const IFACES: usize, const DEPTH: usize>
    BusController<M, P, IFACES, DEPTH>
{
    /// Creates a controller around an already-initialized peripheral.
    pub const fn new(phy: P, config: BusConfig) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                phy,
                modules: Vec::new(),
                active: None,
                config,
                busy_checks: 0,
                idle_busy_checks: 0,
                tx_scratch: [0; MAX_FRAME],
                rx_scratch: [0; MAX_FRAME],
            })),
            completed_xfers: AtomicU32::new(0),
            resets: AtomicU32::new(0),
        }
    }

    /// Registers a device endpoint at a 7-bit `address`.
    ///
    /// Registration order is fixed and doubles as arbitration order.
    pub fn register(
        &self,
        address: u8,
        crc_enabled: bool,
    ) -> Result<Module<'_, M, P, IFACES, DEPTH>, Error<P::Error>> {
        let index = self.with_inner(|inner| {
            if address > 0x7f || inner.modules.is_full() {
                return Err(Error::InvalidArgument);
            }
            let index = inner.modules.len();
            let _ = inner.modules.push(ModuleState::new(address, crc_enabled));
            Ok(index)
        })?;
        Ok(Module::new(self, index))
    }

    /// Routes a completion or fault event from the hardware interrupt
    /// handler, then hands the bus to the next queued transfer.
    ///
    /// This is the only entry point meant to run in interrupt context.
    pub fn on_interrupt(&self, event: BusEvent) {
        self.with_inner(|inner| match event {
            BusEvent::Error => {
                let faulted = inner.active;
                self.reset_locked(inner);
                if let Some(index) = faulted {
                    dispatch_event(&inner.modules[index], EventFlags::ERROR);
                }
            }
            BusEvent::TxComplete | BusEvent::RxComplete => {
                let Some(index) = inner.active else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("completion event with nothing in flight");
                    return;
                };
                let ok = self.route_completion(inner, index, event);
                inner.active = None;
                inner.modules[index].active = false;
                inner.busy_checks = 0;
                if ok {
                    self.finalize_head(inner, index, true);
                } else {
                    self.bump_retry_or_finalize(inner, index);
                }
                self.start_next(inner);
            }
        });
    }

    /// Watchdog pass; call periodically from the cooperative context.
    ///
    /// Escalates a stuck peripheral to a hardware reset and re-arms
    /// arbitration while the bus is idle, which is what retries transfers
    /// whose start attempt failed.
    pub fn periodic_health_check(&self) {
        self.with_inner(|inner| {
            if inner.active.is_none() {
                if inner.phy.is_busy() {
                    inner.idle_busy_checks += 1;
                    if inner.idle_busy_checks >= inner.config.idle_busy_checks
                    {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("peripheral busy with nothing in flight");
                        self.reset_locked(inner);
                    }
                } else {
                    inner.idle_busy_checks = 0;
                    self.start_next(inner);
                }
            } else {
                inner.busy_checks += 1;
                if inner.busy_checks >= inner.config.stuck_busy_checks {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("transfer stuck in flight");
                    self.reset_locked(inner);
                }
            }
        });
    }

    /// Whether an interface is active or the peripheral reports busy.
    pub fn is_busy(&self) -> bool {
        self.inner.lock(|cell| {
            let inner = cell.borrow();
            inner.active.is_some() || inner.phy.is_busy()
        })
    }

    /// Transfers finalized so far, either outcome.
    pub fn completed_count(&self) -> u32 {
        self.completed_xfers.load(Ordering::Relaxed)
    }

    /// Hardware resets performed so far.
    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Internals, all called with the critical section held
    // ------------------------------------------------------------------

    pub(crate) fn with_inner<R>(
        &self,
        f: impl FnOnce(&mut Inner<P, IFACES, DEPTH>) -> R,
    ) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }

    /// Tries to put interface `index`'s head-of-queue transfer on the
    /// wire. Returns whether the interface became active.
    ///
    /// A start refusal (bus occupied) leaves the queue untouched; a start
    /// failure reported by the phy consumes one retry, and a transfer
    /// whose budget is spent is finalized as failed so the next queued
    /// one can surface.
    pub(crate) fn try_start(
        &self,
        inner: &mut Inner<P, IFACES, DEPTH>,
        index: usize,
    ) -> bool {
        if inner.active.is_some()
            || inner.modules[index].active
            || inner.phy.is_busy()
        {
            return false;
        }
        loop {
            let Inner { phy, modules, tx_scratch, .. } = inner;
            let m = &mut modules[index];
            let crc_enabled = m.crc;
            let address = m.address;
            let Some(xfer) = m.pending.front() else {
                return false;
            };
            let result = match xfer.kind {
                TransferKind::Write => {
                    let payload = xfer.out_bytes();
                    let n = if crc_enabled {
                        let seed =
                            crc::seed_address(address, crc::DIR_WRITE);
                        crc::prepare_frame(
                            seed,
                            xfer.register,
                            payload,
                            xfer.sizes.as_deref(),
                            tx_scratch,
                        )
                    } else {
                        tx_scratch[..payload.len()].copy_from_slice(payload);
                        payload.len()
                    };
                    phy.begin_write(address, xfer.register, &tx_scratch[..n])
                }
                TransferKind::Read => {
                    let total = if crc_enabled {
                        crc::frame_len(xfer.len, xfer.reg_count())
                    } else {
                        xfer.len
                    };
                    phy.begin_read(address, xfer.register, total)
                }
            };
            match result {
                Ok(()) => {
                    inner.modules[index].active = true;
                    inner.active = Some(index);
                    inner.busy_checks = 0;
                    return true;
                }
                Err(_) => {
                    if !self.bump_retry_or_finalize(inner, index) {
                        // Head keeps its retry budget and its turn; the
                        // next arbitration pass attempts it again.
                        return false;
                    }
                    // Head gave up; let the next queued transfer try.
                }
            }
        }
    }

    /// One arbitration pass: registration order, rooted at the first
    /// interface each time, stopping at the first successful start.
    /// An interface registered later is reached only once every earlier
    /// queue has drained.
    pub(crate) fn start_next(&self, inner: &mut Inner<P, IFACES, DEPTH>) {
        for index in 0..inner.modules.len() {
            if self.try_start(inner, index) {
                return;
            }
        }
    }

    /// Moves the head-of-queue transfer to the completed queue with the
    /// given outcome.
    fn finalize_head(
        &self,
        inner: &mut Inner<P, IFACES, DEPTH>,
        index: usize,
        success: bool,
    ) {
        let m = &mut inner.modules[index];
        if let Some(mut xfer) = m.pending.pop_front() {
            xfer.outcome = Some(success);
            // Cannot fail: enqueue admission bounds pending + completed
            // to the queue depth.
            let _ = m.completed.push_back(xfer);
            self.completed_xfers.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Consumes one retry of the head transfer; finalizes it as failed
    /// once the budget is spent. Returns whether it was finalized.
    fn bump_retry_or_finalize(
        &self,
        inner: &mut Inner<P, IFACES, DEPTH>,
        index: usize,
    ) -> bool {
        let limit = inner.config.retry_limit;
        let give_up = match inner.modules[index].pending.front_mut() {
            Some(xfer) => {
                xfer.retries = xfer.retries.saturating_add(1);
                xfer.retries >= limit
            }
            None => return false,
        };
        if give_up {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "transfer on interface {} failed after {} attempts",
                index,
                limit
            );
            self.finalize_head(inner, index, false);
        }
        give_up
    }

    /// Decides whether a completion event finishes the head transfer
    /// cleanly, pulling in and verifying received data for reads.
    fn route_completion(
        &self,
        inner: &mut Inner<P, IFACES, DEPTH>,
        index: usize,
        event: BusEvent,
    ) -> bool {
        let Inner { phy, modules, rx_scratch, .. } = inner;
        let m = &mut modules[index];
        let crc_enabled = m.crc;
        let address = m.address;
        let Some(xfer) = m.pending.front_mut() else {
            return false;
        };
        match (xfer.kind, event) {
            (TransferKind::Write, BusEvent::TxComplete) => true,
            (TransferKind::Read, BusEvent::RxComplete) => {
                let sizes = xfer.sizes.clone();
                let sizes = sizes.as_deref();
                let total = if crc_enabled {
                    crc::frame_len(xfer.len, xfer.reg_count())
                } else {
                    xfer.len
                };
                if phy.read_received(&mut rx_scratch[..total]).is_err() {
                    return false;
                }
                let len = xfer.len;
                if crc_enabled {
                    let seed = crc::seed_address(address, crc::DIR_READ);
                    if !crc::verify_frame(
                        seed,
                        xfer.register,
                        &rx_scratch[..total],
                        sizes,
                    ) {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("crc mismatch on interface {}", index);
                        return false;
                    }
                    let dst = xfer.in_bytes_mut();
                    if dst.len() != len {
                        return false;
                    }
                    crc::compact_frame(&rx_scratch[..total], sizes, dst);
                } else {
                    let dst = xfer.in_bytes_mut();
                    if dst.len() != len {
                        return false;
                    }
                    dst.copy_from_slice(&rx_scratch[..len]);
                }
                true
            }
            _ => {
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "completion kind mismatch on interface {}",
                    index
                );
                false
            }
        }
    }

    /// Full peripheral recovery. Aborts the in-flight transfer into a
    /// retry (or a failure once its budget is spent), clears every
    /// interface's active flag, zeroes the health counters, and re-arms
    /// arbitration so queued work resumes.
    fn reset_locked(&self, inner: &mut Inner<P, IFACES, DEPTH>) {
        #[cfg(feature = "defmt")]
        defmt::warn!("resetting bus peripheral");
        inner.phy.deinit();
        inner.phy.reset_hook();
        if inner.phy.init().is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("peripheral re-init failed");
        }
        if let Some(index) = inner.active.take() {
            self.bump_retry_or_finalize(inner, index);
        }
        for m in inner.modules.iter_mut() {
            m.active = false;
        }
        inner.busy_checks = 0;
        inner.idle_busy_checks = 0;
        self.resets.fetch_add(1, Ordering::Relaxed);
        self.start_next(inner);
    }
}
