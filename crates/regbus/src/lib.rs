#![no_std]
//! Multi-tenant register transport over one shared bus peripheral.
//!
//! Several logical devices (a fuel gauge, an audio DAC, a radio
//! front-end) each get a [`Module`] endpoint on a single
//! [`BusController`]. Endpoints queue register reads and writes; the
//! controller puts one transfer at a time on the wire, verifies
//! per-register CRC-8 checksums, retries failed attempts up to a fixed
//! budget, and resets the peripheral when it wedges. Completion
//! callbacks run from a cooperative drain, never from the interrupt
//! handler.
//!
//! Wiring: implement [`BusPhy`] for the peripheral, feed its interrupt
//! events into [`BusController::on_interrupt`], and call
//! [`Module::drain_completed`] and
//! [`BusController::periodic_health_check`] from the main loop.

mod controller;
pub mod crc;
mod error;
mod interface;
mod phy;
mod transfer;

pub use controller::{BusConfig, BusController, BusEvent};
pub use error::{CallbackError, Error};
pub use interface::{EventCallback, EventFlags, Module, MAX_EVENT_CALLBACKS};
pub use phy::BusPhy;
pub use transfer::{
    CompletedPayload, Completion, TransferCallback, TransferKind, MAX_FRAME,
    MAX_REGS,
};
