//! Physical bus abstraction.
//!
//! The transport drives exactly one peripheral through this trait. The
//! backend (an I2C controller, a UART register bridge) is picked at
//! construction time by instantiating [`crate::BusController`] with the
//! matching implementation; there is no runtime dispatch.

/// Driver for the physical peripheral underneath the transport.
///
/// Asynchronous operations (`begin_read`, `begin_write`) start a hardware
/// transfer and return immediately; the peripheral's interrupt handler is
/// expected to call [`crate::BusController::on_interrupt`] with the
/// matching [`crate::BusEvent`] once the operation finishes. Synchronous
/// operations busy-wait on the peripheral and own their bounded timeout
/// against the platform tick source.
///
/// The peripheral is handed over initialized; the transport only calls
/// `deinit`/`init` as a pair during fault recovery.
pub trait BusPhy {
    /// Error type reported by the driver.
    type Error: core::fmt::Debug;

    /// Starts an interrupt-driven read of `len` bytes from `register` of
    /// the device at the 7-bit `address`.
    fn begin_read(
        &mut self,
        address: u8,
        register: u8,
        len: usize,
    ) -> Result<(), Self::Error>;

    /// Starts an interrupt-driven write of `frame` to `register` of the
    /// device at the 7-bit `address`. The frame is consumed before the
    /// call returns (the driver copies it or hands it to DMA-owned
    /// memory).
    fn begin_write(
        &mut self,
        address: u8,
        register: u8,
        frame: &[u8],
    ) -> Result<(), Self::Error>;

    /// Copies the bytes of the last completed read into `frame`. Only
    /// valid between a receive-complete event and the next `begin_read`.
    fn read_received(&mut self, frame: &mut [u8]) -> Result<(), Self::Error>;

    /// Blocking read with a bounded busy-wait.
    fn read_sync(
        &mut self,
        address: u8,
        register: u8,
        frame: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(), Self::Error>;

    /// Blocking write with a bounded busy-wait.
    fn write_sync(
        &mut self,
        address: u8,
        register: u8,
        frame: &[u8],
        timeout_ms: u32,
    ) -> Result<(), Self::Error>;

    /// Whether the peripheral currently reports a transfer in progress.
    fn is_busy(&self) -> bool;

    /// Re-initializes the peripheral, including its bus timeout
    /// thresholds. Called after `deinit` during fault recovery.
    fn init(&mut self) -> Result<(), Self::Error>;

    /// Releases the peripheral.
    fn deinit(&mut self);

    /// Device-specific recovery sequence (pin toggle, clock pulse) run
    /// between `deinit` and `init`.
    fn reset_hook(&mut self);
}
