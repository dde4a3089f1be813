use core::fmt;

/// Errors surfaced by the transport layer.
///
/// Generic over the physical driver's error type so phy failures can be
/// inspected by callers without the transport interpreting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<PhyE> {
    /// Malformed call: empty buffer, zero-size sub-register, burst too
    /// long, or a frame that cannot fit the transmit arena. Raised
    /// synchronously, nothing is queued.
    InvalidArgument,
    /// The interface's transfer queue cannot admit another descriptor.
    QueueFull,
    /// A synchronous access was attempted while the bus is occupied.
    BusBusy,
    /// Integrity check failed or the completion event did not match the
    /// transfer kind.
    TransferFailed,
    /// Error reported by the physical driver.
    Phy(PhyE),
    /// A completion callback failed while draining.
    Callback(CallbackError),
}

impl<PhyE: fmt::Display> fmt::Display for Error<PhyE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::QueueFull => write!(f, "transfer queue full"),
            Error::BusBusy => write!(f, "bus busy"),
            Error::TransferFailed => write!(f, "transfer failed"),
            Error::Phy(e) => write!(f, "bus driver error: {}", e),
            Error::Callback(e) => write!(f, "callback error: {}", e),
        }
    }
}

impl<PhyE> From<CallbackError> for Error<PhyE> {
    fn from(e: CallbackError) -> Self {
        Error::Callback(e)
    }
}

/// Failure code returned by a completion or event callback.
///
/// The code is opaque to the transport; it is carried back to whoever
/// runs the drain so the application can react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CallbackError(pub u32);

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback failed with code {}", self.0)
    }
}
