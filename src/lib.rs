//! BACnet MS/TP master-node data link (ASHRAE 135 Clause 9).
//!
//! MS/TP (Master-Slave/Token-Passing) runs over a half-duplex EIA-485 bus.
//! Master nodes cooperatively circulate a token that grants the right to
//! transmit; a node that holds the token may send a bounded number of data
//! frames, must answer data that expects a reply within a fixed window, and
//! periodically polls the address space for masters that joined the bus.
//!
//! This crate implements the master-node half of that protocol:
//!
//! - [`frame`]: the wire frame model (preamble, header, CRC trailer) and the
//!   eight standard frame types.
//! - [`codec`]: an octet-at-a-time receive parser that survives line noise
//!   and resynchronizes on the preamble.
//! - [`master`]: the token-passing state machine itself, with thread-safe
//!   queueing of outbound frames and deferred-reply handling.
//! - [`link`]: the octet source/sink abstraction the state machine is driven
//!   from, with an adapter for any `std::io` stream pair.
//! - [`clock`]: an injectable millisecond clock so protocol timing can be
//!   tested without real waiting.
//!
//! The physical UART, the network layer above the data link, and slave-only
//! nodes are out of scope.
//!
//! # Example
//!
//! ```no_run
//! use std::io;
//! use std::sync::Arc;
//! use mstp_rs::{Frame, MasterNode, SystemClock, UpperLayer};
//!
//! struct Sink;
//!
//! impl UpperLayer for Sink {
//!     fn data_no_reply(&mut self, _frame: &Frame) {}
//!     fn data_needing_reply(&mut self, _frame: &Frame) {}
//! }
//!
//! # fn main() -> mstp_rs::Result<()> {
//! // In production the streams come from the serial port driver.
//! let node = MasterNode::with_streams(
//!     "port0",
//!     io::empty(),
//!     io::sink(),
//!     Arc::new(SystemClock::new()),
//!     5,
//!     1,
//!     Box::new(Sink),
//! )?;
//! let (handle, worker) = node.spawn()?;
//! handle.queue_frame(mstp_rs::FrameType::BacnetDataNotExpectingReply, 12, vec![0x01])?;
//! handle.terminate();
//! worker.join().ok();
//! # Ok(())
//! # }
//! ```

use std::fmt;

pub mod clock;
pub mod codec;
mod crc;
pub mod device;
pub mod frame;
pub mod link;
pub mod master;
mod node;

pub use clock::{Clock, ManualClock, SystemClock};
pub use device::LocalDevice;
pub use frame::{Frame, FrameType};
pub use link::{IoLink, SerialLink};
pub use master::{MasterHandle, MasterNode, MasterState, MstpStats, UpperLayer};

/// Data link error.
#[derive(Debug)]
pub enum MstpError {
    /// A constructor or setter argument is outside its allowed range.
    InvalidConfiguration(String),
    /// The frame type may not be queued for transmission.
    InvalidFrameType(u8),
    /// The payload exceeds the 501-octet MS/TP maximum.
    FrameTooLarge(usize),
    /// Serial link failure.
    Io(std::io::Error),
}

impl fmt::Display for MstpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MstpError::InvalidConfiguration(s) => write!(f, "invalid configuration: {}", s),
            MstpError::InvalidFrameType(t) => write!(f, "cannot queue frame of type 0x{:02X}", t),
            MstpError::FrameTooLarge(n) => {
                write!(f, "frame data of {} octets exceeds the 501-octet maximum", n)
            }
            MstpError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for MstpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MstpError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MstpError {
    fn from(e: std::io::Error) -> Self {
        MstpError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, MstpError>;
