//! Octet source/sink abstraction over the serial bus.
//!
//! The state machine never blocks on I/O: reads return "no data" instead of
//! waiting, and a whole frame is handed to the link in one write. The link
//! is owned exclusively by the node's cycle worker, which serializes writes
//! by construction.

use std::io::{self, ErrorKind, Read, Write};

/// Byte-oriented full-duplex channel to the EIA-485 transceiver.
pub trait SerialLink: Send {
    /// Non-blocking read of received octets. Returns `Ok(0)` when nothing is
    /// pending.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the complete octet image of one frame.
    fn write_all(&mut self, octets: &[u8]) -> io::Result<()>;
}

/// Adapter over a `std::io` stream pair.
///
/// Would-block and timeout conditions on the reader are reported as "no
/// data" so the cycle loop keeps spinning instead of erroring; everything
/// else propagates.
pub struct IoLink<R, W> {
    input: R,
    output: W,
}

impl<R, W> IoLink<R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    pub fn new(input: R, output: W) -> Self {
        IoLink { input, output }
    }
}

impl<R, W> SerialLink for IoLink<R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.input.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, octets: &[u8]) -> io::Result<()> {
        self.output.write_all(octets)?;
        self.output.flush()
    }
}
