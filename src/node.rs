//! Wire-facing plumbing shared by the master state machine: the receive
//! loop, silence/event accounting, and the transmit path.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::clock::Clock;
use crate::codec::{DecodeEvent, FrameDecoder};
use crate::frame::Frame;
use crate::link::SerialLink;

/// Owns the serial link, the frame decoder, and the clock for one node.
///
/// `poll_link` drains whatever the transceiver has buffered without
/// blocking. Every received octet resets the silence timer and bumps the
/// event counter; decoded frames and framing failures are latched for the
/// state machine to consume as transitions.
pub(crate) struct NodeCore {
    port_id: String,
    pub(crate) this_station: u8,
    link: Box<dyn SerialLink>,
    clock: Arc<dyn Clock>,
    decoder: FrameDecoder,
    /// Octets read from the link but not yet fed to the decoder. Feeding
    /// stops while a decoded frame is pending so back-to-back frames each
    /// get their own cycle.
    pending: VecDeque<u8>,

    /// Octets seen on the wire since the counter was last reset.
    pub(crate) event_count: u32,
    last_octet_at: u64,

    pub(crate) received_valid_frame: bool,
    pub(crate) frame: Frame,
    pub(crate) received_invalid_frame: Option<String>,

    // Wire-level counters.
    pub(crate) frames_in: u64,
    pub(crate) frames_out: u64,
    pub(crate) invalid_frames: u64,
    /// Bitmap of master addresses observed as frame sources.
    pub(crate) discovered_masters: u128,
}

impl NodeCore {
    pub(crate) fn new(
        port_id: String,
        link: Box<dyn SerialLink>,
        clock: Arc<dyn Clock>,
        this_station: u8,
    ) -> Self {
        let last_octet_at = clock.millis();
        NodeCore {
            port_id,
            this_station,
            link,
            clock,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            event_count: 0,
            last_octet_at,
            received_valid_frame: false,
            frame: Frame::default(),
            received_invalid_frame: None,
            frames_in: 0,
            frames_out: 0,
            invalid_frames: 0,
            discovered_masters: 1u128 << this_station,
        }
    }

    pub(crate) fn port_id(&self) -> &str {
        &self.port_id
    }

    /// Current time on the injected clock.
    pub(crate) fn now(&self) -> u64 {
        self.clock.millis()
    }

    /// Milliseconds since the last octet crossed the wire in either
    /// direction. Saturating, so a clock regression reads as zero silence
    /// rather than underflowing.
    pub(crate) fn silence(&self) -> u64 {
        self.clock.millis().saturating_sub(self.last_octet_at)
    }

    /// Timestamp of the last wire activity.
    pub(crate) fn last_octet_at(&self) -> u64 {
        self.last_octet_at
    }

    /// Drain the link and advance the decoder. Never blocks.
    pub(crate) fn poll_link(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.link.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending.extend(&buf[..n]);
                    self.event_count = self.event_count.saturating_add(n as u32);
                    self.last_octet_at = self.clock.millis();
                }
                Err(e) => {
                    warn!("{}: serial read failed: {}", self.port_id, e);
                    break;
                }
            }
        }

        // Hold off further decoding while a frame waits to be consumed.
        while !self.received_valid_frame {
            let Some(octet) = self.pending.pop_front() else {
                break;
            };
            match self.decoder.feed(octet) {
                None => {}
                Some(DecodeEvent::Frame(frame)) => {
                    trace!(
                        "{}: RX type=0x{:02X} dest={} src={} len={}",
                        self.port_id,
                        frame.frame_type,
                        frame.destination,
                        frame.source,
                        frame.data.len()
                    );
                    self.frames_in += 1;
                    if frame.source <= 127 {
                        self.discovered_masters |= 1u128 << frame.source;
                    }
                    self.frame = frame;
                    self.received_valid_frame = true;
                }
                Some(DecodeEvent::Invalid(description)) => {
                    debug!("{}: invalid frame: {}", self.port_id, description);
                    self.invalid_frames += 1;
                    self.received_invalid_frame = Some(description);
                }
            }
        }
    }

    /// Transmit one frame. Write failures are logged here; the state machine
    /// treats transmission as infallible and carries on.
    pub(crate) fn send_frame(&mut self, frame: &Frame) {
        trace!(
            "{}: TX type=0x{:02X} dest={} len={}",
            self.port_id,
            frame.frame_type,
            frame.destination,
            frame.data.len()
        );
        if let Err(e) = self.link.write_all(&frame.encode()) {
            error!("{}: serial write failed: {}", self.port_id, e);
        }
        self.last_octet_at = self.clock.millis();
        self.frames_out += 1;
    }
}
