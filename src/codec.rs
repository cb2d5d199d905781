//! Octet-level receive parser for MS/TP framing.
//!
//! The decoder is fed one octet at a time and walks
//! idle → preamble → header → data. Garbage between frames is discarded while
//! hunting for the `0x55 0xFF` preamble; repeated `0x55` octets keep the
//! hunt armed. CRC failures and oversized lengths surface as invalid-frame
//! events with a description and reset the parser, so the line recovers on
//! the next preamble.

use log::trace;

use crate::crc::{data_crc_accumulate, header_crc_accumulate, DATA_CRC_RESIDUE, HEADER_CRC_RESIDUE};
use crate::frame::{Frame, MAX_DATA_LEN, PREAMBLE_55, PREAMBLE_FF};

/// Type, destination, source, two length octets, header CRC.
const HEADER_OCTETS: usize = 6;

/// Outcome of feeding an octet that completed (or aborted) a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// A complete frame with valid checksums. Unknown frame types are valid
    /// at this layer.
    Frame(Frame),
    /// A malformed frame, with a description of what was wrong.
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Hunting for the first preamble octet.
    Idle,
    /// Saw `0x55`, expecting `0xFF`.
    Preamble2,
    /// Accumulating the six header octets.
    Header,
    /// Accumulating `len` data octets plus the two CRC octets.
    Data { need: usize },
}

/// Incremental frame parser. One instance per receive direction.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    header: [u8; HEADER_OCTETS],
    have: usize,
    data: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            state: DecodeState::Idle,
            header: [0; HEADER_OCTETS],
            have: 0,
            data: Vec::new(),
        }
    }

    /// Feed one received octet. Returns an event when the octet completes a
    /// frame or reveals a malformed one.
    pub fn feed(&mut self, octet: u8) -> Option<DecodeEvent> {
        match self.state {
            DecodeState::Idle => {
                if octet == PREAMBLE_55 {
                    self.state = DecodeState::Preamble2;
                } else {
                    trace!("discarding octet 0x{:02X} while hunting preamble", octet);
                }
                None
            }
            DecodeState::Preamble2 => {
                match octet {
                    PREAMBLE_FF => {
                        self.have = 0;
                        self.state = DecodeState::Header;
                    }
                    // Additional 0x55 octets are leading sync; stay armed.
                    PREAMBLE_55 => {}
                    _ => self.state = DecodeState::Idle,
                }
                None
            }
            DecodeState::Header => {
                self.header[self.have] = octet;
                self.have += 1;
                if self.have < HEADER_OCTETS {
                    return None;
                }
                self.finish_header()
            }
            DecodeState::Data { need } => {
                self.data.push(octet);
                if self.data.len() < need {
                    return None;
                }
                self.state = DecodeState::Idle;
                if data_crc_accumulate(&self.data) != DATA_CRC_RESIDUE {
                    return Some(DecodeEvent::Invalid("data CRC mismatch".to_string()));
                }
                self.data.truncate(need - 2);
                Some(DecodeEvent::Frame(Frame {
                    frame_type: self.header[0],
                    destination: self.header[1],
                    source: self.header[2],
                    data: std::mem::take(&mut self.data),
                }))
            }
        }
    }

    fn finish_header(&mut self) -> Option<DecodeEvent> {
        if header_crc_accumulate(&self.header) != HEADER_CRC_RESIDUE {
            self.state = DecodeState::Idle;
            return Some(DecodeEvent::Invalid("header CRC mismatch".to_string()));
        }

        let len = ((self.header[3] as usize) << 8) | self.header[4] as usize;
        if len > MAX_DATA_LEN {
            self.state = DecodeState::Idle;
            return Some(DecodeEvent::Invalid(format!(
                "data length {} exceeds the {}-octet maximum",
                len, MAX_DATA_LEN
            )));
        }

        if len == 0 {
            self.state = DecodeState::Idle;
            return Some(DecodeEvent::Frame(Frame {
                frame_type: self.header[0],
                destination: self.header[1],
                source: self.header[2],
                data: Vec::new(),
            }));
        }

        self.data = Vec::with_capacity(len + 2);
        self.state = DecodeState::Data { need: len + 2 };
        None
    }
}
