//! MS/TP frame model and wire encoding.
//!
//! Wire layout, big-endian length:
//!
//! ```text
//! 0x55 0xFF  type(1)  dest(1)  src(1)  len_hi(1)  len_lo(1)  hdrCRC(1)
//! [ data(len)  dataCRC_lo(1)  dataCRC_hi(1) ]
//! ```
//!
//! The data CRC trailer is present only when `len > 0`.

use crate::crc::{data_crc, header_crc};

/// First preamble octet.
pub const PREAMBLE_55: u8 = 0x55;
/// Second preamble octet.
pub const PREAMBLE_FF: u8 = 0xFF;
/// Preamble plus header plus header CRC.
pub const HEADER_SIZE: usize = 8;
/// Maximum length of the data field.
pub const MAX_DATA_LEN: usize = 501;
/// Reserved broadcast address.
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// The standard MS/TP frame types. Other type octets are proprietary and
/// carried through the framing layer as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Token = 0x00,
    PollForMaster = 0x01,
    ReplyToPollForMaster = 0x02,
    TestRequest = 0x03,
    TestResponse = 0x04,
    BacnetDataExpectingReply = 0x05,
    BacnetDataNotExpectingReply = 0x06,
    ReplyPostponed = 0x07,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Token),
            0x01 => Some(Self::PollForMaster),
            0x02 => Some(Self::ReplyToPollForMaster),
            0x03 => Some(Self::TestRequest),
            0x04 => Some(Self::TestResponse),
            0x05 => Some(Self::BacnetDataExpectingReply),
            0x06 => Some(Self::BacnetDataNotExpectingReply),
            0x07 => Some(Self::ReplyPostponed),
            _ => None,
        }
    }
}

/// A parsed or outbound MS/TP frame.
///
/// `frame_type` keeps the raw type octet so proprietary frames survive the
/// framing layer; [`Frame::kind`] decodes it to a [`FrameType`] where one is
/// defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub destination: u8,
    pub source: u8,
    pub data: Vec<u8>,
}

impl Default for Frame {
    fn default() -> Self {
        Frame {
            frame_type: FrameType::Token as u8,
            destination: 0,
            source: 0,
            data: Vec::new(),
        }
    }
}

impl Frame {
    pub fn new(frame_type: FrameType, destination: u8, source: u8, data: Vec<u8>) -> Self {
        Frame {
            frame_type: frame_type as u8,
            destination,
            source,
            data,
        }
    }

    /// The decoded frame type, or `None` for proprietary/unknown octets.
    pub fn kind(&self) -> Option<FrameType> {
        FrameType::from_u8(self.frame_type)
    }

    /// True iff the frame is addressed to `station`.
    pub fn for_station(&self, station: u8) -> bool {
        self.destination == station
    }

    /// True iff the frame is addressed to `station` or broadcast.
    pub fn for_station_or_broadcast(&self, station: u8) -> bool {
        self.destination == station || self.broadcast()
    }

    /// True iff the frame is a broadcast.
    pub fn broadcast(&self) -> bool {
        self.destination == BROADCAST_ADDRESS
    }

    /// Encode the complete wire image: preamble, header, header CRC, and the
    /// data field with its CRC trailer when present.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.data.len();
        debug_assert!(len <= MAX_DATA_LEN);

        let mut wire = Vec::with_capacity(HEADER_SIZE + len + 2);
        wire.push(PREAMBLE_55);
        wire.push(PREAMBLE_FF);
        wire.push(self.frame_type);
        wire.push(self.destination);
        wire.push(self.source);
        wire.push((len >> 8) as u8);
        wire.push((len & 0xFF) as u8);
        wire.push(header_crc(&wire[2..7]));

        if !self.data.is_empty() {
            wire.extend_from_slice(&self.data);
            let crc = data_crc(&self.data);
            wire.push((crc & 0xFF) as u8);
            wire.push((crc >> 8) as u8);
        }

        wire
    }
}
