//! MS/TP master-node state machine.
//!
//! A master cycles through eight states. It idles until it is handed the
//! token, transmits a bounded number of queued data frames while it holds
//! it, waits for replies where one is expected, and then passes the token to
//! its successor. Token maintenance periodically polls the address range
//! between this station and the successor so newly attached masters join
//! the ring; silence-based recovery regenerates a lost token with a
//! per-address stagger so exactly one master wins.
//!
//! The state machine is driven by [`MasterNode::do_cycle`], which never
//! blocks: octet reads are non-blocking and every timeout is expressed
//! through the silence timer or an absolute deadline on the injected clock.
//! A cycle may ride through several states when the transitions do not have
//! to wait for the wire.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::clock::Clock;
use crate::device::{LocalDevice, PROP_MAX_INFO_FRAMES, PROP_MAX_MASTER};
use crate::frame::{Frame, FrameType, MAX_DATA_LEN};
use crate::link::{IoLink, SerialLink};
use crate::node::NodeCore;
use crate::{MstpError, Result};

/// Silence that declares the token lost (ms).
pub const NO_TOKEN: u64 = 500;
/// Silence after a data-expecting-reply send before the request is declared
/// failed (ms).
pub const REPLY_TIMEOUT: u64 = 255;
/// Window within which a data-expecting-reply must be answered (ms).
pub const REPLY_DELAY: u64 = 250;
/// Per-address stagger used when regenerating the token (ms).
pub const SLOT: u64 = 10;
/// Token possessions between maintenance polls.
pub const POLL: u32 = 50;
/// Re-sends of an unanswered token before hunting for a new successor.
pub const RETRY_TOKEN: u32 = 1;
/// Octets that count as real activity from the successor.
pub const MIN_OCTETS: u32 = 4;
/// Highest master address.
pub const MAX_MASTER: u8 = 127;
/// Default data frames per token possession.
pub const DEFAULT_MAX_INFO_FRAMES: u32 = 8;
/// Default silence allowed to the successor before a token re-send (ms).
pub const DEFAULT_USAGE_TIMEOUT: u64 = 20;

/// The master-node states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Idle,
    UseToken,
    WaitForReply,
    DoneWithToken,
    PassToken,
    NoToken,
    PollForMaster,
    AnswerDataRequest,
}

/// Hooks through which received application data is delivered upward.
///
/// Both are invoked synchronously from the cycle worker and must not block.
/// A frame delivered through [`data_needing_reply`](Self::data_needing_reply)
/// must be answered via [`MasterHandle::set_reply_frame`]; an answer that
/// misses the reply window is announced as postponed on the wire and sent
/// under the next token possession instead.
pub trait UpperLayer: Send {
    /// Unsolicited data and test responses.
    fn data_no_reply(&mut self, frame: &Frame);
    /// Data that expects an answer within the reply window.
    fn data_needing_reply(&mut self, frame: &Frame);
}

/// The reply slot, guarded together with the "still answering" decision so a
/// late [`set_reply_frame`](MasterHandle::set_reply_frame) atomically either
/// lands in the slot or falls back to the transmit queue.
struct ReplySlot {
    answering: bool,
    frame: Option<Frame>,
}

struct SharedState {
    this_station: u8,
    frames_to_send: Mutex<VecDeque<Frame>>,
    reply: Mutex<ReplySlot>,
    received_token: AtomicBool,
    terminated: AtomicBool,
}

impl SharedState {
    fn push_frame(&self, frame_type: FrameType, destination: u8, data: Vec<u8>) -> Result<()> {
        if data.len() > MAX_DATA_LEN {
            return Err(MstpError::FrameTooLarge(data.len()));
        }
        let frame = Frame::new(frame_type, destination, self.this_station, data);
        self.frames_to_send
            .lock()
            .expect("transmit queue mutex poisoned")
            .push_back(frame);
        Ok(())
    }

    fn queue_frame(&self, frame_type: FrameType, destination: u8, data: Vec<u8>) -> Result<()> {
        if !matches!(
            frame_type,
            FrameType::BacnetDataExpectingReply
                | FrameType::BacnetDataNotExpectingReply
                | FrameType::TestRequest
        ) {
            return Err(MstpError::InvalidFrameType(frame_type as u8));
        }
        self.push_frame(frame_type, destination, data)
    }

    fn set_reply_frame(&self, frame_type: FrameType, destination: u8, data: Vec<u8>) -> Result<()> {
        if !matches!(
            frame_type,
            FrameType::BacnetDataExpectingReply
                | FrameType::BacnetDataNotExpectingReply
                | FrameType::TestRequest
                | FrameType::TestResponse
        ) {
            return Err(MstpError::InvalidFrameType(frame_type as u8));
        }
        if data.len() > MAX_DATA_LEN {
            return Err(MstpError::FrameTooLarge(data.len()));
        }

        let mut reply = self.reply.lock().expect("reply slot mutex poisoned");
        if reply.answering {
            // Still inside the reply window; answer on the spot.
            reply.frame = Some(Frame::new(frame_type, destination, self.this_station, data));
            Ok(())
        } else {
            // The window has closed and a postponement went out; deliver the
            // answer under the next token possession.
            drop(reply);
            self.push_frame(frame_type, destination, data)
        }
    }
}

/// Cloneable, thread-safe front door to a running [`MasterNode`].
#[derive(Clone)]
pub struct MasterHandle {
    shared: Arc<SharedState>,
}

impl MasterHandle {
    /// Queue an application frame for transmission under token possession.
    /// Only `BacnetDataExpectingReply`, `BacnetDataNotExpectingReply`, and
    /// `TestRequest` may be queued.
    pub fn queue_frame(&self, frame_type: FrameType, destination: u8, data: Vec<u8>) -> Result<()> {
        self.shared.queue_frame(frame_type, destination, data)
    }

    /// Answer a frame delivered through [`UpperLayer::data_needing_reply`].
    pub fn set_reply_frame(
        &self,
        frame_type: FrameType,
        destination: u8,
        data: Vec<u8>,
    ) -> Result<()> {
        self.shared.set_reply_frame(frame_type, destination, data)
    }

    /// True once this node has ever been handed the token (or declared
    /// itself sole master), i.e. it has joined the ring.
    pub fn has_received_token(&self) -> bool {
        self.shared.received_token.load(Ordering::SeqCst)
    }

    /// Stop the cycle worker before its next cycle. A pending reply is
    /// dropped.
    pub fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
    }
}

/// Snapshot of wire and protocol counters.
#[derive(Debug, Clone, Default)]
pub struct MstpStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub invalid_frames: u64,
    pub tokens_received: u64,
    pub token_pass_failures: u64,
    pub reply_timeouts: u64,
    pub sole_master: bool,
    pub next_station: u8,
    pub poll_station: u8,
    pub silence_ms: u64,
    pub send_queue_len: usize,
    /// Bitmap of master addresses seen as frame sources, self included.
    pub discovered_masters: u128,
    pub master_count: u8,
}

/// An MS/TP master node bound to one serial link.
pub struct MasterNode {
    core: NodeCore,
    state: MasterState,

    /// Successor this station passes the token to; equals this station while
    /// the successor is unknown.
    next_station: u8,
    /// Address of the last Poll For Master sent during maintenance.
    poll_station: u8,
    retry_count: u32,
    /// Set while this node is the only known master on the segment.
    sole_master: bool,
    token_count: u32,
    frame_count: u32,

    max_master: u8,
    max_info_frames: u32,
    usage_timeout: u64,

    reply_deadline: u64,
    reply_source: u8,

    activity: bool,

    tokens_received: u64,
    token_pass_failures: u64,
    reply_timeouts: u64,

    shared: Arc<SharedState>,
    upper: Box<dyn UpperLayer>,
}

impl MasterNode {
    /// Create a master node on `link`. `retry_count` seeds the transmission
    /// retry counter used for token and poll re-sends.
    pub fn new<L>(
        port_id: impl Into<String>,
        link: L,
        clock: Arc<dyn Clock>,
        this_station: u8,
        retry_count: u32,
        upper: Box<dyn UpperLayer>,
    ) -> Result<MasterNode>
    where
        L: SerialLink + 'static,
    {
        if this_station > MAX_MASTER {
            return Err(MstpError::InvalidConfiguration(format!(
                "station address {} is greater than {}",
                this_station, MAX_MASTER
            )));
        }

        let shared = Arc::new(SharedState {
            this_station,
            frames_to_send: Mutex::new(VecDeque::new()),
            reply: Mutex::new(ReplySlot {
                answering: false,
                frame: None,
            }),
            received_token: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });

        Ok(MasterNode {
            core: NodeCore::new(port_id.into(), Box::new(link), clock, this_station),
            state: MasterState::Idle,
            next_station: this_station,
            poll_station: this_station,
            retry_count,
            sole_master: false,
            // Starting at the poll interval makes the first token possession
            // run the maintenance arm.
            token_count: POLL,
            frame_count: 0,
            max_master: MAX_MASTER,
            max_info_frames: DEFAULT_MAX_INFO_FRAMES,
            usage_timeout: DEFAULT_USAGE_TIMEOUT,
            reply_deadline: 0,
            reply_source: 0,
            activity: false,
            tokens_received: 0,
            token_pass_failures: 0,
            reply_timeouts: 0,
            shared,
            upper,
        })
    }

    /// Create a master node over a `std::io` stream pair, as handed out by
    /// serial port drivers. The input stream must be non-blocking or carry a
    /// read timeout.
    pub fn with_streams<R, W>(
        port_id: impl Into<String>,
        input: R,
        output: W,
        clock: Arc<dyn Clock>,
        this_station: u8,
        retry_count: u32,
        upper: Box<dyn UpperLayer>,
    ) -> Result<MasterNode>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::new(
            port_id,
            IoLink::new(input, output),
            clock,
            this_station,
            retry_count,
            upper,
        )
    }

    /// Highest address this node will poll for masters.
    pub fn set_max_master(&mut self, max_master: u8) -> Result<()> {
        if max_master > MAX_MASTER {
            return Err(MstpError::InvalidConfiguration(format!(
                "max-master {} is greater than {}",
                max_master, MAX_MASTER
            )));
        }
        if max_master < self.core.this_station {
            return Err(MstpError::InvalidConfiguration(format!(
                "max-master {} is below this station's address {}",
                max_master, self.core.this_station
            )));
        }
        self.max_master = max_master;
        Ok(())
    }

    /// Data frames this node may send per token possession.
    pub fn set_max_info_frames(&mut self, max_info_frames: u32) -> Result<()> {
        if max_info_frames < 1 {
            return Err(MstpError::InvalidConfiguration(
                "max-info-frames cannot be less than 1".to_string(),
            ));
        }
        self.max_info_frames = max_info_frames;
        Ok(())
    }

    /// Silence allowed to the successor before the token is re-sent, in the
    /// protocol's 20..=100 ms range.
    pub fn set_usage_timeout(&mut self, usage_timeout: u64) -> Result<()> {
        if !(20..=100).contains(&usage_timeout) {
            return Err(MstpError::InvalidConfiguration(format!(
                "usage timeout {} ms is outside 20..=100",
                usage_timeout
            )));
        }
        self.usage_timeout = usage_timeout;
        Ok(())
    }

    /// Publish the link-layer properties to the device object.
    pub fn initialize(&mut self, device: &mut LocalDevice) {
        device.write_unsigned(PROP_MAX_MASTER, u32::from(self.max_master));
        device.write_unsigned(PROP_MAX_INFO_FRAMES, self.max_info_frames);
        info!(
            "{}: station {} on line, max-master {}, max-info-frames {}",
            self.core.port_id(),
            self.core.this_station,
            self.max_master,
            self.max_info_frames
        );
    }

    /// A cloneable handle for producers and supervisors.
    pub fn handle(&self) -> MasterHandle {
        MasterHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// See [`MasterHandle::queue_frame`].
    pub fn queue_frame(&self, frame_type: FrameType, destination: u8, data: Vec<u8>) -> Result<()> {
        self.shared.queue_frame(frame_type, destination, data)
    }

    /// See [`MasterHandle::set_reply_frame`].
    pub fn set_reply_frame(
        &self,
        frame_type: FrameType,
        destination: u8,
        data: Vec<u8>,
    ) -> Result<()> {
        self.shared.set_reply_frame(frame_type, destination, data)
    }

    /// See [`MasterHandle::has_received_token`].
    pub fn has_received_token(&self) -> bool {
        self.shared.received_token.load(Ordering::SeqCst)
    }

    /// Current state, for observation and tests.
    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn sole_master(&self) -> bool {
        self.sole_master
    }

    pub fn stats(&self) -> MstpStats {
        MstpStats {
            frames_in: self.core.frames_in,
            frames_out: self.core.frames_out,
            invalid_frames: self.core.invalid_frames,
            tokens_received: self.tokens_received,
            token_pass_failures: self.token_pass_failures,
            reply_timeouts: self.reply_timeouts,
            sole_master: self.sole_master,
            next_station: self.next_station,
            poll_station: self.poll_station,
            silence_ms: self.core.silence(),
            send_queue_len: self
                .shared
                .frames_to_send
                .lock()
                .expect("transmit queue mutex poisoned")
                .len(),
            discovered_masters: self.core.discovered_masters,
            master_count: self.core.discovered_masters.count_ones() as u8,
        }
    }

    /// Zero the counters. Knowledge of discovered masters is kept.
    pub fn reset_stats(&mut self) {
        self.core.frames_in = 0;
        self.core.frames_out = 0;
        self.core.invalid_frames = 0;
        self.tokens_received = 0;
        self.token_pass_failures = 0;
        self.reply_timeouts = 0;
    }

    /// Run one cycle: drain the link, then evaluate the state machine.
    /// Returns whether the cycle did protocol work, so a driver loop can
    /// back off when the bus is quiet.
    pub fn do_cycle(&mut self) -> bool {
        self.activity = false;
        self.core.poll_link();

        if self.state == MasterState::Idle {
            self.idle();
        }
        if self.state == MasterState::UseToken {
            self.use_token();
        }
        if self.state == MasterState::WaitForReply {
            self.wait_for_reply();
        }
        if self.state == MasterState::DoneWithToken {
            self.done_with_token();
        }
        if self.state == MasterState::PassToken {
            self.pass_token();
        }
        if self.state == MasterState::NoToken {
            self.no_token();
        }
        if self.state == MasterState::PollForMaster {
            self.poll_for_master();
        }
        if self.state == MasterState::AnswerDataRequest {
            self.answer_data_request();
        }

        self.activity
    }

    /// Drive cycles until terminated. An idle cycle sleeps for a millisecond
    /// so a quiet bus does not spin a core.
    pub fn run(mut self) {
        debug!("{}: cycle worker running", self.core.port_id());
        while !self.shared.terminated.load(Ordering::SeqCst) {
            if !self.do_cycle() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        debug!("{}: cycle worker stopped", self.core.port_id());
    }

    /// Move the node onto a dedicated worker thread.
    pub fn spawn(self) -> Result<(MasterHandle, JoinHandle<()>)> {
        let handle = self.handle();
        let name = format!("mstp-{}", self.core.port_id());
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || self.run())?;
        Ok((handle, join))
    }

    fn adjacent(&self, station: u8) -> u8 {
        let modulus = u16::from(self.max_master) + 1;
        ((u16::from(station) + 1) % modulus) as u8
    }

    fn send_immediate(&mut self, frame_type: FrameType, destination: u8) {
        let frame = Frame::new(frame_type, destination, self.core.this_station, Vec::new());
        self.core.send_frame(&frame);
    }

    fn idle(&mut self) {
        if self.core.silence() >= NO_TOKEN {
            debug!("{} idle:LostToken", self.core.this_station);
            self.state = MasterState::NoToken;
            self.activity = true;
        } else if let Some(description) = self.core.received_invalid_frame.take() {
            debug!(
                "{} idle:ReceivedInvalidFrame: {}",
                self.core.this_station, description
            );
            self.activity = true;
        } else if self.core.received_valid_frame {
            self.dispatch_idle_frame();
            self.core.received_valid_frame = false;
            self.activity = true;
        }
    }

    fn dispatch_idle_frame(&mut self) {
        let ts = self.core.this_station;
        let frame = std::mem::take(&mut self.core.frame);

        let Some(kind) = frame.kind() else {
            debug!("{} idle:UnknownFrameType 0x{:02X}", ts, frame.frame_type);
            return;
        };

        if frame.broadcast()
            && matches!(
                kind,
                FrameType::Token | FrameType::BacnetDataExpectingReply | FrameType::TestRequest
            )
        {
            debug!("{} idle:UnwantedBroadcast {:?}", ts, kind);
        } else if frame.for_station(ts) && kind == FrameType::Token {
            debug!("{} idle:ReceivedToken", ts);
            self.shared.received_token.store(true, Ordering::SeqCst);
            self.tokens_received += 1;
            self.frame_count = 0;
            self.sole_master = false;
            self.state = MasterState::UseToken;
        } else if frame.for_station(ts) && kind == FrameType::PollForMaster {
            debug!("{} idle:ReceivedPFM", ts);
            self.send_immediate(FrameType::ReplyToPollForMaster, frame.source);
        } else if frame.for_station_or_broadcast(ts)
            && matches!(
                kind,
                FrameType::BacnetDataNotExpectingReply | FrameType::TestResponse
            )
        {
            debug!("{} idle:ReceivedDataNoReply", ts);
            self.upper.data_no_reply(&frame);
        } else if frame.for_station(ts)
            && matches!(
                kind,
                FrameType::BacnetDataExpectingReply | FrameType::TestRequest
            )
        {
            debug!("{} idle:ReceivedDataNeedingReply", ts);
            self.upper.data_needing_reply(&frame);
            self.reply_source = frame.source;
            self.reply_deadline = self.core.last_octet_at() + REPLY_DELAY;
            let mut reply = self.shared.reply.lock().expect("reply slot mutex poisoned");
            reply.answering = true;
            reply.frame = None;
            self.state = MasterState::AnswerDataRequest;
        } else {
            debug!("{} idle:frame-other {:?}", ts, kind);
        }
    }

    fn use_token(&mut self) {
        let frame_to_send = self
            .shared
            .frames_to_send
            .lock()
            .expect("transmit queue mutex poisoned")
            .pop_front();

        let Some(frame) = frame_to_send else {
            debug!("{} useToken:NothingToSend", self.core.this_station);
            self.frame_count = self.max_info_frames;
            self.state = MasterState::DoneWithToken;
            return;
        };

        self.activity = true;
        match frame.kind() {
            Some(FrameType::TestResponse) | Some(FrameType::BacnetDataNotExpectingReply) => {
                debug!("{} useToken:SendNoWait", self.core.this_station);
                self.state = MasterState::DoneWithToken;
            }
            Some(FrameType::TestRequest) | Some(FrameType::BacnetDataExpectingReply) => {
                debug!("{} useToken:SendAndWait", self.core.this_station);
                self.state = MasterState::WaitForReply;
            }
            _ => {
                error!(
                    "{} useToken: unsendable frame type 0x{:02X} in queue",
                    self.core.this_station, frame.frame_type
                );
                self.state = MasterState::DoneWithToken;
                return;
            }
        }

        self.core.send_frame(&frame);
        self.frame_count += 1;
    }

    fn wait_for_reply(&mut self) {
        let ts = self.core.this_station;

        if self.core.silence() > REPLY_TIMEOUT {
            // The request is assumed to have failed.
            debug!("{} waitForReply:ReplyTimeout", ts);
            self.reply_timeouts += 1;
            self.frame_count = self.max_info_frames;
            self.state = MasterState::DoneWithToken;
        } else if let Some(description) = self.core.received_invalid_frame.take() {
            debug!("{} waitForReply:InvalidFrame: {}", ts, description);
            self.state = MasterState::DoneWithToken;
            self.activity = true;
        } else if self.core.received_valid_frame {
            self.activity = true;
            let frame = std::mem::take(&mut self.core.frame);
            let kind = frame.kind();

            if frame.for_station(ts) {
                if matches!(
                    kind,
                    Some(FrameType::TestResponse) | Some(FrameType::BacnetDataNotExpectingReply)
                ) {
                    debug!("{} waitForReply:ReceivedReply", ts);
                    self.upper.data_no_reply(&frame);
                } else if kind == Some(FrameType::ReplyPostponed) {
                    // The peer will answer under a later token possession.
                    debug!("{} waitForReply:ReceivedPostpone", ts);
                }
                self.state = MasterState::DoneWithToken;
            } else if !matches!(
                kind,
                Some(FrameType::TestResponse) | Some(FrameType::BacnetDataNotExpectingReply)
            ) {
                // May indicate the presence of multiple tokens.
                debug!("{} waitForReply:ReceivedUnexpectedFrame", ts);
                self.state = MasterState::Idle;
            }

            self.core.received_valid_frame = false;
        }
    }

    /// Sends another data frame, passes the token, or starts a Poll For
    /// Master cycle. Branch order is load-bearing: the predicates overlap
    /// and rely on first-match-wins.
    fn done_with_token(&mut self) {
        let ts = self.core.this_station;
        self.activity = true;

        if self.frame_count < self.max_info_frames {
            debug!("{} doneWithToken:SendAnotherFrame", ts);
            self.state = MasterState::UseToken;
        } else if !self.sole_master && self.next_station == ts {
            debug!("{} doneWithToken:NextStationUnknown", ts);
            self.poll_station = self.adjacent(ts);
            self.send_immediate(FrameType::PollForMaster, self.poll_station);
            self.retry_count = 0;
            self.state = MasterState::PollForMaster;
        } else if self.token_count < POLL - 1 && self.sole_master {
            debug!("{} doneWithToken:SoleMaster", ts);
            self.frame_count = 0;
            self.token_count += 1;
            self.state = MasterState::UseToken;
        } else if (self.token_count < POLL - 1 && !self.sole_master)
            || self.next_station == self.adjacent(ts)
        {
            debug!("{} doneWithToken:SendToken", ts);
            self.token_count += 1;
            self.send_immediate(FrameType::Token, self.next_station);
            self.retry_count = 0;
            self.core.event_count = 0;
            self.state = MasterState::PassToken;
        } else if self.token_count >= POLL - 1 && self.adjacent(self.poll_station) != self.next_station
        {
            debug!("{} doneWithToken:SendMaintenancePFM", ts);
            self.poll_station = self.adjacent(self.poll_station);
            self.send_immediate(FrameType::PollForMaster, self.poll_station);
            self.retry_count = 0;
            self.state = MasterState::PollForMaster;
        } else if self.token_count >= POLL - 1
            && self.adjacent(self.poll_station) == self.next_station
            && !self.sole_master
        {
            debug!("{} doneWithToken:ResetMaintenancePFM", ts);
            self.poll_station = ts;
            self.send_immediate(FrameType::Token, self.next_station);
            self.retry_count = 0;
            self.core.event_count = 0;
            self.token_count = 1;
            self.state = MasterState::PassToken;
        } else if self.token_count >= POLL - 1
            && self.adjacent(self.poll_station) == self.next_station
            && self.sole_master
        {
            debug!("{} doneWithToken:SoleMasterRestartMaintenancePFM", ts);
            self.poll_station = self.adjacent(self.next_station);
            self.send_immediate(FrameType::PollForMaster, self.poll_station);
            self.next_station = ts;
            self.retry_count = 0;
            self.core.event_count = 0;
            self.token_count = 1;
            self.state = MasterState::PollForMaster;
        }
    }

    /// Listens for the successor to begin using the token this node just
    /// passed.
    fn pass_token(&mut self) {
        let ts = self.core.this_station;
        self.activity = true;
        let silence = self.core.silence();

        if silence < self.usage_timeout && self.core.event_count > MIN_OCTETS {
            debug!("{} passToken:SawTokenUser", ts);
            self.state = MasterState::Idle;
        } else if silence >= self.usage_timeout && self.retry_count < RETRY_TOKEN {
            debug!("{} passToken:RetrySendToken", ts);
            self.retry_count += 1;
            self.send_immediate(FrameType::Token, self.next_station);
            self.core.event_count = 0;
        } else if silence >= self.usage_timeout && self.retry_count >= RETRY_TOKEN {
            debug!("{} passToken:FindNewSuccessor", ts);
            self.token_pass_failures += 1;
            self.poll_station = self.adjacent(self.next_station);
            self.send_immediate(FrameType::PollForMaster, self.poll_station);
            self.next_station = ts;
            self.retry_count = 0;
            self.token_count = 0;
            self.core.event_count = 0;
            self.state = MasterState::PollForMaster;
        }
    }

    /// Entered when the silence timer says the token is gone. The timeout
    /// keeps running to decide whether this node may create a new one; the
    /// per-address slot stagger arbitrates between competing masters.
    fn no_token(&mut self) {
        let ts = self.core.this_station;
        let silence = self.core.silence();
        let delay = NO_TOKEN + SLOT * u64::from(ts);

        if silence < delay && self.core.event_count > MIN_OCTETS {
            debug!("{} noToken:SawFrame", ts);
            self.state = MasterState::Idle;
            self.activity = true;
        } else if (silence >= delay && silence < delay + SLOT)
            // Silence is beyond every station's slot.
            || silence > NO_TOKEN + SLOT * (u64::from(self.max_master) + 1)
        {
            debug!("{} noToken:GenerateToken", ts);
            self.poll_station = self.adjacent(ts);
            self.send_immediate(FrameType::PollForMaster, self.poll_station);
            self.next_station = ts;
            self.token_count = 0;
            self.retry_count = 0;
            self.core.event_count = 0;
            self.state = MasterState::PollForMaster;
            self.activity = true;
        }
    }

    /// Listens for a reply to a previously sent Poll For Master in order to
    /// find a successor.
    fn poll_for_master(&mut self) {
        let ts = self.core.this_station;

        if self.core.received_valid_frame {
            let frame = std::mem::take(&mut self.core.frame);
            if frame.for_station(ts) && frame.kind() == Some(FrameType::ReplyToPollForMaster) {
                debug!("{} pollForMaster:ReceivedReplyToPFM", ts);
                self.sole_master = false;
                self.next_station = frame.source;
                self.core.event_count = 0;
                self.send_immediate(FrameType::Token, self.next_station);
                self.poll_station = ts;
                self.token_count = 0;
                self.retry_count = 0;
                self.core.received_valid_frame = false;
                self.state = MasterState::PassToken;
            } else {
                debug!("{} pollForMaster:ReceivedUnexpectedFrame", ts);
                self.core.received_valid_frame = false;
                self.state = MasterState::Idle;
            }
            self.activity = true;
        } else if self.sole_master
            && (self.core.silence() >= self.usage_timeout
                || self.core.received_invalid_frame.is_some())
        {
            debug!("{} pollForMaster:SoleMaster", ts);
            self.frame_count = 0;
            self.core.received_invalid_frame = None;
            self.state = MasterState::UseToken;
            self.activity = true;
        } else if !self.sole_master {
            let long_condition = self.core.silence() >= self.usage_timeout
                || self.core.received_invalid_frame.is_some();
            if self.next_station != ts && long_condition {
                debug!("{} pollForMaster:DoneWithPFM", ts);
                self.core.event_count = 0;
                self.send_immediate(FrameType::Token, self.next_station);
                self.retry_count = 0;
                self.core.received_invalid_frame = None;
                self.state = MasterState::PassToken;
                self.activity = true;
            } else if self.next_station == ts {
                if self.adjacent(self.poll_station) != ts && long_condition {
                    debug!("{} pollForMaster:SendNextPFM", ts);
                    self.poll_station = self.adjacent(self.poll_station);
                    self.send_immediate(FrameType::PollForMaster, self.poll_station);
                    self.retry_count = 0;
                    self.core.received_invalid_frame = None;
                    self.activity = true;
                } else if self.adjacent(self.poll_station) == ts && long_condition {
                    debug!("{} pollForMaster:DeclareSoleMaster", ts);
                    self.shared.received_token.store(true, Ordering::SeqCst);
                    self.sole_master = true;
                    self.frame_count = 0;
                    self.core.received_invalid_frame = None;
                    self.state = MasterState::UseToken;
                    self.activity = true;
                }
            }
        }
    }

    /// Entered when a frame expecting a reply was received. The upper layer
    /// races the reply window; the slot mutex makes the outcome atomic.
    fn answer_data_request(&mut self) {
        let ts = self.core.this_station;
        let mut reply = self.shared.reply.lock().expect("reply slot mutex poisoned");

        if let Some(frame) = reply.frame.take() {
            debug!("{} answerDataRequest:Reply", ts);
            self.core.send_frame(&frame);
            reply.answering = false;
            self.state = MasterState::Idle;
            self.activity = true;
        } else {
            let now = self.core.now();
            if self.reply_deadline < now {
                debug!("{} answerDataRequest:DeferredReply", ts);
                let postponed = Frame::new(FrameType::ReplyPostponed, self.reply_source, ts, Vec::new());
                self.core.send_frame(&postponed);
                reply.answering = false;
                self.state = MasterState::Idle;
                self.activity = true;
            } else {
                // A host clock moved backwards would otherwise stall this
                // state indefinitely; pull the deadline back into range.
                let remaining = self.reply_deadline - now;
                if remaining > REPLY_DELAY {
                    warn!(
                        "{} answerDataRequest: clock moved back {} ms, correcting reply deadline",
                        ts,
                        remaining - REPLY_DELAY
                    );
                    self.reply_deadline = now + REPLY_DELAY;
                }
            }
        }
    }
}
