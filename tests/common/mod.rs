//! Shared harness for the simulated-bus tests: an in-memory multi-drop bus,
//! a passive wire monitor, a recording upper layer, and a stepped pair of
//! masters driven on a manual clock. No worker threads and no real sleeping;
//! each test advances the clock one millisecond at a time and calls
//! `do_cycle` directly.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use mstp_rs::codec::{DecodeEvent, FrameDecoder};
use mstp_rs::{Frame, ManualClock, MasterNode, SerialLink, UpperLayer};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

type Rx = Arc<Mutex<VecDeque<u8>>>;

/// Half-duplex multi-drop bus: every octet written by one port shows up in
/// every other port's receive queue.
#[derive(Default)]
pub struct SimBus {
    taps: Mutex<Vec<Rx>>,
}

impl SimBus {
    pub fn new() -> Arc<SimBus> {
        Arc::new(SimBus::default())
    }

    pub fn attach(self: &Arc<Self>) -> BusPort {
        let rx: Rx = Arc::new(Mutex::new(VecDeque::new()));
        self.taps.lock().unwrap().push(Arc::clone(&rx));
        BusPort {
            bus: Arc::clone(self),
            rx,
        }
    }

    fn broadcast_from(&self, sender: &Rx, octets: &[u8]) {
        for tap in self.taps.lock().unwrap().iter() {
            if !Arc::ptr_eq(tap, sender) {
                tap.lock().unwrap().extend(octets.iter().copied());
            }
        }
    }
}

pub struct BusPort {
    bus: Arc<SimBus>,
    rx: Rx,
}

impl BusPort {
    /// Put a hand-built frame on the bus, as a scripted peer would.
    pub fn send(&mut self, frame: &Frame) {
        self.write_all(&frame.encode()).unwrap();
    }
}

impl SerialLink for BusPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().unwrap();
        let mut n = 0;
        while n < buf.len() {
            match rx.pop_front() {
                Some(octet) => {
                    buf[n] = octet;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, octets: &[u8]) -> io::Result<()> {
        self.bus.broadcast_from(&self.rx, octets);
        Ok(())
    }
}

/// Passive tap that reassembles every frame on the bus with the simulated
/// time it was observed.
pub struct WireMonitor {
    port: BusPort,
    decoder: FrameDecoder,
    pub frames: Vec<(u64, Frame)>,
}

impl WireMonitor {
    pub fn new(bus: &Arc<SimBus>) -> Self {
        WireMonitor {
            port: bus.attach(),
            decoder: FrameDecoder::new(),
            frames: Vec::new(),
        }
    }

    pub fn poll(&mut self, now: u64) {
        let mut buf = [0u8; 256];
        loop {
            let n = self.port.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            for &octet in &buf[..n] {
                if let Some(DecodeEvent::Frame(frame)) = self.decoder.feed(octet) {
                    self.frames.push((now, frame));
                }
            }
        }
    }

    /// Destinations of every frame of `kind`, in wire order.
    pub fn destinations_of(&self, kind: mstp_rs::FrameType) -> Vec<(u64, u8)> {
        self.frames
            .iter()
            .filter(|(_, f)| f.kind() == Some(kind))
            .map(|(t, f)| (*t, f.destination))
            .collect()
    }
}

/// Upper layer that records every delivery.
#[derive(Clone, Default)]
pub struct Recorder {
    pub no_reply: Arc<Mutex<Vec<Frame>>>,
    pub needing_reply: Arc<Mutex<Vec<Frame>>>,
}

impl UpperLayer for Recorder {
    fn data_no_reply(&mut self, frame: &Frame) {
        self.no_reply.lock().unwrap().push(frame.clone());
    }

    fn data_needing_reply(&mut self, frame: &Frame) {
        self.needing_reply.lock().unwrap().push(frame.clone());
    }
}

/// A master on the bus with the scenarios' usual settings: 20 ms usage
/// timeout and the given address range.
pub fn master(
    bus: &Arc<SimBus>,
    clock: Arc<ManualClock>,
    station: u8,
    max_master: u8,
) -> (MasterNode, Recorder) {
    let recorder = Recorder::default();
    let mut node = MasterNode::new(
        format!("sim-{}", station),
        bus.attach(),
        clock,
        station,
        0,
        Box::new(recorder.clone()),
    )
    .unwrap();
    node.set_max_master(max_master).unwrap();
    node.set_usage_timeout(20).unwrap();
    (node, recorder)
}

/// Two masters at addresses 1 and 2 cycled in lockstep on a shared clock.
pub struct Pair {
    pub node1: MasterNode,
    pub node2: MasterNode,
    pub rec1: Recorder,
    pub rec2: Recorder,
    pub monitor: WireMonitor,
    pub clock: Arc<ManualClock>,
    pub bus: Arc<SimBus>,
    pub t: u64,
}

impl Pair {
    /// Advance one simulated millisecond and run one cycle on each node.
    pub fn step(&mut self) {
        self.t += 1;
        self.clock.set(self.t);
        self.node1.do_cycle();
        self.node2.do_cycle();
        self.monitor.poll(self.t);
    }
}

/// Bring masters {1, 2} up from a cold bus until both have joined the ring.
pub fn stabilized_pair(max_master: u8) -> Pair {
    init_logging();
    let bus = SimBus::new();
    let clock = Arc::new(ManualClock::new());
    let (node1, rec1) = master(&bus, clock.clone(), 1, max_master);
    let (node2, rec2) = master(&bus, clock.clone(), 2, max_master);
    let monitor = WireMonitor::new(&bus);
    let mut pair = Pair {
        node1,
        node2,
        rec1,
        rec2,
        monitor,
        clock,
        bus,
        t: 0,
    };

    for _ in 0..5000 {
        pair.step();
        if pair.node1.has_received_token()
            && pair.node2.has_received_token()
            && !pair.node1.sole_master()
            && !pair.node2.sole_master()
        {
            return pair;
        }
    }
    panic!("masters 1 and 2 failed to stabilize within 5 simulated seconds");
}
