//! Tunable behavior of the simulated firmware.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use isp_core::{CommandOpcode, PowerDomain, ResponseStatus};

/// How the mock firmware reacts to traffic.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Whether commands are answered automatically.
    pub auto_respond: bool,
    /// Delay between receiving a command and delivering its response.
    pub response_latency: Duration,
    /// Whether accepted buffers later produce a frame-done event.
    pub auto_frames: bool,
    /// Delay between accepting a buffer and its frame-done event.
    pub frame_latency: Duration,
    /// Commands answered with the given non-success status.
    pub fail: HashMap<CommandOpcode, ResponseStatus>,
    /// Commands whose transmission fails at the transport.
    pub fail_transmit: HashSet<CommandOpcode>,
    /// Commands that are accepted but never answered.
    pub drop_response: HashSet<CommandOpcode>,
    /// Power domains whose transitions fail.
    pub fail_power: HashSet<PowerDomain>,
    /// Probability of a random hardware-fault answer, seeded by `seed`.
    pub fault_rate: f64,
    pub seed: u64,
}

impl Default for MockBehavior {
    fn default() -> Self {
        MockBehavior {
            auto_respond: true,
            response_latency: Duration::from_millis(1),
            auto_frames: true,
            frame_latency: Duration::from_millis(5),
            fail: HashMap::new(),
            fail_transmit: HashSet::new(),
            drop_response: HashSet::new(),
            fail_power: HashSet::new(),
            fault_rate: 0.0,
            seed: 0,
        }
    }
}

impl MockBehavior {
    /// Manual mode: nothing is answered unless the test injects it.
    pub fn manual() -> Self {
        MockBehavior {
            auto_respond: false,
            auto_frames: false,
            ..Default::default()
        }
    }
}
