//! Unique identity generator.
//!
//! Identities are 63-bit snowflake values:
//!
//! ```text
//! | 41 bits: ms since EPOCH_MS | 10 bits: node id | 12 bits: sequence |
//! ```
//!
//! Each concurrently running generator must be configured with its own node id;
//! that partitions the identity space so instances never collide without talking
//! to each other.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::DeviceIdentity;
use crate::error::{Error, Result};

/// Custom epoch (2010-11-04T01:42:54.657Z) in Unix milliseconds.
pub const EPOCH_MS: i64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const TIMESTAMP_BITS: u32 = 41;

/// Largest node id a generator accepts.
pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;
const MAX_TIMESTAMP: i64 = (1 << TIMESTAMP_BITS) - 1;

const NODE_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + NODE_BITS;

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// What to do when the clock is observed moving backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegressionPolicy {
    /// Fail immediately with [`Error::ClockRegression`].
    #[default]
    Fail,
    /// Block up to the given duration for the clock to catch up, then fail.
    /// The calling thread sleeps while the generator lock is held.
    Wait(Duration),
}

/// Anything that can hand out device identities.
pub trait IdentityGenerator: Send + Sync {
    fn generate(&self) -> Result<DeviceIdentity>;

    /// `true` when `generate` may put the calling thread to sleep. Async
    /// callers should then move the call off the runtime's worker threads.
    fn may_block(&self) -> bool {
        false
    }
}

/// The components packed into an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityParts {
    /// Unix milliseconds
    pub timestamp_ms: i64,
    pub node_id: u16,
    pub sequence: u16,
}

impl IdentityParts {
    pub fn of(id: DeviceIdentity) -> Self {
        let raw = id.value();
        Self {
            timestamp_ms: (raw >> TIMESTAMP_SHIFT) + EPOCH_MS,
            node_id: ((raw >> NODE_SHIFT) & i64::from(MAX_NODE_ID)) as u16,
            sequence: (raw & i64::from(MAX_SEQUENCE)) as u16,
        }
    }
}

#[derive(Debug)]
struct GeneratorState {
    /// Latest raw clock reading, used to detect regression.
    last_observed: i64,
    /// Timestamp (relative to the epoch) embedded in the last identity.
    last_timestamp: i64,
    sequence: u16,
}

/// Time-ordered identity generator for one node.
pub struct SnowflakeGenerator {
    node_id: u16,
    clock: Arc<dyn Clock>,
    policy: RegressionPolicy,
    state: Mutex<GeneratorState>,
}

impl std::fmt::Debug for SnowflakeGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeGenerator")
            .field("node_id", &self.node_id)
            .field("policy", &self.policy)
            .finish()
    }
}

impl SnowflakeGenerator {
    /// Create a generator using the system clock.
    pub fn new(node_id: u16) -> Result<Self> {
        Self::with_clock(node_id, Arc::new(SystemClock))
    }

    pub fn with_clock(node_id: u16, clock: Arc<dyn Clock>) -> Result<Self> {
        if node_id > MAX_NODE_ID {
            return Err(Error::Config(format!(
                "node id {} out of range 0..={}",
                node_id, MAX_NODE_ID
            )));
        }
        Ok(Self {
            node_id,
            clock,
            policy: RegressionPolicy::default(),
            state: Mutex::new(GeneratorState {
                last_observed: i64::MIN,
                last_timestamp: -1,
                sequence: 0,
            }),
        })
    }

    pub fn with_policy(mut self, policy: RegressionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    fn wait_for_clock(&self, last_observed: i64, now: i64) -> Result<i64> {
        let behind_ms = (last_observed - now) as u64;
        let max_wait = match self.policy {
            RegressionPolicy::Fail => return Err(Error::ClockRegression { behind_ms }),
            RegressionPolicy::Wait(max_wait) => max_wait,
        };

        tracing::warn!(behind_ms, "Clock moved backwards, waiting for it to catch up");
        let deadline = Instant::now() + max_wait;
        loop {
            std::thread::sleep(Duration::from_millis(1));
            let now = self.clock.now_millis();
            if now >= last_observed {
                return Ok(now);
            }
            if Instant::now() >= deadline {
                return Err(Error::ClockRegression {
                    behind_ms: (last_observed - now) as u64,
                });
            }
        }
    }
}

impl IdentityGenerator for SnowflakeGenerator {
    fn may_block(&self) -> bool {
        matches!(self.policy, RegressionPolicy::Wait(_))
    }

    fn generate(&self) -> Result<DeviceIdentity> {
        let mut state = self.state.lock();

        let mut now = self.clock.now_millis();
        if now < state.last_observed {
            now = self.wait_for_clock(state.last_observed, now)?;
        }
        state.last_observed = now;

        let relative = now - EPOCH_MS;
        if relative < 0 {
            return Err(Error::Config(format!(
                "clock reads {}ms, before the identity epoch",
                now
            )));
        }

        let mut timestamp = relative.max(state.last_timestamp);
        if timestamp == state.last_timestamp {
            if state.sequence == MAX_SEQUENCE {
                // Sequence exhausted within one tick: move to the next tick
                // instead of reusing a value.
                timestamp += 1;
                state.sequence = 0;
            } else {
                state.sequence += 1;
            }
        } else {
            state.sequence = 0;
        }

        if timestamp > MAX_TIMESTAMP {
            return Err(Error::Config("identity timestamp space exhausted".to_string()));
        }
        state.last_timestamp = timestamp;

        let raw = (timestamp << TIMESTAMP_SHIFT)
            | (i64::from(self.node_id) << NODE_SHIFT)
            | i64::from(state.sequence);
        Ok(DeviceIdentity::new(raw))
    }
}
