use std::{
    fmt,
    str::FromStr,
    thread::sleep,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Custom epoch (2024-01-01T00:00:00Z) expressed in milliseconds.
const EPOCH_MILLIS: u64 = 1_704_067_200_000;
const REPLICA_ID_BITS: u8 = 10;
const COUNTER_BITS: u8 = 12;
const MAX_COUNTER: u16 = (1 << COUNTER_BITS) - 1;

pub const MAX_REPLICA_ID: u16 = (1 << REPLICA_ID_BITS) - 1;

/// Monotonic id source for log insertion order. Ids sort by generation time,
/// with the replica id baked in so independently-mutating replicas never
/// collide.
#[derive(Debug)]
pub struct SequenceGenerator {
    replica_id: u16,
    last_timestamp: u64,
    counter: u16,
}

impl SequenceGenerator {
    pub fn new(replica_id: u16) -> Self {
        Self {
            replica_id,
            last_timestamp: 0,
            counter: 0,
        }
    }

    pub fn next_id(&mut self) -> SequenceId {
        loop {
            let mut timestamp = current_millis();
            if timestamp < self.last_timestamp {
                // Clock went backwards; wait it out rather than risk
                // non-monotonic ids.
                let wait = self.last_timestamp - timestamp;
                sleep(Duration::from_millis(wait));
                continue;
            }

            if timestamp == self.last_timestamp {
                self.counter = (self.counter + 1) & MAX_COUNTER;
                if self.counter == 0 {
                    timestamp = wait_next_millis(self.last_timestamp);
                }
            } else {
                self.counter = 0;
            }

            self.last_timestamp = timestamp;
            let elapsed = timestamp.saturating_sub(EPOCH_MILLIS);
            let id = (elapsed << (REPLICA_ID_BITS + COUNTER_BITS))
                | ((self.replica_id as u64) << COUNTER_BITS)
                | self.counter as u64;
            return SequenceId(id);
        }
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_millis() as u64
}

fn wait_next_millis(last_timestamp: u64) -> u64 {
    loop {
        let timestamp = current_millis();
        if timestamp > last_timestamp {
            return timestamp;
        }
        sleep(Duration::from_micros(100));
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId(u64);

impl SequenceId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SequenceId").field(&self.0).finish()
    }
}

impl FromStr for SequenceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(SequenceId)
    }
}

// Serialized as a decimal string: the full u64 range does not survive a
// round-trip through a JSON number in JS-based consumers.
impl Serialize for SequenceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SequenceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse::<SequenceId>()
            .map_err(|err| serde::de::Error::custom(err.to_string()))
    }
}

impl From<SequenceId> for u64 {
    fn from(value: SequenceId) -> Self {
        value.0
    }
}
