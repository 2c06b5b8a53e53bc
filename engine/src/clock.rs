//! Logical timestamps and the clocks that issue them.
//!
//! Timestamps provide a total ordering across all replicas, which is
//! essential for deterministic conflict resolution.

use crate::{error::Result, Error, ReplicaId, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A logical timestamp.
///
/// Ordering rules:
/// 1. Higher sequence wins
/// 2. If sequences are equal, lexicographically higher replica id wins
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    /// Monotonically increasing per-replica counter
    pub sequence: u64,
    /// Replica that issued the timestamp
    pub replica_id: ReplicaId,
}

impl Timestamp {
    pub fn new(sequence: u64, replica_id: impl Into<ReplicaId>) -> Self {
        Self {
            sequence,
            replica_id: replica_id.into(),
        }
    }

    /// Tuple form used inside index keys: `[sequence, replicaId]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Number(self.sequence as f64),
            Value::String(self.replica_id.clone()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        match value.as_array().map(Vec::as_slice) {
            Some([Value::Number(seq), Value::String(replica)]) if *seq >= 0.0 => {
                Ok(Self::new(*seq as u64, replica.clone()))
            }
            _ => Err(Error::Encoding(format!(
                "invalid timestamp tuple: {:?}",
                value
            ))),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.sequence.cmp(&other.sequence) {
            Ordering::Equal => self.replica_id.cmp(&other.replica_id),
            other => other,
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.sequence, self.replica_id)
    }
}

/// Source of timestamps for one replica.
pub trait Clock: Send {
    /// Advance and return the next timestamp. Never returns the same
    /// sequence twice.
    fn next_timestamp(&mut self) -> Result<Timestamp>;

    /// The last issued timestamp, without advancing.
    fn current(&self) -> Timestamp;

    /// Move the sequence forward past a timestamp observed from another
    /// replica, so later local writes order after it.
    fn observe(&mut self, timestamp: &Timestamp) -> Result<()>;

    fn replica_id(&self) -> &str;
}

/// Volatile clock.
#[derive(Debug, Clone)]
pub struct MemoryClock {
    replica_id: ReplicaId,
    sequence: u64,
}

impl MemoryClock {
    pub fn new(replica_id: impl Into<ReplicaId>) -> Self {
        Self::with_sequence(replica_id, 0)
    }

    pub fn with_sequence(replica_id: impl Into<ReplicaId>, sequence: u64) -> Self {
        Self {
            replica_id: replica_id.into(),
            sequence,
        }
    }
}

impl Clock for MemoryClock {
    fn next_timestamp(&mut self) -> Result<Timestamp> {
        self.sequence += 1;
        Ok(self.current())
    }

    fn current(&self) -> Timestamp {
        Timestamp::new(self.sequence, self.replica_id.clone())
    }

    fn observe(&mut self, timestamp: &Timestamp) -> Result<()> {
        self.sequence = self.sequence.max(timestamp.sequence);
        Ok(())
    }

    fn replica_id(&self) -> &str {
        &self.replica_id
    }
}

/// Where a durable clock keeps its last sequence.
pub trait SequencePersistence: Send {
    fn load(&mut self) -> Result<u64>;
    fn save(&mut self, sequence: u64) -> Result<()>;
}

/// Persistence that only lives as long as the process; useful in tests.
#[derive(Debug, Clone, Default)]
pub struct InMemorySequence {
    pub saved: u64,
}

impl SequencePersistence for InMemorySequence {
    fn load(&mut self) -> Result<u64> {
        Ok(self.saved)
    }

    fn save(&mut self, sequence: u64) -> Result<()> {
        self.saved = sequence;
        Ok(())
    }
}

/// Clock whose sequence survives restarts. Each sequence is saved before
/// the timestamp carrying it is handed out.
#[derive(Debug)]
pub struct DurableClock<P: SequencePersistence> {
    replica_id: ReplicaId,
    sequence: u64,
    persistence: P,
}

impl<P: SequencePersistence> DurableClock<P> {
    pub fn open(replica_id: impl Into<ReplicaId>, mut persistence: P) -> Result<Self> {
        let sequence = persistence.load()?;
        Ok(Self {
            replica_id: replica_id.into(),
            sequence,
            persistence,
        })
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }
}

impl<P: SequencePersistence> Clock for DurableClock<P> {
    fn next_timestamp(&mut self) -> Result<Timestamp> {
        let next = self.sequence + 1;
        self.persistence.save(next)?;
        self.sequence = next;
        Ok(self.current())
    }

    fn current(&self) -> Timestamp {
        Timestamp::new(self.sequence, self.replica_id.clone())
    }

    fn observe(&mut self, timestamp: &Timestamp) -> Result<()> {
        if timestamp.sequence > self.sequence {
            self.persistence.save(timestamp.sequence)?;
            self.sequence = timestamp.sequence;
        }
        Ok(())
    }

    fn replica_id(&self) -> &str {
        &self.replica_id
    }
}

impl<C: Clock + ?Sized> Clock for Box<C> {
    fn next_timestamp(&mut self) -> Result<Timestamp> {
        (**self).next_timestamp()
    }

    fn current(&self) -> Timestamp {
        (**self).current()
    }

    fn observe(&mut self, timestamp: &Timestamp) -> Result<()> {
        (**self).observe(timestamp)
    }

    fn replica_id(&self) -> &str {
        (**self).replica_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clock_starts_at_zero() {
        let clock = MemoryClock::new("replica-1");
        assert_eq!(clock.current(), Timestamp::new(0, "replica-1"));
    }

    #[test]
    fn next_timestamp_increments() {
        let mut clock = MemoryClock::new("replica-1");
        assert_eq!(clock.next_timestamp().unwrap().sequence, 1);
        assert_eq!(clock.next_timestamp().unwrap().sequence, 2);
        assert_eq!(clock.current().sequence, 2);
    }

    #[test]
    fn ordering_by_sequence() {
        let a = Timestamp::new(1, "replica-b");
        let b = Timestamp::new(2, "replica-a");
        assert!(a < b);
    }

    #[test]
    fn ordering_by_replica_when_sequence_equal() {
        let a = Timestamp::new(5, "replica-a");
        let b = Timestamp::new(5, "replica-b");
        assert!(a < b);
    }

    #[test]
    fn observe_takes_max_sequence() {
        let mut clock = MemoryClock::with_sequence("replica-1", 3);
        clock.observe(&Timestamp::new(7, "replica-2")).unwrap();
        assert_eq!(clock.current(), Timestamp::new(7, "replica-1"));
        clock.observe(&Timestamp::new(2, "replica-2")).unwrap();
        assert_eq!(clock.next_timestamp().unwrap().sequence, 8);
    }

    #[test]
    fn durable_clock_resumes_after_restart() {
        let mut clock = DurableClock::open("server", InMemorySequence::default()).unwrap();
        clock.next_timestamp().unwrap();
        clock.next_timestamp().unwrap();
        let persisted = clock.persistence().clone();
        assert_eq!(persisted.saved, 2);

        let mut reopened = DurableClock::open("server", persisted).unwrap();
        assert_eq!(reopened.current().sequence, 2);
        assert_eq!(reopened.next_timestamp().unwrap().sequence, 3);
    }

    #[test]
    fn durable_clock_does_not_advance_when_save_fails() {
        struct Failing;
        impl SequencePersistence for Failing {
            fn load(&mut self) -> Result<u64> {
                Ok(4)
            }
            fn save(&mut self, _sequence: u64) -> Result<()> {
                Err(Error::Storage("disk full".into()))
            }
        }

        let mut clock = DurableClock::open("server", Failing).unwrap();
        assert!(clock.next_timestamp().is_err());
        assert_eq!(clock.current().sequence, 4);
    }

    #[test]
    fn tuple_roundtrip() {
        let ts = Timestamp::new(42, "replica-1");
        assert_eq!(Timestamp::from_value(&ts.to_value()).unwrap(), ts);
        assert!(Timestamp::from_value(&Value::from("nope")).is_err());
    }

    #[test]
    fn serialization_format() {
        let ts = Timestamp::new(10, "replica-1");
        let json = serde_json::to_string(&ts).unwrap();
        assert!(json.contains("replicaId"));
        assert!(json.contains("sequence"));
    }
}
