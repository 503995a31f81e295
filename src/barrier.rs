//! Polling barrier over a blackboard key.
//!
//! A barrier never sleeps. Each [`Barrier::poke`] reads the key once and either
//! reports [`Poke::Ready`] or asks the caller to come back after the poke
//! interval. Whoever drives the chain persists the waiting state and
//! re-invokes the step later, so a wait of several hours holds no task or
//! thread in the meantime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::blackboard::{Blackboard, BlackboardError, Signal};

/// What the barrier waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// Released once the key holds a value.
    Present,
    /// Released once the key is gone.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poke {
    Ready,
    NotYet { retry_after: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barrier {
    pub signal: Signal,
    pub expect: Presence,
    #[serde(with = "duration_secs")]
    pub poke_interval: Duration,
}

impl Barrier {
    pub fn await_presence(signal: Signal, poke_interval: Duration) -> Self {
        Self {
            signal,
            expect: Presence::Present,
            poke_interval,
        }
    }

    pub fn await_absence(signal: Signal, poke_interval: Duration) -> Self {
        Self {
            signal,
            expect: Presence::Absent,
            poke_interval,
        }
    }

    /// Check the condition once.
    pub async fn poke<B: Blackboard + ?Sized>(&self, board: &B) -> Result<Poke, BlackboardError> {
        let present = board.get(self.signal).await?.is_present();
        let satisfied = match self.expect {
            Presence::Present => present,
            Presence::Absent => !present,
        };

        debug!(
            signal = %self.signal,
            expect = ?self.expect,
            satisfied,
            "Barrier poked"
        );

        if satisfied {
            Ok(Poke::Ready)
        } else {
            Ok(Poke::NotYet {
                retry_after: self.poke_interval,
            })
        }
    }
}

impl fmt::Display for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.expect {
            Presence::Present => "presence",
            Presence::Absent => "absence",
        };
        write!(
            f,
            "await {verb} of '{}' every {}s",
            self.signal,
            self.poke_interval.as_secs()
        )
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
