//! Monotonic 64-bit "snowflake-style" id generation.
//!
//! Executions and events are identified by ids that are totally ordered
//! and safe to generate without a round-trip to the database (spec §3
//! "Execution ... Identified by a monotonically increasing 64-bit id").
//!
//! Layout, most-significant bit first: 41 bits of milliseconds since
//! `EPOCH_MS`, 10 bits of worker id, 12 bits of per-millisecond sequence.
//! This mirrors the classic Twitter snowflake layout; it does not need to
//! coordinate across processes beyond a distinct `worker_id` per process.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// 2024-01-01T00:00:00Z in milliseconds since the Unix epoch.
const EPOCH_MS: u64 = 1_704_067_200_000;
const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER_ID: u64 = (1 << WORKER_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

struct State {
    last_millis: u64,
    sequence: u64,
}

/// A snowflake id generator scoped to one process/worker id.
pub struct Snowflake {
    worker_id: u64,
    state: Mutex<State>,
}

impl Snowflake {
    pub fn new(worker_id: u64) -> Self {
        Self {
            worker_id: worker_id & MAX_WORKER_ID,
            state: Mutex::new(State {
                last_millis: 0,
                sequence: 0,
            }),
        }
    }

    /// Generate the next id. Spins briefly if the local clock hasn't
    /// advanced and the per-millisecond sequence space is exhausted.
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().expect("snowflake mutex poisoned");
        let mut millis = now_millis();

        if millis < state.last_millis {
            // Clock moved backwards; pin to the last observed millisecond
            // rather than generating a duplicate or negative-delta id.
            millis = state.last_millis;
        }

        if millis == state.last_millis {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                while now_millis() <= millis {
                    std::hint::spin_loop();
                }
                millis = now_millis();
            }
        } else {
            state.sequence = 0;
        }

        state.last_millis = millis;

        let timestamp_part = (millis - EPOCH_MS) << (WORKER_BITS + SEQUENCE_BITS);
        let worker_part = self.worker_id << SEQUENCE_BITS;
        (timestamp_part | worker_part | state.sequence) as i64
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_monotonically_increasing_ids() {
        let gen = Snowflake::new(1);
        let mut last = gen.next_id();
        for _ in 0..1000 {
            let id = gen.next_id();
            assert!(id > last, "snowflake ids must be strictly increasing");
            last = id;
        }
    }

    #[test]
    fn distinct_worker_ids_do_not_collide_within_the_same_millisecond() {
        let a = Snowflake::new(1);
        let b = Snowflake::new(2);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            assert!(seen.insert(a.next_id()));
            assert!(seen.insert(b.next_id()));
        }
    }
}
