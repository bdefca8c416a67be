//! Time-ordered push ids.
//!
//! An id is 20 characters: 8 characters of millisecond timestamp followed
//! by 12 characters of randomness, drawn from an alphabet whose characters
//! are in ASCII order. Ids therefore sort lexicographically by creation
//! time. Ids minted within the same millisecond increment the random part
//! instead of drawing a new one, so every id is strictly greater than the
//! previous one from the same generator.

use crate::types::{MessageId, Timestamp};
use rand::Rng;

/// Alphabet in ASCII order.
const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

/// Length of every generated id.
pub const PUSH_ID_LEN: usize = TIME_CHARS + RANDOM_CHARS;

/// Generates strictly increasing push ids.
#[derive(Debug, Default)]
pub struct PushIdGenerator {
    last_millis: i64,
    last_random: [u8; RANDOM_CHARS],
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a generator so that its ids sort after `last`.
    ///
    /// Ids that were not produced by a push-id generator are ignored.
    pub fn resume_after(last: &MessageId) -> Self {
        match decode(last.as_str()) {
            Some((last_millis, last_random)) => Self {
                last_millis,
                last_random,
            },
            None => Self::new(),
        }
    }

    /// Mint the next id for wall-clock time `now`.
    ///
    /// Returns the id and the timestamp it encodes. The timestamp never
    /// goes backwards, even if the clock does.
    pub fn next_id(&mut self, now: Timestamp) -> (MessageId, Timestamp) {
        if now.0 > self.last_millis {
            self.last_millis = now.0;
            let mut rng = rand::thread_rng();
            for slot in self.last_random.iter_mut() {
                *slot = rng.gen_range(0..64);
            }
        } else if !increment(&mut self.last_random) {
            // Suffix space for this millisecond is exhausted.
            self.last_millis += 1;
            self.last_random = [0; RANDOM_CHARS];
        }

        (
            MessageId(encode(self.last_millis, &self.last_random)),
            Timestamp(self.last_millis),
        )
    }
}

/// Add one to the base-64 suffix. Returns false on overflow.
fn increment(random: &mut [u8; RANDOM_CHARS]) -> bool {
    for digit in random.iter_mut().rev() {
        if *digit == 63 {
            *digit = 0;
        } else {
            *digit += 1;
            return true;
        }
    }
    false
}

fn encode(millis: i64, random: &[u8; RANDOM_CHARS]) -> String {
    let mut out = [0u8; PUSH_ID_LEN];
    let mut rest = millis.max(0) as u64;
    for slot in out[..TIME_CHARS].iter_mut().rev() {
        *slot = PUSH_CHARS[(rest % 64) as usize];
        rest /= 64;
    }
    for (slot, digit) in out[TIME_CHARS..].iter_mut().zip(random) {
        *slot = PUSH_CHARS[*digit as usize];
    }
    out.iter().map(|&b| b as char).collect()
}

fn decode(id: &str) -> Option<(i64, [u8; RANDOM_CHARS])> {
    let bytes = id.as_bytes();
    if bytes.len() != PUSH_ID_LEN {
        return None;
    }

    let mut millis: i64 = 0;
    for &b in &bytes[..TIME_CHARS] {
        millis = millis * 64 + digit_of(b)? as i64;
    }

    let mut random = [0u8; RANDOM_CHARS];
    for (slot, &b) in random.iter_mut().zip(&bytes[TIME_CHARS..]) {
        *slot = digit_of(b)?;
    }

    Some((millis, random))
}

fn digit_of(b: u8) -> Option<u8> {
    PUSH_CHARS.iter().position(|&c| c == b).map(|p| p as u8)
}
