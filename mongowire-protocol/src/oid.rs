//! 12-byte object identifiers.
//!
//! Byte layout of a generated id:
//!
//! ```text
//! +-----------------+--------------+-------------+----------------+
//! | seconds (LE)    | machine tag  | process tag | counter (LE)   |
//! | 4 bytes         | 3 bytes      | 2 bytes     | 3 bytes        |
//! +-----------------+--------------+-------------+----------------+
//! ```
//!
//! The textual form is 24 uppercase hex digits, but the digit pairs are not
//! in byte order: pair `i` holds byte `HEX_PERMUTATION[i]`. Older servers
//! rendered ids this way and existing data depends on it.

use crate::error::ProtocolError;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Size of an object id in bytes.
pub const OBJECT_ID_SIZE: usize = 12;

/// Hex digit pair `i` of the textual form encodes byte `HEX_PERMUTATION[i]`.
pub const HEX_PERMUTATION: [usize; OBJECT_ID_SIZE] = [7, 6, 5, 4, 3, 2, 1, 0, 11, 10, 9, 8];

/// Counter values are 24 bits wide.
const COUNTER_MASK: u32 = 0x00FF_FFFF;

/// A 12-byte object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_ID_SIZE]);

impl ObjectId {
    /// Generates a new id from the process-wide generator.
    pub fn new() -> Self {
        global_generator().generate()
    }

    /// Wraps raw bytes verbatim.
    pub const fn from_bytes(bytes: [u8; OBJECT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Copies an id out of a slice of exactly 12 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let arr: [u8; OBJECT_ID_SIZE] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidObjectId(format!(
                "expected {} bytes, got {}",
                OBJECT_ID_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Parses the 24-character textual form.
    pub fn parse_str(s: &str) -> Result<Self, ProtocolError> {
        if s.len() != OBJECT_ID_SIZE * 2 {
            return Err(ProtocolError::InvalidObjectId(format!(
                "must be {} characters, got {}",
                OBJECT_ID_SIZE * 2,
                s.len()
            )));
        }
        let decoded = hex::decode(s)
            .map_err(|e| ProtocolError::InvalidObjectId(format!("{}: {}", s, e)))?;

        let mut bytes = [0u8; OBJECT_ID_SIZE];
        for (i, b) in decoded.into_iter().enumerate() {
            bytes[HEX_PERMUTATION[i]] = b;
        }
        Ok(Self(bytes))
    }

    /// Returns the raw bytes.
    pub fn bytes(&self) -> [u8; OBJECT_ID_SIZE] {
        self.0
    }

    /// Returns the textual form (uppercase hex, permuted byte order).
    pub fn to_hex(&self) -> String {
        let permuted: Vec<u8> = HEX_PERMUTATION.iter().map(|&i| self.0[i]).collect();
        hex::encode_upper(permuted)
    }

    /// Seconds since the epoch stored in the first four bytes.
    pub fn seconds(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Generation time, at second resolution.
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(i64::from(self.seconds()), 0)
            .single()
            .unwrap_or_default()
    }

    /// The 24-bit counter stored in the last three bytes.
    pub fn counter(&self) -> u32 {
        u32::from_le_bytes([self.0[9], self.0[10], self.0[11], 0])
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s)
    }
}

impl From<[u8; OBJECT_ID_SIZE]> for ObjectId {
    fn from(bytes: [u8; OBJECT_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Per-second counter state.
#[derive(Debug)]
struct CounterState {
    second: u32,
    next: u32,
}

/// Produces process-unique, time-ordered object ids.
///
/// Machine and process tags are fixed for the lifetime of the generator.
/// The counter restarts at zero whenever the observed second changes; the
/// check and the increment happen under one lock so concurrent callers never
/// see the same counter value within a second.
#[derive(Debug)]
pub struct ObjectIdGenerator {
    machine: [u8; 3],
    process: [u8; 2],
    state: Mutex<CounterState>,
}

impl ObjectIdGenerator {
    /// Creates a generator with randomly chosen machine and process tags.
    pub fn new() -> Self {
        let seed = uuid::Uuid::new_v4();
        let seed = seed.as_bytes();
        Self::with_tags([seed[0], seed[1], seed[2]], [seed[3], seed[4]])
    }

    /// Creates a generator with fixed tags.
    pub fn with_tags(machine: [u8; 3], process: [u8; 2]) -> Self {
        Self {
            machine,
            process,
            state: Mutex::new(CounterState { second: 0, next: 0 }),
        }
    }

    pub fn machine_tag(&self) -> [u8; 3] {
        self.machine
    }

    pub fn process_tag(&self) -> [u8; 2] {
        self.process
    }

    /// Generates an id stamped with the current time.
    pub fn generate(&self) -> ObjectId {
        self.generate_at(current_seconds())
    }

    /// Generates an id stamped with the given second.
    pub fn generate_at(&self, second: u32) -> ObjectId {
        let counter = self.next_counter(second);

        let mut bytes = [0u8; OBJECT_ID_SIZE];
        bytes[0..4].copy_from_slice(&second.to_le_bytes());
        bytes[4..7].copy_from_slice(&self.machine);
        bytes[7..9].copy_from_slice(&self.process);
        bytes[9..12].copy_from_slice(&counter.to_le_bytes()[0..3]);
        ObjectId(bytes)
    }

    /// Resets the counter state.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.second = 0;
        state.next = 0;
    }

    fn next_counter(&self, second: u32) -> u32 {
        let mut state = self.state.lock();
        if state.second != second {
            state.second = second;
            state.next = 0;
        }
        let counter = state.next;
        state.next = (state.next + 1) & COUNTER_MASK;
        counter
    }
}

impl Default for ObjectIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the process-wide generator, initialising it on first use.
pub fn global_generator() -> &'static ObjectIdGenerator {
    static GENERATOR: OnceLock<ObjectIdGenerator> = OnceLock::new();
    GENERATOR.get_or_init(ObjectIdGenerator::new)
}

fn current_seconds() -> u32 {
    Utc::now().timestamp().clamp(0, i64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_generated_layout() {
        let gen = ObjectIdGenerator::with_tags([0xAA, 0xBB, 0xCC], [0x11, 0x22]);
        let id = gen.generate_at(0x0102_0304);
        let bytes = id.bytes();

        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..7], &[0xAA, 0xBB, 0xCC]);
        assert_eq!(&bytes[7..9], &[0x11, 0x22]);
        assert_eq!(&bytes[9..12], &[0, 0, 0]);
        assert_eq!(id.seconds(), 0x0102_0304);
        assert_eq!(id.counter(), 0);
    }

    #[test]
    fn test_counter_increments_and_resets_on_new_second() {
        let gen = ObjectIdGenerator::with_tags([1, 2, 3], [4, 5]);
        assert_eq!(gen.generate_at(100).counter(), 0);
        assert_eq!(gen.generate_at(100).counter(), 1);
        assert_eq!(gen.generate_at(100).counter(), 2);

        // New second restarts the counter
        assert_eq!(gen.generate_at(101).counter(), 0);
        assert_eq!(gen.generate_at(101).counter(), 1);
    }

    #[test]
    fn test_counter_wraps_at_24_bits() {
        let gen = ObjectIdGenerator::with_tags([0; 3], [0; 2]);
        gen.state.lock().second = 7;
        gen.state.lock().next = COUNTER_MASK;
        assert_eq!(gen.generate_at(7).counter(), COUNTER_MASK);
        assert_eq!(gen.generate_at(7).counter(), 0);
    }

    #[test]
    fn test_reset() {
        let gen = ObjectIdGenerator::with_tags([0; 3], [0; 2]);
        gen.generate_at(5);
        gen.generate_at(5);
        gen.reset();
        assert_eq!(gen.generate_at(5).counter(), 0);
    }

    #[test]
    fn test_different_seconds_differ_in_prefix() {
        let gen = ObjectIdGenerator::new();
        let a = gen.generate_at(1_000);
        let b = gen.generate_at(1_001);
        assert_ne!(&a.bytes()[0..4], &b.bytes()[0..4]);
    }

    #[test]
    fn test_million_ids_are_unique() {
        let gen = ObjectIdGenerator::new();
        let mut seen = HashSet::with_capacity(1_000_000);
        for _ in 0..1_000_000 {
            let id = gen.generate();
            assert!(seen.insert(id), "duplicate id {}", id);
        }
        assert_eq!(seen.len(), 1_000_000);
    }

    #[test]
    fn test_concurrent_generation_is_unique() {
        let gen = Arc::new(ObjectIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = Arc::clone(&gen);
                std::thread::spawn(move || {
                    (0..10_000).map(|_| gen.generate_at(42)).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 40_000);
    }

    #[test]
    fn test_hex_uses_permuted_order() {
        let id = ObjectId::from_bytes([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(id.to_hex(), "07060504030201000B0A0908");
    }

    #[test]
    fn test_parse_str_inverts_permutation() {
        let id = ObjectId::parse_str("07060504030201000B0A0908").unwrap();
        assert_eq!(id.bytes(), [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);

        // lowercase is accepted
        let lower = ObjectId::parse_str("07060504030201000b0a0908").unwrap();
        assert_eq!(lower, id);
    }

    #[test]
    fn test_text_round_trip() {
        let gen = ObjectIdGenerator::new();
        for _ in 0..1000 {
            let id = gen.generate();
            let text = id.to_string();
            assert_eq!(text.len(), 24);
            assert_eq!(text, text.to_uppercase());
            assert_eq!(text.parse::<ObjectId>().unwrap(), id);
        }
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            ObjectId::parse_str("ABC"),
            Err(ProtocolError::InvalidObjectId(_))
        ));
        assert!(matches!(
            ObjectId::parse_str("0706050403020100 B0A0908"),
            Err(ProtocolError::InvalidObjectId(_))
        ));
        assert!(matches!(
            ObjectId::parse_str("ZZ060504030201000B0A0908"),
            Err(ProtocolError::InvalidObjectId(_))
        ));
    }

    #[test]
    fn test_from_slice() {
        let bytes = [9u8; 12];
        assert_eq!(ObjectId::from_slice(&bytes).unwrap().bytes(), bytes);
        assert!(ObjectId::from_slice(&bytes[..11]).is_err());
    }

    #[test]
    fn test_timestamp() {
        let gen = ObjectIdGenerator::new();
        let id = gen.generate_at(1_234_567_890);
        assert_eq!(id.timestamp().timestamp(), 1_234_567_890);
    }

    #[test]
    fn test_global_generator_is_shared() {
        let a = global_generator() as *const _;
        let b = global_generator() as *const _;
        assert_eq!(a, b);
        assert_ne!(ObjectId::new(), ObjectId::new());
    }

    #[test]
    fn test_serde_uses_text_form() {
        let id = ObjectId::from_bytes([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"07060504030201000B0A0908\"");
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
