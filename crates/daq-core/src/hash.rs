//! Stable 32-bit name hashing.
//!
//! Event type ids, producer stream ids and factory keys are all derived from
//! human-readable names with [`name_hash`]. The function is `const`, so
//! implementations can pin their id at compile time:
//!
//! ```rust
//! use daq_core::hash::name_hash;
//!
//! const NI_PRODUCER: u32 = name_hash("NiProducer");
//! assert_eq!(NI_PRODUCER, name_hash("NiProducer"));
//! ```

const SEED: u32 = 5381;

/// Hash a name: `h("") = 5381`, `h(c + rest) = c + 33 * h(rest)`.
///
/// Folds from the last byte towards the first with wrapping arithmetic, which
/// keeps the value identical on every platform and in every build.
pub const fn name_hash(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash = SEED;
    let mut i = bytes.len();
    while i > 0 {
        i -= 1;
        hash = (bytes[i] as u32).wrapping_add(hash.wrapping_mul(33));
    }
    hash
}
