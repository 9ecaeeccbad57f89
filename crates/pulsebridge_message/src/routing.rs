//! Key hashing shared by partition routing and Key_Shared dispatch.

/// Java `String.hashCode` masked to a non-negative value, the default hashing
/// scheme Pulsar clients use for partition keys.
pub fn java_string_hash(key: &str) -> u32 {
    let hash = key
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    (hash & i32::MAX) as u32
}

/// Bucket `key` into `buckets` slots.
pub fn bucket(key: &str, buckets: usize) -> usize {
    if buckets == 0 {
        return 0;
    }
    java_string_hash(key) as usize % buckets
}
