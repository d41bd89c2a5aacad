//! Mapping of transactional ids to transaction state log partitions
//!
//! The hash is the Java `String.hashCode` of the id with the sign bit
//! masked off, so that brokers written against the Kafka reference
//! implementation agree on which coordinator owns an id.

/// Partition-count source queried once when the manager is created
pub trait PartitionCountSource: Send + Sync {
    /// Number of partitions of `topic`, or `None` if it is not known yet
    fn number_of_partitions(&self, topic: &str) -> Option<u32>;
}

/// Fixed partition count, useful for embedded setups and tests
#[derive(Debug, Clone, Copy)]
pub struct FixedPartitionCount(pub u32);

impl PartitionCountSource for FixedPartitionCount {
    fn number_of_partitions(&self, _topic: &str) -> Option<u32> {
        Some(self.0)
    }
}

/// Java-compatible `String.hashCode` over UTF-16 code units
fn java_string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

/// Partition of the transaction state log that owns `transactional_id`
///
/// `num_partitions` must be non-zero.
pub fn partition_for(transactional_id: &str, num_partitions: u32) -> i32 {
    let hash = (java_string_hash(transactional_id) & 0x7fff_ffff) as u32;
    (hash % num_partitions) as i32
}
