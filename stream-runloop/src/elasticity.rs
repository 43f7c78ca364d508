//! Key-bucket routing for intra-container elasticity.
//!
//! Pure function of `(key, offset, elasticityFactor)`, kept separate from
//! the run loop so it can be unit-tested without driving a consumer mux,
//! the same split `ingestion-consumer`'s `MessageRouter` makes between
//! hashing a routing key and running the consumer loop.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use crate::partition::PartitionId;

/// Upper bound on `elasticityFactor`; containers configuring more buckets
/// than this are almost certainly misconfigured.
pub const MAX_ELASTICITY_FACTOR: u8 = 16;

/// Resolves the effective, possibly-bucketed partition for an envelope.
///
/// `factor <= 1` disables elasticity and returns `raw` unchanged (no
/// bucket). Otherwise the routing key is the message key if present,
/// falling back to the offset; if neither is present the envelope routes
/// to bucket zero.
pub fn effective_partition(
    raw: &PartitionId,
    key: Option<&[u8]>,
    offset: Option<&str>,
    factor: u8,
) -> PartitionId {
    if factor <= 1 {
        return PartitionId {
            key_bucket: None,
            ..raw.clone()
        };
    }

    let bucket = match key.or_else(|| offset.map(str::as_bytes)) {
        None => 0,
        Some(bytes) => hash_to_bucket(bytes, factor),
    };

    raw.with_bucket(bucket)
}

/// `(|hash(h)| mod 31) mod F`. The mod-31 fold spreads poorly-distributed
/// hash codes before the final fold onto `F` buckets.
fn hash_to_bucket(bytes: &[u8], factor: u8) -> i32 {
    let mut hasher = SipHasher13::new();
    hasher.write(bytes);
    let digest = hasher.finish();

    // Fold to a 32-bit "hash code" magnitude before the mod-31 spread,
    // mirroring the signed hash codes the upstream key writer produced.
    let code = (digest & 0xFFFF_FFFF) as u32 as i32;
    let spread = (code as i64).unsigned_abs() % 31;
    (spread % factor as u64) as i32
}
