use std::fmt;

/// Identifies a single addressable shard of an input stream.
///
/// `key_bucket` is only populated when elasticity is enabled for the
/// container; two ids with `key_bucket: None` and `key_bucket: Some(0)`
/// are distinct, matching the data model's invariant that an absent
/// bucket is not the same partition as bucket zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionId {
    pub system: String,
    pub stream: String,
    pub partition: i32,
    pub key_bucket: Option<i32>,
}

impl PartitionId {
    pub fn new(system: impl Into<String>, stream: impl Into<String>, partition: i32) -> Self {
        Self {
            system: system.into(),
            stream: stream.into(),
            partition,
            key_bucket: None,
        }
    }

    pub fn with_bucket(&self, key_bucket: i32) -> Self {
        Self {
            key_bucket: Some(key_bucket),
            ..self.clone()
        }
    }

    /// True if `other` shares this id's (system, stream, partition) triple,
    /// ignoring any key bucket. Used for end-of-stream fan-out and for
    /// watermark fan-out when elasticity broadens delivery to every bucket.
    pub fn same_raw_partition(&self, other: &PartitionId) -> bool {
        self.system == other.system && self.stream == other.stream && self.partition == other.partition
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key_bucket {
            Some(bucket) => write!(f, "{}.{}.{}#{bucket}", self.system, self.stream, self.partition),
            None => write!(f, "{}.{}.{}", self.system, self.stream, self.partition),
        }
    }
}
