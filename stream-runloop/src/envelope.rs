use bytes::Bytes;

use crate::partition::PartitionId;

/// Reserved offset literal marking an end-of-stream envelope. Exactly 15
/// bytes including the leading NUL; compared byte-for-byte, never through
/// string collation, to avoid encoding drift.
pub const END_OF_STREAM_OFFSET: &str = "\0END_OF_STREAM";

/// The payload carried by an envelope: either opaque application bytes,
/// an end-of-stream sentinel, or a watermark carrying a monotonic
/// timestamp.
#[derive(Debug, Clone)]
pub enum Payload {
    Data(Bytes),
    EndOfStream,
    Watermark(i64),
}

/// An immutable message drawn from a partition, plus the metadata the run
/// loop needs to route, order, and account for it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub partition: PartitionId,
    pub offset: Option<String>,
    pub key: Option<Bytes>,
    pub message: Payload,
    pub size: usize,
    pub event_time: i64,
    pub arrival_time: i64,
}

impl Envelope {
    pub fn new(
        partition: PartitionId,
        offset: Option<String>,
        key: Option<Bytes>,
        message: Payload,
        size: usize,
        event_time: i64,
        arrival_time: i64,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            message,
            size,
            event_time,
            arrival_time,
        }
    }

    /// Builds an end-of-stream envelope for `partition`, arriving at `arrival_time`.
    pub fn end_of_stream(partition: PartitionId, arrival_time: i64) -> Self {
        Self {
            partition,
            offset: Some(END_OF_STREAM_OFFSET.to_string()),
            key: None,
            message: Payload::EndOfStream,
            size: 0,
            event_time: arrival_time,
            arrival_time,
        }
    }

    /// Builds a watermark envelope carrying `timestamp`, with neither an
    /// offset nor a key.
    pub fn watermark(partition: PartitionId, timestamp: i64, arrival_time: i64) -> Self {
        Self {
            partition,
            offset: None,
            key: None,
            message: Payload::Watermark(timestamp),
            size: 0,
            event_time: timestamp,
            arrival_time,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.offset.as_deref() == Some(END_OF_STREAM_OFFSET)
    }

    pub fn is_watermark(&self) -> bool {
        matches!(self.message, Payload::Watermark(_))
    }

    /// Returns a copy of this envelope with its partition replaced, used
    /// once the run loop has resolved the effective (possibly bucketed)
    /// partition a given worker owns.
    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = partition;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_of_stream_offset_is_the_reserved_literal() {
        let env = Envelope::end_of_stream(PartitionId::new("db", "events", 0), 100);
        assert!(env.is_end_of_stream());
        assert_eq!(env.offset.as_deref(), Some(END_OF_STREAM_OFFSET));
        assert_eq!(END_OF_STREAM_OFFSET.len(), 15);
    }

    #[test]
    fn watermark_has_no_offset_or_key() {
        let env = Envelope::watermark(PartitionId::new("db", "events", 0), 42, 100);
        assert!(env.is_watermark());
        assert!(env.offset.is_none());
        assert!(env.key.is_none());
    }

    #[test]
    fn ordinary_envelope_is_neither_sentinel() {
        let env = Envelope::new(
            PartitionId::new("db", "events", 0),
            Some("7".to_string()),
            None,
            Payload::Data(Bytes::from_static(b"{}")),
            2,
            10,
            11,
        );
        assert!(!env.is_end_of_stream());
        assert!(!env.is_watermark());
    }
}
