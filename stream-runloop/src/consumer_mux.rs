use async_trait::async_trait;

use crate::envelope::Envelope;

/// The shared fetch source multiplexing every partition the container has
/// subscribed to. Implementations are external collaborators (a real one
/// wraps a Kafka-style client); this crate only depends on the contract.
///
/// Must only be called from the run loop's own task — it is not meant to
/// be shared across concurrent callers.
#[async_trait]
pub trait ConsumerMux: Send + Sync {
    /// Returns the next available envelope across all subscribed
    /// partitions, or `None` if nothing became available. When `block` is
    /// true the implementation may wait up to its own unspecified bound
    /// before returning `None`; the run loop additionally races this call
    /// against `maxIdleMs`.
    async fn choose(&self, block: bool) -> Result<Option<Envelope>, String>;
}
