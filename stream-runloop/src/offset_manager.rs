use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::partition::PartitionId;

/// Records the latest processed offset per (task, partition). The run
/// loop serializes calls per (task, partition) by construction — only one
/// callback completion can be advancing a given partition's offset at a
/// time — so implementations only need to be safe under concurrent calls
/// across *different* (task, partition) pairs.
///
/// Production offset managers (checkpoint-store-backed, Kafka-store-
/// backed, ...) are external collaborators outside this crate's scope;
/// [`InMemoryOffsetManager`] below exists for tests and for containers
/// that checkpoint offsets some other way.
#[async_trait]
pub trait OffsetManager: Send + Sync {
    async fn update(&self, task_name: &str, partition: &PartitionId, offset: &str) -> Result<(), String>;
}

#[derive(Default)]
pub struct InMemoryOffsetManager {
    offsets: Mutex<HashMap<(String, PartitionId), String>>,
}

impl InMemoryOffsetManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_name: &str, partition: &PartitionId) -> Option<String> {
        self.offsets
            .lock()
            .unwrap()
            .get(&(task_name.to_string(), partition.clone()))
            .cloned()
    }
}

#[async_trait]
impl OffsetManager for InMemoryOffsetManager {
    async fn update(&self, task_name: &str, partition: &PartitionId, offset: &str) -> Result<(), String> {
        self.offsets
            .lock()
            .unwrap()
            .insert((task_name.to_string(), partition.clone()), offset.to_string());
        Ok(())
    }
}
