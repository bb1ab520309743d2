//! Device shadow store
//!
//! The shadow holds the attributes a charge point last reported. Every update
//! replaces the reported document wholesale, so concurrent writers for the
//! same device need no coordination: the last write wins.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::ocpp::DeviceId;
use crate::pubsub::{PubSubError, Publisher};

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("shadow publish failed: {0}")]
    Publish(#[from] PubSubError),

    #[error("shadow document could not be serialized: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ShadowResult<T> = Result<T, ShadowError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShadowStore: Send + Sync {
    /// Overwrite the reported state of `id`
    async fn update_reported(&self, id: &DeviceId, attributes: &Value) -> ShadowResult<()>;
}

/// `{"state": {"reported": <attributes>}}`
pub fn shadow_document(attributes: &Value) -> Value {
    serde_json::json!({ "state": { "reported": attributes } })
}

/// Shadow store reached through the broker's shadow update topic
pub struct TopicShadowStore {
    publisher: Arc<dyn Publisher>,
    prefix: String,
}

impl TopicShadowStore {
    pub fn new(publisher: Arc<dyn Publisher>, prefix: impl Into<String>) -> Self {
        Self {
            publisher,
            prefix: prefix.into(),
        }
    }

    pub fn update_topic(&self, id: &DeviceId) -> String {
        format!("{}/{}/shadow/update", self.prefix.trim_end_matches('/'), id)
    }
}

#[async_trait]
impl ShadowStore for TopicShadowStore {
    async fn update_reported(&self, id: &DeviceId, attributes: &Value) -> ShadowResult<()> {
        let topic = self.update_topic(id);
        let payload = serde_json::to_vec(&shadow_document(attributes))?;
        debug!("Updating shadow of {} via {}", id, topic);
        self.publisher.publish(&topic, payload).await?;
        Ok(())
    }
}

/// Shadow documents kept in memory
#[derive(Debug, Default)]
pub struct MemoryShadowStore {
    documents: RwLock<HashMap<DeviceId, Value>>,
}

impl MemoryShadowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last reported attributes of `id`
    pub fn reported(&self, id: &DeviceId) -> Option<Value> {
        self.documents.read().get(id).cloned()
    }
}

#[async_trait]
impl ShadowStore for MemoryShadowStore {
    async fn update_reported(&self, id: &DeviceId, attributes: &Value) -> ShadowResult<()> {
        self.documents.write().insert(id.clone(), attributes.clone());
        Ok(())
    }
}
