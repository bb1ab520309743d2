//! Router worker
//!
//! Subscribes to every charge point inbox (optionally as a shared
//! subscription so several workers split the load) and to the device
//! lifecycle topics, then handles each delivery in its own task. A semaphore
//! bounds how many deliveries are in flight; deliveries waiting for a permit
//! are queued while the connection keeps being polled.
//!
//! A delivery is acknowledged once it was handled or turned out to be
//! malformed. Anything else stays unacknowledged and is redelivered by the
//! broker.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::{MessageRouter, QueuedRecord, RouterError, RouterResult};
use crate::config::WorkerConfig;
use crate::pubsub::{self, topic, PubSubConnection, PubSubMessage};
use crate::registry::{apply_lifecycle, LifecycleKind, LifecycleRecord, RegistryWriter};

/// How long in-flight deliveries get to finish once the worker stops
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the disconnect gets to reach the broker
const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// What a delivery turned out to be
#[derive(Debug)]
enum Delivery {
    Frame(QueuedRecord),
    Lifecycle(LifecycleKind, LifecycleRecord),
}

impl Delivery {
    fn classify(message: &PubSubMessage, config: &WorkerConfig) -> RouterResult<Self> {
        let lifecycle = [
            (config.created_filter.as_deref(), LifecycleKind::Created),
            (config.deleted_filter.as_deref(), LifecycleKind::Deleted),
        ];
        for (filter, kind) in lifecycle {
            if let Some(filter) = filter {
                if topic::matches(filter, &message.topic) {
                    let record = serde_json::from_slice(&message.payload)?;
                    return Ok(Delivery::Lifecycle(kind, record));
                }
            }
        }

        Ok(Delivery::Frame(QueuedRecord::from_publish(
            &message.topic,
            &message.payload,
        )?))
    }
}

/// Handle deliveries until `shutdown` resolves or the broker closes the connection
///
/// Lifecycle topics are only subscribed when a registry writer is given.
pub async fn run_worker<F>(
    connection: PubSubConnection,
    router: Arc<MessageRouter>,
    registry: Option<Arc<dyn RegistryWriter>>,
    config: WorkerConfig,
    shutdown: F,
) -> RouterResult<()>
where
    F: Future<Output = ()>,
{
    let PubSubConnection {
        publisher,
        mut subscriber,
    } = connection;

    let inbound = topic::shared_filter(config.shared_group.as_deref(), &config.inbound_filter);
    subscriber.subscribe(&inbound).await?;
    info!("Router worker subscribed to {}", inbound);

    if registry.is_some() {
        for filter in [&config.created_filter, &config.deleted_filter]
            .into_iter()
            .flatten()
        {
            subscriber.subscribe(filter).await?;
            info!("Router worker subscribed to lifecycle topic {}", filter);
        }
    }

    let semaphore = Arc::new(Semaphore::new(config.max_in_flight));
    let config = Arc::new(config);
    let mut queued: VecDeque<PubSubMessage> = VecDeque::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Router worker shutting down");
                break;
            }
            permit = semaphore.clone().acquire_owned(), if !queued.is_empty() => {
                let (Ok(permit), Some(message)) = (permit, queued.pop_front()) else {
                    break;
                };
                let router = router.clone();
                let registry = registry.clone();
                let config = config.clone();
                let publisher = publisher.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let outcome =
                        handle_delivery(&router, registry.as_deref(), &config, &message).await;
                    if settle(outcome, &message) {
                        if let Err(e) = publisher.ack(&message).await {
                            warn!("Failed to acknowledge delivery on {}: {}", message.topic, e);
                        }
                    }
                });
            }
            next = subscriber.next_message() => match next {
                Ok(Some(message)) => queued.push_back(message),
                Ok(None) => {
                    warn!("Broker closed the router connection");
                    break;
                }
                Err(e) => {
                    error!("Router connection failed: {}", e);
                    return Err(e.into());
                }
            },
        }
    }

    if !queued.is_empty() {
        info!("Leaving {} queued deliveries for redelivery", queued.len());
    }

    // Let in-flight deliveries finish. Their publishes and acks are flushed
    // while the connection is still being polled; new deliveries are not
    // acknowledged and come back from the broker.
    let drained = semaphore.acquire_many(config.max_in_flight as u32);
    tokio::pin!(drained);
    let drain = async {
        loop {
            tokio::select! {
                _ = &mut drained => break,
                next = subscriber.next_message() => match next {
                    Ok(Some(message)) => debug!("Leaving delivery on {} for redelivery", message.topic),
                    _ => break,
                },
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("In-flight deliveries did not finish within {:?}", DRAIN_TIMEOUT);
    }

    pubsub::release(publisher.as_ref(), subscriber.as_mut(), RELEASE_TIMEOUT).await?;

    info!("Router worker stopped");
    Ok(())
}

/// Whether a handled delivery should be acknowledged
fn settle(outcome: RouterResult<()>, message: &PubSubMessage) -> bool {
    match outcome {
        Ok(()) => true,
        Err(e) if e.is_malformed() => {
            warn!("Discarding delivery on {}: {}", message.topic, e);
            true
        }
        Err(e) => {
            warn!("Failed to handle delivery on {}, leaving it for redelivery: {}", message.topic, e);
            false
        }
    }
}

async fn handle_delivery(
    router: &MessageRouter,
    registry: Option<&dyn RegistryWriter>,
    config: &WorkerConfig,
    message: &PubSubMessage,
) -> RouterResult<()> {
    match Delivery::classify(message, config)? {
        Delivery::Frame(record) => {
            router.handle_record(&record).await?;
        }
        Delivery::Lifecycle(kind, record) => {
            let Some(registry) = registry else {
                debug!("No registry configured, ignoring {:?} event", kind);
                return Ok(());
            };
            apply_lifecycle(registry, kind, &record).await.map_err(|e| {
                error!(
                    "Failed to apply {:?} event for {}: {}",
                    kind, record.charge_point_id, e
                );
                RouterError::from(e)
            })?;
        }
    }
    Ok(())
}
