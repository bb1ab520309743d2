//! Action dispatch
//!
//! [`MessageRouter::dispatch`] is pure: it maps a Call to its response and
//! the shadow update it implies. [`MessageRouter::handle_call`] then performs
//! the side effects (shadow write, response publish).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn, Instrument};

use super::{QueuedRecord, RouterResult};
use crate::config::{RouterConfig, UnsupportedActionPolicy};
use crate::ocpp::{
    Action, BootNotificationRequest, BootNotificationResponse, Call, DeviceId, ErrorCode,
    HeartbeatResponse, NotImplementedPayload, OcppMessage, RegistrationStatus,
    StatusNotificationRequest, StatusNotificationResponse,
};
use crate::pubsub::Publisher;
use crate::shadow::ShadowStore;

/// Response to a Call and the shadow update it implies
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub response: OcppMessage,
    /// Attributes to store as the device's reported state
    pub reported: Option<Value>,
}

/// What handling one envelope produced
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A response was published on the device's `out` topic
    Responded {
        response: OcppMessage,
        shadow_updated: bool,
    },
    /// Not a Call; nothing to answer
    Ignored,
}

pub struct MessageRouter {
    publisher: Arc<dyn Publisher>,
    shadow: Arc<dyn ShadowStore>,
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        shadow: Arc<dyn ShadowStore>,
        config: RouterConfig,
    ) -> Self {
        Self {
            publisher,
            shadow,
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Build the response for `call` as of `now`. Every response carries the Call's unique id.
    pub fn dispatch(&self, call: &Call, now: DateTime<Utc>) -> RouterResult<Dispatch> {
        let (response, reported) = match call.known_action() {
            Some(Action::BootNotification) => {
                match serde_json::from_value::<BootNotificationRequest>(call.payload.clone()) {
                    Ok(request) => debug!(
                        "BootNotification: {} {} ({:?})",
                        request.charging_station.vendor_name,
                        request.charging_station.model,
                        request.reason
                    ),
                    Err(e) => debug!("BootNotification payload not in 2.0.1 shape: {}", e),
                }

                let response = call.result(BootNotificationResponse {
                    current_time: now,
                    interval: self.config.heartbeat_interval,
                    status: RegistrationStatus::Accepted,
                    status_info: None,
                })?;
                (OcppMessage::CallResult(response), Some(call.payload.clone()))
            }
            Some(Action::Heartbeat) => {
                let response = call.result(HeartbeatResponse { current_time: now })?;
                (OcppMessage::CallResult(response), None)
            }
            Some(Action::StatusNotification) => {
                if let Ok(request) =
                    serde_json::from_value::<StatusNotificationRequest>(call.payload.clone())
                {
                    debug!(
                        "StatusNotification: EVSE {} connector {} is {:?}",
                        request.evse_id, request.connector_id, request.connector_status
                    );
                }
                let response = call.result(StatusNotificationResponse {})?;
                (OcppMessage::CallResult(response), None)
            }
            None => (self.not_implemented(call)?, None),
        };

        Ok(Dispatch { response, reported })
    }

    fn not_implemented(&self, call: &Call) -> RouterResult<OcppMessage> {
        let description = format!("Command [{}] not implemented.", call.action);
        info!("{}", description);

        Ok(match self.config.unsupported_action {
            UnsupportedActionPolicy::CallError => {
                OcppMessage::CallError(call.error(ErrorCode::NotImplemented, description))
            }
            UnsupportedActionPolicy::CallResult => OcppMessage::CallResult(call.result(
                NotImplementedPayload { error: description },
            )?),
        })
    }

    /// Dispatch, update the shadow, publish the response to `<id>/out`
    ///
    /// A failed shadow write is logged and does not hold back the response.
    pub async fn handle_call(&self, id: &DeviceId, call: &Call) -> RouterResult<DispatchOutcome> {
        debug!("Dispatching {} [{}]", call.action, call.unique_id);
        let Dispatch { response, reported } = self.dispatch(call, Utc::now())?;

        let mut shadow_updated = false;
        if let Some(attributes) = &reported {
            match self.shadow.update_reported(id, attributes).await {
                Ok(()) => shadow_updated = true,
                Err(e) => warn!("Shadow update for {} failed: {}", id, e),
            }
        }

        self.publisher
            .publish(&id.out_topic(), response.to_bytes()?)
            .await?;

        Ok(DispatchOutcome::Responded {
            response,
            shadow_updated,
        })
    }

    /// Decode and handle one queued record
    pub async fn handle_record(&self, record: &QueuedRecord) -> RouterResult<DispatchOutcome> {
        let span = tracing::info_span!("record", device = %record.charge_point_id);

        async {
            match record.envelope()? {
                OcppMessage::Call(call) => self.handle_call(&record.charge_point_id, &call).await,
                other => {
                    info!(
                        "Ignoring {} [{}] from charge point",
                        match other {
                            OcppMessage::CallResult(_) => "CALLRESULT",
                            _ => "CALLERROR",
                        },
                        other.unique_id()
                    );
                    Ok(DispatchOutcome::Ignored)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Handle records in order, stopping at the first failure
    ///
    /// Returns how many records were handled. On failure the whole batch is
    /// expected to be redelivered, so earlier records may be answered twice.
    pub async fn handle_batch(&self, records: &[QueuedRecord]) -> RouterResult<usize> {
        for (index, record) in records.iter().enumerate() {
            if let Err(e) = self.handle_record(record).await {
                warn!(
                    "Record {} of {} from {} failed: {}",
                    index + 1,
                    records.len(),
                    record.charge_point_id,
                    e
                );
                return Err(e);
            }
        }
        Ok(records.len())
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
