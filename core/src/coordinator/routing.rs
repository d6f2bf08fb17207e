// Message routing and application data records.

use serde_json::Value;
use tracing::{debug, info};

use super::Coordinator;
use crate::data::DataRecord;
use crate::notify::Notification;
use crate::router::{PendingMessage, RouteOutcome};
use crate::CoordinatorError;

impl Coordinator {
    /// Deliver over a live link to `target`, or persist for later replay.
    pub async fn route(
        &mut self,
        target: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<RouteOutcome, CoordinatorError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(CoordinatorError::MissingTarget);
        }

        let message = PendingMessage::new(target, message_type, payload, self.now());
        let Some(via) = self.router.select_link(&self.tracker, target).cloned() else {
            self.persist("queue message", &message).await;
            self.router.record_queued();
            debug!("No link to {}, stored {}", target, message.id);
            return Ok(RouteOutcome::Queued {
                message_id: message.id,
            });
        };

        self.router.record_delivered();
        debug!("Routing {} to {} via {}", message.id, target, via);
        self.publish(Notification::SendMessage {
            message_id: message.id.clone(),
            target_peer: message.target_peer,
            via: via.clone(),
            message_type: message.message_type,
            payload: message.payload,
            replayed: false,
        });
        Ok(RouteOutcome::Delivered {
            message_id: message.id,
            via,
        })
    }

    /// Stored messages newest first, optionally for one target.
    pub async fn pending_messages(
        &mut self,
        target: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PendingMessage>, CoordinatorError> {
        let result = match target.map(str::trim).filter(|t| !t.is_empty()) {
            Some(target) => {
                let found = self.store.find_by::<PendingMessage>("target", target).await;
                found.map(|mut messages| {
                    messages.truncate(limit);
                    messages
                })
            }
            None => self.store.all::<PendingMessage>(Some(limit)).await,
        };
        self.note_store("list messages", result)
    }

    /// Keep an application record and fan it out to the mesh.
    pub async fn store_data(&mut self, input: Value) -> DataRecord {
        let record = DataRecord::from_input(input, self.now());
        self.persist("store data", &record).await;
        info!("Stored data record {}", record.id);
        self.publish(Notification::DataBroadcast {
            record: record.clone(),
        });
        record
    }

    pub async fn list_data(&mut self, limit: usize) -> Result<Vec<DataRecord>, CoordinatorError> {
        let all = self.store.all::<DataRecord>(Some(limit)).await;
        self.note_store("list data", all)
    }
}
