//! Transaction processing: dedup, parse, route, dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::ledger::TransactionLedger;
use crate::error::BridgeResult;
use crate::events::{EventKind, MatrixEvent, Membership};
use crate::mapper::IdentityMapper;
use crate::sync::platform::LocalPlatform;

/// Receiver of routed events; the channel id is already resolved
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_message(&self, event: &MatrixEvent, channel_id: &str) -> BridgeResult<()>;

    async fn on_reaction(&self, event: &MatrixEvent, channel_id: &str) -> BridgeResult<()>;

    async fn on_redaction(&self, event: &MatrixEvent, channel_id: &str) -> BridgeResult<()>;

    async fn on_membership(&self, event: &MatrixEvent, channel_id: &str) -> BridgeResult<()>;
}

/// Why an event produced no side effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Room has no channel and could not be bootstrapped
    Unmapped,
    /// Sent by one of our own ghosts
    OwnGhost,
    /// Kind the bridge does not mirror
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied {
        event_id: String,
    },
    /// A direct channel was created and mapped for the room
    Bootstrapped {
        event_id: String,
        channel_id: String,
    },
    Ignored {
        event_id: String,
        reason: IgnoreReason,
    },
    Failed {
        event_id: Option<String>,
        reason: String,
    },
}

impl EventOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, EventOutcome::Failed { .. })
    }
}

/// Result of one pushed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReport {
    pub txn_id: String,
    /// Redelivery inside the retention window; nothing was processed
    pub duplicate: bool,
    pub outcomes: Vec<EventOutcome>,
}

impl TransactionReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }
}

pub struct TransactionProcessor {
    ledger: Arc<TransactionLedger>,
    mapper: Arc<IdentityMapper>,
    handler: Arc<dyn EventHandler>,
    platform: Arc<dyn LocalPlatform>,
}

impl TransactionProcessor {
    pub fn new(
        ledger: Arc<TransactionLedger>,
        mapper: Arc<IdentityMapper>,
        handler: Arc<dyn EventHandler>,
        platform: Arc<dyn LocalPlatform>,
    ) -> Self {
        Self {
            ledger,
            mapper,
            handler,
            platform,
        }
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    pub fn mapper(&self) -> &IdentityMapper {
        &self.mapper
    }

    /// Process a pushed batch once per transaction id
    pub async fn process(&self, txn_id: &str, events: Vec<Value>) -> TransactionReport {
        if !self.ledger.try_record(txn_id) {
            debug!("Transaction {} already processed, skipping", txn_id);
            return TransactionReport {
                txn_id: txn_id.to_string(),
                duplicate: true,
                outcomes: Vec::new(),
            };
        }

        let mut outcomes = Vec::with_capacity(events.len());
        for raw in events {
            outcomes.push(self.route(raw).await);
        }

        let report = TransactionReport {
            txn_id: txn_id.to_string(),
            duplicate: false,
            outcomes,
        };
        if report.failed() > 0 {
            warn!(
                "Transaction {}: {} of {} events failed",
                txn_id,
                report.failed(),
                report.outcomes.len()
            );
        }
        report
    }

    async fn route(&self, raw: Value) -> EventOutcome {
        let event_id_hint = raw
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let event = match MatrixEvent::from_value(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping unparseable event {:?}: {}", event_id_hint, e);
                return EventOutcome::Failed {
                    event_id: event_id_hint,
                    reason: e.to_string(),
                };
            }
        };

        match self.route_event(&event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "Failed to handle {} {} in {}: {}",
                    event.event_type, event.event_id, event.room_id, e
                );
                EventOutcome::Failed {
                    event_id: Some(event.event_id.clone()),
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn route_event(&self, event: &MatrixEvent) -> BridgeResult<EventOutcome> {
        let ignored = |reason| EventOutcome::Ignored {
            event_id: event.event_id.clone(),
            reason,
        };

        let mut bootstrapped = None;
        let channel_id = match self.mapper.channel_for_room(&event.room_id).await? {
            Some(channel_id) => channel_id,
            None => {
                let bootstrappable = event
                    .as_member()
                    .is_some_and(|m| matches!(m.membership(), Membership::Join | Membership::Invite));
                if bootstrappable {
                    match self.bootstrap_direct_channel(event).await? {
                        Some(channel_id) => {
                            bootstrapped = Some(channel_id.clone());
                            channel_id
                        }
                        None => return Ok(ignored(IgnoreReason::Unmapped)),
                    }
                } else {
                    if event.kind == EventKind::Message {
                        debug!(
                            "Message {} in unmapped room {} cannot bootstrap a direct channel",
                            event.event_id, event.room_id
                        );
                    }
                    return Ok(ignored(IgnoreReason::Unmapped));
                }
            }
        };

        let finished = |fallback: EventOutcome| match &bootstrapped {
            Some(channel_id) => EventOutcome::Bootstrapped {
                event_id: event.event_id.clone(),
                channel_id: channel_id.clone(),
            },
            None => fallback,
        };

        if self.mapper.is_ghost_user(&event.sender) {
            return Ok(finished(ignored(IgnoreReason::OwnGhost)));
        }

        match event.kind {
            EventKind::Message => self.handler.on_message(event, &channel_id).await?,
            EventKind::Reaction => self.handler.on_reaction(event, &channel_id).await?,
            EventKind::Redaction => self.handler.on_redaction(event, &channel_id).await?,
            EventKind::Member => self.handler.on_membership(event, &channel_id).await?,
            EventKind::BridgeMetadata | EventKind::Other => {
                return Ok(finished(ignored(IgnoreReason::Unsupported)));
            }
        }

        Ok(finished(EventOutcome::Applied {
            event_id: event.event_id.clone(),
        }))
    }

    /// Map an unmapped room to a direct channel when a ghost and a real
    /// Matrix user meet in it.
    async fn bootstrap_direct_channel(&self, event: &MatrixEvent) -> BridgeResult<Option<String>> {
        let (Some(member), Some(target)) = (event.as_member(), event.membership_target()) else {
            return Ok(None);
        };
        let actor = event.sender.as_str();

        let (ghost, remote_user) = match (
            self.mapper.is_ghost_user(actor),
            self.mapper.is_ghost_user(target),
        ) {
            (true, false) => (actor, target),
            (false, true) => (target, actor),
            _ => {
                debug!(
                    "Membership {} in {} is not between a ghost and a Matrix user",
                    event.event_id, event.room_id
                );
                return Ok(None);
            }
        };

        let Some(local_user_id) = self.mapper.verified_ghost_local_id(ghost).await? else {
            debug!("{} is in our namespace but was never created by the bridge", ghost);
            return Ok(None);
        };

        let display_name = if target == remote_user {
            member.displayname.as_deref()
        } else {
            None
        };
        let remote_local_id = self
            .platform
            .ensure_remote_user(remote_user, display_name)
            .await?;
        let channel_id = self
            .platform
            .direct_channel(&local_user_id, &remote_local_id)
            .await?;
        self.mapper
            .map_channel_to_room(&channel_id, &event.room_id)
            .await?;

        if member.membership() == Membership::Invite && target == ghost {
            self.mapper
                .client()
                .join_room_as_user(&event.room_id, ghost)
                .await?;
        }

        info!(
            "Bootstrapped direct channel {} for room {} ({} <-> {})",
            channel_id, event.room_id, ghost, remote_user
        );
        Ok(Some(channel_id))
    }
}
