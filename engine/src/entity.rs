//! Entity types and their payload shapes.
//!
//! The queue treats payloads as opaque JSON. Handlers and the backend decode
//! them into the typed structs below through [`EntityPayload::decode`], which
//! also validates them.

use crate::{error::Result, Error, Timestamp};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of entity categories the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    ChatMessage,
    Task,
    CalendarEvent,
    PollVote,
    /// The trip's base camp location. Single source of truth: never queued
    /// offline, since a partially merged location is worse than none.
    #[serde(rename = "basecamp")]
    BaseCamp,
}

impl EntityType {
    /// Every entity type, reserved ones included.
    pub const ALL: [EntityType; 5] = [
        EntityType::ChatMessage,
        EntityType::Task,
        EntityType::CalendarEvent,
        EntityType::PollVote,
        EntityType::BaseCamp,
    ];

    /// Entity types that may go through the offline queue.
    pub const SYNCABLE: [EntityType; 4] = [
        EntityType::ChatMessage,
        EntityType::Task,
        EntityType::CalendarEvent,
        EntityType::PollVote,
    ];

    /// Wire name of this entity type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::ChatMessage => "chat_message",
            EntityType::Task => "task",
            EntityType::CalendarEvent => "calendar_event",
            EntityType::PollVote => "poll_vote",
            EntityType::BaseCamp => "basecamp",
        }
    }

    /// Whether mutations of this type may be queued for later replay.
    pub fn is_syncable(&self) -> bool {
        !matches!(self, EntityType::BaseCamp)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownEntityType(s.to_string()))
    }
}

/// A chat message posted to the trip chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    /// Message this one replies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// A shared to-do item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<Timestamp>,
    #[serde(default)]
    pub completed: bool,
}

/// An entry on the trip calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEventPayload {
    pub title: String,
    pub starts_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// One participant's vote on a poll option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollVotePayload {
    pub poll_id: String,
    pub option_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// The trip's base camp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseCampPayload {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

/// A decoded payload, tagged by entity type.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityPayload {
    ChatMessage(ChatMessagePayload),
    Task(TaskPayload),
    CalendarEvent(CalendarEventPayload),
    PollVote(PollVotePayload),
    BaseCamp(BaseCampPayload),
}

impl EntityPayload {
    /// Decode and validate a raw payload for the given entity type.
    pub fn decode(entity_type: EntityType, value: &serde_json::Value) -> Result<Self> {
        let payload = match entity_type {
            EntityType::ChatMessage => EntityPayload::ChatMessage(from_value(entity_type, value)?),
            EntityType::Task => EntityPayload::Task(from_value(entity_type, value)?),
            EntityType::CalendarEvent => {
                EntityPayload::CalendarEvent(from_value(entity_type, value)?)
            }
            EntityType::PollVote => EntityPayload::PollVote(from_value(entity_type, value)?),
            EntityType::BaseCamp => EntityPayload::BaseCamp(from_value(entity_type, value)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    /// The entity type this payload belongs to.
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPayload::ChatMessage(_) => EntityType::ChatMessage,
            EntityPayload::Task(_) => EntityType::Task,
            EntityPayload::CalendarEvent(_) => EntityType::CalendarEvent,
            EntityPayload::PollVote(_) => EntityType::PollVote,
            EntityPayload::BaseCamp(_) => EntityType::BaseCamp,
        }
    }

    /// Check field-level constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let entity_type = self.entity_type();
        match self {
            EntityPayload::ChatMessage(msg) => require_text(entity_type, "content", &msg.content),
            EntityPayload::Task(task) => require_text(entity_type, "title", &task.title),
            EntityPayload::CalendarEvent(event) => {
                require_text(entity_type, "title", &event.title)?;
                match event.ends_at {
                    Some(ends_at) if ends_at < event.starts_at => Err(Error::InvalidPayload {
                        entity_type,
                        reason: "endsAt is before startsAt".to_string(),
                    }),
                    _ => Ok(()),
                }
            }
            EntityPayload::PollVote(vote) => {
                require_text(entity_type, "pollId", &vote.poll_id)?;
                require_text(entity_type, "optionId", &vote.option_id)
            }
            EntityPayload::BaseCamp(camp) => {
                require_text(entity_type, "address", &camp.address)?;
                if let Some(lat) = camp.latitude {
                    if !(-90.0..=90.0).contains(&lat) {
                        return Err(Error::InvalidPayload {
                            entity_type,
                            reason: format!("latitude {lat} out of range"),
                        });
                    }
                }
                if let Some(lng) = camp.longitude {
                    if !(-180.0..=180.0).contains(&lng) {
                        return Err(Error::InvalidPayload {
                            entity_type,
                            reason: format!("longitude {lng} out of range"),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Re-encode as the JSON shape stored on the wire.
    pub fn to_value(&self) -> serde_json::Value {
        let encoded = match self {
            EntityPayload::ChatMessage(p) => serde_json::to_value(p),
            EntityPayload::Task(p) => serde_json::to_value(p),
            EntityPayload::CalendarEvent(p) => serde_json::to_value(p),
            EntityPayload::PollVote(p) => serde_json::to_value(p),
            EntityPayload::BaseCamp(p) => serde_json::to_value(p),
        };
        // Plain structs with string keys always serialize.
        encoded.unwrap_or(serde_json::Value::Null)
    }
}

fn from_value<T: DeserializeOwned>(entity_type: EntityType, value: &serde_json::Value) -> Result<T> {
    T::deserialize(value).map_err(|e| Error::InvalidPayload {
        entity_type,
        reason: e.to_string(),
    })
}

fn require_text(entity_type: EntityType, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::InvalidPayload {
            entity_type,
            reason: format!("{field} must not be empty"),
        })
    } else {
        Ok(())
    }
}
