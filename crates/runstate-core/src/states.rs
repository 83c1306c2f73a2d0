// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run state data model and the structural transition table.
//!
//! A [`State`] is an immutable snapshot of a run's status. Once committed it is
//! never mutated; a "change" is always a new `State` that becomes current.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of run state types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    /// Run is scheduled to start at (or after) a point in time.
    Scheduled,
    /// Run has been claimed and is about to start.
    Pending,
    /// Run is executing.
    Running,
    /// Run is paused and may resume.
    Paused,
    /// Run finished successfully.
    Completed,
    /// Run finished with an error.
    Failed,
    /// Run was cancelled.
    Cancelled,
    /// Run stopped unexpectedly (infrastructure failure, lost heartbeat).
    Crashed,
}

impl StateType {
    /// Every state type, in lifecycle order.
    pub const ALL: [StateType; 8] = [
        StateType::Scheduled,
        StateType::Pending,
        StateType::Running,
        StateType::Paused,
        StateType::Completed,
        StateType::Failed,
        StateType::Cancelled,
        StateType::Crashed,
    ];

    /// Check if this is a terminal state type.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StateType::Completed | StateType::Failed | StateType::Cancelled | StateType::Crashed
        )
    }

    /// Returns the storage representation of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Scheduled => "SCHEDULED",
            StateType::Pending => "PENDING",
            StateType::Running => "RUNNING",
            StateType::Paused => "PAUSED",
            StateType::Completed => "COMPLETED",
            StateType::Failed => "FAILED",
            StateType::Cancelled => "CANCELLED",
            StateType::Crashed => "CRASHED",
        }
    }

    /// Default display name for states of this type.
    pub fn default_name(&self) -> &'static str {
        match self {
            StateType::Scheduled => "Scheduled",
            StateType::Pending => "Pending",
            StateType::Running => "Running",
            StateType::Paused => "Paused",
            StateType::Completed => "Completed",
            StateType::Failed => "Failed",
            StateType::Cancelled => "Cancelled",
            StateType::Crashed => "Crashed",
        }
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StateType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SCHEDULED" => Ok(StateType::Scheduled),
            "PENDING" => Ok(StateType::Pending),
            "RUNNING" => Ok(StateType::Running),
            "PAUSED" => Ok(StateType::Paused),
            "COMPLETED" => Ok(StateType::Completed),
            "FAILED" => Ok(StateType::Failed),
            "CANCELLED" => Ok(StateType::Cancelled),
            "CRASHED" => Ok(StateType::Crashed),
            _ => Err(format!("Unknown state type: {}", s)),
        }
    }
}

/// Baseline transition legality, independent of any rule.
///
/// Any non-terminal type may move to any type (itself included); nothing
/// leaves a terminal type.
pub fn is_transition_structurally_allowed(from: StateType, _to: StateType) -> bool {
    !from.is_terminal()
}

/// Structural check against an optional current state.
///
/// A run without a current state may enter any type.
pub fn is_structurally_allowed_from(initial: Option<&State>, to: StateType) -> bool {
    match initial {
        Some(state) => is_transition_structurally_allowed(state.state_type, to),
        None => true,
    }
}

/// Type-specific details attached to a state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDetails {
    /// When a scheduled run becomes eligible to start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
}

/// An immutable, timestamped snapshot of a run's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Unique state identifier, assigned at creation.
    pub id: Uuid,
    /// Run this state belongs to.
    pub run_id: Uuid,
    /// State type.
    #[serde(rename = "type")]
    pub state_type: StateType,
    /// Display name (defaults to the type's name).
    pub name: String,
    /// Optional human-readable annotation.
    pub message: Option<String>,
    /// Optional opaque payload (result reference or error detail).
    pub data: Option<serde_json::Value>,
    /// Type-specific details.
    #[serde(default)]
    pub details: StateDetails,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl State {
    /// Build a fresh state for a run with a new id and the current time.
    pub fn new(run_id: Uuid, state_type: StateType) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            state_type,
            name: state_type.default_name().to_string(),
            message: None,
            data: None,
            details: StateDetails::default(),
            timestamp: Utc::now(),
        }
    }

    /// Set the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the data payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Set the scheduled time.
    pub fn with_scheduled_time(mut self, scheduled_time: DateTime<Utc>) -> Self {
        self.details.scheduled_time = Some(scheduled_time);
        self
    }

    /// Check if this state is terminal.
    pub fn is_terminal(&self) -> bool {
        self.state_type.is_terminal()
    }

    /// Whether `other` asserts the same status as `self`: same type, payload and details.
    ///
    /// Ids, names, messages and timestamps are ignored.
    pub fn is_same_assertion(&self, other: &State) -> bool {
        self.state_type == other.state_type
            && self.data == other.data
            && self.details == other.details
    }
}

/// A caller-supplied state proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateCreate {
    /// Proposed state type.
    #[serde(rename = "type")]
    pub state_type: StateType,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Optional message.
    #[serde(default)]
    pub message: Option<String>,
    /// Optional data payload.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Optional details.
    #[serde(default)]
    pub details: StateDetails,
}

impl StateCreate {
    /// Proposal of a bare state type.
    pub fn new(state_type: StateType) -> Self {
        Self {
            state_type,
            name: None,
            message: None,
            data: None,
            details: StateDetails::default(),
        }
    }

    /// Convert into a full state for `run_id`, assigning an id and timestamp.
    pub fn into_state(self, run_id: Uuid) -> State {
        State {
            id: Uuid::new_v4(),
            run_id,
            state_type: self.state_type,
            name: self
                .name
                .unwrap_or_else(|| self.state_type.default_name().to_string()),
            message: self.message,
            data: self.data,
            details: self.details,
            timestamp: Utc::now(),
        }
    }
}

impl From<StateType> for StateCreate {
    fn from(state_type: StateType) -> Self {
        Self::new(state_type)
    }
}
