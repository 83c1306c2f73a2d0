// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run metadata as seen by the orchestration engine.
//!
//! Runs are referenced, not owned: the engine looks a run up to learn its
//! tags and heartbeat, and follows its current-state pointer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tracked unit of long-lived work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub id: Uuid,
    /// Human-readable run name.
    pub name: String,
    /// Tags, consulted by concurrency limits.
    pub tags: Vec<String>,
    /// Run parameters (opaque to orchestration).
    pub parameters: serde_json::Value,
    /// Id of the current state, if any state was committed.
    pub current_state_id: Option<Uuid>,
    /// Last heartbeat reported by whatever executes the run.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// When the run was registered.
    pub created_at: DateTime<Utc>,
}

/// Request to register a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCreate {
    /// Explicit run id; generated when absent.
    #[serde(default)]
    pub id: Option<Uuid>,
    /// Human-readable run name.
    pub name: String,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl RunCreate {
    /// Run registration with a name and nothing else.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            tags: Vec::new(),
            parameters: serde_json::Value::Null,
        }
    }

    /// Add tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}
