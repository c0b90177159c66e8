//! Flow record and its state machine

use crate::action::Action;
use crate::error::{CoreError, Result};
use crate::ids::FlowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Key/value context visible to every action of a flow
pub type ShareData = BTreeMap<String, String>;

/// Lifecycle of a flow
///
/// `Init → Pending → Executing → {Success | Failed | Cancelled | TimedOut}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Constructed, not runnable
    Init,
    /// Runnable, queued
    Pending,
    Executing,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Success | FlowState::Failed | FlowState::Cancelled | FlowState::TimedOut
        )
    }

    /// States a completed flow may be cloned from
    pub fn is_cloneable(&self) -> bool {
        matches!(
            self,
            FlowState::Success | FlowState::Cancelled | FlowState::TimedOut
        )
    }

    pub fn can_transition_to(&self, target: FlowState) -> bool {
        match (self, target) {
            (FlowState::Init, FlowState::Pending) => true,
            (FlowState::Pending, FlowState::Executing) => true,
            (FlowState::Pending, FlowState::Cancelled) => true,
            (FlowState::Executing, t) => t.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Init => "init",
            FlowState::Pending => "pending",
            FlowState::Executing => "executing",
            FlowState::Success => "success",
            FlowState::Failed => "failed",
            FlowState::Cancelled => "cancelled",
            FlowState::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "init" => Ok(FlowState::Init),
            "pending" => Ok(FlowState::Pending),
            "executing" => Ok(FlowState::Executing),
            "success" => Ok(FlowState::Success),
            "failed" => Ok(FlowState::Failed),
            "cancelled" => Ok(FlowState::Cancelled),
            "timed_out" => Ok(FlowState::TimedOut),
            other => Err(CoreError::UnknownVariant {
                kind: "flow state",
                value: other.to_string(),
            }),
        }
    }
}

/// A named container of actions plus shared context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub state: FlowState,

    #[serde(default)]
    pub share_data: ShareData,

    pub actions: Vec<Action>,

    /// Free text recorded when the flow was cloned from another
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,

    /// Flow that this one was cloned from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloned_from: Option<FlowId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(name: impl Into<String>, actions: Vec<Action>, share_data: ShareData) -> Self {
        let now = Utc::now();
        Self {
            id: FlowId::generate(),
            name: name.into(),
            state: FlowState::Init,
            share_data,
            actions,
            memo: None,
            cloned_from: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `target`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, target: FlowState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn action(&self, id: &crate::ids::ActionId) -> Option<&Action> {
        self.actions.iter().find(|a| &a.id == id)
    }
}
