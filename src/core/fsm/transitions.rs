// src/core/fsm/transitions.rs

//! Lifecycle state enums and the enumerated set of valid transitions.
//!
//! Transitions are validated here, at the edge of the durable store: an
//! un-enumerated move fails with `InvalidTransition` before any state,
//! in-memory or durable, is touched.

use crate::core::UeeError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use strum_macros::{Display, EnumString};

/// Lifecycle states of a provider FSM.
#[derive(
    Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderState {
    Idle,
    Acquiring,
    Running,
    WaitingQuota,
    WaitingBackoff,
    Paused,
    Terminated,
}

impl ProviderState {
    /// States in which a provider must hold zero permits.
    pub fn requires_zero_permits(&self) -> bool {
        !matches!(self, ProviderState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderState::Terminated)
    }
}

/// Lifecycle states of the process-wide orchestrator FSM.
#[derive(
    Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MacroState {
    Bootstrapping,
    Orchestrating,
    Stabilizing,
    Draining,
}

static PROVIDER_TRANSITIONS: Lazy<HashSet<(ProviderState, ProviderState)>> = Lazy::new(|| {
    use ProviderState::*;
    let mut set = HashSet::new();
    for (from, to) in [
        (Idle, Acquiring),
        (Acquiring, Running),
        (Acquiring, WaitingQuota),
        (Running, WaitingQuota),
        (Running, WaitingBackoff),
        (Running, Paused),
        (WaitingQuota, Acquiring),
        (WaitingBackoff, Acquiring),
        (Paused, Acquiring),
    ] {
        set.insert((from, to));
    }
    // Stop is valid from every non-terminal state.
    for from in [Idle, Acquiring, Running, WaitingQuota, WaitingBackoff, Paused] {
        set.insert((from, Terminated));
    }
    set
});

static MACRO_TRANSITIONS: Lazy<HashSet<(MacroState, MacroState)>> = Lazy::new(|| {
    use MacroState::*;
    HashSet::from([
        (Bootstrapping, Orchestrating),
        (Orchestrating, Stabilizing),
        (Stabilizing, Orchestrating),
        (Bootstrapping, Draining),
        (Orchestrating, Draining),
        (Stabilizing, Draining),
    ])
});

/// Checks a provider transition against the enumerated set.
pub fn check_provider_transition(
    from: ProviderState,
    to: ProviderState,
) -> Result<(), UeeError> {
    if PROVIDER_TRANSITIONS.contains(&(from, to)) {
        Ok(())
    } else {
        Err(UeeError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Checks an orchestrator transition against the enumerated set.
pub fn check_macro_transition(from: MacroState, to: MacroState) -> Result<(), UeeError> {
    if MACRO_TRANSITIONS.contains(&(from, to)) {
        Ok(())
    } else {
        Err(UeeError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
