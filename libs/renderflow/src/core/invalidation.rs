// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Invalidation levels and processor lifecycle states.

use serde::{Deserialize, Serialize};

/// How much of a processor's work must be redone before its outputs are
/// trustworthy again.
///
/// Levels are strictly ordered: invalidating a processor always takes the
/// maximum of its current level and the requested one, and only the scheduler
/// resets a processor to [`Valid`](InvalidationLevel::Valid) after a completed
/// pass. Levels at or above [`InvalidPorts`](InvalidationLevel::InvalidPorts)
/// signal a topology change and force a network rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InvalidationLevel {
    /// Outputs are up to date, no recomputation needed.
    Valid,
    /// Only the result data must be recomputed.
    InvalidResult,
    /// Parameters changed; derived state must be refreshed before processing.
    InvalidParameters,
    /// Traversal/path-dependent state must be recomputed.
    InvalidPath,
    /// Shader/program-equivalent state must be rebuilt.
    InvalidProgram,
    /// The processor's port set changed; network topology must be re-derived.
    InvalidPorts,
    /// The processor itself must be torn down and recreated.
    InvalidProcessor,
}

impl InvalidationLevel {
    /// True if this level requires the processor to run during the next pass.
    pub fn needs_processing(self) -> bool {
        self != Self::Valid
    }

    /// True if this level forces the evaluator to rebuild the network
    /// topology before the next pass.
    pub fn alters_topology(self) -> bool {
        self >= Self::InvalidPorts
    }
}

impl std::fmt::Display for InvalidationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Valid => write!(f, "Valid"),
            Self::InvalidResult => write!(f, "InvalidResult"),
            Self::InvalidParameters => write!(f, "InvalidParameters"),
            Self::InvalidPath => write!(f, "InvalidPath"),
            Self::InvalidProgram => write!(f, "InvalidProgram"),
            Self::InvalidPorts => write!(f, "InvalidPorts"),
            Self::InvalidProcessor => write!(f, "InvalidProcessor"),
        }
    }
}

/// Lifecycle state of a processor instance.
///
/// `NotInitialized -> NotReady` on successful `initialize()`, back to
/// `NotInitialized` on `deinitialize()` (including the cleanup path after a
/// failed initialize). `Ready` is a cached reflection of the most recent
/// readiness check performed by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessorState {
    /// No resources acquired yet, or released again.
    NotInitialized,
    /// Initialized, but inputs are missing or incomplete.
    NotReady,
    /// Initialized and all required ports are satisfied.
    Ready,
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self::NotInitialized
    }
}

impl ProcessorState {
    pub fn is_initialized(self) -> bool {
        self != Self::NotInitialized
    }
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "NotInitialized"),
            Self::NotReady => write!(f, "NotReady"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(InvalidationLevel::Valid < InvalidationLevel::InvalidResult);
        assert!(InvalidationLevel::InvalidResult < InvalidationLevel::InvalidParameters);
        assert!(InvalidationLevel::InvalidParameters < InvalidationLevel::InvalidPath);
        assert!(InvalidationLevel::InvalidPath < InvalidationLevel::InvalidProgram);
        assert!(InvalidationLevel::InvalidProgram < InvalidationLevel::InvalidPorts);
        assert!(InvalidationLevel::InvalidPorts < InvalidationLevel::InvalidProcessor);
    }

    #[test]
    fn test_topology_threshold() {
        assert!(!InvalidationLevel::InvalidProgram.alters_topology());
        assert!(InvalidationLevel::InvalidPorts.alters_topology());
        assert!(InvalidationLevel::InvalidProcessor.alters_topology());
    }

    #[test]
    fn test_state_transitions() {
        let state = ProcessorState::default();
        assert_eq!(state, ProcessorState::NotInitialized);
        assert!(!state.is_initialized());
        assert!(ProcessorState::NotReady.is_initialized());
        assert!(ProcessorState::Ready.is_initialized());
    }
}
