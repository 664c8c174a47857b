// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Link records owned by the network.

use crate::core::ports::PortRef;
use crate::core::properties::{LinkEvaluator, PropertyRef};

/// Keeps two properties synchronized through an evaluator function,
/// independent of the dataflow port graph.
pub struct PropertyLink {
    pub source: PropertyRef,
    pub target: PropertyRef,
    pub evaluator: Box<dyn LinkEvaluator>,
}

impl PropertyLink {
    pub fn new(source: PropertyRef, target: PropertyRef, evaluator: Box<dyn LinkEvaluator>) -> Self {
        Self {
            source,
            target,
            evaluator,
        }
    }

    /// Two links are equivalent when endpoints and evaluator id coincide.
    pub fn is_equivalent(&self, source: &PropertyRef, target: &PropertyRef, evaluator_id: &str) -> bool {
        self.source == *source && self.target == *target && self.evaluator.id() == evaluator_id
    }

    pub fn touches_processor(&self, processor: &str) -> bool {
        self.source.processor == processor || self.target.processor == processor
    }
}

impl std::fmt::Debug for PropertyLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyLink")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("evaluator", &self.evaluator.id())
            .finish()
    }
}

/// Propagates a render size from an origin render port to a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSizeLink {
    pub origin: PortRef,
    pub receiver: PortRef,
}

impl RenderSizeLink {
    pub fn new(origin: PortRef, receiver: PortRef) -> Self {
        Self { origin, receiver }
    }

    pub fn touches_processor(&self, processor: &str) -> bool {
        self.origin.processor == processor || self.receiver.processor == processor
    }
}
