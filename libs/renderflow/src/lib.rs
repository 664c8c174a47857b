// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! renderflow — dataflow core for interactive volume rendering.
//!
//! A rendering pipeline is a [`ProcessorNetwork`]: processors connected by
//! typed ports, configured through properties, kept consistent by an
//! invalidation protocol. A [`NetworkEvaluator`] derives a topological
//! execution order from the network (unrolling bounded loops), drives
//! processor lifecycle, executes passes and assigns shared render targets.
//!
//! ```no_run
//! use renderflow::prelude::*;
//! use parking_lot::RwLock;
//! use std::sync::Arc;
//!
//! # fn main() -> renderflow::Result<()> {
//! let mut network = ProcessorNetwork::new();
//! let source = network.add_processor(Box::new(VolumeSource))?;
//! let canvas_proc = Canvas::new();
//! let frame = canvas_proc.frame_handle();
//! let raycaster = network.add_processor(Box::new(MipRaycaster))?;
//! let canvas = network.add_processor(Box::new(canvas_proc))?;
//!
//! network.connect_ports(
//!     &PortRef::new(&source, "volume"),
//!     &PortRef::new(&raycaster, "volume"),
//! );
//! network.connect_ports(
//!     &PortRef::new(&raycaster, "image"),
//!     &PortRef::new(&canvas, "image"),
//! );
//!
//! let mut evaluator = NetworkEvaluator::new();
//! evaluator.set_network(Some(Arc::new(RwLock::new(network))), false);
//! evaluator.process();
//!
//! assert!(frame.read().is_some());
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use core::{
    default_registry,
    Canvas,
    DedicatedTargets,
    EvaluationRequest,
    EvaluatorEvent,
    FlowError,
    Geometry,
    GraphicsContext,
    HeadlessContext,
    IdentityLinkEvaluator,
    InitContext,
    InvalidationLevel,
    LinkEvaluator,
    LivenessSharing,
    LoopEdgePolicy,
    MipRaycaster,
    NetworkDefinition,
    NetworkEvaluator,
    NetworkEvent,
    NetworkGraph,
    Port,
    PortData,
    PortDescriptor,
    PortDirection,
    PortRef,
    PortType,
    PresentedFrame,
    ProcessContext,
    Processor,
    ProcessorDescriptor,
    ProcessorNetwork,
    ProcessorNode,
    ProcessorRegistry,
    ProcessorState,
    Property,
    PropertyDescriptor,
    PropertyLink,
    PropertyRef,
    PropertyValue,
    ReadyState,
    RenderTarget,
    RenderTargetId,
    RenderTargetPool,
    Result,
    ScaleLinkEvaluator,
    SizeRole,
    SubscriberId,
    TargetAssignmentStrategy,
    Volume,
    VolumeSmoothing,
    VolumeSource,
};

/// Everything a pipeline author typically needs.
pub mod prelude {
    pub use crate::core::{
        Canvas, EvaluationRequest, FlowError, GraphicsContext, HeadlessContext, InitContext,
        InvalidationLevel, MipRaycaster, NetworkDefinition, NetworkEvaluator, PortData,
        PortDescriptor, PortRef, PortType, ProcessContext, Processor, ProcessorDescriptor,
        ProcessorNetwork, ProcessorRegistry, PropertyDescriptor, PropertyRef, PropertyValue,
        Result, VolumeSmoothing, VolumeSource,
    };
}
