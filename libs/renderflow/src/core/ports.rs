//! Typed connection endpoints owned by processors.
//!
//! A [`Port`] is declared through a [`PortDescriptor`] and carries the runtime
//! connection state the scheduler works with: the mirrored connection list,
//! the data-changed flag, the payload slot of outports, loop iteration
//! counters, and the render-target assignment of render ports.
//!
//! Connection legality is decided at the network level (it needs both
//! endpoints and the dependency graph); this module provides the port-local
//! part of that predicate.

use crate::core::data::{Geometry, Volume};
use crate::core::error::{FlowError, Result};
use crate::core::invalidation::InvalidationLevel;
use crate::core::render_target::RenderTargetId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default size render targets are created with until a size link overrides it.
pub const DEFAULT_RENDER_SIZE: [u32; 2] = [256, 256];

/// Direction of a port, seen from its owning processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDirection {
    /// Consumes data produced by a connected outport.
    In,
    /// Produces data for connected inports.
    Out,
}

/// Concrete payload type of a port. Two ports connect only if their types
/// are exactly equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Volume,
    Render,
    Geometry,
    Data,
}

/// Role of a render port in render-size propagation.
///
/// Size flows from an origin (typically a canvas inport) to receivers
/// (typically the render outports feeding it); the reverse direction is
/// rejected when creating a size link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeRole {
    Origin,
    Receiver,
}

/// Address of a port: processor name plus port id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub processor: String,
    pub port: String,
}

impl PortRef {
    pub fn new(processor: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            processor: processor.into(),
            port: port.into(),
        }
    }

    /// Parse `"processor.port"` into a reference.
    pub fn parse(address: &str) -> Result<Self> {
        let (processor, port) = address.split_once('.').ok_or_else(|| {
            FlowError::PortNotFound(format!(
                "invalid port address '{address}', expected 'processor.port'"
            ))
        })?;
        Ok(Self::new(processor, port))
    }
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.processor, self.port)
    }
}

/// Static declaration of a port, produced by a processor's descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub id: String,
    pub direction: PortDirection,
    pub port_type: PortType,
    /// Required ports gate processor readiness; optional ports do not.
    pub required: bool,
    /// Whether an inport accepts more than one connection. Outports always do.
    pub allow_multiple: bool,
    /// `Some(n)` designates a loop port iterated `n` times per pass.
    pub loop_iterations: Option<usize>,
    /// Render-size propagation role (render ports only).
    pub size_role: Option<SizeRole>,
    /// Private render ports are not connectable but still receive a target.
    pub private: bool,
    /// Coprocessor ports connect control collaborations instead of data flow;
    /// they participate in readiness and graph edges like regular ports.
    pub co_processor: bool,
    /// Invalidation level raised on the owner when new data arrives here.
    pub change_level: InvalidationLevel,
}

impl PortDescriptor {
    pub fn inport(id: impl Into<String>, port_type: PortType) -> Self {
        Self::new(id, PortDirection::In, port_type)
    }

    pub fn outport(id: impl Into<String>, port_type: PortType) -> Self {
        Self::new(id, PortDirection::Out, port_type)
    }

    fn new(id: impl Into<String>, direction: PortDirection, port_type: PortType) -> Self {
        Self {
            id: id.into(),
            direction,
            port_type,
            required: true,
            allow_multiple: direction == PortDirection::Out,
            loop_iterations: None,
            size_role: None,
            private: false,
            co_processor: false,
            change_level: InvalidationLevel::InvalidResult,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn multiple(mut self) -> Self {
        self.allow_multiple = true;
        self
    }

    /// Designate this port as a loop port with the given iteration count.
    pub fn looping(mut self, iterations: usize) -> Self {
        self.loop_iterations = Some(iterations);
        self
    }

    pub fn size_origin(mut self) -> Self {
        self.size_role = Some(SizeRole::Origin);
        self
    }

    pub fn size_receiver(mut self) -> Self {
        self.size_role = Some(SizeRole::Receiver);
        self
    }

    /// Mark a render port as private: it never connects but the evaluator
    /// still assigns a render target to it.
    pub fn private_render(mut self) -> Self {
        self.private = true;
        self.required = false;
        self
    }

    pub fn co_processor(mut self) -> Self {
        self.co_processor = true;
        self
    }

    pub fn with_change_level(mut self, level: InvalidationLevel) -> Self {
        self.change_level = level;
        self
    }
}

/// Payload held by an outport.
#[derive(Debug, Clone)]
pub enum PortData {
    Volume(Arc<Volume>),
    Geometry(Arc<Geometry>),
    Render(RenderTargetId),
    Data(serde_json::Value),
}

impl PortData {
    pub fn port_type(&self) -> PortType {
        match self {
            Self::Volume(_) => PortType::Volume,
            Self::Geometry(_) => PortType::Geometry,
            Self::Render(_) => PortType::Render,
            Self::Data(_) => PortType::Data,
        }
    }
}

/// A port instance with its runtime state.
#[derive(Debug, Clone)]
pub struct Port {
    descriptor: PortDescriptor,
    has_changed: bool,
    connections: Vec<PortRef>,
    data: Option<PortData>,
    loop_iteration: Option<usize>,
    render_target: Option<RenderTargetId>,
    render_size: [u32; 2],
}

impl Port {
    pub(crate) fn new(descriptor: PortDescriptor) -> Self {
        Self {
            descriptor,
            has_changed: false,
            connections: Vec::new(),
            data: None,
            loop_iteration: None,
            render_target: None,
            render_size: DEFAULT_RENDER_SIZE,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &PortDescriptor {
        &self.descriptor
    }

    pub fn direction(&self) -> PortDirection {
        self.descriptor.direction
    }

    pub fn port_type(&self) -> PortType {
        self.descriptor.port_type
    }

    pub fn is_inport(&self) -> bool {
        self.descriptor.direction == PortDirection::In
    }

    pub fn is_outport(&self) -> bool {
        self.descriptor.direction == PortDirection::Out
    }

    pub fn is_required(&self) -> bool {
        self.descriptor.required
    }

    pub fn is_private(&self) -> bool {
        self.descriptor.private
    }

    pub fn is_co_processor(&self) -> bool {
        self.descriptor.co_processor
    }

    /// Outports always accept multiple connections.
    pub fn allows_multiple_connections(&self) -> bool {
        self.is_outport() || self.descriptor.allow_multiple
    }

    pub fn is_loop_port(&self) -> bool {
        self.descriptor.loop_iterations.is_some()
    }

    /// Configured iteration count of a loop port, clamped to at least one.
    pub fn num_loop_iterations(&self) -> usize {
        self.descriptor.loop_iterations.unwrap_or(1).max(1)
    }

    /// Current loop iteration; zero before the first advancement.
    pub fn loop_iteration(&self) -> usize {
        self.loop_iteration.unwrap_or(0)
    }

    /// Whether the counter has been advanced since the last pass start.
    pub(crate) fn loop_iterated(&self) -> bool {
        self.loop_iteration.is_some()
    }

    pub(crate) fn set_loop_iteration(&mut self, iteration: usize) {
        self.loop_iteration = Some(iteration);
    }

    pub(crate) fn reset_loop_iteration(&mut self) {
        self.loop_iteration = None;
    }

    pub fn is_connected(&self) -> bool {
        !self.connections.is_empty()
    }

    pub fn connections(&self) -> &[PortRef] {
        &self.connections
    }

    pub fn is_connected_to(&self, other: &PortRef) -> bool {
        self.connections.iter().any(|c| c == other)
    }

    pub(crate) fn add_connection(&mut self, peer: PortRef) {
        self.connections.push(peer);
    }

    pub(crate) fn remove_connection(&mut self, peer: &PortRef) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c != peer);
        self.connections.len() != before
    }

    pub(crate) fn clear_connections(&mut self) {
        self.connections.clear();
    }

    /// Set when new data arrived on an inport; cleared by the scheduler's
    /// validation step after a successful process.
    pub fn has_changed(&self) -> bool {
        self.has_changed
    }

    pub(crate) fn mark_changed(&mut self) {
        self.has_changed = true;
    }

    pub(crate) fn set_valid(&mut self) {
        self.has_changed = false;
    }

    pub fn data(&self) -> Option<&PortData> {
        self.data.as_ref()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub(crate) fn set_data(&mut self, data: PortData) {
        self.data = Some(data);
    }

    pub(crate) fn clear_data(&mut self) {
        self.data = None;
    }

    pub fn render_target(&self) -> Option<RenderTargetId> {
        self.render_target
    }

    pub(crate) fn assign_render_target(&mut self, target: Option<RenderTargetId>) {
        self.render_target = target;
    }

    pub fn render_size(&self) -> [u32; 2] {
        self.render_size
    }

    pub(crate) fn set_render_size(&mut self, size: [u32; 2]) {
        self.render_size = size;
    }

    /// Port-local half of the connection predicate: direction, exact type
    /// equality, coprocessor/loop pairing, multiplicity and duplicates.
    /// The network adds containment and illegal-loop checks on top.
    pub(crate) fn accepts_connection(
        outport: &Port,
        outport_ref: &PortRef,
        inport: &Port,
        inport_ref: &PortRef,
    ) -> bool {
        if !outport.is_outport() || !inport.is_inport() {
            return false;
        }
        if outport.is_private() || inport.is_private() {
            return false;
        }
        if outport.port_type() != inport.port_type() {
            return false;
        }
        if outport.is_co_processor() != inport.is_co_processor() {
            return false;
        }
        // loop ports pair exclusively with loop ports
        if outport.is_loop_port() != inport.is_loop_port() {
            return false;
        }
        if outport.is_connected_to(inport_ref) || inport.is_connected_to(outport_ref) {
            return false;
        }
        if !inport.allows_multiple_connections() && inport.is_connected() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(descriptor: PortDescriptor) -> Port {
        Port::new(descriptor)
    }

    #[test]
    fn test_port_ref_parse() {
        let r = PortRef::parse("raycaster.image").unwrap();
        assert_eq!(r.processor, "raycaster");
        assert_eq!(r.port, "image");
        assert_eq!(r.to_string(), "raycaster.image");
        assert!(PortRef::parse("no-separator").is_err());
    }

    #[test]
    fn test_direction_mismatch_rejected() {
        let a = port(PortDescriptor::inport("in", PortType::Volume));
        let b = port(PortDescriptor::inport("in2", PortType::Volume));
        let ar = PortRef::new("p1", "in");
        let br = PortRef::new("p2", "in2");
        assert!(!Port::accepts_connection(&a, &ar, &b, &br));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let out = port(PortDescriptor::outport("out", PortType::Volume));
        let inp = port(PortDescriptor::inport("in", PortType::Geometry));
        let or = PortRef::new("p1", "out");
        let ir = PortRef::new("p2", "in");
        assert!(!Port::accepts_connection(&out, &or, &inp, &ir));
    }

    #[test]
    fn test_single_connection_inport_at_capacity() {
        let out = port(PortDescriptor::outport("out", PortType::Volume));
        let mut inp = port(PortDescriptor::inport("in", PortType::Volume));
        let or = PortRef::new("p1", "out");
        let ir = PortRef::new("p2", "in");
        assert!(Port::accepts_connection(&out, &or, &inp, &ir));

        inp.add_connection(PortRef::new("p3", "out"));
        assert!(!Port::accepts_connection(&out, &or, &inp, &ir));
    }

    #[test]
    fn test_multiple_connection_inport() {
        let out = port(PortDescriptor::outport("out", PortType::Volume));
        let mut inp = port(PortDescriptor::inport("in", PortType::Volume).multiple());
        inp.add_connection(PortRef::new("p3", "out"));
        let or = PortRef::new("p1", "out");
        let ir = PortRef::new("p2", "in");
        assert!(Port::accepts_connection(&out, &or, &inp, &ir));
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let mut out = port(PortDescriptor::outport("out", PortType::Volume));
        let mut inp = port(PortDescriptor::inport("in", PortType::Volume));
        let or = PortRef::new("p1", "out");
        let ir = PortRef::new("p2", "in");
        out.add_connection(ir.clone());
        inp.add_connection(or.clone());
        assert!(!Port::accepts_connection(&out, &or, &inp, &ir));
    }

    #[test]
    fn test_loop_port_pairing() {
        let loop_out = port(PortDescriptor::outport("loop", PortType::Data).looping(3));
        let loop_in = port(PortDescriptor::inport("loop", PortType::Data).looping(3));
        let plain_in = port(PortDescriptor::inport("in", PortType::Data));
        let or = PortRef::new("end", "loop");
        let ir = PortRef::new("start", "loop");
        let pr = PortRef::new("start", "in");
        assert!(Port::accepts_connection(&loop_out, &or, &loop_in, &ir));
        assert!(!Port::accepts_connection(&loop_out, &or, &plain_in, &pr));
    }

    #[test]
    fn test_loop_iteration_counter() {
        let mut p = port(PortDescriptor::inport("loop", PortType::Data).looping(4));
        assert_eq!(p.num_loop_iterations(), 4);
        assert!(!p.loop_iterated());
        assert_eq!(p.loop_iteration(), 0);

        p.set_loop_iteration(2);
        assert!(p.loop_iterated());
        assert_eq!(p.loop_iteration(), 2);

        p.reset_loop_iteration();
        assert!(!p.loop_iterated());
    }

    #[test]
    fn test_co_processor_ports_pair_exclusively() {
        let co_out = port(PortDescriptor::outport("co", PortType::Data).co_processor());
        let co_in = port(PortDescriptor::inport("co", PortType::Data).co_processor());
        let plain_in = port(PortDescriptor::inport("in", PortType::Data));
        let or = PortRef::new("p1", "co");
        let ir = PortRef::new("p2", "co");
        let pr = PortRef::new("p2", "in");
        assert!(Port::accepts_connection(&co_out, &or, &co_in, &ir));
        assert!(!Port::accepts_connection(&co_out, &or, &plain_in, &pr));
    }

    #[test]
    fn test_private_ports_not_connectable() {
        let out = port(PortDescriptor::outport("private", PortType::Render).private_render());
        let inp = port(PortDescriptor::inport("in", PortType::Render));
        let or = PortRef::new("p1", "private");
        let ir = PortRef::new("p2", "in");
        assert!(!Port::accepts_connection(&out, &or, &inp, &ir));
    }
}
