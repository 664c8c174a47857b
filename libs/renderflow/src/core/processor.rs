// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The [`Processor`] trait and the contexts handed to its lifecycle hooks.
//!
//! Processors declare their shape through a [`ProcessorDescriptor`] and do
//! all port/property access through [`ProcessContext`], which the evaluator
//! constructs for every hook invocation. Processors never hold references
//! into the network.

use crate::core::context::GraphicsContext;
use crate::core::data::{Geometry, Volume};
use crate::core::error::{FlowError, Result};
use crate::core::invalidation::InvalidationLevel;
use crate::core::network::{
    propagate_property_links, raise_invalidation, ProcessorNode, PropertyLink,
};
use crate::core::ports::{PortData, PortDescriptor, PortDirection, PortRef};
use crate::core::properties::{PropertyDescriptor, PropertyRef, PropertyValue};
use crate::core::render_target::{RenderTarget, RenderTargetId, RenderTargetPool};
use indexmap::IndexMap;
use std::sync::Arc;

/// Static description of a processor: identity, ports, properties.
///
/// The network materializes ports and properties from this when a processor
/// is added, and re-reads it to sync ports after an
/// [`InvalidationLevel::InvalidPorts`] invalidation.
#[derive(Debug, Clone)]
pub struct ProcessorDescriptor {
    pub type_name: String,
    pub category: String,
    pub description: Option<String>,
    pub ports: Vec<PortDescriptor>,
    pub properties: Vec<PropertyDescriptor>,
    /// End processors anchor scheduling: only their predecessors execute.
    pub end_processor: bool,
    pub tags: Vec<String>,
}

impl ProcessorDescriptor {
    pub fn new(type_name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            category: category.into(),
            description: None,
            ports: Vec::new(),
            properties: Vec::new(),
            end_processor: false,
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_port(mut self, port: PortDescriptor) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.push(property);
        self
    }

    pub fn end_processor(mut self) -> Self {
        self.end_processor = true;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// An end processor is either flagged explicitly or has no outports.
    pub fn is_end_processor(&self) -> bool {
        self.end_processor
            || !self
                .ports
                .iter()
                .any(|p| p.direction == PortDirection::Out && !p.private)
    }
}

/// Readiness snapshot of one port, fed into the readiness rule.
#[derive(Debug, Clone)]
pub struct PortReadiness {
    pub id: String,
    pub direction: PortDirection,
    pub required: bool,
    pub co_processor: bool,
    pub private: bool,
    pub loop_port: bool,
    pub connected: bool,
    /// For inports: whether any connected outport currently holds data.
    pub has_data: bool,
}

/// Snapshot used by [`Processor::is_ready`].
#[derive(Debug, Clone)]
pub struct ReadyState {
    pub initialized: bool,
    pub ports: Vec<PortReadiness>,
}

impl ReadyState {
    /// Default readiness rule: initialized, every required inport connected
    /// with upstream data, every required outport connected. Private ports
    /// and loop ports are exempt (a loop inport's upstream data only exists
    /// after the first loop body execution).
    pub fn default_ready(&self) -> bool {
        if !self.initialized {
            return false;
        }
        self.ports.iter().all(|p| {
            if !p.required || p.private || p.loop_port {
                return true;
            }
            match p.direction {
                PortDirection::In => p.connected && p.has_data,
                PortDirection::Out => p.connected,
            }
        })
    }
}

/// Context for `initialize`/`deinitialize`: identity plus the graphics
/// context whose focus the evaluator has already acquired.
pub struct InitContext<'a> {
    processor: &'a str,
    graphics: Option<&'a dyn GraphicsContext>,
}

impl<'a> InitContext<'a> {
    pub(crate) fn new(processor: &'a str, graphics: Option<&'a dyn GraphicsContext>) -> Self {
        Self { processor, graphics }
    }

    pub fn processor_name(&self) -> &str {
        self.processor
    }

    pub fn graphics(&self) -> Option<&dyn GraphicsContext> {
        self.graphics
    }
}

/// Port and property access facade for one processor during a pass.
///
/// Writes propagate data-changed notifications downstream; property writes
/// run property links. All lookups are scoped to the current processor, so a
/// processor cannot reach into foreign ports except through its connections.
pub struct ProcessContext<'a> {
    nodes: &'a mut IndexMap<String, ProcessorNode>,
    property_links: &'a [PropertyLink],
    current: &'a str,
    render_targets: &'a mut RenderTargetPool,
    graphics: Option<&'a dyn GraphicsContext>,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(
        nodes: &'a mut IndexMap<String, ProcessorNode>,
        property_links: &'a [PropertyLink],
        current: &'a str,
        render_targets: &'a mut RenderTargetPool,
        graphics: Option<&'a dyn GraphicsContext>,
    ) -> Self {
        Self {
            nodes,
            property_links,
            current,
            render_targets,
            graphics,
        }
    }

    pub fn processor_name(&self) -> &str {
        self.current
    }

    pub fn graphics(&self) -> Option<&dyn GraphicsContext> {
        self.graphics
    }

    fn node(&self) -> &ProcessorNode {
        &self.nodes[self.current]
    }

    fn own_port(&self, port: &str) -> Result<&crate::core::ports::Port> {
        self.node().port(port).ok_or_else(|| {
            FlowError::PortNotFound(format!("{}.{port}", self.current))
        })
    }

    // ---- inputs ----

    /// Data from the first connected outport holding any, or `None`.
    pub fn fetch_input(&self, port: &str) -> Option<PortData> {
        let inport = self.node().port(port)?;
        for peer in inport.connections() {
            if let Some(data) = self
                .nodes
                .get(&peer.processor)
                .and_then(|n| n.port(&peer.port))
                .and_then(|p| p.data())
            {
                return Some(data.clone());
            }
        }
        None
    }

    /// Data from every connected outport, in connection order.
    pub fn fetch_all_inputs(&self, port: &str) -> Vec<PortData> {
        let Some(inport) = self.node().port(port) else {
            return Vec::new();
        };
        inport
            .connections()
            .iter()
            .filter_map(|peer| {
                self.nodes
                    .get(&peer.processor)
                    .and_then(|n| n.port(&peer.port))
                    .and_then(|p| p.data())
                    .cloned()
            })
            .collect()
    }

    pub fn fetch_volume(&self, port: &str) -> Option<Arc<Volume>> {
        match self.fetch_input(port)? {
            PortData::Volume(v) => Some(v),
            _ => None,
        }
    }

    pub fn fetch_geometry(&self, port: &str) -> Option<Arc<Geometry>> {
        match self.fetch_input(port)? {
            PortData::Geometry(g) => Some(g),
            _ => None,
        }
    }

    pub fn fetch_data(&self, port: &str) -> Option<serde_json::Value> {
        match self.fetch_input(port)? {
            PortData::Data(v) => Some(v),
            _ => None,
        }
    }

    /// Render target produced by the upstream render outport.
    pub fn fetch_render(&self, port: &str) -> Option<RenderTargetId> {
        match self.fetch_input(port)? {
            PortData::Render(id) => Some(id),
            _ => None,
        }
    }

    /// Whether new data has arrived on this inport since the last validation.
    pub fn has_changed(&self, port: &str) -> bool {
        self.node()
            .port(port)
            .map(|p| p.has_changed())
            .unwrap_or(false)
    }

    // ---- outputs ----

    /// Store data on an own outport and notify every connected inport.
    pub fn write_output(&mut self, port: &str, data: PortData) -> Result<()> {
        let outport = self.own_port(port)?;
        if !outport.is_outport() {
            return Err(FlowError::PortConnection(format!(
                "{}.{port} is not an outport",
                self.current
            )));
        }
        if outport.port_type() != data.port_type() {
            return Err(FlowError::PortConnection(format!(
                "payload type {:?} does not match port type {:?} of {}.{port}",
                data.port_type(),
                outport.port_type(),
                self.current
            )));
        }
        let peers: Vec<PortRef> = outport.connections().to_vec();
        self.nodes[self.current]
            .port_mut(port)
            .expect("port presence checked above")
            .set_data(data);

        for peer in peers {
            let level = match self
                .nodes
                .get_mut(&peer.processor)
                .and_then(|n| n.port_mut(&peer.port))
            {
                Some(inport) => {
                    inport.mark_changed();
                    inport.descriptor().change_level
                }
                None => continue,
            };
            raise_invalidation(self.nodes, &peer.processor, level);
        }
        Ok(())
    }

    /// Publish the render target of a render outport as its output.
    pub fn write_render_output(&mut self, port: &str) -> Result<()> {
        let target = self.own_port(port)?.render_target().ok_or_else(|| {
            FlowError::RenderTarget(format!(
                "{}.{port} has no assigned render target",
                self.current
            ))
        })?;
        self.write_output(port, PortData::Render(target))
    }

    pub fn clear_output(&mut self, port: &str) -> Result<()> {
        self.nodes[self.current]
            .port_mut(port)
            .ok_or_else(|| FlowError::PortNotFound(format!("{}.{port}", self.current)))?
            .clear_data();
        Ok(())
    }

    // ---- loop ports ----

    /// Current iteration of a loop port; zero outside loops.
    pub fn loop_iteration(&self, port: &str) -> usize {
        self.node()
            .port(port)
            .map(|p| p.loop_iteration())
            .unwrap_or(0)
    }

    pub fn num_loop_iterations(&self, port: &str) -> usize {
        self.node()
            .port(port)
            .map(|p| p.num_loop_iterations())
            .unwrap_or(1)
    }

    // ---- properties ----

    pub fn property(&self, id: &str) -> Option<&PropertyValue> {
        self.node().property(id).map(|p| p.value())
    }

    pub fn property_float(&self, id: &str) -> Option<f64> {
        self.property(id).and_then(|v| v.as_float())
    }

    pub fn property_int(&self, id: &str) -> Option<i64> {
        self.property(id).and_then(|v| v.as_int())
    }

    /// Set an own property: raises the owner's invalidation by the property's
    /// configured level and runs property links. A property set to
    /// [`InvalidationLevel::InvalidPorts`] aborts the running pass and
    /// triggers a topology rebuild.
    pub fn set_property(&mut self, id: &str, value: PropertyValue) -> Result<()> {
        let level = {
            let node = self.nodes.get_mut(self.current).expect("current node exists");
            let property = node.property_mut(id).ok_or_else(|| {
                FlowError::PropertyNotFound(format!("{}.{id}", self.current))
            })?;
            property.set_value(value);
            property.invalidation()
        };
        raise_invalidation(self.nodes, self.current, level);
        propagate_property_links(
            self.nodes,
            self.property_links,
            &PropertyRef::new(self.current, id),
        );
        Ok(())
    }

    /// Raise the current processor's own invalidation level.
    pub fn invalidate(&mut self, level: InvalidationLevel) {
        raise_invalidation(self.nodes, self.current, level);
    }

    // ---- render targets ----

    /// Begin exclusive access to the target assigned to a render port.
    pub fn activate_target(&mut self, port: &str) -> Result<()> {
        let id = self.assigned_target(port)?;
        if let Some(graphics) = self.graphics {
            graphics.acquire_focus();
        }
        self.render_targets
            .get_mut(id)
            .ok_or_else(|| FlowError::RenderTarget(format!("{id} does not exist")))?
            .activate()
    }

    pub fn deactivate_target(&mut self, port: &str) -> Result<()> {
        let id = self.assigned_target(port)?;
        self.render_targets
            .get_mut(id)
            .ok_or_else(|| FlowError::RenderTarget(format!("{id} does not exist")))?
            .deactivate()
    }

    /// Mutable access to the target assigned to an own render port.
    pub fn target_mut(&mut self, port: &str) -> Result<&mut RenderTarget> {
        let id = self.assigned_target(port)?;
        self.render_targets
            .get_mut(id)
            .ok_or_else(|| FlowError::RenderTarget(format!("{id} does not exist")))
    }

    /// Read access to an arbitrary target, e.g. one fetched from an inport.
    pub fn target(&self, id: RenderTargetId) -> Option<&RenderTarget> {
        self.render_targets.get(id)
    }

    pub fn render_size(&self, port: &str) -> [u32; 2] {
        self.node()
            .port(port)
            .map(|p| p.render_size())
            .unwrap_or(crate::core::ports::DEFAULT_RENDER_SIZE)
    }

    fn assigned_target(&self, port: &str) -> Result<RenderTargetId> {
        self.own_port(port)?.render_target().ok_or_else(|| {
            FlowError::RenderTarget(format!(
                "{}.{port} has no assigned render target",
                self.current
            ))
        })
    }
}

/// A node in the dataflow graph: a stateful unit of computation with typed
/// ports and configuration properties.
///
/// Lifecycle: `initialize` acquires GPU/OS resources, `deinitialize` releases
/// them; both are driven by the evaluator with the graphics focus already
/// acquired and must stay symmetric even on the failure path. `process` is
/// called only when the processor is ready and invalid; the scheduler, not
/// the processor, marks it valid afterwards.
pub trait Processor: Send {
    /// Declares identity, ports and properties. Called when the processor is
    /// added to a network, and again whenever its ports must be re-synced.
    fn descriptor(&self) -> ProcessorDescriptor;

    fn initialize(&mut self, ctx: &mut InitContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn deinitialize(&mut self, ctx: &mut InitContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Invoked before readiness is checked when any inport has fresh data,
    /// allowing the processor to adapt its configuration to new input shape.
    fn inports_changed(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn before_process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// The processor's computation. Runs to completion; there is no mid-call
    /// cancellation.
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()>;

    fn after_process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Custom readiness condition. The default applies
    /// [`ReadyState::default_ready`].
    fn is_ready(&self, state: &ReadyState) -> bool {
        state.default_ready()
    }
}

/// Shared handle to a processor instance.
///
/// The mutex is the per-processor lock the evaluator holds across the
/// `before_process`/`process`/`after_process` sequence; background workers
/// spawned by a processor must lock the same handle before mutating shared
/// processor state.
pub type ProcessorInstance = Arc<parking_lot::Mutex<Box<dyn Processor>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ports::PortType;

    #[test]
    fn test_descriptor_builder() {
        let descriptor = ProcessorDescriptor::new("MipRaycaster", "Raycasting")
            .with_description("Maximum intensity projection")
            .with_port(PortDescriptor::inport("volume", PortType::Volume))
            .with_port(PortDescriptor::outport("image", PortType::Render))
            .with_property(PropertyDescriptor::new(
                "sampling_rate",
                PropertyValue::Float(1.0),
            ))
            .with_tag("raycasting");

        assert_eq!(descriptor.type_name, "MipRaycaster");
        assert_eq!(descriptor.ports.len(), 2);
        assert_eq!(descriptor.properties.len(), 1);
        assert!(!descriptor.is_end_processor());
    }

    #[test]
    fn test_end_processor_derived_from_ports() {
        let sink = ProcessorDescriptor::new("Canvas", "Output")
            .with_port(PortDescriptor::inport("image", PortType::Render));
        assert!(sink.is_end_processor());

        let explicit = ProcessorDescriptor::new("Recorder", "Output")
            .with_port(PortDescriptor::outport("copy", PortType::Render))
            .end_processor();
        assert!(explicit.is_end_processor());
    }

    #[test]
    fn test_default_ready_rule() {
        let ready = ReadyState {
            initialized: true,
            ports: vec![
                PortReadiness {
                    id: "volume".into(),
                    direction: PortDirection::In,
                    required: true,
                    co_processor: false,
                    private: false,
                    loop_port: false,
                    connected: true,
                    has_data: true,
                },
                PortReadiness {
                    id: "image".into(),
                    direction: PortDirection::Out,
                    required: true,
                    co_processor: false,
                    private: false,
                    loop_port: false,
                    connected: true,
                    has_data: false,
                },
            ],
        };
        assert!(ready.default_ready());

        let mut missing_data = ready.clone();
        missing_data.ports[0].has_data = false;
        assert!(!missing_data.default_ready());

        let mut uninitialized = ready.clone();
        uninitialized.initialized = false;
        assert!(!uninitialized.default_ready());

        let mut optional = ready;
        optional.ports[0].has_data = false;
        optional.ports[0].required = false;
        assert!(optional.default_ready());
    }

    #[test]
    fn test_loop_ports_exempt_from_readiness() {
        let state = ReadyState {
            initialized: true,
            ports: vec![PortReadiness {
                id: "loop".into(),
                direction: PortDirection::In,
                required: true,
                co_processor: false,
                private: false,
                loop_port: true,
                connected: true,
                has_data: false,
            }],
        };
        assert!(state.default_ready());
    }
}
