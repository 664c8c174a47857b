// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The processor network: exclusive owner of processors, port connections
//! and links.
//!
//! Every topology mutation goes through an explicit operation here, bumps the
//! network revision and notifies subscribers. The evaluator compares the
//! revision against the one it last compiled to decide whether a rebuild is
//! due.

use crate::core::error::{FlowError, Result};
use crate::core::events::{EvaluationRequest, NetworkEvent, SubscriberId, SubscriberList};
use crate::core::invalidation::{InvalidationLevel, ProcessorState};
use crate::core::network::graph::{LoopEdgePolicy, NetworkGraph};
use crate::core::network::links::{PropertyLink, RenderSizeLink};
use crate::core::ports::{Port, PortRef, SizeRole};
use crate::core::processor::{
    PortReadiness, Processor, ProcessorDescriptor, ProcessorInstance, ReadyState,
};
use crate::core::properties::{
    IdentityLinkEvaluator, LinkEvaluator, Property, PropertyRef, PropertyValue,
};
use crossbeam_channel::Sender;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bookkeeping record for one processor in the network: name, lifecycle
/// state, invalidation level, ports and properties. The computation itself
/// lives in the processor instance behind its mutex.
#[derive(Debug)]
pub struct ProcessorNode {
    name: String,
    type_name: String,
    category: String,
    state: ProcessorState,
    invalidation: InvalidationLevel,
    end_processor: bool,
    ports: IndexMap<String, Port>,
    properties: IndexMap<String, Property>,
}

impl ProcessorNode {
    fn from_descriptor(name: String, descriptor: &ProcessorDescriptor) -> Self {
        let mut ports = IndexMap::new();
        for port_desc in &descriptor.ports {
            ports.insert(port_desc.id.clone(), Port::new(port_desc.clone()));
        }
        let mut properties = IndexMap::new();
        for prop_desc in &descriptor.properties {
            properties.insert(prop_desc.id.clone(), Property::new(prop_desc.clone()));
        }
        Self {
            name,
            type_name: descriptor.type_name.clone(),
            category: descriptor.category.clone(),
            state: ProcessorState::NotInitialized,
            // freshly added processors carry maximal invalidation until the
            // first rebuild demotes and processes them
            invalidation: InvalidationLevel::InvalidProcessor,
            end_processor: descriptor.is_end_processor(),
            ports,
            properties,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ProcessorState) {
        self.state = state;
    }

    pub fn invalidation(&self) -> InvalidationLevel {
        self.invalidation
    }

    /// True iff no recomputation is needed.
    pub fn is_valid(&self) -> bool {
        self.invalidation == InvalidationLevel::Valid
    }

    pub fn is_end_processor(&self) -> bool {
        self.end_processor
    }

    /// Monotonic raise; never lowers the level.
    pub(crate) fn raise_invalidation(&mut self, level: InvalidationLevel) {
        self.invalidation = self.invalidation.max(level);
    }

    /// Direct assignment, used only by the evaluator's rebuild demotion.
    pub(crate) fn set_invalidation(&mut self, level: InvalidationLevel) {
        self.invalidation = level;
    }

    /// Scheduler-side validation after a completed pass: resets the level and
    /// clears the data-changed flags of all inports.
    pub(crate) fn set_valid(&mut self) {
        self.invalidation = InvalidationLevel::Valid;
        for port in self.ports.values_mut() {
            if port.is_inport() {
                port.set_valid();
            }
        }
    }

    pub fn port(&self, id: &str) -> Option<&Port> {
        self.ports.get(id)
    }

    pub(crate) fn port_mut(&mut self, id: &str) -> Option<&mut Port> {
        self.ports.get_mut(id)
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }

    pub(crate) fn ports_mut(&mut self) -> impl Iterator<Item = &mut Port> {
        self.ports.values_mut()
    }

    pub fn inports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values().filter(|p| p.is_inport())
    }

    pub fn outports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values().filter(|p| p.is_outport())
    }

    /// Connected loop inports drive iteration counters during a pass.
    pub fn loop_inports(&self) -> impl Iterator<Item = &Port> {
        self.inports().filter(|p| p.is_loop_port())
    }

    pub fn property(&self, id: &str) -> Option<&Property> {
        self.properties.get(id)
    }

    pub(crate) fn property_mut(&mut self, id: &str) -> Option<&mut Property> {
        self.properties.get_mut(id)
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    /// "No data" state for all outports, applied to skipped processors.
    pub(crate) fn clear_outports(&mut self) {
        for port in self.ports.values_mut() {
            if port.is_outport() {
                port.clear_data();
            }
        }
    }
}

/// The owned collection of processors, port connections and links.
pub struct ProcessorNetwork {
    nodes: IndexMap<String, ProcessorNode>,
    instances: IndexMap<String, ProcessorInstance>,
    property_links: Vec<PropertyLink>,
    size_links: Vec<RenderSizeLink>,
    metadata: IndexMap<String, String>,
    revision: u64,
    subscribers: SubscriberList<NetworkEvent>,
    request_tx: Option<Sender<EvaluationRequest>>,
}

impl Default for ProcessorNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorNetwork {
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
            instances: IndexMap::new(),
            property_links: Vec::new(),
            size_links: Vec::new(),
            metadata: IndexMap::new(),
            revision: 0,
            subscribers: SubscriberList::new(),
            request_tx: None,
        }
    }

    // ---- processors ----

    /// Add a processor under an auto-generated unique name derived from its
    /// type name. Returns the assigned name.
    pub fn add_processor(&mut self, processor: Box<dyn Processor>) -> Result<String> {
        self.add_processor_named(processor, None)
    }

    /// Add a processor under the given name, uniquified on collision.
    pub fn add_processor_named(
        &mut self,
        processor: Box<dyn Processor>,
        name: Option<&str>,
    ) -> Result<String> {
        let descriptor = processor.descriptor();
        if descriptor.type_name.is_empty() {
            return Err(FlowError::Configuration(
                "processor descriptor has an empty type name".into(),
            ));
        }
        if let Some(name) = name {
            if name.is_empty() {
                return Err(FlowError::Configuration(
                    "processor name must not be empty".into(),
                ));
            }
        }
        let base = name.unwrap_or(&descriptor.type_name);
        let unique = self.generate_unique_name(base);

        let node = ProcessorNode::from_descriptor(unique.clone(), &descriptor);
        self.nodes.insert(unique.clone(), node);
        self.instances
            .insert(unique.clone(), Arc::new(Mutex::new(processor)));

        self.bump_revision();
        self.emit(NetworkEvent::ProcessorAdded {
            name: unique.clone(),
        });
        Ok(unique)
    }

    /// Remove a processor, cascading: disconnect all its ports, drop all
    /// links touching it, then drop the node and instance.
    ///
    /// Deinitialization is the evaluator's responsibility (it owns the
    /// graphics context); removing a still-initialized processor directly is
    /// logged as a leak warning.
    pub fn remove_processor(&mut self, name: &str) -> Result<()> {
        if !self.contains(name) {
            return Err(FlowError::ProcessorNotFound(name.into()));
        }

        self.disconnect_all_ports(name);
        self.remove_links_touching(name);

        let node = self.nodes.shift_remove(name).expect("presence checked");
        if node.state().is_initialized() {
            warn!(processor = name, "removing a processor that is still initialized");
        }
        self.instances.shift_remove(name);

        self.bump_revision();
        self.emit(NetworkEvent::ProcessorRemoved { name: name.into() });
        Ok(())
    }

    /// Rename a processor, updating every connection and link that refers to
    /// it. Fails if the new name is empty or taken.
    pub fn rename_processor(&mut self, name: &str, new_name: &str) -> Result<()> {
        if !self.contains(name) {
            return Err(FlowError::ProcessorNotFound(name.into()));
        }
        if new_name.is_empty() {
            return Err(FlowError::Configuration("processor name must not be empty".into()));
        }
        if name == new_name {
            return Ok(());
        }
        if self.contains(new_name) {
            return Err(FlowError::Configuration(format!(
                "processor name '{new_name}' is already taken"
            )));
        }

        let index = self.nodes.get_index_of(name).expect("presence checked");
        let mut node = self.nodes.shift_remove(name).expect("presence checked");
        node.name = new_name.to_string();
        self.nodes.shift_insert(index, new_name.to_string(), node);

        let index = self.instances.get_index_of(name).expect("presence checked");
        let instance = self.instances.shift_remove(name).expect("presence checked");
        self.instances
            .shift_insert(index, new_name.to_string(), instance);

        // rewrite references held by peers and links
        rename_refs(
            &mut self.nodes,
            &mut self.property_links,
            &mut self.size_links,
            name,
            new_name,
        );

        self.bump_revision();
        self.emit(NetworkEvent::ProcessorRenamed {
            previous: name.into(),
            name: new_name.into(),
        });
        Ok(())
    }

    /// Swap a processor for a new instance under the same name, re-wiring
    /// each previous connection to the replacement's first compatible port.
    /// Connections without a compatible port are dropped silently, property
    /// links are not carried over.
    pub fn replace_processor(
        &mut self,
        name: &str,
        replacement: Box<dyn Processor>,
    ) -> Result<String> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| FlowError::ProcessorNotFound(name.into()))?;

        let mut incoming: Vec<PortRef> = Vec::new();
        let mut outgoing: Vec<PortRef> = Vec::new();
        for port in node.ports() {
            for peer in port.connections() {
                if port.is_inport() {
                    incoming.push(peer.clone());
                } else {
                    outgoing.push(peer.clone());
                }
            }
        }

        self.remove_processor(name)?;
        let new_name = self.add_processor_named(replacement, Some(name))?;

        let inport_ids: Vec<String> = self.nodes[&new_name]
            .inports()
            .map(|p| p.id().to_string())
            .collect();
        let outport_ids: Vec<String> = self.nodes[&new_name]
            .outports()
            .map(|p| p.id().to_string())
            .collect();

        for peer in incoming {
            for id in &inport_ids {
                if self.connect_ports(&peer, &PortRef::new(&new_name, id.clone())) {
                    break;
                }
            }
        }
        for peer in outgoing {
            for id in &outport_ids {
                if self.connect_ports(&PortRef::new(&new_name, id.clone()), &peer) {
                    break;
                }
            }
        }
        Ok(new_name)
    }

    /// Remove everything: processors (cascading), links, metadata.
    pub fn clear(&mut self) {
        let names: Vec<String> = self.nodes.keys().cloned().collect();
        for name in names {
            let _ = self.remove_processor(&name);
        }
        self.metadata.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&ProcessorNode> {
        self.nodes.get(name)
    }

    pub(crate) fn node_mut(&mut self, name: &str) -> Option<&mut ProcessorNode> {
        self.nodes.get_mut(name)
    }

    pub fn instance(&self, name: &str) -> Option<ProcessorInstance> {
        self.instances.get(name).cloned()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ProcessorNode> {
        self.nodes.values()
    }

    pub fn processor_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Processors anchoring evaluation, in insertion order.
    pub fn end_processors(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.is_end_processor())
            .map(|n| n.name.clone())
            .collect()
    }

    fn generate_unique_name(&self, base: &str) -> String {
        if !self.contains(base) {
            return base.to_string();
        }
        let mut num = 2usize;
        loop {
            let candidate = format!("{base} {num}");
            if !self.contains(&candidate) {
                return candidate;
            }
            num += 1;
        }
    }

    // ---- connections ----

    /// Whether connecting `from` (outport) to `to` (inport) is legal:
    /// port-level compatibility plus the illegal-loop check.
    pub fn can_connect(&self, from: &PortRef, to: &PortRef) -> bool {
        debug_assert!(
            self.contains(&from.processor) && self.contains(&to.processor),
            "connect called with a processor that is not part of this network"
        );
        let Some(outport) = self.port(from) else {
            return false;
        };
        let Some(inport) = self.port(to) else {
            return false;
        };
        if !Port::accepts_connection(outport, from, inport, to) {
            return false;
        }
        !self.creates_illegal_loop(from, to)
    }

    /// Connect an outport to an inport. Returns false without changing any
    /// state when the connection is not legal.
    pub fn connect_ports(&mut self, from: &PortRef, to: &PortRef) -> bool {
        if !self.can_connect(from, to) {
            debug!(%from, %to, "rejected port connection");
            return false;
        }

        let out_level = self.port(from).expect("checked").descriptor().change_level;
        self.nodes[&from.processor]
            .port_mut(&from.port)
            .expect("checked")
            .add_connection(to.clone());
        let inport = self.nodes[&to.processor]
            .port_mut(&to.port)
            .expect("checked");
        inport.add_connection(from.clone());
        inport.mark_changed();
        let in_level = inport.descriptor().change_level;

        let mut ends = raise_invalidation(&mut self.nodes, &from.processor, out_level);
        ends |= raise_invalidation(&mut self.nodes, &to.processor, in_level);
        if ends {
            self.request_evaluation(EvaluationRequest::Process);
        }

        self.bump_revision();
        self.emit(NetworkEvent::PortsConnected {
            from: from.clone(),
            to: to.clone(),
        });
        true
    }

    /// Remove an existing connection. Returns false if it did not exist.
    pub fn disconnect_ports(&mut self, from: &PortRef, to: &PortRef) -> bool {
        let Some(node) = self.nodes.get_mut(&from.processor) else {
            return false;
        };
        let Some(outport) = node.port_mut(&from.port) else {
            return false;
        };
        if !outport.remove_connection(to) {
            return false;
        }
        if let Some(inport) = self
            .nodes
            .get_mut(&to.processor)
            .and_then(|n| n.port_mut(&to.port))
        {
            inport.remove_connection(from);
            inport.mark_changed();
            let level = inport.descriptor().change_level;
            if raise_invalidation(&mut self.nodes, &to.processor, level) {
                self.request_evaluation(EvaluationRequest::Process);
            }
        }

        self.bump_revision();
        self.emit(NetworkEvent::PortsDisconnected {
            from: from.clone(),
            to: to.clone(),
        });
        true
    }

    /// Drop every connection of every port of a processor.
    pub fn disconnect_all_ports(&mut self, name: &str) {
        let Some(node) = self.nodes.get(name) else {
            return;
        };
        let mut pairs: Vec<(PortRef, PortRef)> = Vec::new();
        for port in node.ports() {
            let own = PortRef::new(name, port.id());
            for peer in port.connections() {
                if port.is_outport() {
                    pairs.push((own.clone(), peer.clone()));
                } else {
                    pairs.push((peer.clone(), own.clone()));
                }
            }
        }
        for (from, to) in pairs {
            self.disconnect_ports(&from, &to);
        }
    }

    pub fn port(&self, port_ref: &PortRef) -> Option<&Port> {
        self.nodes.get(&port_ref.processor)?.port(&port_ref.port)
    }

    /// All connections in the network as (outport, inport) pairs.
    pub fn connections(&self) -> Vec<(PortRef, PortRef)> {
        let mut result = Vec::new();
        for node in self.nodes.values() {
            for port in node.outports() {
                let from = PortRef::new(node.name(), port.id());
                for peer in port.connections() {
                    result.push((from.clone(), peer.clone()));
                }
            }
        }
        result
    }

    fn creates_illegal_loop(&self, from: &PortRef, to: &PortRef) -> bool {
        // a loop-port pair is a designated back edge, validated at unroll time
        let both_loop = self
            .port(from)
            .zip(self.port(to))
            .map(|(o, i)| o.is_loop_port() && i.is_loop_port())
            .unwrap_or(false);
        if both_loop {
            return false;
        }
        if from.processor == to.processor {
            return true;
        }
        // illegal if the source is already downstream of the target
        let graph = NetworkGraph::build(self, LoopEdgePolicy::Ignore);
        graph.is_successor(&to.processor, &from.processor)
    }

    // ---- invalidation ----

    /// Raise a processor's invalidation level and propagate data-changed
    /// notifications downstream. Unknown names are ignored with a debug
    /// assertion.
    pub fn invalidate_processor(&mut self, name: &str, level: InvalidationLevel) {
        debug_assert!(self.contains(name), "invalidating unknown processor");
        if raise_invalidation(&mut self.nodes, name, level) {
            self.request_evaluation(EvaluationRequest::Process);
        }
    }

    /// Whether any processor's level forces a topology rebuild.
    pub fn has_invalid_ports(&self) -> bool {
        self.nodes
            .values()
            .any(|n| n.invalidation().alters_topology())
    }

    // ---- properties ----

    pub fn property(&self, processor: &str, id: &str) -> Option<&PropertyValue> {
        self.nodes.get(processor)?.property(id).map(|p| p.value())
    }

    /// Set a property value: raises the owner at the property's configured
    /// level and propagates through property links.
    pub fn set_property(
        &mut self,
        processor: &str,
        id: &str,
        value: PropertyValue,
    ) -> Result<()> {
        let node = self
            .nodes
            .get_mut(processor)
            .ok_or_else(|| FlowError::ProcessorNotFound(processor.into()))?;
        let property = node
            .property_mut(id)
            .ok_or_else(|| FlowError::PropertyNotFound(format!("{processor}.{id}")))?;
        property.set_value(value);
        let level = property.invalidation();

        let mut ends = raise_invalidation(&mut self.nodes, processor, level);
        ends |= propagate_property_links(
            &mut self.nodes,
            &self.property_links,
            &PropertyRef::new(processor, id),
        );
        if ends {
            self.request_evaluation(EvaluationRequest::Process);
        }
        Ok(())
    }

    // ---- property links ----

    /// Create a property link with the given evaluator (identity when
    /// `None`). Fails on self-links, endpoints outside the network, unknown
    /// properties, or an equivalent existing link.
    pub fn create_property_link(
        &mut self,
        source: &PropertyRef,
        target: &PropertyRef,
        evaluator: Option<Box<dyn LinkEvaluator>>,
    ) -> Result<()> {
        if source == target {
            return Err(FlowError::PropertyLink(
                "source and target property are the same".into(),
            ));
        }
        for endpoint in [source, target] {
            let node = self.nodes.get(&endpoint.processor).ok_or_else(|| {
                FlowError::Configuration(format!(
                    "property link endpoint '{endpoint}' is not part of this network"
                ))
            })?;
            if node.property(&endpoint.property).is_none() {
                return Err(FlowError::PropertyNotFound(endpoint.to_string()));
            }
        }
        let evaluator = evaluator.unwrap_or_else(|| Box::new(IdentityLinkEvaluator));
        let id = evaluator.id();
        if self
            .property_links
            .iter()
            .any(|l| l.is_equivalent(source, target, &id))
        {
            return Err(FlowError::PropertyLink(format!(
                "equivalent link {source} -> {target} already exists"
            )));
        }

        self.property_links
            .push(PropertyLink::new(source.clone(), target.clone(), evaluator));
        self.emit(NetworkEvent::PropertyLinkAdded {
            from: source.clone(),
            to: target.clone(),
        });
        Ok(())
    }

    /// Remove all links from `source` to `target`. Returns how many were
    /// removed.
    pub fn remove_property_link(&mut self, source: &PropertyRef, target: &PropertyRef) -> usize {
        let before = self.property_links.len();
        self.property_links
            .retain(|l| !(l.source == *source && l.target == *target));
        let removed = before - self.property_links.len();
        for _ in 0..removed {
            self.emit(NetworkEvent::PropertyLinkRemoved {
                from: source.clone(),
                to: target.clone(),
            });
        }
        removed
    }

    pub fn property_links(&self) -> &[PropertyLink] {
        &self.property_links
    }

    /// Link the given properties as a closed chain: `p0 -> p1 -> ... -> p0`.
    /// Touches every property once, creating O(n) links. Existing equivalent
    /// links are skipped. Returns the number of links created.
    pub fn link_properties_transitive(&mut self, properties: &[PropertyRef]) -> Result<usize> {
        if properties.len() < 2 {
            return Ok(0);
        }
        let mut created = 0;
        for i in 0..properties.len() {
            let source = &properties[i];
            let target = &properties[(i + 1) % properties.len()];
            match self.create_property_link(source, target, None) {
                Ok(()) => created += 1,
                Err(FlowError::PropertyLink(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    /// Link every ordered pair of the given properties directly.
    ///
    /// This creates O(n²) links; prefer [`link_properties_transitive`] for
    /// anything beyond a handful of properties.
    ///
    /// [`link_properties_transitive`]: Self::link_properties_transitive
    pub fn link_properties_pairwise(&mut self, properties: &[PropertyRef]) -> Result<usize> {
        let mut created = 0;
        for source in properties {
            for target in properties {
                if source == target {
                    continue;
                }
                match self.create_property_link(source, target, None) {
                    Ok(()) => created += 1,
                    Err(FlowError::PropertyLink(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(created)
    }

    /// Link the same-named property across a subset of processors.
    pub fn link_properties_within_subnetwork(
        &mut self,
        processors: &[&str],
        property_id: &str,
        transitive: bool,
    ) -> Result<usize> {
        let refs: Vec<PropertyRef> = processors
            .iter()
            .filter(|p| {
                self.nodes
                    .get(**p)
                    .map(|n| n.property(property_id).is_some())
                    .unwrap_or(false)
            })
            .map(|p| PropertyRef::new(*p, property_id))
            .collect();
        if transitive {
            self.link_properties_transitive(&refs)
        } else {
            self.link_properties_pairwise(&refs)
        }
    }

    /// For every property of `processor`, link it with all same-named
    /// properties elsewhere in the network (transitively).
    pub fn link_properties_for_processor(&mut self, processor: &str) -> Result<usize> {
        let node = self
            .nodes
            .get(processor)
            .ok_or_else(|| FlowError::ProcessorNotFound(processor.into()))?;
        let ids: Vec<String> = node.properties().map(|p| p.id().to_string()).collect();
        let names = self.processor_names();
        let mut created = 0;
        for id in ids {
            let peers: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
            created += self.link_properties_within_subnetwork(&peers, &id, true)?;
        }
        Ok(created)
    }

    // ---- render size links ----

    /// Link a size origin render port to a size receiver. The reverse
    /// direction is illegal.
    pub fn create_render_size_link(&mut self, origin: &PortRef, receiver: &PortRef) -> Result<()> {
        let origin_port = self
            .port(origin)
            .ok_or_else(|| FlowError::PortNotFound(origin.to_string()))?;
        let receiver_port = self
            .port(receiver)
            .ok_or_else(|| FlowError::PortNotFound(receiver.to_string()))?;

        if origin_port.descriptor().size_role != Some(SizeRole::Origin) {
            return Err(FlowError::Configuration(format!(
                "'{origin}' is not a render size origin"
            )));
        }
        if receiver_port.descriptor().size_role != Some(SizeRole::Receiver) {
            return Err(FlowError::Configuration(format!(
                "'{receiver}' is not a render size receiver"
            )));
        }
        let link = RenderSizeLink::new(origin.clone(), receiver.clone());
        if self.size_links.contains(&link) {
            return Err(FlowError::Configuration(format!(
                "size link {origin} -> {receiver} already exists"
            )));
        }

        // propagate the current origin size immediately
        let size = origin_port.render_size();
        self.size_links.push(link);
        self.apply_render_size(receiver, size);
        Ok(())
    }

    pub fn remove_render_size_link(&mut self, origin: &PortRef, receiver: &PortRef) -> bool {
        let before = self.size_links.len();
        self.size_links
            .retain(|l| !(l.origin == *origin && l.receiver == *receiver));
        self.size_links.len() != before
    }

    pub fn size_links(&self) -> &[RenderSizeLink] {
        &self.size_links
    }

    /// Set the render size on an origin port and propagate it to all linked
    /// receivers.
    pub fn set_render_size(&mut self, origin: &PortRef, size: [u32; 2]) -> Result<()> {
        let port = self
            .nodes
            .get_mut(&origin.processor)
            .and_then(|n| n.port_mut(&origin.port))
            .ok_or_else(|| FlowError::PortNotFound(origin.to_string()))?;
        if port.descriptor().size_role != Some(SizeRole::Origin) {
            return Err(FlowError::Configuration(format!(
                "'{origin}' is not a render size origin"
            )));
        }
        port.set_render_size(size);
        raise_invalidation(
            &mut self.nodes,
            &origin.processor,
            InvalidationLevel::InvalidResult,
        );

        let receivers: Vec<PortRef> = self
            .size_links
            .iter()
            .filter(|l| l.origin == *origin)
            .map(|l| l.receiver.clone())
            .collect();
        for receiver in receivers {
            self.apply_render_size(&receiver, size);
        }
        Ok(())
    }

    fn apply_render_size(&mut self, receiver: &PortRef, size: [u32; 2]) {
        if let Some(port) = self
            .nodes
            .get_mut(&receiver.processor)
            .and_then(|n| n.port_mut(&receiver.port))
        {
            port.set_render_size(size);
            raise_invalidation(
                &mut self.nodes,
                &receiver.processor,
                InvalidationLevel::InvalidResult,
            );
        }
    }

    // ---- port synchronization ----

    /// Re-read a processor's descriptor and reconcile its port set: ports
    /// that vanished are disconnected and removed, new ports are added.
    /// Returns whether anything changed. Used by the evaluator after an
    /// `InvalidPorts` invalidation.
    pub fn sync_ports(&mut self, name: &str) -> Result<bool> {
        let instance = self
            .instance(name)
            .ok_or_else(|| FlowError::ProcessorNotFound(name.into()))?;
        let descriptor = instance.lock().descriptor();

        let new_ids: HashSet<&str> = descriptor.ports.iter().map(|p| p.id.as_str()).collect();
        let node = self.nodes.get(name).expect("instance implies node");
        let stale: Vec<String> = node
            .ports()
            .filter(|p| !new_ids.contains(p.id()))
            .map(|p| p.id().to_string())
            .collect();

        // disconnect stale ports before removing them
        for port_id in &stale {
            let own = PortRef::new(name, port_id.clone());
            let node = self.nodes.get(name).expect("checked");
            let Some(port) = node.port(port_id) else {
                continue;
            };
            let pairs: Vec<(PortRef, PortRef)> = port
                .connections()
                .iter()
                .map(|peer| {
                    if port.is_outport() {
                        (own.clone(), peer.clone())
                    } else {
                        (peer.clone(), own.clone())
                    }
                })
                .collect();
            for (from, to) in pairs {
                self.disconnect_ports(&from, &to);
            }
        }

        let node = self.nodes.get_mut(name).expect("checked");
        let mut changed = false;
        for port_id in &stale {
            node.ports.shift_remove(port_id);
            changed = true;
        }
        for port_desc in &descriptor.ports {
            if !node.ports.contains_key(&port_desc.id) {
                node.ports
                    .insert(port_desc.id.clone(), Port::new(port_desc.clone()));
                changed = true;
            }
        }
        node.end_processor = descriptor.is_end_processor();

        if changed {
            debug!(processor = name, "synchronized port set from descriptor");
            self.bump_revision();
            self.emit(NetworkEvent::NetworkChanged);
        }
        Ok(changed)
    }

    // ---- pass support ----

    /// Disjoint borrows of the state a `ProcessContext` needs.
    pub(crate) fn pass_state(
        &mut self,
    ) -> (&mut IndexMap<String, ProcessorNode>, &[PropertyLink]) {
        (&mut self.nodes, &self.property_links)
    }

    pub(crate) fn ready_state(&self, name: &str) -> Option<ReadyState> {
        ready_state(&self.nodes, name)
    }

    pub(crate) fn any_inport_changed(&self, name: &str) -> bool {
        self.nodes
            .get(name)
            .map(|n| n.inports().any(|p| p.has_changed()))
            .unwrap_or(false)
    }

    // ---- revision / events ----

    /// Monotonic counter bumped by every topology mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn bump_revision(&mut self) {
        self.revision += 1;
    }

    pub fn subscribe(
        &mut self,
        callback: impl FnMut(&NetworkEvent) + Send + 'static,
    ) -> SubscriberId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    fn emit(&mut self, event: NetworkEvent) {
        self.subscribers.emit(&event);
        if event != NetworkEvent::NetworkChanged {
            self.subscribers.emit(&NetworkEvent::NetworkChanged);
        }
    }

    /// Channel through which end-processor invalidations ask the application
    /// loop for a pass. Installed by the evaluator on attach.
    pub(crate) fn set_request_sender(&mut self, sender: Option<Sender<EvaluationRequest>>) {
        self.request_tx = sender;
    }

    fn request_evaluation(&self, request: EvaluationRequest) {
        if let Some(tx) = &self.request_tx {
            let _ = tx.try_send(request);
        }
    }

    // ---- metadata ----

    pub fn metadata(&self) -> &IndexMap<String, String> {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut IndexMap<String, String> {
        &mut self.metadata
    }

    fn remove_links_touching(&mut self, name: &str) {
        let removed: Vec<(PropertyRef, PropertyRef)> = self
            .property_links
            .iter()
            .filter(|l| l.touches_processor(name))
            .map(|l| (l.source.clone(), l.target.clone()))
            .collect();
        self.property_links.retain(|l| !l.touches_processor(name));
        for (from, to) in removed {
            self.emit(NetworkEvent::PropertyLinkRemoved { from, to });
        }
        self.size_links.retain(|l| !l.touches_processor(name));
    }
}

impl std::fmt::Debug for ProcessorNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorNetwork")
            .field("processors", &self.nodes.len())
            .field("property_links", &self.property_links.len())
            .field("revision", &self.revision)
            .finish()
    }
}

// ---- shared traversal helpers ----
//
// These operate on the node map directly so both the network's public
// operations and the per-pass `ProcessContext` can reuse them. Every
// traversal carries its own visited set; there is no persistent traversal
// state on nodes.

/// Raise `start`'s invalidation level and cascade data-changed notifications
/// over its outport connections. Returns whether any end processor was
/// invalidated (the caller decides whether to request a pass).
pub(crate) fn raise_invalidation(
    nodes: &mut IndexMap<String, ProcessorNode>,
    start: &str,
    level: InvalidationLevel,
) -> bool {
    let mut end_touched = false;
    // highest level already applied per processor; revisit on a higher one
    let mut applied: HashMap<String, InvalidationLevel> = HashMap::new();
    let mut stack: Vec<(String, InvalidationLevel)> = vec![(start.to_string(), level)];

    while let Some((name, level)) = stack.pop() {
        if applied.get(&name).is_some_and(|l| *l >= level) {
            continue;
        }
        applied.insert(name.clone(), level);

        let Some(node) = nodes.get_mut(&name) else {
            continue;
        };
        node.raise_invalidation(level);
        if level > InvalidationLevel::Valid && node.is_end_processor() {
            end_touched = true;
        }
        if level == InvalidationLevel::Valid || !node.state().is_initialized() {
            continue;
        }

        let peers: Vec<PortRef> = node
            .outports()
            .flat_map(|p| p.connections().iter().cloned())
            .collect();
        for peer in peers {
            let Some(inport) = nodes
                .get_mut(&peer.processor)
                .and_then(|n| n.port_mut(&peer.port))
            else {
                continue;
            };
            inport.mark_changed();
            let downstream_level = inport.descriptor().change_level;
            stack.push((peer.processor, downstream_level));
        }
    }
    end_touched
}

/// Push a property change through all links reachable from `origin`,
/// visiting each property at most once. Evaluator failures are logged and
/// skip that link. Returns whether any end processor was invalidated.
pub(crate) fn propagate_property_links(
    nodes: &mut IndexMap<String, ProcessorNode>,
    links: &[PropertyLink],
    origin: &PropertyRef,
) -> bool {
    let mut end_touched = false;
    let mut visited: HashSet<PropertyRef> = HashSet::new();
    visited.insert(origin.clone());
    let mut queue: VecDeque<PropertyRef> = VecDeque::new();
    queue.push_back(origin.clone());

    while let Some(current) = queue.pop_front() {
        let Some(value) = nodes
            .get(&current.processor)
            .and_then(|n| n.property(&current.property))
            .map(|p| p.value().clone())
        else {
            continue;
        };

        for link in links.iter().filter(|l| l.source == current) {
            if visited.contains(&link.target) {
                continue;
            }
            let transformed = match link.evaluator.evaluate(&value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        link = %format!("{} -> {}", link.source, link.target),
                        error = %e,
                        "property link evaluator failed"
                    );
                    continue;
                }
            };
            let level = {
                let Some(property) = nodes
                    .get_mut(&link.target.processor)
                    .and_then(|n| n.property_mut(&link.target.property))
                else {
                    continue;
                };
                property.set_value(transformed);
                property.invalidation()
            };
            end_touched |= raise_invalidation(nodes, &link.target.processor, level);
            visited.insert(link.target.clone());
            queue.push_back(link.target.clone());
        }
    }
    end_touched
}

/// Readiness snapshot for the default rule and custom overrides.
pub(crate) fn ready_state(
    nodes: &IndexMap<String, ProcessorNode>,
    name: &str,
) -> Option<ReadyState> {
    let node = nodes.get(name)?;
    let ports = node
        .ports()
        .map(|port| {
            let has_data = if port.is_inport() {
                port.connections().iter().any(|peer| {
                    nodes
                        .get(&peer.processor)
                        .and_then(|n| n.port(&peer.port))
                        .map(|p| p.has_data())
                        .unwrap_or(false)
                })
            } else {
                port.has_data()
            };
            PortReadiness {
                id: port.id().to_string(),
                direction: port.direction(),
                required: port.is_required(),
                co_processor: port.is_co_processor(),
                private: port.is_private(),
                loop_port: port.is_loop_port(),
                connected: port.is_connected(),
                has_data,
            }
        })
        .collect();
    Some(ReadyState {
        initialized: node.state().is_initialized(),
        ports,
    })
}

fn rename_refs(
    nodes: &mut IndexMap<String, ProcessorNode>,
    property_links: &mut [PropertyLink],
    size_links: &mut [RenderSizeLink],
    old: &str,
    new: &str,
) {
    for node in nodes.values_mut() {
        for port in node.ports_mut() {
            let renamed: Vec<PortRef> = port
                .connections()
                .iter()
                .map(|c| {
                    if c.processor == old {
                        PortRef::new(new, c.port.clone())
                    } else {
                        c.clone()
                    }
                })
                .collect();
            port.clear_connections();
            for c in renamed {
                port.add_connection(c);
            }
        }
    }
    for link in property_links.iter_mut() {
        if link.source.processor == old {
            link.source.processor = new.to_string();
        }
        if link.target.processor == old {
            link.target.processor = new.to_string();
        }
    }
    for link in size_links.iter_mut() {
        if link.origin.processor == old {
            link.origin.processor = new.to_string();
        }
        if link.receiver.processor == old {
            link.receiver.processor = new.to_string();
        }
    }
}
