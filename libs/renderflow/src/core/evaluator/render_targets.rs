// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Render-target collection and assignment strategies.
//!
//! The evaluator collects every render port needing a target (connected
//! render outports plus private render ports), derives their direct
//! render-port successors, and maps ports to target slots through a
//! pluggable strategy. The safety invariant every strategy must uphold: two
//! ports that can be live at the same time (one still unread while the other
//! is written) never share a slot.

use crate::core::network::ProcessorNetwork;
use crate::core::ports::{PortRef, PortType};
use crate::core::render_target::RenderTargetPool;
use indexmap::IndexMap;

/// Render ports requiring a target, their direct (non-transitive)
/// successors among that same set, and their live intervals over the
/// rendering order.
pub(crate) struct RenderPortAnalysis {
    pub ports: Vec<PortRef>,
    pub successors: IndexMap<PortRef, Vec<PortRef>>,
    pub live_ranges: IndexMap<PortRef, (usize, usize)>,
    pub sizes: IndexMap<PortRef, [u32; 2]>,
}

pub(crate) fn analyze_render_ports(
    network: &ProcessorNetwork,
    rendering_order: &[String],
) -> RenderPortAnalysis {
    let mut ports: Vec<PortRef> = Vec::new();
    for node in network.nodes() {
        for port in node.ports() {
            if port.port_type() != PortType::Render || !port.is_outport() {
                continue;
            }
            if port.is_private() || port.is_connected() {
                ports.push(PortRef::new(node.name(), port.id()));
            }
        }
    }

    let first_position = |name: &str| rendering_order.iter().position(|n| n == name);
    let last_position = |name: &str| rendering_order.iter().rposition(|n| n == name);

    let mut successors: IndexMap<PortRef, Vec<PortRef>> = IndexMap::new();
    let mut live_ranges: IndexMap<PortRef, (usize, usize)> = IndexMap::new();
    let mut sizes: IndexMap<PortRef, [u32; 2]> = IndexMap::new();
    for port_ref in &ports {
        let mut direct: Vec<PortRef> = Vec::new();
        let Some(port) = network.port(port_ref) else {
            continue;
        };

        // live from the owner's first run until the last consumer has read;
        // owners outside the order are treated as live for the whole pass
        let mut start = first_position(&port_ref.processor).unwrap_or(0);
        let mut end = last_position(&port_ref.processor).unwrap_or(rendering_order.len());

        for peer in port.connections() {
            let Some(consumer) = network.node(&peer.processor) else {
                continue;
            };
            if let Some(position) = last_position(&peer.processor) {
                end = end.max(position);
            } else {
                start = 0;
                end = rendering_order.len();
            }
            for outport in consumer.outports() {
                if outport.port_type() != PortType::Render {
                    continue;
                }
                let candidate = PortRef::new(consumer.name(), outport.id());
                if ports.contains(&candidate) && !direct.contains(&candidate) {
                    direct.push(candidate);
                }
            }
        }
        successors.insert(port_ref.clone(), direct);
        live_ranges.insert(port_ref.clone(), (start, end));
        sizes.insert(port_ref.clone(), port.render_size());
    }

    RenderPortAnalysis {
        ports,
        successors,
        live_ranges,
        sizes,
    }
}

/// Maps render ports to target slots. Ports sharing a slot share a physical
/// target.
pub trait TargetAssignmentStrategy: Send {
    fn assign(&self, analysis: &RenderPortAnalysisView<'_>) -> IndexMap<PortRef, usize>;
}

/// Read-only view handed to strategies.
pub struct RenderPortAnalysisView<'a> {
    pub ports: &'a [PortRef],
    /// Direct render-port successors per port.
    pub successors: &'a IndexMap<PortRef, Vec<PortRef>>,
    /// Inclusive `(first_write, last_read)` interval per port over the
    /// rendering order.
    pub live_ranges: &'a IndexMap<PortRef, (usize, usize)>,
    /// Requested render size per port.
    pub sizes: &'a IndexMap<PortRef, [u32; 2]>,
}

/// One target per port. The default: trades memory for unconditional safety.
#[derive(Debug, Default, Clone, Copy)]
pub struct DedicatedTargets;

impl TargetAssignmentStrategy for DedicatedTargets {
    fn assign(&self, analysis: &RenderPortAnalysisView<'_>) -> IndexMap<PortRef, usize> {
        analysis
            .ports
            .iter()
            .enumerate()
            .map(|(slot, port)| (port.clone(), slot))
            .collect()
    }
}

/// Greedy first-fit slot reuse over an interference relation.
///
/// Two ports interfere when their live intervals over the rendering order
/// overlap (one still unread while the other is written) or when both belong
/// to the same processor (both live within one `process()` call). This is
/// register-allocation-style reuse; classic ping-pong chains collapse to two
/// targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct LivenessSharing;

impl LivenessSharing {
    fn interferes(a: &PortRef, b: &PortRef, analysis: &RenderPortAnalysisView<'_>) -> bool {
        if a.processor == b.processor {
            return true;
        }
        // unequal sizes never share; a shared slot must stay dimensionally
        // stable across passes
        if analysis.sizes.get(a) != analysis.sizes.get(b) {
            return true;
        }
        let Some(&(a_start, a_end)) = analysis.live_ranges.get(a) else {
            return true;
        };
        let Some(&(b_start, b_end)) = analysis.live_ranges.get(b) else {
            return true;
        };
        a_start <= b_end && b_start <= a_end
    }
}

impl TargetAssignmentStrategy for LivenessSharing {
    fn assign(&self, analysis: &RenderPortAnalysisView<'_>) -> IndexMap<PortRef, usize> {
        let mut assignment: IndexMap<PortRef, usize> = IndexMap::new();
        let mut slot_members: Vec<Vec<PortRef>> = Vec::new();

        for port in analysis.ports {
            let slot = slot_members.iter().position(|members| {
                members
                    .iter()
                    .all(|other| !Self::interferes(port, other, analysis))
            });
            match slot {
                Some(slot) => {
                    slot_members[slot].push(port.clone());
                    assignment.insert(port.clone(), slot);
                }
                None => {
                    slot_members.push(vec![port.clone()]);
                    assignment.insert(port.clone(), slot_members.len() - 1);
                }
            }
        }
        assignment
    }
}

/// Materialize a slot assignment: allocate one target per slot (sized to the
/// largest member port) and write the assignments into the ports. Render
/// ports outside the assignment lose their target.
pub(crate) fn apply_assignment(
    network: &mut ProcessorNetwork,
    pool: &mut RenderTargetPool,
    assignment: &IndexMap<PortRef, usize>,
) {
    pool.clear();

    let mut slot_sizes: IndexMap<usize, [u32; 2]> = IndexMap::new();
    for (port_ref, &slot) in assignment {
        let Some(port) = network.port(port_ref) else {
            continue;
        };
        let size = port.render_size();
        let entry = slot_sizes.entry(slot).or_insert([0, 0]);
        entry[0] = entry[0].max(size[0]);
        entry[1] = entry[1].max(size[1]);
    }

    let slot_targets: IndexMap<usize, _> = slot_sizes
        .iter()
        .map(|(&slot, &size)| (slot, pool.acquire(size)))
        .collect();

    let names = network.processor_names();
    for name in names {
        let Some(node) = network.node_mut(&name) else {
            continue;
        };
        let port_ids: Vec<String> = node
            .ports()
            .filter(|p| p.port_type() == PortType::Render && p.is_outport())
            .map(|p| p.id().to_string())
            .collect();
        for port_id in port_ids {
            let target = assignment
                .get(&PortRef::new(name.clone(), port_id.clone()))
                .and_then(|slot| slot_targets.get(slot))
                .copied();
            if let Some(port) = node.port_mut(&port_id) {
                port.assign_render_target(target);
            }
        }
    }
}

/// Resize pooled targets whose port render size changed since assignment
/// (e.g. through a render size link).
pub(crate) fn refresh_target_sizes(network: &ProcessorNetwork, pool: &mut RenderTargetPool) {
    for node in network.nodes() {
        for port in node.ports() {
            let Some(id) = port.render_target() else {
                continue;
            };
            if let Some(target) = pool.get_mut(id) {
                if !target.is_active() && target.size() != port.render_size() {
                    target.resize(port.render_size());
                }
            }
        }
    }
}
