// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The network evaluator: scheduling, lifecycle, pass execution.
//!
//! One evaluator drives one processor network. It derives and caches a
//! topological rendering order, lazily initializes processors, executes
//! passes in that order, and assigns render targets whenever topology
//! settles. All failure handling is per-processor: an error is logged with
//! the processor's identity and the pass continues.
//!
//! The lock here is a same-thread re-entrancy guard, not a mutex: it keeps
//! observer callbacks fired mid-pass from re-entering the evaluator, and is
//! no substitute for cross-thread synchronization (graph mutation and
//! evaluation belong to one thread).

use crate::core::context::GraphicsContext;
use crate::core::error::{FlowError, Result};
use crate::core::evaluator::render_targets::{
    analyze_render_ports, apply_assignment, refresh_target_sizes, DedicatedTargets,
    LivenessSharing, RenderPortAnalysisView, TargetAssignmentStrategy,
};
use crate::core::events::{EvaluationRequest, EvaluatorEvent, SubscriberId, SubscriberList};
use crate::core::invalidation::{InvalidationLevel, ProcessorState};
use crate::core::network::{LoopEdgePolicy, NetworkGraph, ProcessorNetwork};
use crate::core::processor::{InitContext, ProcessContext};
use crate::core::render_target::{RenderTargetPool, RenderTargetPoolStats};
use crossbeam_channel::{Receiver, Sender};
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What the pass walk decided to do with one rendering-order entry.
enum Step {
    SkipUninitialized,
    SkipValid,
    ClearNotReady,
    Run,
}

/// The scheduler driving a processor network.
pub struct NetworkEvaluator {
    network: Option<Arc<RwLock<ProcessorNetwork>>>,
    graphics: Option<Arc<dyn GraphicsContext>>,
    /// Cached topological order, loop bodies already unrolled.
    rendering_order: Vec<String>,
    /// Connected loop inports per processor, for iteration counters.
    loop_port_map: IndexMap<String, Vec<String>>,
    render_targets: RenderTargetPool,
    assignment_strategy: Box<dyn TargetAssignmentStrategy>,
    observers: SubscriberList<EvaluatorEvent>,
    locked: bool,
    process_pending: bool,
    /// Network revision the rendering order was derived from.
    compiled_revision: Option<u64>,
    request_tx: Sender<EvaluationRequest>,
    request_rx: Receiver<EvaluationRequest>,
    last_errors: Vec<String>,
}

impl Default for NetworkEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkEvaluator {
    /// Evaluator without a graphics context (no focus calls are made).
    pub fn new() -> Self {
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        Self {
            network: None,
            graphics: None,
            rendering_order: Vec::new(),
            loop_port_map: IndexMap::new(),
            render_targets: RenderTargetPool::new(),
            assignment_strategy: Box::new(DedicatedTargets),
            observers: SubscriberList::new(),
            locked: false,
            process_pending: false,
            compiled_revision: None,
            request_tx,
            request_rx,
            last_errors: Vec::new(),
        }
    }

    /// Evaluator bound to a shared graphics context; focus is acquired
    /// around every initialize/deinitialize/process step.
    pub fn with_graphics(graphics: Arc<dyn GraphicsContext>) -> Self {
        let mut evaluator = Self::new();
        evaluator.graphics = Some(graphics);
        evaluator
    }

    /// Attach to a network (or detach with `None`). The previous network is
    /// optionally deinitialized first. Triggers a full rebuild.
    pub fn set_network(
        &mut self,
        network: Option<Arc<RwLock<ProcessorNetwork>>>,
        deinitialize_current: bool,
    ) {
        if self.locked {
            warn!("set_network() called on locked evaluator");
            return;
        }
        if let Some(previous) = self.network.clone() {
            if deinitialize_current {
                self.deinitialize_network();
            }
            previous.write().set_request_sender(None);
        }

        self.network = network;
        self.compiled_revision = None;
        if let Some(net) = &self.network {
            net.write()
                .set_request_sender(Some(self.request_tx.clone()));
        }
        self.notify(EvaluatorEvent::NetworkAssigned);
        self.on_network_change();
    }

    pub fn network(&self) -> Option<Arc<RwLock<ProcessorNetwork>>> {
        self.network.clone()
    }

    /// Receiver for pass requests the core addresses to the application
    /// loop (deferred evaluation, mid-pass aborts, end-processor
    /// invalidation).
    pub fn requests(&self) -> Receiver<EvaluationRequest> {
        self.request_rx.clone()
    }

    /// Enable or disable render-target sharing between non-interfering
    /// ports. Takes effect at the next rebuild.
    pub fn set_target_sharing(&mut self, share: bool) {
        self.assignment_strategy = if share {
            Box::new(LivenessSharing)
        } else {
            Box::new(DedicatedTargets)
        };
    }

    /// Replace the assignment strategy wholesale.
    pub fn set_assignment_strategy(&mut self, strategy: Box<dyn TargetAssignmentStrategy>) {
        self.assignment_strategy = strategy;
    }

    pub fn rendering_order(&self) -> &[String] {
        &self.rendering_order
    }

    /// Topology errors recorded by the most recent rebuild.
    pub fn last_errors(&self) -> &[String] {
        &self.last_errors
    }

    pub fn render_target_stats(&self) -> RenderTargetPoolStats {
        self.render_targets.stats()
    }

    pub fn add_observer(
        &mut self,
        callback: impl FnMut(&EvaluatorEvent) + Send + 'static,
    ) -> SubscriberId {
        self.observers.subscribe(callback)
    }

    pub fn remove_observer(&mut self, id: SubscriberId) -> bool {
        self.observers.unsubscribe(id)
    }

    // ---- locking (re-entrancy guard) ----

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    // ---- rebuild ----

    /// Re-derive everything that depends on topology: the rendering order,
    /// the loop-port map, lazy initialization and render-target assignment.
    /// Finally demotes `InvalidPorts`-and-above levels so this rebuild is
    /// not re-triggered every pass by its own bookkeeping.
    pub fn on_network_change(&mut self) {
        if self.locked {
            warn!("on_network_change() called on locked evaluator");
            return;
        }

        self.rendering_order.clear();
        self.loop_port_map.clear();
        self.last_errors.clear();

        let Some(net) = self.network.clone() else {
            self.render_targets.clear();
            return;
        };

        {
            let mut netw = net.write();

            // reconcile port sets of processors flagged for topology change
            let dirty: Vec<String> = netw
                .nodes()
                .filter(|n| n.invalidation().alters_topology())
                .map(|n| n.name().to_string())
                .collect();
            for name in dirty {
                if let Err(e) = netw.sync_ports(&name) {
                    warn!(processor = %name, error = %e, "port synchronization failed");
                }
            }
            self.compiled_revision = Some(netw.revision());

            // rendering order: predecessors of the end processors, loop
            // bodies unrolled, sorted topologically
            let graph = NetworkGraph::build(&netw, LoopEdgePolicy::Unroll);
            let ends = netw.end_processors();
            let predecessors = graph.predecessors(&ends);
            match graph.sort_topological(Some(&predecessors)) {
                Ok(order) => self.rendering_order = order,
                Err(e) => {
                    error!(error = %e, "network topology is invalid, execution order left empty");
                    self.last_errors.push(e.to_string());
                    self.rendering_order.clear();
                }
            }

            // map processors to their connected loop inports; unconnected
            // loop inports idle at iteration zero
            for name in self.rendering_order.clone() {
                if self.loop_port_map.contains_key(&name) {
                    continue;
                }
                let Some(node) = netw.node_mut(&name) else {
                    continue;
                };
                let mut connected = Vec::new();
                let mut idle = Vec::new();
                for port in node.loop_inports() {
                    if port.is_connected() {
                        connected.push(port.id().to_string());
                    } else {
                        idle.push(port.id().to_string());
                    }
                }
                for port_id in idle {
                    if let Some(port) = node.port_mut(&port_id) {
                        port.set_loop_iteration(0);
                    }
                }
                self.loop_port_map.insert(name, connected);
            }
        }

        self.initialize_network();

        // demote so the rebuild's own bookkeeping cannot re-trigger it
        let mut netw = net.write();
        for name in netw.processor_names() {
            if let Some(node) = netw.node_mut(&name) {
                if node.invalidation().alters_topology() {
                    node.set_invalidation(InvalidationLevel::InvalidProgram);
                }
            }
        }
    }

    // ---- lifecycle ----

    /// Initialize every processor that is not yet initialized. Failures are
    /// isolated: the failing processor is cleaned up via `deinitialize` and
    /// left `NotInitialized`, the rest of the batch proceeds. Returns true
    /// only if every processor succeeded.
    pub fn initialize_network(&mut self) -> bool {
        if self.locked {
            warn!("initialize_network() called on locked evaluator");
            return false;
        }
        let Some(net) = self.network.clone() else {
            warn!("initialize_network() called without a network");
            return false;
        };

        self.lock();
        self.notify(EvaluatorEvent::BeforeNetworkInitialize);

        let mut failed = false;
        let names = net.read().processor_names();
        for name in names {
            let (needs_init, instance) = {
                let netw = net.read();
                (
                    netw.node(&name)
                        .map(|n| !n.state().is_initialized())
                        .unwrap_or(false),
                    netw.instance(&name),
                )
            };
            if !needs_init {
                continue;
            }
            let Some(instance) = instance else {
                continue;
            };

            let mut guard = instance.lock();
            self.acquire_focus();
            let mut ctx = InitContext::new(&name, self.graphics.as_deref());
            match guard.initialize(&mut ctx) {
                Ok(()) => {
                    self.acquire_focus();
                    if let Some(node) = net.write().node_mut(&name) {
                        node.set_state(ProcessorState::NotReady);
                    }
                }
                Err(e) => {
                    error!(processor = %name, error = %e, "failed to initialize processor");
                    self.last_errors.push(format!("initialize '{name}': {e}"));

                    // release whatever the failed initialize acquired
                    info!(processor = %name, "deinitializing after failed initialization");
                    self.acquire_focus();
                    if let Err(e) = guard.deinitialize(&mut ctx) {
                        warn!(processor = %name, error = %e, "cleanup deinitialization failed");
                    }
                    if let Some(node) = net.write().node_mut(&name) {
                        node.set_state(ProcessorState::NotInitialized);
                    }
                    failed = true;
                }
            }
        }

        self.assign_render_targets_inner(&net);

        self.notify(EvaluatorEvent::AfterNetworkInitialize);
        self.unlock();
        !failed
    }

    /// Deinitialize every initialized processor; same partial-failure policy
    /// as initialization. Clears all render-target state.
    pub fn deinitialize_network(&mut self) -> bool {
        if self.locked {
            warn!("deinitialize_network() called on locked evaluator");
            return false;
        }
        let Some(net) = self.network.clone() else {
            warn!("deinitialize_network() called without a network");
            return false;
        };

        self.lock();
        self.notify(EvaluatorEvent::BeforeNetworkDeinitialize);

        let mut failed = false;
        let names = net.read().processor_names();
        for name in names {
            let (initialized, instance) = {
                let netw = net.read();
                (
                    netw.node(&name)
                        .map(|n| n.state().is_initialized())
                        .unwrap_or(false),
                    netw.instance(&name),
                )
            };
            if !initialized {
                continue;
            }
            let Some(instance) = instance else {
                continue;
            };

            let mut guard = instance.lock();
            self.acquire_focus();
            let mut ctx = InitContext::new(&name, self.graphics.as_deref());
            if let Err(e) = guard.deinitialize(&mut ctx) {
                error!(processor = %name, error = %e, "failed to deinitialize processor");
                failed = true;
            }
            self.acquire_focus();
            if let Some(node) = net.write().node_mut(&name) {
                node.set_state(ProcessorState::NotInitialized);
            }
        }

        {
            let mut netw = net.write();
            let names = netw.processor_names();
            for name in names {
                if let Some(node) = netw.node_mut(&name) {
                    let ports: Vec<String> = node.ports().map(|p| p.id().to_string()).collect();
                    for port_id in ports {
                        if let Some(port) = node.port_mut(&port_id) {
                            port.assign_render_target(None);
                        }
                    }
                }
            }
        }
        self.render_targets.clear();

        self.notify(EvaluatorEvent::AfterNetworkDeinitialize);
        self.unlock();
        !failed
    }

    /// Deinitialize a processor under graphics focus, then remove it from
    /// the network (cascading connections and links).
    pub fn remove_processor(&mut self, name: &str) -> Result<()> {
        if self.locked {
            return Err(FlowError::Configuration(
                "remove_processor() called on locked evaluator".into(),
            ));
        }
        let net = self
            .network
            .clone()
            .ok_or_else(|| FlowError::ProcessorNotFound(name.into()))?;

        let (initialized, instance) = {
            let netw = net.read();
            (
                netw.node(name)
                    .map(|n| n.state().is_initialized())
                    .unwrap_or(false),
                netw.instance(name),
            )
        };
        if initialized {
            if let Some(instance) = instance {
                let mut guard = instance.lock();
                self.acquire_focus();
                let mut ctx = InitContext::new(name, self.graphics.as_deref());
                if let Err(e) = guard.deinitialize(&mut ctx) {
                    error!(processor = %name, error = %e, "failed to deinitialize processor");
                }
                self.acquire_focus();
                if let Some(node) = net.write().node_mut(name) {
                    node.set_state(ProcessorState::NotInitialized);
                }
            }
        }
        net.write().remove_processor(name)
    }

    // ---- render targets ----

    /// Recompute the port-to-target assignment from current topology.
    pub fn assign_render_targets(&mut self) {
        let Some(net) = self.network.clone() else {
            return;
        };
        self.assign_render_targets_inner(&net);
    }

    fn assign_render_targets_inner(&mut self, net: &Arc<RwLock<ProcessorNetwork>>) {
        let mut netw = net.write();
        let analysis = analyze_render_ports(&netw, &self.rendering_order);
        let view = RenderPortAnalysisView {
            ports: &analysis.ports,
            successors: &analysis.successors,
            live_ranges: &analysis.live_ranges,
            sizes: &analysis.sizes,
        };
        let assignment = self.assignment_strategy.assign(&view);
        apply_assignment(&mut netw, &mut self.render_targets, &assignment);
        debug!(
            ports = analysis.ports.len(),
            targets = self.render_targets.len(),
            "assigned render targets"
        );
    }

    // ---- invalidation sweeps ----

    /// Invalidate every processor in the network. Defeats the scheduler's
    /// caching; meant for debugging and initialization only.
    pub fn invalidate_processors(&mut self, level: InvalidationLevel) {
        if self.locked {
            warn!("invalidate_processors() called on locked evaluator");
            return;
        }
        let Some(net) = self.network.clone() else {
            return;
        };
        let mut netw = net.write();
        for name in netw.processor_names() {
            netw.invalidate_processor(&name, level);
        }
    }

    /// Full recomputation: invalidate everything, then process. Debug tool.
    pub fn force_update(&mut self) {
        if self.locked {
            warn!("force_update() called on locked evaluator");
            return;
        }
        self.invalidate_processors(InvalidationLevel::InvalidResult);
        self.process();
    }

    // ---- the pass driver ----

    /// Execute one evaluation pass over the cached rendering order.
    ///
    /// Deferred when the evaluator is locked. Rebuilds first if topology
    /// changed since the last pass. Aborts and schedules a follow-up pass
    /// when a processor's invalidation reaches `InvalidPorts` mid-pass.
    pub fn process(&mut self) {
        let Some(net) = self.network.clone() else {
            return;
        };
        if self.locked {
            debug!("process() called on locked evaluator, deferring");
            self.process_pending = true;
            return;
        }

        let needs_rebuild = {
            let netw = net.read();
            self.compiled_revision != Some(netw.revision()) || netw.has_invalid_ports()
        };
        if needs_rebuild {
            self.on_network_change();
        }

        self.lock();
        if self.rendering_order.is_empty() {
            debug!("process(): rendering order is empty");
        }

        {
            let mut netw = net.write();
            refresh_target_sizes(&netw, &mut self.render_targets);

            // loop counters start each pass at the "not yet iterated" state
            for (name, ports) in &self.loop_port_map {
                let Some(node) = netw.node_mut(name) else {
                    continue;
                };
                for port_id in ports {
                    if let Some(port) = node.port_mut(port_id) {
                        port.reset_loop_iteration();
                    }
                }
            }
        }

        self.notify(EvaluatorEvent::BeforeNetworkProcess);

        // validation is deferred to the end of the pass so processors
        // occurring multiple times in the order (loops) run once per visit
        let mut processed: IndexSet<String> = IndexSet::new();

        let order = self.rendering_order.clone();
        for name in &order {
            let step = self.prepare_step(&net, name);
            match step {
                Step::SkipUninitialized => {
                    warn!(processor = %name, "skipping uninitialized processor");
                    continue;
                }
                Step::SkipValid => continue,
                Step::ClearNotReady => {
                    if let Some(node) = net.write().node_mut(name) {
                        node.clear_outports();
                    }
                    continue;
                }
                Step::Run => {}
            }

            self.notify(EvaluatorEvent::BeforeProcess { name: name.clone() });

            let result = self.run_processor(&net, name);
            match result {
                Ok(()) => {
                    processed.insert(name.clone());
                }
                Err(e) => {
                    // isolated failure: level stays raised, retried next pass
                    error!(processor = %name, error = %e, "processor failed during pass");
                }
            }

            self.notify(EvaluatorEvent::AfterProcess { name: name.clone() });

            // a property changed this processor's port set mid-pass: the
            // cached order is stale, abort and redo after a rebuild
            if net.read().has_invalid_ports() {
                debug!(processor = %name, "topology changed mid-pass, aborting walk");
                self.unlock();
                self.notify(EvaluatorEvent::AfterNetworkProcess);
                self.on_network_change();
                self.request(EvaluationRequest::Process);
                return;
            }
        }

        // a processor is valid after processing unless its ports or the
        // processor itself were invalidated meanwhile
        {
            let mut netw = net.write();
            for name in &processed {
                if let Some(node) = netw.node_mut(name) {
                    if !node.invalidation().alters_topology() {
                        node.set_valid();
                    }
                }
            }
        }

        self.notify(EvaluatorEvent::AfterNetworkProcess);
        self.unlock();

        if self.process_pending {
            // canvases blocked by the locked evaluator still need a repaint
            self.process_pending = false;
            self.request(EvaluationRequest::RefreshCanvases);
        }

        // observer side effects can leave ready-but-invalid processors; ask
        // the host loop for another pass instead of looping synchronously
        let follow_up = {
            let netw = net.read();
            order.iter().any(|name| {
                netw.node(name)
                    .map(|n| !n.is_valid() && n.state() == ProcessorState::Ready)
                    .unwrap_or(false)
            })
        };
        if follow_up {
            debug!("ready-but-invalid processors remain, requesting follow-up pass");
            self.request(EvaluationRequest::Process);
        }
    }

    /// Pre-flight for one rendering-order entry: reaction to changed
    /// inports, readiness, loop counter advancement.
    fn prepare_step(&mut self, net: &Arc<RwLock<ProcessorNetwork>>, name: &str) -> Step {
        let mut netw = net.write();
        let Some(node) = netw.node(name) else {
            return Step::SkipValid;
        };
        if !node.state().is_initialized() {
            return Step::SkipUninitialized;
        }
        let Some(instance) = netw.instance(name) else {
            return Step::SkipValid;
        };
        let mut guard = instance.lock();

        // new input data may require the processor to adjust its properties
        // before readiness is judged
        if netw.any_inport_changed(name) {
            let (nodes, links) = netw.pass_state();
            let mut ctx = ProcessContext::new(
                nodes,
                links,
                name,
                &mut self.render_targets,
                self.graphics.as_deref(),
            );
            if let Err(e) = guard.inports_changed(&mut ctx) {
                warn!(processor = %name, error = %e, "inport-change handler failed");
            }
        }

        let needs_processing = netw.node(name).map(|n| !n.is_valid()).unwrap_or(false);
        let ready = netw
            .ready_state(name)
            .map(|state| guard.is_ready(&state))
            .unwrap_or(false);
        if let Some(node) = netw.node_mut(name) {
            node.set_state(if ready {
                ProcessorState::Ready
            } else {
                ProcessorState::NotReady
            });
        }

        if !ready {
            return Step::ClearNotReady;
        }
        if !needs_processing {
            return Step::SkipValid;
        }

        // advance loop counters; modulo keeps nested loops in range
        if let Some(ports) = self.loop_port_map.get(name) {
            if let Some(node) = netw.node_mut(name) {
                for port_id in ports {
                    if let Some(port) = node.port_mut(port_id) {
                        let next = if port.loop_iterated() {
                            (port.loop_iteration() + 1) % port.num_loop_iterations()
                        } else {
                            0
                        };
                        port.set_loop_iteration(next);
                    }
                }
            }
        }
        Step::Run
    }

    /// The hook sequence for one processor, under its instance mutex:
    /// `before_process`, then `process` (only if still invalid), then
    /// `after_process`.
    fn run_processor(&mut self, net: &Arc<RwLock<ProcessorNetwork>>, name: &str) -> Result<()> {
        let mut netw = net.write();
        let instance = netw
            .instance(name)
            .ok_or_else(|| FlowError::ProcessorNotFound(name.into()))?;
        let mut guard = instance.lock();

        self.acquire_focus();

        {
            let (nodes, links) = netw.pass_state();
            let mut ctx = ProcessContext::new(
                nodes,
                links,
                name,
                &mut self.render_targets,
                self.graphics.as_deref(),
            );
            guard.before_process(&mut ctx)?;
        }

        let still_invalid = netw.node(name).is_some_and(|n| !n.is_valid());
        if still_invalid {
            let (nodes, links) = netw.pass_state();
            let mut ctx = ProcessContext::new(
                nodes,
                links,
                name,
                &mut self.render_targets,
                self.graphics.as_deref(),
            );
            guard.process(&mut ctx)?;
        }

        {
            let (nodes, links) = netw.pass_state();
            let mut ctx = ProcessContext::new(
                nodes,
                links,
                name,
                &mut self.render_targets,
                self.graphics.as_deref(),
            );
            guard.after_process(&mut ctx)?;
        }
        Ok(())
    }

    fn acquire_focus(&self) {
        if let Some(graphics) = &self.graphics {
            graphics.acquire_focus();
        }
    }

    fn notify(&mut self, event: EvaluatorEvent) {
        self.observers.emit(&event);
    }

    fn request(&self, request: EvaluationRequest) {
        let _ = self.request_tx.try_send(request);
    }
}

impl std::fmt::Debug for NetworkEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkEvaluator")
            .field("has_network", &self.network.is_some())
            .field("rendering_order", &self.rendering_order)
            .field("locked", &self.locked)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::HeadlessContext;
    use crate::core::ports::{PortDescriptor, PortRef, PortType};
    use crate::core::testing::TestProcessor;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn wrap(network: ProcessorNetwork) -> Arc<RwLock<ProcessorNetwork>> {
        Arc::new(RwLock::new(network))
    }

    struct Chain {
        net: Arc<RwLock<ProcessorNetwork>>,
        counts: [Arc<AtomicUsize>; 3],
        fail_b: Arc<AtomicBool>,
    }

    /// a (source) -> b (filter) -> c (sink / end processor)
    fn chain() -> Chain {
        let mut network = ProcessorNetwork::new();
        let a = TestProcessor::source("Source");
        let b = TestProcessor::filter("Filter");
        let c = TestProcessor::sink("Sink");
        let counts = [
            Arc::clone(&a.process_count),
            Arc::clone(&b.process_count),
            Arc::clone(&c.process_count),
        ];
        let fail_b = b.failure_handle();
        network.add_processor_named(Box::new(a), Some("a")).unwrap();
        network.add_processor_named(Box::new(b), Some("b")).unwrap();
        network.add_processor_named(Box::new(c), Some("c")).unwrap();
        assert!(network.connect_ports(&PortRef::new("a", "out"), &PortRef::new("b", "in")));
        assert!(network.connect_ports(&PortRef::new("b", "out"), &PortRef::new("c", "in")));
        Chain {
            net: wrap(network),
            counts,
            fail_b,
        }
    }

    fn counts_of(chain: &Chain) -> [usize; 3] {
        [
            chain.counts[0].load(Ordering::SeqCst),
            chain.counts[1].load(Ordering::SeqCst),
            chain.counts[2].load(Ordering::SeqCst),
        ]
    }

    #[test]
    fn test_linear_chain_processes_once_then_caches() {
        let chain = chain();
        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&chain.net)), false);

        evaluator.process();
        assert_eq!(counts_of(&chain), [1, 1, 1]);
        {
            let netw = chain.net.read();
            for name in ["a", "b", "c"] {
                assert!(netw.node(name).unwrap().is_valid(), "{name} should be valid");
            }
        }

        // nothing invalidated: the second pass completes without running
        // a single process() body
        evaluator.process();
        assert_eq!(counts_of(&chain), [1, 1, 1]);
    }

    #[test]
    fn test_selective_reprocessing_after_invalidation() {
        let chain = chain();
        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&chain.net)), false);
        evaluator.process();

        chain
            .net
            .write()
            .invalidate_processor("b", InvalidationLevel::InvalidResult);
        evaluator.process();

        // invalidation propagated downstream but not upstream
        assert_eq!(counts_of(&chain), [1, 2, 2]);
    }

    #[test]
    fn test_partial_failure_isolation() {
        let chain = chain();
        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&chain.net)), false);
        evaluator.process();

        chain.fail_b.store(true, Ordering::SeqCst);
        chain
            .net
            .write()
            .invalidate_processor("a", InvalidationLevel::InvalidResult);
        evaluator.process();

        // b failed, but both a and c still ran (c consumes b's retained
        // output from the previous pass)
        assert_eq!(counts_of(&chain), [2, 2, 2]);
        let netw = chain.net.read();
        assert!(netw.node("a").unwrap().is_valid());
        assert!(netw.node("c").unwrap().is_valid());
        // the failing processor is not marked valid and will be retried
        assert!(!netw.node("b").unwrap().is_valid());
    }

    #[test]
    fn test_never_succeeding_producer_leaves_consumer_not_ready() {
        let chain = chain();
        chain.fail_b.store(true, Ordering::SeqCst);
        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&chain.net)), false);
        evaluator.process();

        // b never produced output, so c was never ready and never ran
        assert_eq!(counts_of(&chain), [1, 1, 0]);
        assert_eq!(
            chain.net.read().node("c").unwrap().state(),
            ProcessorState::NotReady
        );
    }

    #[test]
    fn test_initialization_failure_is_isolated() {
        let mut network = ProcessorNetwork::new();
        let a = TestProcessor::source("Source");
        let b = TestProcessor::filter("Filter").failing_initialize();
        let c = TestProcessor::sink("Sink");
        let a_count = Arc::clone(&a.process_count);
        let (_, b_init, b_deinit) = b.counters();
        let c_init = Arc::clone(&c.init_count);
        network.add_processor_named(Box::new(a), Some("a")).unwrap();
        network.add_processor_named(Box::new(b), Some("b")).unwrap();
        network.add_processor_named(Box::new(c), Some("c")).unwrap();
        network.connect_ports(&PortRef::new("a", "out"), &PortRef::new("b", "in"));
        network.connect_ports(&PortRef::new("b", "out"), &PortRef::new("c", "in"));
        let net = wrap(network);

        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&net)), false);

        // the failing processor was cleaned up, the others initialized
        assert_eq!(b_init.load(Ordering::SeqCst), 0);
        assert_eq!(b_deinit.load(Ordering::SeqCst), 1);
        assert_eq!(c_init.load(Ordering::SeqCst), 1);
        assert_eq!(
            net.read().node("b").unwrap().state(),
            ProcessorState::NotInitialized
        );
        assert!(!evaluator.last_errors().is_empty());

        // the pass skips the uninitialized processor but still runs the rest
        evaluator.process();
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_loop_iteration_counters_cycle() {
        let iterations = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&iterations);

        let mut network = ProcessorNetwork::new();
        let source = TestProcessor::source("Source");
        let head = TestProcessor::filter("Head")
            .with_port(PortDescriptor::inport("loop", PortType::Data).looping(3))
            .on_process(move |ctx| {
                record.lock().push(ctx.loop_iteration("loop"));
                let input = ctx.fetch_data("in").unwrap_or(serde_json::json!(null));
                ctx.write_output("out", crate::core::ports::PortData::Data(input))
            });
        let tail = TestProcessor::filter("Tail")
            .with_port(PortDescriptor::outport("loop", PortType::Data).looping(3));
        let sink = TestProcessor::sink("Sink");
        let head_count = Arc::clone(&head.process_count);

        network
            .add_processor_named(Box::new(source), Some("source"))
            .unwrap();
        network
            .add_processor_named(Box::new(head), Some("head"))
            .unwrap();
        network
            .add_processor_named(Box::new(tail), Some("tail"))
            .unwrap();
        network
            .add_processor_named(Box::new(sink), Some("sink"))
            .unwrap();
        assert!(network.connect_ports(&PortRef::new("source", "out"), &PortRef::new("head", "in")));
        assert!(network.connect_ports(&PortRef::new("head", "out"), &PortRef::new("tail", "in")));
        assert!(network.connect_ports(&PortRef::new("tail", "out"), &PortRef::new("sink", "in")));
        assert!(network.connect_ports(
            &PortRef::new("tail", "loop"),
            &PortRef::new("head", "loop")
        ));
        let net = wrap(network);

        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&net)), false);
        evaluator.process();

        // one pass visits the loop body once per iteration
        assert_eq!(head_count.load(Ordering::SeqCst), 3);
        assert_eq!(*iterations.lock(), vec![0, 1, 2]);

        // counters restart at the next pass
        evaluator.invalidate_processors(InvalidationLevel::InvalidResult);
        evaluator.process();
        assert_eq!(*iterations.lock(), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_mid_pass_port_change_aborts_and_schedules_followup() {
        let mut network = ProcessorNetwork::new();
        let a = TestProcessor::source("Source");
        let grow_once = Arc::new(AtomicBool::new(true));
        let trigger = Arc::clone(&grow_once);
        let b = TestProcessor::filter("Filter").on_process(move |ctx| {
            if trigger.swap(false, Ordering::SeqCst) {
                // a property-driven port change: topology is stale now
                ctx.invalidate(InvalidationLevel::InvalidPorts);
            }
            let input = ctx.fetch_data("in").unwrap_or(serde_json::json!(null));
            ctx.write_output("out", crate::core::ports::PortData::Data(input))
        });
        let c = TestProcessor::sink("Sink");
        let a_count = Arc::clone(&a.process_count);
        let b_count = Arc::clone(&b.process_count);
        let c_count = Arc::clone(&c.process_count);
        network.add_processor_named(Box::new(a), Some("a")).unwrap();
        network.add_processor_named(Box::new(b), Some("b")).unwrap();
        network.add_processor_named(Box::new(c), Some("c")).unwrap();
        network.connect_ports(&PortRef::new("a", "out"), &PortRef::new("b", "in"));
        network.connect_ports(&PortRef::new("b", "out"), &PortRef::new("c", "in"));
        let net = wrap(network);

        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&net)), false);
        let requests = evaluator.requests();
        while requests.try_recv().is_ok() {}

        evaluator.process();

        // the pass aborted after b: c never ran
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
        assert_eq!(c_count.load(Ordering::SeqCst), 0);
        // a follow-up pass was requested from the host loop
        assert!(requests
            .try_iter()
            .any(|r| r == EvaluationRequest::Process));

        // the follow-up pass completes; earlier processors were left
        // invalid by the abort and run again
        evaluator.process();
        assert_eq!(a_count.load(Ordering::SeqCst), 2);
        assert_eq!(b_count.load(Ordering::SeqCst), 2);
        assert_eq!(c_count.load(Ordering::SeqCst), 1);
        assert!(net.read().node("c").unwrap().is_valid());
    }

    #[test]
    fn test_locked_evaluator_defers_processing() {
        let chain = chain();
        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&chain.net)), false);
        let requests = evaluator.requests();
        while requests.try_recv().is_ok() {}

        evaluator.lock();
        evaluator.process();
        assert_eq!(counts_of(&chain), [0, 0, 0]);

        evaluator.unlock();
        evaluator.process();
        assert_eq!(counts_of(&chain), [1, 1, 1]);
        // the deferred evaluation surfaces as a canvas refresh request
        assert!(requests
            .try_iter()
            .any(|r| r == EvaluationRequest::RefreshCanvases));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let chain = chain();
        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&chain.net)), false);

        let first = evaluator.rendering_order().to_vec();
        evaluator.on_network_change();
        assert_eq!(evaluator.rendering_order(), first.as_slice());
        assert_eq!(first, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_processors_not_feeding_an_end_processor_are_pruned() {
        let chain = chain();
        let stray = TestProcessor::source("Source");
        let stray_count = Arc::clone(&stray.process_count);
        chain
            .net
            .write()
            .add_processor_named(Box::new(stray), Some("stray"))
            .unwrap();

        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&chain.net)), false);
        evaluator.process();

        assert!(!evaluator.rendering_order().contains(&"stray".to_string()));
        assert_eq!(stray_count.load(Ordering::SeqCst), 0);
        assert_eq!(counts_of(&chain), [1, 1, 1]);
    }

    #[test]
    fn test_network_without_end_processors_is_a_noop() {
        let mut network = ProcessorNetwork::new();
        let source = TestProcessor::source("Source");
        let count = Arc::clone(&source.process_count);
        network
            .add_processor_named(Box::new(source), Some("source"))
            .unwrap();

        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(wrap(network)), false);
        evaluator.process();

        assert!(evaluator.rendering_order().is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_graphics_focus_is_acquired_around_lifecycle() {
        let context = Arc::new(HeadlessContext::new());
        let chain = chain();
        let mut evaluator = NetworkEvaluator::with_graphics(context.clone());
        evaluator.set_network(Some(Arc::clone(&chain.net)), false);
        let after_init = context.focus_count();
        assert!(after_init > 0);

        evaluator.process();
        assert!(context.focus_count() > after_init);
    }

    #[test]
    fn test_deinitialize_network_is_symmetric() {
        let mut network = ProcessorNetwork::new();
        let source = TestProcessor::source("Source");
        let sink = TestProcessor::sink("Sink");
        let (_, source_init, source_deinit) = source.counters();
        network
            .add_processor_named(Box::new(source), Some("source"))
            .unwrap();
        network
            .add_processor_named(Box::new(sink), Some("sink"))
            .unwrap();
        network.connect_ports(&PortRef::new("source", "out"), &PortRef::new("sink", "in"));
        let net = wrap(network);

        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&net)), false);
        assert_eq!(source_init.load(Ordering::SeqCst), 1);

        assert!(evaluator.deinitialize_network());
        assert_eq!(source_deinit.load(Ordering::SeqCst), 1);
        assert_eq!(
            net.read().node("source").unwrap().state(),
            ProcessorState::NotInitialized
        );

        // initialize again: states stay consistent, no double init of
        // already-initialized processors
        assert!(evaluator.initialize_network());
        assert_eq!(source_init.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_evaluator_remove_processor_deinitializes_first() {
        let mut network = ProcessorNetwork::new();
        let b = TestProcessor::filter("Filter");
        let (_, b_init, b_deinit) = b.counters();
        network.add_processor_named(Box::new(b), Some("b")).unwrap();
        network
            .add_processor_named(Box::new(TestProcessor::sink("Sink")), Some("c"))
            .unwrap();
        network.connect_ports(&PortRef::new("b", "out"), &PortRef::new("c", "in"));
        let net = wrap(network);

        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&net)), false);
        assert_eq!(b_init.load(Ordering::SeqCst), 1);
        assert!(net.read().node("b").unwrap().state().is_initialized());

        evaluator.remove_processor("b").unwrap();
        assert_eq!(b_deinit.load(Ordering::SeqCst), 1);
        assert!(!net.read().contains("b"));
        assert!(!net.read().port(&PortRef::new("c", "in")).unwrap().is_connected());
    }

    #[test]
    fn test_observer_event_order() {
        let chain = chain();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let mut evaluator = NetworkEvaluator::new();
        evaluator.set_network(Some(Arc::clone(&chain.net)), false);
        evaluator.add_observer(move |event: &EvaluatorEvent| {
            sink.lock().push(event.clone());
        });
        evaluator.process();

        let events = events.lock();
        let position = |e: &EvaluatorEvent| events.iter().position(|x| x == e).unwrap();
        let before_pass = position(&EvaluatorEvent::BeforeNetworkProcess);
        let before_a = position(&EvaluatorEvent::BeforeProcess { name: "a".into() });
        let after_a = position(&EvaluatorEvent::AfterProcess { name: "a".into() });
        let before_b = position(&EvaluatorEvent::BeforeProcess { name: "b".into() });
        let after_pass = position(&EvaluatorEvent::AfterNetworkProcess);
        assert!(before_pass < before_a);
        assert!(before_a < after_a);
        assert!(after_a < before_b);
        assert!(before_b < after_pass);
    }
}
