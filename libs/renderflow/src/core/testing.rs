// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Configurable processors for unit tests.

use crate::core::error::{FlowError, Result};
use crate::core::ports::{PortData, PortDescriptor, PortType};
use crate::core::processor::{InitContext, ProcessContext, Processor, ProcessorDescriptor};
use crate::core::properties::PropertyDescriptor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type Behavior = Box<dyn FnMut(&mut ProcessContext<'_>) -> Result<()> + Send>;

/// A processor whose shape and behavior are assembled per test.
///
/// Counts lifecycle invocations through shared atomics, and exposes its
/// descriptor behind a shared lock so tests can grow ports after the
/// processor moved into a network (the dynamic-ports scenario).
pub(crate) struct TestProcessor {
    descriptor: Arc<parking_lot::RwLock<ProcessorDescriptor>>,
    pub process_count: Arc<AtomicUsize>,
    pub init_count: Arc<AtomicUsize>,
    pub deinit_count: Arc<AtomicUsize>,
    behavior: Option<Behavior>,
    fail_process: Arc<AtomicBool>,
    fail_initialize: bool,
}

impl TestProcessor {
    pub fn new(type_name: &str) -> Self {
        Self {
            descriptor: Arc::new(parking_lot::RwLock::new(ProcessorDescriptor::new(
                type_name, "Testing",
            ))),
            process_count: Arc::new(AtomicUsize::new(0)),
            init_count: Arc::new(AtomicUsize::new(0)),
            deinit_count: Arc::new(AtomicUsize::new(0)),
            behavior: None,
            fail_process: Arc::new(AtomicBool::new(false)),
            fail_initialize: false,
        }
    }

    /// Source -> sink convenience: one data outport named `out`.
    pub fn source(type_name: &str) -> Self {
        let mut p = Self::new(type_name).with_port(PortDescriptor::outport("out", PortType::Data));
        p.behavior = Some(Box::new(|ctx| {
            ctx.write_output("out", PortData::Data(serde_json::json!(1)))
        }));
        p
    }

    /// One data inport named `in`, one data outport named `out`, forwarding.
    pub fn filter(type_name: &str) -> Self {
        let mut p = Self::new(type_name)
            .with_port(PortDescriptor::inport("in", PortType::Data))
            .with_port(PortDescriptor::outport("out", PortType::Data));
        p.behavior = Some(Box::new(|ctx| {
            let input = ctx.fetch_data("in").unwrap_or(serde_json::json!(null));
            ctx.write_output("out", PortData::Data(input))
        }));
        p
    }

    /// End processor with a single data inport named `in`.
    pub fn sink(type_name: &str) -> Self {
        Self::new(type_name).with_port(PortDescriptor::inport("in", PortType::Data))
    }

    pub fn with_port(self, port: PortDescriptor) -> Self {
        self.descriptor.write().ports.push(port);
        self
    }

    pub fn with_property(self, property: PropertyDescriptor) -> Self {
        self.descriptor.write().properties.push(property);
        self
    }

    pub fn as_end_processor(self) -> Self {
        self.descriptor.write().end_processor = true;
        self
    }

    /// Shared descriptor handle: mutate it to simulate a processor growing
    /// or dropping ports at runtime.
    pub fn descriptor_handle(&self) -> Arc<parking_lot::RwLock<ProcessorDescriptor>> {
        Arc::clone(&self.descriptor)
    }

    pub fn on_process(
        mut self,
        behavior: impl FnMut(&mut ProcessContext<'_>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.behavior = Some(Box::new(behavior));
        self
    }

    pub fn failing_process(self) -> Self {
        self.fail_process.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Toggle process failures after the processor moved into a network.
    pub fn failure_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_process)
    }

    /// Shared counters to keep after the processor moves into a network.
    pub fn counters(&self) -> (Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (
            Arc::clone(&self.process_count),
            Arc::clone(&self.init_count),
            Arc::clone(&self.deinit_count),
        )
    }
}

impl Processor for TestProcessor {
    fn descriptor(&self) -> ProcessorDescriptor {
        self.descriptor.read().clone()
    }

    fn initialize(&mut self, _ctx: &mut InitContext<'_>) -> Result<()> {
        if self.fail_initialize {
            return Err(FlowError::Processor("induced initialize failure".into()));
        }
        self.init_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deinitialize(&mut self, _ctx: &mut InitContext<'_>) -> Result<()> {
        self.deinit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        self.process_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_process.load(Ordering::SeqCst) {
            return Err(FlowError::Processor("induced process failure".into()));
        }
        if let Some(behavior) = &mut self.behavior {
            behavior(ctx)?;
        }
        Ok(())
    }
}
