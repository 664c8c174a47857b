//! Processor type registry.
//!
//! Maps type names to factory closures so networks can be reconstructed
//! from declarative definitions. Registration is explicit; there is no
//! ambient global registry.

use crate::core::error::{FlowError, Result};
use crate::core::processor::{Processor, ProcessorDescriptor};
use indexmap::IndexMap;
use std::sync::Arc;

type ProcessorFactory = Arc<dyn Fn() -> Box<dyn Processor> + Send + Sync>;

struct Registration {
    descriptor: ProcessorDescriptor,
    factory: ProcessorFactory,
}

/// Type-name keyed registry of processor factories.
#[derive(Default)]
pub struct ProcessorRegistry {
    registrations: IndexMap<String, Registration>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a default-constructible processor type.
    pub fn register<P>(&mut self) -> Result<()>
    where
        P: Processor + Default + 'static,
    {
        self.register_factory(|| Box::new(P::default()))
    }

    /// Register an arbitrary factory; the type name is read from a probe
    /// instance's descriptor. Duplicate registration is an error.
    pub fn register_factory(
        &mut self,
        factory: impl Fn() -> Box<dyn Processor> + Send + Sync + 'static,
    ) -> Result<()> {
        let descriptor = factory().descriptor();
        let name = descriptor.type_name.clone();
        if self.registrations.contains_key(&name) {
            return Err(FlowError::Configuration(format!(
                "processor type '{name}' is already registered"
            )));
        }
        self.registrations.insert(
            name,
            Registration {
                descriptor,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.registrations.contains_key(type_name)
    }

    /// Instantiate a processor by type name.
    pub fn create(&self, type_name: &str) -> Result<Box<dyn Processor>> {
        let registration = self.registrations.get(type_name).ok_or_else(|| {
            FlowError::Configuration(format!("unknown processor type '{type_name}'"))
        })?;
        Ok((registration.factory)())
    }

    pub fn descriptor(&self, type_name: &str) -> Option<&ProcessorDescriptor> {
        self.registrations.get(type_name).map(|r| &r.descriptor)
    }

    pub fn descriptors(&self) -> Vec<&ProcessorDescriptor> {
        self.registrations.values().map(|r| &r.descriptor).collect()
    }

    pub fn type_names(&self) -> Vec<&str> {
        self.registrations.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

/// Registry pre-loaded with the processors shipped in this crate.
pub fn default_registry() -> ProcessorRegistry {
    use crate::core::processors::{Canvas, MipRaycaster, VolumeSmoothing, VolumeSource};

    let mut registry = ProcessorRegistry::new();
    registry
        .register::<VolumeSource>()
        .expect("empty registry cannot hold duplicates");
    registry
        .register::<VolumeSmoothing>()
        .expect("empty registry cannot hold duplicates");
    registry
        .register::<MipRaycaster>()
        .expect("empty registry cannot hold duplicates");
    registry
        .register::<Canvas>()
        .expect("empty registry cannot hold duplicates");
    registry
}
