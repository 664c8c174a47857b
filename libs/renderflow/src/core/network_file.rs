// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Declarative network files (JSON/YAML).
//!
//! A [`NetworkDefinition`] captures a network's processors, property
//! overrides, connections and links by name. Instantiating one reconstructs
//! the network through a [`ProcessorRegistry`] without replaying the
//! incremental mutation API; an evaluator assigned a freshly loaded network
//! re-derives everything on attach.
//!
//! ```json
//! {
//!   "version": 3,
//!   "processors": [
//!     { "name": "source", "type": "VolumeSource", "properties": { "size": 64 } },
//!     { "name": "canvas", "type": "Canvas" }
//!   ],
//!   "connections": [
//!     { "from": "source.volume", "to": "canvas.image" }
//!   ]
//! }
//! ```

use crate::core::error::{FlowError, Result};
use crate::core::network::ProcessorNetwork;
use crate::core::ports::PortRef;
use crate::core::properties::{link_evaluator_from_id, PropertyRef, PropertyValue};
use crate::core::registry::ProcessorRegistry;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bump on incompatible changes to the file format.
pub const NETWORK_FORMAT_VERSION: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Property values overriding the descriptor defaults.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, PropertyValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEntry {
    /// Outport address `"processor.port"`.
    pub from: String,
    /// Inport address `"processor.port"`.
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyLinkEntry {
    pub from: String,
    pub to: String,
    #[serde(default = "identity_evaluator")]
    pub evaluator: String,
}

fn identity_evaluator() -> String {
    "identity".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeLinkEntry {
    pub origin: String,
    pub receiver: String,
}

/// Serializable network description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub processors: Vec<ProcessorEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<ConnectionEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub property_links: Vec<PropertyLinkEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub size_links: Vec<SizeLinkEntry>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub metadata: IndexMap<String, String>,
}

impl NetworkDefinition {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| FlowError::NetworkFile(format!("invalid JSON network definition: {e}")))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FlowError::NetworkFile(format!("invalid YAML network definition: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FlowError::NetworkFile(format!("network serialization failed: {e}")))
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| FlowError::NetworkFile(format!("network serialization failed: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => self.to_yaml_string()?,
            _ => self.to_json_string()?,
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reconstruct a network through the registry. Fails on unknown
    /// processor types, duplicate names, illegal connections or unknown link
    /// evaluators, leaving no half-built state with the caller.
    pub fn instantiate(&self, registry: &ProcessorRegistry) -> Result<ProcessorNetwork> {
        if self.version > NETWORK_FORMAT_VERSION {
            return Err(FlowError::NetworkFile(format!(
                "network format version {} is newer than supported version {}",
                self.version, NETWORK_FORMAT_VERSION
            )));
        }

        let mut network = ProcessorNetwork::new();
        for entry in &self.processors {
            let processor = registry.create(&entry.type_name)?;
            let assigned = network.add_processor_named(processor, Some(&entry.name))?;
            if assigned != entry.name {
                return Err(FlowError::NetworkFile(format!(
                    "duplicate processor name '{}'",
                    entry.name
                )));
            }
            for (id, value) in &entry.properties {
                network.set_property(&assigned, id, value.clone())?;
            }
        }

        for connection in &self.connections {
            let from = PortRef::parse(&connection.from)?;
            let to = PortRef::parse(&connection.to)?;
            if !network.connect_ports(&from, &to) {
                return Err(FlowError::NetworkFile(format!(
                    "illegal connection {} -> {}",
                    connection.from, connection.to
                )));
            }
        }

        for link in &self.property_links {
            let evaluator = link_evaluator_from_id(&link.evaluator).ok_or_else(|| {
                FlowError::NetworkFile(format!("unknown link evaluator '{}'", link.evaluator))
            })?;
            network.create_property_link(
                &PropertyRef::parse(&link.from)?,
                &PropertyRef::parse(&link.to)?,
                Some(evaluator),
            )?;
        }

        for link in &self.size_links {
            network.create_render_size_link(
                &PortRef::parse(&link.origin)?,
                &PortRef::parse(&link.receiver)?,
            )?;
        }

        *network.metadata_mut() = self.metadata.clone();
        Ok(network)
    }
}

impl ProcessorNetwork {
    /// Snapshot this network into a serializable definition.
    pub fn to_definition(&self) -> NetworkDefinition {
        let processors = self
            .nodes()
            .map(|node| ProcessorEntry {
                name: node.name().to_string(),
                type_name: node.type_name().to_string(),
                properties: node
                    .properties()
                    .map(|p| (p.id().to_string(), p.value().clone()))
                    .collect(),
            })
            .collect();

        let connections = self
            .connections()
            .into_iter()
            .map(|(from, to)| ConnectionEntry {
                from: from.to_string(),
                to: to.to_string(),
            })
            .collect();

        let property_links = self
            .property_links()
            .iter()
            .map(|link| PropertyLinkEntry {
                from: link.source.to_string(),
                to: link.target.to_string(),
                evaluator: link.evaluator.id(),
            })
            .collect();

        let size_links = self
            .size_links()
            .iter()
            .map(|link| SizeLinkEntry {
                origin: link.origin.to_string(),
                receiver: link.receiver.to_string(),
            })
            .collect();

        NetworkDefinition {
            version: NETWORK_FORMAT_VERSION,
            name: None,
            processors,
            connections,
            property_links,
            size_links,
            metadata: self.metadata().clone(),
        }
    }
}
