// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Configuration properties and property-link evaluators.
//!
//! Properties are the configuration surface of a processor. Changing a value
//! raises the owner's invalidation level and propagates through property
//! links, so a single slider can invalidate an entire chain of processors.

use crate::core::error::{FlowError, Result};
use crate::core::invalidation::InvalidationLevel;
use serde::{Deserialize, Serialize};

/// A dynamically typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    IntVec2([i32; 2]),
    FloatVec3([f32; 3]),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric coercion: integers read as floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int_vec2(&self) -> Option<[i32; 2]> {
        match self {
            Self::IntVec2(v) => Some(*v),
            _ => None,
        }
    }
}

/// Static declaration of a property in a processor descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub id: String,
    pub label: Option<String>,
    pub default: PropertyValue,
    /// Invalidation level raised on the owner when the value changes.
    pub invalidation: InvalidationLevel,
}

impl PropertyDescriptor {
    pub fn new(id: impl Into<String>, default: PropertyValue) -> Self {
        Self {
            id: id.into(),
            label: None,
            default,
            invalidation: InvalidationLevel::InvalidResult,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_invalidation(mut self, level: InvalidationLevel) -> Self {
        self.invalidation = level;
        self
    }
}

/// A property instance with its current value.
#[derive(Debug, Clone)]
pub struct Property {
    descriptor: PropertyDescriptor,
    value: PropertyValue,
}

impl Property {
    pub(crate) fn new(descriptor: PropertyDescriptor) -> Self {
        let value = descriptor.default.clone();
        Self { descriptor, value }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &PropertyDescriptor {
        &self.descriptor
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn invalidation(&self) -> InvalidationLevel {
        self.descriptor.invalidation
    }

    pub(crate) fn set_value(&mut self, value: PropertyValue) {
        self.value = value;
    }
}

/// Address of a property: processor name plus property id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyRef {
    pub processor: String,
    pub property: String,
}

impl PropertyRef {
    pub fn new(processor: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            processor: processor.into(),
            property: property.into(),
        }
    }

    pub fn parse(address: &str) -> Result<Self> {
        let (processor, property) = address.split_once('.').ok_or_else(|| {
            FlowError::PropertyNotFound(format!(
                "invalid property address '{address}', expected 'processor.property'"
            ))
        })?;
        Ok(Self::new(processor, property))
    }
}

impl std::fmt::Display for PropertyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.processor, self.property)
    }
}

/// Transforms a source value into the value applied to a link target.
pub trait LinkEvaluator: Send + Sync {
    /// Stable identifier used for link equivalence checks and serialization.
    fn id(&self) -> String;

    fn evaluate(&self, source: &PropertyValue) -> Result<PropertyValue>;
}

/// Copies the source value unchanged. The default for new links.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityLinkEvaluator;

impl LinkEvaluator for IdentityLinkEvaluator {
    fn id(&self) -> String {
        "identity".into()
    }

    fn evaluate(&self, source: &PropertyValue) -> Result<PropertyValue> {
        Ok(source.clone())
    }
}

/// Multiplies numeric values by a fixed factor.
#[derive(Debug, Clone, Copy)]
pub struct ScaleLinkEvaluator {
    pub factor: f64,
}

impl ScaleLinkEvaluator {
    pub fn new(factor: f64) -> Self {
        Self { factor }
    }
}

impl LinkEvaluator for ScaleLinkEvaluator {
    fn id(&self) -> String {
        format!("scale:{}", self.factor)
    }

    fn evaluate(&self, source: &PropertyValue) -> Result<PropertyValue> {
        match source {
            PropertyValue::Int(v) => Ok(PropertyValue::Int((*v as f64 * self.factor) as i64)),
            PropertyValue::Float(v) => Ok(PropertyValue::Float(v * self.factor)),
            other => Err(FlowError::PropertyLink(format!(
                "scale evaluator cannot transform non-numeric value {other:?}"
            ))),
        }
    }
}

/// Reconstruct a link evaluator from its serialized id.
pub fn link_evaluator_from_id(id: &str) -> Option<Box<dyn LinkEvaluator>> {
    if id == "identity" {
        return Some(Box::new(IdentityLinkEvaluator));
    }
    if let Some(factor) = id.strip_prefix("scale:") {
        if let Ok(factor) = factor.parse::<f64>() {
            return Some(Box::new(ScaleLinkEvaluator::new(factor)));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_coercion() {
        assert_eq!(PropertyValue::Int(3).as_float(), Some(3.0));
        assert_eq!(PropertyValue::Float(0.5).as_float(), Some(0.5));
        assert_eq!(PropertyValue::Bool(true).as_float(), None);
    }

    #[test]
    fn test_property_defaults() {
        let p = Property::new(
            PropertyDescriptor::new("radius", PropertyValue::Int(1))
                .with_invalidation(InvalidationLevel::InvalidParameters),
        );
        assert_eq!(p.value(), &PropertyValue::Int(1));
        assert_eq!(p.invalidation(), InvalidationLevel::InvalidParameters);
    }

    #[test]
    fn test_identity_evaluator() {
        let eval = IdentityLinkEvaluator;
        let v = PropertyValue::Float(2.5);
        assert_eq!(eval.evaluate(&v).unwrap(), v);
    }

    #[test]
    fn test_scale_evaluator() {
        let eval = ScaleLinkEvaluator::new(2.0);
        assert_eq!(
            eval.evaluate(&PropertyValue::Float(1.5)).unwrap(),
            PropertyValue::Float(3.0)
        );
        assert_eq!(
            eval.evaluate(&PropertyValue::Int(4)).unwrap(),
            PropertyValue::Int(8)
        );
        assert!(eval.evaluate(&PropertyValue::Bool(true)).is_err());
    }

    #[test]
    fn test_evaluator_from_id() {
        assert_eq!(link_evaluator_from_id("identity").unwrap().id(), "identity");
        assert_eq!(link_evaluator_from_id("scale:2.5").unwrap().id(), "scale:2.5");
        assert!(link_evaluator_from_id("unknown").is_none());
    }

    #[test]
    fn test_value_serde_untagged() {
        let v: PropertyValue = serde_json::from_str("3").unwrap();
        assert_eq!(v, PropertyValue::Int(3));
        let v: PropertyValue = serde_json::from_str("[4, 8]").unwrap();
        assert_eq!(v, PropertyValue::IntVec2([4, 8]));
        let v: PropertyValue = serde_json::from_str("\"ramp\"").unwrap();
        assert_eq!(v, PropertyValue::String("ramp".into()));
    }
}
