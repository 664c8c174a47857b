// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Synthetic volume source.

use crate::core::data::Volume;
use crate::core::error::Result;
use crate::core::ports::{PortData, PortDescriptor, PortType};
use crate::core::processor::{ProcessContext, Processor, ProcessorDescriptor};
use crate::core::properties::{PropertyDescriptor, PropertyValue};
use std::sync::Arc;

/// Generates a cubic volume from its properties. Stands in for the volume
/// I/O layer, which is outside the core.
#[derive(Debug, Default)]
pub struct VolumeSource;

impl VolumeSource {
    pub const TYPE_NAME: &'static str = "VolumeSource";
}

/// Fill a cubic volume with the named intensity pattern.
pub fn generate_volume(side: u32, pattern: &str) -> Volume {
    let side = side.max(1);
    let mut voxels = Vec::with_capacity((side * side * side) as usize);
    let center = (side as f32 - 1.0) / 2.0;
    let radius = side as f32 / 2.0;
    for z in 0..side {
        for y in 0..side {
            for x in 0..side {
                let value = match pattern {
                    "sphere" => {
                        let dx = x as f32 - center;
                        let dy = y as f32 - center;
                        let dz = z as f32 - center;
                        let dist = (dx * dx + dy * dy + dz * dz).sqrt();
                        let t = (1.0 - dist / radius).clamp(0.0, 1.0);
                        (t * 255.0) as u8
                    }
                    // default: intensity ramp along z
                    _ => ((z as f32 / side.max(2) as f32) * 255.0) as u8,
                };
                voxels.push(value);
            }
        }
    }
    Volume::with_uniform_spacing([side, side, side], voxels)
}

impl Processor for VolumeSource {
    fn descriptor(&self) -> ProcessorDescriptor {
        ProcessorDescriptor::new(Self::TYPE_NAME, "Data Source")
            .with_description("Generates a synthetic scalar volume")
            .with_port(PortDescriptor::outport("volume", PortType::Volume))
            .with_property(PropertyDescriptor::new("size", PropertyValue::Int(32)))
            .with_property(PropertyDescriptor::new(
                "pattern",
                PropertyValue::String("ramp".into()),
            ))
            .with_tag("volume")
            .with_tag("source")
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let side = ctx.property_int("size").unwrap_or(32).clamp(1, 512) as u32;
        let pattern = ctx
            .property("pattern")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "ramp".into());

        let volume = generate_volume(side, &pattern);
        ctx.write_output("volume", PortData::Volume(Arc::new(volume)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramp_increases_along_z() {
        let volume = generate_volume(8, "ramp");
        assert!(volume.voxel(0, 0, 0) < volume.voxel(0, 0, 7));
        assert_eq!(volume.voxel(3, 5, 2), volume.voxel(6, 1, 2));
    }

    #[test]
    fn test_sphere_peaks_at_center() {
        let volume = generate_volume(9, "sphere");
        let center = volume.voxel(4, 4, 4);
        let corner = volume.voxel(0, 0, 0);
        assert!(center > corner);
        assert_eq!(corner, 0);
    }

    #[test]
    fn test_minimum_side_clamped() {
        let volume = generate_volume(0, "ramp");
        assert_eq!(volume.dimensions, [1, 1, 1]);
    }
}
