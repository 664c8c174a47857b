// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Box-filter volume smoothing.

use crate::core::data::Volume;
use crate::core::error::{FlowError, Result};
use crate::core::ports::{PortData, PortDescriptor, PortType};
use crate::core::processor::{ProcessContext, Processor, ProcessorDescriptor};
use crate::core::properties::{PropertyDescriptor, PropertyValue};
use std::sync::Arc;

/// Mean filter over a cubic neighborhood, radius configurable.
#[derive(Debug, Default)]
pub struct VolumeSmoothing;

impl VolumeSmoothing {
    pub const TYPE_NAME: &'static str = "VolumeSmoothing";
}

/// Box filter with clamped sampling at the volume borders.
pub fn smooth_volume(volume: &Volume, radius: u32) -> Volume {
    if radius == 0 {
        return volume.clone();
    }
    let [dx, dy, dz] = volume.dimensions;
    let r = radius as i64;
    let mut result = Vec::with_capacity(volume.num_voxels());
    for z in 0..dz as i64 {
        for y in 0..dy as i64 {
            for x in 0..dx as i64 {
                let mut sum: u64 = 0;
                let mut count: u64 = 0;
                for nz in (z - r).max(0)..=(z + r).min(dz as i64 - 1) {
                    for ny in (y - r).max(0)..=(y + r).min(dy as i64 - 1) {
                        for nx in (x - r).max(0)..=(x + r).min(dx as i64 - 1) {
                            sum += volume.voxel(nx as u32, ny as u32, nz as u32) as u64;
                            count += 1;
                        }
                    }
                }
                result.push((sum / count) as u8);
            }
        }
    }
    Volume::new(volume.dimensions, volume.spacing, result)
}

impl Processor for VolumeSmoothing {
    fn descriptor(&self) -> ProcessorDescriptor {
        ProcessorDescriptor::new(Self::TYPE_NAME, "Volume Processing")
            .with_description("Smooths a volume with a box filter")
            .with_port(PortDescriptor::inport("volume", PortType::Volume))
            .with_port(PortDescriptor::outport("smoothed", PortType::Volume))
            .with_property(PropertyDescriptor::new("radius", PropertyValue::Int(1)))
            .with_tag("volume")
            .with_tag("filter")
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let volume = ctx
            .fetch_volume("volume")
            .ok_or_else(|| FlowError::Processor("no volume on inport".into()))?;
        let radius = ctx.property_int("radius").unwrap_or(1).clamp(0, 16) as u32;

        let smoothed = smooth_volume(&volume, radius);
        ctx.write_output("smoothed", PortData::Volume(Arc::new(smoothed)))
    }
}
