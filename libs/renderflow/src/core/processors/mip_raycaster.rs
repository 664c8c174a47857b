// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Maximum-intensity-projection raycaster.

use crate::core::data::Volume;
use crate::core::error::{FlowError, Result};
use crate::core::ports::{PortDescriptor, PortType};
use crate::core::processor::{ProcessContext, Processor, ProcessorDescriptor};
use crate::core::properties::{PropertyDescriptor, PropertyValue};

/// Orthographic MIP along the volume's z axis into the assigned render
/// target. The private port exercises an internal scratch target the
/// evaluator must provision like any other.
#[derive(Debug, Default)]
pub struct MipRaycaster;

impl MipRaycaster {
    pub const TYPE_NAME: &'static str = "MipRaycaster";
}

/// Project the maximum voxel intensity along z for a `width` x `height`
/// image plane, returning one grayscale byte per pixel.
pub fn project_mip(volume: &Volume, width: u32, height: u32, sampling_rate: f32) -> Vec<u8> {
    let [dx, dy, dz] = volume.dimensions;
    let step = (1.0 / sampling_rate.max(0.01)).round().max(1.0) as u32;
    let mut image = Vec::with_capacity((width * height) as usize);
    for py in 0..height {
        for px in 0..width {
            let vx = (px * dx / width.max(1)).min(dx - 1);
            let vy = (py * dy / height.max(1)).min(dy - 1);
            let mut max = 0u8;
            let mut z = 0;
            while z < dz {
                max = max.max(volume.voxel(vx, vy, z));
                z += step;
            }
            image.push(max);
        }
    }
    image
}

impl Processor for MipRaycaster {
    fn descriptor(&self) -> ProcessorDescriptor {
        ProcessorDescriptor::new(Self::TYPE_NAME, "Raycasting")
            .with_description("Maximum intensity projection along the z axis")
            .with_port(PortDescriptor::inport("volume", PortType::Volume))
            .with_port(PortDescriptor::outport("image", PortType::Render).size_receiver())
            .with_port(PortDescriptor::outport("scratch", PortType::Render).private_render())
            .with_property(
                PropertyDescriptor::new("sampling_rate", PropertyValue::Float(1.0))
                    .with_label("Sampling rate"),
            )
            .with_tag("raycasting")
            .with_tag("render")
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let volume = ctx
            .fetch_volume("volume")
            .ok_or_else(|| FlowError::Processor("no volume on inport".into()))?;
        let sampling_rate = ctx.property_float("sampling_rate").unwrap_or(1.0) as f32;

        ctx.activate_target("image")?;
        let target = ctx.target_mut("image")?;
        let [width, height] = target.size();
        let image = project_mip(&volume, width, height, sampling_rate);
        {
            let color = target.color_mut();
            for (i, &intensity) in image.iter().enumerate() {
                let o = i * 4;
                color[o] = intensity;
                color[o + 1] = intensity;
                color[o + 2] = intensity;
                color[o + 3] = 255;
            }
        }
        ctx.deactivate_target("image")?;

        ctx.write_render_output("image")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::processors::volume_source::generate_volume;

    #[test]
    fn test_mip_picks_brightest_slice() {
        // ramp volume: brightest slice is the last along z
        let volume = generate_volume(8, "ramp");
        let image = project_mip(&volume, 4, 4, 1.0);
        let expected = volume.voxel(0, 0, 7);
        assert!(image.iter().all(|&v| v == expected));
    }

    #[test]
    fn test_sphere_projection_brighter_in_center() {
        let volume = generate_volume(16, "sphere");
        let image = project_mip(&volume, 16, 16, 1.0);
        let center = image[8 * 16 + 8];
        let corner = image[0];
        assert!(center > corner);
    }

    #[test]
    fn test_low_sampling_rate_still_terminates() {
        let volume = generate_volume(8, "ramp");
        let image = project_mip(&volume, 2, 2, 0.25);
        assert_eq!(image.len(), 4);
    }
}
