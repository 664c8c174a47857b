// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! On-screen canvas stand-in: the end processor anchoring evaluation.

use crate::core::error::{FlowError, Result};
use crate::core::ports::{PortDescriptor, PortType};
use crate::core::processor::{ProcessContext, Processor, ProcessorDescriptor};
use parking_lot::RwLock;
use std::sync::Arc;

/// The frame most recently presented by a [`Canvas`].
#[derive(Debug, Clone, PartialEq)]
pub struct PresentedFrame {
    pub size: [u32; 2],
    /// RGBA pixels, row-major.
    pub pixels: Vec<u8>,
}

/// Terminal render sink. Its inport is the render-size origin of the
/// pipeline feeding it; the last presented frame stays readable through the
/// handle returned by [`Canvas::frame_handle`].
#[derive(Debug, Default)]
pub struct Canvas {
    frame: Arc<RwLock<Option<PresentedFrame>>>,
}

impl Canvas {
    pub const TYPE_NAME: &'static str = "Canvas";

    pub fn new() -> Self {
        Self::default()
    }

    /// Clone the shared frame slot before handing the canvas to a network.
    pub fn frame_handle(&self) -> Arc<RwLock<Option<PresentedFrame>>> {
        Arc::clone(&self.frame)
    }
}

impl Processor for Canvas {
    fn descriptor(&self) -> ProcessorDescriptor {
        ProcessorDescriptor::new(Self::TYPE_NAME, "Output")
            .with_description("Presents the incoming image")
            .with_port(PortDescriptor::inport("image", PortType::Render).size_origin())
            .end_processor()
            .with_tag("output")
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let target_id = ctx
            .fetch_render("image")
            .ok_or_else(|| FlowError::Processor("no rendered image on inport".into()))?;
        let target = ctx
            .target(target_id)
            .ok_or_else(|| FlowError::RenderTarget(format!("{target_id} is gone")))?;

        *self.frame.write() = Some(PresentedFrame {
            size: target.size(),
            pixels: target.color().to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canvas_is_end_processor() {
        let canvas = Canvas::new();
        assert!(canvas.descriptor().is_end_processor());
    }

    #[test]
    fn test_frame_handle_shares_slot() {
        let canvas = Canvas::new();
        let handle = canvas.frame_handle();
        assert!(handle.read().is_none());
        *canvas.frame.write() = Some(PresentedFrame {
            size: [1, 1],
            pixels: vec![0, 0, 0, 255],
        });
        assert!(handle.read().is_some());
    }
}
