// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pool-owned render targets.
//!
//! The pool exclusively owns every target; ports and processors only hold
//! [`RenderTargetId`]s handed out by the evaluator's assignment step. A
//! processor treats its assigned target as exclusively its own between
//! `activate` and `deactivate`.

use crate::core::error::{FlowError, Result};
use indexmap::IndexMap;

/// Opaque handle to a pooled render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderTargetId(u64);

impl std::fmt::Display for RenderTargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "target_{}", self.0)
    }
}

/// A color/depth buffer pair standing in for a GPU framebuffer attachment set.
///
/// The planes are CPU-side here; the lifecycle contract (activate, attach,
/// completeness, deactivate) is what the scheduler relies on.
#[derive(Debug)]
pub struct RenderTarget {
    id: RenderTargetId,
    size: [u32; 2],
    color: Vec<u8>,
    depth: Vec<f32>,
    color_attached: bool,
    depth_attached: bool,
    active: bool,
    written: bool,
}

impl RenderTarget {
    fn new(id: RenderTargetId, size: [u32; 2]) -> Self {
        let pixels = (size[0] * size[1]) as usize;
        Self {
            id,
            size,
            color: vec![0; pixels * 4],
            depth: vec![1.0; pixels],
            color_attached: true,
            depth_attached: true,
            active: false,
            written: false,
        }
    }

    pub fn id(&self) -> RenderTargetId {
        self.id
    }

    pub fn size(&self) -> [u32; 2] {
        self.size
    }

    /// Begin exclusive write access. Fails if the target is already active
    /// or incomplete.
    pub fn activate(&mut self) -> Result<()> {
        if self.active {
            return Err(FlowError::RenderTarget(format!(
                "{} is already active",
                self.id
            )));
        }
        if !self.is_complete() {
            return Err(FlowError::RenderTarget(format!(
                "{} is incomplete (missing attachment)",
                self.id
            )));
        }
        self.active = true;
        Ok(())
    }

    /// End exclusive write access.
    pub fn deactivate(&mut self) -> Result<()> {
        if !self.active {
            return Err(FlowError::RenderTarget(format!(
                "{} is not active",
                self.id
            )));
        }
        self.active = false;
        self.written = true;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether the target has been rendered to since its last resize.
    pub fn has_content(&self) -> bool {
        self.written
    }

    pub fn attach(&mut self, color: bool, depth: bool) {
        self.color_attached = color;
        self.depth_attached = depth;
    }

    /// A target is complete when both attachments are present.
    pub fn is_complete(&self) -> bool {
        self.color_attached && self.depth_attached
    }

    /// Reallocate the planes for a new size; drops previous content.
    pub fn resize(&mut self, size: [u32; 2]) {
        if size == self.size {
            return;
        }
        debug_assert!(!self.active, "resizing an active render target");
        let pixels = (size[0] * size[1]) as usize;
        self.size = size;
        self.color = vec![0; pixels * 4];
        self.depth = vec![1.0; pixels];
        self.written = false;
    }

    /// RGBA color plane. Writable only while active.
    pub fn color_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.active, "writing to an inactive render target");
        &mut self.color
    }

    pub fn color(&self) -> &[u8] {
        &self.color
    }

    pub fn depth_mut(&mut self) -> &mut [f32] {
        debug_assert!(self.active, "writing to an inactive render target");
        &mut self.depth
    }

    pub fn depth(&self) -> &[f32] {
        &self.depth
    }

    /// Fill both planes with their clear values.
    pub fn clear(&mut self) {
        self.color.fill(0);
        self.depth.fill(1.0);
        self.written = false;
    }
}

/// Usage statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderTargetPoolStats {
    pub total_targets: usize,
    pub active_targets: usize,
}

/// Owns every render target in the system.
#[derive(Debug, Default)]
pub struct RenderTargetPool {
    targets: IndexMap<RenderTargetId, RenderTarget>,
    next_id: u64,
}

impl RenderTargetPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new target of the given size and return its handle.
    pub fn acquire(&mut self, size: [u32; 2]) -> RenderTargetId {
        let id = RenderTargetId(self.next_id);
        self.next_id += 1;
        self.targets.insert(id, RenderTarget::new(id, size));
        id
    }

    /// Destroy a target. Unknown ids are ignored.
    pub fn release(&mut self, id: RenderTargetId) {
        self.targets.shift_remove(&id);
    }

    pub fn get(&self, id: RenderTargetId) -> Option<&RenderTarget> {
        self.targets.get(&id)
    }

    pub fn get_mut(&mut self, id: RenderTargetId) -> Option<&mut RenderTarget> {
        self.targets.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn stats(&self) -> RenderTargetPoolStats {
        RenderTargetPoolStats {
            total_targets: self.targets.len(),
            active_targets: self.targets.values().filter(|t| t.is_active()).count(),
        }
    }

    /// Drop every target. Used when the evaluator detaches from a network.
    pub fn clear(&mut self) {
        self.targets.clear();
    }
}
