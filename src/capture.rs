// Draw capture
//
// The software backend does not run shader programs. Instead it records each
// draw and dispatch together with the bytes of every buffer reachable
// through the bound descriptor sets, as they were at execution time.

use crate::descriptor::BindingKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawKind {
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

/// Contents of one buffer descriptor at the time of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedBuffer {
    pub slot: u32,
    pub binding: u32,
    pub array_element: u32,
    pub kind: BindingKind,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedSet {
    pub index: u32,
    pub buffers: Vec<CapturedBuffer>,
}

impl CapturedSet {
    /// Bytes behind `binding` (first array element).
    pub fn buffer_at(&self, binding: u32) -> Option<&[u8]> {
        self.buffers
            .iter()
            .find(|b| b.binding == binding && b.array_element == 0)
            .map(|b| b.bytes.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawCall {
    pub kind: DrawKind,
    /// Subpass the draw ran in; `None` for dispatches.
    pub subpass: Option<u32>,
    pub sets: Vec<CapturedSet>,
}

impl DrawCall {
    pub fn set(&self, index: u32) -> Option<&CapturedSet> {
        self.sets.iter().find(|s| s.index == index)
    }
}

/// Everything captured since the previous `take_draw_capture`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrawCapture {
    pub calls: Vec<DrawCall>,
}

impl DrawCapture {
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn draws(&self) -> impl Iterator<Item = &DrawCall> {
        self.calls.iter().filter(|c| !matches!(c.kind, DrawKind::Dispatch { .. }))
    }

    pub fn dispatches(&self) -> impl Iterator<Item = &DrawCall> {
        self.calls.iter().filter(|c| matches!(c.kind, DrawKind::Dispatch { .. }))
    }
}
