//! Surfaces, framebuffers and clear values.

use crate::format::Format;
use crate::lrz::LrzDirection;
use kiln_core::alloc::{SlotKey, SlotMap};

pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// Handle to a surface in a [`SurfaceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceId(pub(crate) SlotKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleCount {
    X1,
    X2,
    X4,
}

impl SampleCount {
    pub fn as_u32(self) -> u32 {
        match self {
            SampleCount::X1 => 1,
            SampleCount::X2 => 2,
            SampleCount::X4 => 4,
        }
    }
}

/// Sidecar metadata for a depth surface's low-resolution depth
/// accelerator buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LrzState {
    pub valid: bool,
    /// Last comparison direction that was allowed to write the buffer.
    pub direction: LrzDirection,
}

impl Default for LrzState {
    fn default() -> Self {
        Self {
            valid: false,
            direction: LrzDirection::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Surface {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub layers: u32,
    pub samples: SampleCount,
    pub lrz: Option<LrzState>,
}

impl Surface {
    pub fn new_2d(format: Format, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            mip_levels: 1,
            layers: 1,
            samples: SampleCount::X1,
            lrz: None,
        }
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        debug_assert!(layers >= 1);
        self.layers = layers;
        self
    }

    /// Attaches an (initially invalid) depth accelerator buffer.
    pub fn with_lrz(mut self) -> Self {
        debug_assert!(self.format.has_depth());
        self.lrz = Some(LrzState::default());
        self
    }

    pub fn mip_extent(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }
}

/// Owning registry of surfaces; ids are generational, so a stale id after
/// destruction panics rather than aliasing a new surface.
pub struct SurfaceTable {
    map: SlotMap<Surface>,
}

impl SurfaceTable {
    pub const fn new() -> Self {
        Self {
            map: SlotMap::new(),
        }
    }

    pub fn insert(&mut self, surface: Surface) -> SurfaceId {
        SurfaceId(self.map.insert(surface))
    }

    pub fn get(&self, id: SurfaceId) -> &Surface {
        self.map.get(id.0)
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> &mut Surface {
        self.map.get_mut(id.0)
    }

    pub fn remove(&mut self, id: SurfaceId) -> Surface {
        self.map.remove(id.0)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for SurfaceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A framebuffer attachment plus its on-chip placement. Placement is
/// assigned by the external tile planner; `None` means the attachment is
/// only ever rendered directly to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub surface: SurfaceId,
    pub gmem_offset: Option<u32>,
}

bitflags::bitflags! {
    /// Selects framebuffer attachments for restore/clear/resolve masks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttachmentMask: u16 {
        const COLOR0 = 1 << 0;
        const COLOR1 = 1 << 1;
        const COLOR2 = 1 << 2;
        const COLOR3 = 1 << 3;
        const COLOR4 = 1 << 4;
        const COLOR5 = 1 << 5;
        const COLOR6 = 1 << 6;
        const COLOR7 = 1 << 7;
        const DEPTH = 1 << 8;
        const STENCIL = 1 << 9;
    }
}

impl AttachmentMask {
    pub fn color(index: usize) -> Self {
        debug_assert!(index < MAX_COLOR_ATTACHMENTS);
        Self::from_bits_truncate(1 << index)
    }

    pub fn all_colors(count: usize) -> Self {
        Self::from_bits_truncate(((1u32 << count) - 1) as u16)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Framebuffer {
    pub colors: Vec<Attachment>,
    pub depth: Option<Attachment>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

impl Framebuffer {
    /// Mask covering every attachment present in this framebuffer.
    pub fn present_mask(&self, surfaces: &SurfaceTable) -> AttachmentMask {
        let mut mask = AttachmentMask::all_colors(self.colors.len());
        if let Some(depth) = &self.depth {
            let format = surfaces.get(depth.surface).format;
            if format.has_depth() {
                mask |= AttachmentMask::DEPTH;
            }
            if format.has_stencil() {
                mask |= AttachmentMask::STENCIL;
            }
        }
        mask
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColorClear {
    Float([f32; 4]),
    Uint([u32; 4]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color(ColorClear),
    DepthStencil { depth: f32, stencil: u8 },
}

impl ClearValue {
    /// Raw dwords programmed into the clear registers.
    pub fn packed(&self) -> [u32; 4] {
        match *self {
            ClearValue::Color(ColorClear::Float(v)) => bytemuck::cast(v),
            ClearValue::Color(ColorClear::Uint(v)) => v,
            ClearValue::DepthStencil { depth, stencil } => {
                [depth.to_bits(), stencil as u32, 0, 0]
            }
        }
    }
}
