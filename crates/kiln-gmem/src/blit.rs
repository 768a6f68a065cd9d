//! Blit dispatch.
//!
//! Copies, clears and fills are routed to one of three strategies:
//! the 2D copy engine (fast, but picky about formats and regions), a
//! raw-memory path that drives the same engine over linear runs, and a
//! shader-based fallback that handles everything the engine rejects.
//! Requests the engine cannot take as-is are rewritten (format
//! reinterpretation, plane splits) and retried before falling back.

use std::sync::Arc;

use crate::format::{Aspect, Format, copy_format};
use crate::packet::{GpuEvent, Packet};
use crate::ring::CmdRing;
use crate::surface::{ClearValue, SurfaceId, SurfaceTable};
use kiln_core::geometry::Rect;
use kiln_core::profiling::profile_function;

/// Longest run the engine copies in one operation, in texels.
pub const MAX_BLIT_TEXELS: u32 = 0x4000;

/// Raw-memory operations address 64-byte-aligned bases; residue is
/// carried as an x offset in texels.
const BASE_ALIGN: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

/// One side of an engine operation.
#[derive(Debug, Clone, PartialEq)]
pub enum BlitImage {
    Surface {
        id: SurfaceId,
        mip: u32,
        layer: u32,
        aspect: Aspect,
    },
    /// On-chip tile memory at an attachment's offset.
    Gmem { offset: u32 },
    /// The framebuffer attachment bound at replay time; resolves to tile
    /// memory or system memory depending on the executing pass.
    Attachment { index: u8, aspect: Aspect },
    /// Raw memory run, 64-byte-aligned base.
    Buffer { base: u64 },
    /// Inline payload staged by the generator.
    Staging(Arc<[u32]>),
    /// A depth surface's accelerator sidecar.
    Lrz { surface: SurfaceId },
}

/// A 2D-engine operation. `src` of `None` with a `clear` value is a
/// solid fill.
#[derive(Debug, Clone, PartialEq)]
pub struct Blit2dOp {
    pub src: Option<BlitImage>,
    pub dst: BlitImage,
    pub src_rect: Rect<u32>,
    pub dst_rect: Rect<u32>,
    pub src_format: Format,
    pub dst_format: Format,
    pub clear: Option<[u32; 4]>,
    pub filter: Filter,
}

/// Shader-path operation: slower, but takes anything.
#[derive(Debug, Clone, PartialEq)]
pub struct Blit3dOp {
    pub src: Option<BlitImage>,
    pub dst: BlitImage,
    pub src_rect: Rect<u32>,
    pub dst_rect: Rect<u32>,
    pub format: Format,
    pub clear: Option<[u32; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceRegion {
    pub surface: SurfaceId,
    pub mip: u32,
    pub layer: u32,
    pub layer_count: u32,
    pub aspect: Aspect,
    pub rect: Rect<u32>,
}

impl SurfaceRegion {
    pub fn full(surface: SurfaceId, width: u32, height: u32) -> Self {
        Self {
            surface,
            mip: 0,
            layer: 0,
            layer_count: 1,
            aspect: Aspect::Color,
            rect: Rect::new(0, 0, width, height),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlitRequest {
    CopySurface {
        src: SurfaceRegion,
        dst: SurfaceRegion,
        filter: Filter,
    },
    ClearSurface {
        dst: SurfaceRegion,
        value: ClearValue,
    },
    CopyBuffer {
        src: u64,
        dst: u64,
        size: u64,
    },
    FillBuffer {
        dst: u64,
        size: u64,
        value: u32,
    },
    UpdateBuffer {
        dst: u64,
        data: Vec<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlitStrategy {
    /// Engine handles the request natively.
    Texture2d,
    /// Linear-run path with base-alignment chunking.
    Buffer,
    /// Formats must be rewritten before the engine can take it.
    RewriteRetry,
}

/// Why the 2D path refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlitRejection {
    SampleCount,
    /// Channel layouts disagree on the copied subset.
    ChannelLayout,
    /// Scaling across array layers.
    VolumeScaling,
    Unrenderable,
}

/// Surfaces a sequence of blits touched, for hazard tracking.
#[derive(Debug, Default)]
pub struct BlitAccess {
    pub reads: Vec<SurfaceId>,
    pub writes: Vec<SurfaceId>,
}

pub fn classify(req: &BlitRequest, surfaces: &SurfaceTable) -> BlitStrategy {
    match req {
        BlitRequest::CopyBuffer { .. }
        | BlitRequest::FillBuffer { .. }
        | BlitRequest::UpdateBuffer { .. } => BlitStrategy::Buffer,
        BlitRequest::ClearSurface { dst, .. } => {
            let format = surfaces.get(dst.surface).format;
            if needs_rewrite(format, dst.aspect) {
                BlitStrategy::RewriteRetry
            } else {
                BlitStrategy::Texture2d
            }
        }
        BlitRequest::CopySurface { src, dst, .. } => {
            let sf = surfaces.get(src.surface).format;
            let df = surfaces.get(dst.surface).format;
            if needs_rewrite(sf, src.aspect) || needs_rewrite(df, dst.aspect) {
                BlitStrategy::RewriteRetry
            } else {
                BlitStrategy::Texture2d
            }
        }
    }
}

fn needs_rewrite(format: Format, aspect: Aspect) -> bool {
    format.is_compressed()
        || format.is_snorm()
        || aspect == Aspect::DepthStencil
        || copy_format(format, aspect, false) != format
}

/// Feasibility of the 2D path for a (possibly rewritten) surface copy.
fn can_blit_2d(
    surfaces: &SurfaceTable,
    src: &SurfaceRegion,
    dst: &SurfaceRegion,
    src_format: Format,
    dst_format: Format,
) -> Result<(), BlitRejection> {
    let ss = surfaces.get(src.surface);
    let ds = surfaces.get(dst.surface);
    if ss.samples != ds.samples {
        return Err(BlitRejection::SampleCount);
    }
    if src.layer_count != dst.layer_count {
        return Err(BlitRejection::VolumeScaling);
    }
    if !src_format.copy_compatible(dst_format) {
        return Err(BlitRejection::ChannelLayout);
    }
    if !src_format.renderable_2d() || !dst_format.renderable_2d() {
        return Err(BlitRejection::Unrenderable);
    }
    Ok(())
}

fn assert_in_bounds(surfaces: &SurfaceTable, region: &SurfaceRegion) {
    let surface = surfaces.get(region.surface);
    let (w, h) = surface.mip_extent(region.mip);
    let extent = Rect::new(0, 0, w, h);
    assert!(
        extent.contains(&region.rect),
        "blit region out of bounds at mip {}",
        region.mip
    );
    assert!(region.layer + region.layer_count <= surface.layers);
}

/// Scales a pixel rect to block units for a compressed-format rewrite.
fn rect_to_blocks(rect: &Rect<u32>, format: Format) -> Rect<u32> {
    let info = format.info();
    if info.block_width == 1 {
        return *rect;
    }
    Rect::new(
        rect.x / info.block_width,
        rect.y / info.block_height,
        rect.width.div_ceil(info.block_width),
        rect.height.div_ceil(info.block_height),
    )
}

pub struct BlitDispatcher<'a> {
    pub surfaces: &'a SurfaceTable,
    /// Inside a tile pass the caches already belong to the pass and the
    /// direct-access bracket must not be emitted.
    pub in_pass: bool,
}

impl BlitDispatcher<'_> {
    pub fn dispatch(&self, req: BlitRequest, ring: &mut CmdRing, access: &mut BlitAccess) {
        profile_function!();
        self.begin_direct(ring);
        match req {
            BlitRequest::CopySurface { src, dst, filter } => {
                self.copy_surface(src, dst, filter, ring, access);
            }
            BlitRequest::ClearSurface { dst, value } => {
                self.clear_surface(dst, value, ring, access);
            }
            BlitRequest::CopyBuffer { src, dst, size } => {
                self.copy_buffer(src, dst, size, ring);
            }
            BlitRequest::FillBuffer { dst, size, value } => {
                self.fill_buffer(dst, size, value, ring);
            }
            BlitRequest::UpdateBuffer { dst, data } => {
                self.update_buffer(dst, data, ring);
            }
        }
        self.end_direct(ring);
    }

    fn begin_direct(&self, ring: &mut CmdRing) {
        if self.in_pass {
            return;
        }
        ring.emit(Packet::Event(GpuEvent::CcuFlushColor));
        ring.emit(Packet::Event(GpuEvent::CcuFlushDepth));
        ring.emit(Packet::Event(GpuEvent::CacheInvalidate));
        ring.emit(Packet::WaitForIdle);
    }

    fn end_direct(&self, ring: &mut CmdRing) {
        if self.in_pass {
            return;
        }
        ring.emit(Packet::Event(GpuEvent::CacheFlushTs));
    }

    fn copy_surface(
        &self,
        src: SurfaceRegion,
        dst: SurfaceRegion,
        filter: Filter,
        ring: &mut CmdRing,
        access: &mut BlitAccess,
    ) {
        // Combined aspects split into one copy per plane.
        if src.aspect == Aspect::DepthStencil {
            debug_assert_eq!(dst.aspect, Aspect::DepthStencil);
            for aspect in [Aspect::Depth, Aspect::Stencil] {
                self.copy_surface(
                    SurfaceRegion { aspect, ..src },
                    SurfaceRegion { aspect, ..dst },
                    filter,
                    ring,
                    access,
                );
            }
            return;
        }

        assert_in_bounds(self.surfaces, &src);
        assert_in_bounds(self.surfaces, &dst);
        access.reads.push(src.surface);
        access.writes.push(dst.surface);

        let src_native = self.surfaces.get(src.surface).format;
        let dst_native = self.surfaces.get(dst.surface).format;
        let src_format = copy_format(src_native, src.aspect, false);
        let dst_format = copy_format(dst_native, dst.aspect, false);
        let src_rect = rect_to_blocks(&src.rect, src_native);
        let dst_rect = rect_to_blocks(&dst.rect, dst_native);

        match can_blit_2d(self.surfaces, &src, &dst, src_format, dst_format) {
            Ok(()) => {
                for layer in 0..src.layer_count {
                    ring.emit(Packet::Blit2d(Blit2dOp {
                        src: Some(BlitImage::Surface {
                            id: src.surface,
                            mip: src.mip,
                            layer: src.layer + layer,
                            aspect: src.aspect,
                        }),
                        dst: BlitImage::Surface {
                            id: dst.surface,
                            mip: dst.mip,
                            layer: dst.layer + layer,
                            aspect: dst.aspect,
                        },
                        src_rect,
                        dst_rect,
                        src_format,
                        dst_format,
                        clear: None,
                        filter,
                    }));
                }
            }
            Err(rejection) => {
                // The shader path handles everything the engine refuses.
                tracing::trace!(?rejection, "2d blit rejected, using shader path");
                for layer in 0..src.layer_count.max(dst.layer_count) {
                    ring.emit(Packet::Blit3d(Blit3dOp {
                        src: Some(BlitImage::Surface {
                            id: src.surface,
                            mip: src.mip,
                            layer: src.layer + layer.min(src.layer_count - 1),
                            aspect: src.aspect,
                        }),
                        dst: BlitImage::Surface {
                            id: dst.surface,
                            mip: dst.mip,
                            layer: dst.layer + layer.min(dst.layer_count - 1),
                            aspect: dst.aspect,
                        },
                        src_rect: src.rect,
                        dst_rect: dst.rect,
                        format: dst_native,
                        clear: None,
                    }));
                }
            }
        }
    }

    fn clear_surface(
        &self,
        dst: SurfaceRegion,
        value: ClearValue,
        ring: &mut CmdRing,
        access: &mut BlitAccess,
    ) {
        let native = self.surfaces.get(dst.surface).format;
        if dst.aspect == Aspect::DepthStencil && native == Format::D32FloatS8Uint {
            // Separate planes clear separately.
            for aspect in [Aspect::Depth, Aspect::Stencil] {
                self.clear_surface(SurfaceRegion { aspect, ..dst }, value, ring, access);
            }
            return;
        }

        assert_in_bounds(self.surfaces, &dst);
        access.writes.push(dst.surface);

        let format = copy_format(native, dst.aspect, false);
        for layer in 0..dst.layer_count {
            let dst_image = BlitImage::Surface {
                id: dst.surface,
                mip: dst.mip,
                layer: dst.layer + layer,
                aspect: dst.aspect,
            };
            if format.renderable_2d() {
                ring.emit(Packet::Blit2d(Blit2dOp {
                    src: None,
                    dst: dst_image,
                    src_rect: dst.rect,
                    dst_rect: rect_to_blocks(&dst.rect, native),
                    src_format: format,
                    dst_format: format,
                    clear: Some(value.packed()),
                    filter: Filter::Nearest,
                }));
            } else {
                ring.emit(Packet::Blit3d(Blit3dOp {
                    src: None,
                    dst: dst_image,
                    src_rect: dst.rect,
                    dst_rect: dst.rect,
                    format: native,
                    clear: Some(value.packed()),
                }));
            }
        }
    }

    /// Raw copy, chunked into runs of at most [`MAX_BLIT_TEXELS`] with
    /// 64-byte-aligned bases; sub-alignment residue becomes an x offset.
    fn copy_buffer(&self, mut src: u64, mut dst: u64, size: u64, ring: &mut CmdRing) {
        // Dword-aligned runs move four bytes per texel.
        let block: u64 = if (src | dst | size) & 3 == 0 { 4 } else { 1 };
        let format = if block == 4 {
            Format::R32Uint
        } else {
            Format::R8Uint
        };
        let mut remaining = size / block;
        while remaining > 0 {
            let src_x = ((src % BASE_ALIGN) / block) as u32;
            let dst_x = ((dst % BASE_ALIGN) / block) as u32;
            let width = remaining.min((MAX_BLIT_TEXELS - src_x.max(dst_x)) as u64) as u32;
            ring.emit(Packet::Blit2d(Blit2dOp {
                src: Some(BlitImage::Buffer {
                    base: src & !(BASE_ALIGN - 1),
                }),
                dst: BlitImage::Buffer {
                    base: dst & !(BASE_ALIGN - 1),
                },
                src_rect: Rect::new(src_x, 0, width, 1),
                dst_rect: Rect::new(dst_x, 0, width, 1),
                src_format: format,
                dst_format: format,
                clear: None,
                filter: Filter::Nearest,
            }));
            let advance = width as u64 * block;
            src += advance;
            dst += advance;
            remaining -= width as u64;
        }
    }

    fn fill_buffer(&self, mut dst: u64, size: u64, value: u32, ring: &mut CmdRing) {
        assert!(
            dst % 4 == 0 && size % 4 == 0,
            "buffer fills must be dword aligned"
        );
        let mut remaining = size / 4;
        while remaining > 0 {
            let dst_x = ((dst % BASE_ALIGN) / 4) as u32;
            let width = remaining.min((MAX_BLIT_TEXELS - dst_x) as u64) as u32;
            ring.emit(Packet::Blit2d(Blit2dOp {
                src: None,
                dst: BlitImage::Buffer {
                    base: dst & !(BASE_ALIGN - 1),
                },
                src_rect: Rect::new(dst_x, 0, width, 1),
                dst_rect: Rect::new(dst_x, 0, width, 1),
                src_format: Format::R32Uint,
                dst_format: Format::R32Uint,
                clear: Some([value; 4]),
                filter: Filter::Nearest,
            }));
            dst += width as u64 * 4;
            remaining -= width as u64;
        }
    }

    /// Uploads an inline payload through a generator-owned staging copy.
    fn update_buffer(&self, mut dst: u64, data: Vec<u32>, ring: &mut CmdRing) {
        assert!(dst % 4 == 0, "buffer updates must be dword aligned");
        let staging: Arc<[u32]> = data.into();
        let mut offset: u32 = 0;
        let mut remaining = staging.len() as u64;
        while remaining > 0 {
            let dst_x = ((dst % BASE_ALIGN) / 4) as u32;
            let width = remaining.min((MAX_BLIT_TEXELS - dst_x) as u64) as u32;
            ring.emit(Packet::Blit2d(Blit2dOp {
                src: Some(BlitImage::Staging(staging.clone())),
                dst: BlitImage::Buffer {
                    base: dst & !(BASE_ALIGN - 1),
                },
                src_rect: Rect::new(offset, 0, width, 1),
                dst_rect: Rect::new(dst_x, 0, width, 1),
                src_format: Format::R32Uint,
                dst_format: Format::R32Uint,
                clear: None,
                filter: Filter::Nearest,
            }));
            dst += width as u64 * 4;
            offset += width;
            remaining -= width as u64;
        }
    }
}

/// Clears a depth surface's accelerator sidecar. The caller is expected
/// to mark the surface's accelerator valid again.
pub fn clear_lrz(surface: SurfaceId, ring: &mut CmdRing) {
    ring.emit(Packet::Blit2d(Blit2dOp {
        src: None,
        dst: BlitImage::Lrz { surface },
        src_rect: Rect::ZERO,
        dst_rect: Rect::ZERO,
        src_format: Format::R16Unorm,
        dst_format: Format::R16Unorm,
        clear: Some([0; 4]),
        filter: Filter::Nearest,
    }));
}
