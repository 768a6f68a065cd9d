//! Recording context.
//!
//! A [`Context`] owns everything one command recorder needs: the surface
//! table, the visibility stream buffers, the state-group cache and the
//! active batch. Work is recorded through it and collected per frame as
//! [`FrameCommands`], an ordered list of submissions (transfer rings and
//! lowered batches) ready for execution or [`replay`](crate::replay).
//!
//! Contexts in one process share a [`SharedState`] so surface hazards
//! across recorders are at least observed, even though each context only
//! orders its own submissions.

use std::sync::{Arc, Mutex};

use crate::batch::{Batch, BatchId, DrawParams, Rings};
use crate::blit::{BlitAccess, BlitDispatcher, BlitRequest, clear_lrz};
use crate::dependency::DependencyTracker;
use crate::gmem::{self, GmemOptions};
use crate::lrz::LrzDirection;
use crate::ring::{CmdRing, RingKind};
use crate::state_group::{FragmentArena, FragmentHandle, PassMask, StateGroupCache, StateGroupId};
use crate::surface::{
    AttachmentMask, ClearValue, Framebuffer, LrzState, Surface, SurfaceId, SurfaceTable,
};
use crate::tile::{BinLayout, MAX_VSC_PIPES, SLOTS_PER_PIPE};
use crate::visibility::VisStreams;
use kiln_core::geometry::Rect;
use kiln_core::profiling::profile_function;

/// On-chip tile memory available to attachments, in bytes.
pub const GMEM_SIZE: u32 = 512 * 1024;

const GMEM_ALIGN: u32 = 0x1000;
const BIN_ALIGN_W: u32 = 32;
const BIN_ALIGN_H: u32 = 16;

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/// State shared by every context in the process.
#[derive(Debug, Default)]
pub struct SharedState {
    deps: Mutex<DependencyTracker>,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// One batch lowered to executable form.
pub struct SubmittedBatch {
    pub id: BatchId,
    /// Frame-level ring sequencing the batch's own rings.
    pub master: CmdRing,
    pub rings: Rings,
}

/// A unit of ordered work within a frame.
pub enum Submission {
    /// Transfer work recorded outside any render pass.
    Direct(CmdRing),
    Batch(SubmittedBatch),
}

/// Everything one frame recorded, in execution order.
pub struct FrameCommands {
    pub frame: u64,
    pub submissions: Vec<Submission>,
}

pub struct Context {
    shared: Arc<SharedState>,
    surfaces: SurfaceTable,
    vis: VisStreams,
    arena: FragmentArena,
    cache: StateGroupCache,
    opts: GmemOptions,
    frame_index: u64,
    next_batch: u64,
    batch: Option<Batch>,
    direct: CmdRing,
    submissions: Vec<Submission>,
}

impl Context {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self::with_options(shared, GmemOptions::default())
    }

    pub fn with_options(shared: Arc<SharedState>, opts: GmemOptions) -> Self {
        Self {
            shared,
            surfaces: SurfaceTable::new(),
            vis: VisStreams::new(),
            arena: FragmentArena::new(),
            cache: StateGroupCache::new(),
            opts,
            frame_index: 0,
            next_batch: 0,
            batch: None,
            direct: CmdRing::new(RingKind::Frame),
            submissions: Vec::new(),
        }
    }

    pub fn options(&mut self) -> &mut GmemOptions {
        &mut self.opts
    }

    pub fn surfaces(&self) -> &SurfaceTable {
        &self.surfaces
    }

    pub fn visibility(&self) -> &VisStreams {
        &self.vis
    }

    pub fn create_surface(&mut self, surface: Surface) -> SurfaceId {
        self.surfaces.insert(surface)
    }

    pub fn destroy_surface(&mut self, id: SurfaceId) -> Surface {
        if let Some(batch) = &self.batch {
            let bound = batch.fb.colors.iter().any(|a| a.surface == id)
                || batch.fb.depth.as_ref().is_some_and(|a| a.surface == id);
            assert!(!bound, "destroying a surface bound to the active batch");
        }
        self.surfaces.remove(id)
    }

    /// Starts a frame. Consumes the previous frame's visibility overflow
    /// report, growing a stream before anything records against the old
    /// pitch.
    pub fn begin_frame(&mut self) {
        assert!(self.batch.is_none(), "previous frame still has an open batch");
        self.frame_index += 1;
        self.vis.reconcile();
        kiln_core::profiling::new_frame();
    }

    /// Opens a batch targeting `fb`, flushing any batch already open.
    /// Attachment gmem placement and tile geometry are planned here.
    pub fn begin_batch(&mut self, mut fb: Framebuffer) -> BatchId {
        profile_function!();
        self.flush_batch();

        let layout = plan_layout(&mut fb, &self.surfaces);
        let id = BatchId(self.next_batch);
        self.next_batch += 1;

        {
            let mut deps = self.shared.deps.lock().expect("dependency tracker poisoned");
            for attachment in fb.colors.iter().chain(fb.depth.as_ref()) {
                let blockers = deps.note_write(attachment.surface, id);
                if !blockers.is_empty() {
                    tracing::debug!(
                        batch = id.0,
                        ?blockers,
                        "batch ordered after prior work on its attachments"
                    );
                }
            }
        }

        self.batch = Some(Batch::new(id, fb, layout, &self.surfaces));
        id
    }

    pub fn draw(&mut self, params: &DrawParams) {
        let Context {
            batch,
            surfaces,
            arena,
            cache,
            ..
        } = self;
        batch
            .as_mut()
            .expect("no active batch")
            .record_draw(surfaces, arena, cache, params);
    }

    pub fn clear(
        &mut self,
        mask: AttachmentMask,
        color: Option<ClearValue>,
        depth: Option<ClearValue>,
        scissor: Rect<u32>,
    ) {
        let Context {
            batch, surfaces, ..
        } = self;
        batch
            .as_mut()
            .expect("no active batch")
            .record_clear(surfaces, mask, color, depth, scissor);
    }

    /// Marks a one-shot state-group payload dirty for the next draw.
    pub fn set_group(&mut self, group: StateGroupId, enable: PassMask, payload: Vec<u32>) {
        self.cache.take(&mut self.arena, group, enable, payload);
    }

    /// Marks a cached fragment dirty for the next draw.
    pub fn set_group_cached(
        &mut self,
        group: StateGroupId,
        enable: PassMask,
        handle: FragmentHandle,
    ) {
        self.cache.add(&mut self.arena, group, enable, handle);
    }

    pub fn create_fragment(&mut self, payload: Vec<u32>) -> FragmentHandle {
        self.arena.insert(payload)
    }

    pub fn release_fragment(&mut self, handle: FragmentHandle) {
        self.arena.release(handle);
    }

    /// Records a transfer. Transfers execute in order with batches, so an
    /// open batch is flushed first.
    pub fn transfer(&mut self, req: BlitRequest) {
        profile_function!();
        self.flush_batch();
        let mut access = BlitAccess::default();
        let dispatcher = BlitDispatcher {
            surfaces: &self.surfaces,
            in_pass: false,
        };
        dispatcher.dispatch(req, &mut self.direct, &mut access);

        let deps = self.shared.deps.lock().expect("dependency tracker poisoned");
        for &surface in access.reads.iter().chain(&access.writes) {
            // This context's own order already covers its batches; a hit
            // here means another context has unsubmitted work.
            if deps.would_conflict(surface, BatchId(u64::MAX), true) {
                tracing::warn!(?surface, "transfer races unsubmitted work on another context");
            }
        }
    }

    /// Clears a depth surface's accelerator sidecar and marks it valid.
    pub fn reset_lrz(&mut self, id: SurfaceId) {
        self.flush_batch();
        assert!(
            self.surfaces.get(id).lrz.is_some(),
            "surface has no depth accelerator"
        );
        clear_lrz(id, &mut self.direct);
        self.surfaces.get_mut(id).lrz = Some(LrzState {
            valid: true,
            direction: LrzDirection::Unknown,
        });
    }

    /// Lowers and queues the open batch, if any.
    pub fn flush_batch(&mut self) {
        let Some(mut batch) = self.batch.take() else {
            return;
        };
        profile_function!();
        batch.dump();
        self.seal_direct();

        let master = gmem::render(&mut batch, &mut self.vis, &self.opts, &self.surfaces);

        // The batch's final accelerator state survives into the next
        // batch that binds the same depth surface.
        if let Some(attachment) = &batch.fb.depth {
            let surface = self.surfaces.get_mut(attachment.surface);
            if surface.lrz.is_some() {
                surface.lrz = Some(batch.lrz.state());
            }
        }

        self.shared
            .deps
            .lock()
            .expect("dependency tracker poisoned")
            .forget_batch(batch.id);

        self.submissions.push(Submission::Batch(SubmittedBatch {
            id: batch.id,
            master,
            rings: batch.rings,
        }));
    }

    fn seal_direct(&mut self) {
        if self.direct.is_empty() {
            return;
        }
        let mut direct = std::mem::replace(&mut self.direct, CmdRing::new(RingKind::Frame));
        direct.freeze();
        self.submissions.push(Submission::Direct(direct));
    }

    /// Closes the frame and hands back everything it recorded.
    pub fn end_frame(&mut self) -> FrameCommands {
        self.flush_batch();
        self.seal_direct();
        FrameCommands {
            frame: self.frame_index,
            submissions: std::mem::take(&mut self.submissions),
        }
    }
}

fn bytes_per_pixel(fb: &Framebuffer, surfaces: &SurfaceTable) -> u32 {
    let mut cpp = 0;
    for attachment in fb.colors.iter().chain(fb.depth.as_ref()) {
        let surface = surfaces.get(attachment.surface);
        cpp += surface.format.bytes_per_block() * surface.samples.as_u32();
    }
    cpp
}

/// Writes each attachment's gmem offset for the given bin size and
/// returns the total footprint in bytes.
fn place_attachments(fb: &mut Framebuffer, surfaces: &SurfaceTable, bin_w: u32, bin_h: u32) -> u32 {
    let mut offset = 0;
    for attachment in fb.colors.iter_mut().chain(fb.depth.as_mut()) {
        let surface = surfaces.get(attachment.surface);
        offset = align_up(offset, GMEM_ALIGN);
        attachment.gmem_offset = Some(offset);
        offset += surface.format.bytes_per_block() * surface.samples.as_u32() * bin_w * bin_h;
    }
    offset
}

/// Plans tile geometry for a framebuffer: the largest aligned bin whose
/// attachment footprint fits in tile memory, shrunk further if the bin
/// grid would exceed the visibility hardware's pipe capacity.
fn plan_layout(fb: &mut Framebuffer, surfaces: &SurfaceTable) -> BinLayout {
    let cpp = bytes_per_pixel(fb, surfaces);
    let mut bin_w = align_up(fb.width.max(1), BIN_ALIGN_W);
    let mut bin_h = align_up(fb.height.max(1), BIN_ALIGN_H);

    let footprint = |w: u32, h: u32| {
        let mut total = 0u32;
        for attachment in fb.colors.iter().chain(fb.depth.as_ref()) {
            let surface = surfaces.get(attachment.surface);
            total = align_up(total, GMEM_ALIGN);
            total += surface.format.bytes_per_block() * surface.samples.as_u32() * w * h;
        }
        total
    };

    while footprint(bin_w, bin_h) > GMEM_SIZE {
        if bin_w >= bin_h && bin_w > BIN_ALIGN_W {
            bin_w = align_up(bin_w / 2, BIN_ALIGN_W);
        } else if bin_h > BIN_ALIGN_H {
            bin_h = align_up(bin_h / 2, BIN_ALIGN_H);
        } else {
            break;
        }
    }

    // The pipe grid caps how fine the bin grid may be: at most one pipe
    // per bin row and one slot per bin column.
    while fb.width.div_ceil(bin_w) > SLOTS_PER_PIPE {
        bin_w = align_up(bin_w * 2, BIN_ALIGN_W);
    }
    while fb.height.div_ceil(bin_h) > MAX_VSC_PIPES as u32 {
        bin_h = align_up(bin_h * 2, BIN_ALIGN_H);
    }

    let fits = cpp == 0 || footprint(bin_w, bin_h) <= GMEM_SIZE;
    let gmem_pixels = if fits { bin_w * bin_h } else { 0 };
    if fits {
        place_attachments(fb, surfaces, bin_w, bin_h);
    }
    tracing::trace!(
        width = fb.width,
        height = fb.height,
        bin_w,
        bin_h,
        cpp,
        fits,
        "planned tile layout"
    );
    BinLayout::uniform(fb.width, fb.height, bin_w, bin_h, gmem_pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::lrz::{CompareOp, DepthState, PipelineDepthInfo, ShaderFlags, StencilState};
    use crate::surface::Attachment;

    fn framebuffer(ctx: &mut Context, format: Format, width: u32, height: u32) -> Framebuffer {
        let color = ctx.create_surface(Surface::new_2d(format, width, height));
        Framebuffer {
            colors: vec![Attachment {
                surface: color,
                gmem_offset: None,
            }],
            depth: None,
            width,
            height,
            layers: 1,
        }
    }

    #[test]
    fn test_small_target_gets_single_bin() {
        let mut ctx = Context::new(SharedState::new());
        let mut fb = framebuffer(&mut ctx, Format::Rgba8Unorm, 64, 64);
        let layout = plan_layout(&mut fb, ctx.surfaces());
        assert_eq!(layout.bin_count(), 1);
        assert!(layout.fits_gmem());
        assert_eq!(fb.colors[0].gmem_offset, Some(0));
    }

    #[test]
    fn test_large_target_is_split_into_bins() {
        let mut ctx = Context::new(SharedState::new());
        // 2048x2048x4B = 16 MiB, far beyond tile memory.
        let mut fb = framebuffer(&mut ctx, Format::Rgba8Unorm, 2048, 2048);
        let layout = plan_layout(&mut fb, ctx.surfaces());
        assert!(layout.bin_count() > 1);
        assert!(layout.fits_gmem());
        assert!(layout.bin_width * layout.bin_height * 4 <= GMEM_SIZE);
    }

    #[test]
    fn test_attachments_are_placed_disjoint_and_aligned() {
        let mut ctx = Context::new(SharedState::new());
        let color = ctx.create_surface(Surface::new_2d(Format::Rgba8Unorm, 256, 256));
        let depth = ctx.create_surface(Surface::new_2d(Format::D32Float, 256, 256));
        let mut fb = Framebuffer {
            colors: vec![Attachment {
                surface: color,
                gmem_offset: None,
            }],
            depth: Some(Attachment {
                surface: depth,
                gmem_offset: None,
            }),
            width: 256,
            height: 256,
            layers: 1,
        };
        let layout = plan_layout(&mut fb, ctx.surfaces());
        let color_at = fb.colors[0].gmem_offset.unwrap();
        let depth_at = fb.depth.as_ref().unwrap().gmem_offset.unwrap();
        assert_eq!(color_at % GMEM_ALIGN, 0);
        assert_eq!(depth_at % GMEM_ALIGN, 0);
        assert!(depth_at >= color_at + layout.bin_width * layout.bin_height * 4);
    }

    #[test]
    fn test_frame_collects_submissions_in_order() {
        let mut ctx = Context::new(SharedState::new());
        let fb = framebuffer(&mut ctx, Format::Rgba8Unorm, 128, 128);
        ctx.begin_frame();
        ctx.transfer(BlitRequest::FillBuffer {
            dst: 0x1000,
            size: 256,
            value: 0,
        });
        ctx.begin_batch(fb);
        ctx.clear(
            AttachmentMask::COLOR0,
            Some(ClearValue::Color(crate::surface::ColorClear::Uint([0; 4]))),
            None,
            Rect::new(0, 0, 128, 128),
        );
        let frame = ctx.end_frame();
        assert_eq!(frame.frame, 1);
        assert_eq!(frame.submissions.len(), 2);
        assert!(matches!(frame.submissions[0], Submission::Direct(_)));
        assert!(matches!(frame.submissions[1], Submission::Batch(_)));
    }

    #[test]
    fn test_transfer_flushes_open_batch() {
        let mut ctx = Context::new(SharedState::new());
        let fb = framebuffer(&mut ctx, Format::Rgba8Unorm, 128, 128);
        ctx.begin_frame();
        ctx.begin_batch(fb);
        ctx.clear(
            AttachmentMask::COLOR0,
            Some(ClearValue::Color(crate::surface::ColorClear::Uint([0; 4]))),
            None,
            Rect::new(0, 0, 128, 128),
        );
        ctx.transfer(BlitRequest::FillBuffer {
            dst: 0x2000,
            size: 64,
            value: 7,
        });
        let frame = ctx.end_frame();
        // Batch first, then the transfer that followed it.
        assert_eq!(frame.submissions.len(), 2);
        assert!(matches!(frame.submissions[0], Submission::Batch(_)));
        assert!(matches!(frame.submissions[1], Submission::Direct(_)));
    }

    #[test]
    fn test_lrz_state_written_back_to_surface() {
        let mut ctx = Context::new(SharedState::new());
        let color = ctx.create_surface(Surface::new_2d(Format::Rgba8Unorm, 128, 128));
        let depth = ctx.create_surface(Surface::new_2d(Format::D32Float, 128, 128).with_lrz());
        ctx.surfaces.get_mut(depth).lrz = Some(LrzState {
            valid: true,
            direction: LrzDirection::Unknown,
        });
        let fb = Framebuffer {
            colors: vec![Attachment {
                surface: color,
                gmem_offset: None,
            }],
            depth: Some(Attachment {
                surface: depth,
                gmem_offset: None,
            }),
            width: 128,
            height: 128,
            layers: 1,
        };
        ctx.begin_frame();
        ctx.begin_batch(fb);
        ctx.draw(&DrawParams {
            depth: PipelineDepthInfo {
                depth: DepthState {
                    test_enable: true,
                    write_enable: true,
                    compare: CompareOp::Less,
                },
                stencil: StencilState::DISABLED,
                shader: ShaderFlags::empty(),
                blend_reads_dest: false,
            },
            scissor: Rect::new(0, 0, 128, 128),
            vertex_count: 3,
            instance_count: 1,
            stream_out: false,
        });
        ctx.end_frame();
        let state = ctx.surfaces().get(depth).lrz.unwrap();
        assert!(state.valid);
        assert_eq!(state.direction, LrzDirection::Less);
    }

    #[test]
    #[should_panic]
    fn test_draw_without_batch_panics() {
        let mut ctx = Context::new(SharedState::new());
        ctx.begin_frame();
        ctx.draw(&DrawParams {
            depth: PipelineDepthInfo {
                depth: DepthState {
                    test_enable: false,
                    write_enable: false,
                    compare: CompareOp::Always,
                },
                stencil: StencilState::DISABLED,
                shader: ShaderFlags::empty(),
                blend_reads_dest: false,
            },
            scissor: Rect::new(0, 0, 1, 1),
            vertex_count: 3,
            instance_count: 1,
            stream_out: false,
        });
    }
}
