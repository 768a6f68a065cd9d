//! Phase orchestration: lowering a recorded batch into executable rings.
//!
//! The tile path runs: optional visibility pre-pass, then per tile a
//! restore/clear phase, the draw-ring replay and a resolve phase, with
//! the whole per-tile sequence conditionally skipped for bins the
//! pre-pass saw no geometry in. When tiling cannot work or cannot win,
//! the bypass path renders the draw ring straight to memory in one pass.

use crate::batch::Batch;
use crate::blit::{Blit2dOp, Blit3dOp, BlitImage, Filter};
use crate::format::{Aspect, Format, copy_format};
use crate::packet::{BinFlags, GpuEvent, Packet, RenderMode};
use crate::ring::{CmdRing, RingKind};
use crate::state_group::StateGroupCache;
use crate::surface::{Attachment, AttachmentMask, ClearValue, SurfaceTable};
use crate::tile::SLOTS_PER_PIPE;
use crate::visibility::VisStreams;
use kiln_core::geometry::Rect;
use kiln_core::profiling::profile_function;

/// Debug and policy switches, normally all off.
#[derive(Debug, Clone, Copy, Default)]
pub struct GmemOptions {
    pub force_sysmem: bool,
    pub force_gmem: bool,
    pub force_binning: bool,
    pub disable_binning: bool,
}

/// At or below this many bins the pre-pass costs more than it saves.
const MIN_BINS_FOR_BINNING: u32 = 2;

/// Whether the batch must (or should) bypass tile memory entirely.
pub fn use_sysmem_rendering(batch: &Batch, opts: &GmemOptions) -> bool {
    if opts.force_sysmem {
        return true;
    }
    if opts.force_gmem {
        return false;
    }
    if !batch.layout.fits_gmem() {
        tracing::debug!(batch = batch.id.0, "attachments exceed gmem, using bypass");
        return true;
    }
    // Layered rendering binds every layer at once; tile memory holds one.
    if batch.fb.layers > 1 {
        return true;
    }
    if batch.render_area().is_empty() {
        return true;
    }
    false
}

/// Whether the visibility pre-pass is worth running.
pub fn use_hw_binning(batch: &Batch, opts: &GmemOptions) -> bool {
    // Stream-out commands must execute exactly once; only the pre-pass
    // gives them a single-execution home.
    if batch.xfb_used {
        return true;
    }
    if opts.disable_binning || batch.num_draws == 0 {
        return false;
    }
    if batch.layout.max_bins_per_pipe() > SLOTS_PER_PIPE {
        return false;
    }
    if opts.force_binning {
        return true;
    }
    batch.layout.bin_count() > MIN_BINS_FOR_BINNING
}

/// Lowers the batch. Returns the frame-level master ring; the batch's
/// own rings are frozen and must not be recorded into afterwards.
pub fn render(
    batch: &mut Batch,
    vis: &mut VisStreams,
    opts: &GmemOptions,
    surfaces: &SurfaceTable,
) -> CmdRing {
    profile_function!();
    assert!(!batch.submitted, "batch already submitted");
    let mut master = CmdRing::new(RingKind::Frame);
    // Start from a known state: no group from a previous render mode may
    // leak into this one.
    StateGroupCache::disable_all(&mut master);
    emit_epilogue(batch);
    if use_sysmem_rendering(batch, opts) {
        render_sysmem(batch, surfaces, &mut master);
    } else {
        render_tiles(batch, vis, opts, surfaces, &mut master);
    }
    batch.submitted = true;
    batch.rings.freeze_all();
    master.freeze();
    master
}

fn gmem_offset(attachment: &Attachment) -> u32 {
    attachment
        .gmem_offset
        .expect("attachment missing gmem placement")
}

fn restore_blit(
    attachment: &Attachment,
    aspect: Aspect,
    format: Format,
    area: Rect<u32>,
) -> Packet {
    Packet::Blit2d(Blit2dOp {
        src: Some(BlitImage::Surface {
            id: attachment.surface,
            mip: 0,
            layer: 0,
            aspect,
        }),
        dst: BlitImage::Gmem {
            offset: gmem_offset(attachment),
        },
        src_rect: area,
        dst_rect: area,
        src_format: format,
        dst_format: format,
        clear: None,
        filter: Filter::Nearest,
    })
}

fn gmem_clear_blit(
    attachment: &Attachment,
    format: Format,
    area: Rect<u32>,
    value: ClearValue,
) -> Packet {
    Packet::Blit2d(Blit2dOp {
        src: None,
        dst: BlitImage::Gmem {
            offset: gmem_offset(attachment),
        },
        src_rect: area,
        dst_rect: area,
        src_format: format,
        dst_format: format,
        clear: Some(value.packed()),
        filter: Filter::Nearest,
    })
}

/// Builds the post-pass epilogue ring: drops every draw-state group and
/// restores the visibility override, so nothing this pass programmed
/// survives into whatever executes next.
fn emit_epilogue(batch: &mut Batch) {
    let ring = &mut batch.rings.epilogue;
    StateGroupCache::disable_all(ring);
    ring.emit(Packet::OverrideVisibility(false));
}

fn ds_aspect(mask: AttachmentMask, format: Format) -> Aspect {
    let wants_depth = mask.contains(AttachmentMask::DEPTH) && format.has_depth();
    let wants_stencil = mask.contains(AttachmentMask::STENCIL) && format.has_stencil();
    match (wants_depth, wants_stencil) {
        (true, true) => Aspect::DepthStencil,
        (_, true) => Aspect::Stencil,
        _ => Aspect::Depth,
    }
}

/// Builds the per-tile setup ring: restores for preserved attachments,
/// then the realized fast clears, scissored to the touched region.
fn emit_tile_setup(batch: &mut Batch, surfaces: &SurfaceTable) {
    let area = batch.render_area();
    let restore = batch.restore;
    let fast_clear = batch.fast_clear;
    let clear_colors = batch.clear_colors;
    let clear_depth = batch.clear_depth;
    let fb = &batch.fb;
    let ring = &mut batch.rings.tile_setup;

    if restore.is_empty() && fast_clear.is_empty() {
        return;
    }
    ring.emit(Packet::WindowScissor(area));

    for (i, attachment) in fb.colors.iter().enumerate() {
        if restore.contains(AttachmentMask::color(i)) {
            let format = surfaces.get(attachment.surface).format;
            ring.emit(restore_blit(
                attachment,
                Aspect::Color,
                copy_format(format, Aspect::Color, false),
                area,
            ));
        }
    }
    if let Some(attachment) = &fb.depth {
        let ds = restore & (AttachmentMask::DEPTH | AttachmentMask::STENCIL);
        if !ds.is_empty() {
            let format = surfaces.get(attachment.surface).format;
            ring.emit(restore_blit(attachment, ds_aspect(ds, format), format, area));
        }
    }

    for (i, attachment) in fb.colors.iter().enumerate() {
        if fast_clear.contains(AttachmentMask::color(i))
            && let Some(value) = clear_colors[i]
        {
            let format = surfaces.get(attachment.surface).format;
            ring.emit(gmem_clear_blit(attachment, format, area, value));
        }
    }
    if let Some(attachment) = &fb.depth {
        let ds = fast_clear & (AttachmentMask::DEPTH | AttachmentMask::STENCIL);
        if !ds.is_empty()
            && let Some(value) = clear_depth
        {
            let format = surfaces.get(attachment.surface).format;
            ring.emit(gmem_clear_blit(attachment, format, area, value));
        }
    }
}

/// Builds the per-tile store ring: resolves from tile memory back to the
/// attachments. Formats the 2D path cannot write go through the shader
/// path per tile.
fn emit_tile_store(batch: &mut Batch, surfaces: &SurfaceTable) {
    let area = batch.render_area();
    let resolve = batch.resolve;
    let fb = &batch.fb;
    let ring = &mut batch.rings.tile_store;

    if resolve.is_empty() {
        return;
    }
    ring.emit(Packet::Marker(RenderMode::Resolve));
    ring.emit(Packet::WindowScissor(area));

    let mut store = |attachment: &Attachment, aspect: Aspect, format: Format| {
        let engine_format = copy_format(format, aspect, false);
        let src = BlitImage::Gmem {
            offset: gmem_offset(attachment),
        };
        let dst = BlitImage::Surface {
            id: attachment.surface,
            mip: 0,
            layer: 0,
            aspect,
        };
        if engine_format.renderable_2d() {
            ring.emit(Packet::Blit2d(Blit2dOp {
                src: Some(src),
                dst,
                src_rect: area,
                dst_rect: area,
                src_format: engine_format,
                dst_format: engine_format,
                clear: None,
                filter: Filter::Nearest,
            }));
        } else {
            ring.emit(Packet::Blit3d(Blit3dOp {
                src: Some(src),
                dst,
                src_rect: area,
                dst_rect: area,
                format,
                clear: None,
            }));
        }
    };

    for (i, attachment) in fb.colors.iter().enumerate() {
        if resolve.contains(AttachmentMask::color(i)) {
            store(
                attachment,
                Aspect::Color,
                surfaces.get(attachment.surface).format,
            );
        }
    }
    if let Some(attachment) = &fb.depth {
        let ds = resolve & (AttachmentMask::DEPTH | AttachmentMask::STENCIL);
        if !ds.is_empty() {
            let format = surfaces.get(attachment.surface).format;
            store(attachment, ds_aspect(ds, format), format);
        }
    }
}

fn render_tiles(
    batch: &mut Batch,
    vis: &mut VisStreams,
    opts: &GmemOptions,
    surfaces: &SurfaceTable,
    master: &mut CmdRing,
) {
    let binning = use_hw_binning(batch, opts);
    tracing::debug!(
        batch = batch.id.0,
        bins = batch.layout.bin_count(),
        draws = batch.num_draws,
        binning,
        reason = ?batch.gmem_reason,
        "tile rendering"
    );

    emit_tile_setup(batch, surfaces);
    emit_tile_store(batch, surfaces);

    master.emit(Packet::Event(GpuEvent::LrzFlush));
    master.emit(Packet::AutoSkipEmptyTiles(binning));
    master.emit(Packet::Event(GpuEvent::CcuInvalidateColor));
    master.emit(Packet::Event(GpuEvent::CcuInvalidateDepth));

    let area = batch.render_area();
    let layout = &batch.layout;

    if binning {
        // Buffers for the current pitches must exist before the config
        // points the pre-pass at them.
        let (draw_pitch, prim_pitch) = (vis.draw_pitch(), vis.prim_pitch());
        vis.ensure_capacity(draw_pitch, prim_pitch);
        vis.emit_config(master, layout);
        master.emit(Packet::Marker(RenderMode::Binning));
        master.emit(Packet::BinSize {
            width: layout.bin_width,
            height: layout.bin_height,
            flags: BinFlags::BINNING_PASS,
        });
        master.emit(Packet::WindowScissor(area));
        master.emit(Packet::WindowOffset { x: 0, y: 0 });
        master.emit(Packet::WaitForIdle);
        master.emit(Packet::OverrideVisibility(false));
        master.emit(Packet::CallRing(RingKind::Draw));

        // The pre-pass wrote visibility data through the caches; it must
        // be observable by the command processor's own fetch before any
        // conditional below reads it.
        master.emit(Packet::Event(GpuEvent::CacheFlushTs));
        master.emit(Packet::WaitForIdle);
        master.emit(Packet::WaitForMe);
        vis.probe_overflow(master, layout.used_pipes());
    } else {
        master.emit(Packet::OverrideVisibility(true));
    }

    for bin in &layout.bins {
        master.emit(Packet::Marker(RenderMode::Gmem));
        master.emit(Packet::BinSize {
            width: layout.bin_width,
            height: layout.bin_height,
            flags: BinFlags::empty(),
        });
        master.emit(Packet::WindowScissor(bin.rect));
        master.emit(Packet::WindowOffset {
            x: bin.rect.x,
            y: bin.rect.y,
        });
        if binning {
            master.emit(Packet::SetBinData(vis.bin_data(bin)));
            master.emit(Packet::CondExecStart {
                pipe: bin.pipe,
                slot: bin.slot,
            });
        }
        master.emit(Packet::CallRing(RingKind::TileSetup));
        master.emit(Packet::CallRing(RingKind::Draw));
        master.emit(Packet::Marker(RenderMode::VisibilityEnd));
        master.emit(Packet::CallRing(RingKind::TileStore));
        if binning {
            master.emit(Packet::CondExecEnd);
        }
    }

    master.emit(Packet::CallRing(RingKind::Epilogue));
    master.emit(Packet::Event(GpuEvent::LrzFlush));
    master.emit(Packet::Event(GpuEvent::ResolveTs));
    master.emit(Packet::WaitForIdle);
}

fn render_sysmem(batch: &mut Batch, surfaces: &SurfaceTable, master: &mut CmdRing) {
    tracing::debug!(
        batch = batch.id.0,
        draws = batch.num_draws,
        "bypass rendering"
    );
    let fb_rect = Rect::new(0, 0, batch.fb.width, batch.fb.height);

    master.emit(Packet::Marker(RenderMode::Bypass));
    master.emit(Packet::BinSize {
        width: batch.fb.width,
        height: batch.fb.height,
        flags: BinFlags::BUFFERS_IN_SYSMEM,
    });
    master.emit(Packet::WindowScissor(fb_rect));
    master.emit(Packet::WindowOffset { x: 0, y: 0 });
    master.emit(Packet::Event(GpuEvent::LrzFlush));
    master.emit(Packet::Event(GpuEvent::CcuInvalidateColor));
    master.emit(Packet::Event(GpuEvent::CcuInvalidateDepth));
    master.emit(Packet::OverrideVisibility(true));

    // Pending fast clears have no tile setup to land in; clear the
    // attachments in place.
    for (i, attachment) in batch.fb.colors.iter().enumerate() {
        if batch.fast_clear.contains(AttachmentMask::color(i))
            && let Some(value) = batch.clear_colors[i]
        {
            let format = surfaces.get(attachment.surface).format;
            master.emit(Packet::Blit2d(Blit2dOp {
                src: None,
                dst: BlitImage::Surface {
                    id: attachment.surface,
                    mip: 0,
                    layer: 0,
                    aspect: Aspect::Color,
                },
                src_rect: fb_rect,
                dst_rect: fb_rect,
                src_format: format,
                dst_format: format,
                clear: Some(value.packed()),
                filter: Filter::Nearest,
            }));
        }
    }
    if let Some(attachment) = &batch.fb.depth {
        let ds = batch.fast_clear & (AttachmentMask::DEPTH | AttachmentMask::STENCIL);
        if !ds.is_empty()
            && let Some(value) = batch.clear_depth
        {
            let format = surfaces.get(attachment.surface).format;
            master.emit(Packet::Blit2d(Blit2dOp {
                src: None,
                dst: BlitImage::Surface {
                    id: attachment.surface,
                    mip: 0,
                    layer: 0,
                    aspect: ds_aspect(ds, format),
                },
                src_rect: fb_rect,
                dst_rect: fb_rect,
                src_format: format,
                dst_format: format,
                clear: Some(value.packed()),
                filter: Filter::Nearest,
            }));
        }
    }

    master.emit(Packet::CallRing(RingKind::Draw));
    master.emit(Packet::CallRing(RingKind::Epilogue));
    master.emit(Packet::Event(GpuEvent::CcuFlushColor));
    master.emit(Packet::Event(GpuEvent::CcuFlushDepth));
    master.emit(Packet::Event(GpuEvent::CacheFlushTs));
    master.emit(Packet::WaitForIdle);
}
