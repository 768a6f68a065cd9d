//! Per-render-target recording state.
//!
//! A batch accumulates the logical work aimed at one framebuffer: draws
//! into the draw ring, pending clears, and the masks that later drive the
//! restore and resolve phases. The batch records; [`gmem`](crate::gmem)
//! decides how the recording executes.

use crate::blit::{BlitAccess, Blit3dOp, BlitImage};
use crate::format::Aspect;
use crate::lrz::{LrzPass, LrzTracker, PipelineDepthInfo};
use crate::packet::{DrawPacket, Packet};
use crate::ring::{CmdRing, RingKind};
use crate::state_group::{FragmentArena, StateGroupCache};
use crate::surface::{
    AttachmentMask, ClearValue, Framebuffer, MAX_COLOR_ATTACHMENTS, SurfaceTable,
};
use crate::tile::BinLayout;
use kiln_core::geometry::Rect;

bitflags::bitflags! {
    /// Why this batch wants the tile path rather than the bypass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GmemReason: u8 {
        const CLEAR = 1 << 0;
        const DEPTH_TEST = 1 << 1;
        const STENCIL = 1 << 2;
        const BLEND = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub u64);

/// The rings a batch records into. The frame-level master ring that
/// sequences them is built at submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Rings {
    pub tile_setup: CmdRing,
    pub draw: CmdRing,
    pub tile_store: CmdRing,
    pub epilogue: CmdRing,
}

impl Rings {
    fn new() -> Self {
        Self {
            tile_setup: CmdRing::new(RingKind::TileSetup),
            draw: CmdRing::new(RingKind::Draw),
            tile_store: CmdRing::new(RingKind::TileStore),
            epilogue: CmdRing::new(RingKind::Epilogue),
        }
    }

    pub fn get(&self, kind: RingKind) -> Option<&CmdRing> {
        match kind {
            RingKind::TileSetup => Some(&self.tile_setup),
            RingKind::Draw => Some(&self.draw),
            RingKind::TileStore => Some(&self.tile_store),
            RingKind::Epilogue => Some(&self.epilogue),
            RingKind::Frame => None,
        }
    }

    pub(crate) fn freeze_all(&mut self) {
        self.tile_setup.freeze();
        self.draw.freeze();
        self.tile_store.freeze();
        self.epilogue.freeze();
    }
}

/// Everything one draw call carries into the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub depth: PipelineDepthInfo,
    pub scissor: Rect<u32>,
    pub vertex_count: u32,
    pub instance_count: u32,
    pub stream_out: bool,
}

pub struct Batch {
    pub id: BatchId,
    pub fb: Framebuffer,
    pub layout: BinLayout,
    pub rings: Rings,
    pub(crate) clear_colors: [Option<ClearValue>; MAX_COLOR_ATTACHMENTS],
    pub(crate) clear_depth: Option<ClearValue>,
    /// Attachments with a pending on-chip fast clear.
    pub(crate) fast_clear: AttachmentMask,
    /// Attachments whose full contents this batch defined by clearing.
    pub(crate) cleared: AttachmentMask,
    /// Attachments whose prior contents must be loaded into tile memory.
    pub(crate) restore: AttachmentMask,
    /// Attachments written back to memory after the tile passes.
    pub(crate) resolve: AttachmentMask,
    pub num_draws: u32,
    pub xfb_used: bool,
    /// Union of every region the batch touched; fast clears and the
    /// render area are scissored to it.
    pub max_scissor: Rect<u32>,
    pub gmem_reason: GmemReason,
    pub(crate) lrz: LrzTracker,
    pub(crate) access: BlitAccess,
    pub(crate) submitted: bool,
}

impl Batch {
    pub fn new(id: BatchId, fb: Framebuffer, layout: BinLayout, surfaces: &SurfaceTable) -> Self {
        let lrz_state = fb
            .depth
            .as_ref()
            .and_then(|a| surfaces.get(a.surface).lrz)
            .unwrap_or_default();
        let mut access = BlitAccess::default();
        for color in &fb.colors {
            access.writes.push(color.surface);
        }
        if let Some(depth) = &fb.depth {
            access.writes.push(depth.surface);
        }
        Self {
            id,
            fb,
            layout,
            rings: Rings::new(),
            clear_colors: [None; MAX_COLOR_ATTACHMENTS],
            clear_depth: None,
            fast_clear: AttachmentMask::empty(),
            cleared: AttachmentMask::empty(),
            restore: AttachmentMask::empty(),
            resolve: AttachmentMask::empty(),
            num_draws: 0,
            xfb_used: false,
            max_scissor: Rect::ZERO,
            gmem_reason: GmemReason::empty(),
            lrz: LrzTracker::new(lrz_state),
            access,
            submitted: false,
        }
    }

    fn fb_rect(&self) -> Rect<u32> {
        Rect::new(0, 0, self.fb.width, self.fb.height)
    }

    pub fn render_area(&self) -> Rect<u32> {
        self.max_scissor.intersection(&self.fb_rect())
    }

    /// Records a clear of the selected attachments.
    ///
    /// Before any draw, a clear covering the whole target stays pending
    /// and is realized on-chip during tile setup. After a draw (or for a
    /// partial region, or a format the fast path rejects) it degrades to
    /// a per-pixel shader clear replayed with the draws.
    pub fn record_clear(
        &mut self,
        surfaces: &SurfaceTable,
        mask: AttachmentMask,
        color: Option<ClearValue>,
        depth: Option<ClearValue>,
        scissor: Rect<u32>,
    ) {
        assert!(!self.submitted, "recording into submitted batch");
        let full = scissor.contains(&self.fb_rect()) || scissor == self.fb_rect();
        self.max_scissor = self.max_scissor.union(&scissor.intersection(&self.fb_rect()));
        self.resolve |= mask & self.present_mask(surfaces);

        let fast_eligible = self.num_draws == 0 && full && self.formats_fast_clear(surfaces, mask);
        if fast_eligible {
            for i in 0..self.fb.colors.len() {
                let bit = AttachmentMask::color(i);
                if mask.contains(bit) {
                    self.clear_colors[i] = color;
                    self.fast_clear |= bit;
                    self.cleared |= bit;
                }
            }
            if mask.intersects(AttachmentMask::DEPTH | AttachmentMask::STENCIL) {
                self.clear_depth = depth;
                let ds = mask & (AttachmentMask::DEPTH | AttachmentMask::STENCIL);
                self.fast_clear |= ds;
                self.cleared |= ds;
            }
            return;
        }

        // Per-pixel path: a quad draw replayed exactly like user draws.
        self.gmem_reason |= GmemReason::CLEAR;
        if full {
            self.cleared |= mask;
        }
        for i in 0..self.fb.colors.len() {
            let bit = AttachmentMask::color(i);
            if mask.contains(bit)
                && let Some(value) = color
            {
                self.rings.draw.emit(Packet::Blit3d(Blit3dOp {
                    src: None,
                    dst: BlitImage::Attachment {
                        index: i as u8,
                        aspect: Aspect::Color,
                    },
                    src_rect: scissor,
                    dst_rect: scissor,
                    format: surfaces.get(self.fb.colors[i].surface).format,
                    clear: Some(value.packed()),
                }));
            }
        }
        if mask.intersects(AttachmentMask::DEPTH | AttachmentMask::STENCIL)
            && let (Some(value), Some(attachment)) = (depth, &self.fb.depth)
        {
            let aspect = if mask.contains(AttachmentMask::DEPTH | AttachmentMask::STENCIL) {
                Aspect::DepthStencil
            } else if mask.contains(AttachmentMask::DEPTH) {
                Aspect::Depth
            } else {
                Aspect::Stencil
            };
            self.rings.draw.emit(Packet::Blit3d(Blit3dOp {
                src: None,
                dst: BlitImage::Attachment { index: 0, aspect },
                src_rect: scissor,
                dst_rect: scissor,
                format: surfaces.get(attachment.surface).format,
                clear: Some(value.packed()),
            }));
        }
    }

    pub fn record_draw(
        &mut self,
        surfaces: &SurfaceTable,
        arena: &mut FragmentArena,
        cache: &mut StateGroupCache,
        params: &DrawParams,
    ) {
        assert!(!self.submitted, "recording into submitted batch");
        let present = self.present_mask(surfaces);
        if self.num_draws == 0 {
            // First draw: anything not defined by a full clear must be
            // loaded into tile memory before the tile's draws replay.
            self.restore |= present & !self.cleared;
        }
        self.resolve |= present;
        self.max_scissor = self
            .max_scissor
            .union(&params.scissor.intersection(&self.fb_rect()));
        self.num_draws += 1;
        self.xfb_used |= params.stream_out;

        if params.depth.depth.test_enable {
            self.gmem_reason |= GmemReason::DEPTH_TEST;
        }
        if params.depth.stencil.enable {
            self.gmem_reason |= GmemReason::STENCIL;
        }
        if params.depth.blend_reads_dest {
            self.gmem_reason |= GmemReason::BLEND;
        }

        let decision = self.lrz.assess(&params.depth);
        self.lrz
            .emit(LrzPass::Binning, decision.binning, &mut self.rings.draw);
        self.lrz
            .emit(LrzPass::Render, decision.render, &mut self.rings.draw);

        cache.flush(arena, &mut self.rings.draw);
        self.rings.draw.emit(Packet::Draw(DrawPacket {
            vertex_count: params.vertex_count,
            instance_count: params.instance_count,
        }));
    }

    pub fn present_mask(&self, surfaces: &SurfaceTable) -> AttachmentMask {
        self.fb.present_mask(surfaces)
    }

    fn formats_fast_clear(&self, surfaces: &SurfaceTable, mask: AttachmentMask) -> bool {
        for (i, attachment) in self.fb.colors.iter().enumerate() {
            if mask.contains(AttachmentMask::color(i))
                && !surfaces.get(attachment.surface).format.supports_fast_clear()
            {
                return false;
            }
        }
        true
    }

    /// Logs the batch's recording state.
    pub fn dump(&self) {
        tracing::debug!(
            id = self.id.0,
            draws = self.num_draws,
            fast_clear = ?self.fast_clear,
            restore = ?self.restore,
            resolve = ?self.resolve,
            reason = ?self.gmem_reason,
            area = ?self.max_scissor,
            xfb = self.xfb_used,
            "batch state"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::lrz::{CompareOp, DepthState, ShaderFlags, StencilState};
    use crate::surface::{Attachment, ColorClear, Surface};

    fn setup() -> (SurfaceTable, Batch) {
        let mut surfaces = SurfaceTable::new();
        let color = surfaces.insert(Surface::new_2d(Format::Rgba8Unorm, 128, 128));
        let depth = surfaces.insert(Surface::new_2d(Format::D32Float, 128, 128).with_lrz());
        let fb = Framebuffer {
            colors: vec![Attachment {
                surface: color,
                gmem_offset: Some(0),
            }],
            depth: Some(Attachment {
                surface: depth,
                gmem_offset: Some(0x10000),
            }),
            width: 128,
            height: 128,
            layers: 1,
        };
        let layout = BinLayout::uniform(128, 128, 32, 32, 1 << 20);
        let batch = Batch::new(BatchId(0), fb, layout, &surfaces);
        (surfaces, batch)
    }

    fn draw_params() -> DrawParams {
        DrawParams {
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
            scissor: Rect::new(0, 0, 128, 128),
            vertex_count: 3,
            instance_count: 1,
            stream_out: false,
        }
    }

    #[test]
    fn test_full_clear_before_draws_stays_pending() {
        let (surfaces, mut batch) = setup();
        batch.record_clear(
            &surfaces,
            AttachmentMask::COLOR0,
            Some(ClearValue::Color(ColorClear::Uint([1, 2, 3, 4]))),
            None,
            Rect::new(0, 0, 128, 128),
        );
        assert_eq!(batch.fast_clear, AttachmentMask::COLOR0);
        assert!(batch.rings.draw.is_empty());
        assert_eq!(batch.resolve, AttachmentMask::COLOR0);
    }

    #[test]
    fn test_clear_after_draw_degrades_to_quad() {
        let (surfaces, mut batch) = setup();
        let mut arena = FragmentArena::new();
        let mut cache = StateGroupCache::new();
        batch.record_draw(&surfaces, &mut arena, &mut cache, &draw_params());
        let len_before = batch.rings.draw.len();
        batch.record_clear(
            &surfaces,
            AttachmentMask::COLOR0,
            Some(ClearValue::Color(ColorClear::Uint([0; 4]))),
            None,
            Rect::new(0, 0, 128, 128),
        );
        assert!(batch.fast_clear.is_empty());
        assert!(batch.rings.draw.len() > len_before);
        assert!(batch.gmem_reason.contains(GmemReason::CLEAR));
    }

    #[test]
    fn test_partial_clear_degrades_to_quad() {
        let (surfaces, mut batch) = setup();
        batch.record_clear(
            &surfaces,
            AttachmentMask::COLOR0,
            Some(ClearValue::Color(ColorClear::Uint([0; 4]))),
            None,
            Rect::new(16, 16, 32, 32),
        );
        assert!(batch.fast_clear.is_empty());
        assert!(!batch.rings.draw.is_empty());
        // A partial clear leaves the rest of the target undefined by
        // this batch, so a later draw still restores it.
        assert!(!batch.cleared.contains(AttachmentMask::COLOR0));
    }

    #[test]
    fn test_first_draw_sets_restore_for_uncleared() {
        let (surfaces, mut batch) = setup();
        let mut arena = FragmentArena::new();
        let mut cache = StateGroupCache::new();
        batch.record_clear(
            &surfaces,
            AttachmentMask::COLOR0,
            Some(ClearValue::Color(ColorClear::Uint([0; 4]))),
            None,
            Rect::new(0, 0, 128, 128),
        );
        batch.record_draw(&surfaces, &mut arena, &mut cache, &draw_params());
        assert!(!batch.restore.contains(AttachmentMask::COLOR0));
        assert!(batch.restore.contains(AttachmentMask::DEPTH));
    }

    #[test]
    fn test_max_scissor_accumulates() {
        let (surfaces, mut batch) = setup();
        let mut arena = FragmentArena::new();
        let mut cache = StateGroupCache::new();
        let mut params = draw_params();
        params.scissor = Rect::new(0, 0, 16, 16);
        batch.record_draw(&surfaces, &mut arena, &mut cache, &params);
        params.scissor = Rect::new(96, 96, 64, 64);
        batch.record_draw(&surfaces, &mut arena, &mut cache, &params);
        // Second scissor clamped to the framebuffer.
        assert_eq!(batch.render_area(), Rect::new(0, 0, 128, 128));
    }

    #[test]
    fn test_gmem_reason_tracks_pipeline_state() {
        let (surfaces, mut batch) = setup();
        let mut arena = FragmentArena::new();
        let mut cache = StateGroupCache::new();
        let mut params = draw_params();
        params.depth.depth = DepthState {
            test_enable: true,
            write_enable: true,
            compare: CompareOp::Less,
        };
        params.depth.blend_reads_dest = true;
        batch.record_draw(&surfaces, &mut arena, &mut cache, &params);
        assert!(batch.gmem_reason.contains(GmemReason::DEPTH_TEST));
        assert!(batch.gmem_reason.contains(GmemReason::BLEND));
    }
}
