//! Software stream interpreter.
//!
//! Walks a frame-level master ring the way the command processor would:
//! following ring calls, honoring visibility conditionals against a
//! supplied [`VisibilityModel`], and performing the overflow probe's
//! conditional writes against the generator's control word. Nothing is
//! rendered; the output is a [`ReplayStats`] describing what would have
//! executed, which is what tests and stream debugging need.

use std::sync::Arc;

use crate::batch::Rings;
use crate::packet::{Packet, RenderMode, StreamKind};
use crate::ring::CmdRing;
use crate::tile::MAX_VSC_PIPES;
use crate::visibility::OverflowControl;
use kiln_core::alloc::HashSet;

/// Stand-in for the visibility data a pre-pass would have written:
/// which (pipe, slot) bins saw geometry, and how many bytes each pipe's
/// streams consumed.
#[derive(Debug, Default)]
pub struct VisibilityModel {
    visible: HashSet<(u8, u8)>,
    draw_used: [u32; MAX_VSC_PIPES],
    prim_used: [u32; MAX_VSC_PIPES],
}

impl VisibilityModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_visible(&mut self, pipe: u8, slot: u8) {
        self.visible.insert((pipe, slot));
    }

    /// Sets the recorded stream sizes for one pipe, in bytes.
    pub fn set_stream_sizes(&mut self, pipe: u8, draw: u32, prim: u32) {
        self.draw_used[pipe as usize] = draw;
        self.prim_used[pipe as usize] = prim;
    }

    fn is_visible(&self, pipe: u8, slot: u8) -> bool {
        self.visible.contains(&(pipe, slot))
    }

    fn used(&self, pipe: u8, stream: StreamKind) -> u32 {
        match stream {
            StreamKind::Draw => self.draw_used[pipe as usize],
            StreamKind::Prim => self.prim_used[pipe as usize],
        }
    }
}

/// What a replayed stream would have executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Tiles the stream selected (guarded or not).
    pub tiles: u32,
    /// Tiles whose guarded body was skipped as empty.
    pub tiles_skipped: u32,
    pub draws: u32,
    pub blits_2d: u32,
    pub blits_3d: u32,
    pub state_packets: u32,
    pub events: u32,
    /// The overflow control word was written during replay.
    pub overflow_raised: bool,
}

impl ReplayStats {
    pub fn tiles_executed(&self) -> u32 {
        self.tiles - self.tiles_skipped
    }
}

pub struct Replayer<'a> {
    rings: &'a Rings,
    vis: &'a VisibilityModel,
    control: Option<Arc<OverflowControl>>,
    override_visibility: bool,
    skipping: bool,
    stats: ReplayStats,
}

impl<'a> Replayer<'a> {
    pub fn new(rings: &'a Rings, vis: &'a VisibilityModel) -> Self {
        Self {
            rings,
            vis,
            control: None,
            override_visibility: false,
            skipping: false,
            stats: ReplayStats::default(),
        }
    }

    /// Wires up the overflow control word so conditional probe writes
    /// land where the generator's reconcile will read them.
    pub fn with_control(mut self, control: Arc<OverflowControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn run(mut self, master: &CmdRing) -> ReplayStats {
        self.walk(master.packets());
        assert!(!self.skipping, "stream ended inside a visibility guard");
        self.stats
    }

    fn walk(&mut self, packets: &[Packet]) {
        for packet in packets {
            if self.skipping {
                if *packet == Packet::CondExecEnd {
                    self.skipping = false;
                }
                continue;
            }
            match packet {
                Packet::Marker(RenderMode::Gmem) => self.stats.tiles += 1,
                Packet::Marker(_) => {}
                Packet::OverrideVisibility(value) => self.override_visibility = *value,
                Packet::CondExecStart { pipe, slot } => {
                    if !self.override_visibility && !self.vis.is_visible(*pipe, *slot) {
                        self.skipping = true;
                        self.stats.tiles_skipped += 1;
                    }
                }
                Packet::CondExecEnd => {}
                Packet::CallRing(kind) => {
                    let ring = self
                        .rings
                        .get(*kind)
                        .unwrap_or_else(|| panic!("stream calls unknown ring {kind:?}"));
                    self.walk(ring.packets());
                }
                Packet::CondOverflowWrite {
                    pipe,
                    stream,
                    limit,
                    value,
                } => {
                    if self.vis.used(*pipe, *stream) >= *limit {
                        if let Some(control) = &self.control {
                            control.raise(*value);
                        }
                        self.stats.overflow_raised = true;
                    }
                }
                Packet::Draw(_) => self.stats.draws += 1,
                Packet::Blit2d(_) => self.stats.blits_2d += 1,
                Packet::Blit3d(_) => self.stats.blits_3d += 1,
                Packet::SetDrawState(_) => self.stats.state_packets += 1,
                Packet::Event(_) => self.stats.events += 1,
                Packet::WindowScissor(_)
                | Packet::WindowOffset { .. }
                | Packet::BinSize { .. }
                | Packet::AutoSkipEmptyTiles(_)
                | Packet::WaitForIdle
                | Packet::WaitForMe
                | Packet::WaitMemWrites
                | Packet::VscConfig(_)
                | Packet::SetBinData(_)
                | Packet::LrzState { .. } => {}
            }
        }
    }
}
