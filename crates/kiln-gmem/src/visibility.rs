//! Visibility-stream buffer management.
//!
//! The pre-pass records, per pipe, a draw-visibility stream and a
//! primitive stream into fixed-pitch buffers. Sizes are not known up
//! front, so the generated stream carries an overflow probe: after the
//! pre-pass, each pipe's recorded size is compared against its pitch and
//! an overflowing stream tags a shared control word. [`VisStreams::reconcile`]
//! reads that word at the next frame boundary and doubles the losing
//! stream's pitch; the frame that overflowed rendered correctly (the
//! hardware clamps) but conservatively.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::packet::{Packet, StreamKind, VscConfig};
use crate::ring::CmdRing;
use crate::tile::{Bin, BinLayout, MAX_VSC_PIPES};

/// Trailing pad per pipe slot; overflow is detected against
/// `pitch - VSC_PAD` so a clamped write never runs past the slot.
pub const VSC_PAD: u32 = 0x40;

pub const DRAW_STRM_PITCH_MIN: u32 = 0x440;
pub const PRIM_STRM_PITCH_MIN: u32 = 0x1040;

const ALLOC_ALIGN: u32 = 0x1000;

const TAG_MASK: u32 = 0x3;
const TAG_DRAW: u32 = 0x1;
const TAG_PRIM: u32 = 0x3;

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/// The GPU-visible overflow control word. Shared between the generator
/// (which clears it at reconcile) and whatever executes the stream (the
/// hardware, or [`replay`](crate::replay) in tests).
#[derive(Debug, Default)]
pub struct OverflowControl(AtomicU32);

impl OverflowControl {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Models the conditional write: last writer wins, like the memory
    /// write it stands in for.
    pub fn raise(&self, value: u32) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::Relaxed)
    }

    pub fn peek(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct VisStreams {
    draw_pitch: u32,
    prim_pitch: u32,
    allocated: u32,
    allocations: u32,
    control: Arc<OverflowControl>,
}

impl VisStreams {
    pub fn new() -> Self {
        let mut streams = Self {
            draw_pitch: DRAW_STRM_PITCH_MIN,
            prim_pitch: PRIM_STRM_PITCH_MIN,
            allocated: 0,
            allocations: 0,
            control: Arc::new(OverflowControl::new()),
        };
        streams.realloc();
        streams
    }

    pub fn draw_pitch(&self) -> u32 {
        self.draw_pitch
    }

    pub fn prim_pitch(&self) -> u32 {
        self.prim_pitch
    }

    pub fn control(&self) -> Arc<OverflowControl> {
        self.control.clone()
    }

    pub fn allocation_count(&self) -> u32 {
        self.allocations
    }

    pub fn buffer_size(&self) -> u32 {
        self.allocated
    }

    fn required_size(&self) -> u32 {
        let pipes = MAX_VSC_PIPES as u32;
        // Both streams plus the per-pipe recorded-size table.
        align_up(
            pipes * self.draw_pitch + pipes * self.prim_pitch + pipes * 4,
            ALLOC_ALIGN,
        )
    }

    fn realloc(&mut self) {
        let required = self.required_size();
        if required > self.allocated {
            tracing::debug!(
                draw_pitch = self.draw_pitch,
                prim_pitch = self.prim_pitch,
                size = required,
                "visibility streams reallocated"
            );
            self.allocated = required;
            self.allocations += 1;
        }
    }

    /// Grow-only, idempotent capacity request. Pitches are rounded up to
    /// the pad granularity; a request at or below the current pitches
    /// does nothing.
    pub fn ensure_capacity(&mut self, draw_pitch: u32, prim_pitch: u32) {
        self.draw_pitch = self.draw_pitch.max(align_up(draw_pitch, VSC_PAD));
        self.prim_pitch = self.prim_pitch.max(align_up(prim_pitch, VSC_PAD));
        self.realloc();
    }

    pub fn emit_config(&self, ring: &mut CmdRing, layout: &BinLayout) {
        ring.emit(Packet::VscConfig(VscConfig {
            bin_width: layout.bin_width,
            bin_height: layout.bin_height,
            bins_x: layout.bins_x,
            bins_y: layout.bins_y,
            pipes: layout.pipes.clone(),
            draw_pitch: self.draw_pitch,
            draw_limit: self.draw_pitch - VSC_PAD,
            prim_pitch: self.prim_pitch,
            prim_limit: self.prim_pitch - VSC_PAD,
        }));
    }

    /// Stream addressing for one bin.
    pub fn bin_data(&self, bin: &Bin) -> crate::packet::BinData {
        let pipe = bin.pipe as u32;
        crate::packet::BinData {
            pipe: bin.pipe,
            slot: bin.slot,
            draw_offset: pipe * self.draw_pitch,
            size_offset: pipe * 4,
            prim_offset: pipe * self.prim_pitch,
        }
    }

    /// Emits the post-pre-pass overflow probe: per used pipe, one
    /// conditional write per stream, then a drain of pending writes.
    pub fn probe_overflow(&self, ring: &mut CmdRing, used_pipes: u32) {
        debug_assert!(used_pipes as usize <= MAX_VSC_PIPES);
        for pipe in 0..used_pipes as u8 {
            ring.emit(Packet::CondOverflowWrite {
                pipe,
                stream: StreamKind::Draw,
                limit: self.draw_pitch - VSC_PAD,
                value: self.draw_pitch | TAG_DRAW,
            });
            ring.emit(Packet::CondOverflowWrite {
                pipe,
                stream: StreamKind::Prim,
                limit: self.prim_pitch - VSC_PAD,
                value: self.prim_pitch | TAG_PRIM,
            });
        }
        ring.emit(Packet::WaitMemWrites);
    }

    /// Consumes the overflow control word. Returns the stream that grew,
    /// if any. Must only be called at a frame boundary, with no generated
    /// stream still executing.
    pub fn reconcile(&mut self) -> Option<StreamKind> {
        let word = self.control.take();
        if word == 0 {
            return None;
        }
        let size = word & !TAG_MASK;
        let (kind, pitch) = match word & TAG_MASK {
            TAG_DRAW => (StreamKind::Draw, &mut self.draw_pitch),
            TAG_PRIM => (StreamKind::Prim, &mut self.prim_pitch),
            tag => {
                tracing::warn!(word, tag, "unknown visibility overflow tag, ignoring");
                return None;
            }
        };
        if size < *pitch {
            // A report from before the last grow; the current pitch
            // already covers it.
            tracing::debug!(word, pitch = *pitch, "stale visibility overflow report");
            return None;
        }
        *pitch = (*pitch - VSC_PAD) * 2 + VSC_PAD;
        tracing::debug!(?kind, pitch = *pitch, "visibility stream grown");
        self.realloc();
        Some(kind)
    }
}

impl Default for VisStreams {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingKind;

    #[test]
    fn test_ensure_capacity_is_idempotent() {
        let mut vis = VisStreams::new();
        assert_eq!(vis.allocation_count(), 1);
        vis.ensure_capacity(DRAW_STRM_PITCH_MIN, PRIM_STRM_PITCH_MIN);
        vis.ensure_capacity(0x100, 0x100);
        assert_eq!(vis.allocation_count(), 1);
        vis.ensure_capacity(DRAW_STRM_PITCH_MIN * 2, PRIM_STRM_PITCH_MIN);
        assert_eq!(vis.allocation_count(), 2);
    }

    #[test]
    fn test_ensure_capacity_rounds_to_pad() {
        let mut vis = VisStreams::new();
        vis.ensure_capacity(DRAW_STRM_PITCH_MIN + 1, 0);
        assert_eq!(vis.draw_pitch(), DRAW_STRM_PITCH_MIN + VSC_PAD);
    }

    #[test]
    fn test_overflow_grows_with_doubling_progression() {
        let mut vis = VisStreams::new();
        vis.control().raise(DRAW_STRM_PITCH_MIN | TAG_DRAW);
        assert_eq!(vis.reconcile(), Some(StreamKind::Draw));
        assert_eq!(
            vis.draw_pitch(),
            (DRAW_STRM_PITCH_MIN - VSC_PAD) * 2 + VSC_PAD
        );
        assert_eq!(vis.prim_pitch(), PRIM_STRM_PITCH_MIN);
        // Control word was consumed.
        assert_eq!(vis.reconcile(), None);
    }

    #[test]
    fn test_stale_report_is_ignored() {
        let mut vis = VisStreams::new();
        vis.control().raise(DRAW_STRM_PITCH_MIN | TAG_DRAW);
        vis.reconcile();
        let grown = vis.draw_pitch();
        // Report from the frame that ran with the old pitch.
        vis.control().raise(DRAW_STRM_PITCH_MIN | TAG_DRAW);
        assert_eq!(vis.reconcile(), None);
        assert_eq!(vis.draw_pitch(), grown);
    }

    #[test]
    fn test_unknown_tag_is_ignored() {
        let mut vis = VisStreams::new();
        vis.control().raise(0x8000 | 0x2);
        assert_eq!(vis.reconcile(), None);
        assert_eq!(vis.draw_pitch(), DRAW_STRM_PITCH_MIN);
        assert_eq!(vis.control.peek(), 0);
    }

    #[test]
    fn test_prim_stream_grows_independently() {
        let mut vis = VisStreams::new();
        vis.control().raise(PRIM_STRM_PITCH_MIN | TAG_PRIM);
        assert_eq!(vis.reconcile(), Some(StreamKind::Prim));
        assert_eq!(vis.draw_pitch(), DRAW_STRM_PITCH_MIN);
        assert_eq!(
            vis.prim_pitch(),
            (PRIM_STRM_PITCH_MIN - VSC_PAD) * 2 + VSC_PAD
        );
    }

    #[test]
    fn test_probe_emits_two_writes_per_pipe() {
        let vis = VisStreams::new();
        let mut ring = CmdRing::new(RingKind::Frame);
        vis.probe_overflow(&mut ring, 4);
        assert_eq!(ring.len(), 4 * 2 + 1);
        assert_eq!(ring.packets().last(), Some(&Packet::WaitMemWrites));
    }

    #[test]
    fn test_config_limits_leave_pad() {
        let vis = VisStreams::new();
        let layout = BinLayout::uniform(256, 256, 64, 64, 1 << 20);
        let mut ring = CmdRing::new(RingKind::Frame);
        vis.emit_config(&mut ring, &layout);
        match &ring.packets()[0] {
            Packet::VscConfig(cfg) => {
                assert_eq!(cfg.draw_limit, vis.draw_pitch() - VSC_PAD);
                assert_eq!(cfg.prim_limit, vis.prim_pitch() - VSC_PAD);
                assert_eq!(cfg.pipes.len() as u32, layout.used_pipes());
            }
            other => panic!("expected VscConfig, got {other:?}"),
        }
    }
}
