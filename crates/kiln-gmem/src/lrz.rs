//! Low-resolution depth accelerator (LRZ) state machine.
//!
//! The accelerator caches a conservative per-region depth bound so whole
//! quads can be rejected before shading. It only stays coherent while
//! draws test depth in one direction; anything that breaks that promise
//! (direction flips, shader depth writes, stencil side effects) must
//! either stop writing the buffer or invalidate it outright.
//!
//! One tracker lives per batch. It derives a control block per draw, keeps
//! a separate last-emitted snapshot for the visibility pre-pass and the
//! render pass, and folds the surviving validity/direction back into the
//! depth surface when the batch is submitted.

use crate::packet::Packet;
use crate::ring::CmdRing;
use crate::state_group::PassMask;
use crate::surface::LrzState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LrzDirection {
    Unknown,
    Less,
    Greater,
}

/// When depth testing runs relative to the fragment shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthTiming {
    Early,
    /// Early coarse rejection, but the per-sample depth write happens
    /// late because the shader may discard.
    EarlyLrzLateZ,
    Late,
}

/// Per-draw accelerator control, emitted as [`Packet::LrzState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LrzControl {
    pub enable: bool,
    pub write: bool,
    pub direction: LrzDirection,
    pub timing: DepthTiming,
}

impl LrzControl {
    pub const DISABLED: Self = Self {
        enable: false,
        write: false,
        direction: LrzDirection::Unknown,
        timing: DepthTiming::Early,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthState {
    pub test_enable: bool,
    pub write_enable: bool,
    pub compare: CompareOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilState {
    pub enable: bool,
    pub compare_front: CompareOp,
    pub compare_back: CompareOp,
    pub write_mask: u8,
}

impl StencilState {
    pub const DISABLED: Self = Self {
        enable: false,
        compare_front: CompareOp::Always,
        compare_back: CompareOp::Always,
        write_mask: 0,
    };
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderFlags: u8 {
        /// Shader may discard fragments.
        const KILL = 1 << 0;
        /// Shader writes its own depth.
        const WRITES_DEPTH = 1 << 1;
        /// Shader writes the sample mask.
        const WRITES_SAMPLE_MASK = 1 << 2;
    }
}

/// Everything the tracker needs to know about the bound pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineDepthInfo {
    pub depth: DepthState,
    pub stencil: StencilState,
    pub shader: ShaderFlags,
    /// Any render target blend that reads the destination.
    pub blend_reads_dest: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrzPass {
    Binning = 0,
    Render = 1,
}

/// Control blocks for one draw. The pre-pass variant ignores blend-based
/// write disables: the pre-pass renders no color, so a blend that reads
/// the destination is harmless there and the extra writes sharpen the
/// accelerator for the tile passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LrzDecision {
    pub render: LrzControl,
    pub binning: LrzControl,
}

pub struct LrzTracker {
    valid: bool,
    prev_dir: LrzDirection,
    last_emitted: [Option<LrzControl>; 2],
}

fn direction_of(compare: CompareOp) -> Option<LrzDirection> {
    match compare {
        CompareOp::Greater | CompareOp::GreaterOrEqual => Some(LrzDirection::Greater),
        CompareOp::Less | CompareOp::LessOrEqual => Some(LrzDirection::Less),
        _ => None,
    }
}

impl LrzTracker {
    pub fn new(state: LrzState) -> Self {
        Self {
            valid: state.valid,
            prev_dir: state.direction,
            last_emitted: [None, None],
        }
    }

    /// Validity and direction of record to fold back into the surface.
    pub fn state(&self) -> LrzState {
        LrzState {
            valid: self.valid,
            direction: self.prev_dir,
        }
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Derives the control blocks for a draw and applies their side
    /// effects (invalidation, direction tracking).
    pub fn assess(&mut self, info: &PipelineDepthInfo) -> LrzDecision {
        if !info.depth.test_enable {
            // Depth writes are gated on the test; nothing to accelerate
            // and nothing that could corrupt the buffer.
            return LrzDecision {
                render: LrzControl::DISABLED,
                binning: LrzControl::DISABLED,
            };
        }

        let dir = direction_of(info.depth.compare);
        let mut enable = true;
        let mut write = info.depth.write_enable;
        let mut invalidate = false;

        match info.depth.compare {
            // No single direction: the test tells the accelerator
            // nothing, and the bounds cannot be trusted afterwards.
            CompareOp::Always | CompareOp::NotEqual => {
                write = false;
                invalidate = true;
            }
            CompareOp::Equal | CompareOp::Never => {
                write = false;
            }
            _ => {}
        }

        if let Some(d) = dir
            && self.prev_dir != LrzDirection::Unknown
            && self.prev_dir != d
        {
            // Direction flipped against the direction of record: the
            // cached bounds are stale for this test, write or not.
            invalidate = true;
        }

        if info.stencil.enable && info.stencil.write_mask != 0 {
            let hostile = |c: CompareOp| !matches!(c, CompareOp::Always | CompareOp::Never);
            if hostile(info.stencil.compare_front) || hostile(info.stencil.compare_back) {
                // Coarse rejection would skip stencil writes that must
                // happen for depth-failing fragments.
                enable = false;
                write = false;
                invalidate = true;
            } else {
                write = false;
            }
        }

        if info.shader.contains(ShaderFlags::WRITES_DEPTH) {
            enable = false;
            write = false;
            invalidate = true;
        }
        if info
            .shader
            .intersects(ShaderFlags::KILL | ShaderFlags::WRITES_SAMPLE_MASK)
        {
            write = false;
        }

        let timing = if info.shader.contains(ShaderFlags::WRITES_DEPTH) {
            DepthTiming::Late
        } else if info.shader.contains(ShaderFlags::KILL) && info.depth.write_enable {
            DepthTiming::EarlyLrzLateZ
        } else {
            DepthTiming::Early
        };

        if invalidate {
            tracing::debug!(?info.depth.compare, "lrz invalidated");
            self.valid = false;
        }
        if !self.valid {
            enable = false;
            write = false;
        }

        if let Some(d) = dir {
            self.prev_dir = d;
        }

        let direction = if enable {
            dir.unwrap_or(LrzDirection::Unknown)
        } else {
            LrzDirection::Unknown
        };

        let binning = LrzControl {
            enable,
            write,
            direction,
            timing,
        };
        let render = LrzControl {
            write: write && !info.blend_reads_dest,
            ..binning
        };
        LrzDecision { render, binning }
    }

    /// Emits the control block for one pass unless it matches what that
    /// pass last saw. Returns whether a packet was emitted.
    pub fn emit(&mut self, pass: LrzPass, ctl: LrzControl, ring: &mut CmdRing) -> bool {
        let idx = pass as usize;
        if self.last_emitted[idx] == Some(ctl) {
            return false;
        }
        self.last_emitted[idx] = Some(ctl);
        let enable = match pass {
            LrzPass::Binning => PassMask::BINNING,
            LrzPass::Render => PassMask::GMEM | PassMask::SYSMEM,
        };
        ring.emit(Packet::LrzState { enable, ctl });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingKind;

    fn valid_tracker(direction: LrzDirection) -> LrzTracker {
        LrzTracker::new(LrzState {
            valid: true,
            direction,
        })
    }

    fn draw(compare: CompareOp, write: bool) -> PipelineDepthInfo {
        PipelineDepthInfo {
            depth: DepthState {
                test_enable: true,
                write_enable: write,
                compare,
            },
            stencil: StencilState::DISABLED,
            shader: ShaderFlags::empty(),
            blend_reads_dest: false,
        }
    }

    #[test]
    fn test_directional_draw_enables_and_writes() {
        let mut tracker = valid_tracker(LrzDirection::Unknown);
        let d = tracker.assess(&draw(CompareOp::Less, true));
        assert!(d.render.enable && d.render.write);
        assert_eq!(d.render.direction, LrzDirection::Less);
        assert_eq!(tracker.state().direction, LrzDirection::Less);
    }

    #[test]
    fn test_direction_flip_invalidates() {
        let mut tracker = valid_tracker(LrzDirection::Less);
        let d = tracker.assess(&draw(CompareOp::Greater, true));
        assert!(!tracker.state().valid);
        assert!(!d.render.enable);
    }

    #[test]
    fn test_same_direction_family_keeps_valid() {
        let mut tracker = valid_tracker(LrzDirection::Less);
        let d = tracker.assess(&draw(CompareOp::LessOrEqual, true));
        assert!(tracker.state().valid);
        assert!(d.render.enable && d.render.write);
    }

    #[test]
    fn test_read_only_flip_invalidates() {
        let mut tracker = valid_tracker(LrzDirection::Less);
        let d = tracker.assess(&draw(CompareOp::Greater, false));
        // Coarse rejection of a Greater test against Less-written bounds
        // would be wrong even without a depth write.
        assert!(!tracker.state().valid);
        assert!(!d.render.enable);
        assert!(!d.render.write);
    }

    #[test]
    fn test_direction_of_record_tracks_read_only_draws() {
        let mut tracker = valid_tracker(LrzDirection::Unknown);
        tracker.assess(&draw(CompareOp::Greater, false));
        assert_eq!(tracker.state().direction, LrzDirection::Greater);
        assert!(tracker.state().valid);
    }

    #[test]
    fn test_always_and_not_equal_invalidate_regardless_of_write() {
        for (compare, write) in [
            (CompareOp::Always, true),
            (CompareOp::Always, false),
            (CompareOp::NotEqual, false),
        ] {
            let mut tracker = valid_tracker(LrzDirection::Less);
            let d = tracker.assess(&draw(compare, write));
            assert!(!tracker.state().valid, "{compare:?} write={write}");
            assert!(!d.render.enable);
            assert!(!d.render.write);
        }
    }

    #[test]
    fn test_equal_disables_write_only() {
        let mut tracker = valid_tracker(LrzDirection::Less);
        let d = tracker.assess(&draw(CompareOp::Equal, true));
        assert!(tracker.state().valid);
        assert!(d.render.enable);
        assert!(!d.render.write);
    }

    #[test]
    fn test_blend_disables_render_write_not_binning() {
        let mut tracker = valid_tracker(LrzDirection::Unknown);
        let mut info = draw(CompareOp::Less, true);
        info.blend_reads_dest = true;
        let d = tracker.assess(&info);
        assert!(!d.render.write);
        assert!(d.binning.write);
    }

    #[test]
    fn test_stencil_side_effects_disable_and_invalidate() {
        let mut tracker = valid_tracker(LrzDirection::Less);
        let mut info = draw(CompareOp::Less, true);
        info.stencil = StencilState {
            enable: true,
            compare_front: CompareOp::Equal,
            compare_back: CompareOp::Always,
            write_mask: 0xff,
        };
        let d = tracker.assess(&info);
        assert!(!d.render.enable);
        assert!(!tracker.state().valid);
    }

    #[test]
    fn test_stencil_always_pass_disables_write_only() {
        let mut tracker = valid_tracker(LrzDirection::Less);
        let mut info = draw(CompareOp::Less, true);
        info.stencil = StencilState {
            enable: true,
            compare_front: CompareOp::Always,
            compare_back: CompareOp::Always,
            write_mask: 0xff,
        };
        let d = tracker.assess(&info);
        assert!(d.render.enable);
        assert!(!d.render.write);
        assert!(tracker.state().valid);
    }

    #[test]
    fn test_shader_depth_write_goes_late_and_invalidates() {
        let mut tracker = valid_tracker(LrzDirection::Less);
        let mut info = draw(CompareOp::Less, true);
        info.shader = ShaderFlags::WRITES_DEPTH;
        let d = tracker.assess(&info);
        assert!(!d.render.enable);
        assert_eq!(d.render.timing, DepthTiming::Late);
        assert!(!tracker.state().valid);
    }

    #[test]
    fn test_discard_forces_late_z_write() {
        let mut tracker = valid_tracker(LrzDirection::Less);
        let mut info = draw(CompareOp::Less, true);
        info.shader = ShaderFlags::KILL;
        let d = tracker.assess(&info);
        assert!(d.render.enable);
        assert!(!d.render.write);
        assert_eq!(d.render.timing, DepthTiming::EarlyLrzLateZ);
    }

    #[test]
    fn test_invalid_surface_stays_disabled() {
        let mut tracker = LrzTracker::new(LrzState::default());
        let d = tracker.assess(&draw(CompareOp::Less, true));
        assert!(!d.render.enable);
        assert!(!d.binning.write);
    }

    #[test]
    fn test_emit_skips_identical_state() {
        let mut tracker = valid_tracker(LrzDirection::Unknown);
        let mut ring = CmdRing::new(RingKind::Draw);
        let d = tracker.assess(&draw(CompareOp::Less, true));
        assert!(tracker.emit(LrzPass::Render, d.render, &mut ring));
        assert!(!tracker.emit(LrzPass::Render, d.render, &mut ring));
        // A different pass keeps its own snapshot.
        assert!(tracker.emit(LrzPass::Binning, d.binning, &mut ring));
        assert_eq!(ring.len(), 2);
    }
}
