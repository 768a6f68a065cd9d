//! Tile geometry.
//!
//! Bin sizes, pipe assignment and on-chip placement are decided by an
//! external planner; this module only carries the result. Bins are
//! addressed as (pipe, slot): the visibility hardware records one stream
//! per pipe, and each bin occupies one slot within its pipe.

use kiln_core::geometry::Rect;

/// Upper bound on visibility pipes supported by the hardware.
pub const MAX_VSC_PIPES: usize = 32;

/// Bins one pipe may hold.
pub const SLOTS_PER_PIPE: u32 = 32;

/// Region of the bin grid covered by one visibility pipe, in bin units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipeConfig {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PipeConfig {
    pub fn bin_count(&self) -> u32 {
        self.width * self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bin {
    pub pipe: u8,
    pub slot: u8,
    /// Pixel region, clamped to the framebuffer at the edges.
    pub rect: Rect<u32>,
}

/// Externally supplied tile geometry for one framebuffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BinLayout {
    pub bin_width: u32,
    pub bin_height: u32,
    pub bins_x: u32,
    pub bins_y: u32,
    pub pipes: Vec<PipeConfig>,
    /// Bins in render order.
    pub bins: Vec<Bin>,
    /// Total on-chip pixels available for the attachments; zero when the
    /// planner could not fit them.
    pub gmem_pixels: u32,
}

impl BinLayout {
    pub fn bin_count(&self) -> u32 {
        self.bins.len() as u32
    }

    pub fn used_pipes(&self) -> u32 {
        self.pipes.len() as u32
    }

    pub fn max_bins_per_pipe(&self) -> u32 {
        self.pipes.iter().map(PipeConfig::bin_count).max().unwrap_or(0)
    }

    pub fn fits_gmem(&self) -> bool {
        self.gmem_pixels > 0
    }

    /// Builds a uniform grid layout: bins row-major, pipes covering runs
    /// of whole rows so no pipe exceeds its slot capacity.
    ///
    /// Real planners balance pipe occupancy better; this is enough for
    /// tests and simple callers.
    pub fn uniform(
        fb_width: u32,
        fb_height: u32,
        bin_width: u32,
        bin_height: u32,
        gmem_pixels: u32,
    ) -> Self {
        assert!(bin_width > 0 && bin_height > 0);
        let bins_x = fb_width.div_ceil(bin_width).max(1);
        let bins_y = fb_height.div_ceil(bin_height).max(1);

        let rows_per_pipe = (bins_x * bins_y)
            .div_ceil(MAX_VSC_PIPES as u32)
            .div_ceil(bins_x)
            .max(1);

        let mut pipes = Vec::new();
        let mut row = 0;
        while row < bins_y {
            let height = rows_per_pipe.min(bins_y - row);
            assert!(
                bins_x * height <= SLOTS_PER_PIPE,
                "pipe would exceed its slot capacity"
            );
            pipes.push(PipeConfig {
                x: 0,
                y: row,
                width: bins_x,
                height,
            });
            row += height;
        }
        assert!(pipes.len() <= MAX_VSC_PIPES);

        let mut bins = Vec::with_capacity((bins_x * bins_y) as usize);
        for by in 0..bins_y {
            for bx in 0..bins_x {
                let pipe = (by / rows_per_pipe) as u8;
                let slot = ((by % rows_per_pipe) * bins_x + bx) as u8;
                let x = bx * bin_width;
                let y = by * bin_height;
                bins.push(Bin {
                    pipe,
                    slot,
                    rect: Rect::new(
                        x,
                        y,
                        bin_width.min(fb_width - x),
                        bin_height.min(fb_height - y),
                    ),
                });
            }
        }

        Self {
            bin_width,
            bin_height,
            bins_x,
            bins_y,
            pipes,
            bins,
            gmem_pixels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layout_edges_clamped() {
        let layout = BinLayout::uniform(100, 70, 32, 32, 1 << 20);
        assert_eq!((layout.bins_x, layout.bins_y), (4, 3));
        assert_eq!(layout.bin_count(), 12);
        let last = layout.bins.last().unwrap();
        assert_eq!(last.rect.width, 100 - 3 * 32);
        assert_eq!(last.rect.height, 70 - 2 * 32);
    }

    #[test]
    fn test_uniform_layout_pipe_capacity() {
        let layout = BinLayout::uniform(2048, 2048, 64, 64, 1 << 20);
        assert!(layout.used_pipes() as usize <= MAX_VSC_PIPES);
        assert!(layout.max_bins_per_pipe() <= SLOTS_PER_PIPE);
        for bin in &layout.bins {
            assert!((bin.slot as u32) < SLOTS_PER_PIPE);
            assert!((bin.pipe as u32) < layout.used_pipes());
        }
    }

    #[test]
    fn test_single_bin_layout() {
        let layout = BinLayout::uniform(64, 64, 64, 64, 1 << 20);
        assert_eq!(layout.bin_count(), 1);
        assert_eq!(layout.used_pipes(), 1);
    }
}
