use sconv_base::{ConvError, Result};

use super::{GemmKernel, KernelCaps, C4NUM, C8NUM, MAX_TILE};

/// Portable kernel, used when no simd extension is detected
#[derive(Copy, Clone, Debug)]
pub struct RefKernel {
    tile: usize,
}

impl Default for RefKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl RefKernel {
    pub const DEFAULT_TILE: usize = 8;

    pub fn new() -> Self {
        RefKernel { tile: Self::DEFAULT_TILE }
    }

    /// Reference kernel with a custom tile width, lets callers exercise tile edges
    pub fn with_tile(tile: usize) -> Result<Self> {
        if tile == 0 || tile > MAX_TILE {
            return Err(ConvError::invalid_shape(format!("tile width {} outside 1..={}", tile, MAX_TILE)));
        }
        Ok(RefKernel { tile })
    }
}

impl GemmKernel for RefKernel {
    fn caps(&self) -> KernelCaps {
        KernelCaps::new(self.tile)
    }

    fn name(&self) -> &'static str {
        "reference"
    }

    unsafe fn micro_tile(&self, input: *const f32, input_stride: usize, weight: *const f32, blocks: usize, acc: *mut f32) {
        let tile = self.tile;
        for i in 0..tile * C8NUM {
            *acc.add(i) = 0.0;
        }
        for b in 0..blocks {
            let a = input.add(b * input_stride);
            let w = weight.add(b * C4NUM * C8NUM);
            for t in 0..tile {
                let acc_row = acc.add(t * C8NUM);
                for m in 0..C4NUM {
                    let av = *a.add(t * C4NUM + m);
                    let w_row = w.add(m * C8NUM);
                    for c in 0..C8NUM {
                        *acc_row.add(c) += av * *w_row.add(c);
                    }
                }
            }
        }
    }
}
