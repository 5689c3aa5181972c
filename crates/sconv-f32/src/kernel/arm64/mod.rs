pub(crate) mod neon;

use sconv_base::cpu_features;

use super::{GemmKernel, KernelCaps};

/// Only constructible when the running cpu supports neon
#[derive(Copy, Clone, Debug)]
pub struct NeonKernel {
    _private: (),
}

impl NeonKernel {
    pub const TILE: usize = 8;

    pub fn new() -> Option<Self> {
        if cpu_features::has_neon() {
            Some(Self { _private: () })
        } else {
            None
        }
    }
}

impl GemmKernel for NeonKernel {
    fn caps(&self) -> KernelCaps {
        KernelCaps::new(Self::TILE)
    }

    fn name(&self) -> &'static str {
        "neon"
    }

    unsafe fn micro_tile(&self, input: *const f32, input_stride: usize, weight: *const f32, blocks: usize, acc: *mut f32) {
        neon::micro_8x8(input, input_stride, weight, blocks, acc)
    }
}
