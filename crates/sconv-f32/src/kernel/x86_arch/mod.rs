pub(crate) mod sse;

#[cfg(target_arch = "x86_64")]
pub(crate) mod avx_fma;

use paste::paste;
use sconv_base::cpu_features;

use super::{GemmKernel, KernelCaps};

macro_rules! def_simd_kernel {
    ($name:ident, $micro:path, $tile:expr, $label:literal, $has_feature:path) => {
        paste! {
            /// Only constructible when the running cpu supports the required extension
            #[derive(Copy, Clone, Debug)]
            pub struct [<$name Kernel>] {
                _private: (),
            }

            impl [<$name Kernel>] {
                pub const TILE: usize = $tile;

                pub fn new() -> Option<Self> {
                    if $has_feature() {
                        Some(Self { _private: () })
                    } else {
                        None
                    }
                }
            }

            impl GemmKernel for [<$name Kernel>] {
                fn caps(&self) -> KernelCaps {
                    KernelCaps::new(Self::TILE)
                }

                fn name(&self) -> &'static str {
                    $label
                }

                unsafe fn micro_tile(
                    &self,
                    input: *const f32,
                    input_stride: usize,
                    weight: *const f32,
                    blocks: usize,
                    acc: *mut f32,
                ) {
                    $micro(input, input_stride, weight, blocks, acc)
                }
            }
        }
    };
}

def_simd_kernel!(Sse, sse::micro_4x8, 4, "sse", cpu_features::has_sse);

#[cfg(target_arch = "x86_64")]
def_simd_kernel!(AvxFma, avx_fma::micro_12x8, 12, "avx+fma", cpu_features::has_avx_fma);
