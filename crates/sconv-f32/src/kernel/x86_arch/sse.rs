#[cfg(target_arch = "x86")]
use std::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

use seq_macro::seq;

use crate::kernel::{C4NUM, C8NUM};

// 4 rows x 8 channels, two xmm accumulators per row
#[target_feature(enable = "sse")]
pub(crate) unsafe fn micro_4x8(input: *const f32, input_stride: usize, weight: *const f32, blocks: usize, acc: *mut f32) {
    let mut c = [_mm_setzero_ps(); 8];
    for b in 0..blocks {
        let a = input.add(b * input_stride);
        let w = weight.add(b * C4NUM * C8NUM);
        seq!(m in 0..4 {
            let w_lo = _mm_loadu_ps(w.add(m * 8));
            let w_hi = _mm_loadu_ps(w.add(m * 8 + 4));
            for t in 0..4 {
                let av = _mm_set1_ps(*a.add(t * 4 + m));
                c[2 * t] = _mm_add_ps(c[2 * t], _mm_mul_ps(av, w_lo));
                c[2 * t + 1] = _mm_add_ps(c[2 * t + 1], _mm_mul_ps(av, w_hi));
            }
        });
    }
    for t in 0..4 {
        _mm_storeu_ps(acc.add(t * C8NUM), c[2 * t]);
        _mm_storeu_ps(acc.add(t * C8NUM + 4), c[2 * t + 1]);
    }
}
