use std::arch::x86_64::*;

use seq_macro::seq;

use crate::kernel::{C4NUM, C8NUM};

// 12 ymm accumulators, one per row, leaves room for the weight row and the broadcast
#[target_feature(enable = "avx,fma")]
pub(crate) unsafe fn micro_12x8(input: *const f32, input_stride: usize, weight: *const f32, blocks: usize, acc: *mut f32) {
    let mut c = [_mm256_setzero_ps(); 12];
    for b in 0..blocks {
        let a = input.add(b * input_stride);
        let w = weight.add(b * C4NUM * C8NUM);
        seq!(m in 0..4 {
            let wv = _mm256_loadu_ps(w.add(m * 8));
            for t in 0..12 {
                c[t] = _mm256_fmadd_ps(_mm256_broadcast_ss(&*a.add(t * 4 + m)), wv, c[t]);
            }
        });
    }
    for t in 0..12 {
        _mm256_storeu_ps(acc.add(t * C8NUM), c[t]);
    }
}
