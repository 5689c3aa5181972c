use std::arch::aarch64::*;

use seq_macro::seq;

use crate::kernel::{C4NUM, C8NUM};

#[target_feature(enable = "neon")]
pub(crate) unsafe fn micro_8x8(input: *const f32, input_stride: usize, weight: *const f32, blocks: usize, acc: *mut f32) {
    let mut c = [vdupq_n_f32(0.0); 16];
    for b in 0..blocks {
        let a = input.add(b * input_stride);
        let w = weight.add(b * C4NUM * C8NUM);
        seq!(m in 0..4 {
            let w_lo = vld1q_f32(w.add(m * 8));
            let w_hi = vld1q_f32(w.add(m * 8 + 4));
            for t in 0..8 {
                let av = vdupq_n_f32(*a.add(t * 4 + m));
                c[2 * t] = vfmaq_f32(c[2 * t], w_lo, av);
                c[2 * t + 1] = vfmaq_f32(c[2 * t + 1], w_hi, av);
            }
        });
    }
    for t in 0..8 {
        vst1q_f32(acc.add(t * C8NUM), c[2 * t]);
        vst1q_f32(acc.add(t * C8NUM + 4), c[2 * t + 1]);
    }
}
