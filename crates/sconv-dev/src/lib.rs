//! Test and benchmark helpers shared by the sconv crates

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

pub fn random_tensor_uniform(arr: &mut [f32]) {
    random_tensor_uniform_seeded(arr, 43);
}

pub fn random_tensor_uniform_seeded(arr: &mut [f32], seed: u64) {
    let mut x = StdRng::seed_from_u64(seed);
    let un_dist = Uniform::new(-1.0f32, 1.0f32);
    for v in arr.iter_mut() {
        *v = un_dist.sample(&mut x);
    }
}

pub trait Diff {
    fn diff(&self, other: &Self) -> f64;
}

impl Diff for f32 {
    fn diff(&self, other: &Self) -> f64 {
        let diff_abs = (self - other).abs();
        let diff_rel = diff_abs / self.abs();
        diff_abs.min(diff_rel) as f64
    }
}

impl Diff for f64 {
    fn diff(&self, other: &Self) -> f64 {
        let diff_abs = (self - other).abs();
        let diff_rel = diff_abs / self.abs();
        diff_abs.min(diff_rel)
    }
}

/// Largest elementwise `min(abs, rel)` error, NaN on either side counts as infinite
pub fn max_abs_diff<T: Copy + Diff>(ap: &[T], bp: &[T]) -> f64 {
    assert_eq!(ap.len(), bp.len(), "compared buffers differ in length");
    let mut diff = 0_f64;
    for (a, b) in ap.iter().zip(bp.iter()) {
        let cur_diff = a.diff(b);
        if cur_diff.is_nan() {
            return f64::INFINITY;
        }
        if cur_diff > diff {
            diff = cur_diff;
        }
    }
    diff
}

pub fn apply_act_fallback(x: f32, relu: bool, relu6: bool) -> f32 {
    if relu6 {
        x.max(0.0).min(6.0)
    } else if relu {
        x.max(0.0)
    } else {
        x
    }
}

/// Plain shape description for the fallback convolution, independent of the operator crate
#[derive(Copy, Clone, Debug)]
pub struct ConvDims {
    pub batch: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub in_c: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub out_c: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub pad_u: usize,
    pub pad_l: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
}

impl ConvDims {
    pub fn input_size(&self) -> usize {
        self.batch * self.in_h * self.in_w * self.in_c
    }

    pub fn weight_size(&self) -> usize {
        self.out_c * self.kernel_h * self.kernel_w * self.in_c
    }

    pub fn output_size(&self) -> usize {
        self.batch * self.out_h * self.out_w * self.out_c
    }
}

/// Naive NHWC convolution with OHWI weights, accumulated in f64
pub fn conv2d_fallback_f32(
    d: &ConvDims,
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    relu: bool,
    relu6: bool,
    output: &mut [f32],
) {
    for b in 0..d.batch {
        for oh in 0..d.out_h {
            for ow in 0..d.out_w {
                for oc in 0..d.out_c {
                    let mut acc = bias.map_or(0.0, |x| x[oc] as f64);
                    for kh in 0..d.kernel_h {
                        let ih = (oh * d.stride_h + kh * d.dilation_h) as isize - d.pad_u as isize;
                        if ih < 0 || ih >= d.in_h as isize {
                            continue;
                        }
                        for kw in 0..d.kernel_w {
                            let iw = (ow * d.stride_w + kw * d.dilation_w) as isize - d.pad_l as isize;
                            if iw < 0 || iw >= d.in_w as isize {
                                continue;
                            }
                            let in_base = ((b * d.in_h + ih as usize) * d.in_w + iw as usize) * d.in_c;
                            let w_base = ((oc * d.kernel_h + kh) * d.kernel_w + kw) * d.in_c;
                            for ic in 0..d.in_c {
                                acc += input[in_base + ic] as f64 * weight[w_base + ic] as f64;
                            }
                        }
                    }
                    let out_idx = ((b * d.out_h + oh) * d.out_w + ow) * d.out_c + oc;
                    output[out_idx] = apply_act_fallback(acc as f32, relu, relu6);
                }
            }
        }
    }
}

/// c = a * b, all row major with explicit leading dimensions
#[allow(clippy::too_many_arguments)]
pub fn matmul_fallback_f32(
    m: usize,
    n: usize,
    k: usize,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
) {
    for i in 0..m {
        for j in 0..n {
            let mut dx = 0.0f64;
            for p in 0..k {
                dx += a[i * lda + p] as f64 * b[p * ldb + j] as f64;
            }
            c[i * ldc + j] = dx as f32;
        }
    }
}

/// Channel counts hitting every remainder of the 4 and 8 wide channel blocks
pub fn generate_channel_dims() -> Vec<usize> {
    vec![1, 3, 4, 5, 8, 13, 16, 19]
}

/// Spatial sizes around a tile width, includes sizes that leave a partial tile
pub fn generate_plane_dims(tile: usize) -> Vec<usize> {
    let mut dims = vec![1, tile.saturating_sub(1).max(1), tile, tile + 1, 2 * tile + 3];
    dims.dedup();
    dims
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_conv_single_value() {
        let d = ConvDims {
            batch: 1,
            in_h: 3,
            in_w: 3,
            in_c: 1,
            out_h: 1,
            out_w: 1,
            out_c: 1,
            kernel_h: 3,
            kernel_w: 3,
            stride_h: 1,
            stride_w: 1,
            pad_u: 0,
            pad_l: 0,
            dilation_h: 1,
            dilation_w: 1,
        };
        let input: Vec<f32> = (1..=9).map(|x| x as f32).collect();
        let weight = vec![1.0f32; 9];
        let mut out = vec![0.0f32; 1];
        conv2d_fallback_f32(&d, &input, &weight, Some(&[0.5]), false, false, &mut out);
        assert_eq!(out[0], 45.5);
    }

    #[test]
    fn max_abs_diff_flags_nan() {
        assert_eq!(max_abs_diff(&[1.0f32, 2.0], &[1.0, 2.0]), 0.0);
        assert!(max_abs_diff(&[1.0f32], &[f32::NAN]).is_infinite());
    }
}
