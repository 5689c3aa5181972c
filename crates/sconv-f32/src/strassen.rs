//! 1x1 convolution as a block matrix multiply.
//!
//! Operands live in panel layouts: A is `[deep][row][4]`, B is `[col][deep][4][8]`
//! and C is `[col][row][8]`, where `deep` counts input channel blocks of 4 and
//! `col` counts output channel blocks of 8. Quadrants of a panel matrix are again
//! panel matrices with the same stride, so the recursion never repacks operands.

use std::ops::Range;

use sconv_base::{check_len, cpu_features, split_range, ConvError, RangeLock, Result, SCONV_STRASSEN_MAX_DEPTH};

use crate::conv_parameter::ConvParameter;
use crate::kernel::{ActType, GemmArgs, GemmKernel, GemmLayout, WriteMode, C4NUM, C8NUM};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StrassenMatMulParameter {
    /// spatial rows, batch included
    pub row: usize,
    /// output channel blocks of 8
    pub col: usize,
    /// input channel blocks of 4
    pub deep: usize,
    /// distance between consecutive deep panels of A
    pub a_stride: usize,
    /// distance between consecutive col blocks of B
    pub b_stride: usize,
    /// distance between consecutive col blocks of C
    pub c_stride: usize,
    /// recursion cap
    pub max_depth: usize,
}

impl StrassenMatMulParameter {
    /// Dense panels for a pointwise convolution, recursion capped by `SCONV_STRASSEN_MAX_DEPTH`
    pub fn from_conv(conv_param: &ConvParameter) -> Self {
        let row = conv_param.input_batch * conv_param.output_plane();
        let deep = conv_param.ic4();
        StrassenMatMulParameter {
            row,
            col: conv_param.oc8(),
            deep,
            a_stride: row * C4NUM,
            b_stride: deep * C4NUM * C8NUM,
            c_stride: row * C8NUM,
            max_depth: *SCONV_STRASSEN_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// The matmul has to describe the same problem as the convolution
    pub fn check_conv(&self, conv_param: &ConvParameter) -> Result<()> {
        if !conv_param.is_pointwise() {
            return Err(ConvError::invalid_shape("1x1 path needs a 1x1 kernel, stride 1 and no padding"));
        }
        let row = conv_param.input_batch * conv_param.input_plane();
        if self.row != row || self.col != conv_param.oc8() || self.deep != conv_param.ic4() {
            return Err(ConvError::invalid_shape(format!(
                "matmul {}x{}x{} does not match convolution {}x{}x{}",
                self.row,
                self.deep,
                self.col,
                row,
                conv_param.ic4(),
                conv_param.oc8()
            )));
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.deep == 0 {
            return Err(ConvError::invalid_shape("matmul with empty reduction"));
        }
        if self.a_stride < self.row * C4NUM || self.b_stride < self.deep * C4NUM * C8NUM || self.c_stride < self.row * C8NUM
        {
            return Err(ConvError::invalid_shape(format!(
                "panel strides {}/{}/{} overlap for {}x{}x{}",
                self.a_stride, self.b_stride, self.c_stride, self.row, self.deep, self.col
            )));
        }
        Ok(())
    }

    pub fn a_len(&self) -> usize {
        match self.deep {
            0 => 0,
            d => (d - 1) * self.a_stride + self.row * C4NUM,
        }
    }

    pub fn b_len(&self) -> usize {
        match self.col {
            0 => 0,
            c => (c - 1) * self.b_stride + self.deep * C4NUM * C8NUM,
        }
    }

    pub fn c_len(&self) -> usize {
        match self.col {
            0 => 0,
            c => (c - 1) * self.c_stride + self.row * C8NUM,
        }
    }

    fn dims(&self) -> MatDims {
        MatDims { row: self.row, deep: self.deep, col: self.col }
    }
}

#[derive(Copy, Clone, Debug)]
struct MatDims {
    row: usize,
    deep: usize,
    col: usize,
}

impl MatDims {
    fn half(self) -> Self {
        MatDims { row: self.row / 2, deep: self.deep / 2, col: self.col / 2 }
    }

    fn mul_cost(self) -> usize {
        2 * self.row * self.deep * C4NUM * self.col * C8NUM
    }

    // 18 additions of one level, counted on the quadrant sizes
    fn add_cost(self) -> usize {
        5 * self.row * self.deep * C4NUM + 5 * self.deep * self.col * C4NUM * C8NUM + 8 * self.row * self.col * C8NUM
    }
}

fn recursion_pays_off(d: MatDims, tile: usize) -> bool {
    if d.row % 2 != 0 || d.deep % 2 != 0 || d.col % 2 != 0 {
        return false;
    }
    let h = d.half();
    if h.row < tile {
        return false;
    }
    7 * h.mul_cost() + h.add_cost() < d.mul_cost()
}

/// Number of recursion levels used for `param` with a kernel of `tile` rows
pub fn strassen_depth(param: &StrassenMatMulParameter, tile: usize) -> usize {
    let mut d = param.dims();
    let mut depth = 0;
    while depth < param.max_depth && recursion_pays_off(d, tile) {
        d = d.half();
        depth += 1;
    }
    depth
}

fn tmp_size(d: MatDims, depth: usize, tile: usize) -> usize {
    if depth == 0 {
        return tile * d.deep * C4NUM + d.col * tile * C8NUM;
    }
    let h = d.half();
    h.row * h.deep * C4NUM + h.deep * h.col * C4NUM * C8NUM + h.row * h.col * C8NUM + tmp_size(h, depth - 1, tile)
}

/// Scratch elements `conv1x1_fp32` needs for `param` with a kernel of `tile` rows
pub fn strassen_tmp_size(param: &StrassenMatMulParameter, tile: usize) -> usize {
    tmp_size(param.dims(), strassen_depth(param, tile), tile)
}

/// Scratch elements every task of [`conv1x1_fp32_task`] needs. A task recurses on its own
/// column share, which can be deeper than the whole problem when `col` is odd.
pub fn strassen_task_tmp_size(param: &StrassenMatMulParameter, tile: usize, thread_num: usize) -> usize {
    (0..thread_num)
        .filter_map(|task_id| task_share(param, task_id, thread_num))
        .map(|(_, sub)| strassen_tmp_size(&sub, tile))
        .max()
        .unwrap_or(0)
}

// first C block and column sub-problem of one task, `None` when the share is empty
fn task_share(
    param: &StrassenMatMulParameter,
    task_id: usize,
    thread_num: usize,
) -> Option<(usize, StrassenMatMulParameter)> {
    let (c0, c1) = split_range(param.col, 1, task_id, thread_num);
    if c0 >= c1 || param.row == 0 {
        return None;
    }
    Some((c0, StrassenMatMulParameter { col: c1 - c0, ..*param }))
}

/// `count` panels of `len` contiguous elements, `stride` apart
#[derive(Copy, Clone, Debug)]
struct Panels {
    off: usize,
    stride: usize,
    count: usize,
    len: usize,
}

impl Panels {
    fn at(&self, p: usize) -> Range<usize> {
        let s = self.off + p * self.stride;
        s..s + self.len
    }
}

fn panels_add(dst: &mut [f32], d: Panels, x: &[f32], xp: Panels, y: &[f32], yp: Panels, sub: bool) {
    for p in 0..d.count {
        let it = dst[d.at(p)].iter_mut().zip(&x[xp.at(p)]).zip(&y[yp.at(p)]);
        if sub {
            it.for_each(|((o, a), b)| *o = a - b);
        } else {
            it.for_each(|((o, a), b)| *o = a + b);
        }
    }
}

fn panels_copy(dst: &mut [f32], d: Panels, src: &[f32], sp: Panels) {
    for p in 0..d.count {
        dst[d.at(p)].copy_from_slice(&src[sp.at(p)]);
    }
}

fn panels_acc(dst: &mut [f32], d: Panels, src: &[f32], sp: Panels, sub: bool) {
    for p in 0..d.count {
        let it = dst[d.at(p)].iter_mut().zip(&src[sp.at(p)]);
        if sub {
            it.for_each(|(o, s)| *o -= s);
        } else {
            it.for_each(|(o, s)| *o += s);
        }
    }
}

#[derive(Copy, Clone)]
struct Operand<'a> {
    data: &'a [f32],
    off: usize,
    stride: usize,
}

impl<'a> Operand<'a> {
    fn with_off(self, off: usize) -> Self {
        Operand { off, ..self }
    }
}

fn matmul_base<K: GemmKernel + ?Sized>(
    a: Operand<'_>,
    b: Operand<'_>,
    c: &mut [f32],
    c_off: usize,
    c_stride: usize,
    d: MatDims,
    tmp: &mut [f32],
    kernel: &K,
) -> Result<()> {
    let tile = kernel.caps().tile_num;
    let (_, _, kc) = cpu_features::get_cache_params();
    let deep_chunk = (kc / C4NUM).max(1);
    let oc = d.col * C8NUM;
    let mut r0 = 0;
    while r0 < d.row {
        let real = (d.row - r0).min(tile);
        if real == tile {
            let mut d0 = 0;
            while d0 < d.deep {
                let d_len = (d.deep - d0).min(deep_chunk);
                let args = GemmArgs {
                    step: 1,
                    ic4: d_len,
                    output_channel: oc,
                    offset: c_stride,
                    input_stride: a.stride,
                    weight_stride: b.stride,
                    layout: GemmLayout::Blocked,
                    write: if d0 == 0 { WriteMode::Overwrite } else { WriteMode::Accumulate },
                    act: ActType::Identity,
                };
                let input = &a.data[a.off + d0 * a.stride + r0 * C4NUM..];
                let weight = &b.data[b.off + d0 * C4NUM * C8NUM..];
                kernel.gemm(&mut c[c_off + r0 * C8NUM..], input, weight, None, &args)?;
                d0 += d_len;
            }
        } else {
            // last rows: pad to a full tile in scratch
            let (tile_in, rest) = tmp.split_at_mut(tile * d.deep * C4NUM);
            let tile_out = &mut rest[..d.col * tile * C8NUM];
            for (k, dst) in tile_in.chunks_exact_mut(tile * C4NUM).enumerate() {
                let s = a.off + k * a.stride + r0 * C4NUM;
                dst[..real * C4NUM].copy_from_slice(&a.data[s..s + real * C4NUM]);
                dst[real * C4NUM..].fill(0.0);
            }
            let args = GemmArgs {
                step: 1,
                ic4: d.deep,
                output_channel: oc,
                offset: tile * C8NUM,
                input_stride: tile * C4NUM,
                weight_stride: b.stride,
                layout: GemmLayout::Blocked,
                write: WriteMode::Overwrite,
                act: ActType::Identity,
            };
            kernel.gemm(tile_out, tile_in, &b.data[b.off..], None, &args)?;
            for j in 0..d.col {
                let o = c_off + j * c_stride + r0 * C8NUM;
                c[o..o + real * C8NUM].copy_from_slice(&tile_out[j * tile * C8NUM..][..real * C8NUM]);
            }
        }
        r0 += real;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn strassen_mul<K: GemmKernel + ?Sized>(
    a: Operand<'_>,
    b: Operand<'_>,
    c: &mut [f32],
    c_off: usize,
    c_stride: usize,
    d: MatDims,
    depth: usize,
    tmp: &mut [f32],
    kernel: &K,
) -> Result<()> {
    if depth == 0 {
        return matmul_base(a, b, c, c_off, c_stride, d, tmp, kernel);
    }
    let h = d.half();
    let (s_stride, t_stride, m_stride) = (h.row * C4NUM, h.deep * C4NUM * C8NUM, h.row * C8NUM);
    let (s_buf, rest) = tmp.split_at_mut(h.deep * s_stride);
    let (t_buf, rest) = rest.split_at_mut(h.col * t_stride);
    let (m_buf, child) = rest.split_at_mut(h.col * m_stride);

    // A(i, j): row half i, deep half j; B(i, j): deep half i, col half j; C(i, j): row half i, col half j
    let aq = |i: usize, j: usize| Panels {
        off: a.off + j * h.deep * a.stride + i * h.row * C4NUM,
        stride: a.stride,
        count: h.deep,
        len: h.row * C4NUM,
    };
    let bq = |i: usize, j: usize| Panels {
        off: b.off + j * h.col * b.stride + i * h.deep * C4NUM * C8NUM,
        stride: b.stride,
        count: h.col,
        len: h.deep * C4NUM * C8NUM,
    };
    let cq = |i: usize, j: usize| Panels {
        off: c_off + j * h.col * c_stride + i * h.row * C8NUM,
        stride: c_stride,
        count: h.col,
        len: h.row * C8NUM,
    };
    let s_p = Panels { off: 0, stride: s_stride, count: h.deep, len: h.row * C4NUM };
    let t_p = Panels { off: 0, stride: t_stride, count: h.col, len: h.deep * C4NUM * C8NUM };
    let m_p = Panels { off: 0, stride: m_stride, count: h.col, len: h.row * C8NUM };
    let (ad, bd) = (a.data, b.data);

    macro_rules! mul {
        ($x:expr, $y:expr) => {
            strassen_mul($x, $y, m_buf, 0, m_stride, h, depth - 1, child, kernel)?
        };
    }
    macro_rules! s_op {
        () => {
            Operand { data: &*s_buf, off: 0, stride: s_stride }
        };
    }
    macro_rules! t_op {
        () => {
            Operand { data: &*t_buf, off: 0, stride: t_stride }
        };
    }

    // M1 = (A11 + A22)(B11 + B22)
    panels_add(s_buf, s_p, ad, aq(0, 0), ad, aq(1, 1), false);
    panels_add(t_buf, t_p, bd, bq(0, 0), bd, bq(1, 1), false);
    mul!(s_op!(), t_op!());
    panels_copy(c, cq(0, 0), m_buf, m_p);
    panels_copy(c, cq(1, 1), m_buf, m_p);

    // M2 = (A21 + A22) B11
    panels_add(s_buf, s_p, ad, aq(1, 0), ad, aq(1, 1), false);
    mul!(s_op!(), b.with_off(bq(0, 0).off));
    panels_copy(c, cq(1, 0), m_buf, m_p);
    panels_acc(c, cq(1, 1), m_buf, m_p, true);

    // M3 = A11 (B12 - B22)
    panels_add(t_buf, t_p, bd, bq(0, 1), bd, bq(1, 1), true);
    mul!(a.with_off(aq(0, 0).off), t_op!());
    panels_copy(c, cq(0, 1), m_buf, m_p);
    panels_acc(c, cq(1, 1), m_buf, m_p, false);

    // M4 = A22 (B21 - B11)
    panels_add(t_buf, t_p, bd, bq(1, 0), bd, bq(0, 0), true);
    mul!(a.with_off(aq(1, 1).off), t_op!());
    panels_acc(c, cq(0, 0), m_buf, m_p, false);
    panels_acc(c, cq(1, 0), m_buf, m_p, false);

    // M5 = (A11 + A12) B22
    panels_add(s_buf, s_p, ad, aq(0, 0), ad, aq(0, 1), false);
    mul!(s_op!(), b.with_off(bq(1, 1).off));
    panels_acc(c, cq(0, 0), m_buf, m_p, true);
    panels_acc(c, cq(0, 1), m_buf, m_p, false);

    // M6 = (A21 - A11)(B11 + B12)
    panels_add(s_buf, s_p, ad, aq(1, 0), ad, aq(0, 0), true);
    panels_add(t_buf, t_p, bd, bq(0, 0), bd, bq(0, 1), false);
    mul!(s_op!(), t_op!());
    panels_acc(c, cq(1, 1), m_buf, m_p, false);

    // M7 = (A12 - A22)(B21 + B22)
    panels_add(s_buf, s_p, ad, aq(0, 1), ad, aq(1, 1), true);
    panels_add(t_buf, t_p, bd, bq(1, 0), bd, bq(1, 1), false);
    mul!(s_op!(), t_op!());
    panels_acc(c, cq(0, 0), m_buf, m_p, false);

    Ok(())
}

/// C = A * B over the whole of `matmul_param`, result in `[col][row][8]` blocks of `output`.
/// Bias and activation are applied afterwards by [`crate::pack::post_conv_fp32`].
pub fn conv1x1_fp32<K: GemmKernel + ?Sized>(
    input: &[f32],
    weight: &[f32],
    output: &mut [f32],
    tmp: &mut [f32],
    matmul_param: &StrassenMatMulParameter,
    kernel: &K,
) -> Result<()> {
    let param = matmul_param;
    param.check()?;
    if param.row == 0 || param.col == 0 {
        return Ok(());
    }
    check_len("input", input, param.a_len())?;
    check_len("weight", weight, param.b_len())?;
    check_len("output", output, param.c_len())?;
    let tile = kernel.caps().tile_num;
    let depth = strassen_depth(param, tile);
    check_len("tmp", tmp, tmp_size(param.dims(), depth, tile))?;
    log::trace!("1x1 matmul row {} deep {} col {}, strassen depth {}", param.row, param.deep, param.col, depth);
    let a = Operand { data: input, off: 0, stride: param.a_stride };
    let b = Operand { data: weight, off: 0, stride: param.b_stride };
    strassen_mul(a, b, output, 0, param.c_stride, param.dims(), depth, tmp, kernel)
}

/// Task share of [`conv1x1_fp32`]: output channel blocks are split across `thread_num` tasks,
/// each task owns a contiguous run of C blocks claimed through `output`.
/// `tmp` has to be private to the task and sized with [`strassen_task_tmp_size`].
#[allow(clippy::too_many_arguments)]
pub fn conv1x1_fp32_task<K: GemmKernel + ?Sized>(
    input: &[f32],
    weight: &[f32],
    output: &RangeLock<'_, f32>,
    tmp: &mut [f32],
    matmul_param: &StrassenMatMulParameter,
    task_id: usize,
    thread_num: usize,
    kernel: &K,
) -> Result<()> {
    let param = matmul_param;
    if task_id >= thread_num {
        return Err(ConvError::InvalidTask { task_id, thread_num });
    }
    param.check()?;
    let Some((c0, sub)) = task_share(param, task_id, thread_num) else {
        return Ok(());
    };
    check_len("weight", weight, param.b_len())?;
    let start = c0 * param.c_stride;
    let mut guard = output.write(start, start + sub.c_len())?;
    conv1x1_fp32(input, &weight[c0 * param.b_stride..], guard.get(), tmp, &sub, kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelSelector, RefKernel};
    use crate::pack::{pack_nhwc_to_c4_panels, pack_weight_fp32, packed_weight_size, post_conv_fp32};
    use sconv_dev::{matmul_fallback_f32, max_abs_diff, random_tensor_uniform, random_tensor_uniform_seeded};

    const EPS: f64 = 1e-4;

    struct Problem {
        param: ConvParameter,
        input: Vec<f32>,
        weight: Vec<f32>,
        a: Vec<f32>,
        b: Vec<f32>,
    }

    fn problem(row: usize, ic: usize, oc: usize) -> Problem {
        let param = ConvParameter::new(1, row, 1, ic, oc, 1, 1);
        let mut input = vec![0f32; row * ic];
        let mut weight = vec![0f32; oc * ic];
        random_tensor_uniform(&mut input);
        random_tensor_uniform_seeded(&mut weight, 5);
        let mut a = vec![0f32; param.ic4() * row * C4NUM];
        pack_nhwc_to_c4_panels(&input, &mut a, row, ic).unwrap();
        let mut b = vec![0f32; packed_weight_size(&param)];
        pack_weight_fp32(&weight, &mut b, &param).unwrap();
        Problem { param, input, weight, a, b }
    }

    // input [row][ic] times weight^T [ic][oc]
    fn expected(p: &Problem) -> Vec<f32> {
        let (row, ic, oc) = (p.param.input_h, p.param.input_channel, p.param.output_channel);
        let mut wt = vec![0f32; ic * oc];
        for o in 0..oc {
            for i in 0..ic {
                wt[i * oc + o] = p.weight[o * ic + i];
            }
        }
        let mut c = vec![0f32; row * oc];
        matmul_fallback_f32(row, oc, ic, &p.input, ic, &wt, oc, &mut c, oc);
        c
    }

    fn run(p: &Problem, mp: &StrassenMatMulParameter, kernel: &dyn GemmKernel) -> Vec<f32> {
        let tile = kernel.caps().tile_num;
        let mut c = vec![0f32; mp.c_len()];
        let mut tmp = vec![0f32; strassen_tmp_size(mp, tile)];
        conv1x1_fp32(&p.a, &p.b, &mut c, &mut tmp, mp, kernel).unwrap();
        let mut out = vec![0f32; mp.row * p.param.output_channel];
        post_conv_fp32(&c, &mut out, None, p.param.output_channel, mp.row, mp.c_stride, ActType::Identity).unwrap();
        out
    }

    #[test]
    fn four_channel_two_by_two_matches_matmul() {
        let param = ConvParameter::new(1, 2, 2, 4, 4, 1, 1);
        let input: Vec<f32> = (0..16).map(|x| x as f32 * 0.25 - 1.0).collect();
        let weight: Vec<f32> = (0..16).map(|x| (x % 5) as f32 - 2.0).collect();
        let mut a = vec![0f32; 4 * 4];
        pack_nhwc_to_c4_panels(&input, &mut a, 4, 4).unwrap();
        let mut b = vec![0f32; packed_weight_size(&param)];
        pack_weight_fp32(&weight, &mut b, &param).unwrap();
        let mp = StrassenMatMulParameter::from_conv(&param);
        mp.check_conv(&param).unwrap();
        // out[r][o] = sum_i in[r][i] * w[o][i]
        let mut want = vec![0f32; 16];
        for r in 0..4 {
            for o in 0..4 {
                want[r * 4 + o] = (0..4).map(|i| input[r * 4 + i] * weight[o * 4 + i]).sum();
            }
        }
        for kernel in KernelSelector::available() {
            let mut c = vec![0f32; mp.c_len()];
            let mut tmp = vec![0f32; strassen_tmp_size(&mp, kernel.caps().tile_num)];
            conv1x1_fp32(&a, &b, &mut c, &mut tmp, &mp, &kernel).unwrap();
            let mut out = vec![0f32; 16];
            post_conv_fp32(&c, &mut out, None, 4, 4, mp.c_stride, ActType::Identity).unwrap();
            let diff_max = max_abs_diff(&out, &want);
            assert!(diff_max < 1e-6, "kernel: {}, diff_max: {}", kernel.name(), diff_max);
        }
    }

    #[test]
    fn recursion_matches_fallback() {
        for &(row, ic, oc) in &[(64, 32, 32), (50, 29, 27), (96, 16, 64), (7, 5, 3)] {
            let p = problem(row, ic, oc);
            let want = expected(&p);
            for kernel in KernelSelector::available() {
                let tile = kernel.caps().tile_num;
                for max_depth in 0..3 {
                    let mp = StrassenMatMulParameter::from_conv(&p.param).with_max_depth(max_depth);
                    let out = run(&p, &mp, &kernel);
                    let diff_max = max_abs_diff(&out, &want);
                    assert!(
                        diff_max < EPS,
                        "kernel: {}, row: {}, ic: {}, oc: {}, depth: {}, diff_max: {}",
                        kernel.name(),
                        row,
                        ic,
                        oc,
                        strassen_depth(&mp, tile),
                        diff_max
                    );
                }
            }
        }
    }

    #[test]
    fn depth_is_decided_by_size() {
        let p = problem(64, 32, 32);
        let mp = StrassenMatMulParameter::from_conv(&p.param).with_max_depth(3);
        assert_eq!(strassen_depth(&mp, 8), 2);
        assert_eq!(strassen_depth(&mp.with_max_depth(1), 8), 1);
        assert_eq!(strassen_depth(&mp.with_max_depth(0), 8), 0);
        // half rows would not fill a tile
        assert_eq!(strassen_depth(&mp, 40), 0);
        let small = problem(8, 8, 16);
        assert_eq!(strassen_depth(&StrassenMatMulParameter::from_conv(&small.param), 4), 0);
    }

    #[test]
    fn odd_tile_widths() {
        let p = problem(60, 24, 24);
        let want = expected(&p);
        for tile in [1, 3, 5, 12] {
            let kernel = RefKernel::with_tile(tile).unwrap();
            let mp = StrassenMatMulParameter::from_conv(&p.param).with_max_depth(2);
            let diff_max = max_abs_diff(&run(&p, &mp, &kernel), &want);
            assert!(diff_max < EPS, "tile: {}, diff_max: {}", tile, diff_max);
        }
    }

    #[test]
    fn tasks_split_output_blocks() {
        let p = problem(40, 12, 44);
        let kernel = KernelSelector::detect();
        let tile = kernel.caps().tile_num;
        let mp = StrassenMatMulParameter::from_conv(&p.param);
        let mut single = vec![0f32; mp.c_len()];
        let mut tmp = vec![0f32; strassen_tmp_size(&mp, tile)];
        conv1x1_fp32(&p.a, &p.b, &mut single, &mut tmp, &mp, &kernel).unwrap();
        for thread_num in [1, 2, 3, 8] {
            let mut c = vec![0f32; mp.c_len()];
            {
                let lock = RangeLock::from(c.as_mut_slice());
                std::thread::scope(|s| {
                    for task_id in 0..thread_num {
                        let (lock, p, mp, kernel) = (&lock, &p, &mp, &kernel);
                        s.spawn(move || {
                            let mut tmp = vec![0f32; strassen_task_tmp_size(mp, tile, thread_num)];
                            conv1x1_fp32_task(&p.a, &p.b, lock, &mut tmp, mp, task_id, thread_num, kernel).unwrap();
                        });
                    }
                });
            }
            assert_eq!(c, single, "thread_num: {}", thread_num);
        }
    }

    #[test]
    fn task_shares_recurse_on_odd_col() {
        // col 3 keeps the whole problem flat, a share of 2 blocks recurses
        let p = problem(64, 32, 24);
        let want = expected(&p);
        for kernel in KernelSelector::available() {
            let tile = kernel.caps().tile_num;
            let mp = StrassenMatMulParameter::from_conv(&p.param).with_max_depth(2);
            assert_eq!(strassen_depth(&mp, tile), 0);
            let pair = StrassenMatMulParameter { col: 2, ..mp };
            assert!(strassen_depth(&pair, tile) > 0);
            assert!(strassen_task_tmp_size(&mp, tile, 2) > strassen_tmp_size(&mp, tile));
            let single = run(&p, &mp, &kernel);
            for thread_num in [2, 3, 4] {
                let mut c = vec![0f32; mp.c_len()];
                {
                    let lock = RangeLock::from(c.as_mut_slice());
                    let results: Vec<Result<()>> = std::thread::scope(|s| {
                        let handles: Vec<_> = (0..thread_num)
                            .map(|task_id| {
                                let (lock, p, mp, kernel) = (&lock, &p, &mp, &kernel);
                                s.spawn(move || {
                                    let mut tmp = vec![0f32; strassen_task_tmp_size(mp, tile, thread_num)];
                                    conv1x1_fp32_task(&p.a, &p.b, lock, &mut tmp, mp, task_id, thread_num, kernel)
                                })
                            })
                            .collect();
                        handles.into_iter().map(|h| h.join().unwrap()).collect()
                    });
                    for (task_id, r) in results.into_iter().enumerate() {
                        assert_eq!(r, Ok(()), "kernel: {}, task: {}/{}", kernel.name(), task_id, thread_num);
                    }
                }
                let mut out = vec![0f32; mp.row * p.param.output_channel];
                post_conv_fp32(&c, &mut out, None, p.param.output_channel, mp.row, mp.c_stride, ActType::Identity)
                    .unwrap();
                let diff_max = max_abs_diff(&out, &single);
                assert!(diff_max < EPS, "kernel: {}, thread_num: {}, diff_max: {}", kernel.name(), thread_num, diff_max);
                assert!(max_abs_diff(&out, &want) < EPS);
            }
        }
    }

    #[test]
    fn errors_are_reported() {
        let p = problem(64, 32, 32);
        let kernel = RefKernel::new();
        let mp = StrassenMatMulParameter::from_conv(&p.param).with_max_depth(2);
        let mut c = vec![0f32; mp.c_len()];
        let mut tmp = vec![0f32; strassen_tmp_size(&mp, 8) - 1];
        let err = conv1x1_fp32(&p.a, &p.b, &mut c, &mut tmp, &mp, &kernel).unwrap_err();
        assert!(matches!(err, ConvError::BufferTooSmall { name: "tmp", .. }));

        let bad_stride = StrassenMatMulParameter { a_stride: 4, ..mp };
        assert!(matches!(
            conv1x1_fp32(&p.a, &p.b, &mut c, &mut tmp, &bad_stride, &kernel),
            Err(ConvError::InvalidShape { .. })
        ));

        let strided = ConvParameter::new(1, 8, 8, 4, 4, 1, 1).with_stride(2, 2);
        let mp = StrassenMatMulParameter::from_conv(&strided);
        assert!(mp.check_conv(&strided).is_err());

        let mut lock_buf = vec![0f32; 8];
        let lock = RangeLock::from(lock_buf.as_mut_slice());
        let err = conv1x1_fp32_task(&p.a, &p.b, &lock, &mut tmp, &mp, 3, 2, &kernel).unwrap_err();
        assert_eq!(err, ConvError::InvalidTask { task_id: 3, thread_num: 2 });
    }
}
