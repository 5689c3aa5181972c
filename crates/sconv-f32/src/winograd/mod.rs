//! Transform domain convolution for small square kernels with stride 1.
//!
//! Output pixels are grouped in `output_unit x output_unit` blocks. Each block reads an
//! `input_unit x input_unit` input patch, the patches of `tile_num` blocks are transformed
//! together, multiplied against the pre-transformed weight in one batched kernel call
//! (one product per transform point) and transformed back.

mod transform;

pub use transform::{transform_pair, InputTransform, OutputTransform, TransformPair, WinogradUnit, MAX_UNIT};

use once_cell::sync::Lazy;
use sconv_base::{check_len, up_div, ConvError, Result};

use crate::conv::check_output;
use crate::conv_parameter::ConvParameter;
use crate::kernel::{ActType, GemmArgs, GemmKernel, GemmLayout, WriteMode, C4NUM, C8NUM, MAX_TILE};
use crate::pack::{scatter_block, BlockPos};
use crate::TaskOutput;

static CONV3X3_TRANSFORMS: Lazy<Result<TransformPair>> = Lazy::new(|| transform_pair(2, 3));

fn conv3x3_transforms() -> Result<&'static TransformPair> {
    CONV3X3_TRANSFORMS.as_ref().map_err(Clone::clone)
}

fn check_applicable(p: &ConvParameter, pair: &TransformPair) -> Result<()> {
    let kernel_size = pair.kernel_size();
    if p.kernel_h != kernel_size || p.kernel_w != kernel_size {
        return Err(ConvError::TransformUnitMismatch {
            input_unit: pair.input_unit(),
            output_unit: pair.output_unit(),
            kernel_size: p.kernel_h.max(p.kernel_w),
        });
    }
    if p.stride_h != 1 || p.stride_w != 1 || p.dilation_h != 1 || p.dilation_w != 1 {
        return Err(ConvError::invalid_shape("winograd needs stride 1 and no dilation"));
    }
    Ok(())
}

/// Transform unit sizes of one winograd convolution, checked against each other and
/// against the tile width of the kernel it was built for
#[derive(Clone, Debug)]
pub struct WinogradConfig {
    pair: TransformPair,
    tile_num: usize,
}

impl WinogradConfig {
    pub fn new<K: GemmKernel + ?Sized>(
        input_unit: usize,
        output_unit: usize,
        kernel_size: usize,
        kernel: &K,
    ) -> Result<Self> {
        WinogradUnit::from_input_unit(input_unit)?;
        if output_unit + kernel_size != input_unit + 1 {
            return Err(ConvError::TransformUnitMismatch { input_unit, output_unit, kernel_size });
        }
        Self::from_pair(transform_pair(output_unit, kernel_size)?, kernel)
    }

    /// F(2x2, 3x3) with the cached transforms
    pub fn conv3x3<K: GemmKernel + ?Sized>(kernel: &K) -> Result<Self> {
        Self::from_pair(conv3x3_transforms()?.clone(), kernel)
    }

    /// Configuration for the output unit [`select_output_unit`] picks
    pub fn for_conv<K: GemmKernel + ?Sized>(conv_param: &ConvParameter, kernel: &K) -> Result<Self> {
        let ou = select_output_unit(conv_param)
            .ok_or_else(|| ConvError::invalid_shape("no winograd unit beats the direct path for this shape"))?;
        let k = conv_param.kernel_h;
        Self::new(ou + k - 1, ou, k, kernel)
    }

    fn from_pair<K: GemmKernel + ?Sized>(pair: TransformPair, kernel: &K) -> Result<Self> {
        let tile_num = kernel.caps().tile_num;
        if tile_num == 0 || tile_num > MAX_TILE {
            return Err(ConvError::invalid_shape(format!("kernel tile width {} outside 1..={}", tile_num, MAX_TILE)));
        }
        log::debug!(
            "winograd F({0}x{0}, {1}x{1}), input unit {2}, {3} kernel tile {4}",
            pair.output_unit(),
            pair.kernel_size(),
            pair.input_unit(),
            kernel.name(),
            tile_num
        );
        Ok(WinogradConfig { pair, tile_num })
    }

    pub fn input_unit(&self) -> usize {
        self.pair.input_unit()
    }

    pub fn output_unit(&self) -> usize {
        self.pair.output_unit()
    }

    pub fn kernel_size(&self) -> usize {
        self.pair.kernel_size()
    }

    pub fn tile_num(&self) -> usize {
        self.tile_num
    }

    pub fn transforms(&self) -> &TransformPair {
        &self.pair
    }

    /// Rejects a kernel of another tile width and a convolution the units do not fit
    pub fn check<K: GemmKernel + ?Sized>(&self, conv_param: &ConvParameter, kernel: &K) -> Result<()> {
        let tile = kernel.caps().tile_num;
        if tile != self.tile_num {
            return Err(ConvError::TileMismatch { configured: self.tile_num, kernel: tile });
        }
        check_applicable(conv_param, &self.pair)
    }
}

/// Output unit with the lowest estimated cost, `None` when the kernel is not square, the
/// convolution is strided or dilated, or the direct path is estimated cheaper
pub fn select_output_unit(conv_param: &ConvParameter) -> Option<usize> {
    let p = conv_param;
    let k = p.kernel_h;
    if k != p.kernel_w || !(2..=7).contains(&k) {
        return None;
    }
    if p.stride_h != 1 || p.stride_w != 1 || p.dilation_h != 1 || p.dilation_w != 1 {
        return None;
    }
    let (ic, oc) = (p.input_channel as f64, p.output_channel as f64);
    let direct = (p.output_plane() * k * k) as f64 * ic * oc;
    let best = [4usize, 6, 8]
        .iter()
        .filter(|&&n| n > k)
        .map(|&n| n + 1 - k)
        .filter(|&ou| ou >= 2)
        .map(|ou| {
            let n = (ou + k - 1) as f64;
            let m = ou as f64;
            let blocks = (up_div(p.output_h, ou) * up_div(p.output_w, ou)) as f64;
            let input_tf = 2.0 * n * n * n * ic;
            let gemm = n * n * ic * oc;
            let output_tf = (m * n * n + m * m * n) * oc;
            (ou, blocks * (input_tf + gemm + output_tf))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1));
    let choice = match best {
        Some((ou, cost)) if cost < direct => Some(ou),
        _ => None,
    };
    log::debug!("winograd output unit for {}x{} kernel: {:?}", k, k, choice);
    choice
}

pub fn winograd_weight_size(conv_param: &ConvParameter, config: &WinogradConfig) -> usize {
    weight_size(conv_param, config.input_unit())
}

fn weight_size(conv_param: &ConvParameter, input_unit: usize) -> usize {
    conv_param.oc8() * input_unit * input_unit * conv_param.ic4() * C4NUM * C8NUM
}

fn buffer_sizes(conv_param: &ConvParameter, input_unit: usize, tile: usize) -> (usize, usize, usize, usize) {
    let n2 = input_unit * input_unit;
    (
        n2 * conv_param.ic4() * tile * C4NUM,
        n2 * conv_param.oc8() * tile * C8NUM,
        2 * n2 * C4NUM,
        3 * n2 * C8NUM,
    )
}

/// OHWI weight to `[oc / 8][n * n][ic / 4][4][8]` transform domain weight, done once per model
pub fn winograd_filter_transform(
    weight: &[f32],
    dst: &mut [f32],
    conv_param: &ConvParameter,
    config: &WinogradConfig,
) -> Result<()> {
    let p = conv_param;
    check_applicable(p, &config.pair)?;
    let (oc, ic, ic4) = (p.output_channel, p.input_channel, p.ic4());
    let (n, k) = (config.input_unit(), config.kernel_size());
    let size = winograd_weight_size(p, config);
    check_len("weight", weight, p.weight_size())?;
    check_len("trans_weight", dst, size)?;
    let dst = &mut dst[..size];
    dst.fill(0.0);

    let mut g = [0f64; MAX_UNIT * MAX_UNIT];
    let mut res = [0f64; MAX_UNIT * MAX_UNIT];
    for o in 0..oc {
        let (j, lane) = (o / C8NUM, o % C8NUM);
        for i in 0..ic {
            for (idx, v) in g[..k * k].iter_mut().enumerate() {
                *v = weight[(o * k * k + idx) * ic + i] as f64;
            }
            config.pair.transform_filter(&g[..k * k], &mut res);
            let (kb, m) = (i / C4NUM, i % C4NUM);
            for (pt, &v) in res[..n * n].iter().enumerate() {
                dst[((j * n * n + pt) * ic4 + kb) * C4NUM * C8NUM + m * C8NUM + lane] = v as f32;
            }
        }
    }
    Ok(())
}

/// Per task scratch of the winograd path
pub struct WinogradBuffers<'a> {
    /// `[n * n][ic / 4][tile][4]` transformed input of one tile of blocks
    pub trans_input: &'a mut [f32],
    /// `[n * n][oc / 8][tile][8]` transform domain products
    pub gemm_out: &'a mut [f32],
    /// one input patch and its half transformed copy
    pub tmp_data: &'a mut [f32],
    /// one output patch, its half transformed copy and the finished block
    pub tmp_out: &'a mut [f32],
}

impl<'a> WinogradBuffers<'a> {
    /// `(trans_input, gemm_out, tmp_data, tmp_out)` lengths
    pub fn sizes(conv_param: &ConvParameter, config: &WinogradConfig) -> (usize, usize, usize, usize) {
        buffer_sizes(conv_param, config.input_unit(), config.tile_num())
    }

    fn check(&self, conv_param: &ConvParameter, input_unit: usize, tile: usize) -> Result<()> {
        let (trans_input, gemm_out, tmp_data, tmp_out) = buffer_sizes(conv_param, input_unit, tile);
        check_len("trans_input", self.trans_input, trans_input)?;
        check_len("gemm_out", self.gemm_out, gemm_out)?;
        check_len("tmp_data", self.tmp_data, tmp_data)?;
        check_len("tmp_out", self.tmp_out, tmp_out)
    }
}

/// Winograd convolution of the block rows owned by `task_id`.
///
/// `input` is NHWC4, `trans_weight` comes from [`winograd_filter_transform`] with the same
/// `config`, `output` is the whole NHWC output shared by every task of the call. A unit of
/// work is one row of output blocks of one image, so each task writes one contiguous slice.
#[allow(clippy::too_many_arguments)]
pub fn conv_winograd_fp32<K: GemmKernel + ?Sized>(
    input: &[f32],
    trans_weight: &[f32],
    bias: Option<&[f32]>,
    buffers: &mut WinogradBuffers<'_>,
    output: &TaskOutput<'_>,
    task_id: usize,
    conv_param: &ConvParameter,
    config: &WinogradConfig,
    kernel: &K,
) -> Result<()> {
    conv_param.check(task_id)?;
    config.check(conv_param, kernel)?;
    winograd_task(input, trans_weight, bias, buffers, output, task_id, conv_param, &config.pair, kernel)
}

/// [`conv_winograd_fp32`] for 3x3 kernels with F(2x2, 3x3), buffers and weight sized with
/// [`WinogradConfig::conv3x3`]
#[allow(clippy::too_many_arguments)]
pub fn conv3x3_fp32<K: GemmKernel + ?Sized>(
    input: &[f32],
    trans_weight: &[f32],
    bias: Option<&[f32]>,
    buffers: &mut WinogradBuffers<'_>,
    output: &TaskOutput<'_>,
    task_id: usize,
    conv_param: &ConvParameter,
    kernel: &K,
) -> Result<()> {
    conv_param.check(task_id)?;
    let pair = conv3x3_transforms()?;
    check_applicable(conv_param, pair)?;
    winograd_task(input, trans_weight, bias, buffers, output, task_id, conv_param, pair, kernel)
}

#[allow(clippy::too_many_arguments)]
fn winograd_task<K: GemmKernel + ?Sized>(
    input: &[f32],
    trans_weight: &[f32],
    bias: Option<&[f32]>,
    buffers: &mut WinogradBuffers<'_>,
    output: &TaskOutput<'_>,
    task_id: usize,
    conv_param: &ConvParameter,
    pair: &TransformPair,
    kernel: &K,
) -> Result<()> {
    let p = conv_param;
    let (n, ou, tile) = (pair.input_unit(), pair.output_unit(), kernel.caps().tile_num);
    let (n2, ic4, oc, oc8) = (n * n, p.ic4(), p.output_channel, p.oc8());
    let image_len = p.input_plane() * ic4 * C4NUM;

    check_len("input", input, p.input_batch * image_len)?;
    check_len("trans_weight", trans_weight, weight_size(p, n))?;
    if let Some(b) = bias {
        check_len("bias", b, oc)?;
    }
    buffers.check(p, n, tile)?;
    check_output(output, p.output_size())?;

    let (oh, ow) = (p.output_h, p.output_w);
    let (hb, wb) = (up_div(oh, ou), up_div(ow, ou));
    let (u0, u1) = p.task_units(p.input_batch * hb, task_id);
    if u0 >= u1 || wb == 0 {
        return Ok(());
    }
    let row_offset = |u: usize| {
        let (b, r) = (u / hb, u % hb);
        (b * oh + (r * ou).min(oh)) * ow * oc
    };
    let start = row_offset(u0);
    let mut guard = output.write(start, row_offset(u1))?;
    let out = guard.get();

    let args = GemmArgs {
        step: n2,
        ic4,
        output_channel: oc,
        offset: oc8 * tile * C8NUM,
        input_stride: tile * C4NUM,
        weight_stride: n2 * ic4 * C4NUM * C8NUM,
        layout: GemmLayout::Winograd,
        write: WriteMode::Overwrite,
        act: ActType::Identity,
    };
    let point_step = ic4 * tile * C4NUM;
    let block_of = |idx: usize| {
        let (u, wbi) = (u0 + idx / wb, idx % wb);
        (u / hb, u % hb, wbi)
    };
    let total = (u1 - u0) * wb;
    let mut first = 0;
    while first < total {
        let cal = (total - first).min(tile);

        for i in cal..tile {
            for pk in 0..n2 * ic4 {
                let d = (pk * tile + i) * C4NUM;
                buffers.trans_input[d..d + C4NUM].fill(0.0);
            }
        }
        for i in 0..cal {
            let (b, hbi, wbi) = block_of(first + i);
            let y0 = (hbi * ou) as isize - p.pad_u as isize;
            let x0 = (wbi * ou) as isize - p.pad_l as isize;
            let image = &input[b * image_len..(b + 1) * image_len];
            for k in 0..ic4 {
                let (patch, mid) = buffers.tmp_data.split_at_mut(n2 * C4NUM);
                for y in 0..n {
                    let iy = y0 + y as isize;
                    for x in 0..n {
                        let ix = x0 + x as isize;
                        let d = &mut patch[(y * n + x) * C4NUM..(y * n + x + 1) * C4NUM];
                        if iy < 0 || iy >= p.input_h as isize || ix < 0 || ix >= p.input_w as isize {
                            d.fill(0.0);
                        } else {
                            let s = ((iy as usize * p.input_w + ix as usize) * ic4 + k) * C4NUM;
                            d.copy_from_slice(&image[s..s + C4NUM]);
                        }
                    }
                }
                pair.input.apply(patch, mid, &mut buffers.trans_input[(k * tile + i) * C4NUM..], point_step);
            }
        }

        kernel.gemm(buffers.gemm_out, buffers.trans_input, trans_weight, None, &args)?;

        for i in 0..cal {
            let (b, hbi, wbi) = block_of(first + i);
            let pos = BlockPos { batch: b, y0: hbi * ou, x0: wbi * ou };
            for j in 0..oc8 {
                let c0 = j * C8NUM;
                let c_len = (oc - c0).min(C8NUM);
                let (gathered, rest) = buffers.tmp_out.split_at_mut(n2 * C8NUM);
                let (mid, block) = rest.split_at_mut(n2 * C8NUM);
                for (pt, g) in gathered.chunks_exact_mut(C8NUM).enumerate() {
                    let s = (pt * oc8 + j) * tile * C8NUM + i * C8NUM;
                    g.copy_from_slice(&buffers.gemm_out[s..s + C8NUM]);
                }
                pair.output.apply(gathered, mid, block);
                for px in block.chunks_exact_mut(C8NUM).take(ou * ou) {
                    for (l, v) in px[..c_len].iter_mut().enumerate() {
                        let bv = bias.map_or(0.0, |bs| bs[c0 + l]);
                        *v = p.act_type.apply(*v + bv);
                    }
                }
                scatter_block(block, C8NUM, out, start, pos, (oh, ow, oc), (c0, c_len), ou);
            }
        }
        first += cal;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::tests::{random_operands, reference_output, run_direct};
    use crate::kernel::{KernelSelector, RefKernel};
    use crate::pack::{nhwc4_size, pack_nhwc_to_nhwc4};
    use sconv_base::RangeLock;
    use sconv_dev::max_abs_diff;

    fn tolerance(input_unit: usize) -> f64 {
        match input_unit {
            4 => 1e-4,
            6 => 1e-3,
            _ => 1e-2,
        }
    }

    fn run_winograd(
        p: &ConvParameter,
        input: &[f32],
        weight: &[f32],
        bias: Option<&[f32]>,
        config: &WinogradConfig,
        kernel: &dyn GemmKernel,
    ) -> Vec<f32> {
        let mut input4 = vec![0f32; nhwc4_size(p.input_batch, p.input_plane(), p.input_channel)];
        pack_nhwc_to_nhwc4(input, &mut input4, p.input_batch, p.input_plane(), p.input_channel).unwrap();
        let mut trans_weight = vec![0f32; winograd_weight_size(p, config)];
        winograd_filter_transform(weight, &mut trans_weight, p, config).unwrap();
        let (ti, go, td, to) = WinogradBuffers::sizes(p, config);
        let (mut trans_input, mut gemm_out, mut tmp_data, mut tmp_out) =
            (vec![0f32; ti], vec![0f32; go], vec![0f32; td], vec![0f32; to]);
        let mut out = vec![f32::NAN; p.output_size()];
        let lock = RangeLock::from(out.as_mut_slice());
        for task_id in 0..p.thread_num {
            let mut buffers = WinogradBuffers {
                trans_input: &mut trans_input,
                gemm_out: &mut gemm_out,
                tmp_data: &mut tmp_data,
                tmp_out: &mut tmp_out,
            };
            conv_winograd_fp32(&input4, &trans_weight, bias, &mut buffers, &lock, task_id, p, config, kernel).unwrap();
        }
        drop(lock);
        out
    }

    #[test]
    fn every_unit_matches_direct() {
        for kernel in KernelSelector::available() {
            for k in 2..=5 {
                for n in [4usize, 6, 8] {
                    if n <= k || n + 1 - k < 2 {
                        continue;
                    }
                    let ou = n + 1 - k;
                    let config = WinogradConfig::new(n, ou, k, &kernel).unwrap();
                    for &(batch, h, w, pad, ic, oc) in &[(1, 7, 9, 0, 5, 11), (2, 10, 6, 1, 8, 3), (1, 5, 13, 2, 1, 17)] {
                        let p = ConvParameter::new(batch, h, w, ic, oc, k, k).with_pad(pad, pad, pad, pad).with_threads(3);
                        let (input, weight, bias) = random_operands(&p, (k * n) as u64);
                        let want = run_direct(&p, &input, &weight, Some(&bias), &kernel);
                        let got = run_winograd(&p, &input, &weight, Some(&bias), &config, &kernel);
                        let diff_max = max_abs_diff(&got, &want);
                        assert!(
                            diff_max < tolerance(n),
                            "kernel: {}, n: {}, k: {}, param: {:?}, diff_max: {}",
                            kernel.name(),
                            n,
                            k,
                            p,
                            diff_max
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn conv3x3_matches_fallback() {
        let p = ConvParameter::new(2, 9, 11, 6, 10, 3, 3).with_pad(1, 1, 1, 1).with_threads(2);
        let (input, weight, bias) = random_operands(&p, 17);
        let want = reference_output(&p, &input, &weight, Some(&bias));
        for tile in [1, 4, 7, 12] {
            let kernel = RefKernel::with_tile(tile).unwrap();
            let config = WinogradConfig::conv3x3(&kernel).unwrap();
            let mut input4 = vec![0f32; nhwc4_size(2, p.input_plane(), 6)];
            pack_nhwc_to_nhwc4(&input, &mut input4, 2, p.input_plane(), 6).unwrap();
            let mut trans_weight = vec![0f32; winograd_weight_size(&p, &config)];
            winograd_filter_transform(&weight, &mut trans_weight, &p, &config).unwrap();
            let (ti, go, td, to) = WinogradBuffers::sizes(&p, &config);
            let (mut trans_input, mut gemm_out, mut tmp_data, mut tmp_out) =
                (vec![0f32; ti], vec![0f32; go], vec![0f32; td], vec![0f32; to]);
            let mut out = vec![0f32; p.output_size()];
            {
                let lock = RangeLock::from(out.as_mut_slice());
                for task_id in 0..2 {
                    let mut buffers = WinogradBuffers {
                        trans_input: &mut trans_input,
                        gemm_out: &mut gemm_out,
                        tmp_data: &mut tmp_data,
                        tmp_out: &mut tmp_out,
                    };
                    conv3x3_fp32(&input4, &trans_weight, Some(&bias), &mut buffers, &lock, task_id, &p, &kernel)
                        .unwrap();
                }
            }
            let diff_max = max_abs_diff(&out, &want);
            assert!(diff_max < 1e-4, "tile: {}, diff_max: {}", tile, diff_max);
        }
    }

    #[test]
    fn fused_activation_equals_clamp() {
        let kernel = KernelSelector::detect();
        let base = ConvParameter::new(1, 8, 8, 4, 9, 3, 3).with_pad(1, 1, 1, 1);
        let (input, mut weight, bias) = random_operands(&base, 5);
        weight.iter_mut().for_each(|w| *w *= 3.0);
        let config = WinogradConfig::new(6, 4, 3, &kernel).unwrap();
        let plain = run_winograd(&base, &input, &weight, Some(&bias), &config, &kernel);
        for act in [ActType::Relu, ActType::Relu6] {
            let got = run_winograd(&base.with_act(act), &input, &weight, Some(&bias), &config, &kernel);
            let want: Vec<f32> = plain.iter().map(|&x| act.apply(x)).collect();
            assert_eq!(got, want, "act: {:?}", act);
        }
    }

    #[test]
    fn concurrent_tasks_match_sequential() {
        let kernel = KernelSelector::detect();
        let p = ConvParameter::new(2, 13, 11, 7, 12, 3, 3).with_pad(1, 1, 1, 1).with_threads(5);
        let config = WinogradConfig::new(6, 4, 3, &kernel).unwrap();
        let (input, weight, bias) = random_operands(&p, 8);
        let want = run_winograd(&p, &input, &weight, Some(&bias), &config, &kernel);

        let mut input4 = vec![0f32; nhwc4_size(2, p.input_plane(), 7)];
        pack_nhwc_to_nhwc4(&input, &mut input4, 2, p.input_plane(), 7).unwrap();
        let mut trans_weight = vec![0f32; winograd_weight_size(&p, &config)];
        winograd_filter_transform(&weight, &mut trans_weight, &p, &config).unwrap();
        let mut out = vec![0f32; p.output_size()];
        {
            let lock = RangeLock::from(out.as_mut_slice());
            std::thread::scope(|s| {
                for task_id in 0..p.thread_num {
                    let (lock, input4, trans_weight, bias, p, config, kernel) =
                        (&lock, &input4, &trans_weight, &bias, &p, &config, &kernel);
                    s.spawn(move || {
                        let (ti, go, td, to) = WinogradBuffers::sizes(p, config);
                        let (mut trans_input, mut gemm_out, mut tmp_data, mut tmp_out) =
                            (vec![0f32; ti], vec![0f32; go], vec![0f32; td], vec![0f32; to]);
                        let mut buffers = WinogradBuffers {
                            trans_input: &mut trans_input,
                            gemm_out: &mut gemm_out,
                            tmp_data: &mut tmp_data,
                            tmp_out: &mut tmp_out,
                        };
                        conv_winograd_fp32(
                            input4,
                            trans_weight,
                            Some(bias.as_slice()),
                            &mut buffers,
                            lock,
                            task_id,
                            p,
                            config,
                            kernel,
                        )
                        .unwrap();
                    });
                }
            });
        }
        assert_eq!(out, want);
    }

    #[test]
    fn empty_task_writes_nothing() {
        let kernel = RefKernel::new();
        // 2x2 output is a single block row
        let p = ConvParameter::new(1, 4, 4, 3, 5, 3, 3).with_threads(3);
        let config = WinogradConfig::conv3x3(&kernel).unwrap();
        let input4 = vec![1f32; nhwc4_size(1, 16, 3)];
        let trans_weight = vec![1f32; winograd_weight_size(&p, &config)];
        let (ti, go, td, to) = WinogradBuffers::sizes(&p, &config);
        let (mut trans_input, mut gemm_out, mut tmp_data, mut tmp_out) =
            (vec![-2f32; ti], vec![-2f32; go], vec![-2f32; td], vec![-2f32; to]);
        let mut out = vec![-2f32; p.output_size()];
        {
            let lock = RangeLock::from(out.as_mut_slice());
            for task_id in 1..3 {
                let mut buffers = WinogradBuffers {
                    trans_input: &mut trans_input,
                    gemm_out: &mut gemm_out,
                    tmp_data: &mut tmp_data,
                    tmp_out: &mut tmp_out,
                };
                conv_winograd_fp32(&input4, &trans_weight, None, &mut buffers, &lock, task_id, &p, &config, &kernel)
                    .unwrap();
            }
        }
        let all = out.iter().chain(&trans_input).chain(&gemm_out).chain(&tmp_data).chain(&tmp_out);
        assert!(all.into_iter().all(|&x| x == -2.0));
    }

    #[test]
    fn configuration_errors() {
        let kernel = RefKernel::new();
        assert_eq!(
            WinogradConfig::new(5, 3, 3, &kernel).unwrap_err(),
            ConvError::UnsupportedTransformUnit { input_unit: 5 }
        );
        assert_eq!(
            WinogradConfig::new(6, 2, 3, &kernel).unwrap_err(),
            ConvError::TransformUnitMismatch { input_unit: 6, output_unit: 2, kernel_size: 3 }
        );
        let config = WinogradConfig::new(6, 4, 3, &kernel).unwrap();
        let p = ConvParameter::new(1, 8, 8, 4, 4, 3, 3);
        let other = RefKernel::with_tile(4).unwrap();
        assert_eq!(config.check(&p, &other), Err(ConvError::TileMismatch { configured: 8, kernel: 4 }));
        assert!(config.check(&p, &kernel).is_ok());
        let p5 = ConvParameter::new(1, 8, 8, 4, 4, 5, 5);
        assert!(matches!(config.check(&p5, &kernel), Err(ConvError::TransformUnitMismatch { kernel_size: 5, .. })));
        let strided = p.with_stride(2, 2);
        assert!(matches!(config.check(&strided, &kernel), Err(ConvError::InvalidShape { .. })));

        let mut trans_weight = vec![0f32; winograd_weight_size(&p, &config) - 1];
        let weight = vec![0f32; p.weight_size()];
        let err = winograd_filter_transform(&weight, &mut trans_weight, &p, &config).unwrap_err();
        assert!(matches!(err, ConvError::BufferTooSmall { name: "trans_weight", .. }));
    }

    #[test]
    fn output_unit_selection() {
        let wide = ConvParameter::new(1, 32, 32, 16, 16, 3, 3).with_pad(1, 1, 1, 1);
        assert_eq!(select_output_unit(&wide), Some(4));
        assert_eq!(select_output_unit(&ConvParameter::new(1, 32, 32, 1, 1, 3, 3)), None);
        assert_eq!(select_output_unit(&wide.with_stride(2, 2)), None);
        assert_eq!(select_output_unit(&ConvParameter::new(1, 32, 32, 16, 16, 1, 1)), None);
        assert_eq!(select_output_unit(&ConvParameter::new(1, 32, 32, 16, 16, 3, 5)), None);
        let ou = select_output_unit(&ConvParameter::new(1, 40, 40, 32, 32, 5, 5)).unwrap();
        assert!(ou == 2 || ou == 4);
        let config = WinogradConfig::for_conv(&wide, &KernelSelector::detect()).unwrap();
        assert_eq!((config.input_unit(), config.output_unit()), (6, 4));
    }
}
