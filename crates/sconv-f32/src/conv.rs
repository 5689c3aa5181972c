use sconv_base::{check_len, up_div, ConvError, Result};

use crate::conv_parameter::ConvParameter;
use crate::kernel::{GemmArgs, GemmKernel, GemmLayout, WriteMode, C4NUM, C8NUM};
use crate::pack::{im2col_pack_unit_fp32, im2col_unit_size, packed_weight_size};
use crate::TaskOutput;

/// Per task scratch of the direct path
pub struct DirectScratch<'a> {
    /// one im2col unit, `[kh * kw][ic / 4][tile][4]`
    pub packed_input: &'a mut [f32],
    /// one NHWC tile for the last, partial tile of an image
    pub tmp_out_block: &'a mut [f32],
}

impl<'a> DirectScratch<'a> {
    /// `(packed_input, tmp_out_block)` lengths for `conv_param` run with `kernel`
    pub fn sizes<K: GemmKernel + ?Sized>(conv_param: &ConvParameter, kernel: &K) -> (usize, usize) {
        let tile = kernel.caps().tile_num;
        (im2col_unit_size(conv_param, tile), tile * conv_param.output_channel)
    }
}

pub(crate) fn check_output(output: &TaskOutput<'_>, required: usize) -> Result<()> {
    if output.len() < required {
        return Err(ConvError::BufferTooSmall { name: "output", required, actual: output.len() });
    }
    Ok(())
}

/// im2col + matmul convolution of the output tiles owned by `task_id`.
///
/// `input` is NHWC4, `packed_weight` comes from [`crate::pack::pack_weight_fp32`], `output` is
/// the whole NHWC output shared by every task of the call. Output pixels of each image are cut
/// into tiles of the kernel's tile width and the `(batch, tile)` units are split into
/// contiguous runs, one per task.
#[allow(clippy::too_many_arguments)]
pub fn conv_fp32<K: GemmKernel + ?Sized>(
    input: &[f32],
    packed_weight: &[f32],
    bias: Option<&[f32]>,
    scratch: &mut DirectScratch<'_>,
    output: &TaskOutput<'_>,
    task_id: usize,
    conv_param: &ConvParameter,
    kernel: &K,
) -> Result<()> {
    let p = conv_param;
    p.check(task_id)?;
    let tile = kernel.caps().tile_num;
    let (oc, ic4, kernel_plane) = (p.output_channel, p.ic4(), p.kernel_plane());
    let out_plane = p.output_plane();
    let image_len = p.input_plane() * ic4 * C4NUM;

    check_len("input", input, p.input_batch * image_len)?;
    check_len("packed_weight", packed_weight, packed_weight_size(p))?;
    if let Some(b) = bias {
        check_len("bias", b, oc)?;
    }
    let (packed_len, tmp_len) = DirectScratch::sizes(p, kernel);
    check_len("packed_input", scratch.packed_input, packed_len)?;
    check_len("tmp_out_block", scratch.tmp_out_block, tmp_len)?;
    check_output(output, p.output_size())?;

    let tiles_per_image = up_div(out_plane, tile);
    let (u0, u1) = p.task_units(p.input_batch * tiles_per_image, task_id);
    if u0 >= u1 {
        return Ok(());
    }
    let offset_of = |u: usize| {
        let (b, t) = (u / tiles_per_image, u % tiles_per_image);
        (b * out_plane + (t * tile).min(out_plane)) * oc
    };
    let start = offset_of(u0);
    let mut guard = output.write(start, offset_of(u1))?;
    let out = guard.get();

    let args = GemmArgs {
        step: kernel_plane,
        ic4,
        output_channel: oc,
        offset: oc,
        input_stride: tile * C4NUM,
        weight_stride: kernel_plane * ic4 * C4NUM * C8NUM,
        layout: GemmLayout::Nhwc,
        write: WriteMode::Overwrite,
        act: p.act_type,
    };
    for u in u0..u1 {
        let (b, t) = (u / tiles_per_image, u % tiles_per_image);
        let block_index = t * tile;
        let real = (out_plane - block_index).min(tile);
        let image = &input[b * image_len..(b + 1) * image_len];
        im2col_pack_unit_fp32(image, p, scratch.packed_input, real, block_index, tile)?;
        let local = (b * out_plane + block_index) * oc - start;
        if real == tile {
            kernel.gemm(&mut out[local..local + tile * oc], scratch.packed_input, packed_weight, bias, &args)?;
        } else {
            kernel.gemm(scratch.tmp_out_block, scratch.packed_input, packed_weight, bias, &args)?;
            out[local..local + real * oc].copy_from_slice(&scratch.tmp_out_block[..real * oc]);
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kernel::{ActType, KernelSelector, RefKernel};
    use crate::pack::{nhwc4_size, pack_nhwc_to_nhwc4, pack_weight_fp32};
    use sconv_base::RangeLock;
    use sconv_dev::{
        conv2d_fallback_f32, generate_channel_dims, generate_plane_dims, max_abs_diff, random_tensor_uniform,
        random_tensor_uniform_seeded, ConvDims,
    };

    const EPS: f64 = 1e-4;

    pub(crate) fn dims(p: &ConvParameter) -> ConvDims {
        ConvDims {
            batch: p.input_batch,
            in_h: p.input_h,
            in_w: p.input_w,
            in_c: p.input_channel,
            out_h: p.output_h,
            out_w: p.output_w,
            out_c: p.output_channel,
            kernel_h: p.kernel_h,
            kernel_w: p.kernel_w,
            stride_h: p.stride_h,
            stride_w: p.stride_w,
            pad_u: p.pad_u,
            pad_l: p.pad_l,
            dilation_h: p.dilation_h,
            dilation_w: p.dilation_w,
        }
    }

    pub(crate) fn random_operands(p: &ConvParameter, seed: u64) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let mut input = vec![0f32; p.input_size()];
        let mut weight = vec![0f32; p.weight_size()];
        let mut bias = vec![0f32; p.output_channel];
        random_tensor_uniform_seeded(&mut input, seed);
        random_tensor_uniform_seeded(&mut weight, seed + 1);
        random_tensor_uniform(&mut bias);
        (input, weight, bias)
    }

    pub(crate) fn reference_output(p: &ConvParameter, input: &[f32], weight: &[f32], bias: Option<&[f32]>) -> Vec<f32> {
        let mut out = vec![0f32; p.output_size()];
        conv2d_fallback_f32(&dims(p), input, weight, bias, p.act_type.is_relu(), p.act_type.is_relu6(), &mut out);
        out
    }

    /// Packs NHWC input / OHWI weight and runs every task of `p` one after another
    pub(crate) fn run_direct(
        p: &ConvParameter,
        input: &[f32],
        weight: &[f32],
        bias: Option<&[f32]>,
        kernel: &dyn GemmKernel,
    ) -> Vec<f32> {
        let mut input4 = vec![0f32; nhwc4_size(p.input_batch, p.input_plane(), p.input_channel)];
        pack_nhwc_to_nhwc4(input, &mut input4, p.input_batch, p.input_plane(), p.input_channel).unwrap();
        let mut packed_weight = vec![0f32; packed_weight_size(p)];
        pack_weight_fp32(weight, &mut packed_weight, p).unwrap();
        let (packed_len, tmp_len) = DirectScratch::sizes(p, kernel);
        let mut packed_input = vec![0f32; packed_len];
        let mut tmp_out_block = vec![0f32; tmp_len];
        let mut out = vec![f32::NAN; p.output_size()];
        let lock = RangeLock::from(out.as_mut_slice());
        for task_id in 0..p.thread_num {
            let mut scratch = DirectScratch { packed_input: &mut packed_input, tmp_out_block: &mut tmp_out_block };
            conv_fp32(&input4, &packed_weight, bias, &mut scratch, &lock, task_id, p, kernel).unwrap();
        }
        drop(lock);
        out
    }

    #[test]
    fn single_value_three_by_three() {
        let p = ConvParameter::new(1, 3, 3, 1, 1, 3, 3);
        let input: Vec<f32> = (1..=9).map(|x| x as f32).collect();
        let mut center = vec![0f32; 9];
        center[4] = 1.0;
        let ones = vec![1f32; 9];
        for kernel in KernelSelector::available() {
            assert_eq!(run_direct(&p, &input, &center, None, &kernel), vec![5.0]);
            assert_eq!(run_direct(&p, &input, &ones, None, &kernel), vec![45.0]);
            assert_eq!(run_direct(&p, &input, &ones, Some(&[-40.0f32][..]), &kernel), vec![5.0]);
        }
    }

    #[test]
    fn matches_fallback() {
        let shapes = [
            // (batch, h, w, kh, kw, stride, pad, dilation)
            (1, 5, 5, 3, 3, 1, 0, 1),
            (2, 7, 6, 3, 3, 1, 1, 1),
            (1, 9, 8, 3, 2, 2, 1, 1),
            (1, 8, 9, 5, 5, 1, 2, 1),
            (2, 10, 7, 3, 3, 1, 2, 2),
            (1, 6, 6, 1, 1, 2, 0, 1),
            (1, 11, 4, 1, 3, 3, 1, 1),
        ];
        for kernel in KernelSelector::available() {
            for &(batch, h, w, kh, kw, stride, pad, dilation) in &shapes {
                for &ic in &generate_channel_dims() {
                    let oc = 2 * ic + 1;
                    let p = ConvParameter::new(batch, h, w, ic, oc, kh, kw)
                        .with_stride(stride, stride)
                        .with_pad(pad, pad, pad, pad)
                        .with_dilation(dilation, dilation);
                    let (input, weight, bias) = random_operands(&p, ic as u64);
                    let want = reference_output(&p, &input, &weight, Some(&bias));
                    let got = run_direct(&p, &input, &weight, Some(&bias), &kernel);
                    let diff_max = max_abs_diff(&got, &want);
                    assert!(diff_max < EPS, "kernel: {}, param: {:?}, diff_max: {}", kernel.name(), p, diff_max);
                }
            }
        }
    }

    #[test]
    fn output_planes_around_tile_width() {
        for kernel in KernelSelector::available() {
            let tile = kernel.caps().tile_num;
            for h in [1, 2] {
                for w in generate_plane_dims(tile) {
                    let p = ConvParameter::new(1, h, w, 5, 9, 3, 3).with_pad(1, 1, 1, 1).with_threads(2);
                    let (input, weight, bias) = random_operands(&p, w as u64);
                    let want = reference_output(&p, &input, &weight, Some(&bias));
                    let got = run_direct(&p, &input, &weight, Some(&bias), &kernel);
                    let diff_max = max_abs_diff(&got, &want);
                    assert!(diff_max < EPS, "kernel: {}, h: {}, w: {}, diff_max: {}", kernel.name(), h, w, diff_max);
                }
            }
        }
    }

    #[test]
    fn tile_widths_and_task_counts() {
        let base = ConvParameter::new(2, 9, 7, 6, 11, 3, 3).with_pad(1, 1, 1, 1);
        let (input, weight, bias) = random_operands(&base, 3);
        let want = reference_output(&base, &input, &weight, Some(&bias));
        for tile in 1..=12 {
            let kernel = RefKernel::with_tile(tile).unwrap();
            for thread_num in [1, 2, 5, 64] {
                let p = base.with_threads(thread_num);
                let got = run_direct(&p, &input, &weight, Some(&bias), &kernel);
                let diff_max = max_abs_diff(&got, &want);
                assert!(diff_max < EPS, "tile: {}, thread_num: {}, diff_max: {}", tile, thread_num, diff_max);
            }
        }
    }

    #[test]
    fn fused_activation_equals_clamp() {
        let base = ConvParameter::new(1, 6, 6, 5, 9, 3, 3);
        let (input, mut weight, bias) = random_operands(&base, 9);
        weight.iter_mut().for_each(|w| *w *= 3.0);
        let kernel = KernelSelector::detect();
        let plain = run_direct(&base, &input, &weight, Some(&bias), &kernel);
        for act in [ActType::Relu, ActType::Relu6] {
            let got = run_direct(&base.with_act(act), &input, &weight, Some(&bias), &kernel);
            let want: Vec<f32> = plain.iter().map(|&x| act.apply(x)).collect();
            assert_eq!(got, want, "act: {:?}", act);
        }
    }

    #[test]
    fn empty_task_writes_nothing() {
        // a single output pixel, one unit of work for four tasks
        let p = ConvParameter::new(1, 3, 3, 2, 3, 3, 3).with_threads(4);
        let (input, weight, _) = random_operands(&p, 1);
        let mut input4 = vec![0f32; nhwc4_size(1, 9, 2)];
        pack_nhwc_to_nhwc4(&input, &mut input4, 1, 9, 2).unwrap();
        let mut packed_weight = vec![0f32; packed_weight_size(&p)];
        pack_weight_fp32(&weight, &mut packed_weight, &p).unwrap();
        let kernel = RefKernel::new();
        let (packed_len, tmp_len) = DirectScratch::sizes(&p, &kernel);
        let mut packed_input = vec![-3f32; packed_len];
        let mut tmp_out_block = vec![-3f32; tmp_len];
        let mut out = vec![-3f32; p.output_size()];
        let lock = RangeLock::from(out.as_mut_slice());
        for task_id in 1..4 {
            let mut scratch = DirectScratch { packed_input: &mut packed_input, tmp_out_block: &mut tmp_out_block };
            conv_fp32(&input4, &packed_weight, None, &mut scratch, &lock, task_id, &p, &kernel).unwrap();
        }
        drop(lock);
        assert!(out.iter().chain(&packed_input).chain(&tmp_out_block).all(|&x| x == -3.0));
    }

    #[test]
    fn concurrent_tasks_match_sequential() {
        let p = ConvParameter::new(3, 12, 10, 7, 17, 3, 3).with_stride(1, 2).with_pad(1, 1, 0, 1).with_threads(4);
        let (input, weight, bias) = random_operands(&p, 21);
        let kernel = KernelSelector::detect();
        let want = run_direct(&p, &input, &weight, Some(&bias), &kernel);

        let mut input4 = vec![0f32; nhwc4_size(p.input_batch, p.input_plane(), p.input_channel)];
        pack_nhwc_to_nhwc4(&input, &mut input4, p.input_batch, p.input_plane(), p.input_channel).unwrap();
        let mut packed_weight = vec![0f32; packed_weight_size(&p)];
        pack_weight_fp32(&weight, &mut packed_weight, &p).unwrap();
        let mut out = vec![0f32; p.output_size()];
        {
            let lock = RangeLock::from(out.as_mut_slice());
            std::thread::scope(|s| {
                for task_id in 0..p.thread_num {
                    let (lock, input4, packed_weight, bias, p, kernel) =
                        (&lock, &input4, &packed_weight, &bias, &p, &kernel);
                    s.spawn(move || {
                        let (packed_len, tmp_len) = DirectScratch::sizes(p, kernel);
                        let mut packed_input = vec![0f32; packed_len];
                        let mut tmp_out_block = vec![0f32; tmp_len];
                        let mut scratch =
                            DirectScratch { packed_input: &mut packed_input, tmp_out_block: &mut tmp_out_block };
                        conv_fp32(input4, packed_weight, Some(bias.as_slice()), &mut scratch, lock, task_id, p, kernel).unwrap();
                    });
                }
            });
        }
        assert_eq!(out, want);
    }

    #[test]
    fn undersized_buffers_are_reported() {
        let p = ConvParameter::new(1, 5, 5, 3, 4, 3, 3);
        let kernel = RefKernel::new();
        let input4 = vec![0f32; nhwc4_size(1, 25, 3)];
        let packed_weight = vec![0f32; packed_weight_size(&p)];
        let (packed_len, tmp_len) = DirectScratch::sizes(&p, &kernel);
        let mut packed_input = vec![0f32; packed_len - 1];
        let mut tmp_out_block = vec![0f32; tmp_len];
        let mut out = vec![0f32; p.output_size()];
        let lock = RangeLock::from(out.as_mut_slice());
        let mut scratch = DirectScratch { packed_input: &mut packed_input, tmp_out_block: &mut tmp_out_block };
        let err = conv_fp32(&input4, &packed_weight, None, &mut scratch, &lock, 0, &p, &kernel).unwrap_err();
        assert!(matches!(err, ConvError::BufferTooSmall { name: "packed_input", .. }));
        let err = conv_fp32(&input4[1..], &packed_weight, None, &mut scratch, &lock, 0, &p, &kernel).unwrap_err();
        assert!(matches!(err, ConvError::BufferTooSmall { name: "input", .. }));
        let err = conv_fp32(&input4, &packed_weight, None, &mut scratch, &lock, 1, &p, &kernel).unwrap_err();
        assert_eq!(err, ConvError::InvalidTask { task_id: 1, thread_num: 1 });
    }
}
