//! Layout conversions between the caller's NHWC / OHWI tensors and the
//! channel blocked layouts the kernels stream through.

use sconv_base::{check_len, up_div, up_round, ConvError, Result};

use crate::conv_parameter::ConvParameter;
use crate::kernel::{ActType, C4NUM, C8NUM};

pub fn nhwc4_size(batch: usize, plane: usize, channel: usize) -> usize {
    batch * plane * up_round(channel, C4NUM)
}

/// NHWC to NHWC with channels zero padded to a multiple of 4
pub fn pack_nhwc_to_nhwc4(src: &[f32], dst: &mut [f32], batch: usize, plane: usize, channel: usize) -> Result<()> {
    let c4 = up_round(channel, C4NUM);
    check_len("src", src, batch * plane * channel)?;
    check_len("dst", dst, nhwc4_size(batch, plane, channel))?;
    if channel == 0 {
        return Ok(());
    }
    for (s, d) in src.chunks_exact(channel).zip(dst.chunks_exact_mut(c4)).take(batch * plane) {
        d[..channel].copy_from_slice(s);
        d[channel..].fill(0.0);
    }
    Ok(())
}

pub fn c4_panels_size(row: usize, channel: usize) -> usize {
    up_div(channel, C4NUM) * row * C4NUM
}

/// `[row][channel]` to `[channel / 4][row][4]`, the A operand of the 1x1 path
pub fn pack_nhwc_to_c4_panels(src: &[f32], dst: &mut [f32], row: usize, channel: usize) -> Result<()> {
    check_len("src", src, row * channel)?;
    check_len("dst", dst, c4_panels_size(row, channel))?;
    let ic4 = up_div(channel, C4NUM);
    for k in 0..ic4 {
        let c0 = k * C4NUM;
        let c_len = (channel - c0).min(C4NUM);
        let panel = &mut dst[k * row * C4NUM..(k + 1) * row * C4NUM];
        for (r, d) in panel.chunks_exact_mut(C4NUM).enumerate() {
            let s = r * channel + c0;
            d[..c_len].copy_from_slice(&src[s..s + c_len]);
            d[c_len..].fill(0.0);
        }
    }
    Ok(())
}

pub fn packed_weight_size(conv_param: &ConvParameter) -> usize {
    conv_param.oc8() * conv_param.kernel_plane() * conv_param.ic4() * C4NUM * C8NUM
}

/// OHWI weights to `[oc / 8][kh * kw][ic / 4][4][8]`, zero padded in both channel dims
pub fn pack_weight_fp32(weight: &[f32], dst: &mut [f32], conv_param: &ConvParameter) -> Result<()> {
    let (oc, ic) = (conv_param.output_channel, conv_param.input_channel);
    let kernel_plane = conv_param.kernel_plane();
    let ic4 = conv_param.ic4();
    let size = packed_weight_size(conv_param);
    check_len("weight", weight, conv_param.weight_size())?;
    check_len("packed_weight", dst, size)?;
    let dst = &mut dst[..size];
    dst.fill(0.0);
    for o in 0..oc {
        let (j, lane) = (o / C8NUM, o % C8NUM);
        for n in 0..kernel_plane {
            let src = &weight[(o * kernel_plane + n) * ic..(o * kernel_plane + n + 1) * ic];
            let blk = (j * kernel_plane + n) * ic4;
            for (i, &v) in src.iter().enumerate() {
                let (k, m) = (i / C4NUM, i % C4NUM);
                dst[(blk + k) * C4NUM * C8NUM + m * C8NUM + lane] = v;
            }
        }
    }
    Ok(())
}

pub fn im2col_unit_size(conv_param: &ConvParameter, tile_num: usize) -> usize {
    conv_param.kernel_plane() * conv_param.ic4() * tile_num * C4NUM
}

/// Gathers the receptive fields of output pixels `block_index..block_index + real_cal_num`
/// of one NHWC4 image into `[kh * kw][ic / 4][tile_num][4]`.
/// Padding pixels and rows past `real_cal_num` are zero.
pub fn im2col_pack_unit_fp32(
    input: &[f32],
    conv_param: &ConvParameter,
    packed_input: &mut [f32],
    real_cal_num: usize,
    block_index: usize,
    tile_num: usize,
) -> Result<()> {
    let p = conv_param;
    let ic4 = p.ic4();
    let pixel_len = ic4 * C4NUM;
    let size = im2col_unit_size(p, tile_num);
    check_len("input", input, p.input_plane() * pixel_len)?;
    check_len("packed_input", packed_input, size)?;
    if real_cal_num > tile_num || block_index + real_cal_num > p.output_plane() {
        return Err(ConvError::invalid_shape(format!(
            "im2col unit {}..{} exceeds tile {} or output plane {}",
            block_index,
            block_index + real_cal_num,
            tile_num,
            p.output_plane()
        )));
    }
    let packed = &mut packed_input[..size];
    packed.fill(0.0);
    for i in 0..real_cal_num {
        let idx = block_index + i;
        let (oh, ow) = (idx / p.output_w, idx % p.output_w);
        let ih0 = (oh * p.stride_h) as isize - p.pad_u as isize;
        let iw0 = (ow * p.stride_w) as isize - p.pad_l as isize;
        for ky in 0..p.kernel_h {
            let y = ih0 + (ky * p.dilation_h) as isize;
            if y < 0 || y >= p.input_h as isize {
                continue;
            }
            for kx in 0..p.kernel_w {
                let x = iw0 + (kx * p.dilation_w) as isize;
                if x < 0 || x >= p.input_w as isize {
                    continue;
                }
                let n = ky * p.kernel_w + kx;
                let s0 = (y as usize * p.input_w + x as usize) * pixel_len;
                let src = &input[s0..s0 + pixel_len];
                for (k, s) in src.chunks_exact(C4NUM).enumerate() {
                    let d = ((n * ic4 + k) * tile_num + i) * C4NUM;
                    packed[d..d + C4NUM].copy_from_slice(s);
                }
            }
        }
    }
    Ok(())
}

/// `[oc / 8][row][8]` blocks with block stride `c_stride` to NHWC, adding bias and activation
pub fn post_conv_fp32(
    src: &[f32],
    dst: &mut [f32],
    bias: Option<&[f32]>,
    output_channel: usize,
    row: usize,
    c_stride: usize,
    act: ActType,
) -> Result<()> {
    let oc = output_channel;
    let oc8 = up_div(oc, C8NUM);
    if oc == 0 || row == 0 {
        return Ok(());
    }
    if c_stride < row * C8NUM {
        return Err(ConvError::invalid_shape(format!("block stride {} below {} rows", c_stride, row)));
    }
    check_len("src", src, (oc8 - 1) * c_stride + row * C8NUM)?;
    check_len("dst", dst, row * oc)?;
    if let Some(b) = bias {
        check_len("bias", b, oc)?;
    }
    for j in 0..oc8 {
        let c0 = j * C8NUM;
        let c_len = (oc - c0).min(C8NUM);
        let blk = &src[j * c_stride..j * c_stride + row * C8NUM];
        for (r, s) in blk.chunks_exact(C8NUM).enumerate() {
            let d = &mut dst[r * oc + c0..r * oc + c0 + c_len];
            for (c, v) in d.iter_mut().enumerate() {
                let b = bias.map_or(0.0, |b| b[c0 + c]);
                *v = act.apply(s[c] + b);
            }
        }
    }
    Ok(())
}

/// Position of one `output_unit x output_unit` block in an NHWC tensor
#[derive(Copy, Clone, Debug)]
pub(crate) struct BlockPos {
    pub batch: usize,
    pub y0: usize,
    pub x0: usize,
}

/// Copies channels `c0..c0 + c_len` of a `[ou][ou][pixel_stride]` block into NHWC `dst`,
/// dropping the part of the block outside `height x width`.
/// `dst` starts at element `dst_offset` of the full tensor.
#[allow(clippy::too_many_arguments)]
pub(crate) fn scatter_block(
    src: &[f32],
    pixel_stride: usize,
    dst: &mut [f32],
    dst_offset: usize,
    pos: BlockPos,
    (height, width, channel): (usize, usize, usize),
    (c0, c_len): (usize, usize),
    output_unit: usize,
) {
    let ou = output_unit;
    for oy in 0..ou.min(height.saturating_sub(pos.y0)) {
        let y = pos.y0 + oy;
        for ox in 0..ou.min(width.saturating_sub(pos.x0)) {
            let x = pos.x0 + ox;
            let s = (oy * ou + ox) * pixel_stride;
            let d = ((pos.batch * height + y) * width + x) * channel + c0 - dst_offset;
            dst[d..d + c_len].copy_from_slice(&src[s..s + c_len]);
        }
    }
}

/// Block major winograd output `[batch][h / ou][w / ou][ou][ou][channel]` to NHWC,
/// partial blocks on the bottom and right edges are truncated
pub fn unpack_winograd_output(
    src: &[f32],
    dst: &mut [f32],
    batch: usize,
    height: usize,
    width: usize,
    channel: usize,
    output_unit: usize,
) -> Result<()> {
    if output_unit == 0 {
        return Err(ConvError::invalid_shape("winograd output unit is zero"));
    }
    let ou = output_unit;
    let (h_blocks, w_blocks) = (up_div(height, ou), up_div(width, ou));
    let block_len = ou * ou * channel;
    check_len("src", src, batch * h_blocks * w_blocks * block_len)?;
    check_len("dst", dst, batch * height * width * channel)?;
    if block_len == 0 {
        return Ok(());
    }
    let blocks = src.chunks_exact(block_len).take(batch * h_blocks * w_blocks);
    for (idx, block) in blocks.enumerate() {
        let (b, rem) = (idx / (h_blocks * w_blocks), idx % (h_blocks * w_blocks));
        let pos = BlockPos { batch: b, y0: (rem / w_blocks) * ou, x0: (rem % w_blocks) * ou };
        scatter_block(block, channel, dst, 0, pos, (height, width, channel), (0, channel), ou);
    }
    Ok(())
}
