//! Tile matrix-multiply primitive shared by every convolution path.
//!
//! A kernel multiplies one tile of `tile_num` packed rows (`[blocks][tile][4]`)
//! with packed weights (`[oc8][blocks][4][8]`) and stores the result according
//! to [`GemmLayout`], adding bias and applying the fused activation on the way.

pub(crate) mod reference;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub(crate) mod x86_arch;

#[cfg(target_arch = "aarch64")]
pub(crate) mod arm64;

use sconv_base::{check_len, up_div, ConvError, Result};

pub use reference::RefKernel;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use x86_arch::SseKernel;

#[cfg(target_arch = "x86_64")]
pub use x86_arch::AvxFmaKernel;

#[cfg(target_arch = "aarch64")]
pub use arm64::NeonKernel;

/// Input channel block width
pub const C4NUM: usize = 4;
/// Output channel block width
pub const C8NUM: usize = 8;
/// Widest tile any kernel computes
pub const MAX_TILE: usize = 12;

/// Activation fused into the store of a tile
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ActType {
    #[default]
    Identity,
    Relu,
    Relu6,
}

impl ActType {
    pub fn from_flags(relu: bool, relu6: bool) -> Self {
        match (relu, relu6) {
            (_, true) => ActType::Relu6,
            (true, false) => ActType::Relu,
            (false, false) => ActType::Identity,
        }
    }

    pub fn is_relu(self) -> bool {
        self == ActType::Relu
    }

    pub fn is_relu6(self) -> bool {
        self == ActType::Relu6
    }

    #[inline(always)]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActType::Identity => x,
            ActType::Relu => x.max(0.0),
            ActType::Relu6 => x.max(0.0).min(6.0),
        }
    }
}

/// Where the result of one tile lands and whether `step` is reduced
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GemmLayout {
    /// `step` reduced, row `t` channel `c` at `t * offset + c`, padding channels are not written
    Nhwc,
    /// `step` reduced, at `(c / 8) * offset + t * 8 + c % 8`, all 8 lanes of each block written
    Blocked,
    /// `step` independent products, at `s * offset + (c / 8) * tile * 8 + t * 8 + c % 8`
    Winograd,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Accumulate,
}

/// Tiling and layout parameters of one kernel call
#[derive(Copy, Clone, Debug)]
pub struct GemmArgs {
    /// kernel plane for im2col, transform-domain points for winograd, 1 for plain matmul
    pub step: usize,
    /// number of 4-wide input channel blocks
    pub ic4: usize,
    /// real output channel count
    pub output_channel: usize,
    /// output stride, meaning depends on `layout`
    pub offset: usize,
    /// distance between consecutive `[tile][4]` input blocks
    pub input_stride: usize,
    /// distance between consecutive output channel blocks of the weight
    pub weight_stride: usize,
    pub layout: GemmLayout,
    pub write: WriteMode,
    pub act: ActType,
}

impl GemmArgs {
    fn blocks(&self) -> usize {
        self.step * self.ic4
    }

    pub fn input_len(&self, tile: usize) -> usize {
        match self.blocks() {
            0 => 0,
            b => (b - 1) * self.input_stride + tile * C4NUM,
        }
    }

    pub fn weight_len(&self) -> usize {
        let oc8 = up_div(self.output_channel, C8NUM);
        if oc8 == 0 || self.blocks() == 0 {
            return 0;
        }
        (oc8 - 1) * self.weight_stride + self.blocks() * C4NUM * C8NUM
    }

    pub fn output_len(&self, tile: usize) -> usize {
        let oc = self.output_channel;
        let oc8 = up_div(oc, C8NUM);
        if oc == 0 || tile == 0 {
            return 0;
        }
        match self.layout {
            GemmLayout::Nhwc => (tile - 1) * self.offset + oc,
            GemmLayout::Blocked => (oc8 - 1) * self.offset + tile * C8NUM,
            GemmLayout::Winograd => match self.step {
                0 => 0,
                s => (s - 1) * self.offset + oc8 * tile * C8NUM,
            },
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelCaps {
    /// rows computed per call
    pub tile_num: usize,
    pub ic_block: usize,
    pub oc_block: usize,
}

impl KernelCaps {
    pub const fn new(tile_num: usize) -> Self {
        KernelCaps { tile_num, ic_block: C4NUM, oc_block: C8NUM }
    }
}

pub trait GemmKernel: Send + Sync {
    fn caps(&self) -> KernelCaps;

    fn name(&self) -> &'static str;

    /// Computes `acc[t * 8 + c] = sum_b sum_m input[b * input_stride + t * 4 + m] * weight[b * 32 + m * 8 + c]`
    /// for every row `t` of the tile, overwriting `acc`.
    ///
    /// # Safety
    /// `input` must be readable for `(blocks - 1) * input_stride + tile * 4` elements,
    /// `weight` for `blocks * 32`, `acc` writable for `tile * 8`, and the instruction set
    /// the kernel was built for must be available.
    unsafe fn micro_tile(&self, input: *const f32, input_stride: usize, weight: *const f32, blocks: usize, acc: *mut f32);

    /// One tile matrix-multiply-accumulate, see [`GemmArgs`] for the operand layouts.
    /// Every buffer is checked against the extent `args` implies before anything is read.
    fn gemm(&self, out: &mut [f32], input: &[f32], weight: &[f32], bias: Option<&[f32]>, args: &GemmArgs) -> Result<()> {
        gemm_driver(self, out, input, weight, bias, args)
    }
}

#[inline(always)]
fn store_lanes(dst: &mut [f32], acc: &[f32], bias: Option<&[f32]>, write: WriteMode, act: ActType) {
    for (i, d) in dst.iter_mut().enumerate() {
        let mut v = acc[i] + bias.and_then(|b| b.get(i)).copied().unwrap_or(0.0);
        if write == WriteMode::Accumulate {
            v += *d;
        }
        *d = act.apply(v);
    }
}

fn gemm_driver<K: GemmKernel + ?Sized>(
    kernel: &K,
    out: &mut [f32],
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    args: &GemmArgs,
) -> Result<()> {
    let tile = kernel.caps().tile_num;
    if tile == 0 || tile > MAX_TILE {
        return Err(ConvError::invalid_shape(format!("kernel tile width {} outside 1..={}", tile, MAX_TILE)));
    }
    let oc = args.output_channel;
    if oc == 0 {
        return Ok(());
    }
    if args.step == 0 || args.ic4 == 0 {
        return Err(ConvError::invalid_shape("gemm with empty reduction"));
    }
    check_len("input", input, args.input_len(tile))?;
    check_len("weight", weight, args.weight_len())?;
    check_len("output", out, args.output_len(tile))?;
    if let Some(b) = bias {
        check_len("bias", b, oc)?;
    }

    let oc8 = up_div(oc, C8NUM);
    let (n_step, blocks) = match args.layout {
        GemmLayout::Winograd => (args.step, args.ic4),
        _ => (1, args.blocks()),
    };
    let mut acc = [0f32; MAX_TILE * C8NUM];
    for s in 0..n_step {
        let in_off = s * args.ic4 * args.input_stride;
        for j in 0..oc8 {
            let w_off = j * args.weight_stride + s * args.ic4 * C4NUM * C8NUM;
            // SAFETY: extents checked against input_len / weight_len above, acc holds MAX_TILE rows
            unsafe {
                kernel.micro_tile(
                    input.as_ptr().add(in_off),
                    args.input_stride,
                    weight.as_ptr().add(w_off),
                    blocks,
                    acc.as_mut_ptr(),
                );
            }
            let oc_start = j * C8NUM;
            let oc_real = (oc - oc_start).min(C8NUM);
            let bias_blk = bias.map(|b| &b[oc_start..oc_start + oc_real]);
            for t in 0..tile {
                let acc_row = &acc[t * C8NUM..(t + 1) * C8NUM];
                let dst = match args.layout {
                    GemmLayout::Nhwc => {
                        let o = t * args.offset + oc_start;
                        &mut out[o..o + oc_real]
                    }
                    GemmLayout::Blocked => {
                        let o = j * args.offset + t * C8NUM;
                        &mut out[o..o + C8NUM]
                    }
                    GemmLayout::Winograd => {
                        let o = s * args.offset + (j * tile + t) * C8NUM;
                        &mut out[o..o + C8NUM]
                    }
                };
                store_lanes(dst, acc_row, bias_blk, args.write, args.act);
            }
        }
    }
    Ok(())
}

macro_rules! for_each_kernel {
    ($self:ident, $k:ident => $e:expr) => {
        match $self {
            KernelSelector::Reference($k) => $e,
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            KernelSelector::Sse($k) => $e,
            #[cfg(target_arch = "x86_64")]
            KernelSelector::AvxFma($k) => $e,
            #[cfg(target_arch = "aarch64")]
            KernelSelector::Neon($k) => $e,
        }
    };
}

/// Concrete kernel chosen once per model and hardware
#[derive(Copy, Clone, Debug)]
pub enum KernelSelector {
    Reference(RefKernel),
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    Sse(SseKernel),
    #[cfg(target_arch = "x86_64")]
    AvxFma(AvxFmaKernel),
    #[cfg(target_arch = "aarch64")]
    Neon(NeonKernel),
}

impl KernelSelector {
    /// Most capable kernel the running cpu supports
    pub fn detect() -> Self {
        let selected = Self::detect_simd().unwrap_or(KernelSelector::Reference(RefKernel::new()));
        log::debug!("selected {} kernel, tile width {}", selected.name(), selected.caps().tile_num);
        selected
    }

    fn detect_simd() -> Option<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            if let Some(k) = AvxFmaKernel::new() {
                return Some(KernelSelector::AvxFma(k));
            }
        }
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if let Some(k) = SseKernel::new() {
                return Some(KernelSelector::Sse(k));
            }
        }
        #[cfg(target_arch = "aarch64")]
        {
            if let Some(k) = NeonKernel::new() {
                return Some(KernelSelector::Neon(k));
            }
        }
        None
    }

    pub fn reference() -> Self {
        KernelSelector::Reference(RefKernel::new())
    }

    /// Every kernel usable on this machine, reference first
    pub fn available() -> Vec<Self> {
        let mut kernels = vec![Self::reference()];
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if let Some(k) = SseKernel::new() {
                kernels.push(KernelSelector::Sse(k));
            }
        }
        #[cfg(target_arch = "x86_64")]
        {
            if let Some(k) = AvxFmaKernel::new() {
                kernels.push(KernelSelector::AvxFma(k));
            }
        }
        #[cfg(target_arch = "aarch64")]
        {
            if let Some(k) = NeonKernel::new() {
                kernels.push(KernelSelector::Neon(k));
            }
        }
        kernels
    }
}

impl GemmKernel for KernelSelector {
    fn caps(&self) -> KernelCaps {
        for_each_kernel!(self, k => k.caps())
    }

    fn name(&self) -> &'static str {
        for_each_kernel!(self, k => k.name())
    }

    unsafe fn micro_tile(&self, input: *const f32, input_stride: usize, weight: *const f32, blocks: usize, acc: *mut f32) {
        for_each_kernel!(self, k => k.micro_tile(input, input_stride, weight, blocks, acc))
    }
}
