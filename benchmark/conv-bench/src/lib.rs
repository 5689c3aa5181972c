use std::fmt;
use std::str::FromStr;

use aligned_vec::{avec, AVec, ConstAlign};
use serde::Serialize;

use sconv_base::Result;
use sconv_dev::{conv2d_fallback_f32, ConvDims};
use sconv_f32::{
    c4_panels_size, conv1x1_fp32_task, conv_fp32, conv_winograd_fp32, nhwc4_size, pack_nhwc_to_c4_panels,
    pack_nhwc_to_nhwc4, pack_weight_fp32, packed_weight_size, post_conv_fp32, strassen_task_tmp_size,
    winograd_filter_transform, winograd_weight_size, ConvParameter, DirectScratch, GemmKernel, KernelSelector,
    StrassenMatMulParameter, TaskOutput, WinogradBuffers, WinogradConfig,
};

pub const ALIGN: usize = 64;

type Buf = AVec<f32, ConstAlign<ALIGN>>;

fn zeroed(len: usize) -> Buf {
    avec![[ALIGN] | 0f32; len]
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BenchPath {
    Direct,
    Conv1x1,
    Winograd,
}

impl FromStr for BenchPath {
    type Err = String;

    fn from_str(path_str: &str) -> std::result::Result<Self, Self::Err> {
        match path_str {
            "direct" => Ok(BenchPath::Direct),
            "conv1x1" => Ok(BenchPath::Conv1x1),
            "winograd" => Ok(BenchPath::Winograd),
            _ => Err(format!("unknown path `{}`, expected direct, conv1x1 or winograd", path_str)),
        }
    }
}

impl fmt::Display for BenchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BenchPath::Direct => "direct",
            BenchPath::Conv1x1 => "conv1x1",
            BenchPath::Winograd => "winograd",
        };
        f.write_str(name)
    }
}

/// Operands of one path, packed once outside of the timed region
enum Prepared {
    Direct { input4: Buf, packed_weight: Buf },
    Conv1x1 { a: Buf, b: Buf, matmul_param: StrassenMatMulParameter },
    Winograd { input4: Buf, trans_weight: Buf, config: WinogradConfig },
}

pub struct ConvBench {
    path: BenchPath,
    param: ConvParameter,
    kernel: KernelSelector,
    bias: Vec<f32>,
    prepared: Prepared,
}

impl ConvBench {
    /// Packs NHWC `input` and OHWI `weight` into the layout `path` consumes
    pub fn new(
        path: BenchPath,
        param: ConvParameter,
        kernel: KernelSelector,
        input: &[f32],
        weight: &[f32],
        bias: &[f32],
    ) -> Result<Self> {
        let p = &param;
        let plane = p.input_plane();
        let prepared = match path {
            BenchPath::Direct => {
                let mut input4 = zeroed(nhwc4_size(p.input_batch, plane, p.input_channel));
                pack_nhwc_to_nhwc4(input, &mut input4, p.input_batch, plane, p.input_channel)?;
                let mut packed_weight = zeroed(packed_weight_size(p));
                pack_weight_fp32(weight, &mut packed_weight, p)?;
                Prepared::Direct { input4, packed_weight }
            }
            BenchPath::Conv1x1 => {
                let matmul_param = StrassenMatMulParameter::from_conv(p);
                matmul_param.check_conv(p)?;
                let row = p.input_batch * plane;
                let mut a = zeroed(c4_panels_size(row, p.input_channel));
                pack_nhwc_to_c4_panels(input, &mut a, row, p.input_channel)?;
                let mut b = zeroed(packed_weight_size(p));
                pack_weight_fp32(weight, &mut b, p)?;
                Prepared::Conv1x1 { a, b, matmul_param }
            }
            BenchPath::Winograd => {
                let config = WinogradConfig::for_conv(p, &kernel).or_else(|_| WinogradConfig::conv3x3(&kernel))?;
                config.check(p, &kernel)?;
                let mut input4 = zeroed(nhwc4_size(p.input_batch, plane, p.input_channel));
                pack_nhwc_to_nhwc4(input, &mut input4, p.input_batch, plane, p.input_channel)?;
                let mut trans_weight = zeroed(winograd_weight_size(p, &config));
                winograd_filter_transform(weight, &mut trans_weight, p, &config)?;
                Prepared::Winograd { input4, trans_weight, config }
            }
        };
        Ok(ConvBench { path, param, kernel, bias: bias.to_vec(), prepared })
    }

    pub fn path(&self) -> BenchPath {
        self.path
    }

    pub fn param(&self) -> &ConvParameter {
        &self.param
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// Multiply-adds of the convolution counted as two flops
    pub fn flops(&self) -> f64 {
        let p = &self.param;
        2.0 * (p.input_batch * p.output_plane() * p.output_channel) as f64 * (p.kernel_plane() * p.input_channel) as f64
    }

    /// Runs every task of one call on its own scoped thread, writing NHWC `output`
    pub fn run(&self, output: &mut [f32]) -> Result<()> {
        let p = &self.param;
        let kernel = &self.kernel;
        let bias = Some(self.bias.as_slice());
        match &self.prepared {
            Prepared::Direct { input4, packed_weight } => {
                let (packed_len, tmp_len) = DirectScratch::sizes(p, kernel);
                let lock = TaskOutput::from(output);
                run_tasks(p.thread_num, |task_id| {
                    let mut packed_input = zeroed(packed_len);
                    let mut tmp_out_block = zeroed(tmp_len);
                    let mut scratch = DirectScratch { packed_input: &mut packed_input, tmp_out_block: &mut tmp_out_block };
                    conv_fp32(input4, packed_weight, bias, &mut scratch, &lock, task_id, p, kernel)
                })
            }
            Prepared::Conv1x1 { a, b, matmul_param } => {
                let mut c = zeroed(matmul_param.c_len());
                {
                    let lock = TaskOutput::from(&mut c[..]);
                    let tmp_len = strassen_task_tmp_size(matmul_param, kernel.caps().tile_num, p.thread_num);
                    run_tasks(p.thread_num, |task_id| {
                        let mut tmp = zeroed(tmp_len);
                        conv1x1_fp32_task(a, b, &lock, &mut tmp, matmul_param, task_id, p.thread_num, kernel)
                    })?;
                }
                let row = p.input_batch * p.input_plane();
                post_conv_fp32(&c, output, bias, p.output_channel, row, matmul_param.c_stride, p.act_type)
            }
            Prepared::Winograd { input4, trans_weight, config } => {
                let (ti, go, td, to) = WinogradBuffers::sizes(p, config);
                let lock = TaskOutput::from(output);
                run_tasks(p.thread_num, |task_id| {
                    let (mut trans_input, mut gemm_out) = (zeroed(ti), zeroed(go));
                    let (mut tmp_data, mut tmp_out) = (zeroed(td), zeroed(to));
                    let mut buffers = WinogradBuffers {
                        trans_input: &mut trans_input,
                        gemm_out: &mut gemm_out,
                        tmp_data: &mut tmp_data,
                        tmp_out: &mut tmp_out,
                    };
                    conv_winograd_fp32(input4, trans_weight, bias, &mut buffers, &lock, task_id, p, config, kernel)
                })
            }
        }
    }
}

fn run_tasks<F>(thread_num: usize, task: F) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Sync,
{
    let task = &task;
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..thread_num).map(|task_id| s.spawn(move || task(task_id))).collect();
        handles.into_iter().map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e))).collect()
    })
}

pub fn reference_output(p: &ConvParameter, input: &[f32], weight: &[f32], bias: &[f32]) -> Vec<f32> {
    let dims = ConvDims {
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
    };
    let mut out = vec![0f32; p.output_size()];
    conv2d_fallback_f32(&dims, input, weight, Some(bias), p.act_type.is_relu(), p.act_type.is_relu6(), &mut out);
    out
}

#[derive(Serialize, Debug)]
pub struct BenchReport {
    pub path: String,
    pub kernel: String,
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub in_channel: usize,
    pub out_channel: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub threads: usize,
    pub times: Vec<f64>,
    pub best_time: f64,
    pub gflops: f64,
    pub diff: Option<f64>,
}

impl BenchReport {
    pub fn new(bench: &ConvBench, times: Vec<f64>, diff: Option<f64>) -> Self {
        let p = bench.param();
        let best_time = times.iter().copied().fold(f64::INFINITY, f64::min);
        BenchReport {
            path: bench.path().to_string(),
            kernel: bench.kernel_name().to_string(),
            batch: p.input_batch,
            height: p.input_h,
            width: p.input_w,
            in_channel: p.input_channel,
            out_channel: p.output_channel,
            kernel_h: p.kernel_h,
            kernel_w: p.kernel_w,
            threads: p.thread_num,
            times,
            best_time,
            gflops: bench.flops() / best_time / 1e9,
            diff,
        }
    }
}
