//! fp32 2D convolution operators.
//!
//! Three algorithms share one tile matmul primitive ([`GemmKernel`]):
//! im2col + matmul ([`conv_fp32`]) for any shape, a Strassen block matmul for pointwise
//! convolutions ([`conv1x1_fp32_task`]) and winograd ([`conv_winograd_fp32`], [`conv3x3_fp32`])
//! for small square kernels with stride 1. [`ConvPath::select`] picks one for a shape.
//!
//! Every entry point computes the output slice of one `task_id` and can be called
//! concurrently from a caller owned thread pool. Tasks of one call share the output through
//! a [`TaskOutput`] lock, scratch buffers are per task and sized by the `sizes` helpers.

pub mod conv;
pub mod conv_parameter;
pub mod dispatch;
pub mod kernel;
pub mod pack;
pub mod strassen;
pub mod winograd;

pub use sconv_base::{get_num_threads, ConvError, RangeLock, Result};

pub use conv::{conv_fp32, DirectScratch};
pub use conv_parameter::ConvParameter;
pub use dispatch::ConvPath;
pub use kernel::{ActType, GemmArgs, GemmKernel, GemmLayout, KernelCaps, KernelSelector, RefKernel, WriteMode};
pub use pack::{
    c4_panels_size, im2col_pack_unit_fp32, im2col_unit_size, nhwc4_size, pack_nhwc_to_c4_panels, pack_nhwc_to_nhwc4,
    pack_weight_fp32, packed_weight_size, post_conv_fp32, unpack_winograd_output,
};
pub use strassen::{
    conv1x1_fp32, conv1x1_fp32_task, strassen_depth, strassen_task_tmp_size, strassen_tmp_size,
    StrassenMatMulParameter,
};
pub use winograd::{
    conv3x3_fp32, conv_winograd_fp32, select_output_unit, transform_pair, winograd_filter_transform,
    winograd_weight_size, TransformPair, WinogradBuffers, WinogradConfig, WinogradUnit,
};

/// Output tensor of one convolution call, shared by its tasks
pub type TaskOutput<'a> = RangeLock<'a, f32>;
