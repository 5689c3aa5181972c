use crate::conv_parameter::ConvParameter;
use crate::winograd::select_output_unit;

/// Convolution algorithm a dispatcher routes a `ConvParameter` to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConvPath {
    /// Pointwise convolution as a Strassen block matmul
    Conv1x1,
    /// Transform domain convolution with `output_unit x output_unit` blocks
    Winograd { output_unit: usize },
    /// im2col + matmul, any kernel, stride, padding and dilation
    Direct,
}

impl ConvPath {
    pub fn select(conv_param: &ConvParameter) -> Self {
        let path = if conv_param.is_pointwise() {
            ConvPath::Conv1x1
        } else if let Some(output_unit) = select_output_unit(conv_param) {
            ConvPath::Winograd { output_unit }
        } else {
            ConvPath::Direct
        };
        log::debug!(
            "{}x{} kernel, stride {}x{}, {} -> {} channels: {:?}",
            conv_param.kernel_h,
            conv_param.kernel_w,
            conv_param.stride_h,
            conv_param.stride_w,
            conv_param.input_channel,
            conv_param.output_channel,
            path
        );
        path
    }
}
