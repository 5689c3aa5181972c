use sconv_base::{split_range, up_div, ConvError, Result};

use crate::kernel::{ActType, C4NUM, C8NUM};

/// Shape, stride, padding, dilation and threading of one convolution call
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConvParameter {
    pub input_batch: usize,
    pub input_h: usize,
    pub input_w: usize,
    pub input_channel: usize,
    pub output_h: usize,
    pub output_w: usize,
    pub output_channel: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub pad_u: usize,
    pub pad_d: usize,
    pub pad_l: usize,
    pub pad_r: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub thread_num: usize,
    pub act_type: ActType,
}

fn out_extent(input: usize, kernel: usize, stride: usize, pad: usize, dilation: usize) -> usize {
    let window = dilation * (kernel.max(1) - 1) + 1;
    let padded = input + pad;
    if stride == 0 || padded < window {
        return 0;
    }
    (padded - window) / stride + 1
}

impl ConvParameter {
    /// Stride 1, no padding, no dilation, single task
    pub fn new(
        batch: usize,
        input_h: usize,
        input_w: usize,
        input_channel: usize,
        output_channel: usize,
        kernel_h: usize,
        kernel_w: usize,
    ) -> Self {
        let mut p = ConvParameter {
            input_batch: batch,
            input_h,
            input_w,
            input_channel,
            output_h: 0,
            output_w: 0,
            output_channel,
            kernel_h,
            kernel_w,
            stride_h: 1,
            stride_w: 1,
            pad_u: 0,
            pad_d: 0,
            pad_l: 0,
            pad_r: 0,
            dilation_h: 1,
            dilation_w: 1,
            thread_num: 1,
            act_type: ActType::Identity,
        };
        p.infer_output_shape();
        p
    }

    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = stride_h;
        self.stride_w = stride_w;
        self.infer_output_shape();
        self
    }

    pub fn with_pad(mut self, pad_u: usize, pad_d: usize, pad_l: usize, pad_r: usize) -> Self {
        self.pad_u = pad_u;
        self.pad_d = pad_d;
        self.pad_l = pad_l;
        self.pad_r = pad_r;
        self.infer_output_shape();
        self
    }

    pub fn with_dilation(mut self, dilation_h: usize, dilation_w: usize) -> Self {
        self.dilation_h = dilation_h;
        self.dilation_w = dilation_w;
        self.infer_output_shape();
        self
    }

    pub fn with_threads(mut self, thread_num: usize) -> Self {
        self.thread_num = thread_num;
        self
    }

    pub fn with_act(mut self, act_type: ActType) -> Self {
        self.act_type = act_type;
        self
    }

    fn infer_output_shape(&mut self) {
        self.output_h = out_extent(self.input_h, self.kernel_h, self.stride_h, self.pad_u + self.pad_d, self.dilation_h);
        self.output_w = out_extent(self.input_w, self.kernel_w, self.stride_w, self.pad_l + self.pad_r, self.dilation_w);
    }

    pub fn ic4(&self) -> usize {
        up_div(self.input_channel, C4NUM)
    }

    pub fn oc8(&self) -> usize {
        up_div(self.output_channel, C8NUM)
    }

    pub fn kernel_plane(&self) -> usize {
        self.kernel_h * self.kernel_w
    }

    pub fn input_plane(&self) -> usize {
        self.input_h * self.input_w
    }

    pub fn output_plane(&self) -> usize {
        self.output_h * self.output_w
    }

    pub fn input_size(&self) -> usize {
        self.input_batch * self.input_plane() * self.input_channel
    }

    pub fn weight_size(&self) -> usize {
        self.output_channel * self.kernel_plane() * self.input_channel
    }

    pub fn output_size(&self) -> usize {
        self.input_batch * self.output_plane() * self.output_channel
    }

    /// 1x1 kernel, stride 1, no padding, no dilation: the convolution is a plain matmul
    pub fn is_pointwise(&self) -> bool {
        self.kernel_h == 1
            && self.kernel_w == 1
            && self.stride_h == 1
            && self.stride_w == 1
            && self.pad_u == 0
            && self.pad_d == 0
            && self.pad_l == 0
            && self.pad_r == 0
    }

    /// Rejects zero extents and task ids outside of `thread_num`
    pub fn check(&self, task_id: usize) -> Result<()> {
        let dims = [
            ("batch", self.input_batch),
            ("input height", self.input_h),
            ("input width", self.input_w),
            ("input channel", self.input_channel),
            ("output channel", self.output_channel),
            ("kernel height", self.kernel_h),
            ("kernel width", self.kernel_w),
            ("stride height", self.stride_h),
            ("stride width", self.stride_w),
            ("dilation height", self.dilation_h),
            ("dilation width", self.dilation_w),
            ("thread count", self.thread_num),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(ConvError::invalid_shape(format!("{} is zero", name)));
        }
        if task_id >= self.thread_num {
            return Err(ConvError::InvalidTask { task_id, thread_num: self.thread_num });
        }
        Ok(())
    }

    /// Contiguous share of `units` work units owned by `task_id`
    pub(crate) fn task_units(&self, units: usize, task_id: usize) -> (usize, usize) {
        let (start, end) = split_range(units, 1, task_id, self.thread_num);
        log::trace!("task {}/{} owns units {}..{} of {}", task_id, self.thread_num, start, end, units);
        (start, end)
    }
}
