use thiserror::Error;

/// Result type returned by every convolution entry point
pub type Result<T> = std::result::Result<T, ConvError>;

/// Failure kinds reported by the convolution kernels
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvError {
    /// Dimensions are zero, inconsistent with each other or with the layout
    #[error("invalid shape: {reason}")]
    InvalidShape {
        /// What was inconsistent
        reason: String,
    },

    /// A caller provided buffer is shorter than the call requires
    #[error("buffer `{name}` too small: required {required} elements, got {actual}")]
    BufferTooSmall {
        /// Name of the buffer argument
        name: &'static str,
        /// Minimum number of f32 elements
        required: usize,
        /// Provided number of elements
        actual: usize,
    },

    /// No winograd transform exists for this input unit
    #[error("unsupported winograd input unit {input_unit}, expected one of 4, 6, 8")]
    UnsupportedTransformUnit {
        /// Requested input tile size
        input_unit: usize,
    },

    /// Input unit, output unit and kernel size do not describe the same transform
    #[error("winograd unit mismatch: input unit {input_unit} != output unit {output_unit} + kernel {kernel_size} - 1")]
    TransformUnitMismatch {
        /// Transform-domain tile size
        input_unit: usize,
        /// Spatial output tile size
        output_unit: usize,
        /// Square kernel size
        kernel_size: usize,
    },

    /// Buffers were sized for a different kernel tile width
    #[error("tile width mismatch: configured for {configured}, kernel computes {kernel}")]
    TileMismatch {
        /// Tile width the configuration was built for
        configured: usize,
        /// Tile width of the kernel used for the call
        kernel: usize,
    },

    /// Task id outside of the configured thread count
    #[error("task id {task_id} out of range for {thread_num} threads")]
    InvalidTask {
        /// Requested task id
        task_id: usize,
        /// Number of tasks sharing the output
        thread_num: usize,
    },

    /// Requested output range overlaps a range held by another task
    #[error("output range {start}..{end} overlaps a range held by another task")]
    RangeConflict {
        /// Start of the requested range
        start: usize,
        /// End of the requested range
        end: usize,
    },

    /// Requested output range lies outside of the output buffer
    #[error("output range {start}..{end} out of bounds for buffer of length {len}")]
    BadRange {
        /// Start of the requested range
        start: usize,
        /// End of the requested range
        end: usize,
        /// Length of the output buffer
        len: usize,
    },
}

impl ConvError {
    pub fn invalid_shape(reason: impl Into<String>) -> Self {
        ConvError::InvalidShape { reason: reason.into() }
    }
}

/// Returns `BufferTooSmall` when `buf` holds fewer than `required` elements
#[inline]
pub fn check_len<T>(name: &'static str, buf: &[T], required: usize) -> Result<()> {
    if buf.len() < required {
        return Err(ConvError::BufferTooSmall { name, required, actual: buf.len() });
    }
    Ok(())
}
