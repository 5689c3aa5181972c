//! Winograd transform matrices and the input / output transform pairs.
//!
//! Matrices are built with the Toom-Cook construction on the interpolation points
//! `0, 1, -1, 2, -2, 1/2, -1/2` plus the point at infinity. For input unit `n`,
//! output unit `m` and kernel `r` (`n = m + r - 1`) the 2D result of one block is
//! `AT [(G g GT) * (BT d B)] A`.

use sconv_base::{ConvError, Result};

use crate::kernel::{C4NUM, C8NUM};

/// Largest supported input unit
pub const MAX_UNIT: usize = 8;

const POINTS: [f64; MAX_UNIT - 1] = [0.0, 1.0, -1.0, 2.0, -2.0, 0.5, -0.5];

/// Transform unit keyed by input tile size
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WinogradUnit {
    Unit4,
    Unit6,
    Unit8,
}

impl WinogradUnit {
    pub fn from_input_unit(input_unit: usize) -> Result<Self> {
        match input_unit {
            4 => Ok(WinogradUnit::Unit4),
            6 => Ok(WinogradUnit::Unit6),
            8 => Ok(WinogradUnit::Unit8),
            _ => Err(ConvError::UnsupportedTransformUnit { input_unit }),
        }
    }

    pub fn input_unit(self) -> usize {
        match self {
            WinogradUnit::Unit4 => 4,
            WinogradUnit::Unit6 => 6,
            WinogradUnit::Unit8 => 8,
        }
    }
}

// (x - p_0)(x - p_1)... over `roots`, coefficients lowest degree first
fn poly_from_roots(roots: impl Iterator<Item = f64>, coeffs: &mut [f64]) {
    coeffs.fill(0.0);
    coeffs[0] = 1.0;
    let mut deg = 0;
    for r in roots {
        for i in (0..=deg).rev() {
            coeffs[i + 1] += coeffs[i];
            coeffs[i] *= -r;
        }
        deg += 1;
    }
}

/// Row major `AT (m x n)`, `G (n x r)` and `BT (n x n)` in f64
#[derive(Clone, Debug)]
pub(crate) struct WinogradMatrices {
    pub at: Vec<f64>,
    pub g: Vec<f64>,
    pub bt: Vec<f64>,
}

impl WinogradMatrices {
    pub fn generate(n: usize, m: usize) -> Self {
        let r = n + 1 - m;
        let pts = &POINTS[..n - 1];
        let mut at = vec![0f64; m * n];
        let mut g = vec![0f64; n * r];
        let mut bt = vec![0f64; n * n];

        for j in 0..m {
            for (i, &p) in pts.iter().enumerate() {
                at[j * n + i] = p.powi(j as i32);
            }
        }
        at[(m - 1) * n + n - 1] = 1.0;

        for (i, &p) in pts.iter().enumerate() {
            let f: f64 = pts.iter().enumerate().filter(|&(j, _)| j != i).map(|(_, &q)| p - q).product();
            // keep the scaling in G, flip signs so both rows read positive
            let sign = if f < 0.0 { -1.0 } else { 1.0 };
            for c in 0..r {
                g[i * r + c] = sign * p.powi(c as i32) / f;
            }
            let row = &mut bt[i * n..(i + 1) * n];
            poly_from_roots(pts.iter().enumerate().filter(|&(j, _)| j != i).map(|(_, &q)| q), row);
            row.iter_mut().for_each(|v| *v *= sign);
        }
        g[(n - 1) * r + r - 1] = 1.0;
        poly_from_roots(pts.iter().copied(), &mut bt[(n - 1) * n..]);

        WinogradMatrices { at, g, bt }
    }

    fn to_f32(v: &[f64]) -> Vec<f32> {
        v.iter().map(|&x| x as f32).collect()
    }
}

/// `BT d B` on `[n][n][4]` patches
#[derive(Clone, Debug)]
pub enum InputTransform {
    Unit4,
    Generic { n: usize, bt: Vec<f32> },
}

#[inline(always)]
fn bt4(d: [[f32; C4NUM]; 4]) -> [[f32; C4NUM]; 4] {
    let mut r = [[0f32; C4NUM]; 4];
    for l in 0..C4NUM {
        r[0][l] = d[0][l] - d[2][l];
        r[1][l] = d[1][l] + d[2][l];
        r[2][l] = d[2][l] - d[1][l];
        r[3][l] = d[3][l] - d[1][l];
    }
    r
}

impl InputTransform {
    pub fn input_unit(&self) -> usize {
        match self {
            InputTransform::Unit4 => 4,
            InputTransform::Generic { n, .. } => *n,
        }
    }

    /// Transforms the `[n][n][4]` patch `src`, point `(a, b)` lands at `dst[(a * n + b) * dst_step..][..4]`.
    /// `mid` holds `n * n * 4` intermediate values.
    pub fn apply(&self, src: &[f32], mid: &mut [f32], dst: &mut [f32], dst_step: usize) {
        match self {
            InputTransform::Unit4 => {
                let px = |y: usize, x: usize| {
                    let s = (y * 4 + x) * C4NUM;
                    [src[s], src[s + 1], src[s + 2], src[s + 3]]
                };
                let mut cols = [[[0f32; C4NUM]; 4]; 4];
                for x in 0..4 {
                    let t = bt4([px(0, x), px(1, x), px(2, x), px(3, x)]);
                    for a in 0..4 {
                        cols[a][x] = t[a];
                    }
                }
                for (a, row) in cols.iter().enumerate() {
                    for (b, v) in bt4(*row).iter().enumerate() {
                        let d = (a * 4 + b) * dst_step;
                        dst[d..d + C4NUM].copy_from_slice(v);
                    }
                }
            }
            InputTransform::Generic { n, bt } => {
                let n = *n;
                for a in 0..n {
                    for x in 0..n {
                        let m = &mut mid[(a * n + x) * C4NUM..(a * n + x + 1) * C4NUM];
                        m.fill(0.0);
                        for y in 0..n {
                            let c = bt[a * n + y];
                            if c == 0.0 {
                                continue;
                            }
                            let s = &src[(y * n + x) * C4NUM..(y * n + x + 1) * C4NUM];
                            m.iter_mut().zip(s).for_each(|(o, v)| *o += c * v);
                        }
                    }
                }
                for a in 0..n {
                    for b in 0..n {
                        let d = (a * n + b) * dst_step;
                        let o = &mut dst[d..d + C4NUM];
                        o.fill(0.0);
                        for x in 0..n {
                            let c = bt[b * n + x];
                            if c == 0.0 {
                                continue;
                            }
                            let s = &mid[(a * n + x) * C4NUM..(a * n + x + 1) * C4NUM];
                            o.iter_mut().zip(s).for_each(|(o, v)| *o += c * v);
                        }
                    }
                }
            }
        }
    }
}

/// `AT M A` from `[n][n][8]` products to `[m][m][8]` output blocks
#[derive(Clone, Debug)]
pub enum OutputTransform {
    Unit4To2,
    Generic { n: usize, m: usize, at: Vec<f32> },
}

impl OutputTransform {
    pub fn output_unit(&self) -> usize {
        match self {
            OutputTransform::Unit4To2 => 2,
            OutputTransform::Generic { m, .. } => *m,
        }
    }

    pub fn input_unit(&self) -> usize {
        match self {
            OutputTransform::Unit4To2 => 4,
            OutputTransform::Generic { n, .. } => *n,
        }
    }

    /// `src` is `[n][n][8]`, `dst` receives `[m][m][8]`, `mid` holds `n * n * 8` values
    pub fn apply(&self, src: &[f32], mid: &mut [f32], dst: &mut [f32]) {
        match self {
            OutputTransform::Unit4To2 => {
                // columns first, mid is [2][4][8]
                for x in 0..4 {
                    for l in 0..C8NUM {
                        let v = |y: usize| src[(y * 4 + x) * C8NUM + l];
                        mid[x * C8NUM + l] = v(0) + v(1) + v(2);
                        mid[(4 + x) * C8NUM + l] = v(1) - v(2) + v(3);
                    }
                }
                for j in 0..2 {
                    for l in 0..C8NUM {
                        let v = |x: usize| mid[(j * 4 + x) * C8NUM + l];
                        dst[j * 2 * C8NUM + l] = v(0) + v(1) + v(2);
                        dst[(j * 2 + 1) * C8NUM + l] = v(1) - v(2) + v(3);
                    }
                }
            }
            OutputTransform::Generic { n, m, at } => {
                let (n, m) = (*n, *m);
                for j in 0..m {
                    for b in 0..n {
                        let o = &mut mid[(j * n + b) * C8NUM..(j * n + b + 1) * C8NUM];
                        o.fill(0.0);
                        for a in 0..n {
                            let c = at[j * n + a];
                            if c == 0.0 {
                                continue;
                            }
                            let s = &src[(a * n + b) * C8NUM..(a * n + b + 1) * C8NUM];
                            o.iter_mut().zip(s).for_each(|(o, v)| *o += c * v);
                        }
                    }
                }
                for j in 0..m {
                    for i in 0..m {
                        let o = &mut dst[(j * m + i) * C8NUM..(j * m + i + 1) * C8NUM];
                        o.fill(0.0);
                        for b in 0..n {
                            let c = at[i * n + b];
                            if c == 0.0 {
                                continue;
                            }
                            let s = &mid[(j * n + b) * C8NUM..(j * n + b + 1) * C8NUM];
                            o.iter_mut().zip(s).for_each(|(o, v)| *o += c * v);
                        }
                    }
                }
            }
        }
    }
}

/// Input and output transform of one unit, plus the filter transform they pair with
#[derive(Clone, Debug)]
pub struct TransformPair {
    pub unit: WinogradUnit,
    pub input: InputTransform,
    pub output: OutputTransform,
    kernel_size: usize,
    g: Vec<f64>,
}

/// Transforms for `output_unit x output_unit` blocks of a `kernel_size` square kernel
pub fn transform_pair(output_unit: usize, kernel_size: usize) -> Result<TransformPair> {
    let input_unit = (output_unit + kernel_size).saturating_sub(1);
    let unit = WinogradUnit::from_input_unit(input_unit)?;
    if output_unit < 2 || kernel_size < 2 {
        return Err(ConvError::TransformUnitMismatch { input_unit, output_unit, kernel_size });
    }
    let mats = WinogradMatrices::generate(input_unit, output_unit);
    let input = match unit {
        WinogradUnit::Unit4 => InputTransform::Unit4,
        _ => InputTransform::Generic { n: input_unit, bt: WinogradMatrices::to_f32(&mats.bt) },
    };
    let output = match (unit, output_unit) {
        (WinogradUnit::Unit4, 2) => OutputTransform::Unit4To2,
        _ => OutputTransform::Generic { n: input_unit, m: output_unit, at: WinogradMatrices::to_f32(&mats.at) },
    };
    Ok(TransformPair { unit, input, output, kernel_size, g: mats.g })
}

impl TransformPair {
    pub fn input_unit(&self) -> usize {
        self.unit.input_unit()
    }

    pub fn output_unit(&self) -> usize {
        self.output.output_unit()
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// `G g GT` of one `r x r` filter (`g[ky * r + kx]`), written row major into `dst[..n * n]`
    pub fn transform_filter(&self, g: &[f64], dst: &mut [f64]) {
        let (n, r) = (self.input_unit(), self.kernel_size);
        let mut mid = [0f64; MAX_UNIT * MAX_UNIT];
        for a in 0..n {
            for x in 0..r {
                mid[a * r + x] = (0..r).map(|y| self.g[a * r + y] * g[y * r + x]).sum();
            }
        }
        for a in 0..n {
            for b in 0..n {
                dst[a * n + b] = (0..r).map(|x| mid[a * r + x] * self.g[b * r + x]).sum();
            }
        }
    }
}
