//! # This crate is only for internal use in the sconv project
//! Nothing is expected to be used outside this module
//! No semver guarantees

use once_cell::sync::Lazy;

pub mod error;
pub mod range_lock;

pub use error::{check_len, ConvError, Result};
pub use range_lock::{RangeLock, RangeLockWriteGuard};

#[cfg(target_arch = "x86_64")]
#[derive(Copy, Clone, Debug)]
pub struct CpuFeatures {
    pub sse: bool,
    pub sse2: bool,
    pub sse3: bool,
    pub avx: bool,
    pub avx2: bool,
    pub avx512f: bool,
    pub fma: bool,
}

#[cfg(target_arch = "x86")]
#[derive(Copy, Clone, Debug)]
pub struct CpuFeatures {
    pub sse: bool,
    pub sse2: bool,
    pub sse3: bool,
}

#[cfg(target_arch = "aarch64")]
#[derive(Copy, Clone, Debug)]
pub struct CpuFeatures {
    pub neon: bool,
    pub sve: bool,
    pub fp16: bool,
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
#[derive(Copy, Clone, Debug)]
pub struct CpuFeatures {
    pub dummy: bool,
}

#[derive(Copy, Clone, Debug)]
pub struct HWConfig {
    pub cpu_ft: CpuFeatures,
    pub hw_model: HWModel,
}

impl HWConfig {
    pub fn hw_model(&self) -> HWModel {
        self.hw_model
    }

    pub fn cpu_ft(&self) -> CpuFeatures {
        self.cpu_ft
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HWModel {
    Reference,
    Haswell,
    Skylake,
}

const SKYLAKE: [u8; 13] = [78, 85, 94, 126, 140, 141, 167, 151, 154, 183, 186, 143, 207];

const HASWELL: [u8; 10] = [69, 70, 63, 42, 58, 165, 79, 86, 61, 71];

impl HWModel {
    pub fn from_hw(family_id: u8, model_id: u8, _cpu_ft: CpuFeatures) -> Self {
        if family_id == 6 {
            if SKYLAKE.contains(&model_id) {
                return HWModel::Skylake;
            }
            if HASWELL.contains(&model_id) {
                return HWModel::Haswell;
            }
        }
        // unknown model id, fall back to the feature set
        #[cfg(target_arch = "x86_64")]
        {
            if _cpu_ft.avx512f {
                return HWModel::Skylake;
            }
            if _cpu_ft.avx {
                return HWModel::Haswell;
            }
        }

        HWModel::Reference
    }

    /// (mc, nc, kc) blocking in elements
    pub fn cache_params(&self) -> (usize, usize, usize) {
        match self {
            HWModel::Reference => (4800, 256, 128),
            HWModel::Haswell => (4800, 256, 256),
            HWModel::Skylake => (4800, 384, 384),
        }
    }
}

#[inline]
fn detect_hw_config() -> HWConfig {
    #[cfg(target_arch = "x86_64")]
    {
        let cpuid = raw_cpuid::CpuId::new();
        let feature_info = cpuid.get_feature_info();
        let extended_feature_info = cpuid.get_extended_feature_info();
        let has = |f: fn(&raw_cpuid::FeatureInfo) -> bool| feature_info.as_ref().map_or(false, f);
        let has_ext = |f: fn(&raw_cpuid::ExtendedFeatures) -> bool| extended_feature_info.as_ref().map_or(false, f);
        let cpu_ft = CpuFeatures {
            sse: has(|x| x.has_sse()),
            sse2: has(|x| x.has_sse2()),
            sse3: has(|x| x.has_sse3()),
            avx: has(|x| x.has_avx()),
            fma: has(|x| x.has_fma()),
            avx2: has_ext(|x| x.has_avx2()),
            avx512f: has_ext(|x| x.has_avx512f()),
        };
        let family_id = feature_info.as_ref().map_or(0, |x| x.family_id());
        let model_id = feature_info.as_ref().map_or(0, |x| x.model_id());
        let hw_model = HWModel::from_hw(family_id, model_id, cpu_ft);
        return HWConfig { cpu_ft, hw_model };
    }
    #[cfg(target_arch = "x86")]
    {
        let cpuid = raw_cpuid::CpuId::new();
        let feature_info = cpuid.get_feature_info();
        let has = |f: fn(&raw_cpuid::FeatureInfo) -> bool| feature_info.as_ref().map_or(false, f);
        let cpu_ft = CpuFeatures { sse: has(|x| x.has_sse()), sse2: has(|x| x.has_sse2()), sse3: has(|x| x.has_sse3()) };
        let family_id = feature_info.as_ref().map_or(0, |x| x.family_id());
        let model_id = feature_info.as_ref().map_or(0, |x| x.model_id());
        let hw_model = HWModel::from_hw(family_id, model_id, cpu_ft);
        return HWConfig { cpu_ft, hw_model };
    }
    #[cfg(target_arch = "aarch64")]
    {
        use std::arch::is_aarch64_feature_detected;
        let neon = is_aarch64_feature_detected!("neon");
        let sve = is_aarch64_feature_detected!("sve");
        let fp16 = is_aarch64_feature_detected!("fp16");

        return HWConfig { cpu_ft: CpuFeatures { neon, sve, fp16 }, hw_model: HWModel::Reference };
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
    {
        return HWConfig { cpu_ft: CpuFeatures { dummy: false }, hw_model: HWModel::Reference };
    }
}

#[cfg(feature = "debug_cpu_features")]
fn turn_off(name: &str, enabled: &mut bool) {
    let var = format!("SCONV_{}_OFF", name);
    if *enabled && std::env::var(&var).is_ok() {
        log::warn!("{} is set, disabling {}", var, name.to_lowercase());
        *enabled = false;
    }
}

#[cfg(feature = "debug_cpu_features")]
fn apply_debug_cpu_features(cpu_ft: &mut CpuFeatures) {
    #[cfg(target_arch = "x86_64")]
    {
        turn_off("SSE", &mut cpu_ft.sse);
        turn_off("SSE2", &mut cpu_ft.sse2);
        turn_off("SSE3", &mut cpu_ft.sse3);
        turn_off("AVX", &mut cpu_ft.avx);
        turn_off("AVX2", &mut cpu_ft.avx2);
        turn_off("AVX512F", &mut cpu_ft.avx512f);
        turn_off("FMA", &mut cpu_ft.fma);
    }
    #[cfg(target_arch = "x86")]
    {
        turn_off("SSE", &mut cpu_ft.sse);
        turn_off("SSE2", &mut cpu_ft.sse2);
        turn_off("SSE3", &mut cpu_ft.sse3);
    }
    #[cfg(target_arch = "aarch64")]
    {
        turn_off("NEON", &mut cpu_ft.neon);
        turn_off("SVE", &mut cpu_ft.sve);
        turn_off("FP16", &mut cpu_ft.fp16);
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
    {
        turn_off("DUMMY", &mut cpu_ft.dummy);
    }
}

#[cfg(not(feature = "debug_cpu_features"))]
pub static RUNTIME_HW_CONFIG: Lazy<HWConfig> = Lazy::new(detect_hw_config);
#[cfg(feature = "debug_cpu_features")]
pub static RUNTIME_HW_CONFIG: Lazy<HWConfig> = Lazy::new(|| {
    let mut hw_config = detect_hw_config();
    apply_debug_cpu_features(&mut hw_config.cpu_ft);
    hw_config
});

fn env_usize(name: &str) -> Option<usize> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse::<usize>() {
        Ok(x) => Some(x),
        Err(_) => {
            log::warn!("ignoring {}={:?}, expected an unsigned integer", name, value);
            None
        }
    }
}

/// Default number of tasks a caller splits one convolution into:
/// SCONV_NUM_THREADS or the number of logical cores
pub static SCONV_NUM_THREADS: Lazy<usize> = Lazy::new(|| {
    let n_core = std::thread::available_parallelism().map_or(1, |n| n.get());
    env_usize("SCONV_NUM_THREADS").filter(|&n| n > 0).unwrap_or(n_core)
});

/// Default recursion cap of the 1x1 block matmul
pub static SCONV_STRASSEN_MAX_DEPTH: Lazy<usize> =
    Lazy::new(|| env_usize("SCONV_STRASSEN_MAX_DEPTH").unwrap_or(DEFAULT_STRASSEN_MAX_DEPTH));

pub const DEFAULT_STRASSEN_MAX_DEPTH: usize = 3;

pub fn get_num_threads() -> usize {
    *SCONV_NUM_THREADS
}

pub mod cpu_features {
    use super::HWModel;
    use super::RUNTIME_HW_CONFIG;

    pub fn hw_model() -> HWModel {
        RUNTIME_HW_CONFIG.hw_model
    }

    #[cfg(target_arch = "x86_64")]
    pub fn has_avx_fma() -> bool {
        RUNTIME_HW_CONFIG.cpu_ft.avx && RUNTIME_HW_CONFIG.cpu_ft.fma
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
    pub fn has_sse() -> bool {
        RUNTIME_HW_CONFIG.cpu_ft.sse
    }

    #[cfg(target_arch = "aarch64")]
    pub fn has_neon() -> bool {
        RUNTIME_HW_CONFIG.cpu_ft.neon
    }

    pub fn get_cache_params() -> (usize, usize, usize) {
        hw_model().cache_params()
    }
}

#[inline]
pub fn up_div(x: usize, y: usize) -> usize {
    (x + y - 1) / y
}

#[inline]
pub fn up_round(x: usize, y: usize) -> usize {
    up_div(x, y) * y
}

/// Contiguous share `[start, end)` of `range_len` for task `r_id` out of `r_par`,
/// boundaries fall on multiples of `unit_len` except for the last task
#[inline]
pub fn split_range(range_len: usize, unit_len: usize, r_id: usize, r_par: usize) -> (usize, usize) {
    let chunk_start = (range_len / (unit_len * r_par)) * unit_len * r_id;
    let chunk_end = (range_len / (unit_len * r_par)) * unit_len * (r_id + 1);
    let rem = range_len % (unit_len * r_par);
    let rem = rem - rem % unit_len;
    let rem_start = rem.min(r_id * unit_len);
    let rem_end = rem.min((r_id + 1) * unit_len);
    if r_id == r_par - 1 {
        return (chunk_start + rem_start, range_len);
    }
    (chunk_start + rem_start, chunk_end + rem_end)
}
