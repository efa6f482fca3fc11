//! 样本格式转换
//!
//! 宿主以 f64 提供样本，渲染端只接受 f32。
//! 窄化使用 IEEE 就近舍入（与 `as f32` 一致），不做削波和抖动。
//!
//! 向量化内核在初始化时选择一次：
//! - x86_64: AVX（运行时检测）或 SSE2（基线）
//! - aarch64: NEON
//! - 其他: 标量
//!
//! 所有内核与标量路径逐位一致。

use thiserror::Error;

/// 转换错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Empty chunk: frames and channels must be non-zero")]
    Empty,

    #[error("Input too short: need {needed} samples, got {got}")]
    ShortInput { needed: usize, got: usize },

    #[error("Channel count mismatch: expected {expected}, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("Buffer length mismatch: expected {expected} samples, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Conversion kernel {0:?} is not supported on this CPU")]
    UnsupportedKernel(ConvertKernel),
}

/// 窄化内核
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConvertKernel {
    Scalar,
    Sse2,
    Avx,
    Neon,
}

impl ConvertKernel {
    /// 选择当前 CPU 上最快的内核
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx") {
                return ConvertKernel::Avx;
            }
            ConvertKernel::Sse2
        }

        #[cfg(target_arch = "aarch64")]
        {
            ConvertKernel::Neon
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            ConvertKernel::Scalar
        }
    }

    /// 当前 CPU 是否能运行该内核
    pub fn is_supported(self) -> bool {
        match self {
            ConvertKernel::Scalar => true,
            #[cfg(target_arch = "x86_64")]
            ConvertKernel::Sse2 => true,
            #[cfg(target_arch = "x86_64")]
            ConvertKernel::Avx => is_x86_feature_detected!("avx"),
            #[cfg(target_arch = "aarch64")]
            ConvertKernel::Neon => true,
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }

    /// 所有可用内核（标量在前）
    pub fn available() -> Vec<ConvertKernel> {
        [
            ConvertKernel::Scalar,
            ConvertKernel::Sse2,
            ConvertKernel::Avx,
            ConvertKernel::Neon,
        ]
        .into_iter()
        .filter(|k| k.is_supported())
        .collect()
    }

    pub fn name(self) -> &'static str {
        match self {
            ConvertKernel::Scalar => "scalar",
            ConvertKernel::Sse2 => "sse2",
            ConvertKernel::Avx => "avx",
            ConvertKernel::Neon => "neon",
        }
    }
}

impl std::str::FromStr for ConvertKernel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scalar" => Ok(ConvertKernel::Scalar),
            "sse2" => Ok(ConvertKernel::Sse2),
            "avx" => Ok(ConvertKernel::Avx),
            "neon" => Ok(ConvertKernel::Neon),
            other => Err(format!("unknown conversion kernel: {}", other)),
        }
    }
}

/// f64 → f32 转换器
#[derive(Debug, Clone, Copy)]
pub struct SampleConverter {
    kernel: ConvertKernel,
}

impl SampleConverter {
    /// 使用自动检测的内核
    pub fn new() -> Self {
        Self {
            kernel: ConvertKernel::detect(),
        }
    }

    /// 强制使用指定内核
    pub fn with_kernel(kernel: ConvertKernel) -> Result<Self, ConvertError> {
        if !kernel.is_supported() {
            return Err(ConvertError::UnsupportedKernel(kernel));
        }
        Ok(Self { kernel })
    }

    #[inline]
    pub fn kernel(&self) -> ConvertKernel {
        self.kernel
    }

    /// 窄化 `src` 到 `dst`，处理两者中较短的长度
    pub fn narrow(&self, src: &[f64], dst: &mut [f32]) {
        let len = src.len().min(dst.len());
        let (src, dst) = (&src[..len], &mut dst[..len]);

        match self.kernel {
            #[cfg(target_arch = "x86_64")]
            ConvertKernel::Sse2 => unsafe { narrow_sse2(src, dst) },
            #[cfg(target_arch = "x86_64")]
            ConvertKernel::Avx => unsafe { narrow_avx(src, dst) },
            #[cfg(target_arch = "aarch64")]
            ConvertKernel::Neon => unsafe { narrow_neon(src, dst) },
            _ => narrow_scalar(src, dst),
        }
    }

    /// 转换交织输入，输出长度恰为 `frames × channels`
    pub fn convert(
        &self,
        input: &[f64],
        frames: usize,
        channels: usize,
        out: &mut Vec<f32>,
    ) -> Result<(), ConvertError> {
        let needed = required_samples(frames, channels)?;
        if input.len() < needed {
            return Err(ConvertError::ShortInput {
                needed,
                got: input.len(),
            });
        }

        out.clear();
        out.resize(needed, 0.0);
        self.narrow(&input[..needed], out);
        Ok(())
    }

    /// 转换逐声道输入，输出为声道连续排列 (L...L R...R)
    pub fn convert_planar(
        &self,
        planes: &[&[f64]],
        frames: usize,
        out: &mut Vec<f32>,
    ) -> Result<(), ConvertError> {
        let channels = planes.len();
        let needed = required_samples(frames, channels)?;

        if let Some(short) = planes.iter().find(|p| p.len() < frames) {
            return Err(ConvertError::ShortInput {
                needed: frames,
                got: short.len(),
            });
        }

        out.clear();
        out.resize(needed, 0.0);
        for (plane, dst) in planes.iter().zip(out.chunks_exact_mut(frames)) {
            self.narrow(&plane[..frames], dst);
        }
        Ok(())
    }
}

impl Default for SampleConverter {
    fn default() -> Self {
        Self::new()
    }
}

fn required_samples(frames: usize, channels: usize) -> Result<usize, ConvertError> {
    if frames == 0 || channels == 0 {
        return Err(ConvertError::Empty);
    }
    frames
        .checked_mul(channels)
        .ok_or(ConvertError::ShortInput {
            needed: usize::MAX,
            got: 0,
        })
}

/// 交织 → 声道连续
///
/// `src` 为 LRLR...，写入 `dst` 为 L...L R...R
pub fn deinterleave(src: &[f32], channels: usize, dst: &mut [f32]) {
    if channels == 0 {
        return;
    }
    let frames = src.len().min(dst.len()) / channels;
    for (frame, samples) in src.chunks_exact(channels).take(frames).enumerate() {
        for (ch, &sample) in samples.iter().enumerate() {
            dst[ch * frames + frame] = sample;
        }
    }
}

/// 声道连续 → 交织
pub fn interleave(src: &[f32], channels: usize, dst: &mut [f32]) {
    if channels == 0 {
        return;
    }
    let frames = src.len().min(dst.len()) / channels;
    for (frame, out) in dst.chunks_exact_mut(channels).take(frames).enumerate() {
        for (ch, slot) in out.iter_mut().enumerate() {
            *slot = src[ch * frames + frame];
        }
    }
}

#[inline]
fn narrow_scalar(src: &[f64], dst: &mut [f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = s as f32;
    }
}

// cvtpd2ps 按 MXCSR 舍入，默认就近舍入，与 `as f32` 相同

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn narrow_sse2(src: &[f64], dst: &mut [f32]) {
    use std::arch::x86_64::*;

    let blocks = src.len() / 4;
    let sp = src.as_ptr();
    let dp = dst.as_mut_ptr();

    for i in 0..blocks {
        let j = i * 4;
        let lo = _mm_cvtpd_ps(_mm_loadu_pd(sp.add(j)));
        let hi = _mm_cvtpd_ps(_mm_loadu_pd(sp.add(j + 2)));
        _mm_storeu_ps(dp.add(j), _mm_movelh_ps(lo, hi));
    }

    let tail = blocks * 4;
    narrow_scalar(&src[tail..], &mut dst[tail..]);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
unsafe fn narrow_avx(src: &[f64], dst: &mut [f32]) {
    use std::arch::x86_64::*;

    let blocks = src.len() / 8;
    let sp = src.as_ptr();
    let dp = dst.as_mut_ptr();

    for i in 0..blocks {
        let j = i * 8;
        let a = _mm256_cvtpd_ps(_mm256_loadu_pd(sp.add(j)));
        let b = _mm256_cvtpd_ps(_mm256_loadu_pd(sp.add(j + 4)));
        _mm_storeu_ps(dp.add(j), a);
        _mm_storeu_ps(dp.add(j + 4), b);
    }

    let tail = blocks * 8;
    narrow_scalar(&src[tail..], &mut dst[tail..]);
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn narrow_neon(src: &[f64], dst: &mut [f32]) {
    use std::arch::aarch64::*;

    let blocks = src.len() / 8;
    let sp = src.as_ptr();
    let dp = dst.as_mut_ptr();

    for i in 0..blocks {
        let j = i * 8;
        let d0 = vld1q_f64(sp.add(j));
        let d1 = vld1q_f64(sp.add(j + 2));
        let d2 = vld1q_f64(sp.add(j + 4));
        let d3 = vld1q_f64(sp.add(j + 6));
        vst1q_f32(dp.add(j), vcombine_f32(vcvt_f32_f64(d0), vcvt_f32_f64(d1)));
        vst1q_f32(dp.add(j + 4), vcombine_f32(vcvt_f32_f64(d2), vcvt_f32_f64(d3)));
    }

    let tail = blocks * 8;
    narrow_scalar(&src[tail..], &mut dst[tail..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 覆盖满块和尾部的测试信号
    fn test_signal(len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| {
                let t = i as f64 / 48000.0;
                (2.0 * std::f64::consts::PI * 997.0 * t).sin() * 0.999_999_9 + 1e-9 * i as f64
            })
            .collect()
    }

    #[test]
    fn test_kernels_match_scalar_bit_for_bit() {
        let input = test_signal(1037);
        let scalar = SampleConverter::with_kernel(ConvertKernel::Scalar).unwrap();
        let mut reference = Vec::new();
        scalar.convert(&input, 1037, 1, &mut reference).unwrap();

        for kernel in ConvertKernel::available() {
            let converter = SampleConverter::with_kernel(kernel).unwrap();
            let mut out = Vec::new();
            converter.convert(&input, 1037, 1, &mut out).unwrap();

            let same = reference
                .iter()
                .zip(&out)
                .all(|(a, b)| a.to_bits() == b.to_bits());
            assert!(same, "kernel {:?} disagrees with scalar", kernel);
        }
    }

    #[test]
    fn test_narrowing_within_one_ulp() {
        let input = test_signal(4096);
        let converter = SampleConverter::new();
        let mut out = Vec::new();
        converter.convert(&input, 2048, 2, &mut out).unwrap();

        for (&wide, &narrow) in input.iter().zip(&out) {
            let reference = wide as f32;
            let ulp = (reference.to_bits() as i64 - narrow.to_bits() as i64).abs();
            assert!(ulp <= 1, "{} narrowed to {} ({} ulp)", wide, narrow, ulp);
        }
    }

    #[test]
    fn test_convert_output_length_and_no_clipping() {
        let converter = SampleConverter::new();
        let input = [1.5, -2.0, 0.25, 0.5, 0.75, 1.0, 9.0];
        let mut out = vec![42.0; 100];
        converter.convert(&input, 3, 2, &mut out).unwrap();

        assert_eq!(out.len(), 6);
        assert_eq!(out[0], 1.5);
        assert_eq!(out[1], -2.0);
    }

    #[test]
    fn test_convert_rejects_bad_input() {
        let converter = SampleConverter::new();
        let mut out = Vec::new();

        assert_eq!(converter.convert(&[0.0; 4], 0, 2, &mut out), Err(ConvertError::Empty));
        assert_eq!(converter.convert(&[0.0; 4], 2, 0, &mut out), Err(ConvertError::Empty));
        assert_eq!(
            converter.convert(&[0.0; 5], 3, 2, &mut out),
            Err(ConvertError::ShortInput { needed: 6, got: 5 })
        );
    }

    #[test]
    fn test_convert_planar() {
        let converter = SampleConverter::new();
        let left = [0.1, 0.2, 0.3];
        let right = [-0.1, -0.2, -0.3];
        let mut out = Vec::new();
        converter.convert_planar(&[&left, &right], 3, &mut out).unwrap();

        assert_eq!(out, vec![0.1f32, 0.2, 0.3, -0.1, -0.2, -0.3]);

        let short = [0.0; 2];
        assert!(matches!(
            converter.convert_planar(&[&left, &short], 3, &mut out),
            Err(ConvertError::ShortInput { .. })
        ));
    }

    #[test]
    fn test_deinterleave_roundtrip() {
        let interleaved: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let mut planar = vec![0.0; 24];
        let mut back = vec![0.0; 24];

        deinterleave(&interleaved, 3, &mut planar);
        // 声道 0: 0, 3, 6, ...
        assert_eq!(&planar[..8], &[0.0, 3.0, 6.0, 9.0, 12.0, 15.0, 18.0, 21.0]);
        assert_eq!(planar[8], 1.0);

        interleave(&planar, 3, &mut back);
        assert_eq!(back, interleaved);
    }

    #[test]
    fn test_kernel_parse_and_detect() {
        assert_eq!("AVX".parse::<ConvertKernel>(), Ok(ConvertKernel::Avx));
        assert!("mmx".parse::<ConvertKernel>().is_err());

        let detected = ConvertKernel::detect();
        assert!(detected.is_supported());
        assert!(ConvertKernel::available().contains(&ConvertKernel::Scalar));
    }
}
