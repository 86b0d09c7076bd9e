//! Template matching kernels
//!
//! Two implementations of the sum of absolute differences. `Wide` processes
//! 16 lanes per step so the compiler can lower it to vector instructions;
//! `Scalar` is the plain fallback. Both return identical sums.

const LANES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKernel {
    Scalar,
    Wide,
}

impl MatchKernel {
    /// Pick the kernel for the reported capability
    pub fn select(simd_capable: bool) -> Self {
        if simd_capable {
            MatchKernel::Wide
        } else {
            MatchKernel::Scalar
        }
    }

    /// Whether the running CPU has the vector extensions the wide kernel
    /// benefits from
    pub fn detect_capability() -> bool {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            std::arch::is_x86_feature_detected!("sse2")
        }
        #[cfg(target_arch = "aarch64")]
        {
            std::arch::is_aarch64_feature_detected!("neon")
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
        {
            false
        }
    }

    /// Sum of absolute differences over the common length of `a` and `b`
    #[inline]
    pub fn sad(self, a: &[u8], b: &[u8]) -> u32 {
        let len = a.len().min(b.len());
        let (a, b) = (&a[..len], &b[..len]);
        match self {
            MatchKernel::Scalar => sad_scalar(a, b),
            MatchKernel::Wide => sad_wide(a, b),
        }
    }
}

fn sad_scalar(a: &[u8], b: &[u8]) -> u32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| u32::from(x.abs_diff(y)))
        .sum()
}

fn sad_wide(a: &[u8], b: &[u8]) -> u32 {
    let mut lanes = [0u32; LANES];
    let chunks_a = a.chunks_exact(LANES);
    let chunks_b = b.chunks_exact(LANES);
    let tail = sad_scalar(chunks_a.remainder(), chunks_b.remainder());

    for (ca, cb) in chunks_a.zip(chunks_b) {
        for lane in 0..LANES {
            lanes[lane] += u32::from(ca[lane].abs_diff(cb[lane]));
        }
    }
    lanes.iter().sum::<u32>() + tail
}
