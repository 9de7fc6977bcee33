//! Floating-point kernel: thin glue over Berkeley SoftFloat, which
//! produces the exact IEEE-754 exception flags the fflags CSR observes.

use softfloat_wrapper::{ExceptionFlags, Float, RoundingMode, F32, F64};

pub const FFLAG_NX: u32 = 1 << 0;
pub const FFLAG_UF: u32 = 1 << 1;
pub const FFLAG_OF: u32 = 1 << 2;
pub const FFLAG_DZ: u32 = 1 << 3;
pub const FFLAG_NV: u32 = 1 << 4;

/// Upper bits a 32-bit value must carry inside a 64-bit FP register.
pub const F32_HIGH: u64 = 0xffff_ffff_0000_0000;

const F32_QNAN: u32 = 0x7fc0_0000;
const F64_QNAN: u64 = 0x7ff8_0000_0000_0000;

pub fn nanbox32(v: u32) -> u64 {
    (v as u64) | F32_HIGH
}

/// Read a single-precision operand out of a 64-bit register. A value that
/// is not properly NaN-boxed reads as the canonical quiet NaN.
pub fn unbox32(r: u64) -> u32 {
    if r >> 32 == 0xffff_ffff {
        r as u32
    } else {
        F32_QNAN
    }
}

/// Map an architectural rounding mode (already validated, < 5) onto the
/// soft-float kernel's.
pub fn rounding_mode(rm: u32) -> RoundingMode {
    match rm {
        0 => RoundingMode::TiesToEven,
        1 => RoundingMode::TowardZero,
        2 => RoundingMode::TowardNegative,
        3 => RoundingMode::TowardPositive,
        _ => RoundingMode::TiesToAway,
    }
}

/// Run one kernel operation with a clean accumulated-flag state and return
/// its result together with the fflags bits it raised.
fn capture<T>(f: impl FnOnce() -> T) -> (T, u32) {
    ExceptionFlags::default().set();
    let out = f();
    let mut flags = ExceptionFlags::default();
    flags.get();
    let mut bits = 0;
    if flags.is_inexact() {
        bits |= FFLAG_NX;
    }
    if flags.is_underflow() {
        bits |= FFLAG_UF;
    }
    if flags.is_overflow() {
        bits |= FFLAG_OF;
    }
    if flags.is_infinite() {
        bits |= FFLAG_DZ;
    }
    if flags.is_invalid() {
        bits |= FFLAG_NV;
    }
    (out, bits)
}

pub fn fadd<F: Float>(a: F::Payload, b: F::Payload, rm: RoundingMode) -> (F::Payload, u32) {
    capture(|| F::from_bits(a).add(F::from_bits(b), rm).to_bits())
}

pub fn fsub<F: Float>(a: F::Payload, b: F::Payload, rm: RoundingMode) -> (F::Payload, u32) {
    capture(|| F::from_bits(a).sub(F::from_bits(b), rm).to_bits())
}

pub fn fmul<F: Float>(a: F::Payload, b: F::Payload, rm: RoundingMode) -> (F::Payload, u32) {
    capture(|| F::from_bits(a).mul(F::from_bits(b), rm).to_bits())
}

pub fn fdiv<F: Float>(a: F::Payload, b: F::Payload, rm: RoundingMode) -> (F::Payload, u32) {
    capture(|| F::from_bits(a).div(F::from_bits(b), rm).to_bits())
}

pub fn fsqrt<F: Float>(a: F::Payload, rm: RoundingMode) -> (F::Payload, u32) {
    capture(|| F::from_bits(a).sqrt(rm).to_bits())
}

/// a*b + c, fused.
pub fn fma<F: Float>(
    a: F::Payload,
    b: F::Payload,
    c: F::Payload,
    rm: RoundingMode,
) -> (F::Payload, u32) {
    capture(|| {
        F::from_bits(a)
            .fused_mul_add(F::from_bits(b), F::from_bits(c), rm)
            .to_bits()
    })
}

pub fn feq<F: Float>(a: F::Payload, b: F::Payload) -> (bool, u32) {
    capture(|| F::from_bits(a).eq(F::from_bits(b)))
}

pub fn flt<F: Float>(a: F::Payload, b: F::Payload) -> (bool, u32) {
    capture(|| F::from_bits(a).lt(F::from_bits(b)))
}

pub fn fle<F: Float>(a: F::Payload, b: F::Payload) -> (bool, u32) {
    capture(|| F::from_bits(a).le(F::from_bits(b)))
}

// Integer conversions. The kernel already saturates exactly the way the
// architecture requires (NaN to the maximum positive value).

pub fn fcvt_w<F: Float>(a: F::Payload, rm: RoundingMode) -> (u64, u32) {
    capture(|| F::from_bits(a).to_i32(rm, true) as i64 as u64)
}

pub fn fcvt_wu<F: Float>(a: F::Payload, rm: RoundingMode) -> (u64, u32) {
    capture(|| F::from_bits(a).to_u32(rm, true) as i32 as i64 as u64)
}

pub fn fcvt_l<F: Float>(a: F::Payload, rm: RoundingMode) -> (u64, u32) {
    capture(|| F::from_bits(a).to_i64(rm, true) as u64)
}

pub fn fcvt_lu<F: Float>(a: F::Payload, rm: RoundingMode) -> (u64, u32) {
    capture(|| F::from_bits(a).to_u64(rm, true))
}

pub fn fcvt_from_w<F: Float>(v: i32, rm: RoundingMode) -> (F::Payload, u32) {
    capture(|| F::from_i32(v, rm).to_bits())
}

pub fn fcvt_from_wu<F: Float>(v: u32, rm: RoundingMode) -> (F::Payload, u32) {
    capture(|| F::from_u32(v, rm).to_bits())
}

pub fn fcvt_from_l<F: Float>(v: i64, rm: RoundingMode) -> (F::Payload, u32) {
    capture(|| F::from_i64(v, rm).to_bits())
}

pub fn fcvt_from_lu<F: Float>(v: u64, rm: RoundingMode) -> (F::Payload, u32) {
    capture(|| F::from_u64(v, rm).to_bits())
}

pub fn fcvt_s_d(a: u64, rm: RoundingMode) -> (u32, u32) {
    capture(|| F64::from_bits(a).to_f32(rm).to_bits())
}

pub fn fcvt_d_s(a: u32, rm: RoundingMode) -> (u64, u32) {
    capture(|| F32::from_bits(a).to_f64(rm).to_bits())
}

// min/max carry architecture-specific NaN and signed-zero rules, so they
// are built from quiet comparisons over the raw bits.

macro_rules! min_max {
    ($min:ident, $max:ident, $F:ty, $bits:ty, $sign:expr, $qnan:expr) => {
        pub fn $min(a: $bits, b: $bits) -> ($bits, u32) {
            let fa = <$F>::from_bits(a);
            let fb = <$F>::from_bits(b);
            let mut fl = 0;
            if fa.is_signaling_nan() || fb.is_signaling_nan() {
                fl |= FFLAG_NV;
            }
            let r = if fa.is_nan() && fb.is_nan() {
                $qnan
            } else if fa.is_nan() {
                b
            } else if fb.is_nan() {
                a
            } else if fa.lt_quiet(fb) {
                a
            } else if fb.lt_quiet(fa) {
                b
            } else if a & $sign != 0 {
                // Equal values: -0.0 is the minimum.
                a
            } else {
                b
            };
            (r, fl)
        }

        pub fn $max(a: $bits, b: $bits) -> ($bits, u32) {
            let fa = <$F>::from_bits(a);
            let fb = <$F>::from_bits(b);
            let mut fl = 0;
            if fa.is_signaling_nan() || fb.is_signaling_nan() {
                fl |= FFLAG_NV;
            }
            let r = if fa.is_nan() && fb.is_nan() {
                $qnan
            } else if fa.is_nan() {
                b
            } else if fb.is_nan() {
                a
            } else if fa.lt_quiet(fb) {
                b
            } else if fb.lt_quiet(fa) {
                a
            } else if a & $sign == 0 {
                a
            } else {
                b
            };
            (r, fl)
        }
    };
}

min_max!(fmin_s, fmax_s, F32, u32, 0x8000_0000u32, F32_QNAN);
min_max!(fmin_d, fmax_d, F64, u64, 0x8000_0000_0000_0000u64, F64_QNAN);

pub fn fclass_s(a: u32) -> u64 {
    let sign = a >> 31 != 0;
    let exp = (a >> 23) & 0xff;
    let frac = a & 0x7f_ffff;
    fclass_bits(sign, exp == 0xff, exp == 0, frac == 0, frac & 0x40_0000 != 0)
}

pub fn fclass_d(a: u64) -> u64 {
    let sign = a >> 63 != 0;
    let exp = (a >> 52) & 0x7ff;
    let frac = a & 0xf_ffff_ffff_ffff;
    fclass_bits(
        sign,
        exp == 0x7ff,
        exp == 0,
        frac == 0,
        frac & 0x8_0000_0000_0000 != 0,
    )
}

fn fclass_bits(sign: bool, exp_all: bool, exp_zero: bool, frac_zero: bool, quiet: bool) -> u64 {
    if exp_all {
        if frac_zero {
            if sign {
                1 << 0 // -inf
            } else {
                1 << 7 // +inf
            }
        } else if quiet {
            1 << 9
        } else {
            1 << 8
        }
    } else if exp_zero {
        match (frac_zero, sign) {
            (true, true) => 1 << 3,   // -0
            (true, false) => 1 << 4,  // +0
            (false, true) => 1 << 2,  // negative subnormal
            (false, false) => 1 << 5, // positive subnormal
        }
    } else if sign {
        1 << 1
    } else {
        1 << 6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_S: u32 = 0x3f80_0000;
    const TWO_S: u32 = 0x4000_0000;
    const RNE: RoundingMode = RoundingMode::TiesToEven;

    #[test]
    fn exact_add_raises_no_flags() {
        let (r, fl) = fadd::<F32>(ONE_S, TWO_S, RNE);
        assert_eq!(r, 0x4040_0000); // 3.0
        assert_eq!(fl, 0);
    }

    #[test]
    fn divide_by_zero_flag() {
        let (r, fl) = fdiv::<F32>(ONE_S, 0, RNE);
        assert_eq!(r, 0x7f80_0000); // +inf
        assert_eq!(fl, FFLAG_DZ);
    }

    #[test]
    fn invalid_op_flag() {
        let (r, fl) = fdiv::<F32>(0, 0, RNE);
        assert_eq!(r, F32_QNAN);
        assert_eq!(fl, FFLAG_NV);
        let (_, fl) = fsqrt::<F32>(0xbf80_0000, RNE); // sqrt(-1.0)
        assert_eq!(fl, FFLAG_NV);
    }

    #[test]
    fn overflow_sets_of_and_nx() {
        let max = 0x7f7f_ffff; // f32::MAX
        let (r, fl) = fmul::<F32>(max, TWO_S, RNE);
        assert_eq!(r, 0x7f80_0000);
        assert_eq!(fl & (FFLAG_OF | FFLAG_NX), FFLAG_OF | FFLAG_NX);
    }

    #[test]
    fn min_prefers_negative_zero() {
        let (r, fl) = fmin_s(0x8000_0000, 0x0000_0000);
        assert_eq!(r, 0x8000_0000);
        assert_eq!(fl, 0);
        let (r, _) = fmax_s(0x8000_0000, 0x0000_0000);
        assert_eq!(r, 0);
    }

    #[test]
    fn min_with_one_nan_returns_number() {
        let (r, fl) = fmin_s(F32_QNAN, ONE_S);
        assert_eq!(r, ONE_S);
        assert_eq!(fl, 0);
        // Signaling NaN raises NV.
        let (r, fl) = fmin_s(0x7f80_0001, ONE_S);
        assert_eq!(r, ONE_S);
        assert_eq!(fl, FFLAG_NV);
        // Both NaN returns the canonical quiet NaN.
        let (r, _) = fmin_s(F32_QNAN, F32_QNAN);
        assert_eq!(r, F32_QNAN);
    }

    #[test]
    fn cvt_nan_saturates_with_invalid() {
        let (r, fl) = fcvt_w::<F32>(F32_QNAN, RoundingMode::TowardZero);
        assert_eq!(r as i64, i32::MAX as i64);
        assert_eq!(fl, FFLAG_NV);
        let (r, fl) = fcvt_wu::<F32>(0xbf80_0000, RoundingMode::TowardZero); // -1.0
        assert_eq!(r, 0); // saturates to 0
        assert_eq!(fl, FFLAG_NV);
    }

    #[test]
    fn inexact_conversion() {
        // 1.5 -> int rounds and reports NX.
        let (r, fl) = fcvt_w::<F32>(0x3fc0_0000, RNE);
        assert_eq!(r, 2);
        assert_eq!(fl, FFLAG_NX);
    }

    #[test]
    fn nanbox_rules() {
        assert_eq!(unbox32(nanbox32(ONE_S)), ONE_S);
        // A non-boxed value reads as the canonical NaN.
        assert_eq!(unbox32(ONE_S as u64), F32_QNAN);
    }

    #[test]
    fn fclass_taxonomy() {
        assert_eq!(fclass_s(0xff80_0000), 1 << 0); // -inf
        assert_eq!(fclass_s(0xbf80_0000), 1 << 1); // -1.0
        assert_eq!(fclass_s(0x8000_0001), 1 << 2); // -subnormal
        assert_eq!(fclass_s(0x8000_0000), 1 << 3); // -0
        assert_eq!(fclass_s(0x0000_0000), 1 << 4); // +0
        assert_eq!(fclass_s(0x0000_0001), 1 << 5); // +subnormal
        assert_eq!(fclass_s(ONE_S), 1 << 6);
        assert_eq!(fclass_s(0x7f80_0000), 1 << 7); // +inf
        assert_eq!(fclass_s(0x7f80_0001), 1 << 8); // sNaN
        assert_eq!(fclass_s(F32_QNAN), 1 << 9); // qNaN
        assert_eq!(fclass_d(0x7ff8_0000_0000_0000), 1 << 9);
    }

    #[test]
    fn compare_flags() {
        // Quiet eq on qNaN raises nothing and is false.
        let (r, fl) = feq::<F32>(F32_QNAN, ONE_S);
        assert!(!r);
        assert_eq!(fl, 0);
        // Signaling lt on qNaN raises NV.
        let (r, fl) = flt::<F32>(F32_QNAN, ONE_S);
        assert!(!r);
        assert_eq!(fl, FFLAG_NV);
    }

    #[test]
    fn double_roundtrip_through_single() {
        let (d, fl) = fcvt_d_s(ONE_S, RNE);
        assert_eq!(d, 0x3ff0_0000_0000_0000);
        assert_eq!(fl, 0);
        let (s, fl) = fcvt_s_d(d, RNE);
        assert_eq!(s, ONE_S);
        assert_eq!(fl, 0);
    }
}
