//! Shift, normalize and floating-point units
//!
//! Floating-point format: bit 59 sign, bits 48-58 biased exponent, bits
//! 0-47 coefficient. Negative values are the ones-complement of the whole
//! word. The exponent bias is 2000B for zero and positive exponents;
//! negative exponents are stored complemented, so exponent -1 packs as
//! 1776B. That leaves 1777B as the indefinite marker and 3777B as
//! infinity, with no collision against real exponents.
//!
//! All routines here are pure: they return the result word plus the exit
//! conditions it incurred, and the CPU applies both.

use crate::cpu::{EC_INDEFINITE, EC_OPERAND};
use crate::words::{CpWord, MASK48, MASK60, NEG_ZERO, SIGN60};

/// Raw exponent field of an indefinite operand.
pub const EXP_INDEFINITE: u32 = 0o1777;
/// Raw exponent field of an infinite operand.
pub const EXP_INFINITE: u32 = 0o3777;

const COEFF_OVERFLOW: u64 = 1 << 48;
const HALF: u64 = 1 << 47;

/// An unpacked float: magnitude coefficient, unbiased exponent, sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unpacked {
    pub sign: bool,
    pub exp: i32,
    pub coeff: u64,
}

/// A float result plus any exit conditions it raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloatOutcome {
    pub word: CpWord,
    pub faults: u32,
}

impl FloatOutcome {
    fn clean(word: CpWord) -> Self {
        Self { word, faults: 0 }
    }
}

/// Magnitude of a word (complemented if negative).
fn float_magnitude(word: CpWord) -> u64 {
    if word & SIGN60 != 0 {
        !word & MASK60
    } else {
        word & MASK60
    }
}

/// Raw biased exponent field of the magnitude.
fn raw_exponent(word: CpWord) -> u32 {
    ((float_magnitude(word) >> 48) & 0o3777) as u32
}

/// Infinite operand test (the OR/IR branch conditions).
pub fn is_infinite(word: CpWord) -> bool {
    raw_exponent(word) == EXP_INFINITE
}

/// Indefinite operand test (the ID/DF branch conditions).
pub fn is_indefinite(word: CpWord) -> bool {
    raw_exponent(word) == EXP_INDEFINITE
}

/// The canonical indefinite result word.
pub fn indefinite_word() -> CpWord {
    (EXP_INDEFINITE as u64) << 48
}

/// The infinite result word with the given sign.
pub fn infinite_word(negative: bool) -> CpWord {
    let mag = (EXP_INFINITE as u64) << 48;
    if negative {
        !mag & MASK60
    } else {
        mag
    }
}

/// Unpack a float into sign, unbiased exponent and magnitude coefficient.
pub fn unpack(word: CpWord) -> Unpacked {
    let sign = word & SIGN60 != 0;
    let mag = float_magnitude(word);
    let raw = ((mag >> 48) & 0o3777) as i32;
    let exp = if raw >= 0o2000 {
        raw - 0o2000
    } else {
        raw - 0o1777
    };
    Unpacked {
        sign,
        exp,
        coeff: mag & MASK48,
    }
}

/// Pack sign/exponent/coefficient into a word. Exponent overflow packs
/// infinity and raises the operand condition; underflow packs zero,
/// silently when `silent_underflow` (175-style float) is set.
pub fn pack(sign: bool, exp: i32, coeff: u64, silent_underflow: bool) -> FloatOutcome {
    debug_assert!(coeff < COEFF_OVERFLOW);

    if coeff == 0 {
        return FloatOutcome::clean(if sign { NEG_ZERO } else { 0 });
    }

    let raw = if exp >= 0 { 0o2000 + exp } else { 0o1777 + exp };
    if raw >= EXP_INFINITE as i32 {
        return FloatOutcome {
            word: infinite_word(sign),
            faults: EC_OPERAND,
        };
    }
    if raw < 0 {
        return FloatOutcome {
            word: if sign { NEG_ZERO } else { 0 },
            faults: if silent_underflow { 0 } else { EC_OPERAND },
        };
    }

    let mag = ((raw as u64) << 48) | coeff;
    FloatOutcome::clean(if sign { !mag & MASK60 } else { mag })
}

// ========== Shift unit ==========

/// Left circular shift of the 60-bit word.
pub fn left_circular(word: CpWord, count: u32) -> CpWord {
    let count = count % 60;
    if count == 0 {
        return word & MASK60;
    }
    ((word << count) | (word >> (60 - count))) & MASK60
}

/// Arithmetic (sign-filling) right shift.
pub fn right_arithmetic(word: CpWord, count: u32) -> CpWord {
    let word = word & MASK60;
    let negative = word & SIGN60 != 0;
    if count >= 60 {
        return if negative { NEG_ZERO } else { 0 };
    }
    if count == 0 {
        return word;
    }
    let shifted = word >> count;
    if negative {
        shifted | (MASK60 << (60 - count)) & MASK60
    } else {
        shifted
    }
}

/// Normalize shift count for a coefficient: how far left until bit 47 is
/// set. A zero coefficient normalizes with count 48.
pub fn normalize_count(coeff: u64) -> u32 {
    if coeff == 0 {
        return 48;
    }
    let mut count = 0;
    let mut c = coeff;
    while c & HALF == 0 {
        c <<= 1;
        count += 1;
    }
    count
}

/// NX: normalize a float. Returns the result and the shift count for Bj.
pub fn normalize(word: CpWord, round: bool, silent_underflow: bool) -> (FloatOutcome, u32) {
    if is_infinite(word) || is_indefinite(word) {
        let faults = if is_indefinite(word) { EC_INDEFINITE } else { 0 };
        return (FloatOutcome { word, faults }, 0);
    }

    let u = unpack(word);
    if u.coeff == 0 {
        let zero = if u.sign { NEG_ZERO } else { 0 };
        return (FloatOutcome::clean(zero), 48);
    }

    let count = normalize_count(u.coeff);
    let mut coeff = u.coeff << count;
    if round && count > 0 {
        // Round-normalize inserts a round bit behind the shifted
        // coefficient.
        coeff |= 1 << (count - 1);
    }
    let outcome = pack(u.sign, u.exp - count as i32, coeff & MASK48, silent_underflow);
    (outcome, count)
}

// ========== Floating add unit ==========

/// FX/DX/RX add and subtract. `double` selects the low half of the
/// 96-bit aligned sum; `round` applies half-to-even rounding.
pub fn float_add(
    a: CpWord,
    b: CpWord,
    round: bool,
    double: bool,
    silent_underflow: bool,
) -> FloatOutcome {
    if is_indefinite(a) || is_indefinite(b) {
        return FloatOutcome {
            word: indefinite_word(),
            faults: EC_INDEFINITE,
        };
    }
    match (is_infinite(a), is_infinite(b)) {
        (true, true) => {
            let (ua, ub) = (unpack(a), unpack(b));
            if ua.sign != ub.sign {
                return FloatOutcome {
                    word: indefinite_word(),
                    faults: EC_INDEFINITE,
                };
            }
            return FloatOutcome {
                word: infinite_word(ua.sign),
                faults: EC_OPERAND,
            };
        }
        (true, false) => {
            return FloatOutcome {
                word: infinite_word(unpack(a).sign),
                faults: EC_OPERAND,
            }
        }
        (false, true) => {
            return FloatOutcome {
                word: infinite_word(unpack(b).sign),
                faults: EC_OPERAND,
            }
        }
        (false, false) => {}
    }

    let ua = unpack(a);
    let ub = unpack(b);
    if ua.coeff == 0 && ub.coeff == 0 {
        return FloatOutcome::clean(if ua.sign && ub.sign { NEG_ZERO } else { 0 });
    }

    // Align both coefficients at the scale 48 below the larger exponent,
    // where the sum of the significant parts is exact. An operand more
    // than 96 binary places below the other contributes nothing.
    let e = ua.exp.max(ub.exp);
    let base = e - 48;
    let scale = |u: &Unpacked| -> i128 {
        let v = if u.sign {
            -(u.coeff as i128)
        } else {
            u.coeff as i128
        };
        let by = u.exp - base; // 48 for the larger exponent
        if by >= 0 {
            v << by
        } else if by > -127 {
            v >> -by
        } else {
            0
        }
    };
    let sum = scale(&ua) + scale(&ub);
    if sum == 0 {
        // An exact cancellation of equal magnitudes gives positive zero
        // unless both operands were negative.
        return FloatOutcome::clean(0);
    }

    let sign = sum < 0;
    let mag = sum.unsigned_abs();

    if double {
        // DX: low 48 bits of the aligned sum at the base exponent.
        return pack(sign, base, (mag as u64) & MASK48, silent_underflow);
    }

    let mut upper = (mag >> 48) as u64;
    let rem = (mag as u64) & MASK48;
    let mut exp = e;
    if round && (rem > HALF || (rem == HALF && upper & 1 != 0)) {
        upper += 1;
    }
    if upper >= COEFF_OVERFLOW {
        upper >>= 1;
        exp += 1;
    }
    pack(sign, exp, upper, silent_underflow)
}

// ========== Floating multiply and divide units ==========

/// FX/RX/DX multiply.
pub fn float_multiply(
    a: CpWord,
    b: CpWord,
    round: bool,
    double: bool,
    silent_underflow: bool,
) -> FloatOutcome {
    if is_indefinite(a) || is_indefinite(b) {
        return FloatOutcome {
            word: indefinite_word(),
            faults: EC_INDEFINITE,
        };
    }
    let ua = unpack(a);
    let ub = unpack(b);
    let sign = ua.sign != ub.sign;

    if is_infinite(a) || is_infinite(b) {
        // Infinity times zero is indefinite; anything else stays infinite.
        let other_zero = (is_infinite(a) && ub.coeff == 0 && !is_infinite(b))
            || (is_infinite(b) && ua.coeff == 0 && !is_infinite(a));
        if other_zero {
            return FloatOutcome {
                word: indefinite_word(),
                faults: EC_INDEFINITE,
            };
        }
        return FloatOutcome {
            word: infinite_word(sign),
            faults: EC_OPERAND,
        };
    }

    if ua.coeff == 0 || ub.coeff == 0 {
        return FloatOutcome::clean(if sign { NEG_ZERO } else { 0 });
    }

    let product = ua.coeff as u128 * ub.coeff as u128;
    if double {
        return pack(sign, ua.exp + ub.exp, (product as u64) & MASK48, silent_underflow);
    }

    // The product of two normalized coefficients fills 95 or 96 bits;
    // when bit 95 is clear the result shifts up one place so the single
    // result stays normalized.
    let shift = if product >> 95 != 0 { 48 } else { 47 };
    let mut upper = (product >> shift) as u64;
    let low = product & ((1u128 << shift) - 1);
    let half = 1u128 << (shift - 1);
    let mut exp = ua.exp + ub.exp + shift as i32;
    if round && (low > half || (low == half && upper & 1 != 0)) {
        upper += 1;
    }
    if upper >= COEFF_OVERFLOW {
        upper >>= 1;
        exp += 1;
    }
    pack(sign, exp, upper, silent_underflow)
}

/// FX/RX divide. Division by zero and indefinite quotients raise the
/// indefinite-operand condition.
pub fn float_divide(a: CpWord, b: CpWord, round: bool, silent_underflow: bool) -> FloatOutcome {
    if is_indefinite(a) || is_indefinite(b) {
        return FloatOutcome {
            word: indefinite_word(),
            faults: EC_INDEFINITE,
        };
    }
    let ua = unpack(a);
    let ub = unpack(b);
    let sign = ua.sign != ub.sign;

    if is_infinite(a) && is_infinite(b) {
        return FloatOutcome {
            word: indefinite_word(),
            faults: EC_INDEFINITE,
        };
    }
    if is_infinite(a) {
        return FloatOutcome {
            word: infinite_word(sign),
            faults: EC_OPERAND,
        };
    }
    if is_infinite(b) {
        return FloatOutcome::clean(if sign { NEG_ZERO } else { 0 });
    }

    if ub.coeff == 0 {
        // n/0 and 0/0 both come back indefinite.
        return FloatOutcome {
            word: indefinite_word(),
            faults: EC_INDEFINITE,
        };
    }
    if ua.coeff == 0 {
        return FloatOutcome::clean(if sign { NEG_ZERO } else { 0 });
    }

    let dividend = (ua.coeff as u128) << 48;
    let divisor = ub.coeff as u128;
    let mut quotient = (dividend / divisor) as u64;
    let mut remainder = (dividend % divisor) as u128;
    let mut exp = ua.exp - ub.exp - 48;
    if quotient >= COEFF_OVERFLOW {
        // Shift one bit back into the remainder.
        remainder += ((quotient & 1) as u128) * divisor;
        quotient >>= 1;
        exp += 1;
    }
    if round {
        let twice = remainder * 2;
        if twice > divisor || (twice == divisor && quotient & 1 != 0) {
            quotient += 1;
            if quotient >= COEFF_OVERFLOW {
                quotient >>= 1;
                exp += 1;
            }
        }
    }
    pack(sign, exp, quotient, silent_underflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pack a normalized float from an integer value for testing.
    fn from_int(value: i64) -> CpWord {
        let sign = value < 0;
        let mut coeff = value.unsigned_abs();
        if coeff == 0 {
            return 0;
        }
        let mut exp = 0i32;
        while coeff & HALF == 0 {
            coeff <<= 1;
            exp -= 1;
        }
        pack(sign, exp, coeff, false).word
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        for &value in &[1i64, 2, 3, 42, -17, 1 << 40, -(1 << 46)] {
            let w = from_int(value);
            let u = unpack(w);
            let again = pack(u.sign, u.exp, u.coeff, false);
            assert_eq!(again.word, w, "round trip for {}", value);
            assert_eq!(again.faults, 0);
        }
    }

    #[test]
    fn test_negative_exponent_encoding() {
        // Exponent -1 packs as raw 1776B; the raw value 1777B stays
        // reserved for the indefinite marker.
        let w = pack(false, -1, HALF, false).word;
        assert_eq!((w >> 48) & 0o3777, 0o1776);
        assert!(!is_indefinite(w));
        assert!(is_indefinite(indefinite_word()));
    }

    #[test]
    fn test_float_add_simple() {
        let two = from_int(2);
        let three = from_int(3);
        let five = float_add(two, three, false, false, false);
        assert_eq!(five.faults, 0);
        assert_eq!(unpack(five.word), unpack(from_int(5)));
    }

    #[test]
    fn test_float_add_cancellation_is_positive_zero() {
        let a = from_int(7);
        let b = from_int(-7);
        let sum = float_add(a, b, false, false, false);
        assert_eq!(sum.word, 0);
    }

    #[test]
    fn test_float_multiply() {
        let six = float_multiply(from_int(2), from_int(3), false, false, false);
        assert_eq!(unpack(six.word), unpack(from_int(6)));

        let minus = float_multiply(from_int(-2), from_int(3), false, false, false);
        assert!(unpack(minus.word).sign);
    }

    #[test]
    fn test_float_divide() {
        let q = float_divide(from_int(42), from_int(6), false, false);
        assert_eq!(q.faults, 0);
        assert_eq!(unpack(q.word), unpack(from_int(7)));
    }

    #[test]
    fn test_divide_by_zero_is_indefinite() {
        let q = float_divide(from_int(1), 0, false, false);
        assert_eq!(q.faults, EC_INDEFINITE);
        assert!(is_indefinite(q.word));

        let z = float_divide(0, 0, false, false);
        assert_eq!(z.faults, EC_INDEFINITE);
    }

    #[test]
    fn test_infinite_arithmetic() {
        let inf = infinite_word(false);
        let sum = float_add(inf, from_int(1), false, false, false);
        assert!(is_infinite(sum.word));

        let diff = float_add(inf, infinite_word(true), false, false, false);
        assert!(is_indefinite(diff.word));
        assert_eq!(diff.faults, EC_INDEFINITE);

        let ratio = float_divide(inf, inf, false, false);
        assert!(is_indefinite(ratio.word));
    }

    #[test]
    fn test_underflow_handling() {
        // Far below the representable range.
        let tiny = pack(false, -2000, HALF, false);
        assert_eq!(tiny.word, 0);
        assert_eq!(tiny.faults, EC_OPERAND);

        let silent = pack(false, -2000, HALF, true);
        assert_eq!(silent.word, 0);
        assert_eq!(silent.faults, 0);
    }

    #[test]
    fn test_overflow_packs_infinity() {
        let huge = pack(false, 2000, HALF, false);
        assert!(is_infinite(huge.word));
        assert_eq!(huge.faults, EC_OPERAND);
    }

    #[test]
    fn test_left_circular() {
        assert_eq!(left_circular(0o1234, 0), 0o1234);
        // Bit 59 wraps around to bit 0.
        assert_eq!(left_circular(SIGN60, 1), 1);
        assert_eq!(left_circular(1, 60), 1);
    }

    #[test]
    fn test_right_arithmetic() {
        assert_eq!(right_arithmetic(0o100, 3), 0o10);
        // Negative values fill with ones.
        let minus_one = NEG_ZERO ^ 1; // ...1110 = -1
        let shifted = right_arithmetic(minus_one, 1);
        assert!(shifted & SIGN60 != 0);
        assert_eq!(right_arithmetic(minus_one, 100), NEG_ZERO);
    }

    #[test]
    fn test_normalize() {
        let unnorm = pack(false, 0, 1, false).word; // coefficient 1, far from bit 47
        let (result, count) = normalize(unnorm, false, false);
        assert_eq!(count, 47);
        let u = unpack(result.word);
        assert_eq!(u.coeff, HALF);
        assert_eq!(u.exp, -47);
    }

    #[test]
    fn test_normalize_zero() {
        let (result, count) = normalize(0, false, false);
        assert_eq!(result.word, 0);
        assert_eq!(count, 48);
    }
}
