//! CPU instruction execution
//!
//! One function per decode family:
//! - `op_jump` / `op_branch_x` / `op_branch_b`: control transfers
//! - `op_logical`: the boolean unit (BXi forms)
//! - `op_shift`: shift, normalize, pack/unpack, mask
//! - `op_float_add`: floating and long-integer add unit
//! - `op_multiply_divide`: multiply, divide, mask, population count
//! - `op_set_a` / `op_set_b` / `op_set_x`: the increment unit
//!
//! The boolean unit operates on raw 60-bit patterns and therefore
//! preserves negative zero; the integer forms go through the
//! ones-complement helpers in `words`.

use crate::cpu::{helpers, Cpu, EC_INDEFINITE};
use crate::words::{
    add18, is_neg60, is_zero60, neg60, sign_extend18, sub18, to_i32_18, MASK18, MASK60,
};

impl Cpu {
    /// 02 JP Bi+K.
    pub(super) fn op_jump(&mut self, i: usize, kfield: u32) {
        let target = add18(self.b[i], kfield);
        self.branch_to(target);
    }

    /// 03x: branch on Xj conditions.
    pub(super) fn op_branch_x(&mut self, i: usize, j: usize, kfield: u32) {
        let xj = self.x[j];
        let take = match i {
            0 => is_zero60(xj),                   // ZR
            1 => !is_zero60(xj),                  // NZ
            2 => !is_neg60(xj),                   // PL
            3 => is_neg60(xj),                    // NG
            4 => !helpers::is_infinite(xj),       // IR
            5 => helpers::is_infinite(xj),        // OR
            6 => !helpers::is_indefinite(xj),     // DF
            _ => helpers::is_indefinite(xj),      // ID
        };
        if take {
            self.branch_to(kfield);
        }
    }

    /// 04-07: branch on Bi/Bj comparison (EQ, NE, GE, LT).
    pub(super) fn op_branch_b(&mut self, fm: u8, i: usize, j: usize, kfield: u32) {
        let bi = to_i32_18(self.b[i]);
        let bj = to_i32_18(self.b[j]);
        let take = match fm {
            0o04 => bi == bj,
            0o05 => bi != bj,
            0o06 => bi >= bj,
            _ => bi < bj,
        };
        if take {
            self.branch_to(kfield);
        }
    }

    /// 10-17: boolean unit. Raw bit patterns; negative zero survives.
    pub(super) fn op_logical(&mut self, fm: u8, i: usize, j: usize, k: usize) {
        let xj = self.x[j];
        let xk = self.x[k];
        self.x[i] = match fm {
            0o10 => xj,                        // BXi Xj
            0o11 => xj & xk,                   // BXi Xj*Xk
            0o12 => xj | xk,                   // BXi Xj+Xk
            0o13 => xj ^ xk,                   // BXi Xj-Xk
            0o14 => neg60(xk),                 // BXi -Xk
            0o15 => neg60(xk) & xj,            // BXi -Xk*Xj
            0o16 => neg60(xk) | xj,            // BXi -Xk+Xj
            _ => neg60(xk) ^ xj,               // BXi -Xk-Xj
        } & MASK60;
    }

    /// 20-27: shift unit, normalize, pack/unpack.
    pub(super) fn op_shift(&mut self, fm: u8, i: usize, j: usize, k: usize) {
        let silent = self.silent_underflow();
        match fm {
            0o20 => {
                // LXi jk: left circular by the 6-bit literal.
                let count = ((j << 3) | k) as u32;
                self.x[i] = helpers::left_circular(self.x[i], count);
            }
            0o21 => {
                // AXi jk: arithmetic right by the 6-bit literal.
                let count = ((j << 3) | k) as u32;
                self.x[i] = helpers::right_arithmetic(self.x[i], count);
            }
            0o22 => {
                // LXi Bj Xk: nominally left, direction from the sign of Bj.
                let count = to_i32_18(self.b[j]);
                self.x[i] = if count >= 0 {
                    helpers::left_circular(self.x[k], count as u32)
                } else {
                    helpers::right_arithmetic(self.x[k], count.unsigned_abs())
                };
            }
            0o23 => {
                // AXi Bj Xk: nominally right, direction from the sign of Bj.
                let count = to_i32_18(self.b[j]);
                self.x[i] = if count >= 0 {
                    helpers::right_arithmetic(self.x[k], count as u32)
                } else {
                    helpers::left_circular(self.x[k], count.unsigned_abs())
                };
            }
            0o24 | 0o25 => {
                // NXi / ZXi Bj Xk: (round) normalize, shift count to Bj.
                let round = fm == 0o25;
                let (outcome, count) = helpers::normalize(self.x[k], round, silent);
                self.x[i] = outcome.word;
                self.set_b(j, count);
                self.apply_faults(outcome.faults);
            }
            0o26 => {
                // UXi Bj Xk: unpack coefficient to Xi, exponent to Bj.
                let u = helpers::unpack(self.x[k]);
                self.x[i] = if u.sign { neg60(u.coeff) } else { u.coeff };
                self.set_b(j, encode18(u.exp));
            }
            _ => {
                // PXi Bj Xk: pack coefficient from Xk, exponent from Bj.
                let sign = is_neg60(self.x[k]);
                let coeff = crate::words::magnitude60(self.x[k]) & crate::words::MASK48;
                let exp = to_i32_18(self.b[j]);
                let outcome = helpers::pack(sign, exp, coeff, silent);
                self.x[i] = outcome.word;
                self.apply_faults(outcome.faults);
            }
        }
    }

    /// 30-37: floating add unit plus the 60-bit integer adds.
    pub(super) fn op_float_add(&mut self, fm: u8, i: usize, j: usize, k: usize) {
        let silent = self.silent_underflow();
        let xj = self.x[j];
        let xk = self.x[k];
        match fm {
            0o30 | 0o31 => {
                let rhs = if fm == 0o31 { neg60(xk) } else { xk };
                let outcome = helpers::float_add(xj, rhs, false, false, silent);
                self.x[i] = outcome.word;
                self.apply_faults(outcome.faults);
            }
            0o32 | 0o33 => {
                let rhs = if fm == 0o33 { neg60(xk) } else { xk };
                let outcome = helpers::float_add(xj, rhs, false, true, silent);
                self.x[i] = outcome.word;
                self.apply_faults(outcome.faults);
            }
            0o34 | 0o35 => {
                let rhs = if fm == 0o35 { neg60(xk) } else { xk };
                let outcome = helpers::float_add(xj, rhs, true, false, silent);
                self.x[i] = outcome.word;
                self.apply_faults(outcome.faults);
            }
            0o36 => self.x[i] = crate::words::add60(xj, xk), // IXi Xj+Xk
            _ => self.x[i] = crate::words::sub60(xj, xk),    // IXi Xj-Xk
        }
    }

    /// 40-47: multiply/divide unit, mask, pass, population count.
    pub(super) fn op_multiply_divide(&mut self, fm: u8, i: usize, j: usize, k: usize) {
        let silent = self.silent_underflow();
        let xj = self.x[j];
        let xk = self.x[k];
        match fm {
            0o40 | 0o41 | 0o42 => {
                let round = fm == 0o41;
                let double = fm == 0o42;
                let outcome = helpers::float_multiply(xj, xk, round, double, silent);
                self.x[i] = outcome.word;
                self.apply_faults(outcome.faults);
            }
            0o43 => {
                // MXi jk: form a mask of jk high-order bits.
                let count = ((j << 3) | k) as u32;
                self.x[i] = if count == 0 {
                    0
                } else if count >= 60 {
                    MASK60
                } else {
                    (MASK60 << (60 - count)) & MASK60
                };
            }
            0o44 | 0o45 => {
                let outcome = helpers::float_divide(xj, xk, fm == 0o45, silent);
                self.x[i] = outcome.word;
                self.apply_faults(outcome.faults);
            }
            0o46 => {} // NO: pass
            _ => {
                // CXi Xk: population count.
                self.x[i] = (self.x[k] & MASK60).count_ones() as u64;
            }
        }
    }

    // ========== Increment unit ==========

    /// Operand for the increment unit: one of eight register/K sums,
    /// selected by the low octal digit of the opcode.
    fn increment_operand(&self, low: u8, j: usize, k: usize, kfield: u32) -> u32 {
        match low {
            0 => add18(self.a[j], kfield),
            1 => add18(self.b[j], kfield),
            2 => add18(self.x18(j), kfield),
            3 => add18(self.x18(j), self.b[k]),
            4 => add18(self.a[j], self.b[k]),
            5 => sub18(self.a[j], self.b[k]),
            6 => add18(self.b[j], self.b[k]),
            _ => sub18(self.b[j], self.b[k]),
        }
    }

    /// 50-57 SAi: set address register, with the operand-access side
    /// effect. Setting A1-A5 loads Xi from the new address; setting A6-A7
    /// stores Xi at it.
    pub(super) fn op_set_a(&mut self, fm: u8, i: usize, j: usize, k: usize, kfield: u32) {
        let value = self.increment_operand(fm & 7, j, k, kfield);
        self.a[i] = value & MASK18 as u32;

        match i {
            1..=5 => {
                if let Some(word) = self.cm_read(value) {
                    self.x[i] = word;
                }
            }
            6 | 7 => {
                let word = self.x[i];
                let _ = self.cm_write(value, word);
            }
            _ => {}
        }
    }

    /// 60-67 SBi: set index register. B0 stays zero (the caller re-zeroes
    /// after every instruction as well).
    pub(super) fn op_set_b(&mut self, fm: u8, i: usize, j: usize, k: usize, kfield: u32) {
        let value = self.increment_operand(fm & 7, j, k, kfield);
        self.set_b(i, value);
    }

    /// 70-77 SXi: set operand register, sign-extended to 60 bits.
    pub(super) fn op_set_x(&mut self, fm: u8, i: usize, j: usize, k: usize, kfield: u32) {
        let value = self.increment_operand(fm & 7, j, k, kfield);
        self.x[i] = sign_extend18(value);
    }

    // ========== Small shared pieces ==========

    pub(super) fn set_b(&mut self, i: usize, value: u32) {
        if i != 0 {
            self.b[i] = value & MASK18 as u32;
        }
    }

    fn silent_underflow(&self) -> bool {
        self.features.contains(crate::config::Features::FLOAT_175)
    }

    fn apply_faults(&mut self, faults: u32) {
        if faults != 0 {
            // Indefinite dominates for the exit-condition register.
            if faults & EC_INDEFINITE != 0 {
                self.raise(EC_INDEFINITE);
            }
            if faults & crate::cpu::EC_OPERAND != 0 {
                self.raise(crate::cpu::EC_OPERAND);
            }
            if faults & crate::cpu::EC_ADDRESS != 0 {
                self.raise(crate::cpu::EC_ADDRESS);
            }
        }
    }
}

/// Encode a signed exponent as an 18-bit ones-complement value.
fn encode18(value: i32) -> u32 {
    if value < 0 {
        !(value.unsigned_abs()) & MASK18 as u32
    } else {
        value as u32 & MASK18 as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::words::is_neg18;

    #[test]
    fn test_encode18_round_trip() {
        for &v in &[0, 1, -1, 47, -47, 0o177777, -0o177777] {
            assert_eq!(to_i32_18(encode18(v)), v);
        }
    }

    #[test]
    fn test_is_neg18_on_encoded() {
        assert!(is_neg18(encode18(-5)));
        assert!(!is_neg18(encode18(5)));
    }
}
