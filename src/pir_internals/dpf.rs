use super::{branch_opt_util, error::MutualPIRError, params::PRG_SEED_BYTE_LEN};
use aes::{
    Aes128,
    cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray},
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Largest supported evaluation domain, `2^MAX_DOMAIN_BITS` points.
pub const MAX_DOMAIN_BITS: u32 = u32::BITS;

type Seed = [u8; PRG_SEED_BYTE_LEN];

const LEFT_PRG_KEY: [u8; 16] = *b"dpf-prg-left-key";
const RIGHT_PRG_KEY: [u8; 16] = *b"dpf-prg-right-ky";

struct LengthDoublingPrg {
    left: Aes128,
    right: Aes128,
}

fn prg() -> &'static LengthDoublingPrg {
    static PRG: OnceLock<LengthDoublingPrg> = OnceLock::new();
    PRG.get_or_init(|| LengthDoublingPrg {
        left: Aes128::new(&GenericArray::from(LEFT_PRG_KEY)),
        right: Aes128::new(&GenericArray::from(RIGHT_PRG_KEY)),
    })
}

/// Fixed-key AES in Matyas-Meyer-Oseas mode. The lowest bit of each half becomes the child's control bit.
#[inline(always)]
fn expand(seed: &Seed) -> ((Seed, bool), (Seed, bool)) {
    let prg = prg();

    let half = |cipher: &Aes128| -> (Seed, bool) {
        let mut block = GenericArray::from(*seed);
        cipher.encrypt_block(&mut block);

        let mut out = [0u8; PRG_SEED_BYTE_LEN];
        out.iter_mut().zip(block.iter().zip(seed.iter())).for_each(|(o, (&b, &s))| *o = b ^ s);

        let control = (out[0] & 1) == 1;
        out[0] &= !1;
        (out, control)
    };

    (half(&prg.left), half(&prg.right))
}

#[inline(always)]
fn xor_seed(lhs: &mut Seed, rhs: &Seed) {
    lhs.iter_mut().zip(rhs.iter()).for_each(|(l, &r)| *l ^= r);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionWord {
    pub seed: Seed,
    pub control_left: bool,
    pub control_right: bool,
}

/// One half of a distributed point function over `{0, 1}^domain_bits`, with single bit output.
///
/// Full-domain evaluations of both halves XOR to the unit vector at the hidden point, while each half on its own is
/// indistinguishable from random.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpfKey {
    pub domain_bits: u32,
    pub root_seed: Seed,
    pub root_control: bool,
    pub correction_words: Vec<CorrectionWord>,
}

/// Number of tree levels needed so that every row index of a table with `num_rows` rows is a leaf.
pub const fn domain_bits_for(num_rows: usize) -> u32 {
    if num_rows <= 1 { 0 } else { usize::BITS - (num_rows - 1).leading_zeros() }
}

/// Generates a correlated key pair for the point function which is 1 at `alpha` and 0 elsewhere.
///
/// # Arguments
///
/// * `alpha` - The hidden point, must be smaller than `2^domain_bits`.
/// * `domain_bits` - Depth of the evaluation tree.
/// * `rng` - Cryptographically secure source of the root seeds.
///
/// # Returns
///
/// Key halves to be shipped to the left and right server respectively.
pub fn generate<R: RngCore + CryptoRng>(alpha: u64, domain_bits: u32, rng: &mut R) -> Result<(DpfKey, DpfKey), MutualPIRError> {
    if branch_opt_util::unlikely(domain_bits > MAX_DOMAIN_BITS) {
        return Err(MutualPIRError::InvalidDpfKey(format!("domain of {domain_bits} bits is not supported")));
    }
    if branch_opt_util::unlikely((alpha >> domain_bits) != 0) {
        return Err(MutualPIRError::IndexOutOfDomain {
            index: alpha as usize,
            num_rows: 1usize << domain_bits,
        });
    }

    let mut root_left = [0u8; PRG_SEED_BYTE_LEN];
    let mut root_right = [0u8; PRG_SEED_BYTE_LEN];
    rng.fill_bytes(&mut root_left);
    rng.fill_bytes(&mut root_right);

    let (mut seed_left, mut seed_right) = (root_left, root_right);
    let (mut control_left, mut control_right) = (false, true);

    let mut correction_words = Vec::with_capacity(domain_bits as usize);

    for level in 0..domain_bits {
        let alpha_bit = ((alpha >> (domain_bits - 1 - level)) & 1) == 1;

        let (left_children_l, right_children_l) = expand(&seed_left);
        let (left_children_r, right_children_r) = expand(&seed_right);

        let (keep_l, lose_l, keep_r, lose_r) = if alpha_bit {
            (right_children_l, left_children_l, right_children_r, left_children_r)
        } else {
            (left_children_l, right_children_l, left_children_r, right_children_r)
        };

        let mut cw_seed = lose_l.0;
        xor_seed(&mut cw_seed, &lose_r.0);

        let cw = CorrectionWord {
            seed: cw_seed,
            control_left: left_children_l.1 ^ left_children_r.1 ^ alpha_bit ^ true,
            control_right: right_children_l.1 ^ right_children_r.1 ^ alpha_bit,
        };
        let keep_cw_control = if alpha_bit { cw.control_right } else { cw.control_left };

        seed_left = keep_l.0;
        if control_left {
            xor_seed(&mut seed_left, &cw.seed);
        }
        seed_right = keep_r.0;
        if control_right {
            xor_seed(&mut seed_right, &cw.seed);
        }

        control_left = keep_l.1 ^ (control_left & keep_cw_control);
        control_right = keep_r.1 ^ (control_right & keep_cw_control);

        correction_words.push(cw);
    }

    let left = DpfKey {
        domain_bits,
        root_seed: root_left,
        root_control: false,
        correction_words: correction_words.clone(),
    };
    let right = DpfKey {
        domain_bits,
        root_seed: root_right,
        root_control: true,
        correction_words,
    };

    Ok((left, right))
}

impl DpfKey {
    /// Checks key shape, so that evaluation can't be driven out of bounds by a malformed key.
    pub fn validate(&self, expected_domain_bits: u32) -> Result<(), MutualPIRError> {
        if branch_opt_util::unlikely(self.domain_bits > MAX_DOMAIN_BITS) {
            return Err(MutualPIRError::InvalidDpfKey(format!("domain of {} bits is not supported", self.domain_bits)));
        }
        if branch_opt_util::unlikely(self.domain_bits != expected_domain_bits) {
            return Err(MutualPIRError::InvalidDpfKey(format!(
                "key is for a domain of {} bits, table needs {} bits",
                self.domain_bits, expected_domain_bits
            )));
        }
        if branch_opt_util::unlikely(self.correction_words.len() != self.domain_bits as usize) {
            return Err(MutualPIRError::InvalidDpfKey(format!(
                "expected {} correction words, found {}",
                self.domain_bits,
                self.correction_words.len()
            )));
        }

        Ok(())
    }

    /// Evaluates this key half over the whole domain. Bit `j` of the result is `(out[j / 8] >> (j % 8)) & 1`.
    pub fn eval_full(&self) -> Result<Vec<u8>, MutualPIRError> {
        self.validate(self.domain_bits)?;

        let num_leaves = 1usize << self.domain_bits;
        let mut nodes: Vec<(Seed, bool)> = Vec::with_capacity(num_leaves);
        let mut next: Vec<(Seed, bool)> = Vec::with_capacity(num_leaves);
        nodes.push((self.root_seed, self.root_control));

        for cw in &self.correction_words {
            next.clear();

            for (seed, control) in nodes.iter() {
                let ((mut seed_l, mut control_l), (mut seed_r, mut control_r)) = expand(seed);
                if *control {
                    xor_seed(&mut seed_l, &cw.seed);
                    xor_seed(&mut seed_r, &cw.seed);
                    control_l ^= cw.control_left;
                    control_r ^= cw.control_right;
                }

                next.push((seed_l, control_l));
                next.push((seed_r, control_r));
            }

            std::mem::swap(&mut nodes, &mut next);
        }

        let mut bits = vec![0u8; num_leaves.div_ceil(8)];
        for (j, (_, control)) in nodes.iter().enumerate() {
            bits[j / 8] |= (*control as u8) << (j % 8);
        }

        Ok(bits)
    }

    /// Evaluates this key half at a single point `x`.
    pub fn eval(&self, x: u64) -> Result<bool, MutualPIRError> {
        self.validate(self.domain_bits)?;
        if branch_opt_util::unlikely((x >> self.domain_bits) != 0) {
            return Err(MutualPIRError::IndexOutOfDomain {
                index: x as usize,
                num_rows: 1usize << self.domain_bits,
            });
        }

        let (mut seed, mut control) = (self.root_seed, self.root_control);
        for (level, cw) in self.correction_words.iter().enumerate() {
            let ((mut seed_l, mut control_l), (mut seed_r, mut control_r)) = expand(&seed);
            if control {
                xor_seed(&mut seed_l, &cw.seed);
                xor_seed(&mut seed_r, &cw.seed);
                control_l ^= cw.control_left;
                control_r ^= cw.control_right;
            }

            let go_right = ((x >> (self.domain_bits as usize - 1 - level)) & 1) == 1;
            (seed, control) = if go_right { (seed_r, control_r) } else { (seed_l, control_l) };
        }

        Ok(control)
    }
}

#[inline(always)]
pub fn bit_at(bits: &[u8], j: usize) -> bool {
    (bits[j / 8] >> (j % 8)) & 1 == 1
}

#[cfg(test)]
mod test {
    use super::{bit_at, domain_bits_for, generate};
    use crate::pir_internals::error::MutualPIRError;
    use rand::prelude::*;
    use rand_chacha::ChaCha20Rng;
    use test_case::test_case;

    #[test_case(0 => 0; "empty table")]
    #[test_case(1 => 0; "single row")]
    #[test_case(2 => 1; "two rows")]
    #[test_case(3 => 2; "three rows")]
    #[test_case(1024 => 10; "power of two rows")]
    #[test_case(1025 => 11; "one past power of two rows")]
    fn domain_bits_cover_every_row(num_rows: usize) -> u32 {
        domain_bits_for(num_rows)
    }

    #[test_case(0, 0; "trivial domain")]
    #[test_case(1, 1; "two point domain")]
    #[test_case(5, 3; "small domain")]
    #[test_case(1023, 10; "last point")]
    #[test_case(777, 12; "medium domain")]
    fn full_domain_evaluations_xor_to_unit_vector(alpha: u64, domain_bits: u32) {
        let mut rng = ChaCha20Rng::from_os_rng();
        let (left, right) = generate(alpha, domain_bits, &mut rng).expect("Must be able to generate DPF keys");

        let eval_left = left.eval_full().expect("Must be able to evaluate left key");
        let eval_right = right.eval_full().expect("Must be able to evaluate right key");
        assert_eq!(eval_left.len(), eval_right.len());

        for j in 0..(1usize << domain_bits) {
            let combined = bit_at(&eval_left, j) ^ bit_at(&eval_right, j);
            assert_eq!(combined, j as u64 == alpha, "Unexpected output at point {j}");

            assert_eq!(left.eval(j as u64), Ok(bit_at(&eval_left, j)));
            assert_eq!(right.eval(j as u64), Ok(bit_at(&eval_right, j)));
        }
    }

    #[test]
    fn key_halves_do_not_reveal_the_point() {
        const DOMAIN_BITS: u32 = 12;
        let mut rng = ChaCha20Rng::from_os_rng();

        let (left, _) = generate(17, DOMAIN_BITS, &mut rng).expect("Must be able to generate DPF keys");
        let eval_left = left.eval_full().expect("Must be able to evaluate left key");

        let num_ones = eval_left.iter().map(|byte| byte.count_ones()).sum::<u32>();
        let num_points = 1u32 << DOMAIN_BITS;

        // A single half must look like a random bit string, not like a unit vector.
        assert!(num_ones > num_points / 4 && num_ones < 3 * num_points / 4);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        let mut rng = ChaCha20Rng::from_os_rng();

        assert!(matches!(generate(8, 3, &mut rng), Err(MutualPIRError::IndexOutOfDomain { .. })));
        assert!(matches!(generate(0, 40, &mut rng), Err(MutualPIRError::InvalidDpfKey(_))));

        let (mut left, _) = generate(3, 4, &mut rng).expect("Must be able to generate DPF keys");
        assert!(left.validate(5).is_err());

        left.correction_words.pop();
        assert!(matches!(left.eval_full(), Err(MutualPIRError::InvalidDpfKey(_))));
    }
}
