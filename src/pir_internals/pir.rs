use super::{
    branch_opt_util,
    dpf::{self, DpfKey},
    error::MutualPIRError,
    row_store::RowStore,
};
use rand::{CryptoRng, RngCore};

/// Client side of two-server DPF PIR over a table with a fixed number of rows.
#[derive(Clone, Copy, Debug)]
pub struct PirQuerier {
    num_rows: usize,
    domain_bits: u32,
}

impl PirQuerier {
    pub const fn new(num_rows: usize) -> PirQuerier {
        PirQuerier {
            num_rows,
            domain_bits: dpf::domain_bits_for(num_rows),
        }
    }

    pub const fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub const fn domain_bits(&self) -> u32 {
        self.domain_bits
    }

    /// Generates the key pair retrieving row `index`, one half for each server.
    pub fn query<R: RngCore + CryptoRng>(&self, index: usize, rng: &mut R) -> Result<(DpfKey, DpfKey), MutualPIRError> {
        if branch_opt_util::unlikely(index >= self.num_rows) {
            return Err(MutualPIRError::IndexOutOfDomain {
                index,
                num_rows: self.num_rows,
            });
        }

        dpf::generate(index as u64, self.domain_bits, rng)
    }
}

/// Computes one server's answer: XOR of all rows whose bit is set in the full-domain evaluation of `key`.
///
/// # Arguments
///
/// * `table` - Rows the query runs against.
/// * `key` - This server's half of the query.
///
/// # Returns
///
/// A single row worth of bytes, or an error if the key doesn't match the table's domain.
pub fn answer(table: &RowStore, key: &DpfKey) -> Result<Vec<u8>, MutualPIRError> {
    key.validate(dpf::domain_bits_for(table.num_rows()))?;
    let selection = key.eval_full()?;

    let mut acc = vec![0u8; table.row_len()];
    for (j, row) in table.rows().enumerate() {
        if dpf::bit_at(&selection, j) {
            xor_into(&mut acc, row);
        }
    }

    Ok(acc)
}

/// Combines both servers' answers into the queried row.
pub fn reconstruct(answer_left: &[u8], answer_right: &[u8]) -> Result<Vec<u8>, MutualPIRError> {
    if branch_opt_util::unlikely(answer_left.is_empty() || answer_right.is_empty()) {
        return Err(MutualPIRError::ReconstructionFailed("answer half is missing".to_string()));
    }
    if branch_opt_util::unlikely(answer_left.len() != answer_right.len()) {
        return Err(MutualPIRError::ReconstructionFailed(format!(
            "answer halves are {} and {} bytes long",
            answer_left.len(),
            answer_right.len()
        )));
    }

    let mut row = answer_left.to_vec();
    xor_into(&mut row, answer_right);
    Ok(row)
}

#[inline(always)]
pub fn xor_into(acc: &mut [u8], other: &[u8]) {
    acc.iter_mut().zip(other.iter()).for_each(|(a, &b)| *a ^= b);
}
