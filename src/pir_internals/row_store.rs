use super::{branch_opt_util, error::MutualPIRError};
use std::ops::Index;

/// Flat, fixed-length row storage. Row `i` lives at `flat[i * row_len..(i + 1) * row_len]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowStore {
    num_rows: usize,
    row_len: usize,
    flat: Vec<u8>,
}

impl RowStore {
    /// Creates a zero-filled store of `num_rows` rows, each `row_len` bytes long.
    ///
    /// # Arguments
    ///
    /// * `num_rows` - The number of rows, must be non-zero.
    /// * `row_len` - The byte length of each row, must be non-zero.
    ///
    /// # Returns
    ///
    /// * `Result<RowStore, MutualPIRError>` - A new store if both dimensions are positive.
    pub fn new(num_rows: usize, row_len: usize) -> Result<RowStore, MutualPIRError> {
        if branch_opt_util::likely(num_rows > 0 && row_len > 0) {
            Ok(RowStore {
                num_rows,
                row_len,
                flat: vec![0u8; num_rows * row_len],
            })
        } else {
            Err(MutualPIRError::InvalidRowStoreDimension)
        }
    }

    /// Takes ownership of an already laid out flat buffer.
    ///
    /// # Returns
    ///
    /// * `Result<RowStore, MutualPIRError>` - Fails if either dimension is zero or `flat.len() != num_rows * row_len`.
    pub fn from_flat(num_rows: usize, row_len: usize, flat: Vec<u8>) -> Result<RowStore, MutualPIRError> {
        if branch_opt_util::unlikely(num_rows == 0 || row_len == 0) {
            return Err(MutualPIRError::InvalidRowStoreDimension);
        }

        let expected = num_rows.checked_mul(row_len).ok_or(MutualPIRError::InvalidRowStoreDimension)?;
        if branch_opt_util::unlikely(flat.len() != expected) {
            return Err(MutualPIRError::InvalidRowStoreByteLength { expected, actual: flat.len() });
        }

        Ok(RowStore { num_rows, row_len, flat })
    }

    /// Concatenates equally sized rows into a new store.
    pub fn from_rows<R: AsRef<[u8]>>(rows: &[R]) -> Result<RowStore, MutualPIRError> {
        let row_len = rows.first().map(|row| row.as_ref().len()).unwrap_or_default();
        let mut store = RowStore::new(rows.len(), row_len)?;

        for (idx, row) in rows.iter().enumerate() {
            store.set_row(idx, row.as_ref())?;
        }

        Ok(store)
    }

    pub const fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub const fn row_len(&self) -> usize {
        self.row_len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.flat
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.flat
    }

    pub fn row(&self, index: usize) -> Result<&[u8], MutualPIRError> {
        if branch_opt_util::unlikely(index >= self.num_rows) {
            return Err(MutualPIRError::RowIndexOutOfBounds {
                index,
                num_rows: self.num_rows,
            });
        }

        Ok(&self.flat[index * self.row_len..(index + 1) * self.row_len])
    }

    /// Overwrites row `index`. The new content must be exactly `row_len` bytes.
    pub fn set_row(&mut self, index: usize, row: &[u8]) -> Result<(), MutualPIRError> {
        if branch_opt_util::unlikely(index >= self.num_rows) {
            return Err(MutualPIRError::RowIndexOutOfBounds {
                index,
                num_rows: self.num_rows,
            });
        }
        if branch_opt_util::unlikely(row.len() != self.row_len) {
            return Err(MutualPIRError::InvalidRowStoreByteLength {
                expected: self.row_len,
                actual: row.len(),
            });
        }

        self.flat[index * self.row_len..(index + 1) * self.row_len].copy_from_slice(row);
        Ok(())
    }

    pub fn rows(&self) -> std::slice::ChunksExact<'_, u8> {
        self.flat.chunks_exact(self.row_len)
    }
}

impl Index<usize> for RowStore {
    type Output = [u8];

    /// Returns row at given index. Panics if index is out of bounds.
    #[inline(always)]
    fn index(&self, index: usize) -> &Self::Output {
        &self.flat[index * self.row_len..(index + 1) * self.row_len]
    }
}
