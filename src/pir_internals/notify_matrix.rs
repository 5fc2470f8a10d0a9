use super::{
    branch_opt_util,
    error::MutualPIRError,
    row_store::RowStore,
    serialization::{pack_flags, unpack_indices},
};
use rayon::prelude::*;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One server's share of the square notification matrix. Row `r` collects the senders which flagged receiver `r`, one
/// byte per sender column.
///
/// Every row sits behind its own lock, so column writes and row reads touching different rows never contend, while two
/// writers of the same row are serialized. Rows are owned one by one for that reason, `snapshot` gathers them into a
/// flat row store.
pub struct NotifyMatrix {
    size: usize,
    rows: Vec<Mutex<Vec<u8>>>,
}

impl NotifyMatrix {
    /// Allocates a zeroed `size x size` matrix.
    pub fn new(size: usize) -> Result<NotifyMatrix, MutualPIRError> {
        if branch_opt_util::unlikely(size == 0) {
            return Err(MutualPIRError::InvalidRowStoreDimension);
        }

        let rows = (0..size).map(|_| Mutex::new(vec![0u8; size])).collect();
        Ok(NotifyMatrix { size, rows })
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Byte length of a column share or a row share.
    pub const fn share_len(&self) -> usize {
        self.size.div_ceil(8)
    }

    fn lock_row(&self, row: usize) -> MutexGuard<'_, Vec<u8>> {
        // A panicking writer can at worst leave a single flag unapplied, the row itself stays well formed.
        self.rows[row].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_column_update(&self, column: usize, share: &[u8]) -> Result<Vec<usize>, MutualPIRError> {
        if branch_opt_util::unlikely(column >= self.size) {
            return Err(MutualPIRError::IdentityOutOfRange { index: column, size: self.size });
        }
        if branch_opt_util::unlikely(share.len() != self.share_len()) {
            return Err(MutualPIRError::InvalidShareLength {
                expected: self.share_len(),
                actual: share.len(),
            });
        }

        Ok(unpack_indices(share, self.size))
    }

    /// XORs a column share into the matrix: for every set bit `r` of `share`, flips the flag at `(r, column)`.
    pub fn set_column(&self, column: usize, share: &[u8]) -> Result<(), MutualPIRError> {
        for row in self.check_column_update(column, share)? {
            self.lock_row(row)[column] ^= 1;
        }

        Ok(())
    }

    /// Same as `set_column`, with every affected row updated as its own task on the current rayon pool.
    pub fn set_column_parallel(&self, column: usize, share: &[u8]) -> Result<(), MutualPIRError> {
        let affected_rows = self.check_column_update(column, share)?;
        affected_rows.into_par_iter().for_each(|row| {
            self.lock_row(row)[column] ^= 1;
        });

        Ok(())
    }

    /// Returns this server's share of row `row`, packed as a bit vector.
    pub fn get_row(&self, row: usize) -> Result<Vec<u8>, MutualPIRError> {
        if branch_opt_util::unlikely(row >= self.size) {
            return Err(MutualPIRError::IdentityOutOfRange { index: row, size: self.size });
        }

        Ok(pack_flags(&self.lock_row(row)))
    }

    /// Same as `get_row`, packing disjoint output bytes in parallel.
    pub fn get_row_parallel(&self, row: usize) -> Result<Vec<u8>, MutualPIRError> {
        if branch_opt_util::unlikely(row >= self.size) {
            return Err(MutualPIRError::IdentityOutOfRange { index: row, size: self.size });
        }

        let flags = self.lock_row(row);
        let mut packed = vec![0u8; self.share_len()];

        packed.par_iter_mut().zip(flags.par_chunks(8)).for_each(|(byte, chunk)| {
            *byte = pack_flags(chunk)[0];
        });

        Ok(packed)
    }

    /// Copies the current matrix content into a flat row store.
    pub fn snapshot(&self) -> Result<RowStore, MutualPIRError> {
        let mut flat = Vec::with_capacity(self.size * self.size);
        for row in 0..self.size {
            flat.extend_from_slice(&self.lock_row(row));
        }

        RowStore::from_flat(self.size, self.size, flat)
    }
}

#[cfg(test)]
mod test {
    use super::NotifyMatrix;
    use crate::pir_internals::{
        error::MutualPIRError,
        secret_sharing::{combine, share},
        serialization::{pack_indices, unpack_indices},
    };
    use rand::prelude::*;
    use rand_chacha::{ChaCha8Rng, ChaCha20Rng};
    use rayon::prelude::*;
    use std::collections::BTreeSet;
    use test_case::test_case;

    #[test_case(vec![]; "empty set")]
    #[test_case(vec![4]; "single receiver")]
    #[test_case((0..37).collect(); "full set")]
    #[test_case(vec![0, 8, 9, 36]; "scattered receivers")]
    fn column_written_through_shares_reads_back_through_rows(receivers: Vec<usize>) {
        const SIZE: usize = 37;
        const SENDER: usize = 11;

        let mut rng = ChaCha20Rng::from_os_rng();
        let servers = [
            NotifyMatrix::new(SIZE).expect("Must be able to allocate"),
            NotifyMatrix::new(SIZE).expect("Must be able to allocate"),
        ];

        let vector = pack_indices(receivers.iter().copied(), SIZE).expect("Must be able to pack receivers");
        let shares = share(&vector, 2, &mut rng).expect("Must be able to share vector");

        servers[0].set_column(SENDER, &shares[0]).expect("Must be able to set column");
        servers[1].set_column_parallel(SENDER, &shares[1]).expect("Must be able to set column");

        for receiver in 0..SIZE {
            let row_shares = [
                servers[0].get_row(receiver).expect("Must be able to get row"),
                servers[1].get_row_parallel(receiver).expect("Must be able to get row"),
            ];
            let senders = unpack_indices(&combine(&row_shares).expect("Must be able to combine"), SIZE);

            if receivers.contains(&receiver) {
                assert_eq!(senders, vec![SENDER]);
            } else {
                assert!(senders.is_empty());
            }
        }
    }

    #[test]
    fn hundred_parties_notify_each_other_concurrently() {
        const NUM_PARTIES: usize = 100;

        let mut rng = ChaCha8Rng::seed_from_u64(NUM_PARTIES as u64);
        let targets = (0..NUM_PARTIES)
            .map(|party| {
                let num_targets = rng.random_range(0..NUM_PARTIES);
                (0..NUM_PARTIES).filter(|&t| t != party).choose_multiple(&mut rng, num_targets)
            })
            .collect::<Vec<Vec<usize>>>();

        let servers = [
            NotifyMatrix::new(NUM_PARTIES).expect("Must be able to allocate"),
            NotifyMatrix::new(NUM_PARTIES).expect("Must be able to allocate"),
        ];

        (0..NUM_PARTIES).into_par_iter().for_each(|party| {
            let mut rng = ChaCha20Rng::from_os_rng();

            let vector = pack_indices(targets[party].iter().copied(), NUM_PARTIES).expect("Must be able to pack targets");
            let shares = share(&vector, 2, &mut rng).expect("Must be able to share vector");

            servers[0].set_column(party, &shares[0]).expect("Must be able to set column");
            servers[1].set_column_parallel(party, &shares[1]).expect("Must be able to set column");
        });

        for receiver in 0..NUM_PARTIES {
            let expected = (0..NUM_PARTIES).filter(|&sender| targets[sender].contains(&receiver)).collect::<BTreeSet<usize>>();

            let row_shares = [
                servers[0].get_row(receiver).expect("Must be able to get row"),
                servers[1].get_row(receiver).expect("Must be able to get row"),
            ];
            let senders = unpack_indices(&combine(&row_shares).expect("Must be able to combine"), NUM_PARTIES);

            assert_eq!(senders.into_iter().collect::<BTreeSet<usize>>(), expected, "Receiver {receiver}");
        }
    }

    #[test]
    fn out_of_range_updates_are_rejected() {
        let matrix = NotifyMatrix::new(10).expect("Must be able to allocate");

        assert_eq!(matrix.set_column(10, &[0, 0]), Err(MutualPIRError::IdentityOutOfRange { index: 10, size: 10 }));
        assert_eq!(matrix.set_column(1, &[0]), Err(MutualPIRError::InvalidShareLength { expected: 2, actual: 1 }));
        assert_eq!(matrix.get_row(10), Err(MutualPIRError::IdentityOutOfRange { index: 10, size: 10 }));
        assert_eq!(NotifyMatrix::new(0).err(), Some(MutualPIRError::InvalidRowStoreDimension));

        // Padding bits of a share are ignored.
        matrix.set_column(1, &[0, 0xff]).expect("Must be able to set column");
        let snapshot = matrix.snapshot().expect("Must be able to snapshot");
        let flagged_rows = (0..10).filter(|&r| snapshot[r][1] == 1).collect::<Vec<_>>();
        assert_eq!(flagged_rows, vec![8, 9]);
    }
}
