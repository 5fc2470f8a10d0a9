use super::{branch_opt_util, error::MutualPIRError, params::DIGEST_BYTE_LEN, row_store::RowStore};
use turboshake::TurboShake128;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;
const POSITION_BYTE_LEN: usize = std::mem::size_of::<u32>();

pub type Digest = [u8; DIGEST_BYTE_LEN];

/// Rows with an inclusion proof appended to each, along with the root every proof verifies against.
pub struct AuthenticatedRows {
    pub root: Digest,
    pub proof_len: usize,
    pub rows: RowStore,
}

fn hash_parts(prefix: u8, parts: &[&[u8]]) -> Digest {
    let mut hasher = TurboShake128::default();
    hasher.absorb(&[prefix]);
    for part in parts {
        hasher.absorb(part);
    }
    hasher.finalize::<{ TurboShake128::DEFAULT_DOMAIN_SEPARATOR }>();

    let mut digest = [0u8; DIGEST_BYTE_LEN];
    hasher.squeeze(&mut digest);
    digest
}

fn hash_leaf(row: &[u8]) -> Digest {
    hash_parts(LEAF_PREFIX, &[row])
}

fn hash_node(left: &Digest, right: &Digest) -> Digest {
    hash_parts(NODE_PREFIX, &[left.as_slice(), right.as_slice()])
}

/// Builds a binary Merkle tree over all rows of `store` and appends to every row its proof of inclusion.
///
/// Leaves are padded with all-zero digests up to the next power of two, so every proof carries the same number of
/// sibling digests. A proof is the big-endian `u32` leaf position followed by the sibling digests, leaf level first.
///
/// # Arguments
///
/// * `store` - Rows to authenticate.
///
/// # Returns
///
/// Root digest, byte length of every appended proof and the extended rows.
pub fn authenticate(store: &RowStore) -> Result<AuthenticatedRows, MutualPIRError> {
    let num_rows = store.num_rows();
    if branch_opt_util::unlikely(num_rows > u32::MAX as usize) {
        return Err(MutualPIRError::InvalidRowStoreDimension);
    }

    let num_leaves = num_rows.next_power_of_two();
    let depth = num_leaves.trailing_zeros() as usize;

    let mut levels: Vec<Vec<Digest>> = Vec::with_capacity(depth + 1);
    levels.push(
        store
            .rows()
            .map(hash_leaf)
            .chain(std::iter::repeat([0u8; DIGEST_BYTE_LEN]))
            .take(num_leaves)
            .collect(),
    );

    for level in 0..depth {
        let next = levels[level].chunks_exact(2).map(|pair| hash_node(&pair[0], &pair[1])).collect();
        levels.push(next);
    }

    let root = levels[depth][0];
    let proof_len = POSITION_BYTE_LEN + depth * DIGEST_BYTE_LEN;

    let mut rows = RowStore::new(num_rows, store.row_len() + proof_len)?;
    let mut extended = Vec::with_capacity(store.row_len() + proof_len);

    for (idx, row) in store.rows().enumerate() {
        extended.clear();
        extended.extend_from_slice(row);
        extended.extend_from_slice(&(idx as u32).to_be_bytes());

        let mut position = idx;
        for level in levels.iter().take(depth) {
            extended.extend_from_slice(&level[position ^ 1]);
            position >>= 1;
        }

        rows.set_row(idx, &extended)?;
    }

    Ok(AuthenticatedRows { root, proof_len, rows })
}

/// Checks the proof appended to `row_with_proof` against `root` and strips it.
///
/// # Returns
///
/// The leaf position the proof commits to along with the plain row. Callers are expected to compare the position with
/// the row index they asked for.
pub fn verify_row<'a>(row_with_proof: &'a [u8], proof_len: usize, root: &[u8]) -> Result<(usize, &'a [u8]), MutualPIRError> {
    if branch_opt_util::unlikely(
        proof_len < POSITION_BYTE_LEN || (proof_len - POSITION_BYTE_LEN) % DIGEST_BYTE_LEN != 0 || row_with_proof.len() < proof_len,
    ) {
        return Err(MutualPIRError::MalformedProof {
            proof_len,
            actual: row_with_proof.len(),
        });
    }

    let (row, proof) = row_with_proof.split_at(row_with_proof.len() - proof_len);
    let (position_bytes, siblings) = proof.split_at(POSITION_BYTE_LEN);

    let mut position_be = [0u8; POSITION_BYTE_LEN];
    position_be.copy_from_slice(position_bytes);
    let position = u32::from_be_bytes(position_be) as usize;

    let depth = siblings.len() / DIGEST_BYTE_LEN;
    if branch_opt_util::unlikely(depth < usize::BITS as usize && (position >> depth) != 0) {
        return Err(MutualPIRError::ProofRejected(format!("leaf position {position} does not fit a tree of depth {depth}")));
    }

    let mut acc = hash_leaf(row);
    for (level, sibling) in siblings.chunks_exact(DIGEST_BYTE_LEN).enumerate() {
        let mut sibling_digest = [0u8; DIGEST_BYTE_LEN];
        sibling_digest.copy_from_slice(sibling);

        acc = if (position >> level) & 1 == 0 {
            hash_node(&acc, &sibling_digest)
        } else {
            hash_node(&sibling_digest, &acc)
        };
    }

    if branch_opt_util::likely(acc.as_slice() == root) {
        Ok((position, row))
    } else {
        Err(MutualPIRError::ProofRejected(format!("root mismatch for leaf position {position}")))
    }
}

#[cfg(test)]
mod test {
    use super::{authenticate, verify_row};
    use crate::pir_internals::{error::MutualPIRError, row_store::RowStore};
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use test_case::test_case;

    fn random_store(num_rows: usize, row_len: usize) -> RowStore {
        let mut rng = ChaCha8Rng::from_os_rng();
        let mut flat = vec![0u8; num_rows * row_len];
        rng.fill_bytes(&mut flat);

        RowStore::from_flat(num_rows, row_len, flat).expect("Must be able to build row store")
    }

    #[test_case(1, 16; "single row")]
    #[test_case(7, 16; "non power of two rows")]
    #[test_case(64, 68; "power of two rows")]
    #[test_case(1000, 36; "thousand rows")]
    fn every_authenticated_row_verifies(num_rows: usize, row_len: usize) {
        let store = random_store(num_rows, row_len);
        let auth = authenticate(&store).expect("Must be able to authenticate rows");

        assert_eq!(auth.rows.num_rows(), num_rows);
        assert_eq!(auth.rows.row_len(), row_len + auth.proof_len);

        for (idx, row_with_proof) in auth.rows.rows().enumerate() {
            let (position, row) = verify_row(row_with_proof, auth.proof_len, &auth.root).expect("Proof must verify");

            assert_eq!(position, idx);
            assert_eq!(row, &store[idx]);
        }
    }

    #[test]
    fn tampered_rows_are_rejected() {
        let store = random_store(33, 40);
        let auth = authenticate(&store).expect("Must be able to authenticate rows");

        let mut tampered = auth.rows.row(5).expect("Row must exist").to_vec();
        tampered[0] ^= 1;
        assert!(matches!(verify_row(&tampered, auth.proof_len, &auth.root), Err(MutualPIRError::ProofRejected(_))));

        let mut tampered = auth.rows.row(5).expect("Row must exist").to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x80;
        assert!(matches!(verify_row(&tampered, auth.proof_len, &auth.root), Err(MutualPIRError::ProofRejected(_))));

        let zeroed = vec![0u8; auth.rows.row_len()];
        assert!(matches!(verify_row(&zeroed, auth.proof_len, &auth.root), Err(MutualPIRError::ProofRejected(_))));

        assert!(matches!(verify_row(&zeroed[..3], auth.proof_len, &auth.root), Err(MutualPIRError::MalformedProof { .. })));
    }
}
