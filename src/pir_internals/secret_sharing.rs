use super::{branch_opt_util, error::MutualPIRError, pir::xor_into};
use rand::{CryptoRng, RngCore};

/// Splits `vector` into `num_shares` XOR shares. The first `num_shares - 1` shares are uniformly random, the last one is
/// `vector` XOR all others, so any strict subset of shares is independent of `vector`.
pub fn share<R: RngCore + CryptoRng>(vector: &[u8], num_shares: usize, rng: &mut R) -> Result<Vec<Vec<u8>>, MutualPIRError> {
    if branch_opt_util::unlikely(num_shares < 2) {
        return Err(MutualPIRError::InvalidShareCount(num_shares));
    }

    let mut shares = Vec::with_capacity(num_shares);
    let mut last = vector.to_vec();

    for _ in 0..num_shares - 1 {
        let mut random_share = vec![0u8; vector.len()];
        rng.fill_bytes(&mut random_share);

        xor_into(&mut last, &random_share);
        shares.push(random_share);
    }

    shares.push(last);
    Ok(shares)
}

/// XORs all shares back together.
pub fn combine<S: AsRef<[u8]>>(shares: &[S]) -> Result<Vec<u8>, MutualPIRError> {
    if branch_opt_util::unlikely(shares.len() < 2) {
        return Err(MutualPIRError::InvalidShareCount(shares.len()));
    }

    let mut combined = shares[0].as_ref().to_vec();
    for share in &shares[1..] {
        let share = share.as_ref();
        if branch_opt_util::unlikely(share.len() != combined.len()) {
            return Err(MutualPIRError::InvalidShareLength {
                expected: combined.len(),
                actual: share.len(),
            });
        }

        xor_into(&mut combined, share);
    }

    Ok(combined)
}

#[cfg(test)]
mod test {
    use super::{combine, share};
    use crate::pir_internals::error::MutualPIRError;
    use rand::prelude::*;
    use rand_chacha::ChaCha20Rng;
    use test_case::test_case;

    #[test_case(0, 2; "empty vector")]
    #[test_case(1, 2; "single byte two shares")]
    #[test_case(13, 2; "two shares")]
    #[test_case(128, 3; "three shares")]
    #[test_case(1000, 7; "many shares")]
    fn combining_all_shares_recovers_vector(vector_len: usize, num_shares: usize) {
        let mut rng = ChaCha20Rng::from_os_rng();

        let mut vector = vec![0u8; vector_len];
        rng.fill_bytes(&mut vector);

        let shares = share(&vector, num_shares, &mut rng).expect("Must be able to share vector");
        assert_eq!(shares.len(), num_shares);
        assert!(shares.iter().all(|s| s.len() == vector_len));

        assert_eq!(combine(&shares).expect("Must be able to combine shares"), vector);
    }

    #[test]
    fn single_share_looks_random() {
        const VECTOR_LEN: usize = 4096;
        let mut rng = ChaCha20Rng::from_os_rng();

        // An all-zero vector, so any structure in a share could only come from the sharing itself.
        let vector = vec![0u8; VECTOR_LEN];
        let shares = share(&vector, 2, &mut rng).expect("Must be able to share vector");

        for s in &shares {
            let num_ones = s.iter().map(|byte| byte.count_ones() as usize).sum::<usize>();
            let num_bits = VECTOR_LEN * 8;

            assert!(num_ones > num_bits * 45 / 100 && num_ones < num_bits * 55 / 100);
        }
        assert_eq!(shares[0], shares[1]);
    }

    #[test]
    fn invalid_share_sets_are_rejected() {
        let mut rng = ChaCha20Rng::from_os_rng();

        assert_eq!(share(&[1, 2, 3], 1, &mut rng), Err(MutualPIRError::InvalidShareCount(1)));
        assert_eq!(combine(&[vec![1u8, 2]]), Err(MutualPIRError::InvalidShareCount(1)));
        assert_eq!(
            combine(&[vec![1u8, 2], vec![3u8]]),
            Err(MutualPIRError::InvalidShareLength { expected: 2, actual: 1 })
        );
    }
}
