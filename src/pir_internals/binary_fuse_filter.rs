use super::{
    branch_opt_util,
    error::MutualPIRError,
    params::{ARITY, DIGEST_BYTE_LEN, MAX_SEGMENT_LENGTH},
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use turboshake::TurboShake128;

/// Public parameters of a 3-wise binary fuse filter. Anyone holding them can recompute the candidate slots of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterParams {
    pub seed: u64,
    pub segment_length: u32,
    pub segment_length_mask: u32,
    pub segment_count: u32,
    pub segment_count_length: u32,
}

impl FilterParams {
    /// Number of slots in the filter array, including holes.
    pub const fn capacity(&self) -> usize {
        ((self.segment_count + ARITY - 1) as usize) * (self.segment_length as usize)
    }

    /// Recomputes the three candidate slot indices of `key`, each within `0..capacity()`.
    pub fn get_indices(&self, key: &[u8]) -> [usize; 3] {
        let hash = mix256(&hash_of_key(key), self.seed);
        let (h0, h1, h2) = hash_batch(hash, self.segment_length, self.segment_length_mask, self.segment_count_length);

        [h0 as usize, h1 as usize, h2 as usize]
    }

    /// Checks parameters received over the wire or read from disk before they are used for slot derivation.
    pub fn validate(&self) -> Result<(), MutualPIRError> {
        let well_formed = self.segment_length.is_power_of_two()
            && self.segment_length <= MAX_SEGMENT_LENGTH
            && self.segment_length_mask == self.segment_length - 1
            && self.segment_count > 0
            && self.segment_count.checked_mul(self.segment_length) == Some(self.segment_count_length)
            && self.segment_count.checked_add(ARITY - 1).and_then(|c| c.checked_mul(self.segment_length)).is_some();

        if branch_opt_util::likely(well_formed) {
            Ok(())
        } else {
            Err(MutualPIRError::InvalidFilterParams)
        }
    }
}

/// Outcome of a successful filter construction: `slots[i]` holds the position of the record placed into slot `i`,
/// or `None` for a hole.
#[derive(Clone, Debug)]
pub struct BinaryFuseFilter {
    pub params: FilterParams,
    pub slots: Vec<Option<usize>>,
}

impl BinaryFuseFilter {
    /// Places every key into exactly one of its three candidate slots by peeling a 3-wise binary fuse filter.
    ///
    /// Seeds are drawn from a splitmix64 stream starting at a fixed state, so the outcome only depends on the keys and
    /// their order. Each failed attempt draws a fresh seed, up to `max_attempt_count` attempts.
    ///
    /// # Arguments
    ///
    /// * `keys` - Non-empty collection of distinct keys.
    /// * `max_attempt_count` - Upper bound on construction attempts before giving up.
    ///
    /// # Returns
    ///
    /// The filter parameters along with the slot assignment, or an error if the keys are empty or duplicated, or if all
    /// attempts failed. A partially peeled filter is never returned.
    pub fn build<K: AsRef<[u8]>>(keys: &[K], max_attempt_count: usize) -> Result<BinaryFuseFilter, MutualPIRError> {
        let size = keys.len();
        if branch_opt_util::unlikely(size == 0) {
            return Err(MutualPIRError::EmptyRecordSet);
        }

        {
            let mut seen = HashSet::with_capacity(size);
            if let Some(dup_idx) = keys.iter().position(|key| !seen.insert(key.as_ref())) {
                return Err(MutualPIRError::DuplicateKey(dup_idx));
            }
        }

        let segment_length = segment_length(size as u32).min(MAX_SEGMENT_LENGTH);
        let segment_length_mask = segment_length - 1;

        let capacity = if size > 1 { ((size as f64) * size_factor(size as u32)).round() as u32 } else { 0 };

        let init_segment_count = capacity.div_ceil(segment_length);
        let (num_slots, segment_count) = {
            let array_len = init_segment_count * segment_length;
            let segment_count: u32 = {
                let proposed = array_len.div_ceil(segment_length);
                if proposed < ARITY { 1 } else { proposed - (ARITY - 1) }
            };
            let array_len: u32 = (segment_count + ARITY - 1) * segment_length;
            (array_len as usize, segment_count)
        };
        let segment_count_length = segment_count * segment_length;

        let digests = keys.iter().map(|key| hash_of_key(key.as_ref())).collect::<Vec<[u64; 4]>>();

        let mut alone = vec![0u32; num_slots];
        let mut t2count = vec![0u8; num_slots];
        let mut t2hash = vec![0u64; num_slots];
        let mut reverse_h = vec![0u8; size];
        let mut reverse_order = vec![0u64; size + 1];
        reverse_order[size] = 1;

        let mut hash_to_record: HashMap<u64, usize> = HashMap::with_capacity(size);

        let block_bits = {
            let mut block_bits = 1;
            while (1u32 << block_bits) < segment_count {
                block_bits += 1;
            }
            block_bits
        };
        let block_bits_mask = (1u64 << block_bits) - 1;

        let start_pos_len: usize = 1 << block_bits;
        let mut start_pos = vec![0usize; start_pos_len];

        let mut h012 = [0u32; 5];
        let mut rng_state = 1u64;

        for attempt in 0..max_attempt_count {
            let seed = splitmix64(&mut rng_state);

            reverse_order[..size].fill(0);
            t2count.fill(0);
            t2hash.fill(0);
            hash_to_record.clear();

            for (i, pos) in start_pos.iter_mut().enumerate() {
                *pos = (((i as u64) * (size as u64)) >> block_bits) as usize;
            }

            let mut hash_collision = false;
            for (record_idx, digest) in digests.iter().enumerate() {
                let hash = mix256(digest, seed);
                if branch_opt_util::unlikely(hash_to_record.insert(hash, record_idx).is_some()) {
                    hash_collision = true;
                    break;
                }

                let mut segment_index = hash >> (64 - block_bits);
                while reverse_order[start_pos[segment_index as usize]] != 0 {
                    segment_index += 1;
                    segment_index &= block_bits_mask;
                }

                reverse_order[start_pos[segment_index as usize]] = hash;
                start_pos[segment_index as usize] += 1;
            }

            if hash_collision {
                tracing::debug!(attempt, "64-bit key hash collision, retrying filter construction");
                continue;
            }

            let mut saturated = false;
            for &hash in reverse_order.iter().take(size) {
                let (h0, h1, h2) = hash_batch(hash, segment_length, segment_length_mask, segment_count_length);
                let (h0, h1, h2) = (h0 as usize, h1 as usize, h2 as usize);

                t2count[h0] = t2count[h0].wrapping_add(4);
                t2hash[h0] ^= hash;

                t2count[h1] = t2count[h1].wrapping_add(4);
                t2count[h1] ^= 1;
                t2hash[h1] ^= hash;

                t2count[h2] = t2count[h2].wrapping_add(4);
                t2count[h2] ^= 2;
                t2hash[h2] ^= hash;

                // Two identical hashes cancel out, leaving a zero accumulator on a slot counted twice.
                if (t2hash[h0] & t2hash[h1] & t2hash[h2]) == 0
                    && ((t2hash[h0] == 0 && t2count[h0] == 8) || (t2hash[h1] == 0 && t2count[h1] == 8) || (t2hash[h2] == 0 && t2count[h2] == 8))
                {
                    saturated = true;
                    break;
                }

                if t2count[h0] < 4 || t2count[h1] < 4 || t2count[h2] < 4 {
                    saturated = true;
                    break;
                }
            }

            if saturated {
                tracing::debug!(attempt, "slot counter saturated, retrying filter construction");
                continue;
            }

            let mut qsize = 0;
            for i in 0..num_slots {
                alone[qsize] = i as u32;
                if (t2count[i] >> 2) == 1 {
                    qsize += 1;
                }
            }

            let mut stack_size = 0;
            while qsize > 0 {
                qsize -= 1;

                let index = alone[qsize] as usize;
                if (t2count[index] >> 2) == 1 {
                    let hash = t2hash[index];
                    let found: u8 = t2count[index] & 3;

                    reverse_h[stack_size] = found;
                    reverse_order[stack_size] = hash;
                    stack_size += 1;

                    let (h0, h1, h2) = hash_batch(hash, segment_length, segment_length_mask, segment_count_length);

                    h012[1] = h1;
                    h012[2] = h2;
                    h012[3] = h0;
                    h012[4] = h012[1];

                    let other_index1 = h012[(found + 1) as usize] as usize;
                    alone[qsize] = other_index1 as u32;
                    if (t2count[other_index1] >> 2) == 2 {
                        qsize += 1;
                    }

                    t2count[other_index1] = t2count[other_index1].wrapping_sub(4);
                    t2count[other_index1] ^= mod3(found + 1);
                    t2hash[other_index1] ^= hash;

                    let other_index2 = h012[(found + 2) as usize] as usize;
                    alone[qsize] = other_index2 as u32;
                    if (t2count[other_index2] >> 2) == 2 {
                        qsize += 1;
                    }

                    t2count[other_index2] = t2count[other_index2].wrapping_sub(4);
                    t2count[other_index2] ^= mod3(found + 2);
                    t2hash[other_index2] ^= hash;
                }
            }

            if stack_size != size {
                tracing::debug!(attempt, peeled = stack_size, size, "incomplete peeling, retrying filter construction");
                continue;
            }

            let mut slots: Vec<Option<usize>> = vec![None; num_slots];
            let mut placed_all = true;

            for i in (0..size).rev() {
                let hash = reverse_order[i];
                let (h0, h1, h2) = hash_batch(hash, segment_length, segment_length_mask, segment_count_length);

                let slot = [h0, h1, h2][reverse_h[i] as usize] as usize;
                match (hash_to_record.get(&hash), slots[slot]) {
                    (Some(&record_idx), None) => slots[slot] = Some(record_idx),
                    _ => {
                        placed_all = false;
                        break;
                    }
                }
            }

            if branch_opt_util::unlikely(!placed_all) {
                continue;
            }

            tracing::debug!(attempts = attempt + 1, size, capacity = num_slots, "built binary fuse filter");
            return Ok(BinaryFuseFilter {
                params: FilterParams {
                    seed,
                    segment_length,
                    segment_length_mask,
                    segment_count,
                    segment_count_length,
                },
                slots,
            });
        }

        Err(MutualPIRError::ExhaustedFilterConstructionAttempts(max_attempt_count))
    }
}

#[inline(always)]
pub fn segment_length(size: u32) -> u32 {
    if size == 0 {
        return 4;
    }

    1u32 << ((size as f64).ln() / 3.33_f64.ln() + 2.25).floor() as usize
}

#[inline(always)]
pub fn size_factor(size: u32) -> f64 {
    1.125_f64.max(0.875 + 0.25 * 1e6_f64.ln() / (size as f64).ln())
}

#[inline(always)]
pub const fn mod3(x: u8) -> u8 {
    if x > 2 { x - 3 } else { x }
}

/// Advances the splitmix64 state and returns the next pseudo-random word.
#[inline(always)]
pub fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);

    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Computes a 64-bit MurmurHash3-like hash from a 64-bit input.
/// See https://github.com/aappleby/smhasher/blob/0ff96f7835817a27d0487325b6c16033e2992eb5/src/MurmurHash3.cpp#L81-L90.
#[inline(always)]
pub const fn murmur64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

#[inline(always)]
pub const fn mix(key: u64, seed: u64) -> u64 {
    murmur64(key.wrapping_add(seed))
}

/// Compresses an arbitrary length key into four words using TurboSHAKE128.
#[inline(always)]
pub fn hash_of_key(key: &[u8]) -> [u64; 4] {
    let mut hasher = TurboShake128::default();
    hasher.absorb(key);
    hasher.finalize::<{ TurboShake128::DEFAULT_DOMAIN_SEPARATOR }>();

    let mut digest = [0u8; DIGEST_BYTE_LEN];
    hasher.squeeze(&mut digest);

    let mut words = [0u64; 4];
    digest.chunks_exact(8).zip(words.iter_mut()).for_each(|(chunk, word)| {
        let mut le_bytes = [0u8; 8];
        le_bytes.copy_from_slice(chunk);
        *word = u64::from_le_bytes(le_bytes);
    });

    words
}

/// Seeded 64-bit hash of a key digest.
#[inline(always)]
pub fn mix256(digest: &[u64; 4], seed: u64) -> u64 {
    digest.iter().fold(seed, |acc, &word| murmur64(acc.wrapping_add(mix(word, seed))))
}

/// Derives the three candidate slots of a hashed key. Only valid for arity 3.
#[inline]
pub const fn hash_batch(hash: u64, segment_length: u32, segment_length_mask: u32, segment_count_length: u32) -> (u32, u32, u32) {
    let hi = ((hash as u128 * segment_count_length as u128) >> 64) as u64;

    let h0 = hi as u32;
    let mut h1 = h0 + segment_length;
    let mut h2 = h1 + segment_length;

    h1 ^= ((hash >> 18) as u32) & segment_length_mask;
    h2 ^= (hash as u32) & segment_length_mask;

    (h0, h1, h2)
}
