use super::{
    branch_opt_util,
    error::MutualPIRError,
    params::{BACK_POINTER_BYTE_LEN, MAX_MESSAGE_BYTE_LEN},
};
use bincode::Options;
use serde::{Serialize, de::DeserializeOwned};

/// Fields of a decoded table row, borrowed from the row bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct RowFields<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub back_pointer: Option<u32>,
}

/// Lays out an index table row as `key || value`.
#[inline]
pub fn encode_index_row(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut row = Vec::with_capacity(key.len() + value.len());
    row.extend_from_slice(key);
    row.extend_from_slice(value);
    row
}

/// Lays out a keyword table row as `key || value || back_pointer`, where the back pointer is the big-endian dense index
/// of the same record in the index table.
#[inline]
pub fn encode_keyword_row(key: &[u8], value: &[u8], back_pointer: u32) -> Vec<u8> {
    let mut row = Vec::with_capacity(key.len() + value.len() + BACK_POINTER_BYTE_LEN);
    row.extend_from_slice(key);
    row.extend_from_slice(value);
    row.extend_from_slice(&back_pointer.to_be_bytes());
    row
}

/// Splits a plain (proof already stripped) row into its fields.
///
/// # Arguments
///
/// * `row` - Row bytes, at least `key_len + value_len` bytes, plus the back pointer if `with_back_pointer` is set.
/// * `key_len` - Byte length of the key prefix.
/// * `value_len` - Byte length of the value following the key.
/// * `with_back_pointer` - Whether the row carries a trailing back pointer, as keyword table rows do.
///
/// # Returns
///
/// Borrowed row fields, or an error if the row is too short.
#[inline]
pub fn decode_row(row: &[u8], key_len: usize, value_len: usize, with_back_pointer: bool) -> Result<RowFields<'_>, MutualPIRError> {
    let expected = key_len + value_len + if with_back_pointer { BACK_POINTER_BYTE_LEN } else { 0 };
    if branch_opt_util::unlikely(row.len() < expected) {
        return Err(MutualPIRError::InvalidRowStoreByteLength { expected, actual: row.len() });
    }

    let (key, rest) = row.split_at(key_len);
    let (value, rest) = rest.split_at(value_len);

    let back_pointer = if with_back_pointer {
        let mut be_bytes = [0u8; BACK_POINTER_BYTE_LEN];
        be_bytes.copy_from_slice(&rest[..BACK_POINTER_BYTE_LEN]);
        Some(u32::from_be_bytes(be_bytes))
    } else {
        None
    };

    Ok(RowFields { key, value, back_pointer })
}

/// Packs a set of indices into a bit vector of `size` bits, most significant bit first within each byte.
///
/// # Arguments
///
/// * `indices` - Positions to set, each smaller than `size`. Repeated positions are set once.
/// * `size` - Number of meaningful bits.
///
/// # Returns
///
/// `ceil(size / 8)` bytes, or an error if any index is out of range.
pub fn pack_indices<I: IntoIterator<Item = usize>>(indices: I, size: usize) -> Result<Vec<u8>, MutualPIRError> {
    let mut bits = vec![0u8; size.div_ceil(8)];

    for index in indices {
        if branch_opt_util::unlikely(index >= size) {
            return Err(MutualPIRError::IdentityOutOfRange { index, size });
        }
        bits[index / 8] |= 0x80 >> (index % 8);
    }

    Ok(bits)
}

/// Sorted positions of set bits, ignoring padding bits at or beyond `size`.
pub fn unpack_indices(bits: &[u8], size: usize) -> Vec<usize> {
    bits.iter()
        .enumerate()
        .flat_map(|(byte_idx, &byte)| (0..8).filter(move |bit| (byte >> (7 - bit)) & 1 == 1).map(move |bit| byte_idx * 8 + bit))
        .take_while(|&index| index < size)
        .collect()
}

/// Repacks a byte-per-bit slice, where any non-zero byte counts as set, into a bit vector of the same layout as
/// `pack_indices`.
pub fn pack_flags(flags: &[u8]) -> Vec<u8> {
    let mut bits = vec![0u8; flags.len().div_ceil(8)];
    for (index, &flag) in flags.iter().enumerate() {
        if flag != 0 {
            bits[index / 8] |= 0x80 >> (index % 8);
        }
    }
    bits
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding().with_limit(MAX_MESSAGE_BYTE_LEN)
}

/// Serializes a wire message or persisted parameter block, refusing anything larger than the message cap.
pub fn to_bytes<T: Serialize>(value: &T, context: &str) -> Result<Vec<u8>, MutualPIRError> {
    bincode_options().serialize(value).map_err(|err| MutualPIRError::serialization(context, err))
}

/// Deserializes a wire message or persisted parameter block, rejecting trailing bytes.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8], context: &str) -> Result<T, MutualPIRError> {
    bincode_options().deserialize(bytes).map_err(|err| MutualPIRError::serialization(context, err))
}

/// Encoded byte length of a message, used for bandwidth accounting. Messages over the cap can't be sent, so they have
/// no length.
pub fn encoded_len<T: Serialize>(value: &T, context: &str) -> Result<u64, MutualPIRError> {
    bincode_options().serialized_size(value).map_err(|err| MutualPIRError::serialization(context, err))
}
