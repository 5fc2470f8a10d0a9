/// Number of candidate slots per key in the binary fuse filter. Slot derivation is only valid for this arity.
pub const ARITY: u32 = 3;
pub const MAX_FILTER_BUILD_ATTEMPTS: usize = 1024;
pub const MAX_SEGMENT_LENGTH: u32 = 1u32 << 18;

pub const KEY_BYTE_LEN: usize = 32;
pub const VALUE_BYTE_LEN: usize = 32;
/// Keyword table rows point back into the index table with a big-endian `u32`.
pub const BACK_POINTER_BYTE_LEN: usize = std::mem::size_of::<u32>();

pub const DIGEST_BYTE_LEN: usize = 32;
pub const PRG_SEED_BYTE_LEN: usize = 16;

pub const IO_CHUNK_BYTE_LEN: usize = 4096;
pub const MAX_MESSAGE_BYTE_LEN: u64 = 64 * 1024 * 1024;

pub const NUM_SERVERS: usize = 2;
pub const TARGET_SAMPLING_SEED: u64 = 42;

pub const INDEX_TABLE_EXT: &str = "ipir";
pub const KEYWORD_TABLE_EXT: &str = "kwpir";
