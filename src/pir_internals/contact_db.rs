use super::{
    binary_fuse_filter::{BinaryFuseFilter, FilterParams},
    branch_opt_util,
    error::MutualPIRError,
    merkle,
    params::{
        BACK_POINTER_BYTE_LEN, DIGEST_BYTE_LEN, INDEX_TABLE_EXT, IO_CHUNK_BYTE_LEN, KEYWORD_TABLE_EXT, MAX_FILTER_BUILD_ATTEMPTS,
        MAX_MESSAGE_BYTE_LEN,
    },
    row_store::RowStore,
    serialization::{self, RowFields},
};
use crate::config::DatabaseConfig;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    ffi::OsString,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A record as found in a table, along with its dense index in the index table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactRecord {
    pub index: usize,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Result of a keyword lookup: the keyword table slot holding the record, and the record itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lookup {
    pub slot: usize,
    pub record: ContactRecord,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    /// Compacted records, addressed by dense index.
    Index,
    /// Filter slots including holes, addressed by candidate slots of a key. Rows carry a back pointer.
    Keyword,
}

/// Public parameters of one table, shipped to clients and persisted in front of the rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableParams {
    pub kind: TableKind,
    pub n_rows: u32,
    pub key_len: u32,
    pub value_len: u32,
    /// Full row length, i.e. key, value, optional back pointer and optional proof.
    pub record_len: u32,
    pub auth: bool,
    pub proof_len: u32,
    pub root: Vec<u8>,
    pub filter: FilterParams,
}

impl TableParams {
    fn payload_len(&self) -> usize {
        let back_pointer_len = if self.kind == TableKind::Keyword { BACK_POINTER_BYTE_LEN } else { 0 };
        self.key_len as usize + self.value_len as usize + back_pointer_len
    }

    /// Checks internal consistency of parameters coming from disk or from a server.
    pub fn validate(&self) -> Result<(), MutualPIRError> {
        self.filter.validate()?;

        let proof_len = if self.auth { self.proof_len as usize } else { 0 };
        let consistent = self.n_rows > 0
            && self.key_len > 0
            && self.record_len as usize == self.payload_len() + proof_len
            && (!self.auth || self.root.len() == DIGEST_BYTE_LEN)
            && (self.auth || (self.proof_len == 0 && self.root.is_empty()))
            && (self.kind == TableKind::Index || self.n_rows as usize == self.filter.capacity());

        if branch_opt_util::likely(consistent) {
            Ok(())
        } else {
            Err(MutualPIRError::serialization("table parameters", "inconsistent dimensions"))
        }
    }

    /// Verifies, if authenticated, and decodes a row which is expected to sit at `expected_index` of this table.
    ///
    /// # Returns
    ///
    /// Fields of the row, or `ProofRejected` if its proof fails or commits to another position.
    pub fn open_row<'a>(&self, row: &'a [u8], expected_index: usize) -> Result<RowFields<'a>, MutualPIRError> {
        let plain = if self.auth {
            let (position, plain) = merkle::verify_row(row, self.proof_len as usize, &self.root)?;
            if branch_opt_util::unlikely(position != expected_index) {
                return Err(MutualPIRError::ProofRejected(format!(
                    "proof is for row {position}, expected row {expected_index}"
                )));
            }
            plain
        } else {
            row
        };

        serialization::decode_row(plain, self.key_len as usize, self.value_len as usize, self.kind == TableKind::Keyword)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    pub params: TableParams,
    store: RowStore,
}

impl Table {
    fn new(params: TableParams, store: RowStore) -> Result<Table, MutualPIRError> {
        params.validate()?;
        if branch_opt_util::unlikely(store.num_rows() != params.n_rows as usize || store.row_len() != params.record_len as usize) {
            return Err(MutualPIRError::InvalidRowStoreByteLength {
                expected: params.n_rows as usize * params.record_len as usize,
                actual: store.as_bytes().len(),
            });
        }

        Ok(Table { params, store })
    }

    pub fn store(&self) -> &RowStore {
        &self.store
    }

    pub fn row(&self, index: usize) -> Result<&[u8], MutualPIRError> {
        self.store.row(index)
    }

    /// Decodes row `index`, verifying its proof in authenticated mode.
    pub fn record_at(&self, index: usize) -> Result<ContactRecord, MutualPIRError> {
        let fields = self.params.open_row(self.store.row(index)?, index)?;

        Ok(ContactRecord {
            index: fields.back_pointer.map(|bp| bp as usize).unwrap_or(index),
            key: fields.key.to_vec(),
            value: fields.value.to_vec(),
        })
    }

    /// Writes `<4-byte BE params length><params><rows>` to `path`, through a fixed-size chunked buffer.
    pub fn write_to(&self, path: &Path) -> Result<(), MutualPIRError> {
        let context = path.display().to_string();
        let io_err = |err: std::io::Error| MutualPIRError::serialization(&context, err);

        let params_bytes = serialization::to_bytes(&self.params, &context)?;
        let params_len = u32::try_from(params_bytes.len()).map_err(|err| MutualPIRError::serialization(&context, err))?;

        let mut writer = BufWriter::with_capacity(IO_CHUNK_BYTE_LEN, File::create(path).map_err(io_err)?);
        writer.write_all(&params_len.to_be_bytes()).map_err(io_err)?;
        writer.write_all(&params_bytes).map_err(io_err)?;

        for chunk in self.store.as_bytes().chunks(IO_CHUNK_BYTE_LEN) {
            writer.write_all(chunk).map_err(io_err)?;
        }
        writer.flush().map_err(io_err)?;

        tracing::info!(path = %context, rows = self.params.n_rows, row_len = self.params.record_len, "stored table");
        Ok(())
    }

    /// Reads a table written by `write_to`. Short files, trailing bytes and inconsistent parameters are fatal. Row
    /// bytes are only allocated once the file is known to hold exactly what the parameters describe.
    pub fn read_from(path: &Path) -> Result<Table, MutualPIRError> {
        let context = path.display().to_string();
        let io_err = |err: std::io::Error| MutualPIRError::serialization(&context, err);

        let file = File::open(path).map_err(io_err)?;
        let file_len = file.metadata().map_err(io_err)?.len();
        let mut reader = BufReader::with_capacity(IO_CHUNK_BYTE_LEN, file);

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).map_err(io_err)?;
        let params_len = u32::from_be_bytes(len_bytes) as u64;
        if branch_opt_util::unlikely(params_len > MAX_MESSAGE_BYTE_LEN) {
            return Err(MutualPIRError::serialization(&context, format!("parameter block of {params_len} bytes exceeds limit")));
        }

        let mut params_bytes = vec![0u8; params_len as usize];
        reader.read_exact(&mut params_bytes).map_err(io_err)?;
        let params: TableParams = serialization::from_bytes(&params_bytes, &context)?;
        params.validate().map_err(|err| MutualPIRError::serialization(&context, err))?;

        let flat_len = params.n_rows as u64 * params.record_len as u64;
        let rows_len = file_len.saturating_sub(len_bytes.len() as u64 + params_len);
        if branch_opt_util::unlikely(flat_len != rows_len) {
            return Err(MutualPIRError::serialization(
                &context,
                format!("parameters describe {flat_len} bytes of rows, file holds {rows_len} bytes"),
            ));
        }

        let flat_len = usize::try_from(flat_len).map_err(|err| MutualPIRError::serialization(&context, err))?;
        let mut flat = vec![0u8; flat_len];
        for chunk in flat.chunks_mut(IO_CHUNK_BYTE_LEN) {
            reader.read_exact(chunk).map_err(io_err)?;
        }

        let mut extra = [0u8; 1];
        if branch_opt_util::unlikely(reader.read(&mut extra).map_err(io_err)? != 0) {
            return Err(MutualPIRError::serialization(&context, "trailing bytes after table rows"));
        }

        let store = RowStore::from_flat(params.n_rows as usize, params.record_len as usize, flat)?;
        let table = Table::new(params, store)?;

        tracing::info!(path = %context, rows = table.params.n_rows, row_len = table.params.record_len, "loaded table");
        Ok(table)
    }
}

/// Two coupled tables built from one filter construction: records by dense index, and records by keyword.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactDatabase {
    index: Table,
    keyword: Table,
}

fn table_path(prefix: &Path, ext: &str) -> PathBuf {
    let mut path = OsString::from(prefix.as_os_str());
    path.push(".");
    path.push(ext);
    PathBuf::from(path)
}

impl ContactDatabase {
    /// Builds both tables over `records`.
    ///
    /// A binary fuse filter places every record into one keyword table slot. Walking the slots in order, each occupied
    /// slot receives the next dense index, which is where the record lands in the index table and what its keyword
    /// row points back to. Holes become all-zero keyword rows. In authenticated mode both tables get a Merkle proof
    /// appended to every row, holes included.
    ///
    /// # Arguments
    ///
    /// * `records` - Non-empty records with distinct keys, all keys of one length and all values of one length.
    /// * `auth` - Whether rows carry proofs of inclusion.
    ///
    /// # Returns
    ///
    /// The database, or an error if records are invalid or the filter can't be built.
    pub fn setup(records: &[Record], auth: bool) -> Result<ContactDatabase, MutualPIRError> {
        let first = records.first().ok_or(MutualPIRError::EmptyRecordSet)?;
        let (key_len, value_len) = (first.key.len(), first.value.len());

        for (index, record) in records.iter().enumerate() {
            if branch_opt_util::unlikely(record.key.len() != key_len) {
                return Err(MutualPIRError::InconsistentRecordLength {
                    index,
                    field: "key",
                    expected: key_len,
                    actual: record.key.len(),
                });
            }
            if branch_opt_util::unlikely(record.value.len() != value_len) {
                return Err(MutualPIRError::InconsistentRecordLength {
                    index,
                    field: "value",
                    expected: value_len,
                    actual: record.value.len(),
                });
            }
        }
        if branch_opt_util::unlikely(key_len == 0 || records.len() > u32::MAX as usize) {
            return Err(MutualPIRError::InvalidRowStoreDimension);
        }

        let keys = records.iter().map(|record| record.key.as_slice()).collect::<Vec<&[u8]>>();
        let filter = BinaryFuseFilter::build(&keys, MAX_FILTER_BUILD_ATTEMPTS)?;

        let mut index_store = RowStore::new(records.len(), key_len + value_len)?;
        let mut keyword_store = RowStore::new(filter.slots.len(), key_len + value_len + BACK_POINTER_BYTE_LEN)?;

        let mut dense_index = 0usize;
        for (slot, placed) in filter.slots.iter().enumerate() {
            if let Some(record_idx) = *placed {
                let record = &records[record_idx];

                index_store.set_row(dense_index, &serialization::encode_index_row(&record.key, &record.value))?;
                keyword_store.set_row(slot, &serialization::encode_keyword_row(&record.key, &record.value, dense_index as u32))?;
                dense_index += 1;
            }
        }

        let index = Self::finish_table(TableKind::Index, index_store, key_len, value_len, auth, filter.params)?;
        let keyword = Self::finish_table(TableKind::Keyword, keyword_store, key_len, value_len, auth, filter.params)?;

        tracing::info!(
            records = records.len(),
            keyword_rows = keyword.params.n_rows,
            auth,
            "built contact database"
        );
        Ok(ContactDatabase { index, keyword })
    }

    fn finish_table(
        kind: TableKind,
        store: RowStore,
        key_len: usize,
        value_len: usize,
        auth: bool,
        filter: FilterParams,
    ) -> Result<Table, MutualPIRError> {
        let (root, proof_len, store) = if auth {
            let authenticated = merkle::authenticate(&store)?;
            (authenticated.root.to_vec(), authenticated.proof_len, authenticated.rows)
        } else {
            (Vec::new(), 0, store)
        };

        let params = TableParams {
            kind,
            n_rows: store.num_rows() as u32,
            key_len: key_len as u32,
            value_len: value_len as u32,
            record_len: store.row_len() as u32,
            auth,
            proof_len: proof_len as u32,
            root,
            filter,
        };

        Table::new(params, store)
    }

    /// Builds a database of random records, deterministic in `config.seed`.
    pub fn generate(config: &DatabaseConfig) -> Result<ContactDatabase, MutualPIRError> {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut seen = HashSet::with_capacity(config.num_records);
        let mut records = Vec::with_capacity(config.num_records);

        while records.len() < config.num_records {
            let mut key = vec![0u8; config.key_len];
            let mut value = vec![0u8; config.value_len];
            rng.fill_bytes(&mut key);
            rng.fill_bytes(&mut value);

            if seen.insert(key.clone()) {
                records.push(Record { key, value });
            }
        }

        ContactDatabase::setup(&records, config.auth)
    }

    pub fn index_table(&self) -> &Table {
        &self.index
    }

    pub fn keyword_table(&self) -> &Table {
        &self.keyword
    }

    pub fn num_records(&self) -> usize {
        self.index.params.n_rows as usize
    }

    /// Scans the three candidate keyword slots of `key`, matching on the stored key bytes.
    pub fn get(&self, key: &[u8]) -> Result<Option<Lookup>, MutualPIRError> {
        for slot in self.keyword.params.filter.get_indices(key) {
            let fields = self.keyword.params.open_row(self.keyword.row(slot)?, slot)?;

            if fields.key == key {
                return Ok(Some(Lookup {
                    slot,
                    record: ContactRecord {
                        index: fields.back_pointer.map(|bp| bp as usize).unwrap_or_default(),
                        key: fields.key.to_vec(),
                        value: fields.value.to_vec(),
                    },
                }));
            }
        }

        Ok(None)
    }

    /// Like `get`, but treats an absent key as an error.
    pub fn lookup(&self, key: &[u8]) -> Result<Lookup, MutualPIRError> {
        self.get(key)?.ok_or(MutualPIRError::KeyNotFound)
    }

    /// Persists both tables as `<prefix>.ipir` and `<prefix>.kwpir`.
    pub fn store(&self, prefix: &Path) -> Result<(), MutualPIRError> {
        self.index.write_to(&table_path(prefix, INDEX_TABLE_EXT))?;
        self.keyword.write_to(&table_path(prefix, KEYWORD_TABLE_EXT))
    }

    /// Loads both tables persisted under `prefix`, checking that they belong together.
    pub fn load(prefix: &Path) -> Result<ContactDatabase, MutualPIRError> {
        let index = Table::read_from(&table_path(prefix, INDEX_TABLE_EXT))?;
        let keyword = Table::read_from(&table_path(prefix, KEYWORD_TABLE_EXT))?;

        let coupled = index.params.kind == TableKind::Index
            && keyword.params.kind == TableKind::Keyword
            && index.params.filter == keyword.params.filter
            && index.params.key_len == keyword.params.key_len
            && index.params.value_len == keyword.params.value_len;

        if branch_opt_util::unlikely(!coupled) {
            return Err(MutualPIRError::serialization(prefix.display(), "index and keyword tables don't belong together"));
        }

        Ok(ContactDatabase { index, keyword })
    }
}
