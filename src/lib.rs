//! MutualPIR: private contact discovery with mutual notification, mediated by two non-colluding servers.
//!
//! A participant looks contacts up by keyword and flags them in a secret-shared notification matrix, then learns who
//! flagged it and whether its own contacts reciprocated. Neither server learns who is looking up or notifying whom.
//!
//! ## Features
//!
//! * **Keyword and Index PIR:** Two-server PIR built on a distributed point function. Each server XORs together the rows
//!   selected by its half of the query, the client XORs both answers into the queried row.
//! * **Binary Fuse Filter Layout:** Records are placed into a compact keyword table using a 3-wise binary fuse filter, so a
//!   keyword lookup costs three PIR queries. A coupled index table holds the same records by dense index.
//! * **Secret-Shared Notification Matrix:** Column writes and row reads travel as XOR shares, servers never see plaintext
//!   presence bits.
//! * **Optional Row Authentication:** Rows can carry Merkle proofs of inclusion, letting clients reject forged answers.
//! * **Fixed Traffic Shape:** Every round sends the same number of queries and writes, padded with dummy queries.
//!
//! ## Usage
//!
//! Servers are reached through the `ContactServer` trait. `Server` implements it in-process, a network transport would
//! implement it by forwarding messages from the `rpc` module.
//!
//! Add this crate as dependency to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! mutual_pir = "=0.1.0"
//! ```
//!
//! Then, you can use it in your code:
//!
//! ```rust
//! use mutual_pir::{
//!     ContactDatabase, MutualPIRError,
//!     client::Client,
//!     config::{DatabaseConfig, ExperimentConfig},
//!     rpc::ContactServer,
//!     server::Server,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), MutualPIRError> {
//!     // Both servers hold the same database, generated deterministically from a seed.
//!     let db_config = DatabaseConfig {
//!         num_records: 256,
//!         key_len: 32,
//!         value_len: 32,
//!         auth: true,
//!         seed: 7,
//!     };
//!
//!     let left: Arc<dyn ContactServer> = Arc::new(Server::with_database(ContactDatabase::generate(&db_config)?, 2, false)?);
//!     let right: Arc<dyn ContactServer> = Arc::new(Server::with_database(ContactDatabase::generate(&db_config)?, 2, false)?);
//!
//!     // Servers already hold their tables, so they are not reset from disk.
//!     let mut config = ExperimentConfig::new("contacts");
//!     config.reset_server = false;
//!     config.num_threads = 2;
//!
//!     let mut client = Client::setup(config, vec![left, right])?;
//!     let targets = client.targets().to_vec();
//!
//!     let report = client.run_round(&targets)?;
//!     println!("Flagged {} contacts, {} of them reciprocated", report.receivers.len(), report.reciprocated.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! * `server`: Contains the `Server` struct, holding a session of contact database, notification matrix and worker pool.
//! * `client`: Contains the `Client` struct, running rounds of the protocol against both servers.
//! * `rpc`: Wire messages and the `ContactServer` trait.
//! * `config`: Experiment and database configuration.

pub use pir_internals::binary_fuse_filter::{BinaryFuseFilter, FilterParams};
pub use pir_internals::contact_db::{ContactDatabase, ContactRecord, Lookup, Record, Table, TableKind, TableParams};
pub use pir_internals::dpf::DpfKey;
pub use pir_internals::error::MutualPIRError;
pub use pir_internals::notify_matrix::NotifyMatrix;
pub use pir_internals::params::{KEY_BYTE_LEN, MAX_FILTER_BUILD_ATTEMPTS, NUM_SERVERS, VALUE_BYTE_LEN};
pub use pir_internals::pir::{PirQuerier, answer as pir_answer, reconstruct as pir_reconstruct};
pub use pir_internals::row_store::RowStore;
pub use pir_internals::secret_sharing::{combine, share};
pub use pir_internals::serialization::{pack_indices, unpack_indices};

pub mod client;
pub mod config;
pub mod rpc;
pub mod server;

mod pir_internals;

mod test_pir;
