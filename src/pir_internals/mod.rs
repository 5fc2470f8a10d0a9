pub mod binary_fuse_filter;
pub mod branch_opt_util;
pub mod contact_db;
pub mod dpf;
pub mod error;
pub mod merkle;
pub mod notify_matrix;
pub mod params;
pub mod pir;
pub mod row_store;
pub mod secret_sharing;
pub mod serialization;
