//! Messages exchanged between a client and each of the two servers, and the server interface a transport exposes.

use crate::pir_internals::{contact_db::TableParams, dpf::DpfKey, error::MutualPIRError, serialization};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetupRequest {
    pub db_path_prefix: PathBuf,
    pub reset_server: bool,
    pub multi_client: bool,
    pub num_threads: usize,
    pub client_index: usize,
    pub num_targets: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetupResponse {
    pub index_params: TableParams,
    pub keyword_params: TableParams,
    /// Key of index table row `client_index`, the client's own identity.
    pub client_keyword: Vec<u8>,
    /// Keywords of other registered identities, for the client to contact.
    pub targets: Vec<Vec<u8>>,
    /// Session epoch of the answering server, bumped whenever a reset discards its notification matrix.
    pub epoch: u64,
}

/// One half of every query in a batch, in query order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryBatch {
    pub keys: Vec<DpfKey>,
}

/// Answers, positionally matching the queries of a `QueryBatch`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnswerBatch {
    pub answers: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnUpdate {
    pub identity: u32,
    pub share: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowRequest {
    pub identity: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowShare {
    pub share: Vec<u8>,
    /// Epoch of the session the row was read from
    pub epoch: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// Epoch of the session the column was written into
    pub epoch: u64,
}

/// Server side of the protocol. `Server` implements it in-process, network transports implement it by forwarding
/// encoded messages, mapping their failures to `MutualPIRError::Transport`.
///
/// Every call carries the instant by which the caller gives up. Expired calls fail with a retryable transport error.
pub trait ContactServer: Send + Sync {
    /// (Re)initializes the session and hands out the client's identity and contact targets.
    fn setup_experiment(&self, request: &SetupRequest, deadline: Instant) -> Result<SetupResponse, MutualPIRError>;

    /// PIR over the keyword table.
    fn make_kw_queries(&self, batch: &QueryBatch, deadline: Instant) -> Result<AnswerBatch, MutualPIRError>;

    /// PIR over the index table.
    fn make_i_queries(&self, batch: &QueryBatch, deadline: Instant) -> Result<AnswerBatch, MutualPIRError>;

    /// XORs a column share into the notification matrix. Not idempotent.
    fn set_column(&self, update: &ColumnUpdate, deadline: Instant) -> Result<Ack, MutualPIRError>;

    /// Reads one row share of the notification matrix. Idempotent.
    fn get_row(&self, request: &RowRequest, deadline: Instant) -> Result<RowShare, MutualPIRError>;
}

/// Deadline of a call issued now, bounded by `timeout`.
pub fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

/// Fails with a retryable transport error once `deadline` has passed.
pub fn check_deadline(deadline: Instant, rpc: &str) -> Result<(), MutualPIRError> {
    if Instant::now() >= deadline {
        return Err(MutualPIRError::Transport {
            retryable: true,
            reason: format!("{rpc} deadline exceeded"),
        });
    }

    Ok(())
}

/// Encodes a message for the wire.
pub fn encode_message<T: Serialize>(message: &T, phase: &str) -> Result<Vec<u8>, MutualPIRError> {
    serialization::to_bytes(message, phase)
}

/// Decodes a message received from the wire, bounded by the message size cap.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8], phase: &str) -> Result<T, MutualPIRError> {
    serialization::from_bytes(bytes, phase)
}

/// Encoded size of a message in bytes.
pub fn message_byte_len<T: Serialize>(message: &T) -> Result<u64, MutualPIRError> {
    serialization::encoded_len(message, "message length")
}

#[cfg(test)]
mod test {
    use super::{ColumnUpdate, QueryBatch, RowRequest, check_deadline, decode_message, deadline_after, encode_message, message_byte_len};
    use crate::pir_internals::{dpf, error::MutualPIRError};
    use rand::prelude::*;
    use rand_chacha::ChaCha20Rng;
    use std::time::{Duration, Instant};

    #[test]
    fn messages_survive_the_wire() {
        let mut rng = ChaCha20Rng::from_os_rng();
        let (left, right) = dpf::generate(9, 6, &mut rng).expect("Must be able to generate DPF keys");

        let batch = QueryBatch { keys: vec![left, right] };
        let bytes = encode_message(&batch, "SendPIR").expect("Must be able to encode batch");
        assert_eq!(Ok(bytes.len() as u64), message_byte_len(&batch));
        assert_eq!(decode_message::<QueryBatch>(&bytes, "SendPIR"), Ok(batch));

        let update = ColumnUpdate {
            identity: 3,
            share: vec![0xa5; 13],
        };
        let bytes = encode_message(&update, "SendNotify").expect("Must be able to encode update");
        assert_eq!(decode_message::<ColumnUpdate>(&bytes, "SendNotify"), Ok(update));
    }

    #[test]
    fn malformed_messages_name_their_phase() {
        let bytes = encode_message(&RowRequest { identity: 1 }, "RecvGetNotified").expect("Must be able to encode request");

        match decode_message::<ColumnUpdate>(&bytes, "RecvGetNotified") {
            Err(MutualPIRError::Serialization { context, .. }) => assert_eq!(context, "RecvGetNotified"),
            other => panic!("Unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn passed_deadlines_fail_as_transient() {
        assert!(check_deadline(deadline_after(Duration::from_secs(60)), "GetRow").is_ok());

        match check_deadline(Instant::now(), "GetRow") {
            Err(err @ MutualPIRError::Transport { .. }) => {
                assert!(err.is_retryable());
                assert!(err.to_string().contains("GetRow deadline exceeded"));
            }
            other => panic!("Unexpected deadline check result: {other:?}"),
        }
    }
}
