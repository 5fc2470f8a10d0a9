use crate::{
    pir_internals::{
        branch_opt_util,
        contact_db::{ContactDatabase, Table},
        error::MutualPIRError,
        notify_matrix::NotifyMatrix,
        params::TARGET_SAMPLING_SEED,
        pir,
    },
    rpc::{
        Ack, AnswerBatch, ColumnUpdate, ContactServer, QueryBatch, RowRequest, RowShare, SetupRequest, SetupResponse, check_deadline,
    },
};
use rand::{SeedableRng, seq::index};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::{
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

fn worker_pool(num_threads: usize) -> Result<rayon::ThreadPool, MutualPIRError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|idx| format!("pir-worker-{idx}"))
        .build()
        .map_err(|err| MutualPIRError::WorkerPool(err.to_string()))
}

/// Everything one experiment runs against: read-only tables, the shared notification matrix and the worker pool that
/// executes requests.
pub struct Session {
    db: Arc<ContactDatabase>,
    matrix: Arc<NotifyMatrix>,
    epoch: u64,
    pool: rayon::ThreadPool,
    multi_client: bool,
}

impl Session {
    pub fn database(&self) -> &ContactDatabase {
        &self.db
    }

    pub fn matrix(&self) -> &NotifyMatrix {
        &self.matrix
    }

    /// Identifies the notification matrix. Sessions sharing a matrix share the epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Answers a batch of PIR queries against `table`. In multi-client mode every query is its own job, writing into
    /// its slot of a pre-sized answer vector, otherwise the whole batch is one job.
    fn answer_batch(&self, table: &Table, batch: &QueryBatch) -> Result<AnswerBatch, MutualPIRError> {
        let store = table.store();

        let answers = self.pool.install(|| -> Result<Vec<Vec<u8>>, MutualPIRError> {
            if self.multi_client {
                let mut answers = vec![Vec::new(); batch.keys.len()];
                answers
                    .par_iter_mut()
                    .zip(batch.keys.par_iter())
                    .try_for_each(|(slot, key)| -> Result<(), MutualPIRError> {
                        *slot = pir::answer(store, key)?;
                        Ok(())
                    })?;

                Ok(answers)
            } else {
                batch.keys.iter().map(|key| pir::answer(store, key)).collect()
            }
        })?;

        Ok(AnswerBatch { answers })
    }

    fn set_column(&self, update: &ColumnUpdate) -> Result<(), MutualPIRError> {
        let column = update.identity as usize;
        self.pool.install(|| {
            if self.multi_client {
                self.matrix.set_column_parallel(column, &update.share)
            } else {
                self.matrix.set_column(column, &update.share)
            }
        })
    }

    fn get_row(&self, request: &RowRequest) -> Result<Vec<u8>, MutualPIRError> {
        let row = request.identity as usize;
        self.pool.install(|| if self.multi_client { self.matrix.get_row_parallel(row) } else { self.matrix.get_row(row) })
    }

    /// Keys of `num_targets` distinct index table rows other than `client_index`, sampled with a fixed seed so that
    /// every server hands out the same targets.
    fn sample_targets(&self, client_index: usize, num_targets: usize) -> Result<Vec<Vec<u8>>, MutualPIRError> {
        let num_records = self.db.num_records();
        if branch_opt_util::unlikely(num_targets >= num_records) {
            return Err(MutualPIRError::InvalidConfig(format!(
                "can't sample {num_targets} targets out of {} other records",
                num_records - 1
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(TARGET_SAMPLING_SEED);
        index::sample(&mut rng, num_records - 1, num_targets)
            .into_iter()
            .map(|idx| if idx >= client_index { idx + 1 } else { idx })
            .map(|idx| self.db.index_table().record_at(idx).map(|record| record.key))
            .collect()
    }
}

enum Lifecycle {
    Uninitialized,
    Resetting,
    Ready(Arc<Session>),
}

/// One of the two non-colluding servers.
///
/// Lifecycle is `Uninitialized -> Ready -> Resetting -> Ready`. Requests are only served in `Ready`; while a reset loads
/// tables from disk, requests are rejected with `SessionResetting` instead of racing the swap. Every reset starts a new
/// session epoch, which is reported with each notification matrix access.
pub struct Server {
    lifecycle: RwLock<Lifecycle>,
    next_epoch: AtomicU64,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Server {
        Server {
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            next_epoch: AtomicU64::new(0),
        }
    }

    /// Starts a server which is immediately ready, serving an in-memory database.
    pub fn with_database(db: ContactDatabase, num_threads: usize, multi_client: bool) -> Result<Server, MutualPIRError> {
        let matrix = NotifyMatrix::new(db.num_records())?;
        let session = Session {
            db: Arc::new(db),
            matrix: Arc::new(matrix),
            epoch: 0,
            pool: worker_pool(num_threads)?,
            multi_client,
        };

        Ok(Server {
            lifecycle: RwLock::new(Lifecycle::Ready(Arc::new(session))),
            next_epoch: AtomicU64::new(1),
        })
    }

    /// Current session, if the server is ready.
    pub fn session(&self) -> Result<Arc<Session>, MutualPIRError> {
        match &*self.lifecycle.read().unwrap_or_else(PoisonError::into_inner) {
            Lifecycle::Ready(session) => Ok(session.clone()),
            Lifecycle::Resetting => Err(MutualPIRError::SessionResetting),
            Lifecycle::Uninitialized => Err(MutualPIRError::SessionNotInitialized),
        }
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        *self.lifecycle.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Loads tables persisted under the requested prefix and allocates a fresh notification matrix, discarding the
    /// previous session.
    fn reset(&self, request: &SetupRequest) -> Result<Arc<Session>, MutualPIRError> {
        {
            let mut lifecycle = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
            if branch_opt_util::unlikely(matches!(*lifecycle, Lifecycle::Resetting)) {
                return Err(MutualPIRError::SessionResetting);
            }
            *lifecycle = Lifecycle::Resetting;
        }
        tracing::info!(prefix = %request.db_path_prefix.display(), "resetting server session");

        let loaded = ContactDatabase::load(&request.db_path_prefix).and_then(|db| {
            let matrix = NotifyMatrix::new(db.num_records())?;
            Ok(Session {
                db: Arc::new(db),
                matrix: Arc::new(matrix),
                epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
                pool: worker_pool(request.num_threads)?,
                multi_client: request.multi_client,
            })
        });

        match loaded {
            Ok(session) => {
                let session = Arc::new(session);
                self.set_lifecycle(Lifecycle::Ready(session.clone()));

                tracing::info!(
                    records = session.db.num_records(),
                    epoch = session.epoch,
                    threads = request.num_threads,
                    multi_client = request.multi_client,
                    "server session ready"
                );
                Ok(session)
            }
            Err(err) => {
                self.set_lifecycle(Lifecycle::Uninitialized);
                tracing::warn!(error = %err, "server session reset failed");
                Err(err)
            }
        }
    }

    /// Keeps tables and notification matrix of whichever session is current once the lifecycle lock is held, only
    /// rebuilding the worker pool and dispatch mode.
    fn reconfigure(&self, request: &SetupRequest) -> Result<Arc<Session>, MutualPIRError> {
        let pool = worker_pool(request.num_threads)?;

        let mut lifecycle = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
        match &*lifecycle {
            Lifecycle::Ready(current) => {
                let session = Arc::new(Session {
                    db: current.db.clone(),
                    matrix: current.matrix.clone(),
                    epoch: current.epoch,
                    pool,
                    multi_client: request.multi_client,
                });

                *lifecycle = Lifecycle::Ready(session.clone());
                Ok(session)
            }
            Lifecycle::Resetting => Err(MutualPIRError::SessionResetting),
            Lifecycle::Uninitialized => Err(MutualPIRError::SessionNotInitialized),
        }
    }
}

impl ContactServer for Server {
    fn setup_experiment(&self, request: &SetupRequest, deadline: Instant) -> Result<SetupResponse, MutualPIRError> {
        check_deadline(deadline, "SetupExperiment")?;
        if branch_opt_util::unlikely(request.num_threads == 0) {
            return Err(MutualPIRError::InvalidConfig("num_threads must be positive".to_string()));
        }

        let session = match self.session() {
            Ok(_) if !request.reset_server => self.reconfigure(request)?,
            Ok(_) | Err(MutualPIRError::SessionNotInitialized) => self.reset(request)?,
            Err(err) => return Err(err),
        };

        let client_keyword = session.db.index_table().record_at(request.client_index)?.key;
        let targets = session.sample_targets(request.client_index, request.num_targets)?;

        Ok(SetupResponse {
            index_params: session.db.index_table().params.clone(),
            keyword_params: session.db.keyword_table().params.clone(),
            client_keyword,
            targets,
            epoch: session.epoch,
        })
    }

    // Late reads are dropped after the fact. Writes are only refused before they apply.

    fn make_kw_queries(&self, batch: &QueryBatch, deadline: Instant) -> Result<AnswerBatch, MutualPIRError> {
        check_deadline(deadline, "MakeKWQueries")?;
        let session = self.session()?;
        tracing::debug!(queries = batch.keys.len(), "answering keyword queries");

        let answers = session.answer_batch(session.db.keyword_table(), batch)?;
        check_deadline(deadline, "MakeKWQueries")?;
        Ok(answers)
    }

    fn make_i_queries(&self, batch: &QueryBatch, deadline: Instant) -> Result<AnswerBatch, MutualPIRError> {
        check_deadline(deadline, "MakeIQueries")?;
        let session = self.session()?;
        tracing::debug!(queries = batch.keys.len(), "answering index queries");

        let answers = session.answer_batch(session.db.index_table(), batch)?;
        check_deadline(deadline, "MakeIQueries")?;
        Ok(answers)
    }

    fn set_column(&self, update: &ColumnUpdate, deadline: Instant) -> Result<Ack, MutualPIRError> {
        check_deadline(deadline, "SetColumn")?;
        let session = self.session()?;

        session.set_column(update)?;
        Ok(Ack { epoch: session.epoch })
    }

    fn get_row(&self, request: &RowRequest, deadline: Instant) -> Result<RowShare, MutualPIRError> {
        check_deadline(deadline, "GetRow")?;
        let session = self.session()?;

        let share = session.get_row(request)?;
        check_deadline(deadline, "GetRow")?;
        Ok(RowShare {
            share,
            epoch: session.epoch,
        })
    }
}

#[cfg(test)]
mod test {
    use super::{Lifecycle, Server};
    use crate::{
        config::DatabaseConfig,
        pir_internals::{
            contact_db::ContactDatabase,
            error::MutualPIRError,
            pir::{PirQuerier, reconstruct},
            secret_sharing::{combine, share},
            serialization::{pack_indices, unpack_indices},
        },
        rpc::{ColumnUpdate, ContactServer, QueryBatch, RowRequest, SetupRequest, deadline_after},
    };
    use rand::prelude::*;
    use rand_chacha::ChaCha20Rng;
    use std::{
        collections::HashSet,
        path::Path,
        sync::Barrier,
        time::{Duration, Instant},
    };
    use test_case::test_case;

    fn deadline() -> Instant {
        deadline_after(Duration::from_secs(60))
    }

    fn setup_request(prefix: &Path, reset_server: bool, multi_client: bool) -> SetupRequest {
        SetupRequest {
            db_path_prefix: prefix.to_path_buf(),
            reset_server,
            multi_client,
            num_threads: 2,
            client_index: 3,
            num_targets: 5,
        }
    }

    fn store_database(prefix: &Path, auth: bool) -> ContactDatabase {
        let config = DatabaseConfig {
            num_records: 1_000,
            key_len: 32,
            value_len: 32,
            auth,
            seed: 11,
        };
        let db = ContactDatabase::generate(&config).expect("Must be able to generate contact database");
        db.store(prefix).expect("Must be able to store contact database");
        db
    }

    fn flag(server: &Server, sender: u32, receiver: usize) {
        let size = server.session().expect("Server must be ready").matrix().size();
        let share = pack_indices([receiver], size).expect("Must be able to pack");
        server.set_column(&ColumnUpdate { identity: sender, share }, deadline()).expect("Must be able to set column");
    }

    fn flagged_by(server: &Server, receiver: u32) -> Vec<usize> {
        let size = server.session().expect("Server must be ready").matrix().size();
        let row = server.get_row(&RowRequest { identity: receiver }, deadline()).expect("Must be able to get row");
        unpack_indices(&row.share, size)
    }

    #[test]
    fn requests_before_setup_are_rejected() {
        let server = Server::new();

        assert_eq!(
            server.get_row(&RowRequest { identity: 0 }, deadline()).err(),
            Some(MutualPIRError::SessionNotInitialized)
        );
        assert_eq!(
            server.make_kw_queries(&QueryBatch { keys: vec![] }, deadline()).err(),
            Some(MutualPIRError::SessionNotInitialized)
        );
    }

    #[test]
    fn requests_during_reset_are_rejected() {
        let dir = tempfile::tempdir().expect("Must be able to create temporary directory");
        let prefix = dir.path().join("contacts");
        store_database(&prefix, false);

        let server = Server::new();
        server.set_lifecycle(Lifecycle::Resetting);

        assert_eq!(
            server.get_row(&RowRequest { identity: 0 }, deadline()).err(),
            Some(MutualPIRError::SessionResetting)
        );
        assert_eq!(
            server.make_i_queries(&QueryBatch { keys: vec![] }, deadline()).err(),
            Some(MutualPIRError::SessionResetting)
        );
        assert_eq!(
            server.set_column(&ColumnUpdate { identity: 0, share: vec![0; 125] }, deadline()).err(),
            Some(MutualPIRError::SessionResetting)
        );
        for reset_server in [false, true] {
            assert_eq!(
                server.setup_experiment(&setup_request(&prefix, reset_server, false), deadline()).err(),
                Some(MutualPIRError::SessionResetting)
            );
        }

        server.set_lifecycle(Lifecycle::Uninitialized);
        server.setup_experiment(&setup_request(&prefix, false, false), deadline()).expect("Setup must succeed");
        assert!(flagged_by(&server, 0).is_empty());
    }

    #[test]
    fn setup_hands_out_identity_and_distinct_targets() {
        let dir = tempfile::tempdir().expect("Must be able to create temporary directory");
        let prefix = dir.path().join("contacts");
        let db = store_database(&prefix, false);

        let server = Server::new();
        let response = server.setup_experiment(&setup_request(&prefix, false, false), deadline()).expect("Setup must succeed");

        assert_eq!(response.index_params, db.index_table().params);
        assert_eq!(response.keyword_params, db.keyword_table().params);
        assert_eq!(response.client_keyword, db.index_table().record_at(3).expect("Row must exist").key);

        let targets = response.targets.iter().cloned().collect::<HashSet<Vec<u8>>>();
        assert_eq!(targets.len(), 5);
        assert!(!targets.contains(&response.client_keyword));
        assert!(response.targets.iter().all(|t| db.get(t).expect("Lookup must not fail").is_some()));

        let other = Server::new();
        let other_response = other.setup_experiment(&setup_request(&prefix, true, true), deadline()).expect("Setup must succeed");
        assert_eq!(other_response, response);

        let mut too_many = setup_request(&prefix, false, false);
        too_many.num_targets = 1_000;
        assert!(matches!(server.setup_experiment(&too_many, deadline()), Err(MutualPIRError::InvalidConfig(_))));
    }

    #[test]
    fn failed_reset_leaves_server_uninitialized() {
        let dir = tempfile::tempdir().expect("Must be able to create temporary directory");
        let prefix = dir.path().join("contacts");
        store_database(&prefix, false);

        let server = Server::new();
        server.setup_experiment(&setup_request(&prefix, true, false), deadline()).expect("Setup must succeed");

        let missing = dir.path().join("missing");
        assert!(matches!(
            server.setup_experiment(&setup_request(&missing, true, false), deadline()),
            Err(MutualPIRError::Serialization { .. })
        ));
        assert_eq!(
            server.get_row(&RowRequest { identity: 0 }, deadline()).err(),
            Some(MutualPIRError::SessionNotInitialized)
        );
    }

    #[test]
    fn reconfiguring_keeps_notifications_and_reset_discards_them() {
        let dir = tempfile::tempdir().expect("Must be able to create temporary directory");
        let prefix = dir.path().join("contacts");
        store_database(&prefix, false);

        let server = Server::new();
        let first = server.setup_experiment(&setup_request(&prefix, true, false), deadline()).expect("Setup must succeed");
        flag(&server, 2, 7);

        let reconfigured = server.setup_experiment(&setup_request(&prefix, false, true), deadline()).expect("Setup must succeed");
        assert_eq!(reconfigured.epoch, first.epoch);
        assert_eq!(flagged_by(&server, 7), vec![2]);

        let reset = server.setup_experiment(&setup_request(&prefix, true, false), deadline()).expect("Setup must succeed");
        assert_ne!(reset.epoch, first.epoch);
        assert!(flagged_by(&server, 7).is_empty());

        let row = server.get_row(&RowRequest { identity: 7 }, deadline()).expect("Must be able to get row");
        assert_eq!(row.epoch, reset.epoch);
    }

    #[test]
    fn reconfiguring_never_reverts_a_concurrent_reset() {
        let dir = tempfile::tempdir().expect("Must be able to create temporary directory");
        let prefix = dir.path().join("contacts");
        store_database(&prefix, false);

        for _ in 0..8 {
            let server = Server::new();
            let before = server.setup_experiment(&setup_request(&prefix, true, false), deadline()).expect("Setup must succeed");
            flag(&server, 2, 7);

            let barrier = Barrier::new(2);
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    let reconfigured = server.setup_experiment(&setup_request(&prefix, false, true), deadline());
                    assert!(matches!(reconfigured, Ok(_) | Err(MutualPIRError::SessionResetting)));
                });
                scope.spawn(|| {
                    barrier.wait();
                    server.setup_experiment(&setup_request(&prefix, true, false), deadline()).expect("Reset must succeed");
                });
            });

            assert_ne!(server.session().expect("Server must be ready").epoch(), before.epoch);
            assert!(flagged_by(&server, 7).is_empty());
        }
    }

    #[test]
    fn expired_calls_are_rejected_before_writes_apply() {
        let config = DatabaseConfig {
            num_records: 64,
            key_len: 32,
            value_len: 32,
            auth: false,
            seed: 5,
        };
        let server = Server::with_database(ContactDatabase::generate(&config).expect("Must generate"), 2, false).expect("Must start");

        let share = pack_indices([9], 64).expect("Must be able to pack");
        let expired = Instant::now();

        assert!(matches!(
            server.set_column(&ColumnUpdate { identity: 1, share }, expired),
            Err(MutualPIRError::Transport { retryable: true, .. })
        ));
        assert!(matches!(
            server.get_row(&RowRequest { identity: 9 }, expired),
            Err(MutualPIRError::Transport { retryable: true, .. })
        ));
        assert!(matches!(
            server.make_i_queries(&QueryBatch { keys: vec![] }, expired),
            Err(MutualPIRError::Transport { retryable: true, .. })
        ));
        assert!(flagged_by(&server, 9).is_empty());
    }

    #[test_case(false, false; "single job, plain rows")]
    #[test_case(true, false; "job per query, plain rows")]
    #[test_case(false, true; "single job, authenticated rows")]
    #[test_case(true, true; "job per query, authenticated rows")]
    fn two_servers_answer_index_queries(multi_client: bool, auth: bool) {
        let dir = tempfile::tempdir().expect("Must be able to create temporary directory");
        let prefix = dir.path().join("contacts");
        let db = store_database(&prefix, auth);

        let servers = [Server::new(), Server::new()];
        for server in &servers {
            server.setup_experiment(&setup_request(&prefix, true, multi_client), deadline()).expect("Setup must succeed");
        }

        let mut rng = ChaCha20Rng::from_os_rng();
        let querier = PirQuerier::new(db.num_records());
        let indices = [0usize, 1, 500, 999];

        let (left, right): (Vec<_>, Vec<_>) = indices
            .iter()
            .map(|&idx| querier.query(idx, &mut rng).expect("Must be able to generate query"))
            .unzip();

        let answers_left = servers[0].make_i_queries(&QueryBatch { keys: left }, deadline()).expect("Left server must answer");
        let answers_right = servers[1].make_i_queries(&QueryBatch { keys: right }, deadline()).expect("Right server must answer");

        for (i, &idx) in indices.iter().enumerate() {
            let row = reconstruct(&answers_left.answers[i], &answers_right.answers[i]).expect("Must be able to reconstruct");
            let fields = db.index_table().params.open_row(&row, idx).expect("Row must open");

            let expected = db.index_table().record_at(idx).expect("Row must exist");
            assert_eq!(fields.key, expected.key.as_slice());
            assert_eq!(fields.value, expected.value.as_slice());
        }
    }

    #[test]
    fn notifications_written_through_both_servers_combine() {
        let mut rng = ChaCha20Rng::from_os_rng();
        let config = DatabaseConfig {
            num_records: 64,
            key_len: 32,
            value_len: 32,
            auth: false,
            seed: 5,
        };

        let servers = [
            Server::with_database(ContactDatabase::generate(&config).expect("Must generate"), 2, false).expect("Must start"),
            Server::with_database(ContactDatabase::generate(&config).expect("Must generate"), 2, true).expect("Must start"),
        ];

        let receivers = [1usize, 9, 63];
        let vector = pack_indices(receivers, 64).expect("Must be able to pack");
        let shares = share(&vector, 2, &mut rng).expect("Must be able to share");

        for (server, share) in servers.iter().zip(shares) {
            server.set_column(&ColumnUpdate { identity: 20, share }, deadline()).expect("Must be able to set column");
        }

        for receiver in receivers {
            let row_shares = servers
                .iter()
                .map(|server| {
                    let request = RowRequest { identity: receiver as u32 };
                    server.get_row(&request, deadline()).expect("Must get row").share
                })
                .collect::<Vec<_>>();

            assert_eq!(unpack_indices(&combine(&row_shares).expect("Must combine"), 64), vec![20]);
        }
    }
}
