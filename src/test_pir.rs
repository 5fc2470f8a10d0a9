#![cfg(test)]

use crate::{
    client::{Client, Phase},
    config::{DatabaseConfig, ExperimentConfig, ExperimentSuite, RetryPolicy},
    pir_internals::{contact_db::ContactDatabase, error::MutualPIRError},
    rpc::{
        Ack, AnswerBatch, ColumnUpdate, ContactServer, QueryBatch, RowRequest, RowShare, SetupRequest, SetupResponse, deadline_after,
    },
    server::Server,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};
use tempfile::TempDir;
use test_case::test_case;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
}

/// Two servers sharing one persisted contact database.
struct Deployment {
    _dir: TempDir,
    prefix: PathBuf,
    servers: Vec<Arc<dyn ContactServer>>,
}

impl Deployment {
    fn new(num_records: usize, auth: bool) -> Deployment {
        init_tracing();

        let dir = tempfile::tempdir().expect("Must be able to create temporary directory");
        let prefix = dir.path().join("contacts");

        let config = DatabaseConfig {
            num_records,
            key_len: 32,
            value_len: 32,
            auth,
            seed: num_records as u64,
        };
        ContactDatabase::generate(&config)
            .expect("Must be able to generate contact database")
            .store(&prefix)
            .expect("Must be able to store contact database");

        let servers = (0..2).map(|_| Arc::new(Server::new()) as Arc<dyn ContactServer>).collect();
        Deployment { _dir: dir, prefix, servers }
    }

    fn experiment(&self, client_index: usize, reset_server: bool, multi_client: bool) -> ExperimentConfig {
        let mut config = ExperimentConfig::new(&self.prefix);
        config.reset_server = reset_server;
        config.multi_client = multi_client;
        config.num_threads = 2;
        config.client_index = client_index;
        config.rate_send = 2;
        config.rate_recv = 2;
        config
    }

    fn client(&self, config: ExperimentConfig) -> Client {
        Client::setup(config, self.servers.clone()).expect("Client setup failed")
    }
}

fn random_keyword() -> Vec<u8> {
    let mut rng = ChaCha8Rng::from_os_rng();
    let mut keyword = vec![0u8; 32];
    rng.fill_bytes(&mut keyword);
    keyword
}

#[test_case(false, false; "plain rows, single job")]
#[test_case(false, true; "plain rows, job per query")]
#[test_case(true, false; "authenticated rows, single job")]
#[test_case(true, true; "authenticated rows, job per query")]
fn two_parties_discover_each_other(auth: bool, multi_client: bool) {
    const ALICE: usize = 10;
    const BOB: usize = 20;

    let deployment = Deployment::new(500, auth);
    let mut alice = deployment.client(deployment.experiment(ALICE, true, multi_client));
    let mut bob = deployment.client(deployment.experiment(BOB, false, multi_client));

    let stranger = random_keyword();

    let report = alice.run_round(&[bob.keyword().to_vec(), stranger.clone()]).expect("Alice's first round failed");
    assert_eq!(report.receivers, vec![BOB]);
    assert_eq!(report.unresolved, vec![stranger]);
    assert!(report.senders.is_empty());
    assert!(report.reciprocated.is_empty());

    let report = bob.run_round(&[alice.keyword().to_vec()]).expect("Bob's round failed");
    assert_eq!(report.receivers, vec![ALICE]);
    assert!(report.unresolved.is_empty());
    assert_eq!(report.senders, vec![ALICE]);
    assert_eq!(report.reciprocated, vec![ALICE]);

    let report = alice.run_round(&[bob.keyword().to_vec()]).expect("Alice's second round failed");
    assert_eq!(report.receivers, vec![BOB]);
    assert_eq!(report.senders, vec![BOB]);
    assert_eq!(report.reciprocated, vec![BOB]);
}

#[test]
fn flags_are_written_again_after_another_client_resets_the_servers() {
    const ALICE: usize = 10;
    const BOB: usize = 20;
    const CAROL: usize = 30;

    let deployment = Deployment::new(300, false);
    let mut alice = deployment.client(deployment.experiment(ALICE, true, false));
    let mut bob = deployment.client(deployment.experiment(BOB, false, false));

    let report = alice.run_round(&[bob.keyword().to_vec()]).expect("Alice's first round failed");
    assert_eq!(report.receivers, vec![BOB]);

    // Setting up with a reset discards every flag written so far.
    deployment.client(deployment.experiment(CAROL, true, false));

    let report = alice.run_round(&[bob.keyword().to_vec()]).expect("Alice's second round failed");
    assert_eq!(report.receivers, vec![BOB]);

    let report = bob.run_round(&[alice.keyword().to_vec()]).expect("Bob's round failed");
    assert_eq!(report.senders, vec![ALICE]);
    assert_eq!(report.reciprocated, vec![ALICE]);

    let report = alice.run_round(&[bob.keyword().to_vec()]).expect("Alice's third round failed");
    assert_eq!(report.senders, vec![BOB]);
    assert_eq!(report.reciprocated, vec![BOB]);
}

#[test]
fn reset_of_a_single_server_is_detected() {
    let deployment = Deployment::new(300, false);
    let mut client = deployment.client(deployment.experiment(5, true, false));

    let contacts = client.targets().to_vec();
    client.run_round(&contacts).expect("First round failed");

    let request = SetupRequest {
        db_path_prefix: deployment.prefix.clone(),
        reset_server: true,
        multi_client: false,
        num_threads: 2,
        client_index: 6,
        num_targets: 2,
    };
    deployment.servers[0]
        .setup_experiment(&request, deadline_after(Duration::from_secs(60)))
        .expect("Reset must succeed");

    assert_eq!(client.run_round(&contacts), Err(MutualPIRError::ServerMismatch("session epoch")));
}

#[test]
fn contacts_beyond_send_rate_are_dropped() {
    let deployment = Deployment::new(300, false);
    let mut client = deployment.client(deployment.experiment(0, true, false));

    let others = (1..4)
        .map(|idx| deployment.client(deployment.experiment(idx, false, false)).keyword().to_vec())
        .collect::<Vec<_>>();

    let report = client.run_round(&others).expect("Round failed");
    assert_eq!(report.receivers, vec![1, 2]);
    assert!(report.unresolved.is_empty());
}

#[test_case(false; "plain rows")]
#[test_case(true; "authenticated rows")]
fn traffic_shape_does_not_depend_on_contacts(auth: bool) {
    let deployment = Deployment::new(300, auth);

    let mut idle = deployment.client(deployment.experiment(1, true, false));
    let mut busy = deployment.client(deployment.experiment(2, false, false));

    let contacts = vec![idle.keyword().to_vec(), random_keyword()];
    idle.run_round(&[]).expect("Idle round failed");
    busy.run_round(&contacts).expect("Busy round failed");

    for phase in Phase::ALL {
        let (idle_metrics, busy_metrics) = (idle.run_state().phase(phase), busy.run_state().phase(phase));

        assert!(idle_metrics.up_bytes > 0, "{}", phase.name());
        assert_eq!(idle_metrics.up_bytes, busy_metrics.up_bytes, "{}", phase.name());
        assert_eq!(idle_metrics.down_bytes, busy_metrics.down_bytes, "{}", phase.name());
    }
}

#[test]
fn experiment_suite_runs_repetitions_with_fresh_run_state() {
    let deployment = Deployment::new(400, true);

    let dir = tempfile::tempdir().expect("Must be able to create temporary directory");
    let suite_path = dir.path().join("suite.json");

    let mut experiment = deployment.experiment(7, true, true);
    experiment.num_repetitions = 3;
    ExperimentSuite {
        experiments: vec![experiment],
    }
    .save(&suite_path)
    .expect("Must be able to save suite");

    let suite = ExperimentSuite::load(&suite_path).expect("Must be able to load suite");
    for experiment in suite.experiments {
        let mut client = deployment.client(experiment);
        let repetitions = client.run_experiment().expect("Experiment failed");

        assert_eq!(repetitions.len(), 3);
        assert_eq!(repetitions[0].report.receivers.len(), client.targets().len());
        assert!(repetitions.iter().all(|rep| rep.report.receivers == repetitions[0].report.receivers));
        assert!(repetitions.iter().all(|rep| rep.report.unresolved.is_empty()));

        for rep in &repetitions[1..] {
            assert_eq!(rep.run_state.up_bytes(), repetitions[0].run_state.up_bytes());
            assert_eq!(rep.run_state.down_bytes(), repetitions[0].run_state.down_bytes());
        }
        assert_eq!(client.run_state(), &repetitions[2].run_state);
    }
}

/// Fails a configurable number of row reads and column writes with a transient transport error.
struct FlakyServer {
    inner: Arc<dyn ContactServer>,
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
    column_writes: AtomicU32,
}

impl FlakyServer {
    fn new(inner: Arc<dyn ContactServer>, failing_reads: u32, failing_writes: u32) -> FlakyServer {
        FlakyServer {
            inner,
            failing_reads: AtomicU32::new(failing_reads),
            failing_writes: AtomicU32::new(failing_writes),
            column_writes: AtomicU32::new(0),
        }
    }

    fn fail_once(counter: &AtomicU32) -> Result<(), MutualPIRError> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)) {
            Ok(_) => Err(MutualPIRError::Transport {
                retryable: true,
                reason: "connection reset by peer".to_string(),
            }),
            Err(_) => Ok(()),
        }
    }
}

impl ContactServer for FlakyServer {
    fn setup_experiment(&self, request: &SetupRequest, deadline: Instant) -> Result<SetupResponse, MutualPIRError> {
        self.inner.setup_experiment(request, deadline)
    }

    fn make_kw_queries(&self, batch: &QueryBatch, deadline: Instant) -> Result<AnswerBatch, MutualPIRError> {
        self.inner.make_kw_queries(batch, deadline)
    }

    fn make_i_queries(&self, batch: &QueryBatch, deadline: Instant) -> Result<AnswerBatch, MutualPIRError> {
        self.inner.make_i_queries(batch, deadline)
    }

    fn set_column(&self, update: &ColumnUpdate, deadline: Instant) -> Result<Ack, MutualPIRError> {
        self.column_writes.fetch_add(1, Ordering::SeqCst);
        Self::fail_once(&self.failing_writes)?;
        self.inner.set_column(update, deadline)
    }

    fn get_row(&self, request: &RowRequest, deadline: Instant) -> Result<RowShare, MutualPIRError> {
        Self::fail_once(&self.failing_reads)?;
        self.inner.get_row(request, deadline)
    }
}

#[test]
fn row_reads_are_retried_after_transient_failures() {
    let deployment = Deployment::new(200, false);
    let flaky = Arc::new(FlakyServer::new(deployment.servers[0].clone(), 2, 0));

    let mut config = deployment.experiment(4, true, false);
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        backoff_multiplier: 2,
    };

    let servers = vec![flaky.clone() as Arc<dyn ContactServer>, deployment.servers[1].clone()];
    let mut client = Client::setup(config, servers).expect("Client setup failed");
    let contacts = client.targets().to_vec();

    let report = client.run_round(&contacts).expect("Round must survive transient read failures");
    assert_eq!(report.receivers.len(), contacts.len());
    assert_eq!(flaky.failing_reads.load(Ordering::SeqCst), 0);
}

#[test]
fn row_reads_give_up_once_attempts_are_exhausted() {
    let deployment = Deployment::new(200, false);
    let flaky = Arc::new(FlakyServer::new(deployment.servers[0].clone(), 1, 0));

    let mut config = deployment.experiment(4, true, false);
    config.retry = RetryPolicy::no_retry();

    let servers = vec![flaky as Arc<dyn ContactServer>, deployment.servers[1].clone()];
    let mut client = Client::setup(config, servers).expect("Client setup failed");
    let contacts = client.targets().to_vec();

    assert!(matches!(
        client.run_round(&contacts),
        Err(MutualPIRError::Transport { retryable: true, .. })
    ));
}

#[test]
fn column_writes_are_never_retried() {
    let deployment = Deployment::new(200, false);
    let flaky = Arc::new(FlakyServer::new(deployment.servers[0].clone(), 0, 1));

    let servers = vec![flaky.clone() as Arc<dyn ContactServer>, deployment.servers[1].clone()];
    let mut client = Client::setup(deployment.experiment(4, true, false), servers).expect("Client setup failed");
    let contacts = client.targets().to_vec();

    assert!(matches!(client.run_round(&contacts), Err(MutualPIRError::Transport { .. })));
    assert_eq!(flaky.column_writes.load(Ordering::SeqCst), 1);
}

/// Flips a bit of every keyword answer.
struct TamperingServer {
    inner: Arc<dyn ContactServer>,
}

impl ContactServer for TamperingServer {
    fn setup_experiment(&self, request: &SetupRequest, deadline: Instant) -> Result<SetupResponse, MutualPIRError> {
        self.inner.setup_experiment(request, deadline)
    }

    fn make_kw_queries(&self, batch: &QueryBatch, deadline: Instant) -> Result<AnswerBatch, MutualPIRError> {
        let mut answers = self.inner.make_kw_queries(batch, deadline)?;
        for answer in answers.answers.iter_mut() {
            if let Some(byte) = answer.first_mut() {
                *byte ^= 0x01;
            }
        }
        Ok(answers)
    }

    fn make_i_queries(&self, batch: &QueryBatch, deadline: Instant) -> Result<AnswerBatch, MutualPIRError> {
        self.inner.make_i_queries(batch, deadline)
    }

    fn set_column(&self, update: &ColumnUpdate, deadline: Instant) -> Result<Ack, MutualPIRError> {
        self.inner.set_column(update, deadline)
    }

    fn get_row(&self, request: &RowRequest, deadline: Instant) -> Result<RowShare, MutualPIRError> {
        self.inner.get_row(request, deadline)
    }
}

#[test]
fn tampered_answers_are_rejected_with_authentication() {
    let deployment = Deployment::new(200, true);
    let tampering: Arc<dyn ContactServer> = Arc::new(TamperingServer {
        inner: deployment.servers[0].clone(),
    });

    let servers = vec![tampering, deployment.servers[1].clone()];
    let mut client = Client::setup(deployment.experiment(4, true, false), servers).expect("Client setup failed");
    let contacts = client.targets().to_vec();

    assert!(matches!(client.run_round(&contacts), Err(MutualPIRError::ProofRejected(_))));
}

#[test]
fn tampered_answers_go_unresolved_without_authentication() {
    let deployment = Deployment::new(200, false);
    let tampering: Arc<dyn ContactServer> = Arc::new(TamperingServer {
        inner: deployment.servers[0].clone(),
    });

    let servers = vec![tampering, deployment.servers[1].clone()];
    let mut client = Client::setup(deployment.experiment(4, true, false), servers).expect("Client setup failed");
    let contacts = client.targets().to_vec();

    let report = client.run_round(&contacts).expect("Round must complete");
    assert!(report.receivers.is_empty());
    assert_eq!(report.unresolved, contacts);
}
