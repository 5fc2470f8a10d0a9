use crate::{
    config::ExperimentConfig,
    pir_internals::{
        branch_opt_util,
        contact_db::{TableKind, TableParams},
        error::MutualPIRError,
        params::{ARITY, NUM_SERVERS},
        pir::{self, PirQuerier},
        secret_sharing::{combine, share},
        serialization::{pack_indices, unpack_indices},
    },
    rpc::{
        AnswerBatch, ColumnUpdate, ContactServer, QueryBatch, RowRequest, RowShare, SetupRequest, deadline_after, message_byte_len,
    },
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::Serialize;
use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

/// Phases of one round, in the only order they ever run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Keyword PIR for the contacts' index rows.
    SendPir,
    /// Flag the resolved receivers in our column.
    SendNotify,
    /// Read our row to learn who flagged us.
    RecvGetNotified,
    /// Index PIR for the senders' records.
    RecvPir,
    /// Flag the senders back.
    RecvNotify,
    /// Read our row once more to learn who reciprocated.
    SendGetNotified,
}

impl Phase {
    pub const COUNT: usize = 6;
    pub const ALL: [Phase; Phase::COUNT] = [
        Phase::SendPir,
        Phase::SendNotify,
        Phase::RecvGetNotified,
        Phase::RecvPir,
        Phase::RecvNotify,
        Phase::SendGetNotified,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Phase::SendPir => "SendPIR",
            Phase::SendNotify => "SendNotify",
            Phase::RecvGetNotified => "RecvGetNotified",
            Phase::RecvPir => "RecvPIR",
            Phase::RecvNotify => "RecvNotify",
            Phase::SendGetNotified => "SendGetNotified",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseMetrics {
    /// Encoded request bytes, summed over both servers
    pub up_bytes: u64,
    /// Encoded response bytes, summed over both servers
    pub down_bytes: u64,
    pub latency: Duration,
}

/// Bandwidth and latency of the current round, per phase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunState {
    phases: [PhaseMetrics; Phase::COUNT],
}

impl RunState {
    pub fn phase(&self, phase: Phase) -> PhaseMetrics {
        self.phases[phase as usize]
    }

    pub fn up_bytes(&self) -> u64 {
        self.phases.iter().map(|metrics| metrics.up_bytes).sum()
    }

    pub fn down_bytes(&self) -> u64 {
        self.phases.iter().map(|metrics| metrics.down_bytes).sum()
    }

    pub fn latency(&self) -> Duration {
        self.phases.iter().map(|metrics| metrics.latency).sum()
    }

    fn record(&mut self, phase: Phase, up_bytes: u64, down_bytes: u64, latency: Duration) {
        let metrics = &mut self.phases[phase as usize];

        metrics.up_bytes += up_bytes;
        metrics.down_bytes += down_bytes;
        metrics.latency += latency;
    }
}

/// What one round found out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Index table rows of the contacts which were flagged
    pub receivers: Vec<usize>,
    /// Contact keywords absent from the keyword table
    pub unresolved: Vec<Vec<u8>>,
    /// Identities which flagged us and whose records were retrieved
    pub senders: Vec<usize>,
    /// Receivers which flagged us as well
    pub reciprocated: Vec<usize>,
}

/// Outcome of one repetition of an experiment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repetition {
    pub report: RoundReport,
    pub run_state: RunState,
}

/// Issues one call per server in parallel and waits for all of them. Results are in server order.
fn fan_out<T, F>(servers: &[Arc<dyn ContactServer>], call: F) -> Result<Vec<T>, MutualPIRError>
where
    T: Send,
    F: Fn(usize, &dyn ContactServer) -> Result<T, MutualPIRError> + Send + Sync,
{
    servers.par_iter().enumerate().map(|(idx, server)| call(idx, server.as_ref())).collect()
}

fn encoded_len<M: Serialize>(messages: &[M]) -> Result<u64, MutualPIRError> {
    messages.iter().map(message_byte_len).sum()
}

fn check_answer_count(answers: &[AnswerBatch], num_queries: usize) -> Result<(), MutualPIRError> {
    match answers.iter().find(|batch| batch.answers.len() != num_queries) {
        Some(batch) => Err(MutualPIRError::ReconstructionFailed(format!(
            "server returned {} answers for {num_queries} queries",
            batch.answers.len()
        ))),
        None => Ok(()),
    }
}

/// A participant, talking to both servers.
///
/// Every round issues exactly `rate_send * 3` keyword queries and `rate_recv` index queries, padding with dummy queries
/// for the client's own identity, and always writes both column shares, so servers see the same traffic shape no
/// matter how many contacts or senders there are.
///
/// Flags are written as deltas against what this client flagged in the servers' current session. Once servers report
/// a new session epoch those flags are gone, and the client writes them again.
pub struct Client {
    config: ExperimentConfig,
    servers: Vec<Arc<dyn ContactServer>>,
    identity: usize,
    keyword: Vec<u8>,
    targets: Vec<Vec<u8>>,
    index_params: TableParams,
    keyword_params: TableParams,
    /// Last session epoch seen from each server
    epochs: Vec<u64>,
    /// Identities flagged in the sessions of `epochs`
    notified: BTreeSet<usize>,
    run_state: RunState,
    rng: ChaCha20Rng,
}

impl Client {
    /// Sets up the experiment on both servers and checks that they agree on everything they handed out.
    ///
    /// # Arguments
    ///
    /// * `config` - Experiment to run, validated first.
    /// * `servers` - Exactly two non-colluding servers.
    ///
    /// # Returns
    ///
    /// A client holding its identity, both tables' parameters and the sampled targets.
    pub fn setup(config: ExperimentConfig, servers: Vec<Arc<dyn ContactServer>>) -> Result<Client, MutualPIRError> {
        config.validate()?;
        if branch_opt_util::unlikely(servers.len() != NUM_SERVERS) {
            return Err(MutualPIRError::InvalidConfig(format!("expected {NUM_SERVERS} servers, got {}", servers.len())));
        }

        let request = SetupRequest {
            db_path_prefix: config.db_path_prefix.clone(),
            reset_server: config.reset_server,
            multi_client: config.multi_client,
            num_threads: config.num_threads,
            client_index: config.client_index,
            num_targets: config.rate_send,
        };

        let responses = fan_out(&servers, |_, server| server.setup_experiment(&request, deadline_after(config.rpc_timeout())))?;
        let epochs = responses.iter().map(|response| response.epoch).collect::<Vec<_>>();

        let mut responses = responses.into_iter();
        let response = responses.next().ok_or(MutualPIRError::ServerMismatch("setup response"))?;

        for other in responses {
            if other.index_params != response.index_params || other.keyword_params != response.keyword_params {
                return Err(MutualPIRError::ServerMismatch("table parameters"));
            }
            if other.client_keyword != response.client_keyword {
                return Err(MutualPIRError::ServerMismatch("client identity"));
            }
            if other.targets != response.targets {
                return Err(MutualPIRError::ServerMismatch("targets"));
            }
        }

        response.index_params.validate()?;
        response.keyword_params.validate()?;
        let kinds = (response.index_params.kind, response.keyword_params.kind);
        if branch_opt_util::unlikely(kinds != (TableKind::Index, TableKind::Keyword)) {
            return Err(MutualPIRError::ServerMismatch("table kinds"));
        }

        tracing::info!(
            identity = config.client_index,
            records = response.index_params.n_rows,
            auth = response.index_params.auth,
            targets = response.targets.len(),
            "client set up"
        );

        Ok(Client {
            identity: config.client_index,
            keyword: response.client_keyword,
            targets: response.targets,
            index_params: response.index_params,
            keyword_params: response.keyword_params,
            epochs,
            notified: BTreeSet::new(),
            run_state: RunState::default(),
            rng: ChaCha20Rng::from_os_rng(),
            config,
            servers,
        })
    }

    pub fn identity(&self) -> usize {
        self.identity
    }

    pub fn keyword(&self) -> &[u8] {
        &self.keyword
    }

    pub fn targets(&self) -> &[Vec<u8>] {
        &self.targets
    }

    pub fn index_params(&self) -> &TableParams {
        &self.index_params
    }

    pub fn keyword_params(&self) -> &TableParams {
        &self.keyword_params
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    fn matrix_size(&self) -> usize {
        self.index_params.n_rows as usize
    }

    /// Runs one round against `contacts`, given as keywords.
    ///
    /// A failure in any phase aborts the rest of the round. Flags written by completed phases stay in place, they are
    /// part of the session.
    pub fn run_round(&mut self, contacts: &[Vec<u8>]) -> Result<RoundReport, MutualPIRError> {
        let (receivers, unresolved) = self.send_pir(contacts)?;
        self.notify(Phase::SendNotify, &receivers)?;

        let pending = self.get_notified(Phase::RecvGetNotified)?;
        let senders = self.recv_pir(&pending)?;
        self.notify(Phase::RecvNotify, &senders)?;

        let flagged_by = self.get_notified(Phase::SendGetNotified)?.into_iter().collect::<BTreeSet<usize>>();
        let reciprocated = receivers.iter().copied().filter(|receiver| flagged_by.contains(receiver)).collect::<Vec<_>>();

        tracing::debug!(
            identity = self.identity,
            receivers = receivers.len(),
            unresolved = unresolved.len(),
            senders = senders.len(),
            reciprocated = reciprocated.len(),
            up_bytes = self.run_state.up_bytes(),
            down_bytes = self.run_state.down_bytes(),
            "round complete"
        );

        Ok(RoundReport {
            receivers,
            unresolved,
            senders,
            reciprocated,
        })
    }

    /// Runs `num_repetitions` rounds against the sampled targets, resetting the run state before each one.
    pub fn run_experiment(&mut self) -> Result<Vec<Repetition>, MutualPIRError> {
        let targets = self.targets.clone();
        let mut repetitions = Vec::with_capacity(self.config.num_repetitions);

        for repetition in 0..self.config.num_repetitions {
            self.run_state = RunState::default();
            let report = self.run_round(&targets)?;

            tracing::info!(
                identity = self.identity,
                repetition,
                latency_ms = self.run_state.latency().as_millis() as u64,
                up_bytes = self.run_state.up_bytes(),
                down_bytes = self.run_state.down_bytes(),
                "repetition complete"
            );
            repetitions.push(Repetition {
                report,
                run_state: self.run_state.clone(),
            });
        }

        Ok(repetitions)
    }

    /// Looks up every contact's three candidate keyword slots, padding to `rate_send` contacts with our own keyword.
    fn send_pir(&mut self, contacts: &[Vec<u8>]) -> Result<(Vec<usize>, Vec<Vec<u8>>), MutualPIRError> {
        let rate = self.config.rate_send;
        if contacts.len() > rate {
            tracing::debug!(contacts = contacts.len(), rate, "dropping contacts beyond send rate");
        }
        let contacts = &contacts[..contacts.len().min(rate)];

        let querier = PirQuerier::new(self.keyword_params.n_rows as usize);
        let num_queries = rate * ARITY as usize;

        // (contact position, keyword slot), dummies have no position
        let mut planned = Vec::with_capacity(num_queries);
        let mut batches = vec![QueryBatch { keys: Vec::with_capacity(num_queries) }; NUM_SERVERS];

        for position in 0..rate {
            let contact = contacts.get(position);
            let keyword = contact.map(Vec::as_slice).unwrap_or(self.keyword.as_slice());

            for slot in self.keyword_params.filter.get_indices(keyword) {
                let (left, right) = querier.query(slot, &mut self.rng)?;
                batches[0].keys.push(left);
                batches[1].keys.push(right);
                planned.push((contact.map(|_| position), slot));
            }
        }

        let timeout = self.config.rpc_timeout();
        let started = Instant::now();
        let answers = fan_out(&self.servers, |idx, server| server.make_kw_queries(&batches[idx], deadline_after(timeout)))?;
        let latency = started.elapsed();
        self.run_state.record(Phase::SendPir, encoded_len(&batches)?, encoded_len(&answers)?, latency);
        check_answer_count(&answers, planned.len())?;

        let mut resolved = vec![false; contacts.len()];
        let mut receivers = BTreeSet::new();

        for (query, &(position, slot)) in planned.iter().enumerate() {
            if position.is_none() && !self.keyword_params.auth {
                continue;
            }

            let row = pir::reconstruct(&answers[0].answers[query], &answers[1].answers[query])?;
            let fields = self
                .keyword_params
                .open_row(&row, slot)
                .inspect_err(|err| tracing::warn!(slot, error = %err, "keyword row failed verification"))?;

            let Some(position) = position else {
                continue;
            };
            if !resolved[position] && fields.key == contacts[position].as_slice() {
                resolved[position] = true;
                if let Some(back_pointer) = fields.back_pointer {
                    receivers.insert(back_pointer as usize);
                }
            }
        }

        receivers.remove(&self.identity);
        let unresolved = contacts
            .iter()
            .zip(&resolved)
            .filter(|(_, resolved)| !**resolved)
            .map(|(contact, _)| contact.clone())
            .collect::<Vec<_>>();

        tracing::debug!(
            phase = Phase::SendPir.name(),
            queries = planned.len(),
            receivers = receivers.len(),
            unresolved = unresolved.len(),
            "keyword lookups reconstructed"
        );
        Ok((receivers.into_iter().collect(), unresolved))
    }

    /// Flags `identities` in our column, writing only those not flagged in the current session. Both shares are written
    /// even when there is nothing new to flag.
    fn notify(&mut self, phase: Phase, identities: &[usize]) -> Result<(), MutualPIRError> {
        let delta = identities.iter().copied().filter(|identity| !self.notified.contains(identity)).collect::<Vec<_>>();

        if self.write_column(phase, &delta)? {
            let missing = identities.iter().copied().filter(|identity| !self.notified.contains(identity)).collect::<Vec<_>>();
            if !missing.is_empty() {
                tracing::debug!(phase = phase.name(), flagged = missing.len(), "flagging again in new session");
                self.write_column(phase, &missing)?;
            }
        }

        Ok(())
    }

    /// Writes one column share per server, flagging `identities`. Returns whether the shares landed in freshly reset
    /// matrices.
    fn write_column(&mut self, phase: Phase, identities: &[usize]) -> Result<bool, MutualPIRError> {
        let vector = pack_indices(identities.iter().copied(), self.matrix_size())?;
        let updates = share(&vector, NUM_SERVERS, &mut self.rng)?
            .into_iter()
            .map(|share| ColumnUpdate {
                identity: self.identity as u32,
                share,
            })
            .collect::<Vec<_>>();

        // Column writes XOR into the matrix, so they are never retried.
        let timeout = self.config.rpc_timeout();
        let started = Instant::now();
        let acks = fan_out(&self.servers, |idx, server| server.set_column(&updates[idx], deadline_after(timeout)))?;
        let latency = started.elapsed();
        self.run_state.record(phase, encoded_len(&updates)?, encoded_len(&acks)?, latency);

        let replaced = self.observe_epochs(acks.iter().map(|ack| ack.epoch).collect())?;
        self.notified.extend(identities.iter().copied());

        tracing::debug!(phase = phase.name(), flagged = identities.len(), "column written");
        Ok(replaced)
    }

    /// Takes note of the session epochs reported by the servers. A new epoch means that server discarded its matrix,
    /// and our flags with it. Returns whether every server did so, while a reset of only some servers leaves shares
    /// which no longer combine.
    fn observe_epochs(&mut self, epochs: Vec<u64>) -> Result<bool, MutualPIRError> {
        let replaced = epochs.iter().zip(&self.epochs).filter(|(now, seen)| now != seen).count();
        self.epochs = epochs;
        if replaced == 0 {
            return Ok(false);
        }

        self.notified.clear();
        if branch_opt_util::unlikely(replaced != NUM_SERVERS) {
            return Err(MutualPIRError::ServerMismatch("session epoch"));
        }

        tracing::info!(identity = self.identity, epochs = ?self.epochs, "servers started new sessions");
        Ok(true)
    }

    /// Reads and combines our row, returning the identities which flagged us.
    fn get_notified(&mut self, phase: Phase) -> Result<Vec<usize>, MutualPIRError> {
        let request = RowRequest {
            identity: self.identity as u32,
        };

        let started = Instant::now();
        let shares = fan_out(&self.servers, |_, server| self.get_row_with_retry(server, &request))?;
        let latency = started.elapsed();
        self.run_state.record(phase, encoded_len(&[request; NUM_SERVERS])?, encoded_len(&shares)?, latency);

        let share_len = self.matrix_size().div_ceil(8);
        if let Some(bad) = shares.iter().find(|row| row.share.len() != share_len) {
            return Err(MutualPIRError::InvalidShareLength {
                expected: share_len,
                actual: bad.share.len(),
            });
        }

        self.observe_epochs(shares.iter().map(|row| row.epoch).collect())?;
        let row = combine(&shares.iter().map(|row| row.share.as_slice()).collect::<Vec<_>>())?;
        let flagged_by = unpack_indices(&row, self.matrix_size());

        tracing::debug!(phase = phase.name(), flagged_by = flagged_by.len(), "row read");
        Ok(flagged_by)
    }

    fn get_row_with_retry(&self, server: &dyn ContactServer, request: &RowRequest) -> Result<RowShare, MutualPIRError> {
        let policy = &self.config.retry;
        let mut attempt = 0;

        loop {
            match server.get_row(request, deadline_after(self.config.rpc_timeout())) {
                Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                    let backoff = policy.backoff(attempt);
                    tracing::warn!(attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "retrying row read");

                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Retrieves the senders' index rows, padding to `rate_recv` queries with our own identity.
    fn recv_pir(&mut self, senders: &[usize]) -> Result<Vec<usize>, MutualPIRError> {
        let rate = self.config.rate_recv;
        if senders.len() > rate {
            tracing::debug!(senders = senders.len(), rate, "dropping senders beyond receive rate");
        }
        let senders = &senders[..senders.len().min(rate)];

        let querier = PirQuerier::new(self.matrix_size());

        // (is a real sender, index row)
        let mut planned = Vec::with_capacity(rate);
        let mut batches = vec![QueryBatch { keys: Vec::with_capacity(rate) }; NUM_SERVERS];

        for position in 0..rate {
            let sender = senders.get(position).copied();
            let index = sender.unwrap_or(self.identity);

            let (left, right) = querier.query(index, &mut self.rng)?;
            batches[0].keys.push(left);
            batches[1].keys.push(right);
            planned.push((sender.is_some(), index));
        }

        let timeout = self.config.rpc_timeout();
        let started = Instant::now();
        let answers = fan_out(&self.servers, |idx, server| server.make_i_queries(&batches[idx], deadline_after(timeout)))?;
        let latency = started.elapsed();
        self.run_state.record(Phase::RecvPir, encoded_len(&batches)?, encoded_len(&answers)?, latency);
        check_answer_count(&answers, planned.len())?;

        let mut retrieved = Vec::with_capacity(senders.len());
        for (query, &(real, index)) in planned.iter().enumerate() {
            if !real && !self.index_params.auth {
                continue;
            }

            let row = pir::reconstruct(&answers[0].answers[query], &answers[1].answers[query])?;
            self.index_params
                .open_row(&row, index)
                .inspect_err(|err| tracing::warn!(index, error = %err, "index row failed verification"))?;

            if real {
                retrieved.push(index);
            }
        }

        tracing::debug!(
            phase = Phase::RecvPir.name(),
            queries = planned.len(),
            retrieved = retrieved.len(),
            "sender records reconstructed"
        );
        Ok(retrieved)
    }
}
