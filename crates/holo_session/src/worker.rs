//! Interactive driver for the backend's one-shot read/write callback.
//!
//! The backend only offers "run this callback inside a transaction, then
//! commit". A [`TransactionWorker`] owns one dedicated thread that enters that
//! callback and then serves requests from the caller over an ordered channel:
//! queries are executed in submission order, idle periods are bridged with
//! keep-alive queries, and a final commit or rollback request ends the
//! callback. Mutations are buffered locally and handed to the backend only when
//! the commit request arrives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::backend::{DatabaseClient, QueryStatement, ResultSet, Timestamp, TransactionContext};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::mutation::Mutation;

/// Process-wide source of attempt ids.
static NEXT_ATTEMPT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one read/write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    Success,
    Fail,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }
}

/// Cooperative cancellation flag for callers blocked on the worker.
///
/// Interrupting never kills the backend attempt; it only releases the waiting
/// caller with [`SessionError::Interrupted`].
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Consumes a pending interrupt.
    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

/// Requests served by the worker thread, in submission order.
enum WorkerRequest {
    Query { seq: u64, statement: QueryStatement },
    Commit,
    Rollback,
}

/// Terminal request already consumed by the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Commit,
    Rollback,
}

/// Marker returned from the callback to make the backend roll back.
#[derive(Debug, thiserror::Error)]
#[error("transaction rolled back by caller")]
struct RollbackRequested;

#[derive(Debug)]
struct Completion {
    state: WorkerState,
    commit_timestamp: Option<Timestamp>,
    error: Option<anyhow::Error>,
}

struct WorkerShared {
    completion: Mutex<Completion>,
    finished: Condvar,
    log: Mutex<Vec<Mutation>>,
}

type QueryReply = (u64, anyhow::Result<ResultSet>);

/// One read/write transaction attempt driven from a dedicated thread.
pub struct TransactionWorker {
    attempt_id: u64,
    requests: mpsc::Sender<WorkerRequest>,
    replies: mpsc::Receiver<QueryReply>,
    shared: Arc<WorkerShared>,
    interrupt: InterruptHandle,
    wait_poll_interval: Duration,
    next_seq: u64,
    terminal_sent: bool,
}

impl TransactionWorker {
    /// Spawns the worker thread and enters the backend callback.
    pub fn start(
        client: Arc<dyn DatabaseClient>,
        config: &SessionConfig,
        interrupt: InterruptHandle,
    ) -> SessionResult<Self> {
        let attempt_id = NEXT_ATTEMPT_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(WorkerShared {
            completion: Mutex::new(Completion {
                state: WorkerState::NotStarted,
                commit_timestamp: None,
                error: None,
            }),
            finished: Condvar::new(),
            log: Mutex::new(Vec::new()),
        });
        let (request_tx, request_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();

        let worker_shared = shared.clone();
        let keep_alive = KeepAlive {
            interval: config.keep_alive_interval,
            statement: QueryStatement::new(config.keep_alive_sql.clone()),
        };
        thread::Builder::new()
            .name(format!("holo-session-txn-{attempt_id}"))
            .spawn(move || {
                run_attempt(
                    attempt_id,
                    client,
                    worker_shared,
                    request_rx,
                    reply_tx,
                    keep_alive,
                )
            })
            .map_err(|err| {
                SessionError::Worker(format!("spawn transaction worker thread: {err}"))
            })?;

        debug!(attempt_id, "started read/write transaction worker");
        Ok(Self {
            attempt_id,
            requests: request_tx,
            replies: reply_rx,
            shared,
            interrupt,
            wait_poll_interval: config.wait_poll_interval,
            next_seq: 0,
            terminal_sent: false,
        })
    }

    pub fn attempt_id(&self) -> u64 {
        self.attempt_id
    }

    pub fn state(&self) -> WorkerState {
        self.shared
            .completion
            .lock()
            .map(|completion| completion.state)
            .unwrap_or(WorkerState::Fail)
    }

    /// Executes `statement` inside the transaction and waits for its rows.
    pub fn execute_query(&mut self, statement: &QueryStatement) -> SessionResult<ResultSet> {
        self.ensure_open("query")?;
        self.next_seq += 1;
        let seq = self.next_seq;
        self.requests
            .send(WorkerRequest::Query {
                seq,
                statement: statement.clone(),
            })
            .map_err(|_| self.worker_gone("query"))?;

        loop {
            match self.replies.recv_timeout(self.wait_poll_interval) {
                // Replies to queries abandoned by an earlier interrupt are dropped.
                Ok((reply_seq, _)) if reply_seq != seq => continue,
                Ok((_, result)) => {
                    return result.map_err(|err| SessionError::backend("query", err));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.interrupt.take() {
                        return Err(SessionError::Interrupted { operation: "query" });
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(self.worker_gone("query"));
                }
            }
        }
    }

    /// Appends one mutation to the log without contacting the backend.
    pub fn buffer(&self, mutation: Mutation) -> SessionResult<()> {
        self.ensure_open("buffer")?;
        self.lock_log()?.push(mutation);
        Ok(())
    }

    pub fn buffer_all(&self, mutations: Vec<Mutation>) -> SessionResult<()> {
        self.ensure_open("buffer")?;
        self.lock_log()?.extend(mutations);
        Ok(())
    }

    pub fn mutation_log_len(&self) -> SessionResult<usize> {
        Ok(self.lock_log()?.len())
    }

    /// Truncates the log to `len` entries; the only permitted history rewrite.
    pub fn truncate_mutation_log(&self, len: usize) -> SessionResult<()> {
        let mut log = self.lock_log()?;
        if len > log.len() {
            return Err(SessionError::Worker(format!(
                "cannot truncate mutation log of {} entries to {len}",
                log.len()
            )));
        }
        log.truncate(len);
        Ok(())
    }

    pub fn buffered_mutations(&self) -> SessionResult<Vec<Mutation>> {
        Ok(self.lock_log()?.clone())
    }

    /// Commits the buffered mutations and returns the commit timestamp.
    pub fn commit(&mut self) -> SessionResult<Timestamp> {
        self.send_terminal(WorkerRequest::Commit, "commit")?;
        let completion = self.wait_for_completion("commit")?;
        match completion.state {
            WorkerState::Success => completion.commit_timestamp.ok_or_else(|| {
                SessionError::Worker("commit succeeded without a timestamp".to_string())
            }),
            _ => Err(SessionError::backend(
                "commit",
                completion
                    .error
                    .unwrap_or_else(|| anyhow!("transaction attempt failed")),
            )),
        }
    }

    /// Rolls back the attempt; buffered mutations are discarded.
    pub fn rollback(&mut self) -> SessionResult<()> {
        self.send_terminal(WorkerRequest::Rollback, "rollback")?;
        let completion = self.wait_for_completion("rollback")?;
        match completion.error {
            Some(err) if err.downcast_ref::<RollbackRequested>().is_none() => {
                Err(SessionError::backend("rollback", err))
            }
            _ => Ok(()),
        }
    }

    fn ensure_open(&self, operation: &str) -> SessionResult<()> {
        if self.terminal_sent {
            return Err(SessionError::Worker(format!(
                "{operation} after the transaction already finished"
            )));
        }
        Ok(())
    }

    fn send_terminal(&mut self, request: WorkerRequest, operation: &str) -> SessionResult<()> {
        self.ensure_open(operation)?;
        self.terminal_sent = true;
        // A closed channel means the callback already ended on its own; the
        // recorded completion still tells the caller what happened.
        let _ = self.requests.send(request);
        Ok(())
    }

    fn wait_for_completion(&self, operation: &'static str) -> SessionResult<Completion> {
        let mut completion = self
            .shared
            .completion
            .lock()
            .map_err(|_| SessionError::Worker("completion lock poisoned".to_string()))?;
        loop {
            if completion.state.is_terminal() {
                return Ok(Completion {
                    state: completion.state,
                    commit_timestamp: completion.commit_timestamp,
                    error: completion.error.take(),
                });
            }
            if self.interrupt.take() {
                return Err(SessionError::Interrupted { operation });
            }
            let (guard, _) = self
                .shared
                .finished
                .wait_timeout(completion, self.wait_poll_interval)
                .map_err(|_| SessionError::Worker("completion lock poisoned".to_string()))?;
            completion = guard;
        }
    }

    fn worker_gone(&self, operation: &'static str) -> SessionError {
        let detail = self
            .shared
            .completion
            .lock()
            .ok()
            .and_then(|completion| completion.error.as_ref().map(|err| format!("{err:#}")))
            .unwrap_or_else(|| "worker thread exited".to_string());
        SessionError::backend(operation, anyhow!("transaction attempt ended: {detail}"))
    }

    fn lock_log(&self) -> SessionResult<std::sync::MutexGuard<'_, Vec<Mutation>>> {
        self.shared
            .log
            .lock()
            .map_err(|_| SessionError::Worker("mutation log lock poisoned".to_string()))
    }
}

impl Drop for TransactionWorker {
    fn drop(&mut self) {
        if !self.terminal_sent {
            // The thread finishes the rollback on its own and is not joined.
            let _ = self.requests.send(WorkerRequest::Rollback);
        }
    }
}

struct KeepAlive {
    interval: Duration,
    statement: QueryStatement,
}

/// Body of the worker thread: one backend read/write transaction.
fn run_attempt(
    attempt_id: u64,
    client: Arc<dyn DatabaseClient>,
    shared: Arc<WorkerShared>,
    requests: mpsc::Receiver<WorkerRequest>,
    replies: mpsc::Sender<QueryReply>,
    keep_alive: KeepAlive,
) {
    if let Ok(mut completion) = shared.completion.lock() {
        completion.state = WorkerState::Running;
    }

    let mut terminal: Option<Terminal> = None;
    let mut invocations = 0u32;
    let mut work = |ctx: &mut dyn TransactionContext| -> anyhow::Result<()> {
        invocations += 1;
        if let Some(terminal) = terminal {
            // The backend retried after the caller already finished; replay
            // the final decision without waiting for new requests.
            debug!(attempt_id, invocations, "replaying terminal request on retry");
            return finish_callback(terminal, ctx, &shared);
        }
        loop {
            match requests.recv_timeout(keep_alive.interval) {
                Ok(WorkerRequest::Query { seq, statement }) => {
                    let result = ctx.execute_query(&statement);
                    if replies.send((seq, result)).is_err() {
                        terminal = Some(Terminal::Rollback);
                        return Err(RollbackRequested.into());
                    }
                }
                Ok(WorkerRequest::Commit) => {
                    terminal = Some(Terminal::Commit);
                    return finish_callback(Terminal::Commit, ctx, &shared);
                }
                Ok(WorkerRequest::Rollback) => {
                    terminal = Some(Terminal::Rollback);
                    return finish_callback(Terminal::Rollback, ctx, &shared);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Err(err) = ctx.execute_query(&keep_alive.statement) {
                        warn!(attempt_id, error = %err, "keep-alive query failed");
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    terminal = Some(Terminal::Rollback);
                    return Err(RollbackRequested.into());
                }
            }
        }
    };
    let outcome = client.read_write_transaction(&mut work);

    match shared.completion.lock() {
        Ok(mut completion) => {
            match outcome {
                Ok(timestamp) => {
                    debug!(attempt_id, %timestamp, "read/write transaction committed");
                    completion.state = WorkerState::Success;
                    completion.commit_timestamp = Some(timestamp);
                }
                Err(err) => {
                    debug!(attempt_id, error = %err, "read/write transaction ended without commit");
                    completion.state = WorkerState::Fail;
                    completion.error = Some(err);
                }
            }
            shared.finished.notify_all();
        }
        Err(_) => warn!(attempt_id, "completion lock poisoned; caller will not be notified"),
    }
}

fn finish_callback(
    terminal: Terminal,
    ctx: &mut dyn TransactionContext,
    shared: &WorkerShared,
) -> anyhow::Result<()> {
    match terminal {
        Terminal::Commit => {
            let mutations = shared
                .log
                .lock()
                .map_err(|_| anyhow!("mutation log lock poisoned"))?
                .clone();
            ctx.buffer(mutations);
            Ok(())
        }
        Terminal::Rollback => Err(RollbackRequested.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;
    use datafusion::common::ScalarValue;
    use std::time::Instant;

    fn config(keep_alive: Duration) -> SessionConfig {
        SessionConfig {
            keep_alive_interval: keep_alive,
            wait_poll_interval: Duration::from_millis(5),
            ..SessionConfig::default()
        }
    }

    fn start(db: &MemoryDatabase, config: &SessionConfig) -> TransactionWorker {
        TransactionWorker::start(Arc::new(db.clone()), config, InterruptHandle::new())
            .expect("start worker")
    }

    fn insert(id: i64) -> Mutation {
        Mutation::new_insert_builder("Singers")
            .set("SingerId", ScalarValue::Int64(Some(id)))
            .build()
    }

    fn rows(value: i64) -> ResultSet {
        ResultSet::new(
            vec!["v".to_string()],
            vec![vec![ScalarValue::Int64(Some(value))]],
        )
    }

    #[test]
    fn commit_flushes_the_log_and_records_success() -> SessionResult<()> {
        let db = MemoryDatabase::new();
        let mut worker = start(&db, &config(Duration::from_secs(5)));
        worker.buffer(insert(1))?;
        worker.buffer_all(vec![insert(2), insert(3)])?;
        assert_eq!(worker.mutation_log_len()?, 3);
        assert!(db.commits().is_empty());

        let timestamp = worker.commit()?;
        assert_eq!(worker.state(), WorkerState::Success);
        let commits = db.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].timestamp, timestamp);
        assert_eq!(commits[0].mutations.len(), 3);
        Ok(())
    }

    #[test]
    fn queries_execute_in_submission_order() -> SessionResult<()> {
        let db = MemoryDatabase::new();
        db.script_query("SELECT a FROM T", rows(1));
        db.script_query("SELECT b FROM T", rows(2));
        let mut worker = start(&db, &config(Duration::from_secs(5)));
        let first = worker.execute_query(&QueryStatement::new("SELECT a FROM T"))?;
        let second = worker.execute_query(&QueryStatement::new("SELECT b FROM T"))?;
        assert_eq!(first.first_value(), Some(&ScalarValue::Int64(Some(1))));
        assert_eq!(second.first_value(), Some(&ScalarValue::Int64(Some(2))));
        worker.rollback()?;

        let executed = db
            .executed_sql()
            .into_iter()
            .filter(|sql| sql != "SELECT 1")
            .collect::<Vec<_>>();
        assert_eq!(executed, vec!["SELECT a FROM T", "SELECT b FROM T"]);
        Ok(())
    }

    #[test]
    fn idle_worker_issues_keep_alive_queries() -> SessionResult<()> {
        let db = MemoryDatabase::new();
        let mut worker = start(&db, &config(Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(80));
        worker.rollback()?;
        assert!(db.executed_sql().iter().any(|sql| sql == "SELECT 1"));
        Ok(())
    }

    #[test]
    fn rollback_discards_the_log() -> SessionResult<()> {
        let db = MemoryDatabase::new();
        let mut worker = start(&db, &config(Duration::from_secs(5)));
        worker.buffer(insert(1))?;
        worker.rollback()?;
        assert_eq!(worker.state(), WorkerState::Fail);
        assert!(db.commits().is_empty());
        assert!(worker.buffer(insert(2)).is_err());
        Ok(())
    }

    #[test]
    fn retried_callback_replays_the_commit() -> SessionResult<()> {
        let db = MemoryDatabase::new();
        db.abort_next_commits(1);
        let mut worker = start(&db, &config(Duration::from_secs(5)));
        worker.buffer_all(vec![insert(1), insert(2)])?;
        worker.commit()?;
        assert_eq!(db.callback_invocations(), 2);
        assert_eq!(db.committed_mutations().len(), 2);
        Ok(())
    }

    #[test]
    fn truncation_only_shrinks_the_log() -> SessionResult<()> {
        let db = MemoryDatabase::new();
        let mut worker = start(&db, &config(Duration::from_secs(5)));
        worker.buffer_all((0..5).map(insert).collect())?;
        worker.truncate_mutation_log(2)?;
        assert_eq!(worker.buffered_mutations()?, vec![insert(0), insert(1)]);
        assert!(worker.truncate_mutation_log(3).is_err());
        worker.rollback()?;
        Ok(())
    }

    #[test]
    fn interrupt_releases_a_blocked_query() -> SessionResult<()> {
        let db = MemoryDatabase::new();
        db.script_query("SELECT v FROM Slow", rows(7));
        db.set_query_delay(Some(Duration::from_millis(300)));
        let interrupt = InterruptHandle::new();
        let mut worker = TransactionWorker::start(
            Arc::new(db.clone()),
            &config(Duration::from_secs(5)),
            interrupt.clone(),
        )?;

        let trigger = interrupt.clone();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            trigger.interrupt();
        });
        let started = Instant::now();
        let err = worker
            .execute_query(&QueryStatement::new("SELECT v FROM Slow"))
            .unwrap_err();
        waker.join().expect("join waker");
        assert!(matches!(err, SessionError::Interrupted { operation: "query" }));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!interrupt.is_interrupted(), "the wait consumes the interrupt");

        // The abandoned reply is skipped; the next query gets its own rows.
        db.set_query_delay(None);
        let rows = worker.execute_query(&QueryStatement::new("SELECT v FROM Slow"))?;
        assert_eq!(rows.first_value(), Some(&ScalarValue::Int64(Some(7))));
        worker.rollback()?;
        Ok(())
    }

    /// Worker busy in a slow keep-alive query when the caller finishes.
    fn busy_worker(
        db: &MemoryDatabase,
        interrupt: &InterruptHandle,
    ) -> SessionResult<TransactionWorker> {
        db.set_query_delay(Some(Duration::from_millis(300)));
        let worker = TransactionWorker::start(
            Arc::new(db.clone()),
            &config(Duration::from_millis(10)),
            interrupt.clone(),
        )?;
        thread::sleep(Duration::from_millis(40));
        Ok(worker)
    }

    fn wait_for_terminal(worker: &TransactionWorker) -> WorkerState {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.state().is_terminal() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        worker.state()
    }

    #[test]
    fn interrupted_commit_returns_while_the_attempt_finishes() -> SessionResult<()> {
        let db = MemoryDatabase::new();
        let interrupt = InterruptHandle::new();
        let mut worker = busy_worker(&db, &interrupt)?;
        worker.buffer(insert(1))?;

        interrupt.interrupt();
        let started = Instant::now();
        let err = worker.commit().unwrap_err();
        assert!(matches!(err, SessionError::Interrupted { operation: "commit" }));
        assert!(started.elapsed() < Duration::from_millis(250));

        // The attempt is not killed; the commit request still lands.
        assert_eq!(wait_for_terminal(&worker), WorkerState::Success);
        assert_eq!(db.committed_mutations(), vec![insert(1)]);
        assert!(worker.buffer(insert(2)).is_err());
        Ok(())
    }

    #[test]
    fn interrupted_rollback_returns_while_the_attempt_finishes() -> SessionResult<()> {
        let db = MemoryDatabase::new();
        let interrupt = InterruptHandle::new();
        let mut worker = busy_worker(&db, &interrupt)?;
        worker.buffer(insert(1))?;

        interrupt.interrupt();
        let started = Instant::now();
        let err = worker.rollback().unwrap_err();
        assert!(matches!(err, SessionError::Interrupted { operation: "rollback" }));
        assert!(started.elapsed() < Duration::from_millis(250));

        assert_eq!(wait_for_terminal(&worker), WorkerState::Fail);
        assert!(db.commits().is_empty());
        Ok(())
    }
}
