//! Job / Test Manager (spec §4.F): the central ledger of jobs, tests,
//! resolved files and de-duplication state.
//!
//! Grounded on the teacher's per-unit `Arc<Mutex<..>>` ownership style; one
//! lock per job guards that job's test table and resolve cache, matching
//! spec §5: "Job record map: concurrent map, keyed by jobId; job-internal
//! state guarded by a per-job intrinsic lock."

use crate::errors::JobManagerError;
use crate::test_runner::{FailureCause, TestRunner};
use camino::Utf8PathBuf;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use labrun_metadata::{JobId, JobLocator, PropertyBag, TestId, TestLocator, TestResult, TestStatus};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{instrument, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Directories owned by a job. `gen` is optional because gen-file expiry
/// policy (spec §4.F step 4) may leave it for a later sweeper.
#[derive(Clone, Debug)]
pub struct JobDirs {
    pub run: Utf8PathBuf,
    pub tmp: Utf8PathBuf,
    pub gen: Option<Utf8PathBuf>,
}

#[derive(Clone, Debug)]
pub struct JobExecutionUnit {
    pub id: JobId,
    pub locator: JobLocator,
    pub dirs: JobDirs,
    pub disable_master_syncing: bool,
}

/// The ledger record for one attempt (spec §3 `TestExecutionUnit`).
/// `status`/`result` transitions and `properties` mutation are the retry
/// engine's (spec §4.I) and launcher's (spec §4.H) primary interface into
/// the job manager.
#[derive(Clone, Debug)]
pub struct TestExecutionUnit {
    pub id: TestId,
    pub name: String,
    pub job_id: JobId,
    pub locator: TestLocator,
    pub properties: PropertyBag,
    pub status: TestStatus,
    pub result: TestResult,
    pub result_cause: Option<FailureCause>,
    /// Wall-clock duration of the attempt, once it has ended; used by the
    /// retry engine's infra-issue extra-retry time budget (spec §4.I step 5).
    pub duration: Option<std::time::Duration>,
}

impl TestExecutionUnit {
    pub fn new(job_id: JobId, name: impl Into<String>) -> Self {
        let name = name.into();
        let test_id = TestId::new_v4();
        Self {
            id: test_id,
            locator: TestLocator {
                job_id,
                test_id,
                name: name.clone(),
            },
            name,
            job_id,
            properties: PropertyBag::new(),
            status: TestStatus::New,
            result: TestResult::Unknown,
            result_cause: None,
            duration: None,
        }
    }
}

/// A file broadcast to tests of a job, or addressed to a single test. The
/// full value is the de-dup key per spec invariant 7 and §4.F.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct JobFileUnit {
    pub tag: String,
    pub local_path: Utf8PathBuf,
    pub original_path: Utf8PathBuf,
    pub checksum: String,
}

/// A `(tag, path)` pair identifying an input to fetch via the file resolver
/// chain (spec GLOSSARY); cached once per job.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ResolveSource {
    pub tag: String,
    pub path: String,
}

/// Lightweight, `Clone`-able error payload for the resolve cache: the
/// concrete resolver chain (spec §4.K) owns the real error taxonomy, this is
/// just what gets broadcast through the `Shared` future.
#[derive(Clone, Debug)]
pub struct ResolveErr(pub Arc<str>);

impl std::fmt::Display for ResolveErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub type ResolveFuture = Shared<BoxFuture<'static, Result<Utf8PathBuf, ResolveErr>>>;

/// Per-test bookkeeping: the ledger entry plus (once the launcher has
/// constructed one) the runner that executes it, plus per-test file-notify
/// de-dup state.
struct TestLabExecutionUnit {
    unit: TestExecutionUnit,
    runner: Option<Arc<dyn TestRunner>>,
    client_post_run_done: bool,
    notified_test_files: HashSet<JobFileUnit>,
}

struct LabJobState {
    tests: HashMap<TestId, TestLabExecutionUnit>,
    copied_files: HashSet<Utf8PathBuf>,
    broadcast_job_files: HashSet<JobFileUnit>,
    resolve_cache: HashMap<ResolveSource, ResolveFuture>,
    closed: bool,
}

struct JobRecord {
    unit: JobExecutionUnit,
    state: Mutex<LabJobState>,
}

/// The central ledger. One instance per lab.
#[derive(Default)]
pub struct JobManager {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert: returns the existing unit if one is already
    /// recorded for this job id.
    pub fn add_job_if_absent(
        &self,
        locator: JobLocator,
        dirs: JobDirs,
        disable_master_syncing: bool,
    ) -> JobExecutionUnit {
        let mut jobs = self.jobs.lock().expect("job map lock poisoned");
        if let Some(existing) = jobs.get(&locator.id) {
            return existing.unit.clone();
        }
        let unit = JobExecutionUnit {
            id: locator.id,
            locator,
            dirs,
            disable_master_syncing,
        };
        jobs.insert(
            unit.id,
            JobRecord {
                unit: unit.clone(),
                state: Mutex::new(LabJobState {
                    tests: HashMap::new(),
                    copied_files: HashSet::new(),
                    broadcast_job_files: HashSet::new(),
                    resolve_cache: HashMap::new(),
                    closed: false,
                }),
            },
        );
        unit
    }

    /// Adds a brand-new ledger entry (spec §4.I "add a new attempt"). No
    /// runner is attached yet; the caller (the launcher) attaches one via
    /// [`Self::attach_runner`] once it has built one. Fails if the test name
    /// is already present under this id (should not happen: ids are fresh).
    pub fn add_test_execution_unit(
        &self,
        job_id: JobId,
        unit: TestExecutionUnit,
    ) -> Result<(), JobManagerError> {
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| JobManagerError::JobNotFound(job_locator_stub(job_id)))?;
        let mut state = record.state.lock().expect("job state lock poisoned");
        if state.tests.contains_key(&unit.id) {
            return Err(JobManagerError::TestAlreadyExists(unit.locator.clone()));
        }
        state.tests.insert(
            unit.id,
            TestLabExecutionUnit {
                unit,
                runner: None,
                client_post_run_done: false,
                notified_test_files: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Attaches a runner to an already-ledgered test and broadcasts
    /// previously-known job-files to it (spec §4.F `addTestIfAbsent`).
    pub fn attach_runner(
        &self,
        job_id: JobId,
        test_id: TestId,
        runner: Arc<dyn TestRunner>,
    ) -> Result<(), JobManagerError> {
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| JobManagerError::JobNotFound(job_locator_stub(job_id)))?;
        let mut state = record.state.lock().expect("job state lock poisoned");
        let known_files: Vec<JobFileUnit> = state.broadcast_job_files.iter().cloned().collect();
        let test = state
            .tests
            .get_mut(&test_id)
            .ok_or_else(|| JobManagerError::TestNotFound(test_locator_stub(job_id, test_id)))?;
        test.runner = Some(runner.clone());
        drop(state);
        for file in &known_files {
            runner.notify_job_file(file);
        }
        Ok(())
    }

    /// Convenience used by callers that don't pre-stage a ledger entry:
    /// builds one from the runner's own locator, inserts it, and attaches
    /// the runner in one step. Idempotent if already attached.
    pub fn add_test_if_absent(
        &self,
        job_id: JobId,
        runner: Arc<dyn TestRunner>,
    ) -> Result<(), JobManagerError> {
        let test_id = runner.test_execution_unit().test_id;
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| JobManagerError::JobNotFound(job_locator_stub(job_id)))?;
        let already_present = record
            .state
            .lock()
            .expect("job state lock poisoned")
            .tests
            .contains_key(&test_id);
        drop(jobs);
        if already_present {
            return Ok(());
        }
        let unit = TestExecutionUnit {
            id: test_id,
            name: runner.test_execution_unit().name.clone(),
            job_id,
            locator: runner.test_execution_unit().clone(),
            properties: PropertyBag::new(),
            status: TestStatus::New,
            result: TestResult::Unknown,
            result_cause: None,
            duration: None,
        };
        self.add_test_execution_unit(job_id, unit)?;
        self.attach_runner(job_id, test_id, runner)
    }

    /// Reads a clone of the current ledger entry.
    pub fn test_execution_unit(
        &self,
        job_id: JobId,
        test_id: TestId,
    ) -> Result<TestExecutionUnit, JobManagerError> {
        self.with_test(job_id, test_id, |test| test.unit.clone())
    }

    /// Applies `f` to the ledger entry under the job's lock, returning
    /// whatever `f` returns. Used by the retry engine (spec §4.I) to mutate
    /// properties/status/result/cause.
    pub fn update_test_execution_unit<T>(
        &self,
        job_id: JobId,
        test_id: TestId,
        f: impl FnOnce(&mut TestExecutionUnit) -> T,
    ) -> Result<T, JobManagerError> {
        self.with_test_mut(job_id, test_id, |test| f(&mut test.unit))
    }

    /// All ledger entries for a job sharing the same `(name, repeat_index)`
    /// family, in the order they were inserted. Used by the retry engine to
    /// count valid attempts and find the foregoing test.
    pub fn tests_of_job(&self, job_id: JobId) -> Result<Vec<TestExecutionUnit>, JobManagerError> {
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| JobManagerError::JobNotFound(job_locator_stub(job_id)))?;
        let state = record.state.lock().expect("job state lock poisoned");
        Ok(state.tests.values().map(|t| t.unit.clone()).collect())
    }

    /// Once-only `NEW -> ... -> DONE` transition marker for `closeTest`
    /// (spec §6: "the one-way signal setting `clientPostRunDone=true`").
    pub fn mark_test_client_post_run_done(
        &self,
        job_id: JobId,
        test_id: TestId,
    ) -> Result<(), JobManagerError> {
        self.with_test_mut(job_id, test_id, |test| {
            test.client_post_run_done = true;
        })
    }

    pub fn mark_job_copy_file(&self, job_id: JobId, path: Utf8PathBuf) -> Result<(), JobManagerError> {
        self.with_job_state(job_id, |state| {
            state.copied_files.insert(path);
        })
    }

    pub fn is_job_file_copied(&self, job_id: JobId, path: &Utf8PathBuf) -> Result<bool, JobManagerError> {
        self.with_job_state(job_id, |state| state.copied_files.contains(path))
    }

    /// Broadcasts `file` to every test of the job, de-duplicated on the full
    /// value (spec invariant 7).
    pub fn notify_job_file(&self, job_id: JobId, file: JobFileUnit) -> Result<(), JobManagerError> {
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| JobManagerError::JobNotFound(job_locator_stub(job_id)))?;
        let mut state = record.state.lock().expect("job state lock poisoned");
        if !state.broadcast_job_files.insert(file.clone()) {
            return Ok(());
        }
        let runners: Vec<_> = state.tests.values().filter_map(|t| t.runner.clone()).collect();
        drop(state);
        for runner in runners {
            runner.notify_job_file(&file);
        }
        Ok(())
    }

    /// Sends `file` to the single addressed test, de-duplicated per test.
    pub fn notify_test_file(
        &self,
        job_id: JobId,
        test_id: TestId,
        file: JobFileUnit,
    ) -> Result<(), JobManagerError> {
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| JobManagerError::JobNotFound(job_locator_stub(job_id)))?;
        let mut state = record.state.lock().expect("job state lock poisoned");
        let test = state
            .tests
            .get_mut(&test_id)
            .ok_or_else(|| JobManagerError::TestNotFound(test_locator_stub(job_id, test_id)))?;
        if !test.notified_test_files.insert(file.clone()) {
            return Ok(());
        }
        let runner = test.runner.clone();
        drop(state);
        if let Some(runner) = runner {
            runner.notify_test_file(&file);
        }
        Ok(())
    }

    /// Per `ResolveSource`, returns the existing cached future or computes
    /// once via `resolve_fn` and caches it in the job. On success, the
    /// resolve also broadcasts one [`JobFileUnit`] via [`Self::notify_job_file`]
    /// (spec §4.F: "on success, emit one `JobFileUnit` per resolved path");
    /// this happens exactly once per source regardless of how many callers
    /// await the returned (`Shared`) future. Fails if the job is closed.
    ///
    /// Takes `self` as `&Arc<Self>` (the same shape as
    /// [`crate::file_resolver::FileResolverChain::as_resolve_fn`]) so the
    /// notify side-effect can run from inside the cached future itself,
    /// whenever it's eventually polled to completion.
    #[instrument(level = "debug", skip(self, resolve_fn))]
    pub fn start_resolve_job_files<F>(
        self: &Arc<Self>,
        job_id: JobId,
        sources: Vec<ResolveSource>,
        resolve_fn: F,
    ) -> Result<Vec<ResolveFuture>, JobManagerError>
    where
        F: Fn(ResolveSource) -> BoxFuture<'static, Result<Utf8PathBuf, ResolveErr>>
            + Send
            + Sync
            + Clone
            + 'static,
    {
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| JobManagerError::JobNotFound(job_locator_stub(job_id)))?;
        let mut state = record.state.lock().expect("job state lock poisoned");
        if state.closed {
            return Err(JobManagerError::JobClosed(record.unit.locator.clone()));
        }
        let mut futures = Vec::with_capacity(sources.len());
        for source in sources {
            let future = state
                .resolve_cache
                .entry(source.clone())
                .or_insert_with(|| {
                    let resolve_fn = resolve_fn.clone();
                    let manager = self.clone();
                    let source = source.clone();
                    async move {
                        let result = (resolve_fn)(source.clone()).await;
                        if let Ok(path) = &result {
                            let file = JobFileUnit {
                                tag: source.tag.clone(),
                                local_path: path.clone(),
                                original_path: Utf8PathBuf::from(source.path.as_str()),
                                checksum: checksum_file(path).await,
                            };
                            if let Err(error) = manager.notify_job_file(job_id, file) {
                                warn!(%error, job = %job_id, "failed to broadcast resolved job file");
                            }
                        }
                        result
                    }
                    .boxed()
                    .shared()
                })
                .clone();
            futures.push(future);
        }
        Ok(futures)
    }

    /// Cascades: kills every test of the job (preserving insertion order),
    /// closes it (cancelling pending resolves), removes it from the
    /// manager, then removes its directories.
    #[instrument(level = "debug", skip(self))]
    pub async fn remove_job(&self, job_id: JobId) -> Result<(), JobManagerError> {
        let (unit, runners) = {
            let mut jobs = self.jobs.lock().expect("job map lock poisoned");
            let record = jobs
                .remove(&job_id)
                .ok_or_else(|| JobManagerError::JobNotFound(job_locator_stub(job_id)))?;
            let mut state = record.state.lock().expect("job state lock poisoned");
            state.closed = true;
            // Cancelling pending resolve futures with "interrupt" is
            // approximated by dropping our references to them: work already
            // spawned keeps running to completion but nothing further
            // awaits it through this job.
            state.resolve_cache.clear();
            let runners: Vec<_> = state.tests.values().filter_map(|t| t.runner.clone()).collect();
            (record.unit, runners)
        };

        for runner in runners {
            runner.kill(std::time::Duration::from_secs(0));
        }

        if let Some(gen_dir) = &unit.dirs.gen {
            // Gen-file expiry policy (when to leave this for a later
            // sweeper instead) is a config concern out of scope here; this
            // implementation always removes it.
            remove_dir_best_effort(gen_dir).await;
        }
        remove_dir_best_effort(&unit.dirs.tmp).await;
        remove_dir_best_effort(&unit.dirs.run).await;

        Ok(())
    }

    fn with_job_state<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut LabJobState) -> T,
    ) -> Result<T, JobManagerError> {
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| JobManagerError::JobNotFound(job_locator_stub(job_id)))?;
        let mut state = record.state.lock().expect("job state lock poisoned");
        Ok(f(&mut state))
    }

    fn with_test<T>(
        &self,
        job_id: JobId,
        test_id: TestId,
        f: impl FnOnce(&TestLabExecutionUnit) -> T,
    ) -> Result<T, JobManagerError> {
        self.with_job_state(job_id, |state| {
            state
                .tests
                .get(&test_id)
                .map(f)
                .ok_or_else(|| JobManagerError::TestNotFound(test_locator_stub(job_id, test_id)))
        })?
    }

    fn with_test_mut<T>(
        &self,
        job_id: JobId,
        test_id: TestId,
        f: impl FnOnce(&mut TestLabExecutionUnit) -> T,
    ) -> Result<T, JobManagerError> {
        self.with_job_state(job_id, |state| {
            state
                .tests
                .get_mut(&test_id)
                .map(f)
                .ok_or_else(|| JobManagerError::TestNotFound(test_locator_stub(job_id, test_id)))
        })?
    }
}

async fn remove_dir_best_effort(dir: &Utf8PathBuf) {
    if let Err(error) = tokio::fs::remove_dir_all(dir).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(%error, path = %dir, "failed to remove job directory");
        }
    }
}

fn job_locator_stub(job_id: JobId) -> JobLocator {
    JobLocator {
        id: job_id,
        name: String::new(),
    }
}

fn test_locator_stub(job_id: JobId, test_id: TestId) -> TestLocator {
    TestLocator {
        job_id,
        test_id,
        name: String::new(),
    }
}

/// Content checksum for a resolved job file's de-dup key (spec invariant 7).
/// Not cryptographic; xxh3 is the teacher's own choice for this kind of
/// content fingerprint. A read failure yields an empty checksum rather than
/// failing the resolve, since the path has already resolved successfully by
/// the time this runs.
async fn checksum_file(path: &Utf8PathBuf) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => format!("{:016x}", xxh3_64(&bytes)),
        Err(error) => {
            warn!(%error, path = %path, "failed to checksum resolved job file");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_runner::{Allocation, Role, TestExecutionResult};
    use std::sync::Mutex as StdMutex;

    struct FakeRunner {
        locator: TestLocator,
        allocation: Allocation,
        received_job_files: StdMutex<Vec<JobFileUnit>>,
        received_test_files: StdMutex<Vec<JobFileUnit>>,
    }

    impl TestRunner for FakeRunner {
        fn test_execution_unit(&self) -> &TestLocator {
            &self.locator
        }
        fn allocation(&self) -> &Allocation {
            &self.allocation
        }
        fn role(&self) -> Role {
            Role::Primary
        }
        fn start(&self) -> BoxFuture<'_, Result<TestExecutionResult, crate::errors::LauncherError>> {
            Box::pin(async { Ok(TestExecutionResult::pass()) })
        }
        fn kill(&self, _timeout: std::time::Duration) {}
        fn is_running(&self) -> bool {
            false
        }
        fn finalize_test(&self, _cause: FailureCause) {}
        fn notify_job_file(&self, file: &JobFileUnit) {
            self.received_job_files.lock().unwrap().push(file.clone());
        }
        fn notify_test_file(&self, file: &JobFileUnit) {
            self.received_test_files.lock().unwrap().push(file.clone());
        }
    }

    fn runner(job_id: JobId, test_id: TestId) -> Arc<FakeRunner> {
        Arc::new(FakeRunner {
            locator: TestLocator {
                job_id,
                test_id,
                name: "t".into(),
            },
            allocation: Allocation { devices: vec![] },
            received_job_files: StdMutex::new(Vec::new()),
            received_test_files: StdMutex::new(Vec::new()),
        })
    }

    fn file(tag: &str) -> JobFileUnit {
        JobFileUnit {
            tag: tag.into(),
            local_path: "/tmp/a".into(),
            original_path: "/orig/a".into(),
            checksum: "abc".into(),
        }
    }

    fn dirs(path: &str) -> JobDirs {
        JobDirs {
            run: path.into(),
            tmp: path.into(),
            gen: None,
        }
    }

    #[test]
    fn add_job_if_absent_is_idempotent() {
        let manager = JobManager::new();
        let job_id = JobId::new_v4();
        let locator = JobLocator {
            id: job_id,
            name: "j".into(),
        };
        let first = manager.add_job_if_absent(locator.clone(), dirs("/run"), false);
        let second = manager.add_job_if_absent(locator, dirs("/run"), false);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn notify_job_file_dedupes_and_broadcasts_to_new_tests() {
        let manager = JobManager::new();
        let job_id = JobId::new_v4();
        manager.add_job_if_absent(JobLocator { id: job_id, name: "j".into() }, dirs("/run"), false);
        let test_id = TestId::new_v4();
        let r = runner(job_id, test_id);
        manager.add_test_if_absent(job_id, r.clone()).unwrap();

        let f = file("apk");
        manager.notify_job_file(job_id, f.clone()).unwrap();
        manager.notify_job_file(job_id, f.clone()).unwrap();
        assert_eq!(r.received_job_files.lock().unwrap().len(), 1);

        // A test added afterwards gets the already-broadcast file once.
        let test_id2 = TestId::new_v4();
        let r2 = runner(job_id, test_id2);
        manager.add_test_if_absent(job_id, r2.clone()).unwrap();
        assert_eq!(r2.received_job_files.lock().unwrap().len(), 1);
    }

    #[test]
    fn notify_test_file_dedupes_per_test() {
        let manager = JobManager::new();
        let job_id = JobId::new_v4();
        manager.add_job_if_absent(JobLocator { id: job_id, name: "j".into() }, dirs("/run"), false);
        let test_id = TestId::new_v4();
        let r = runner(job_id, test_id);
        manager.add_test_if_absent(job_id, r.clone()).unwrap();

        let f = file("log");
        manager.notify_test_file(job_id, test_id, f.clone()).unwrap();
        manager.notify_test_file(job_id, test_id, f).unwrap();
        assert_eq!(r.received_test_files.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_job_kills_tests_and_rejects_twice() {
        let manager = JobManager::new();
        let job_id = JobId::new_v4();
        let tmp = std::env::temp_dir().join(format!("labrun-test-{job_id}"));
        let tmp: Utf8PathBuf = Utf8PathBuf::from_path_buf(tmp).unwrap();
        tokio::fs::create_dir_all(&tmp).await.unwrap();
        manager.add_job_if_absent(
            JobLocator { id: job_id, name: "j".into() },
            JobDirs { run: tmp.clone(), tmp: tmp.clone(), gen: None },
            false,
        );
        let test_id = TestId::new_v4();
        manager
            .add_test_if_absent(job_id, runner(job_id, test_id))
            .unwrap();

        manager.remove_job(job_id).await.unwrap();
        let err = manager.remove_job(job_id).await.unwrap_err();
        assert!(matches!(err, JobManagerError::JobNotFound(_)));
        assert!(!tmp.exists());
    }

    #[test]
    fn start_resolve_job_files_resolves_once_and_caches() {
        let manager = Arc::new(JobManager::new());
        let job_id = JobId::new_v4();
        manager.add_job_if_absent(JobLocator { id: job_id, name: "j".into() }, dirs("/run"), false);
        let source = ResolveSource {
            tag: "apk".into(),
            path: "gs://bucket/a".into(),
        };
        let resolved = manager
            .start_resolve_job_files(job_id, vec![source], |_s| {
                Box::pin(async { Ok(Utf8PathBuf::from("/resolved/a")) }) as BoxFuture<'static, _>
            })
            .unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[tokio::test]
    async fn start_resolve_job_files_broadcasts_resolved_file_to_attached_runner() {
        let manager = Arc::new(JobManager::new());
        let job_id = JobId::new_v4();
        manager.add_job_if_absent(JobLocator { id: job_id, name: "j".into() }, dirs("/run"), false);
        let runner = runner(job_id, TestId::new_v4());
        manager.add_test_if_absent(job_id, runner.clone()).unwrap();

        let resolved_path = std::env::temp_dir().join(format!("labrun-jobmgr-resolve-{}", std::process::id()));
        std::fs::write(&resolved_path, b"payload").unwrap();
        let resolved_path = Utf8PathBuf::from_path_buf(resolved_path).unwrap();

        let source = ResolveSource {
            tag: "apk".into(),
            path: "gs://bucket/a".into(),
        };
        let futures = manager
            .start_resolve_job_files(job_id, vec![source], {
                let resolved_path = resolved_path.clone();
                move |_s| {
                    let resolved_path = resolved_path.clone();
                    Box::pin(async move { Ok(resolved_path) }) as BoxFuture<'static, _>
                }
            })
            .unwrap();
        futures[0].clone().await.unwrap();

        let received = runner.received_job_files.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].tag, "apk");
        assert_eq!(received[0].local_path, resolved_path);
        assert!(!received[0].checksum.is_empty());

        std::fs::remove_file(resolved_path).ok();
    }

    #[tokio::test]
    async fn start_resolve_job_files_rejects_after_remove() {
        let manager = Arc::new(JobManager::new());
        let job_id = JobId::new_v4();
        let dir = std::env::temp_dir().join(format!("labrun-jobmgr-remove-{}", std::process::id()));
        manager.add_job_if_absent(JobLocator { id: job_id, name: "j".into() }, dirs(dir.to_str().unwrap()), false);

        manager.remove_job(job_id).await.unwrap();

        let source = ResolveSource {
            tag: "apk".into(),
            path: "gs://bucket/a".into(),
        };
        let err = manager
            .start_resolve_job_files(job_id, vec![source], |_s| {
                Box::pin(async { Ok(Utf8PathBuf::from("/resolved/a")) }) as BoxFuture<'static, _>
            })
            .unwrap_err();
        assert!(matches!(err, JobManagerError::JobNotFound(_)));
    }
}
