//! Sync orchestration: freshness gate, fetch with retries, normalize, persist.

pub mod cancel;
pub mod retry;
pub mod scheduler;
pub mod single_flight;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::{CacheConfig, TrunchbullConfig};
use crate::db::repository::TrunchbullRepository;
use crate::error::{ErrorKind, Result, TrunchbullError};
use crate::models::common::{DataType, Source};
use crate::models::student::Student;
use crate::models::sync::{SyncKey, SyncStatusRecord};
use crate::normalizer::normalize_batch;
use crate::providers::{FetchContext, ProviderClient, RawRecord};
use crate::token_store::TokenStore;

use self::cancel::CancelToken;
use self::retry::RetryPolicy;
use self::single_flight::SingleFlight;

/// Result of one (student, source, data type) sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Cached data was within its TTL; the provider was not called.
    Fresh,
    Synced {
        upserted: usize,
        orphaned: usize,
        rejected: usize,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl SyncOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, SyncOutcome::Failed { .. })
    }

    fn is_not_authenticated(&self) -> bool {
        matches!(
            self,
            SyncOutcome::Failed {
                kind: ErrorKind::NotAuthenticated,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyResult {
    pub source: Source,
    pub data_type: DataType,
    #[serde(flatten)]
    pub outcome: SyncOutcome,
}

/// Everything one `trigger_sync` did for a student.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub student_id: String,
    pub results: Vec<KeyResult>,
}

impl SyncReport {
    pub fn outcome(&self, source: Source, data_type: DataType) -> Option<&SyncOutcome> {
        self.results
            .iter()
            .find(|r| r.source == source && r.data_type == data_type)
            .map(|r| &r.outcome)
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_failed()).count()
    }
}

/// Drives every sync through the same state machine: check freshness, fetch
/// (retrying transient failures), normalize, persist atomically.
pub struct SyncOrchestrator<R> {
    repo: R,
    tokens: Arc<dyn TokenStore>,
    clients: HashMap<Source, Arc<dyn ProviderClient>>,
    retry: RetryPolicy,
    cache: CacheConfig,
    reject_threshold: f64,
    flights: SingleFlight<SyncKey, SyncOutcome>,
    workers: Arc<Semaphore>,
}

impl<R> SyncOrchestrator<R>
where
    R: TrunchbullRepository + Clone + 'static,
{
    pub fn new(repo: R, tokens: Arc<dyn TokenStore>, config: &TrunchbullConfig) -> Self {
        Self {
            repo,
            tokens,
            clients: HashMap::new(),
            retry: RetryPolicy::from_config(&config.sync),
            cache: config.cache.clone(),
            reject_threshold: config.sync.malformed_batch_threshold,
            flights: SingleFlight::new(),
            workers: Arc::new(Semaphore::new(config.sync.max_concurrent_syncs.max(1))),
        }
    }

    /// Register the client used for its provider.
    pub fn with_client(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(client.source(), client);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn sources(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = self.clients.keys().copied().collect();
        sources.sort();
        sources
    }

    /// Fail any sync left `in_progress` by a previous process.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let count = self.repo.fail_interrupted_syncs().await?;
        if count > 0 {
            warn!(count, "Marked interrupted syncs as failed");
        }
        Ok(count)
    }

    /// Sync one key. Concurrent calls for the same key share a single run.
    pub async fn sync_key(&self, key: &SyncKey, cancel: &CancelToken) -> SyncOutcome {
        self.flights
            .run(key, || self.run_key(key, cancel))
            .await
    }

    /// Sync every linked provider and data type for one student.
    ///
    /// Fails with [`TrunchbullError::NotAuthenticated`] only when no linked
    /// provider has usable credentials; other failures are reported per key.
    pub async fn trigger_sync(&self, student_id: &str, cancel: &CancelToken) -> Result<SyncReport> {
        let student = self.require_student(student_id).await?;
        let sources: Vec<Source> = student
            .linked_sources()
            .into_iter()
            .filter(|s| self.clients.contains_key(s))
            .collect();

        info!(student_id, sources = ?sources, "Starting sync");

        let per_source = sources.iter().map(|&source| {
            let student_id = student.id.as_str();
            async move {
                let mut results = Vec::with_capacity(DataType::ALL.len());
                // Declaration order: courses land before the rows that reference them.
                for data_type in DataType::ALL {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let key = SyncKey::new(student_id, source, data_type);
                    let outcome = self.sync_key(&key, cancel).await;
                    results.push(KeyResult {
                        source,
                        data_type,
                        outcome,
                    });
                }
                results
            }
        });
        let results: Vec<KeyResult> = join_all(per_source).await.into_iter().flatten().collect();

        let unauthenticated = !sources.is_empty()
            && sources.iter().all(|s| {
                results
                    .iter()
                    .filter(|r| r.source == *s)
                    .any(|r| r.outcome.is_not_authenticated())
            });
        if unauthenticated {
            let provider = sources
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(TrunchbullError::NotAuthenticated { provider });
        }

        let report = SyncReport {
            student_id: student.id,
            results,
        };
        info!(student_id, keys = report.results.len(), failed = report.failed(), "Sync finished");
        Ok(report)
    }

    /// Sync every known student. Per-student errors are logged and skipped.
    pub async fn sync_all(&self, cancel: &CancelToken) -> Vec<SyncReport> {
        let students = match self.repo.list_students().await {
            Ok(students) => students,
            Err(e) => {
                error!(error = %e, "Failed to list students for scheduled sync");
                return Vec::new();
            }
        };

        let runs = students.iter().map(|s| async move {
            match self.trigger_sync(&s.id, cancel).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(student_id = %s.id, error = %e, "Scheduled sync skipped student");
                    None
                }
            }
        });
        join_all(runs).await.into_iter().flatten().collect()
    }

    /// Current status of every (linked source, data type) slot for a student.
    pub async fn sync_status(&self, student_id: &str) -> Result<Vec<SyncStatusRecord>> {
        let student = self.require_student(student_id).await?;
        let mut statuses = Vec::new();
        for source in student.linked_sources() {
            for data_type in DataType::ALL {
                let key = SyncKey::new(&student.id, source, data_type);
                let record = self
                    .repo
                    .get_sync_status(&key)
                    .await?
                    .unwrap_or_else(|| SyncStatusRecord::never_synced(&key));
                statuses.push(record);
            }
        }
        Ok(statuses)
    }

    async fn require_student(&self, student_id: &str) -> Result<Student> {
        self.repo
            .get_student(student_id)
            .await?
            .ok_or_else(|| TrunchbullError::NotFound(format!("student '{student_id}'")))
    }

    async fn run_key(&self, key: &SyncKey, cancel: &CancelToken) -> SyncOutcome {
        // Checking
        let ttl = self.cache.ttl(key.data_type);
        match self.repo.get_sync_status(key).await {
            Ok(Some(status)) if status.is_fresh(Utc::now(), ttl) => {
                debug!(key = %key, "Cache fresh, skipping fetch");
                return SyncOutcome::Fresh;
            }
            Ok(_) => {}
            Err(e) => return failed(&e),
        }

        let student = match self.require_student(&key.student_id).await {
            Ok(s) => s,
            Err(e) => return failed(&e),
        };
        let (Some(external_id), Some(client)) =
            (student.external_id(key.source), self.clients.get(&key.source))
        else {
            return failed(&TrunchbullError::NotFound(format!(
                "{} link for student '{}'",
                key.source, key.student_id
            )));
        };
        let external_id = external_id.to_string();
        let client = client.clone();

        let permit = match self.workers.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return failed(&TrunchbullError::Cancelled),
        };

        if let Err(e) = self.repo.mark_sync_in_progress(key).await {
            return failed(&e);
        }

        // From here the row is in_progress. The rest runs on its own task so a
        // dropped caller cannot leave it there.
        let run = KeyRun {
            repo: self.repo.clone(),
            tokens: self.tokens.clone(),
            retry: self.retry.clone(),
            reject_threshold: self.reject_threshold,
            key: key.clone(),
        };
        let cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            run.execute(client, external_id, cancel).await
        });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(key = %key, error = %e, "Sync task aborted");
                failed(&TrunchbullError::PersistenceFailure(format!("sync task failed: {e}")))
            }
        }
    }
}

/// The in-progress section of one key's sync. Owns everything it needs so it
/// can outlive the caller that started it.
struct KeyRun<R> {
    repo: R,
    tokens: Arc<dyn TokenStore>,
    retry: RetryPolicy,
    reject_threshold: f64,
    key: SyncKey,
}

impl<R> KeyRun<R>
where
    R: TrunchbullRepository + Clone + 'static,
{
    /// Always leaves the status row at success or failed.
    async fn execute(
        self,
        client: Arc<dyn ProviderClient>,
        external_id: String,
        cancel: CancelToken,
    ) -> SyncOutcome {
        match self.fetch_and_persist(client, external_id, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => self.record_failure(e).await,
        }
    }

    async fn fetch_and_persist(
        &self,
        client: Arc<dyn ProviderClient>,
        external_id: String,
        cancel: &CancelToken,
    ) -> Result<SyncOutcome> {
        let key = &self.key;
        let raw = self.fetch_with_retry(client.as_ref(), external_id, cancel).await?;

        // Normalizing
        let batch = normalize_batch(&key.student_id, key.source, key.data_type, &raw);
        if batch.exceeds_reject_threshold(self.reject_threshold) {
            return Err(TrunchbullError::malformed(
                batch
                    .rejected
                    .first()
                    .map(|r| r.field.clone())
                    .unwrap_or_else(|| "record".to_string()),
                format!(
                    "{} of {} records rejected",
                    batch.rejected.len(),
                    batch.total()
                ),
            ));
        }
        if cancel.is_cancelled() {
            return Err(TrunchbullError::Cancelled);
        }

        // Persisting is not raced against cancellation.
        let summary = self
            .repo
            .persist_batch(key, &batch.entities, Utc::now())
            .await
            .map_err(|e| match e {
                TrunchbullError::PersistenceFailure(_) => e,
                other => TrunchbullError::PersistenceFailure(other.to_string()),
            })?;

        info!(
            key = %key,
            upserted = summary.upserted,
            orphaned = summary.orphaned,
            rejected = batch.rejected.len(),
            "Sync succeeded"
        );
        Ok(SyncOutcome::Synced {
            upserted: summary.upserted,
            orphaned: summary.orphaned,
            rejected: batch.rejected.len(),
        })
    }

    async fn fetch_with_retry(
        &self,
        client: &dyn ProviderClient,
        external_id: String,
        cancel: &CancelToken,
    ) -> Result<Vec<RawRecord>> {
        let key = &self.key;
        // The token store already tried a refresh before reporting AuthExpired.
        let token = match self.tokens.get_token(&key.student_id, key.source).await {
            Ok(token) => token,
            Err(TrunchbullError::AuthExpired { provider }) => {
                warn!(key = %key, "Stored token expired and could not be refreshed");
                return Err(TrunchbullError::NotAuthenticated { provider });
            }
            Err(e) => return Err(e),
        };
        let mut ctx = FetchContext::new(external_id, token.access_token).with_cancel(cancel.clone());
        let mut attempt: u32 = 1;
        let mut refreshed = false;

        loop {
            let result = tokio::select! {
                res = client.fetch(key.data_type, &ctx) => res,
                _ = cancel.cancelled() => Err(TrunchbullError::Cancelled),
            };

            let err = match result {
                Ok(raw) => {
                    debug!(key = %key, attempt, count = raw.len(), "Fetched records");
                    return Ok(raw);
                }
                Err(e) => e,
            };

            match err {
                TrunchbullError::AuthExpired { ref provider } => {
                    if refreshed {
                        return Err(TrunchbullError::NotAuthenticated {
                            provider: provider.clone(),
                        });
                    }
                    refreshed = true;
                    info!(key = %key, "Access token rejected, refreshing");
                    match self.tokens.refresh_token(&key.student_id, key.source).await {
                        Ok(token) => ctx.access_token = token.access_token,
                        Err(e) => {
                            warn!(key = %key, error = %e, "Token refresh failed");
                            return Err(TrunchbullError::NotAuthenticated {
                                provider: provider.clone(),
                            });
                        }
                    }
                }
                e if e.is_transient() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay_after(attempt, e.retry_after());
                    warn!(
                        key = %key,
                        attempt,
                        max_attempts = self.retry.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient fetch failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(TrunchbullError::Cancelled),
                    }
                    attempt += 1;
                }
                e => return Err(e),
            }
        }
    }

    async fn record_failure(&self, err: TrunchbullError) -> SyncOutcome {
        let key = &self.key;
        let message = match err {
            TrunchbullError::Cancelled => "cancelled".to_string(),
            ref e => e.to_string(),
        };
        warn!(key = %key, error = %message, "Sync failed");
        if let Err(e) = self.repo.mark_sync_failed(key, &message).await {
            error!(key = %key, error = %e, "Failed to record sync failure");
        }
        SyncOutcome::Failed {
            kind: err.kind(),
            message,
        }
    }
}

fn failed(err: &TrunchbullError) -> SyncOutcome {
    SyncOutcome::Failed {
        kind: err.kind(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffStrategy;
    use crate::db::repository::{
        AssignmentRepository, CourseRepository, GradeRepository, StudentRepository,
        SyncStatusRepository,
    };
    use crate::db::sqlite::tests::setup;
    use crate::db::sqlite::SqliteRepository;
    use crate::models::assignment::AssignmentFilter;
    use crate::models::grade::GradeFilter;
    use crate::models::student::NewStudent;
    use crate::models::sync::SyncState;
    use crate::models::token::OAuthToken;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Clone, Copy)]
    enum Failure {
        Upstream,
        RateLimited(Duration),
        AuthExpired,
    }

    impl Failure {
        fn to_error(self) -> TrunchbullError {
            match self {
                Failure::Upstream => TrunchbullError::upstream("503 Service Unavailable"),
                Failure::RateLimited(d) => TrunchbullError::RateLimited {
                    retry_after: Some(d),
                },
                Failure::AuthExpired => TrunchbullError::AuthExpired {
                    provider: "mock".into(),
                },
            }
        }
    }

    struct MockProvider {
        source: Source,
        records: HashMap<DataType, Vec<RawRecord>>,
        scripted: Mutex<VecDeque<Failure>>,
        always: Option<Failure>,
        /// Reject tokens other than this one with AuthExpired.
        accepted_token: Option<String>,
        delay: Duration,
        calls: Mutex<HashMap<DataType, usize>>,
    }

    impl MockProvider {
        fn new(source: Source) -> Self {
            Self {
                source,
                records: HashMap::new(),
                scripted: Mutex::new(VecDeque::new()),
                always: None,
                accepted_token: None,
                delay: Duration::ZERO,
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn with(mut self, data_type: DataType, records: Vec<RawRecord>) -> Self {
            self.records.insert(data_type, records);
            self
        }

        fn calls(&self, data_type: DataType) -> usize {
            self.calls
                .lock()
                .unwrap()
                .get(&data_type)
                .copied()
                .unwrap_or(0)
        }

        async fn respond(&self, data_type: DataType, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
            *self.calls.lock().unwrap().entry(data_type).or_default() += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(ref accepted) = self.accepted_token {
                if &ctx.access_token != accepted {
                    return Err(Failure::AuthExpired.to_error());
                }
            }
            if let Some(f) = self.scripted.lock().unwrap().pop_front() {
                return Err(f.to_error());
            }
            if let Some(f) = self.always {
                return Err(f.to_error());
            }
            Ok(self.records.get(&data_type).cloned().unwrap_or_default())
        }
    }

    #[async_trait]
    impl ProviderClient for MockProvider {
        fn source(&self) -> Source {
            self.source
        }
        async fn fetch_courses(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
            self.respond(DataType::Courses, ctx).await
        }
        async fn fetch_assignments(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
            self.respond(DataType::Assignments, ctx).await
        }
        async fn fetch_grades(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
            self.respond(DataType::Grades, ctx).await
        }
        async fn fetch_events(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
            self.respond(DataType::Events, ctx).await
        }
        async fn fetch_messages(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
            self.respond(DataType::Messages, ctx).await
        }
    }

    struct MockTokens {
        access: Option<&'static str>,
        refreshed: Option<&'static str>,
        refreshes: AtomicUsize,
    }

    impl MockTokens {
        fn valid() -> Self {
            Self {
                access: Some("tok"),
                refreshed: Some("fresh-tok"),
                refreshes: AtomicUsize::new(0),
            }
        }
    }

    fn token(student_id: &str, source: Source, access: &str) -> OAuthToken {
        OAuthToken {
            student_id: student_id.to_string(),
            source,
            access_token: access.to_string(),
            refresh_token: Some("r".to_string()),
            expires_at: None,
        }
    }

    #[async_trait]
    impl TokenStore for MockTokens {
        async fn get_token(&self, student_id: &str, source: Source) -> Result<OAuthToken> {
            self.access
                .map(|a| token(student_id, source, a))
                .ok_or_else(|| TrunchbullError::NotAuthenticated {
                    provider: source.to_string(),
                })
        }

        async fn refresh_token(&self, student_id: &str, source: Source) -> Result<OAuthToken> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.refreshed
                .map(|a| token(student_id, source, a))
                .ok_or_else(|| TrunchbullError::AuthExpired {
                    provider: source.to_string(),
                })
        }
    }

    fn test_config() -> TrunchbullConfig {
        let mut config = TrunchbullConfig::default();
        config.sync.retry_attempts = 3;
        config.sync.retry_backoff = BackoffStrategy::Fixed;
        config.sync.retry_base_delay_ms = 1;
        config
    }

    async fn seed(repo: &SqliteRepository) {
        repo.create_student(&NewStudent {
            id: Some("S1".to_string()),
            name: "Matilda".to_string(),
            grade_level: Some(5),
            schoology_user_id: Some("1001".to_string()),
            powerschool_student_id: Some("ps-1".to_string()),
        })
        .await
        .unwrap();
    }

    async fn orchestrator(
        config: &TrunchbullConfig,
        tokens: Arc<MockTokens>,
        providers: Vec<Arc<MockProvider>>,
    ) -> SyncOrchestrator<SqliteRepository> {
        let repo = setup().await;
        seed(&repo).await;
        let mut orch = SyncOrchestrator::new(repo, tokens, config);
        for p in providers {
            orch = orch.with_client(p);
        }
        orch
    }

    fn schoology_course() -> RawRecord {
        json!({"id": "77", "course_title": "Biology", "section_title": "Period 2"})
    }

    fn schoology_assignments() -> Vec<RawRecord> {
        vec![
            json!({"id": "a1", "section_id": "77", "title": "Lab 1", "due": "2025-10-20 23:59:00"}),
            json!({"id": "a2", "section_id": "77", "title": "Lab 2", "due": "2025-10-27 23:59:00"}),
        ]
    }

    fn key(source: Source, data_type: DataType) -> SyncKey {
        SyncKey::new("S1", source, data_type)
    }

    #[tokio::test]
    async fn first_sync_stores_two_assignments() {
        let provider = Arc::new(
            MockProvider::new(Source::Schoology)
                .with(DataType::Courses, vec![schoology_course()])
                .with(DataType::Assignments, schoology_assignments()),
        );
        let orch = orchestrator(
            &test_config(),
            Arc::new(MockTokens::valid()),
            vec![provider.clone()],
        )
        .await;

        let status = orch
            .repository()
            .get_sync_status(&key(Source::Schoology, DataType::Assignments))
            .await
            .unwrap();
        assert!(status.is_none());

        let report = orch.trigger_sync("S1", &CancelToken::never()).await.unwrap();
        assert_eq!(report.failed(), 0);
        assert_eq!(
            report.outcome(Source::Schoology, DataType::Assignments),
            Some(&SyncOutcome::Synced {
                upserted: 2,
                orphaned: 0,
                rejected: 0
            })
        );

        let status = orch
            .repository()
            .get_sync_status(&key(Source::Schoology, DataType::Assignments))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status, SyncState::Success);
        assert!(status.last_sync.is_some());

        let stored = orch
            .repository()
            .list_assignments("S1", &AssignmentFilter::default())
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|a| a.source == Source::Schoology));
    }

    #[tokio::test]
    async fn resync_is_idempotent() {
        let mut config = test_config();
        config.cache.enabled = false;
        let provider = Arc::new(
            MockProvider::new(Source::Schoology)
                .with(DataType::Courses, vec![schoology_course()])
                .with(DataType::Assignments, schoology_assignments()),
        );
        let orch = orchestrator(&config, Arc::new(MockTokens::valid()), vec![provider.clone()]).await;

        orch.trigger_sync("S1", &CancelToken::never()).await.unwrap();
        let first = orch
            .repository()
            .list_assignments("S1", &AssignmentFilter::default())
            .await
            .unwrap();
        orch.trigger_sync("S1", &CancelToken::never()).await.unwrap();
        let second = orch
            .repository()
            .list_assignments("S1", &AssignmentFilter::default())
            .await
            .unwrap();

        assert_eq!(provider.calls(DataType::Assignments), 2);
        assert_eq!(second.len(), 2);
        let ids = |v: &[crate::models::assignment::Assignment]| {
            v.iter().map(|a| a.id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn fresh_cache_skips_provider() {
        let provider = Arc::new(
            MockProvider::new(Source::Schoology)
                .with(DataType::Courses, vec![schoology_course()])
                .with(DataType::Assignments, schoology_assignments()),
        );
        let orch = orchestrator(
            &test_config(),
            Arc::new(MockTokens::valid()),
            vec![provider.clone()],
        )
        .await;

        orch.trigger_sync("S1", &CancelToken::never()).await.unwrap();
        let again = orch.trigger_sync("S1", &CancelToken::never()).await.unwrap();

        assert_eq!(provider.calls(DataType::Assignments), 1);
        assert_eq!(
            again.outcome(Source::Schoology, DataType::Assignments),
            Some(&SyncOutcome::Fresh)
        );
    }

    #[tokio::test]
    async fn concurrent_triggers_share_one_fetch() {
        let mut mock = MockProvider::new(Source::Schoology)
            .with(DataType::Courses, vec![schoology_course()]);
        mock.delay = Duration::from_millis(100);
        let provider = Arc::new(mock);
        let orch = orchestrator(
            &test_config(),
            Arc::new(MockTokens::valid()),
            vec![provider.clone()],
        )
        .await;

        let k = key(Source::Schoology, DataType::Courses);
        let cancel = CancelToken::never();
        let (a, b) = tokio::join!(orch.sync_key(&k, &cancel), orch.sync_key(&k, &cancel));

        assert_eq!(provider.calls(DataType::Courses), 1);
        assert_eq!(a, b);
        assert!(matches!(a, SyncOutcome::Synced { upserted: 1, .. }));
    }

    #[tokio::test]
    async fn retry_budget_is_exact() {
        let mut mock = MockProvider::new(Source::PowerSchool);
        mock.always = Some(Failure::Upstream);
        let provider = Arc::new(mock);
        let config = test_config();
        let orch = orchestrator(&config, Arc::new(MockTokens::valid()), vec![provider.clone()]).await;

        let k = key(Source::PowerSchool, DataType::Grades);
        let outcome = orch.sync_key(&k, &CancelToken::never()).await;

        assert_eq!(provider.calls(DataType::Grades), config.sync.retry_attempts as usize);
        assert!(matches!(
            outcome,
            SyncOutcome::Failed {
                kind: ErrorKind::UpstreamUnavailable,
                ..
            }
        ));
        let status = orch.repository().get_sync_status(&k).await.unwrap().unwrap();
        assert_eq!(status.status, SyncState::Failed);
        assert!(status.error_message.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let mock = MockProvider::new(Source::Schoology)
            .with(DataType::Courses, vec![schoology_course()]);
        mock.scripted
            .lock()
            .unwrap()
            .push_back(Failure::RateLimited(Duration::from_millis(50)));
        let provider = Arc::new(mock);
        let orch = orchestrator(
            &test_config(),
            Arc::new(MockTokens::valid()),
            vec![provider.clone()],
        )
        .await;

        let started = Instant::now();
        let outcome = orch
            .sync_key(&key(Source::Schoology, DataType::Courses), &CancelToken::never())
            .await;
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));
        assert_eq!(provider.calls(DataType::Courses), 2);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn one_malformed_grade_is_skipped() {
        let provider = Arc::new(
            MockProvider::new(Source::PowerSchool)
                .with(
                    DataType::Courses,
                    vec![json!({"id": 10, "course_name": "Algebra"})],
                )
                .with(
                    DataType::Grades,
                    vec![
                        json!({"id": 1, "section_id": 10, "percent": 92, "store_code": "Q1"}),
                        json!({"id": 2, "percent": "not a number"}),
                    ],
                ),
        );
        let orch = orchestrator(
            &test_config(),
            Arc::new(MockTokens::valid()),
            vec![provider.clone()],
        )
        .await;

        let report = orch.trigger_sync("S1", &CancelToken::never()).await.unwrap();
        assert!(matches!(
            report.outcome(Source::PowerSchool, DataType::Grades),
            Some(SyncOutcome::Synced {
                upserted: 1,
                rejected: 1,
                ..
            })
        ));
        let grades = orch
            .repository()
            .list_grades("S1", &GradeFilter::default())
            .await
            .unwrap();
        assert_eq!(grades.len(), 1);
        let status = orch
            .repository()
            .get_sync_status(&key(Source::PowerSchool, DataType::Grades))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status, SyncState::Success);
    }

    #[tokio::test]
    async fn fully_malformed_batch_fails() {
        let provider = Arc::new(MockProvider::new(Source::PowerSchool).with(
            DataType::Courses,
            vec![json!({"id": 10}), json!({"course_name": "No id"})],
        ));
        let orch = orchestrator(
            &test_config(),
            Arc::new(MockTokens::valid()),
            vec![provider.clone()],
        )
        .await;

        let k = key(Source::PowerSchool, DataType::Courses);
        let outcome = orch.sync_key(&k, &CancelToken::never()).await;
        assert!(matches!(
            outcome,
            SyncOutcome::Failed {
                kind: ErrorKind::MalformedResponse,
                ..
            }
        ));
        let status = orch.repository().get_sync_status(&k).await.unwrap().unwrap();
        assert_eq!(status.status, SyncState::Failed);
    }

    #[tokio::test]
    async fn empty_batch_is_success() {
        let provider = Arc::new(MockProvider::new(Source::PowerSchool));
        let orch = orchestrator(
            &test_config(),
            Arc::new(MockTokens::valid()),
            vec![provider.clone()],
        )
        .await;
        let outcome = orch
            .sync_key(&key(Source::PowerSchool, DataType::Events), &CancelToken::never())
            .await;
        assert!(matches!(outcome, SyncOutcome::Synced { upserted: 0, .. }));
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_once() {
        let mut mock = MockProvider::new(Source::Schoology)
            .with(DataType::Courses, vec![schoology_course()]);
        mock.accepted_token = Some("fresh-tok".to_string());
        let provider = Arc::new(mock);
        let tokens = Arc::new(MockTokens::valid());
        let orch = orchestrator(&test_config(), tokens.clone(), vec![provider.clone()]).await;

        let outcome = orch
            .sync_key(&key(Source::Schoology, DataType::Courses), &CancelToken::never())
            .await;
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(provider.calls(DataType::Courses), 2);
    }

    #[tokio::test]
    async fn repeated_auth_failure_is_not_authenticated() {
        let mut mock = MockProvider::new(Source::Schoology);
        mock.accepted_token = Some("never-issued".to_string());
        let provider = Arc::new(mock);
        let tokens = Arc::new(MockTokens::valid());
        let orch = orchestrator(&test_config(), tokens.clone(), vec![provider.clone()]).await;

        let k = key(Source::Schoology, DataType::Courses);
        let outcome = orch.sync_key(&k, &CancelToken::never()).await;
        assert!(outcome.is_not_authenticated());
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(provider.calls(DataType::Courses), 2);
        let status = orch.repository().get_sync_status(&k).await.unwrap().unwrap();
        assert_eq!(status.status, SyncState::Failed);

        let err = orch
            .trigger_sync("S1", &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, TrunchbullError::NotAuthenticated { .. }));
    }

    #[tokio::test]
    async fn refused_refresh_of_expired_token_is_not_authenticated() {
        use crate::db::repository::TokenRepository;
        use crate::token_store::{OAuthTokenStore, TokenEndpoint};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let repo = setup().await;
        seed(&repo).await;
        repo.save_token(&OAuthToken {
            student_id: "S1".to_string(),
            source: Source::Schoology,
            access_token: "stale".to_string(),
            refresh_token: Some("r-1".to_string()),
            expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
        })
        .await
        .unwrap();
        let endpoints = HashMap::from([(
            Source::Schoology,
            TokenEndpoint {
                token_url: format!("{}/oauth/token", server.uri()),
                client_id: "cid".to_string(),
                client_secret: "secret".to_string(),
            },
        )]);
        let tokens = Arc::new(OAuthTokenStore::new(Arc::new(repo.clone()), endpoints));
        let provider = Arc::new(MockProvider::new(Source::Schoology));
        let orch = SyncOrchestrator::new(repo, tokens, &test_config()).with_client(provider.clone());

        let k = key(Source::Schoology, DataType::Courses);
        let outcome = orch.sync_key(&k, &CancelToken::never()).await;
        assert!(outcome.is_not_authenticated());
        assert_eq!(provider.calls(DataType::Courses), 0);
        let status = orch.repository().get_sync_status(&k).await.unwrap().unwrap();
        assert_eq!(status.status, SyncState::Failed);

        let err = orch
            .trigger_sync("S1", &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, TrunchbullError::NotAuthenticated { .. }));
    }

    #[tokio::test]
    async fn dropped_caller_still_settles_status() {
        let mut mock = MockProvider::new(Source::Schoology)
            .with(DataType::Courses, vec![schoology_course()]);
        mock.delay = Duration::from_millis(300);
        let provider = Arc::new(mock);
        let orch = Arc::new(
            orchestrator(
                &test_config(),
                Arc::new(MockTokens::valid()),
                vec![provider.clone()],
            )
            .await,
        );

        let k = key(Source::Schoology, DataType::Courses);
        let caller = {
            let orch = orch.clone();
            let k = k.clone();
            tokio::spawn(async move { orch.sync_key(&k, &CancelToken::never()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        let status = orch.repository().get_sync_status(&k).await.unwrap().unwrap();
        assert_eq!(status.status, SyncState::InProgress);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let status = orch.repository().get_sync_status(&k).await.unwrap().unwrap();
        assert_eq!(status.status, SyncState::Success);
        assert_eq!(orch.repository().list_courses("S1").await.unwrap().len(), 1);
        assert_eq!(provider.calls(DataType::Courses), 1);
    }

    #[tokio::test]
    async fn second_run_while_in_progress_is_conflict() {
        let provider = Arc::new(MockProvider::new(Source::Schoology));
        let orch = orchestrator(
            &test_config(),
            Arc::new(MockTokens::valid()),
            vec![provider.clone()],
        )
        .await;
        let k = key(Source::Schoology, DataType::Messages);
        orch.repository().mark_sync_in_progress(&k).await.unwrap();

        let outcome = orch.sync_key(&k, &CancelToken::never()).await;
        assert!(matches!(
            outcome,
            SyncOutcome::Failed {
                kind: ErrorKind::Conflict,
                ..
            }
        ));
        assert_eq!(provider.calls(DataType::Messages), 0);
    }

    #[tokio::test]
    async fn missing_credentials_skip_provider_calls() {
        let provider = Arc::new(MockProvider::new(Source::Schoology));
        let tokens = Arc::new(MockTokens {
            access: None,
            refreshed: None,
            refreshes: AtomicUsize::new(0),
        });
        let orch = orchestrator(&test_config(), tokens, vec![provider.clone()]).await;

        let err = orch
            .trigger_sync("S1", &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, TrunchbullError::NotAuthenticated { .. }));
        assert_eq!(provider.calls(DataType::Courses), 0);
    }

    #[tokio::test]
    async fn one_authenticated_provider_is_enough() {
        struct SchoologyOnly;
        #[async_trait]
        impl TokenStore for SchoologyOnly {
            async fn get_token(&self, student_id: &str, source: Source) -> Result<OAuthToken> {
                match source {
                    Source::Schoology => Ok(token(student_id, source, "tok")),
                    Source::PowerSchool => Err(TrunchbullError::NotAuthenticated {
                        provider: source.to_string(),
                    }),
                }
            }
            async fn refresh_token(&self, _: &str, source: Source) -> Result<OAuthToken> {
                Err(TrunchbullError::AuthExpired {
                    provider: source.to_string(),
                })
            }
        }

        let repo = setup().await;
        seed(&repo).await;
        let orch = SyncOrchestrator::new(repo, Arc::new(SchoologyOnly), &test_config())
            .with_client(Arc::new(
                MockProvider::new(Source::Schoology)
                    .with(DataType::Courses, vec![schoology_course()]),
            ))
            .with_client(Arc::new(MockProvider::new(Source::PowerSchool)));

        let report = orch.trigger_sync("S1", &CancelToken::never()).await.unwrap();
        assert_eq!(report.results.len(), 10);
        assert!(report
            .outcome(Source::PowerSchool, DataType::Courses)
            .unwrap()
            .is_not_authenticated());
        assert!(!report
            .outcome(Source::Schoology, DataType::Courses)
            .unwrap()
            .is_failed());
    }

    #[tokio::test]
    async fn unlinked_providers_are_skipped() {
        let repo = setup().await;
        repo.create_student(&NewStudent {
            id: Some("S2".to_string()),
            name: "Bruce".to_string(),
            powerschool_student_id: Some("ps-2".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
        let schoology = Arc::new(MockProvider::new(Source::Schoology));
        let orch = SyncOrchestrator::new(repo, Arc::new(MockTokens::valid()), &test_config())
            .with_client(schoology.clone())
            .with_client(Arc::new(MockProvider::new(Source::PowerSchool)));

        let report = orch.trigger_sync("S2", &CancelToken::never()).await.unwrap();
        assert_eq!(report.results.len(), 5);
        assert!(report.results.iter().all(|r| r.source == Source::PowerSchool));
        assert_eq!(schoology.calls(DataType::Courses), 0);
    }

    #[tokio::test]
    async fn cancelled_sync_records_failure_and_writes_nothing() {
        let mut mock = MockProvider::new(Source::Schoology)
            .with(DataType::Courses, vec![schoology_course()]);
        mock.delay = Duration::from_millis(200);
        let provider = Arc::new(mock);
        let orch = orchestrator(
            &test_config(),
            Arc::new(MockTokens::valid()),
            vec![provider.clone()],
        )
        .await;

        let (handle, token) = cancel::cancel_pair();
        let k = key(Source::Schoology, DataType::Courses);
        let (outcome, _) = tokio::join!(orch.sync_key(&k, &token), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        assert!(matches!(
            outcome,
            SyncOutcome::Failed {
                kind: ErrorKind::Cancelled,
                ..
            }
        ));
        let status = orch.repository().get_sync_status(&k).await.unwrap().unwrap();
        assert_eq!(status.status, SyncState::Failed);
        assert_eq!(status.error_message.as_deref(), Some("cancelled"));
        assert!(orch
            .repository()
            .list_courses("S1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn sync_status_reports_never_synced_slots() {
        let orch = orchestrator(&test_config(), Arc::new(MockTokens::valid()), vec![]).await;
        let statuses = orch.sync_status("S1").await.unwrap();
        assert_eq!(statuses.len(), 10);
        assert!(statuses.iter().all(|s| s.status == SyncState::NeverSynced));

        let err = orch.sync_status("nobody").await.unwrap_err();
        assert!(matches!(err, TrunchbullError::NotFound(_)));
    }

    #[tokio::test]
    async fn recover_interrupted_fails_stale_rows() {
        let orch = orchestrator(&test_config(), Arc::new(MockTokens::valid()), vec![]).await;
        let k = key(Source::Schoology, DataType::Messages);
        orch.repository().mark_sync_in_progress(&k).await.unwrap();
        assert_eq!(orch.recover_interrupted().await.unwrap(), 1);
        let status = orch.repository().get_sync_status(&k).await.unwrap().unwrap();
        assert_eq!(status.status, SyncState::Failed);
    }

    #[tokio::test]
    async fn sync_all_covers_every_student() {
        let provider = Arc::new(
            MockProvider::new(Source::PowerSchool)
                .with(DataType::Courses, vec![json!({"id": 10, "course_name": "Art"})]),
        );
        let orch = orchestrator(
            &test_config(),
            Arc::new(MockTokens::valid()),
            vec![provider.clone()],
        )
        .await;
        orch.repository()
            .create_student(&NewStudent {
                id: Some("S2".to_string()),
                name: "Lavender".to_string(),
                powerschool_student_id: Some("ps-2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let reports = orch.sync_all(&CancelToken::never()).await;
        assert_eq!(reports.len(), 2);
        assert_eq!(provider.calls(DataType::Courses), 2);
        assert_eq!(orch.repository().list_courses("S2").await.unwrap().len(), 1);
    }
}
