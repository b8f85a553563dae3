//! # PostgreSQL Store
//!
//! [`Store`] over a sqlx [`PgPool`]. Schema lives in `migrations/` and is
//! embedded into the binary.
//!
//! ## Claiming
//!
//! `next_jobs` selects a batch of job rows `FOR UPDATE OF j SKIP LOCKED`,
//! least recently processed first, and commits at once; concurrent
//! selectors never block on each other. `try_claim` then takes a
//! session-scoped `pg_try_advisory_lock` on a dedicated pooled connection
//! and re-reads the job under it. The advisory lock stays with its
//! connection until the [`PgJobLock`] is released or dropped. A dropped
//! lock detaches its connection from the pool and closes it, which ends the
//! session and frees the lock on the server.
//!
//! ## Audit writes
//!
//! `record_rule_processed` locks the release row, refuses terminal releases
//! and already-recorded rules, then inserts the event, its outcome and the
//! variant detail row, and moves the release if the resolution is terminal,
//! all in one transaction.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relgate_core::{
    ApprovalPolicy, ApprovalRule, BindingMode, BoundRule, EventId, EventKind, HttpApiRule,
    HttpResponseRecord, ManualDecision, ManualRule, NewApprovalRule, NewManualDecision,
    NewRelease, NewRulesetBinding, OutcomePayload, Release, ReleaseEvent, ReleaseKey,
    ReleaseState, RetryPolicy, RuleId, RuleOutcome, RuleSpec, RuleType, RulesetBinding,
    RulesetVersionKey, ScheduleRule,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Postgres;

use super::{FinalizeOutcome, RuleProcessedWrite, Store, WriteOutcome};
use crate::config::{EngineConfig, DEFAULT_LOCK_NAMESPACE_BASE};
use crate::error::{map_unique_violation, EngineError};
use crate::queue::{advisory_lock_id, ClaimedJob, JobLock, LockSubIdPolicy, ReleaseBackgroundJob};

const INSERT_JOB_FROM_SEQUENCE: &str = "INSERT INTO release_background_jobs
     (organization_id, application_id, release_id, created_at)
     VALUES ($1, $2, $3, $4)
     ON CONFLICT ON CONSTRAINT release_background_jobs_lock_sub_id_key DO NOTHING
     RETURNING lock_sub_id";

const INSERT_JOB_WITH_SUB_ID: &str = "INSERT INTO release_background_jobs
     (organization_id, application_id, release_id, created_at, lock_sub_id)
     VALUES ($1, $2, $3, $4, $5)
     ON CONFLICT ON CONSTRAINT release_background_jobs_lock_sub_id_key DO NOTHING
     RETURNING lock_sub_id";

const RELEASE_COLUMNS: &str = "organization_id, application_id, id, state, source_identity,
     comments, created_at, updated_at, finalized_at";

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_namespace_base: i64,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_namespace_base: DEFAULT_LOCK_NAMESPACE_BASE,
        }
    }

    pub fn with_lock_namespace_base(mut self, base: i64) -> Self {
        self.lock_namespace_base = base;
        self
    }

    /// Open a pool sized by `config` and apply pending migrations.
    pub async fn connect_and_migrate(url: &str, config: &EngineConfig) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .min_connections(config.db_min_connections)
            .acquire_timeout(config.db_acquire_timeout)
            .connect(url)
            .await?;
        tracing::info!("Connected to PostgreSQL");

        let store = Self::new(pool).with_lock_namespace_base(config.lock_namespace_base);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), EngineError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn rules_for_version(&self, version: RulesetVersionKey) -> Result<Vec<ApprovalRule>, EngineError> {
        let mut rules = Vec::new();
        for rule_type in RuleType::EVALUATION_ORDER {
            match rule_type {
                RuleType::HttpApi => {
                    let rows: Vec<HttpApiRuleRow> = sqlx::query_as(
                        "SELECT id, major_version_id, minor_version_number, enabled, created_at,
                         url, username, password, tls_ca_certificate, retry_policy, retry_limit
                         FROM http_api_approval_rules
                         WHERE major_version_id = $1 AND minor_version_number = $2
                         ORDER BY id",
                    )
                    .bind(version.major_version_id)
                    .bind(version.minor_version_number)
                    .fetch_all(&self.pool)
                    .await?;
                    for row in rows {
                        rules.push(row.into_rule()?);
                    }
                }
                RuleType::Schedule => {
                    let rows: Vec<ScheduleRuleRow> = sqlx::query_as(
                        "SELECT id, major_version_id, minor_version_number, enabled, created_at,
                         begin_time, end_time, days_of_week, days_of_month, months_of_year
                         FROM schedule_approval_rules
                         WHERE major_version_id = $1 AND minor_version_number = $2
                         ORDER BY id",
                    )
                    .bind(version.major_version_id)
                    .bind(version.minor_version_number)
                    .fetch_all(&self.pool)
                    .await?;
                    rules.extend(rows.into_iter().map(ScheduleRuleRow::into_rule));
                }
                RuleType::Manual => {
                    let rows: Vec<ManualRuleRow> = sqlx::query_as(
                        "SELECT id, major_version_id, minor_version_number, enabled, created_at,
                         approval_policy, minimum_approvals
                         FROM manual_approval_rules
                         WHERE major_version_id = $1 AND minor_version_number = $2
                         ORDER BY id",
                    )
                    .bind(version.major_version_id)
                    .bind(version.minor_version_number)
                    .fetch_all(&self.pool)
                    .await?;
                    for row in rows {
                        rules.push(row.into_rule()?);
                    }
                }
            }
        }
        Ok(rules)
    }
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Store for PgStore {
    async fn create_release(
        &self,
        release: NewRelease,
        bindings: Vec<NewRulesetBinding>,
        lock_sub_ids: &LockSubIdPolicy,
        at: DateTime<Utc>,
    ) -> Result<(Release, ReleaseBackgroundJob), EngineError> {
        let key = release.key.clone();
        let release = release.into_release(at);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO releases (organization_id, application_id, id, state,
             source_identity, comments, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
        )
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .bind(release.state.as_str())
        .bind(&release.source_identity)
        .bind(&release.comments)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, || format!("release {key}")))?;

        for (position, binding) in bindings.iter().enumerate() {
            let position = i32::try_from(position)
                .map_err(|_| EngineError::InvariantViolation(format!("binding position {position} out of range")))?;
            sqlx::query(
                "INSERT INTO release_approval_ruleset_bindings (organization_id, application_id,
                 release_id, position, ruleset_id, major_version_id, minor_version_number, mode)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(key.organization_id.as_str())
            .bind(key.application_id.as_str())
            .bind(key.release_id)
            .bind(position)
            .bind(&binding.ruleset_id)
            .bind(binding.version.major_version_id)
            .bind(binding.version.minor_version_number)
            .bind(binding.mode.as_str())
            .execute(&mut *tx)
            .await?;
        }

        insert_event(&mut tx, &key, "created", at).await?;
        let job = insert_job(&mut tx, &key, lock_sub_ids, at).await?;
        tx.commit().await?;

        tracing::info!(release = %key, lock_sub_id = job.lock_sub_id, "release created");
        Ok((release, job))
    }

    async fn create_background_job(
        &self,
        release: &ReleaseKey,
        lock_sub_ids: &LockSubIdPolicy,
        at: DateTime<Utc>,
    ) -> Result<ReleaseBackgroundJob, EngineError> {
        let mut tx = self.pool.begin().await?;
        lock_release(&mut tx, release).await?;
        let job = insert_job(&mut tx, release, lock_sub_ids, at).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn insert_rules(
        &self,
        version: RulesetVersionKey,
        rules: Vec<NewApprovalRule>,
        at: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRule>, EngineError> {
        for rule in &rules {
            rule.spec.validate()?;
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(rules.len());
        for rule in rules {
            let id: i64 = match &rule.spec {
                RuleSpec::HttpApi(http) => {
                    let retry_limit = i32::try_from(http.retry_limit).map_err(|_| {
                        EngineError::InvariantViolation(format!("retry_limit {} out of range", http.retry_limit))
                    })?;
                    sqlx::query_scalar(
                        "INSERT INTO http_api_approval_rules (major_version_id, minor_version_number,
                         enabled, created_at, url, username, password, tls_ca_certificate,
                         retry_policy, retry_limit)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                         RETURNING id",
                    )
                    .bind(version.major_version_id)
                    .bind(version.minor_version_number)
                    .bind(rule.enabled)
                    .bind(at)
                    .bind(&http.url)
                    .bind(&http.username)
                    .bind(&http.password)
                    .bind(&http.tls_ca_certificate)
                    .bind(http.retry_policy.as_str())
                    .bind(retry_limit)
                    .fetch_one(&mut *tx)
                    .await?
                }
                RuleSpec::Schedule(schedule) => {
                    sqlx::query_scalar(
                        "INSERT INTO schedule_approval_rules (major_version_id, minor_version_number,
                         enabled, created_at, begin_time, end_time, days_of_week, days_of_month,
                         months_of_year)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                         RETURNING id",
                    )
                    .bind(version.major_version_id)
                    .bind(version.minor_version_number)
                    .bind(rule.enabled)
                    .bind(at)
                    .bind(&schedule.begin_time)
                    .bind(&schedule.end_time)
                    .bind(&schedule.days_of_week)
                    .bind(&schedule.days_of_month)
                    .bind(&schedule.months_of_year)
                    .fetch_one(&mut *tx)
                    .await?
                }
                RuleSpec::Manual(manual) => {
                    let minimum = match manual.approval_policy {
                        ApprovalPolicy::All => None,
                        ApprovalPolicy::Minimum(n) => Some(i32::try_from(n).map_err(|_| {
                            EngineError::InvariantViolation(format!("minimum approvals {n} out of range"))
                        })?),
                    };
                    sqlx::query_scalar(
                        "INSERT INTO manual_approval_rules (major_version_id, minor_version_number,
                         enabled, created_at, approval_policy, minimum_approvals)
                         VALUES ($1, $2, $3, $4, $5, $6)
                         RETURNING id",
                    )
                    .bind(version.major_version_id)
                    .bind(version.minor_version_number)
                    .bind(rule.enabled)
                    .bind(at)
                    .bind(manual.approval_policy.as_str())
                    .bind(minimum)
                    .fetch_one(&mut *tx)
                    .await?
                }
            };
            inserted.push(ApprovalRule {
                id: RuleId(id),
                version,
                enabled: rule.enabled,
                spec: rule.spec,
                created_at: at,
            });
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn release(&self, key: &ReleaseKey) -> Result<Option<Release>, EngineError> {
        let row: Option<ReleaseRow> = sqlx::query_as(&format!(
            "SELECT {RELEASE_COLUMNS} FROM releases
             WHERE organization_id = $1 AND application_id = $2 AND id = $3"
        ))
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ReleaseRow::into_release).transpose()
    }

    async fn background_job(&self, key: &ReleaseKey) -> Result<Option<ReleaseBackgroundJob>, EngineError> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT organization_id, application_id, release_id, lock_sub_id, created_at, last_processed_at
             FROM release_background_jobs
             WHERE organization_id = $1 AND application_id = $2 AND release_id = $3",
        )
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(JobRow::into_job))
    }

    async fn bindings(&self, key: &ReleaseKey) -> Result<Vec<RulesetBinding>, EngineError> {
        let rows: Vec<BindingRow> = sqlx::query_as(
            "SELECT ruleset_id, major_version_id, minor_version_number, mode
             FROM release_approval_ruleset_bindings
             WHERE organization_id = $1 AND application_id = $2 AND release_id = $3
             ORDER BY position",
        )
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| row.into_binding(key)).collect()
    }

    async fn bound_rules(&self, key: &ReleaseKey) -> Result<Vec<BoundRule>, EngineError> {
        let mut bound = Vec::new();
        for (binding_index, binding) in self.bindings(key).await?.into_iter().enumerate() {
            for rule in self.rules_for_version(binding.version).await? {
                bound.push(BoundRule {
                    rule,
                    mode: binding.mode,
                    binding_index,
                });
            }
        }
        Ok(bound)
    }

    async fn events(&self, key: &ReleaseKey) -> Result<Vec<ReleaseEvent>, EngineError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT e.id, e.kind, e.created_at, p.rule_type, p.rule_id, p.result_state, p.ignored_error
             FROM release_events e
             LEFT JOIN release_rule_processed_events p ON p.event_id = e.id
             WHERE e.organization_id = $1 AND e.application_id = $2 AND e.release_id = $3
             ORDER BY e.id",
        )
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| row.into_event(key)).collect()
    }

    async fn outcomes(&self, key: &ReleaseKey) -> Result<Vec<RuleOutcome>, EngineError> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(
            "SELECT o.event_id, o.rule_type, o.rule_id, o.success, o.created_at,
             (h.event_id IS NOT NULL) AS has_http_api, h.response_code, h.response_content_type,
             h.response_body, h.transport_error, h.attempts,
             (s.event_id IS NOT NULL) AS has_schedule,
             (m.event_id IS NOT NULL) AS has_manual, m.comments
             FROM approval_rule_outcomes o
             LEFT JOIN http_api_approval_rule_outcomes h ON h.event_id = o.event_id
             LEFT JOIN schedule_approval_rule_outcomes s ON s.event_id = o.event_id
             LEFT JOIN manual_approval_rule_outcomes m ON m.event_id = o.event_id
             WHERE o.organization_id = $1 AND o.application_id = $2 AND o.release_id = $3
             ORDER BY o.event_id",
        )
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OutcomeRow::into_outcome).collect()
    }

    async fn manual_decisions(
        &self,
        key: &ReleaseKey,
        rule_id: RuleId,
    ) -> Result<Vec<ManualDecision>, EngineError> {
        let rows: Vec<DecisionRow> = sqlx::query_as(
            "SELECT rule_id, reviewer, approved, comments, decided_at
             FROM manual_approval_decisions
             WHERE organization_id = $1 AND application_id = $2 AND release_id = $3
               AND rule_id = $4
             ORDER BY decided_at, reviewer",
        )
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .bind(rule_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DecisionRow::into_decision).collect())
    }

    async fn next_jobs(&self, limit: usize) -> Result<Vec<ReleaseBackgroundJob>, EngineError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await?;
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT j.organization_id, j.application_id, j.release_id, j.lock_sub_id, j.created_at,
                    j.last_processed_at
             FROM release_background_jobs j
             JOIN releases r ON r.organization_id = j.organization_id
               AND r.application_id = j.application_id
               AND r.id = j.release_id
             WHERE r.state = 'in_progress'
             ORDER BY j.last_processed_at NULLS FIRST, j.created_at, j.lock_sub_id
             LIMIT $1
             FOR UPDATE OF j SKIP LOCKED",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }

    async fn try_claim(&self, key: &ReleaseKey) -> Result<Option<ClaimedJob>, EngineError> {
        let mut conn = self.pool.acquire().await?;
        let lock_sub_id: Option<i32> = sqlx::query_scalar(
            "SELECT lock_sub_id FROM release_background_jobs
             WHERE organization_id = $1 AND application_id = $2 AND release_id = $3",
        )
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .fetch_optional(&mut *conn)
        .await?;
        let Some(lock_sub_id) = lock_sub_id else {
            return Ok(None);
        };

        let lock_id = advisory_lock_id(self.lock_namespace_base, lock_sub_id);
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            tracing::debug!(release = %key, lock_id, "advisory lock held elsewhere");
            return Ok(None);
        }

        // From here on, dropping `lock` closes the session and frees the lock.
        let mut lock = PgJobLock {
            conn: Some(conn),
            lock_id,
        };
        let row: Option<JobRow> = match lock.conn.as_mut() {
            Some(conn) => {
                sqlx::query_as(
                    "SELECT organization_id, application_id, release_id, lock_sub_id, created_at,
                            last_processed_at
                     FROM release_background_jobs
                     WHERE organization_id = $1 AND application_id = $2 AND release_id = $3",
                )
                .bind(key.organization_id.as_str())
                .bind(key.application_id.as_str())
                .bind(key.release_id)
                .fetch_optional(&mut **conn)
                .await?
            }
            None => None,
        };
        match row {
            Some(row) => Ok(Some(ClaimedJob {
                job: row.into_job(),
                lock: Box::new(lock),
            })),
            None => {
                JobLock::release(Box::new(lock)).await?;
                Ok(None)
            }
        }
    }

    async fn mark_processed(&self, key: &ReleaseKey, at: DateTime<Utc>) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE release_background_jobs SET last_processed_at = $4
             WHERE organization_id = $1 AND application_id = $2 AND release_id = $3",
        )
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_rule_processed(&self, write: RuleProcessedWrite) -> Result<WriteOutcome, EngineError> {
        let key = &write.release;
        let rule_id = write.evaluation.rule_id;
        let mut tx = self.pool.begin().await?;

        let release = lock_release(&mut tx, key).await?;
        if release.state.is_terminal() {
            return Ok(WriteOutcome::ReleaseFinalized(release.state));
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM approval_rule_outcomes
             WHERE organization_id = $1 AND application_id = $2 AND release_id = $3
               AND rule_id = $4)",
        )
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .bind(rule_id.0)
        .fetch_one(&mut *tx)
        .await?;
        if exists {
            return Ok(WriteOutcome::AlreadyRecorded);
        }

        let rule_type = write.evaluation.payload.rule_type();
        let event_id = insert_event(&mut tx, key, "rule_processed", write.at).await?;
        sqlx::query(
            "INSERT INTO release_rule_processed_events
             (event_id, rule_type, rule_id, result_state, ignored_error)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event_id.0)
        .bind(rule_type.as_str())
        .bind(rule_id.0)
        .bind(write.resolution.state.as_str())
        .bind(write.resolution.ignored_error)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO approval_rule_outcomes (event_id, organization_id, application_id,
             release_id, rule_type, rule_id, success, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(event_id.0)
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .bind(rule_type.as_str())
        .bind(rule_id.0)
        .bind(write.evaluation.success)
        .bind(write.at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, || format!("outcome of {rule_id} for {key}")))?;

        match &write.evaluation.payload {
            OutcomePayload::HttpApi(record) => {
                let attempts = i32::try_from(record.attempts).unwrap_or(i32::MAX);
                sqlx::query(
                    "INSERT INTO http_api_approval_rule_outcomes (event_id, response_code,
                     response_content_type, response_body, transport_error, attempts)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(event_id.0)
                .bind(record.response_code.map(i32::from))
                .bind(&record.content_type)
                .bind(&record.body)
                .bind(&record.error)
                .bind(attempts)
                .execute(&mut *tx)
                .await?;
            }
            OutcomePayload::Schedule => {
                sqlx::query("INSERT INTO schedule_approval_rule_outcomes (event_id) VALUES ($1)")
                    .bind(event_id.0)
                    .execute(&mut *tx)
                    .await?;
            }
            OutcomePayload::Manual { comments } => {
                sqlx::query("INSERT INTO manual_approval_rule_outcomes (event_id, comments) VALUES ($1, $2)")
                    .bind(event_id.0)
                    .bind(comments)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let mut release = release;
        release.transition(write.resolution.state, write.at)?;
        update_release_state(&mut tx, &release).await?;
        tx.commit().await?;
        Ok(WriteOutcome::Recorded(event_id))
    }

    async fn finalize_release(
        &self,
        key: &ReleaseKey,
        state: ReleaseState,
        at: DateTime<Utc>,
    ) -> Result<FinalizeOutcome, EngineError> {
        if !state.is_terminal() {
            return Err(EngineError::InvariantViolation(format!(
                "cannot finalize {key} into non-terminal state {state}"
            )));
        }
        let mut tx = self.pool.begin().await?;
        let mut release = lock_release(&mut tx, key).await?;
        if release.state.is_terminal() {
            return Ok(FinalizeOutcome::AlreadyFinal(release.state));
        }
        release.transition(state, at)?;
        update_release_state(&mut tx, &release).await?;
        tx.commit().await?;
        Ok(FinalizeOutcome::Finalized)
    }

    async fn cancel_release(&self, key: &ReleaseKey, at: DateTime<Utc>) -> Result<Release, EngineError> {
        let mut tx = self.pool.begin().await?;
        let mut release = lock_release(&mut tx, key).await?;
        release.transition(ReleaseState::Cancelled, at)?;
        update_release_state(&mut tx, &release).await?;
        insert_event(&mut tx, key, "cancelled", at).await?;
        tx.commit().await?;
        Ok(release)
    }

    async fn record_manual_decision(
        &self,
        key: &ReleaseKey,
        rule_id: RuleId,
        decision: NewManualDecision,
        at: DateTime<Utc>,
    ) -> Result<ManualDecision, EngineError> {
        let mut tx = self.pool.begin().await?;
        let release = lock_release(&mut tx, key).await?;
        if release.state.is_terminal() {
            return Err(EngineError::InvalidDecision(format!(
                "release {key} is already {}",
                release.state
            )));
        }

        let bound_manual: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM manual_approval_rules m
             JOIN release_approval_ruleset_bindings b
               ON b.major_version_id = m.major_version_id
              AND b.minor_version_number = m.minor_version_number
             WHERE b.organization_id = $1 AND b.application_id = $2 AND b.release_id = $3
               AND m.id = $4)",
        )
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .bind(rule_id.0)
        .fetch_one(&mut *tx)
        .await?;
        if !bound_manual {
            return Err(EngineError::InvalidDecision(format!(
                "{rule_id} is not a manual rule bound to release {key}"
            )));
        }

        sqlx::query(
            "INSERT INTO manual_approval_decisions (organization_id, application_id, release_id,
             rule_id, reviewer, approved, comments, decided_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(key.organization_id.as_str())
        .bind(key.application_id.as_str())
        .bind(key.release_id)
        .bind(rule_id.0)
        .bind(&decision.reviewer)
        .bind(decision.approved)
        .bind(&decision.comments)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, || format!("decision by {} on {rule_id}", decision.reviewer)))?;
        tx.commit().await?;

        Ok(ManualDecision {
            rule_id,
            reviewer: decision.reviewer,
            approved: decision.approved,
            comments: decision.comments,
            decided_at: at,
        })
    }
}

// ---------------------------------------------------------------------------
// Shared statements
// ---------------------------------------------------------------------------

/// Lock and load the release row for the rest of the transaction.
async fn lock_release(conn: &mut PgConnection, key: &ReleaseKey) -> Result<Release, EngineError> {
    let row: Option<ReleaseRow> = sqlx::query_as(&format!(
        "SELECT {RELEASE_COLUMNS} FROM releases
         WHERE organization_id = $1 AND application_id = $2 AND id = $3
         FOR UPDATE"
    ))
    .bind(key.organization_id.as_str())
    .bind(key.application_id.as_str())
    .bind(key.release_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or_else(|| EngineError::ReleaseNotFound(key.to_string()))?
        .into_release()
}

async fn update_release_state(conn: &mut PgConnection, release: &Release) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE releases SET state = $4, updated_at = $5, finalized_at = $6
         WHERE organization_id = $1 AND application_id = $2 AND id = $3",
    )
    .bind(release.key.organization_id.as_str())
    .bind(release.key.application_id.as_str())
    .bind(release.key.release_id)
    .bind(release.state.as_str())
    .bind(release.updated_at)
    .bind(release.finalized_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_event(
    conn: &mut PgConnection,
    key: &ReleaseKey,
    kind: &str,
    at: DateTime<Utc>,
) -> Result<EventId, EngineError> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO release_events (organization_id, application_id, release_id, kind, created_at)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id",
    )
    .bind(key.organization_id.as_str())
    .bind(key.application_id.as_str())
    .bind(key.release_id)
    .bind(kind)
    .bind(at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(EventId(id))
}

/// Insert the release's job, retrying only on lock sub-id collisions.
async fn insert_job(
    conn: &mut PgConnection,
    key: &ReleaseKey,
    policy: &LockSubIdPolicy,
    at: DateTime<Utc>,
) -> Result<ReleaseBackgroundJob, EngineError> {
    let mut candidates = policy.candidates();
    for candidate in candidates.by_ref() {
        let query = match candidate {
            None => sqlx::query_scalar::<Postgres, i32>(INSERT_JOB_FROM_SEQUENCE),
            Some(_) => sqlx::query_scalar::<Postgres, i32>(INSERT_JOB_WITH_SUB_ID),
        };
        let query = query
            .bind(key.organization_id.as_str())
            .bind(key.application_id.as_str())
            .bind(key.release_id)
            .bind(at);
        let query = match candidate {
            Some(sub_id) => query.bind(sub_id),
            None => query,
        };
        let inserted = query
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_unique_violation(e, || format!("background job for {key}")))?;

        match inserted {
            Some(lock_sub_id) => {
                return Ok(ReleaseBackgroundJob {
                    key: key.clone(),
                    lock_sub_id,
                    created_at: at,
                    last_processed_at: None,
                })
            }
            None => tracing::debug!(release = %key, ?candidate, "lock sub-id taken, retrying"),
        }
    }
    Err(EngineError::LockAllocationExhausted {
        tries: candidates.tries(),
    })
}

// ---------------------------------------------------------------------------
// PgJobLock
// ---------------------------------------------------------------------------

/// Session-scoped advisory lock pinned to a pooled connection.
#[derive(Debug)]
pub struct PgJobLock {
    conn: Option<PoolConnection<Postgres>>,
    lock_id: i64,
}

impl Drop for PgJobLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Closing the session frees the lock server-side.
            drop(conn.detach());
            tracing::debug!(lock_id = self.lock_id, "advisory lock dropped, connection closed");
        }
    }
}

#[async_trait]
impl JobLock for PgJobLock {
    fn lock_id(&self) -> i64 {
        self.lock_id
    }

    async fn release(mut self: Box<Self>) -> Result<(), EngineError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.lock_id)
            .fetch_one(&mut *conn)
            .await;
        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => {
                drop(conn.detach());
                Err(EngineError::InvariantViolation(format!(
                    "advisory lock {} was not held by its connection",
                    self.lock_id
                )))
            }
            Err(e) => {
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

fn parse_column<T>(column: &str, raw: &str) -> Result<T, EngineError>
where
    T: FromStr<Err = String>,
{
    raw.parse()
        .map_err(|e| EngineError::InvariantViolation(format!("corrupt {column}: {e}")))
}

#[derive(sqlx::FromRow)]
struct ReleaseRow {
    organization_id: String,
    application_id: String,
    id: i64,
    state: String,
    source_identity: Option<String>,
    comments: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
}

impl ReleaseRow {
    fn into_release(self) -> Result<Release, EngineError> {
        Ok(Release {
            key: ReleaseKey::new(self.organization_id, self.application_id, self.id),
            state: parse_column("releases.state", &self.state)?,
            source_identity: self.source_identity,
            comments: self.comments,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finalized_at: self.finalized_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    organization_id: String,
    application_id: String,
    release_id: i64,
    lock_sub_id: i32,
    created_at: DateTime<Utc>,
    last_processed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_job(self) -> ReleaseBackgroundJob {
        ReleaseBackgroundJob {
            key: ReleaseKey::new(self.organization_id, self.application_id, self.release_id),
            lock_sub_id: self.lock_sub_id,
            created_at: self.created_at,
            last_processed_at: self.last_processed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BindingRow {
    ruleset_id: String,
    major_version_id: i64,
    minor_version_number: i32,
    mode: String,
}

impl BindingRow {
    fn into_binding(self, release: &ReleaseKey) -> Result<RulesetBinding, EngineError> {
        let mode: BindingMode = parse_column("release_approval_ruleset_bindings.mode", &self.mode)?;
        Ok(NewRulesetBinding::new(
            self.ruleset_id,
            RulesetVersionKey::new(self.major_version_id, self.minor_version_number),
            mode,
        )
        .bind_to(release.clone()))
    }
}

#[derive(sqlx::FromRow)]
struct HttpApiRuleRow {
    id: i64,
    major_version_id: i64,
    minor_version_number: i32,
    enabled: bool,
    created_at: DateTime<Utc>,
    url: String,
    username: Option<String>,
    password: Option<String>,
    tls_ca_certificate: Option<String>,
    retry_policy: String,
    retry_limit: i32,
}

impl HttpApiRuleRow {
    fn into_rule(self) -> Result<ApprovalRule, EngineError> {
        let retry_policy: RetryPolicy = parse_column("http_api_approval_rules.retry_policy", &self.retry_policy)?;
        let retry_limit = u32::try_from(self.retry_limit).map_err(|_| {
            EngineError::InvariantViolation(format!("negative retry_limit on rule {}", self.id))
        })?;
        Ok(ApprovalRule {
            id: RuleId(self.id),
            version: RulesetVersionKey::new(self.major_version_id, self.minor_version_number),
            enabled: self.enabled,
            spec: RuleSpec::HttpApi(HttpApiRule {
                url: self.url,
                username: self.username,
                password: self.password,
                tls_ca_certificate: self.tls_ca_certificate,
                retry_policy,
                retry_limit,
            }),
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRuleRow {
    id: i64,
    major_version_id: i64,
    minor_version_number: i32,
    enabled: bool,
    created_at: DateTime<Utc>,
    begin_time: Option<String>,
    end_time: Option<String>,
    days_of_week: Option<String>,
    days_of_month: Option<String>,
    months_of_year: Option<String>,
}

impl ScheduleRuleRow {
    fn into_rule(self) -> ApprovalRule {
        ApprovalRule {
            id: RuleId(self.id),
            version: RulesetVersionKey::new(self.major_version_id, self.minor_version_number),
            enabled: self.enabled,
            spec: RuleSpec::Schedule(ScheduleRule {
                begin_time: self.begin_time,
                end_time: self.end_time,
                days_of_week: self.days_of_week,
                days_of_month: self.days_of_month,
                months_of_year: self.months_of_year,
            }),
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ManualRuleRow {
    id: i64,
    major_version_id: i64,
    minor_version_number: i32,
    enabled: bool,
    created_at: DateTime<Utc>,
    approval_policy: String,
    minimum_approvals: Option<i32>,
}

impl ManualRuleRow {
    fn into_rule(self) -> Result<ApprovalRule, EngineError> {
        let approval_policy = match (self.approval_policy.as_str(), self.minimum_approvals) {
            ("all", None) => ApprovalPolicy::All,
            ("minimum", Some(n)) if n > 0 => ApprovalPolicy::Minimum(n.unsigned_abs()),
            (policy, minimum) => {
                return Err(EngineError::InvariantViolation(format!(
                    "corrupt approval policy on rule {}: {policy:?} with minimum {minimum:?}",
                    self.id
                )))
            }
        };
        Ok(ApprovalRule {
            id: RuleId(self.id),
            version: RulesetVersionKey::new(self.major_version_id, self.minor_version_number),
            enabled: self.enabled,
            spec: RuleSpec::Manual(ManualRule { approval_policy }),
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    kind: String,
    created_at: DateTime<Utc>,
    rule_type: Option<String>,
    rule_id: Option<i64>,
    result_state: Option<String>,
    ignored_error: Option<bool>,
}

impl EventRow {
    fn into_event(self, release: &ReleaseKey) -> Result<ReleaseEvent, EngineError> {
        let kind = match self.kind.as_str() {
            "created" => EventKind::Created,
            "cancelled" => EventKind::Cancelled,
            "rule_processed" => match (self.rule_type, self.rule_id, self.result_state, self.ignored_error) {
                (Some(rule_type), Some(rule_id), Some(result_state), Some(ignored_error)) => {
                    EventKind::RuleProcessed {
                        rule_type: parse_column("release_rule_processed_events.rule_type", &rule_type)?,
                        rule_id: RuleId(rule_id),
                        result_state: parse_column::<ReleaseState>(
                            "release_rule_processed_events.result_state",
                            &result_state,
                        )?,
                        ignored_error,
                    }
                }
                _ => {
                    return Err(EngineError::InvariantViolation(format!(
                        "rule_processed event {} has no detail row",
                        self.id
                    )))
                }
            },
            other => {
                return Err(EngineError::InvariantViolation(format!(
                    "event {} has unknown kind {other:?}",
                    self.id
                )))
            }
        };
        Ok(ReleaseEvent {
            id: EventId(self.id),
            release: release.clone(),
            kind,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OutcomeRow {
    event_id: i64,
    rule_type: String,
    rule_id: i64,
    success: bool,
    created_at: DateTime<Utc>,
    has_http_api: bool,
    response_code: Option<i32>,
    response_content_type: Option<String>,
    response_body: Option<Vec<u8>>,
    transport_error: Option<String>,
    attempts: Option<i32>,
    has_schedule: bool,
    has_manual: bool,
    comments: Option<String>,
}

impl OutcomeRow {
    fn into_outcome(self) -> Result<RuleOutcome, EngineError> {
        let rule_type: RuleType = parse_column("approval_rule_outcomes.rule_type", &self.rule_type)?;
        let missing_detail = || {
            EngineError::InvariantViolation(format!(
                "{rule_type} outcome {} has no detail row",
                self.event_id
            ))
        };
        let payload = match rule_type {
            RuleType::HttpApi if self.has_http_api => OutcomePayload::HttpApi(HttpResponseRecord {
                response_code: self.response_code.and_then(|code| u16::try_from(code).ok()),
                content_type: self.response_content_type.clone().unwrap_or_default(),
                body: self.response_body.clone().unwrap_or_default(),
                error: self.transport_error.clone(),
                attempts: self
                    .attempts
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or_default(),
            }),
            RuleType::Schedule if self.has_schedule => OutcomePayload::Schedule,
            RuleType::Manual if self.has_manual => OutcomePayload::Manual {
                comments: self.comments.clone(),
            },
            RuleType::HttpApi | RuleType::Schedule | RuleType::Manual => return Err(missing_detail()),
        };
        Ok(RuleOutcome {
            event_id: EventId(self.event_id),
            rule_id: RuleId(self.rule_id),
            success: self.success,
            payload,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DecisionRow {
    rule_id: i64,
    reviewer: String,
    approved: bool,
    comments: Option<String>,
    decided_at: DateTime<Utc>,
}

impl DecisionRow {
    fn into_decision(self) -> ManualDecision {
        ManualDecision {
            rule_id: RuleId(self.rule_id),
            reviewer: self.reviewer,
            approved: self.approved,
            comments: self.comments,
            decided_at: self.decided_at,
        }
    }
}
