use crate::config::{ConfigError, DatabaseConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Status strings that allow an inbound message to resume an existing row.
/// `DECLINED` is the review vocabulary for a failed submission.
pub const RETRYABLE_STATUSES: &[&str] = &["PROCESSING", "FAILED", "DECLINED"];

/// Schema for the volunteer and submission tables
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Errors raised by the submission store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Submission not found: {0}")]
    NotFound(Uuid),

    #[error("Submission for file {0} changed during upsert")]
    Conflict(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Lifecycle status of a video submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionStatus {
    Processing,
    PendingReview,
    Failed,
    /// Status assigned by downstream review, kept verbatim
    Other(String),
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SubmissionStatus::Processing => "PROCESSING",
            SubmissionStatus::PendingReview => "PENDING_REVIEW",
            SubmissionStatus::Failed => "FAILED",
            SubmissionStatus::Other(status) => status,
        }
    }

    pub fn parse(status: &str) -> Self {
        match status {
            "PROCESSING" => SubmissionStatus::Processing,
            "PENDING_REVIEW" => SubmissionStatus::PendingReview,
            "FAILED" | "DECLINED" => SubmissionStatus::Failed,
            other => SubmissionStatus::Other(other.to_string()),
        }
    }

    /// Whether a new message with the same file id may resume this row
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Processing | SubmissionStatus::Failed
        )
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registered submitter
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Volunteer {
    /// Origin-platform user id
    pub id: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone_number: Option<String>,
    pub phone_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Contact details used to create or refresh a volunteer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolunteerRegistration {
    pub id: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone: Option<String>,
}

impl VolunteerRegistration {
    /// Split a display name into first and last name the way profiles are shown
    pub fn from_display_name(
        id: impl Into<String>,
        display_name: &str,
        username: Option<String>,
        phone: Option<String>,
    ) -> Self {
        let mut parts = display_name.split_whitespace();
        let first_name = parts.next().unwrap_or("Unknown").to_string();
        let rest: Vec<&str> = parts.collect();
        let last_name = if rest.is_empty() {
            None
        } else {
            Some(rest.join(" "))
        };

        Self {
            id: id.into(),
            first_name,
            last_name,
            username,
            phone,
        }
    }
}

/// Submission joined with its volunteer's display fields
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionView {
    pub id: Uuid,
    pub volunteer_id: String,
    pub telegram_file_id: String,
    pub status: SubmissionStatus,
    pub description: Option<String>,
    pub decline_reason: Option<String>,
    pub video_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub volunteer_first_name: Option<String>,
    pub volunteer_last_name: Option<String>,
    pub volunteer_username: Option<String>,
}

#[derive(Debug, FromRow)]
struct SubmissionRow {
    id: Uuid,
    volunteer_id: String,
    telegram_file_id: String,
    status: String,
    description: Option<String>,
    decline_reason: Option<String>,
    video_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    volunteer_first_name: Option<String>,
    volunteer_last_name: Option<String>,
    volunteer_username: Option<String>,
}

impl From<SubmissionRow> for SubmissionView {
    fn from(row: SubmissionRow) -> Self {
        Self {
            id: row.id,
            volunteer_id: row.volunteer_id,
            telegram_file_id: row.telegram_file_id,
            status: SubmissionStatus::parse(&row.status),
            description: row.description,
            decline_reason: row.decline_reason,
            video_url: row.video_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
            volunteer_first_name: row.volunteer_first_name,
            volunteer_last_name: row.volunteer_last_name,
            volunteer_username: row.volunteer_username,
        }
    }
}

/// Result of registering an inbound file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// No row existed for the file; a new one was inserted
    Created(Uuid),
    /// A PROCESSING or FAILED row was reset to PROCESSING
    Resumed(Uuid),
    /// The file was already submitted; nothing was changed
    Duplicate { id: Uuid, status: SubmissionStatus },
}

impl SubmissionOutcome {
    /// Id of the row the caller should work on, `None` for duplicates
    pub fn submission_id(&self) -> Option<Uuid> {
        match self {
            SubmissionOutcome::Created(id) | SubmissionOutcome::Resumed(id) => Some(*id),
            SubmissionOutcome::Duplicate { .. } => None,
        }
    }
}

/// Data-access interface for volunteers and submissions
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Look up a volunteer; absence is `Ok(None)`
    async fn find_volunteer(&self, id: &str) -> Result<Option<Volunteer>, StoreError>;

    /// Idempotent upsert keyed by volunteer id
    async fn register_or_update_volunteer(
        &self,
        registration: &VolunteerRegistration,
    ) -> Result<(), StoreError>;

    /// Insert a submission for the file or resume the retryable row that owns it
    async fn create_or_resume_submission(
        &self,
        volunteer_id: &str,
        file_id: &str,
        description: Option<&str>,
    ) -> Result<SubmissionOutcome, StoreError>;

    /// Unconditionally set status and reason
    async fn update_status(
        &self,
        submission_id: Uuid,
        status: SubmissionStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn get_submission(&self, submission_id: Uuid)
        -> Result<Option<SubmissionView>, StoreError>;
}

/// Rewrite driver-qualified URLs into the plain form sqlx expects
pub fn normalize_database_url(url: &str) -> Result<String, ConfigError> {
    if let Some(rest) = url.strip_prefix("postgresql+asyncpg://") {
        return Ok(format!("postgresql://{}", rest));
    }
    if url.starts_with("postgresql://") || url.starts_with("postgres://") {
        return Ok(url.to_string());
    }

    let scheme = url.split("://").next().unwrap_or_default();
    Err(ConfigError::InvalidValue {
        key: "database.url".to_string(),
        message: format!("unsupported scheme '{}'", scheme),
    })
}

/// PostgreSQL-backed submission store
pub struct PgSubmissionStore {
    pool: PgPool,
}

impl PgSubmissionStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let url = normalize_database_url(&config.url)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self::from_pool(pool))
    }

    /// Wrap an already connected pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        MIGRATOR.run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for PgSubmissionStore {
    #[instrument(skip(self))]
    async fn find_volunteer(&self, id: &str) -> Result<Option<Volunteer>, StoreError> {
        let volunteer = sqlx::query_as::<_, Volunteer>(
            r#"
            SELECT id, first_name, last_name, username, phone_number,
                   phone_verified, created_at, updated_at
            FROM volunteers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        debug!(found = volunteer.is_some(), "Volunteer lookup");
        Ok(volunteer)
    }

    #[instrument(skip(self, registration), fields(volunteer_id = %registration.id))]
    async fn register_or_update_volunteer(
        &self,
        registration: &VolunteerRegistration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO volunteers (
                id, first_name, last_name, username, phone_number,
                phone_verified, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, NOW(), NOW()
            )
            ON CONFLICT (id) DO UPDATE SET
                username = COALESCE(EXCLUDED.username, volunteers.username),
                phone_number = COALESCE(EXCLUDED.phone_number, volunteers.phone_number),
                phone_verified = volunteers.phone_verified OR EXCLUDED.phone_verified,
                updated_at = NOW()
            "#,
        )
        .bind(&registration.id)
        .bind(&registration.first_name)
        .bind(&registration.last_name)
        .bind(&registration.username)
        .bind(&registration.phone)
        .bind(registration.phone.is_some())
        .execute(&self.pool)
        .await?;

        info!(volunteer_id = %registration.id, "Volunteer registered");
        Ok(())
    }

    #[instrument(skip(self, description))]
    async fn create_or_resume_submission(
        &self,
        volunteer_id: &str,
        file_id: &str,
        description: Option<&str>,
    ) -> Result<SubmissionOutcome, StoreError> {
        let retryable: Vec<String> = RETRYABLE_STATUSES.iter().map(|s| s.to_string()).collect();

        // One conditional write: insert, or resume only while the row is retryable.
        let upserted: Option<(Uuid, bool)> = sqlx::query_as(
            r#"
            INSERT INTO video_submissions (
                id, volunteer_id, telegram_file_id, status, description,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, 'PROCESSING', NULLIF($4, ''), NOW(), NOW()
            )
            ON CONFLICT (telegram_file_id) DO UPDATE SET
                status = 'PROCESSING',
                description = COALESCE(EXCLUDED.description, video_submissions.description),
                decline_reason = NULL,
                updated_at = NOW()
            WHERE video_submissions.status = ANY($5)
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(volunteer_id)
        .bind(file_id)
        .bind(description)
        .bind(&retryable)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id, inserted)) = upserted {
            if inserted {
                info!(submission_id = %id, "Created submission");
                return Ok(SubmissionOutcome::Created(id));
            }
            info!(submission_id = %id, "Resumed submission");
            return Ok(SubmissionOutcome::Resumed(id));
        }

        let existing: Option<(Uuid, String)> = sqlx::query_as(
            "SELECT id, status FROM video_submissions WHERE telegram_file_id = $1",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some((id, status)) => {
                warn!(submission_id = %id, status = %status, "Duplicate submission");
                Ok(SubmissionOutcome::Duplicate {
                    id,
                    status: SubmissionStatus::parse(&status),
                })
            }
            None => Err(StoreError::Conflict(file_id.to_string())),
        }
    }

    #[instrument(skip(self, reason))]
    async fn update_status(
        &self,
        submission_id: Uuid,
        status: SubmissionStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE video_submissions
            SET status = $1, decline_reason = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(submission_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(submission_id));
        }

        debug!(submission_id = %submission_id, status = %status, "Submission status updated");
        Ok(())
    }

    async fn get_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<SubmissionView>, StoreError> {
        let row = sqlx::query_as::<_, SubmissionRow>(
            r#"
            SELECT s.id, s.volunteer_id, s.telegram_file_id, s.status,
                   s.description, s.decline_reason, s.video_url,
                   s.created_at, s.updated_at,
                   v.first_name AS volunteer_first_name,
                   v.last_name AS volunteer_last_name,
                   v.username AS volunteer_username
            FROM video_submissions s
            LEFT JOIN volunteers v ON v.id = s.volunteer_id
            WHERE s.id = $1
            "#,
        )
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SubmissionView::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySubmissionStore;

    #[test]
    fn test_status_round_trip_and_synonyms() {
        assert_eq!(SubmissionStatus::parse("PROCESSING"), SubmissionStatus::Processing);
        assert_eq!(SubmissionStatus::parse("DECLINED"), SubmissionStatus::Failed);
        assert_eq!(SubmissionStatus::Failed.as_str(), "FAILED");
        assert_eq!(
            SubmissionStatus::parse("APPROVED"),
            SubmissionStatus::Other("APPROVED".to_string())
        );
        assert!(!SubmissionStatus::parse("APPROVED").is_retryable());
        assert!(!SubmissionStatus::PendingReview.is_retryable());
    }

    #[test]
    fn test_retryable_statuses_match_enum() {
        for status in RETRYABLE_STATUSES {
            assert!(SubmissionStatus::parse(status).is_retryable());
        }
    }

    #[test]
    fn test_normalize_database_url() {
        assert_eq!(
            normalize_database_url("postgresql+asyncpg://u:p@db/intake").unwrap(),
            "postgresql://u:p@db/intake"
        );
        assert_eq!(
            normalize_database_url("postgres://db/intake").unwrap(),
            "postgres://db/intake"
        );
        assert!(normalize_database_url("sqlite://intake.db").is_err());
    }

    #[test]
    fn test_registration_splits_display_name() {
        let reg = VolunteerRegistration::from_display_name("42", "Ada King Lovelace", None, None);
        assert_eq!(reg.first_name, "Ada");
        assert_eq!(reg.last_name.as_deref(), Some("King Lovelace"));

        let reg = VolunteerRegistration::from_display_name("42", "", None, None);
        assert_eq!(reg.first_name, "Unknown");
        assert!(reg.last_name.is_none());
    }

    #[tokio::test]
    async fn test_new_file_creates_processing_row() {
        let store = MemorySubmissionStore::new();
        let outcome = store
            .create_or_resume_submission("7", "file-a", Some("street flooding"))
            .await
            .unwrap();

        let id = match outcome {
            SubmissionOutcome::Created(id) => id,
            other => panic!("expected Created, got {:?}", other),
        };
        let row = store.get_submission(id).await.unwrap().unwrap();
        assert_eq!(row.status, SubmissionStatus::Processing);
        assert_eq!(row.description.as_deref(), Some("street flooding"));
    }

    #[tokio::test]
    async fn test_retry_while_processing_returns_same_id() {
        let store = MemorySubmissionStore::new();
        let first = store
            .create_or_resume_submission("7", "file-a", Some("first"))
            .await
            .unwrap();
        let second = store
            .create_or_resume_submission("7", "file-a", Some("second"))
            .await
            .unwrap();
        let third = store
            .create_or_resume_submission("7", "file-a", None)
            .await
            .unwrap();

        let id = first.submission_id().unwrap();
        assert_eq!(second, SubmissionOutcome::Resumed(id));
        assert_eq!(third, SubmissionOutcome::Resumed(id));

        let row = store.get_submission(id).await.unwrap().unwrap();
        assert_eq!(row.description.as_deref(), Some("second"));
        assert_eq!(store.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_caption_keeps_description() {
        let store = MemorySubmissionStore::new();
        let id = store
            .create_or_resume_submission("7", "file-a", Some(""))
            .await
            .unwrap()
            .submission_id()
            .unwrap();
        assert!(store.get_submission(id).await.unwrap().unwrap().description.is_none());

        store
            .create_or_resume_submission("7", "file-a", Some("bridge"))
            .await
            .unwrap();
        store
            .create_or_resume_submission("7", "file-a", Some(""))
            .await
            .unwrap();

        let row = store.get_submission(id).await.unwrap().unwrap();
        assert_eq!(row.description.as_deref(), Some("bridge"));
    }

    #[tokio::test]
    async fn test_retry_after_failure_clears_reason() {
        let store = MemorySubmissionStore::new();
        let id = store
            .create_or_resume_submission("7", "file-a", None)
            .await
            .unwrap()
            .submission_id()
            .unwrap();
        store
            .update_status(id, SubmissionStatus::Failed, Some("upload timed out"))
            .await
            .unwrap();

        let outcome = store
            .create_or_resume_submission("7", "file-a", None)
            .await
            .unwrap();
        assert_eq!(outcome, SubmissionOutcome::Resumed(id));

        let row = store.get_submission(id).await.unwrap().unwrap();
        assert_eq!(row.status, SubmissionStatus::Processing);
        assert!(row.decline_reason.is_none());
    }

    #[tokio::test]
    async fn test_completed_submission_is_duplicate_and_untouched() {
        let store = MemorySubmissionStore::new();
        let id = store
            .create_or_resume_submission("7", "file-a", Some("original"))
            .await
            .unwrap()
            .submission_id()
            .unwrap();
        store
            .update_status(id, SubmissionStatus::PendingReview, None)
            .await
            .unwrap();
        store.set_video_url(id, "https://cdn.example.com/v/1.mp4");
        let before = store.get_submission(id).await.unwrap().unwrap();

        let outcome = store
            .create_or_resume_submission("7", "file-a", Some("changed"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SubmissionOutcome::Duplicate {
                id,
                status: SubmissionStatus::PendingReview
            }
        );
        assert_eq!(outcome.submission_id(), None);

        let after = store.get_submission(id).await.unwrap().unwrap();
        assert_eq!(after.description, before.description);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_downstream_status_blocks_retry() {
        let store = MemorySubmissionStore::new();
        let id = store
            .create_or_resume_submission("7", "file-a", None)
            .await
            .unwrap()
            .submission_id()
            .unwrap();
        store
            .update_status(id, SubmissionStatus::Other("APPROVED".to_string()), None)
            .await
            .unwrap();

        let outcome = store
            .create_or_resume_submission("7", "file-a", None)
            .await
            .unwrap();
        assert!(matches!(outcome, SubmissionOutcome::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_update_status_unknown_id() {
        let store = MemorySubmissionStore::new();
        let missing = Uuid::new_v4();
        let err = store
            .update_status(missing, SubmissionStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_volunteer_upsert_keeps_existing_contact() {
        let store = MemorySubmissionStore::new();
        assert!(store.find_volunteer("7").await.unwrap().is_none());

        store
            .register_or_update_volunteer(&VolunteerRegistration {
                id: "7".to_string(),
                first_name: "Ada".to_string(),
                last_name: None,
                username: Some("ada".to_string()),
                phone: Some("+15550100".to_string()),
            })
            .await
            .unwrap();
        store
            .register_or_update_volunteer(&VolunteerRegistration {
                id: "7".to_string(),
                first_name: "Ada".to_string(),
                last_name: None,
                username: None,
                phone: None,
            })
            .await
            .unwrap();

        let volunteer = store.find_volunteer("7").await.unwrap().unwrap();
        assert_eq!(volunteer.phone_number.as_deref(), Some("+15550100"));
        assert_eq!(volunteer.username.as_deref(), Some("ada"));
        assert!(volunteer.phone_verified);
    }

    async fn registered_store(pool: PgPool) -> PgSubmissionStore {
        let store = PgSubmissionStore::from_pool(pool);
        store
            .register_or_update_volunteer(&VolunteerRegistration::from_display_name(
                "7",
                "Ada Lovelace",
                Some("ada".to_string()),
                None,
            ))
            .await
            .unwrap();
        store
    }

    #[sqlx::test(migrator = "crate::submission_store::MIGRATOR")]
    async fn test_pg_retry_while_processing_resumes_row(pool: PgPool) {
        let store = registered_store(pool).await;

        let first = store
            .create_or_resume_submission("7", "file-a", Some("first"))
            .await
            .unwrap();
        let id = match first {
            SubmissionOutcome::Created(id) => id,
            other => panic!("expected Created, got {:?}", other),
        };

        let second = store
            .create_or_resume_submission("7", "file-a", Some("second"))
            .await
            .unwrap();
        let third = store
            .create_or_resume_submission("7", "file-a", Some(""))
            .await
            .unwrap();
        let fourth = store
            .create_or_resume_submission("7", "file-a", None)
            .await
            .unwrap();
        assert_eq!(second, SubmissionOutcome::Resumed(id));
        assert_eq!(third, SubmissionOutcome::Resumed(id));
        assert_eq!(fourth, SubmissionOutcome::Resumed(id));

        let row = store.get_submission(id).await.unwrap().unwrap();
        assert_eq!(row.status, SubmissionStatus::Processing);
        assert_eq!(row.description.as_deref(), Some("second"));
        assert_eq!(row.volunteer_first_name.as_deref(), Some("Ada"));
        assert_eq!(row.volunteer_username.as_deref(), Some("ada"));
    }

    #[sqlx::test(migrator = "crate::submission_store::MIGRATOR")]
    async fn test_pg_empty_caption_stores_null(pool: PgPool) {
        let store = registered_store(pool).await;

        let id = store
            .create_or_resume_submission("7", "file-a", Some(""))
            .await
            .unwrap()
            .submission_id()
            .unwrap();

        let row = store.get_submission(id).await.unwrap().unwrap();
        assert!(row.description.is_none());
    }

    #[sqlx::test(migrator = "crate::submission_store::MIGRATOR")]
    async fn test_pg_retry_after_failure_clears_reason(pool: PgPool) {
        let store = registered_store(pool).await;
        let id = store
            .create_or_resume_submission("7", "file-a", None)
            .await
            .unwrap()
            .submission_id()
            .unwrap();
        store
            .update_status(id, SubmissionStatus::Failed, Some("upload timed out"))
            .await
            .unwrap();

        let outcome = store
            .create_or_resume_submission("7", "file-a", None)
            .await
            .unwrap();
        assert_eq!(outcome, SubmissionOutcome::Resumed(id));

        let row = store.get_submission(id).await.unwrap().unwrap();
        assert_eq!(row.status, SubmissionStatus::Processing);
        assert!(row.decline_reason.is_none());
    }

    #[sqlx::test(migrator = "crate::submission_store::MIGRATOR")]
    async fn test_pg_completed_submission_is_duplicate_and_untouched(pool: PgPool) {
        let store = registered_store(pool.clone()).await;
        let id = store
            .create_or_resume_submission("7", "file-a", Some("original"))
            .await
            .unwrap()
            .submission_id()
            .unwrap();
        store
            .update_status(id, SubmissionStatus::PendingReview, None)
            .await
            .unwrap();
        sqlx::query("UPDATE video_submissions SET video_url = $1 WHERE id = $2")
            .bind("https://cdn.example.com/v/1.mp4")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
        let before = store.get_submission(id).await.unwrap().unwrap();

        let outcome = store
            .create_or_resume_submission("7", "file-a", Some("changed"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SubmissionOutcome::Duplicate {
                id,
                status: SubmissionStatus::PendingReview
            }
        );

        let after = store.get_submission(id).await.unwrap().unwrap();
        assert_eq!(after.description.as_deref(), Some("original"));
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.video_url, before.video_url);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM video_submissions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[sqlx::test(migrator = "crate::submission_store::MIGRATOR")]
    async fn test_pg_update_status_unknown_id(pool: PgPool) {
        let store = PgSubmissionStore::from_pool(pool);
        let missing = Uuid::new_v4();

        let err = store
            .update_status(missing, SubmissionStatus::Failed, Some("gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == missing));
    }
}
