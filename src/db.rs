//! Persistence layer for the Parley pairing server using SQLite
//!
//! Stores moderation state only: bans and reputation, filter violations,
//! filter rules and whitelists, and connection blocklists. Chat content is
//! never persisted beyond the violation excerpts the filter records.

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePool, Row};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::models::{BanRecord, FilterRule, FilterViolation};

/// Retry a transient-failure-prone store operation.
///
/// 3 attempts, 100ms base delay, doubling. Used for the operations that gate
/// correctness: ban lookups, report and ban writes.
pub async fn with_retry<T, F, Fut>(label: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(100);
    let mut last_err = None;

    for attempt in 0..3u32 {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(%label, attempt = attempt + 1, "store operation failed: {err:#}");
                last_err = Some(err);
            }
        }
    }

    Err(last_err.expect("at least one attempt ran"))
}

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection to the specified file path
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let in_memory = db_path.as_ref().to_str() == Some(":memory:");

        // A pooled :memory: database is one database per connection, so the
        // in-memory form is pinned to a single connection.
        let pool = if in_memory {
            sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .context("Failed to open in-memory SQLite database")?
        } else {
            SqlitePool::connect(&format!("sqlite:{}?mode=rwc", db_path.as_ref().display()))
                .await
                .context("Failed to connect to SQLite database")?
        };

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run database migrations to create or update schema
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bans (
                identity_hash TEXT PRIMARY KEY NOT NULL,
                report_count INTEGER NOT NULL DEFAULT 0,
                banned_until INTEGER,
                reputation_score INTEGER NOT NULL DEFAULT 100,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create bans table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS violations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity_hash TEXT NOT NULL,
                rule_matched TEXT NOT NULL,
                raw_text TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create violations table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS filter_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern TEXT NOT NULL,
                is_regex INTEGER NOT NULL DEFAULT 0,
                severity INTEGER NOT NULL,
                position INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create filter_rules table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS whitelist_phrases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phrase TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create whitelist_phrases table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS banned_ranges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cidr TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create banned_ranges table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS banned_countries (
                code TEXT PRIMARY KEY NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create banned_countries table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS review_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity_hash TEXT NOT NULL,
                text TEXT NOT NULL,
                score REAL NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create review_queue table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_violations_identity ON violations (identity_hash, created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_filter_rules_position ON filter_rules (position)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bans_banned_until ON bans (banned_until)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ── Bans and reputation ──

    /// Fetch the ban/reputation record for an identity, if any.
    pub async fn get_ban_status(&self, identity_hash: &str) -> Result<Option<BanRecord>> {
        let row = sqlx::query(
            "SELECT identity_hash, report_count, banned_until, reputation_score
             FROM bans WHERE identity_hash = ?",
        )
        .bind(identity_hash)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query ban status")?;

        Ok(row.map(|r| BanRecord {
            identity_hash: r.get("identity_hash"),
            report_count: r.get("report_count"),
            banned_until: r.get("banned_until"),
            reputation_score: r.get("reputation_score"),
        }))
    }

    /// Increment the report counter for an identity, creating the record at 1.
    /// Returns the new count.
    pub async fn upsert_report(&self, identity_hash: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO bans (identity_hash, report_count, updated_at)
            VALUES (?, 1, ?)
            ON CONFLICT(identity_hash)
            DO UPDATE SET report_count = report_count + 1, updated_at = excluded.updated_at
            RETURNING report_count
            "#,
        )
        .bind(identity_hash)
        .bind(now_secs())
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert report")?;

        Ok(row.get("report_count"))
    }

    /// Set a ban expiring at `banned_until` (Unix seconds).
    pub async fn upsert_ban(&self, identity_hash: &str, banned_until: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bans (identity_hash, banned_until, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(identity_hash)
            DO UPDATE SET banned_until = excluded.banned_until, updated_at = excluded.updated_at
            "#,
        )
        .bind(identity_hash)
        .bind(banned_until)
        .bind(now_secs())
        .execute(&self.pool)
        .await
        .context("Failed to upsert ban")?;

        Ok(())
    }

    /// Lift a ban and restore reputation to the given default.
    pub async fn remove_ban(&self, identity_hash: &str, default_reputation: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE bans SET banned_until = NULL, reputation_score = ?, updated_at = ?
             WHERE identity_hash = ?",
        )
        .bind(default_reputation)
        .bind(now_secs())
        .bind(identity_hash)
        .execute(&self.pool)
        .await
        .context("Failed to remove ban")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_reputation(&self, identity_hash: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT reputation_score FROM bans WHERE identity_hash = ?")
            .bind(identity_hash)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query reputation")?;

        Ok(row.map(|r| r.get("reputation_score")))
    }

    /// Apply a (negative) reputation delta, clamped to [0, 100].
    pub async fn update_reputation(&self, identity_hash: &str, delta: i64) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO bans (identity_hash, reputation_score, updated_at)
            VALUES (?, MAX(0, MIN(100, 100 + ?)), ?)
            ON CONFLICT(identity_hash)
            DO UPDATE SET
                reputation_score = MAX(0, MIN(100, reputation_score + ?)),
                updated_at = excluded.updated_at
            RETURNING reputation_score
            "#,
        )
        .bind(identity_hash)
        .bind(delta)
        .bind(now_secs())
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .context("Failed to update reputation")?;

        Ok(row.get("reputation_score"))
    }

    // ── Violations ──

    /// Persist a batch of violations inside one transaction.
    pub async fn insert_violation_batch(&self, batch: &[FilterViolation]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin violation batch transaction")?;

        for v in batch {
            sqlx::query(
                "INSERT INTO violations (identity_hash, rule_matched, raw_text, created_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&v.identity_hash)
            .bind(&v.rule_matched)
            .bind(&v.raw_text)
            .bind(v.created_at)
            .execute(&mut *tx)
            .await
            .context("Failed to insert violation")?;
        }

        tx.commit()
            .await
            .context("Failed to commit violation batch")?;
        Ok(())
    }

    /// Count persisted violations for an identity since a Unix timestamp.
    pub async fn count_violations_since(&self, identity_hash: &str, since: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM violations WHERE identity_hash = ? AND created_at >= ?",
        )
        .bind(identity_hash)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count violations")?;

        Ok(row.get("n"))
    }

    // ── Filter rules and whitelist ──

    pub async fn get_filter_rules(&self) -> Result<Vec<FilterRule>> {
        let rows = sqlx::query(
            "SELECT id, pattern, is_regex, severity FROM filter_rules ORDER BY position, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to query filter rules")?;

        Ok(rows
            .into_iter()
            .map(|r| FilterRule {
                id: r.get("id"),
                pattern: r.get("pattern"),
                is_regex: r.get::<i64, _>("is_regex") != 0,
                severity: r.get::<i64, _>("severity") as u8,
            })
            .collect())
    }

    pub async fn add_filter_rule(
        &self,
        pattern: &str,
        is_regex: bool,
        severity: u8,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO filter_rules (pattern, is_regex, severity, position)
            VALUES (?, ?, ?, COALESCE((SELECT MAX(position) + 1 FROM filter_rules), 0))
            RETURNING id
            "#,
        )
        .bind(pattern)
        .bind(is_regex as i64)
        .bind(severity as i64)
        .fetch_one(&self.pool)
        .await
        .context("Failed to add filter rule")?;

        Ok(row.get("id"))
    }

    pub async fn remove_filter_rule(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM filter_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to remove filter rule")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_whitelist(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT phrase FROM whitelist_phrases ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to query whitelist")?;

        Ok(rows.into_iter().map(|r| r.get("phrase")).collect())
    }

    pub async fn add_whitelist_phrase(&self, phrase: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO whitelist_phrases (phrase) VALUES (?)")
            .bind(phrase)
            .execute(&self.pool)
            .await
            .context("Failed to add whitelist phrase")?;
        Ok(())
    }

    // ── Blocklists ──

    pub async fn get_banned_ranges(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT cidr FROM banned_ranges ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to query banned ranges")?;

        Ok(rows.into_iter().map(|r| r.get("cidr")).collect())
    }

    pub async fn add_banned_range(&self, cidr: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO banned_ranges (cidr) VALUES (?)")
            .bind(cidr)
            .execute(&self.pool)
            .await
            .context("Failed to add banned range")?;
        Ok(())
    }

    pub async fn remove_banned_range(&self, cidr: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM banned_ranges WHERE cidr = ?")
            .bind(cidr)
            .execute(&self.pool)
            .await
            .context("Failed to remove banned range")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_banned_countries(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT code FROM banned_countries ORDER BY code")
            .fetch_all(&self.pool)
            .await
            .context("Failed to query banned countries")?;

        Ok(rows.into_iter().map(|r| r.get("code")).collect())
    }

    pub async fn add_banned_country(&self, code: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO banned_countries (code) VALUES (?)")
            .bind(code)
            .execute(&self.pool)
            .await
            .context("Failed to add banned country")?;
        Ok(())
    }

    // ── Review queue ──

    /// Queue a borderline-scored message for human review.
    pub async fn enqueue_review(&self, identity_hash: &str, text: &str, score: f64) -> Result<()> {
        sqlx::query(
            "INSERT INTO review_queue (identity_hash, text, score, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(identity_hash)
        .bind(text)
        .bind(score)
        .bind(now_secs())
        .execute(&self.pool)
        .await
        .context("Failed to enqueue review")?;
        Ok(())
    }

    /// Close the pool. Final step of shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}
