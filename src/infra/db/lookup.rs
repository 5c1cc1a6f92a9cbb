use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use time::OffsetDateTime;
use tracing::warn;

use crate::{
    application::repos::{LookupRepo, RepairReport, RepoError},
    domain::{
        entities::{Identity, LookupEntryRecord},
        keys::{KeyHash, normalize},
    },
};

use super::{PostgresRepositories, map_sqlx_error};

const SOURCE: &str = "infra::db::lookup";
const UNIQUE_INDEX: &str = "lookup_entries_key_hash_key";

#[derive(sqlx::FromRow)]
struct LookupEntryRow {
    id: i64,
    key_hash: Option<String>,
    key_prefix: String,
    identity: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<LookupEntryRow> for LookupEntryRecord {
    fn from(row: LookupEntryRow) -> Self {
        Self {
            id: row.id,
            key_hash: row.key_hash.unwrap_or_default(),
            key_prefix: row.key_prefix,
            identity: row.identity,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HashIdentityRow {
    key_hash: String,
    identity: i64,
}

#[derive(sqlx::FromRow)]
struct LegacyRow {
    id: i64,
    key_prefix: String,
}

#[async_trait]
impl LookupRepo for PostgresRepositories {
    async fn upsert_entry(
        &self,
        hash: &KeyHash,
        key_prefix: &str,
        identity: Identity,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO lookup_entries (key_hash, key_prefix, identity, created_at, updated_at)
            VALUES ($1, $2, $3, now(), now())
            ON CONFLICT (key_hash) DO UPDATE
            SET key_prefix = EXCLUDED.key_prefix,
                identity = EXCLUDED.identity,
                updated_at = now()
            "#,
        )
        .bind(hash.as_str())
        .bind(key_prefix)
        .bind(identity)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn find_identity(&self, hash: &KeyHash) -> Result<Option<Identity>, RepoError> {
        sqlx::query_scalar::<_, i64>("SELECT identity FROM lookup_entries WHERE key_hash = $1")
            .bind(hash.as_str())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn find_identities(
        &self,
        hashes: &[KeyHash],
    ) -> Result<HashMap<KeyHash, Identity>, RepoError> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let values: Vec<&str> = hashes.iter().map(KeyHash::as_str).collect();

        let rows = sqlx::query_as::<_, HashIdentityRow>(
            "SELECT key_hash, identity FROM lookup_entries WHERE key_hash = ANY($1)",
        )
        .bind(values)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            match KeyHash::from_hex(&row.key_hash) {
                Some(hash) => {
                    found.insert(hash, row.identity);
                }
                None => warn!(
                    target = SOURCE,
                    key_hash = %row.key_hash,
                    "ignoring malformed key hash"
                ),
            }
        }
        Ok(found)
    }

    async fn delete_by_identity(&self, identity: Identity) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM lookup_entries WHERE identity = $1")
            .bind(identity)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        limit: u32,
    ) -> Result<Vec<LookupEntryRecord>, RepoError> {
        let rows = sqlx::query_as::<_, LookupEntryRow>(
            r#"
            SELECT id, key_hash, key_prefix, identity, created_at, updated_at
            FROM lookup_entries
            WHERE key_prefix LIKE $1 ESCAPE '\'
            ORDER BY key_prefix, id
            LIMIT $2
            "#,
        )
        .bind(format!("{}%", escape_like(prefix)))
        .bind(Self::clamp_limit(limit, 1_000))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(LookupEntryRecord::from).collect())
    }

    async fn repair_uniqueness(&self) -> Result<RepairReport, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let mut report = RepairReport::default();

        let constraint_present = unique_index_exists(&mut tx).await?;
        if !constraint_present {
            // Nothing enforces uniqueness yet, so hash everything first and dedupe after.
            report.hashed = hash_legacy_rows(&mut tx, false).await?;
            report.duplicates_removed = delete_duplicates(&mut tx).await?;
            sqlx::query(&format!(
                "CREATE UNIQUE INDEX {UNIQUE_INDEX} ON lookup_entries (key_hash)"
            ))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            report.constraint_installed = true;
        } else {
            let before = count_rows(&mut tx).await?;
            report.hashed = hash_legacy_rows(&mut tx, true).await?;
            let after = count_rows(&mut tx).await?;
            report.duplicates_removed = PostgresRepositories::convert_count(before - after)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(report)
    }
}

async fn unique_index_exists(tx: &mut Transaction<'_, Postgres>) -> Result<bool, RepoError> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM pg_indexes WHERE tablename = 'lookup_entries' AND indexname = $1)",
    )
    .bind(UNIQUE_INDEX)
    .fetch_one(&mut **tx)
    .await
    .map_err(map_sqlx_error)
}

async fn count_rows(tx: &mut Transaction<'_, Postgres>) -> Result<i64, RepoError> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM lookup_entries")
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx_error)
}

/// Hash rows written before `key_hash` existed.
///
/// Under an enforced index the lowest id still wins: newer rows already holding the hash
/// are removed first, and a legacy row that finds an older holder is removed instead.
async fn hash_legacy_rows(
    tx: &mut Transaction<'_, Postgres>,
    enforced: bool,
) -> Result<u64, RepoError> {
    let legacy = sqlx::query_as::<_, LegacyRow>(
        "SELECT id, key_prefix FROM lookup_entries WHERE key_hash IS NULL ORDER BY id",
    )
    .fetch_all(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;

    let mut hashed = 0u64;
    for row in legacy {
        let hash = match normalize(&row.key_prefix) {
            Ok(key) => key.hash(),
            Err(_) => KeyHash::of(&row.key_prefix),
        };

        if enforced {
            sqlx::query("DELETE FROM lookup_entries WHERE key_hash = $1 AND id > $2")
                .bind(hash.as_str())
                .bind(row.id)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        let updated = if enforced {
            sqlx::query(
                r#"
                UPDATE lookup_entries SET key_hash = $1, updated_at = now()
                WHERE id = $2
                  AND NOT EXISTS (SELECT 1 FROM lookup_entries WHERE key_hash = $1)
                "#,
            )
        } else {
            sqlx::query("UPDATE lookup_entries SET key_hash = $1, updated_at = now() WHERE id = $2")
        }
        .bind(hash.as_str())
        .bind(row.id)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();

        if updated == 1 {
            hashed += 1;
        } else {
            sqlx::query("DELETE FROM lookup_entries WHERE id = $1")
                .bind(row.id)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx_error)?;
        }
    }
    Ok(hashed)
}

async fn delete_duplicates(tx: &mut Transaction<'_, Postgres>) -> Result<u64, RepoError> {
    let result = sqlx::query(
        r#"
        DELETE FROM lookup_entries newer
        USING lookup_entries older
        WHERE newer.key_hash = older.key_hash
          AND newer.id > older.id
        "#,
    )
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;
    Ok(result.rows_affected())
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(escape_like("uploads/a_b%c"), "uploads/a\\_b\\%c");
        assert_eq!(escape_like("plain"), "plain");
    }
}
