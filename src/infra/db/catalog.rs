use async_trait::async_trait;

use crate::application::repos::{CatalogMatch, CatalogRepo, RepoError};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct CatalogRow {
    path: String,
    identity: i64,
}

#[async_trait]
impl CatalogRepo for PostgresRepositories {
    async fn find_by_paths(&self, paths: &[String]) -> Result<Vec<CatalogMatch>, RepoError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: Vec<String> = paths
            .iter()
            .map(|path| path.trim_start_matches('/').to_lowercase())
            .collect();

        let rows = sqlx::query_as::<_, CatalogRow>(
            r#"
            SELECT lower(ltrim(path, '/')) AS path, identity
            FROM catalog_resources
            WHERE lower(ltrim(path, '/')) = ANY($1)
            ORDER BY identity
            "#,
        )
        .bind(wanted)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|row| CatalogMatch {
                path: row.path,
                identity: row.identity,
            })
            .collect())
    }
}
