//! SQLite-backed [`VersionStore`] implementation.
//!
//! Documents are rows of the `documents` table created by
//! [`run_migrations`](crate::migrate::run_migrations); the open `data` bag
//! is stored as JSON text and filtered with `json_extract`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};

use crate::store::{DocFilter, Document, VersionStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// `WHERE` clause plus its positional bind values, all text.
fn where_clause(filter: &DocFilter) -> Result<(String, Vec<String>)> {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();

    if let Some(t) = filter.doc_type {
        clauses.push("type = ?".to_string());
        binds.push(t.as_str().to_string());
    }
    if let Some(parent) = &filter.parent {
        clauses.push("parent = ?".to_string());
        binds.push(parent.clone());
    }
    if let Some(name) = &filter.name {
        clauses.push("name = ?".to_string());
        binds.push(name.clone());
    }
    for (key, value) in &filter.data_eq {
        clauses.push("json_extract(data, ?) = json_extract(?, '$')".to_string());
        binds.push(json_path(key)?);
        binds.push(value.to_string());
    }

    if clauses.is_empty() {
        Ok((String::new(), binds))
    } else {
        Ok((format!(" WHERE {}", clauses.join(" AND ")), binds))
    }
}

fn json_path(key: &str) -> Result<String> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("Unsupported data key in filter: '{}'", key);
    }
    Ok(format!("$.{}", key))
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let doc_type: String = row.get("type");
    let data: String = row.get("data");
    let data: Map<String, Value> =
        serde_json::from_str(&data).context("Corrupt document data in store")?;
    Ok(Document {
        id: row.get("id"),
        doc_type: doc_type.parse()?,
        parent: row.get("parent"),
        name: row.get("name"),
        data,
    })
}

#[async_trait]
impl VersionStore for SqliteStore {
    async fn find_one(&self, filter: &DocFilter) -> Result<Option<Document>> {
        let (clause, binds) = where_clause(filter)?;
        let sql = format!(
            "SELECT id, type, parent, name, data FROM documents{} ORDER BY rowid LIMIT 1",
            clause
        );
        let mut query = sqlx::query(&sql);
        for b in binds {
            query = query.bind(b);
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find(&self, filter: &DocFilter) -> Result<Vec<Document>> {
        let (clause, binds) = where_clause(filter)?;
        let sql = format!(
            "SELECT id, type, parent, name, data FROM documents{} ORDER BY rowid",
            clause
        );
        let mut query = sqlx::query(&sql);
        for b in binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn insert_one(&self, doc: Document) -> Result<String> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, type, parent, name, data, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(doc.doc_type.as_str())
        .bind(&doc.parent)
        .bind(&doc.name)
        .bind(serde_json::to_string(&doc.data)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert {} '{}'", doc.doc_type, doc.name))?;

        Ok(doc.id)
    }

    async fn update_many(&self, filter: &DocFilter, set: &Map<String, Value>) -> Result<u64> {
        if set.is_empty() {
            return Ok(0);
        }
        let mut assignments = Vec::new();
        let mut set_binds = Vec::new();
        for (key, value) in set {
            assignments.push("?, json(?)");
            set_binds.push(json_path(key)?);
            set_binds.push(value.to_string());
        }
        let (clause, where_binds) = where_clause(filter)?;
        let sql = format!(
            "UPDATE documents SET data = json_set(data, {}){}",
            assignments.join(", "),
            clause
        );

        let mut query = sqlx::query(&sql);
        for b in set_binds.into_iter().chain(where_binds) {
            query = query.bind(b);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocType;
    use serde_json::json;

    #[test]
    fn test_where_clause_binds_in_order() {
        let filter = DocFilter::of(DocType::Version)
            .id_parent("s1")
            .data_eq("instanceId", json!("abc"));
        let (clause, binds) = where_clause(&filter).unwrap();
        assert!(clause.starts_with(" WHERE type = ? AND parent = ?"));
        assert_eq!(binds, vec!["version", "s1", "$.instanceId", "\"abc\""]);
    }

    #[test]
    fn test_empty_filter_has_no_where() {
        let (clause, binds) = where_clause(&DocFilter::default()).unwrap();
        assert!(clause.is_empty());
        assert!(binds.is_empty());
    }

    #[test]
    fn test_rejects_unsafe_keys() {
        let filter = DocFilter::default().data_eq("a'; DROP", json!(1));
        assert!(where_clause(&filter).is_err());
    }
}
