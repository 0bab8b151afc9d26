//! Keyword (sparse) index over record content.
//!
//! Records are loaded into an in-memory SQLite FTS5 table whose rowid is the
//! record's position in the corpus. Queries are ranked with FTS5's built-in
//! `rank` (BM25), best first.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

use aem_rag_core::models::FlatRecord;

pub struct KeywordIndex {
    pool: SqlitePool,
    len: usize,
}

impl KeywordIndex {
    /// Index the content of `records`, keyed by position.
    pub async fn build(records: &[FlatRecord]) -> Result<Self> {
        // One long-lived connection: an in-memory database lives and dies
        // with its connection.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query("CREATE VIRTUAL TABLE records_fts USING fts5(content, tokenize = 'unicode61')")
            .execute(&pool)
            .await?;

        let mut tx = pool.begin().await?;
        for (position, record) in records.iter().enumerate() {
            sqlx::query("INSERT INTO records_fts(rowid, content) VALUES (?, ?)")
                .bind(position as i64)
                .bind(&record.content)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::debug!(records = records.len(), "keyword index built");
        Ok(Self {
            pool,
            len: records.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Top-`k` record positions for `query`, best first.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<usize>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT rowid FROM records_fts WHERE records_fts MATCH ? ORDER BY rank LIMIT ?",
        )
        .bind(&fts)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| row.get::<i64, _>("rowid") as usize)
            .collect())
    }
}

/// Turn free text into an FTS5 expression: each word quoted, joined by `OR`.
///
/// Returns `None` when the text has no searchable words.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<FlatRecord> {
        vec![
            FlatRecord::new("/a", "jcr:title: Hero banner\ntext: Summer sale", None),
            FlatRecord::new("/b", "jcr:title: Footer\ntext: Contact us", None),
            FlatRecord::new("/c", "sling:resourceType: weretail/components/hero", None),
        ]
    }

    #[test]
    fn query_quotes_terms() {
        assert_eq!(
            fts_query("hero: banner?").as_deref(),
            Some("\"hero\" OR \"banner\"")
        );
        assert_eq!(fts_query("  ?! "), None);
    }

    #[tokio::test]
    async fn ranks_matching_records() {
        let index = KeywordIndex::build(&records()).await.unwrap();
        assert_eq!(index.len(), 3);

        let hits = index.search("hero banner", 4).await.unwrap();
        assert_eq!(hits.first(), Some(&0));
        assert!(hits.contains(&2));
        assert!(!hits.contains(&1));
    }

    #[tokio::test]
    async fn k_limits_results_and_no_match_is_empty() {
        let index = KeywordIndex::build(&records()).await.unwrap();
        assert_eq!(index.search("hero", 1).await.unwrap().len(), 1);
        assert!(index.search("nonexistentword", 4).await.unwrap().is_empty());
        assert!(index.search("...", 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn operator_words_are_treated_as_text() {
        let index = KeywordIndex::build(&records()).await.unwrap();
        let hits = index.search("footer AND NOT contact", 4).await.unwrap();
        assert_eq!(hits, vec![1]);
    }
}
