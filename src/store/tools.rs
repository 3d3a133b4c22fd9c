//! Tool records, their vectors, and the similarity scan.
//!
//! Every tool record has exactly one vector row, linked through
//! `tool_mapping`. All multi-row writes are transactional so a failure
//! leaves no partial state.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{now_rfc3339, vector, Store};
use crate::error::{BrokerError, BrokerResult};

#[derive(Debug, Clone, Serialize)]
pub struct ToolRow {
    pub id: i64,
    pub tool_md5: String,
    pub model_name: String,
    pub display_name: String,
    pub description: String,
    pub created_at: String,
    pub updated_at: String,
}

/// One hit from the similarity scan.
#[derive(Debug, Clone)]
pub struct SimilarTool {
    pub tool_id: i64,
    pub tool_md5: String,
    pub display_name: String,
    pub description: String,
    pub distance: f64,
    pub similarity: f64,
    pub created_at: String,
}

impl Store {
    /// Insert or update a tool record and give it a fresh vector, atomically.
    /// Any previous vector for the record is replaced.
    pub fn upsert_tool_with_vector(
        &self,
        display_name: &str,
        description: &str,
        tool_md5: &str,
        model_name: &str,
        vector: &[f32],
    ) -> BrokerResult<i64> {
        if vector.len() != self.dim {
            return Err(BrokerError::Shape {
                expected: self.dim,
                got: vector.len(),
            });
        }

        let blob = vector::f32_vec_to_bytes(vector);
        let now = now_rfc3339();

        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO tool_vectors
                    (tool_md5, model_name, display_name, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(tool_md5, model_name) DO UPDATE SET
                    display_name = excluded.display_name,
                    description = excluded.description,
                    updated_at = excluded.updated_at",
                params![tool_md5, model_name, display_name, description, now],
            )?;

            let tool_id: i64 = tx.query_row(
                "SELECT id FROM tool_vectors WHERE tool_md5 = ?1 AND model_name = ?2",
                params![tool_md5, model_name],
                |row| row.get(0),
            )?;

            // Replace any previous vector so the one-to-one invariant holds.
            if let Some(old_rowid) = tx
                .query_row(
                    "SELECT vec_rowid FROM tool_mapping WHERE tool_id = ?1",
                    params![tool_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
            {
                tx.execute(
                    "DELETE FROM vec_tool_embeddings WHERE rowid = ?1",
                    params![old_rowid],
                )?;
                tx.execute("DELETE FROM tool_mapping WHERE tool_id = ?1", params![tool_id])?;
            }

            tx.execute(
                "INSERT INTO vec_tool_embeddings (embedding) VALUES (?1)",
                params![blob],
            )?;
            let vec_rowid = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO tool_mapping (vec_rowid, tool_id) VALUES (?1, ?2)",
                params![vec_rowid, tool_id],
            )?;

            Ok(tool_id)
        })
    }

    pub fn tool_exists(&self, tool_md5: &str, model_name: &str) -> BrokerResult<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tool_vectors WHERE tool_md5 = ?1 AND model_name = ?2",
                params![tool_md5, model_name],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Delete records matching the md5 (optionally scoped to one model),
    /// cascading vector and mapping rows. Returns the number of records
    /// removed.
    pub fn delete_tool_by_md5(
        &self,
        tool_md5: &str,
        model_name: Option<&str>,
    ) -> BrokerResult<usize> {
        self.with_tx(|tx| {
            let ids: Vec<i64> = match model_name {
                Some(model) => {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM tool_vectors WHERE tool_md5 = ?1 AND model_name = ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![tool_md5, model], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt =
                        tx.prepare("SELECT id FROM tool_vectors WHERE tool_md5 = ?1")?;
                    let rows = stmt
                        .query_map(params![tool_md5], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };

            for id in &ids {
                delete_tool_cascade(tx, *id)?;
            }
            Ok(ids.len())
        })
    }

    /// Delete records by id, cascading vector and mapping rows.
    pub fn delete_tools_by_ids(&self, ids: &[i64]) -> BrokerResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_tx(|tx| {
            for id in ids {
                delete_tool_cascade(tx, *id)?;
            }
            Ok(ids.len())
        })
    }

    /// All persisted display names, for the stale-server sweep.
    pub fn list_all_display_names(&self) -> BrokerResult<Vec<(i64, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, display_name FROM tool_vectors ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Persisted tool records whose display name begins with `{server}__`.
    pub fn list_tools_by_server(&self, server: &str) -> BrokerResult<Vec<ToolRow>> {
        let prefix = format!("{}__", server);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tool_md5, model_name, display_name, description, created_at, updated_at
                 FROM tool_vectors ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ToolRow {
                        id: row.get(0)?,
                        tool_md5: row.get(1)?,
                        model_name: row.get(2)?,
                        display_name: row.get(3)?,
                        description: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .filter(|r| r.display_name.starts_with(&prefix))
                .collect())
        })
    }

    pub fn count_tools(&self, model_name: Option<&str>) -> BrokerResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = match model_name {
                Some(model) => conn.query_row(
                    "SELECT COUNT(*) FROM tool_vectors WHERE model_name = ?1",
                    params![model],
                    |row| row.get(0),
                )?,
                None => {
                    conn.query_row("SELECT COUNT(*) FROM tool_vectors", [], |row| row.get(0))?
                }
            };
            Ok(count as u64)
        })
    }

    /// Wipe all records, vectors, and mappings for one model, atomically.
    pub fn clear_index(&self, model_name: &str) -> BrokerResult<usize> {
        self.with_tx(|tx| {
            let ids: Vec<i64> = {
                let mut stmt = tx.prepare("SELECT id FROM tool_vectors WHERE model_name = ?1")?;
                let rows = stmt
                    .query_map(params![model_name], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            for id in &ids {
                delete_tool_cascade(tx, *id)?;
            }
            Ok(ids.len())
        })
    }

    /// Brute-force cosine scan. Results are ordered by ascending distance
    /// (ties broken by ascending tool id), filtered to similarity >=
    /// `threshold`, and truncated to `top_k`. When `server_prefixes` is
    /// non-empty only tools whose display name starts with `{prefix}__` are
    /// considered.
    pub fn search_similar(
        &self,
        query: &[f32],
        top_k: usize,
        threshold: f64,
        server_prefixes: Option<&[String]>,
    ) -> BrokerResult<Vec<SimilarTool>> {
        if query.len() != self.dim {
            return Err(BrokerError::Shape {
                expected: self.dim,
                got: query.len(),
            });
        }

        let prefixes: Option<Vec<String>> = server_prefixes
            .filter(|p| !p.is_empty())
            .map(|p| p.iter().map(|s| format!("{}__", s)).collect());

        let mut hits: Vec<SimilarTool> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id, t.tool_md5, t.display_name, t.description, t.created_at, v.embedding
                 FROM tool_vectors t
                 JOIN tool_mapping m ON m.tool_id = t.id
                 JOIN vec_tool_embeddings v ON v.rowid = m.vec_rowid",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut hits = Vec::new();
            for (tool_id, tool_md5, display_name, description, created_at, blob) in rows {
                if let Some(prefixes) = &prefixes {
                    if !prefixes.iter().any(|p| display_name.starts_with(p.as_str())) {
                        continue;
                    }
                }
                let embedding = vector::bytes_to_f32_vec(&blob);
                let similarity = vector::cosine_similarity(query, &embedding);
                if similarity < threshold {
                    continue;
                }
                hits.push(SimilarTool {
                    tool_id,
                    tool_md5,
                    display_name,
                    description,
                    distance: 1.0 - similarity,
                    similarity,
                    created_at,
                });
            }
            Ok(hits)
        })?;

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.tool_id.cmp(&b.tool_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

fn delete_tool_cascade(tx: &rusqlite::Transaction<'_>, tool_id: i64) -> BrokerResult<()> {
    if let Some(vec_rowid) = tx
        .query_row(
            "SELECT vec_rowid FROM tool_mapping WHERE tool_id = ?1",
            params![tool_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
    {
        tx.execute(
            "DELETE FROM vec_tool_embeddings WHERE rowid = ?1",
            params![vec_rowid],
        )?;
    }
    tx.execute("DELETE FROM tool_mapping WHERE tool_id = ?1", params![tool_id])?;
    tx.execute("DELETE FROM tool_vectors WHERE id = ?1", params![tool_id])?;
    Ok(())
}
