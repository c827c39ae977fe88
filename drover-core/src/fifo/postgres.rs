//! Postgres-backed queue. All named queues share the `fifo_items` table and
//! are partitioned by `queue_name`; the holding area is the `temporary` flag.
//!
//! Pops select with `FOR UPDATE SKIP LOCKED` so concurrent agents never
//! receive the same row. Ties on score are broken by id.

use std::fmt;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::{DroverError, Result};

use super::{
    ItemId, ItemUpdate, ManyQuery, Mode, RawItem, ScoreCondition, ScoreRange,
    backend::QueueBackend,
};

/// Attempts made by `insert` when an allocated id collides with a caller id.
const ALLOCATION_ATTEMPTS: usize = 8;

type Row = (i64, Option<Vec<u8>>, f64);

#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    name: String,
}

impl fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("name", &self.name)
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

fn order_sql(mode: Mode) -> &'static str {
    match mode {
        Mode::First => "score ASC, id ASC",
        Mode::Last => "score DESC, id DESC",
    }
}

fn condition_sql(condition: ScoreCondition) -> &'static str {
    match condition {
        ScoreCondition::Gt => "$4 > score",
        ScoreCondition::Ge => "$4 >= score",
        ScoreCondition::Lt => "$4 < score",
        ScoreCondition::Le => "$4 <= score",
        ScoreCondition::Always => "TRUE",
    }
}

fn to_raw((id, payload, score): Row) -> RawItem {
    RawItem {
        id: ItemId(id),
        payload,
        score,
    }
}

fn sort_rows(rows: Vec<Row>, mode: Mode) -> Vec<RawItem> {
    let mut items: Vec<RawItem> = rows.into_iter().map(to_raw).collect();
    items.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.id.cmp(&b.id)));
    if mode == Mode::Last {
        items.reverse();
    }
    items
}

fn id_values(ids: &[ItemId]) -> Vec<i64> {
    ids.iter().map(|id| id.0).collect()
}

impl PostgresBackend {
    /// Bind a queue name to a pool and verify the schema is present.
    pub async fn new(pool: PgPool, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let table_exists: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1
            FROM information_schema.tables
            WHERE table_name = 'fifo_items'
            LIMIT 1
            "#,
        )
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            DroverError::Backend(format!("fifo schema validation failed: {e}"))
        })?;

        if table_exists.is_none() {
            return Err(DroverError::Backend(
                "table fifo_items is missing; run migrations".into(),
            ));
        }
        info!(target: "drover::fifo", queue = %name, "queue bound to Postgres");
        Ok(Self { pool, name })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueBackend for PostgresBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn size(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)::bigint FROM fifo_items WHERE queue_name = $1 AND temporary = FALSE",
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("fifo size failed: {e}")))?;
        Ok(count.max(0) as usize)
    }

    async fn insert(&self, payload: Vec<u8>, score: f64) -> Result<ItemId> {
        for _ in 0..ALLOCATION_ATTEMPTS {
            let inserted: Option<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO fifo_items (queue_name, id, item, score, temporary)
                VALUES ($1, nextval('fifo_item_id_seq'), $2, $3, FALSE)
                ON CONFLICT (queue_name, id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&self.name)
            .bind(&payload)
            .bind(score)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DroverError::Backend(format!("fifo insert failed: {e}")))?;

            if let Some(id) = inserted {
                return Ok(ItemId(id));
            }
            warn!(target: "drover::fifo", queue = %self.name, "allocated id already taken by a caller id; retrying");
        }
        Err(DroverError::Backend(format!(
            "fifo insert could not allocate a free id after {ALLOCATION_ATTEMPTS} attempts"
        )))
    }

    async fn insert_by_id(&self, id: ItemId, payload: Vec<u8>, score: f64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO fifo_items (queue_name, id, item, score, temporary)
            VALUES ($1, $2, $3, $4, FALSE)
            ON CONFLICT (queue_name, id) DO NOTHING
            "#,
        )
        .bind(&self.name)
        .bind(id.0)
        .bind(&payload)
        .bind(score)
        .execute(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("fifo insert by id failed: {e}")))?;
        Ok(res.rows_affected() > 0)
    }

    async fn pop(&self, mode: Mode, protective: bool) -> Result<Option<RawItem>> {
        let pick = format!(
            r#"
            SELECT id
            FROM fifo_items
            WHERE queue_name = $1 AND temporary = FALSE
            ORDER BY {}
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            order_sql(mode)
        );
        let sql = if protective {
            format!(
                r#"
                WITH next AS ({pick})
                UPDATE fifo_items f
                SET temporary = TRUE
                FROM next
                WHERE f.queue_name = $1 AND f.id = next.id
                RETURNING f.id, f.item, f.score
                "#
            )
        } else {
            format!(
                r#"
                WITH next AS ({pick})
                DELETE FROM fifo_items f
                USING next
                WHERE f.queue_name = $1 AND f.id = next.id
                RETURNING f.id, f.item, f.score
                "#
            )
        };

        let row: Option<Row> = sqlx::query_as(&sql)
            .bind(&self.name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DroverError::Backend(format!("fifo pop failed: {e}")))?;
        Ok(row.map(to_raw))
    }

    async fn pop_many(&self, query: &ManyQuery) -> Result<Vec<RawItem>> {
        let pick = format!(
            r#"
            SELECT id
            FROM fifo_items
            WHERE queue_name = $1
              AND temporary = $2
              AND ($3::float8 IS NULL OR score >= $3)
              AND ($4::float8 IS NULL OR score <= $4)
            ORDER BY {}
            LIMIT $5
            FOR UPDATE SKIP LOCKED
            "#,
            order_sql(query.mode)
        );
        let sql = if query.protective {
            format!(
                r#"
                WITH picked AS ({pick})
                UPDATE fifo_items f
                SET temporary = TRUE
                FROM picked
                WHERE f.queue_name = $1 AND f.id = picked.id
                RETURNING f.id, f.item, f.score
                "#
            )
        } else {
            format!(
                r#"
                WITH picked AS ({pick})
                DELETE FROM fifo_items f
                USING picked
                WHERE f.queue_name = $1 AND f.id = picked.id
                RETURNING f.id, f.item, f.score
                "#
            )
        };

        let rows: Vec<Row> = sqlx::query_as(&sql)
            .bind(&self.name)
            .bind(query.temporary)
            .bind(query.range.min)
            .bind(query.range.max)
            .bind(query.count.map(|count| count as i64))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DroverError::Backend(format!("fifo pop many failed: {e}")))?;
        Ok(sort_rows(rows, query.mode))
    }

    async fn peek(&self, mode: Mode, skip_item: bool) -> Result<Option<RawItem>> {
        let sql = format!(
            r#"
            SELECT id, CASE WHEN $2 THEN NULL ELSE item END, score
            FROM fifo_items
            WHERE queue_name = $1 AND temporary = FALSE
            ORDER BY {}
            LIMIT 1
            "#,
            order_sql(mode)
        );
        let row: Option<Row> = sqlx::query_as(&sql)
            .bind(&self.name)
            .bind(skip_item)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DroverError::Backend(format!("fifo peek failed: {e}")))?;
        Ok(row.map(to_raw))
    }

    async fn peek_by_id(
        &self,
        id: ItemId,
        temporary: bool,
        skip_item: bool,
    ) -> Result<Option<RawItem>> {
        let row: Option<Row> = sqlx::query_as(
            r#"
            SELECT id, CASE WHEN $4 THEN NULL ELSE item END, score
            FROM fifo_items
            WHERE queue_name = $1 AND id = $2 AND temporary = $3
            "#,
        )
        .bind(&self.name)
        .bind(id.0)
        .bind(temporary)
        .bind(skip_item)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("fifo peek by id failed: {e}")))?;
        Ok(row.map(to_raw))
    }

    async fn peek_many(
        &self,
        mode: Mode,
        range: ScoreRange,
        count: Option<usize>,
        skip_item: bool,
    ) -> Result<Vec<RawItem>> {
        let sql = format!(
            r#"
            SELECT id, CASE WHEN $2 THEN NULL ELSE item END, score
            FROM fifo_items
            WHERE queue_name = $1
              AND temporary = FALSE
              AND ($3::float8 IS NULL OR score >= $3)
              AND ($4::float8 IS NULL OR score <= $4)
            ORDER BY {}
            LIMIT $5
            "#,
            order_sql(mode)
        );
        let rows: Vec<Row> = sqlx::query_as(&sql)
            .bind(&self.name)
            .bind(skip_item)
            .bind(range.min)
            .bind(range.max)
            .bind(count.map(|count| count as i64))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DroverError::Backend(format!("fifo peek many failed: {e}")))?;
        Ok(rows.into_iter().map(to_raw).collect())
    }

    async fn delete(&self, ids: &[ItemId]) -> Result<usize> {
        let res = sqlx::query(
            r#"
            DELETE FROM fifo_items
            WHERE queue_name = $1 AND id = ANY($2) AND temporary = TRUE
            "#,
        )
        .bind(&self.name)
        .bind(id_values(ids))
        .execute(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("fifo delete failed: {e}")))?;
        Ok(res.rows_affected() as usize)
    }

    async fn restore(&self, ids: Option<&[ItemId]>) -> Result<usize> {
        let res = match ids {
            None => {
                sqlx::query(
                    r#"
                    UPDATE fifo_items
                    SET temporary = FALSE
                    WHERE queue_name = $1 AND temporary = TRUE
                    "#,
                )
                .bind(&self.name)
                .execute(&self.pool)
                .await
            }
            Some(ids) => {
                sqlx::query(
                    r#"
                    UPDATE fifo_items
                    SET temporary = FALSE
                    WHERE queue_name = $1 AND id = ANY($2) AND temporary = TRUE
                    "#,
                )
                .bind(&self.name)
                .bind(id_values(ids))
                .execute(&self.pool)
                .await
            }
        }
        .map_err(|e| DroverError::Backend(format!("fifo restore failed: {e}")))?;
        Ok(res.rows_affected() as usize)
    }

    async fn update(&self, id: ItemId, update: ItemUpdate) -> Result<bool> {
        // Guard is checked against the stored score under the row lock.
        let sql = format!(
            r#"
            UPDATE fifo_items
            SET item = COALESCE($3, item),
                score = COALESCE($4, score),
                temporary = COALESCE($5, temporary)
            WHERE queue_name = $1
              AND id = $2
              AND ($4::float8 IS NULL OR {})
            "#,
            condition_sql(update.condition)
        );
        let res = sqlx::query(&sql)
            .bind(&self.name)
            .bind(id.0)
            .bind(update.payload)
            .bind(update.score)
            .bind(update.temporary)
            .execute(&self.pool)
            .await
            .map_err(|e| DroverError::Backend(format!("fifo update failed: {e}")))?;
        Ok(res.rows_affected() > 0)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM fifo_items WHERE queue_name = $1")
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(|e| DroverError::Backend(format!("fifo clear failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_reordered_after_returning() {
        let rows = vec![(3, None, 2.0), (1, None, 2.0), (2, None, -1.0)];
        let first: Vec<i64> = sort_rows(rows.clone(), Mode::First)
            .into_iter()
            .map(|raw| raw.id.0)
            .collect();
        assert_eq!(first, vec![2, 1, 3]);

        let last: Vec<i64> = sort_rows(rows, Mode::Last)
            .into_iter()
            .map(|raw| raw.id.0)
            .collect();
        assert_eq!(last, vec![3, 1, 2]);
    }

    #[test]
    fn condition_sql_compares_new_against_stored() {
        assert_eq!(condition_sql(ScoreCondition::Gt), "$4 > score");
        assert_eq!(condition_sql(ScoreCondition::Always), "TRUE");
    }
}
