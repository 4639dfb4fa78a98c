use anyhow::Context;
use async_trait::async_trait;
use marginalia_api::{
    Backend, Column, CommentId, Filter, Order, Page, Row, Scalar, StorageError, Table,
};
use sqlx::Row as _;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// The Postgres side of the storage contract. All SQL is built dynamically
/// because the column set a query touches depends on the store's negotiated
/// schema tier.
pub struct PgStore {
    pool: sqlx::PgPool,
}

impl PgStore {
    pub fn new(pool: sqlx::PgPool) -> PgStore {
        PgStore { pool }
    }
}

struct Sql {
    where_clause: String,
    binds: Vec<Scalar>,
}

fn where_clause(filters: &[Filter]) -> Sql {
    let mut where_clause = String::new();
    let mut binds = Vec::with_capacity(filters.len());
    for (i, filter) in filters.iter().enumerate() {
        where_clause.push_str(if i == 0 { " WHERE " } else { " AND " });
        where_clause.push_str(&format!("{} = ${}", filter.column.as_str(), i + 1));
        binds.push(filter.value.clone());
    }
    Sql {
        where_clause,
        binds,
    }
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    binds: &'q [Scalar],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for bind in binds {
        query = match bind {
            Scalar::Int(v) => query.bind(*v),
            Scalar::Text(v) => query.bind(v.as_str()),
            Scalar::Uuid(v) => query.bind(*v),
        };
    }
    query
}

/// Postgres reports an undefined column as `column "name" [of relation
/// "table"] does not exist`; pull out the quoted name.
fn quoted_column(message: &str) -> Option<&str> {
    let start = message.find('"')? + 1;
    let len = message[start..].find('"')?;
    Some(&message[start..start + len])
}

fn map_db_error(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            // undefined_column: turn the driver detail into a typed column so
            // the store can match on it instead of grepping strings
            Some("42703") => {
                if let Some(column) = quoted_column(db.message()).and_then(Column::from_name) {
                    return StorageError::MissingColumn(column);
                }
            }
            // unique_violation
            Some("23505") => return StorageError::UniqueViolation,
            _ => {}
        }
    }
    StorageError::Other(anyhow::Error::new(err))
}

fn select_stmt(
    table: Table,
    columns: &[Column],
    where_clause: &str,
    order: Order,
    page: Option<Page>,
) -> String {
    let column_list = columns
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let direction = if order.descending { "DESC" } else { "ASC" };
    let mut stmt = format!(
        "SELECT row_to_json(sub) AS data FROM (SELECT {} FROM {}{} ORDER BY {} {}",
        column_list,
        table.as_str(),
        where_clause,
        order.column.as_str(),
        direction,
    );
    if let Some(page) = page {
        stmt.push_str(&format!(" LIMIT {} OFFSET {}", page.limit, page.offset));
    }
    // SQL does not promise that the outer select preserves the subquery's
    // ordering; the inner ORDER BY only fixes which rows the LIMIT keeps
    stmt.push_str(&format!(
        ") sub ORDER BY sub.{} {}",
        order.column.as_str(),
        direction
    ));
    stmt
}

fn row_json(row: &sqlx::postgres::PgRow) -> Result<Row, StorageError> {
    let data: serde_json::Value = row.try_get("data").context("decoding row json")?;
    match data {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(anyhow::anyhow!("row_to_json returned a non-object: {other:?}").into()),
    }
}

#[async_trait]
impl Backend for PgStore {
    async fn select(
        &self,
        table: Table,
        columns: &[Column],
        filters: &[Filter],
        order: Order,
        page: Option<Page>,
    ) -> Result<(Vec<Row>, u64), StorageError> {
        let sql = where_clause(filters);
        let stmt = select_stmt(table, columns, &sql.where_clause, order, page);

        let fetched = bind_all(sqlx::query(&stmt), &sql.binds)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        let mut rows = Vec::with_capacity(fetched.len());
        for row in &fetched {
            rows.push(row_json(row)?);
        }

        let total = match page {
            None => rows.len() as u64,
            Some(_) => {
                let stmt = format!(
                    "SELECT COUNT(*) AS total FROM {}{}",
                    table.as_str(),
                    sql.where_clause
                );
                let total: i64 = bind_all(sqlx::query(&stmt), &sql.binds)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_db_error)?
                    .try_get("total")
                    .context("decoding match count")?;
                total.max(0) as u64
            }
        };

        Ok((rows, total))
    }

    async fn insert_returning(
        &self,
        table: Table,
        payload: Vec<(Column, Scalar)>,
    ) -> Result<Row, StorageError> {
        let columns = payload
            .iter()
            .map(|(c, _)| c.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=payload.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let stmt = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING row_to_json({}) AS data",
            table.as_str(),
            columns,
            placeholders,
            table.as_str(),
        );
        let binds: Vec<Scalar> = payload.into_iter().map(|(_, v)| v).collect();
        let row = bind_all(sqlx::query(&stmt), &binds)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_error)?;
        row_json(&row)
    }

    async fn delete_returning(
        &self,
        table: Table,
        filters: &[Filter],
    ) -> Result<Option<Row>, StorageError> {
        let sql = where_clause(filters);
        let stmt = format!(
            "DELETE FROM {}{} RETURNING row_to_json({}) AS data",
            table.as_str(),
            sql.where_clause,
            table.as_str(),
        );
        let row = bind_all(sqlx::query(&stmt), &sql.binds)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        match row {
            Some(row) => Ok(Some(row_json(&row)?)),
            None => Ok(None),
        }
    }

    async fn bump_likes(&self, comment: CommentId) -> Result<(), StorageError> {
        sqlx::query("UPDATE comments SET likes = likes + 1 WHERE id = $1")
            .bind(comment.0)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }
}
