//! In-memory implementation of the storage contract, for tests.
//!
//! The schema of the `comments` table is configurable so the server's
//! degraded-read and degraded-write paths can be exercised without a real
//! database lagging behind its migrations.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use marginalia_api::{
    Backend, Column, CommentId, Filter, Order, Page, Row, Scalar, StorageError, Table,
};
use uuid::Uuid;

const BASE_COLUMNS: [Column; 7] = [
    Column::Id,
    Column::Slug,
    Column::Author,
    Column::Body,
    Column::Locale,
    Column::Likes,
    Column::CreatedAt,
];

const ANCHOR_COLUMNS: [Column; 5] = [
    Column::AnchorType,
    Column::ParagraphId,
    Column::StartOffset,
    Column::EndOffset,
    Column::Quote,
];

pub struct MockStore {
    inner: Mutex<Inner>,
    select_calls: AtomicUsize,
}

struct Inner {
    comment_columns: HashSet<Column>,
    comments: Vec<Row>,
    likes: Vec<Row>,
    seq: i64,
}

impl MockStore {
    /// A store whose schema has every column the application knows about.
    pub fn new() -> MockStore {
        let mut columns: HashSet<Column> = BASE_COLUMNS.into_iter().collect();
        columns.extend(ANCHOR_COLUMNS);
        columns.insert(Column::ParentId);
        Self::with_columns(columns)
    }

    /// A schema that predates the threaded-replies migration.
    pub fn without_parent_column() -> MockStore {
        let mut columns: HashSet<Column> = BASE_COLUMNS.into_iter().collect();
        columns.extend(ANCHOR_COLUMNS);
        Self::with_columns(columns)
    }

    /// A schema that predates the anchor migration entirely.
    pub fn legacy_schema() -> MockStore {
        Self::with_columns(BASE_COLUMNS.into_iter().collect())
    }

    fn with_columns(comment_columns: HashSet<Column>) -> MockStore {
        MockStore {
            inner: Mutex::new(Inner {
                comment_columns,
                comments: Vec::new(),
                likes: Vec::new(),
                seq: 0,
            }),
            select_calls: AtomicUsize::new(0),
        }
    }

    /// How many `select` round-trips the store has served, including failed
    /// ones. Lets tests check that schema tiers are probed once, not per call.
    pub fn select_calls(&self) -> usize {
        self.select_calls.load(Ordering::Relaxed)
    }

    /// Current like counter of a comment, `0` if unknown.
    pub fn likes_of(&self, id: CommentId) -> i64 {
        let inner = self.inner.lock().unwrap();
        let id = serde_json::Value::from(id.0.to_string());
        inner
            .comments
            .iter()
            .find(|row| row.get("id") == Some(&id))
            .and_then(|row| row.get("likes"))
            .and_then(|likes| likes.as_i64())
            .unwrap_or(0)
    }

    /// Plants a row as-is, bypassing insert-side invariants. Used by tests to
    /// simulate rows written by older or buggy producers.
    pub fn plant_comment(&self, mut row: Row) {
        let mut inner = self.inner.lock().unwrap();
        if !row.contains_key("id") {
            row.insert(
                String::from("id"),
                serde_json::Value::from(Uuid::new_v4().to_string()),
            );
        }
        if !row.contains_key("created_at") {
            let created_at = Utc::now() + Duration::microseconds(inner.seq);
            inner.seq += 1;
            row.insert(
                String::from("created_at"),
                serde_json::Value::from(created_at.to_rfc3339()),
            );
        }
        if !row.contains_key("likes") {
            row.insert(String::from("likes"), serde_json::Value::from(0));
        }
        inner.comments.push(row);
    }
}

impl Default for MockStore {
    fn default() -> MockStore {
        MockStore::new()
    }
}

fn matches(row: &Row, filters: &[Filter]) -> bool {
    filters.iter().all(|f| {
        row.get(f.column.as_str())
            .map(|v| *v == f.value.to_json())
            .unwrap_or(false)
    })
}

fn compare_values(a: &serde_json::Value, b: &serde_json::Value) -> CmpOrdering {
    match (a, b) {
        // RFC 3339 UTC timestamps order correctly as strings
        (serde_json::Value::String(a), serde_json::Value::String(b)) => a.cmp(b),
        (serde_json::Value::Number(a), serde_json::Value::Number(b)) => a
            .as_i64()
            .unwrap_or(i64::MIN)
            .cmp(&b.as_i64().unwrap_or(i64::MIN)),
        _ => CmpOrdering::Equal,
    }
}

#[async_trait]
impl Backend for MockStore {
    async fn select(
        &self,
        table: Table,
        columns: &[Column],
        filters: &[Filter],
        order: Order,
        page: Option<Page>,
    ) -> Result<(Vec<Row>, u64), StorageError> {
        self.select_calls.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.lock().unwrap();
        if table == Table::Comments {
            for column in columns.iter().chain(filters.iter().map(|f| &f.column)) {
                if !inner.comment_columns.contains(column) {
                    return Err(StorageError::MissingColumn(*column));
                }
            }
        }
        let rows = match table {
            Table::Comments => &inner.comments,
            Table::CommentLikes => &inner.likes,
        };

        let mut selected: Vec<&Row> = rows.iter().filter(|row| matches(row, filters)).collect();
        selected.sort_by(|a, b| {
            let ord = compare_values(
                a.get(order.column.as_str()).unwrap_or(&serde_json::Value::Null),
                b.get(order.column.as_str()).unwrap_or(&serde_json::Value::Null),
            );
            if order.descending {
                ord.reverse()
            } else {
                ord
            }
        });

        let total = selected.len() as u64;
        if let Some(page) = page {
            let offset = usize::try_from(page.offset).unwrap_or(0);
            let limit = usize::try_from(page.limit).unwrap_or(0);
            selected = selected.into_iter().skip(offset).take(limit).collect();
        }

        let projected = selected
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| {
                        (
                            String::from(c.as_str()),
                            row.get(c.as_str())
                                .cloned()
                                .unwrap_or(serde_json::Value::Null),
                        )
                    })
                    .collect()
            })
            .collect();
        Ok((projected, total))
    }

    async fn insert_returning(
        &self,
        table: Table,
        payload: Vec<(Column, Scalar)>,
    ) -> Result<Row, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        match table {
            Table::Comments => {
                for (column, _) in &payload {
                    if !inner.comment_columns.contains(column) {
                        return Err(StorageError::MissingColumn(*column));
                    }
                }
                let created_at = Utc::now() + Duration::microseconds(inner.seq);
                inner.seq += 1;
                let mut row = Row::new();
                for column in &inner.comment_columns {
                    row.insert(String::from(column.as_str()), serde_json::Value::Null);
                }
                row.insert(
                    String::from("id"),
                    serde_json::Value::from(Uuid::new_v4().to_string()),
                );
                row.insert(String::from("likes"), serde_json::Value::from(0));
                row.insert(
                    String::from("created_at"),
                    serde_json::Value::from(created_at.to_rfc3339()),
                );
                for (column, value) in payload {
                    row.insert(String::from(column.as_str()), value.to_json());
                }
                inner.comments.push(row.clone());
                Ok(row)
            }
            Table::CommentLikes => {
                let mut row = Row::new();
                for (column, value) in payload {
                    row.insert(String::from(column.as_str()), value.to_json());
                }
                let duplicate = inner.likes.iter().any(|existing| {
                    existing.get("comment_id") == row.get("comment_id")
                        && existing.get("ip") == row.get("ip")
                });
                if duplicate {
                    return Err(StorageError::UniqueViolation);
                }
                inner.likes.push(row.clone());
                Ok(row)
            }
        }
    }

    async fn delete_returning(
        &self,
        table: Table,
        filters: &[Filter],
    ) -> Result<Option<Row>, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let rows = match table {
            Table::Comments => &mut inner.comments,
            Table::CommentLikes => &mut inner.likes,
        };
        match rows.iter().position(|row| matches(row, filters)) {
            Some(idx) => Ok(Some(rows.remove(idx))),
            None => Ok(None),
        }
    }

    async fn bump_likes(&self, comment: CommentId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let id = serde_json::Value::from(comment.0.to_string());
        if let Some(row) = inner
            .comments
            .iter_mut()
            .find(|row| row.get("id") == Some(&id))
        {
            let likes = row.get("likes").and_then(|v| v.as_i64()).unwrap_or(0);
            row.insert(String::from("likes"), serde_json::Value::from(likes + 1));
        }
        Ok(())
    }
}
