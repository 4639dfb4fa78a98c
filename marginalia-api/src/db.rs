use async_trait::async_trait;
use uuid::Uuid;

use crate::CommentId;

/// A row as returned by the storage backend. Columns absent from the live
/// schema are simply absent from the map.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Table {
    Comments,
    CommentLikes,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Comments => "comments",
            Table::CommentLikes => "comment_likes",
        }
    }
}

/// Every column the application knows about, across both tables. Having a
/// closed enum here is what lets the store match on *which* column a schema
/// mismatch is about instead of grepping error strings.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Column {
    // comments, base schema
    Id,
    Slug,
    Author,
    Body,
    Locale,
    Likes,
    CreatedAt,
    // comments, anchor columns (added later)
    AnchorType,
    ParagraphId,
    StartOffset,
    EndOffset,
    Quote,
    // comments, threaded replies (added later still)
    ParentId,
    // comment_likes
    CommentId,
    Ip,
}

impl Column {
    pub fn as_str(&self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::Slug => "slug",
            Column::Author => "author",
            Column::Body => "body",
            Column::Locale => "locale",
            Column::Likes => "likes",
            Column::CreatedAt => "created_at",
            Column::AnchorType => "anchor_type",
            Column::ParagraphId => "paragraph_id",
            Column::StartOffset => "start_offset",
            Column::EndOffset => "end_offset",
            Column::Quote => "quote",
            Column::ParentId => "parent_id",
            Column::CommentId => "comment_id",
            Column::Ip => "ip",
        }
    }

    pub fn from_name(name: &str) -> Option<Column> {
        match name {
            "id" => Some(Column::Id),
            "slug" => Some(Column::Slug),
            "author" => Some(Column::Author),
            "body" => Some(Column::Body),
            "locale" => Some(Column::Locale),
            "likes" => Some(Column::Likes),
            "created_at" => Some(Column::CreatedAt),
            "anchor_type" => Some(Column::AnchorType),
            "paragraph_id" => Some(Column::ParagraphId),
            "start_offset" => Some(Column::StartOffset),
            "end_offset" => Some(Column::EndOffset),
            "quote" => Some(Column::Quote),
            "parent_id" => Some(Column::ParentId),
            "comment_id" => Some(Column::CommentId),
            "ip" => Some(Column::Ip),
            _ => None,
        }
    }

    /// The anchor columns arrived in the same migration; missing any one of
    /// them means the whole anchor tier is absent.
    pub fn is_anchor(&self) -> bool {
        matches!(
            self,
            Column::AnchorType
                | Column::ParagraphId
                | Column::StartOffset
                | Column::EndOffset
                | Column::Quote
        )
    }
}

/// A value bound into a query. A closed set, so backends can bind without
/// inspecting arbitrary JSON.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Scalar {
    Int(i64),
    Text(String),
    Uuid(Uuid),
}

impl Scalar {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Int(v) => serde_json::Value::from(*v),
            Scalar::Text(v) => serde_json::Value::from(v.clone()),
            Scalar::Uuid(v) => serde_json::Value::from(v.to_string()),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Scalar {
        Scalar::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Scalar {
        Scalar::Int(v as i64)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Scalar {
        Scalar::Text(String::from(v))
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Scalar {
        Scalar::Text(v)
    }
}

impl From<Uuid> for Scalar {
    fn from(v: Uuid) -> Scalar {
        Scalar::Uuid(v)
    }
}

impl From<CommentId> for Scalar {
    fn from(v: CommentId) -> Scalar {
        Scalar::Uuid(v.0)
    }
}

/// An equality filter on one column.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Filter {
    pub column: Column,
    pub value: Scalar,
}

impl Filter {
    pub fn eq(column: Column, value: impl Into<Scalar>) -> Filter {
        Filter {
            column,
            value: value.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Order {
    pub column: Column,
    pub descending: bool,
}

impl Order {
    pub fn asc(column: Column) -> Order {
        Order {
            column,
            descending: false,
        }
    }

    pub fn desc(column: Column) -> Order {
        Order {
            column,
            descending: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The live schema does not have this column (yet). Recovered internally
    /// by the store, never surfaced to callers.
    #[error("storage schema is missing column {}", .0.as_str())]
    MissingColumn(Column),

    /// A unique index rejected the write. Distinguishable from every other
    /// write failure so the like ledger can turn it into a domain conflict.
    #[error("unique constraint violated")]
    UniqueViolation,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The data-access collaborator the comment core is written against: one
/// Postgres implementation in the server, one in-memory implementation for
/// tests. Rows travel as JSON objects so that schema tiers can differ without
/// the contract changing.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the matching rows plus the total match count ignoring
    /// pagination (equal to `rows.len()` when `page` is `None`).
    async fn select(
        &self,
        table: Table,
        columns: &[Column],
        filters: &[Filter],
        order: Order,
        page: Option<Page>,
    ) -> Result<(Vec<Row>, u64), StorageError>;

    /// Inserts one row and returns it as stored (defaults filled in).
    async fn insert_returning(
        &self,
        table: Table,
        payload: Vec<(Column, Scalar)>,
    ) -> Result<Row, StorageError>;

    /// Deletes the matching row, returning it, or `Ok(None)` when nothing
    /// matched — an absent row is a valid outcome, not an error.
    async fn delete_returning(
        &self,
        table: Table,
        filters: &[Filter],
    ) -> Result<Option<Row>, StorageError>;

    /// Atomically bumps a comment's like counter by one, in a single
    /// round-trip (no read-modify-write on the caller side).
    async fn bump_likes(&self, comment: CommentId) -> Result<(), StorageError>;
}
