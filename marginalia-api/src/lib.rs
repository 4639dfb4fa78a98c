mod comment;
mod db;
mod error;

pub use comment::*;
pub use db::*;
pub use error::*;

pub use uuid::Uuid;
pub type Time = chrono::DateTime<chrono::Utc>;
