use std::net::IpAddr;
use std::sync::Arc;

use marginalia_api::{Backend, Column, CommentId, Locale, Scalar, StorageError, Table};

/// The at-most-once-per-IP like ledger.
///
/// There is no in-process coordination here: the `(comment_id, ip)` primary
/// key on `comment_likes` is the arbiter, so concurrent likes from the same
/// address race to the index and exactly one insert wins.
pub struct LikeLedger<B> {
    backend: Arc<B>,
}

impl<B: Backend> LikeLedger<B> {
    pub fn new(backend: Arc<B>) -> LikeLedger<B> {
        LikeLedger { backend }
    }

    /// Records one like from `ip` and bumps the comment's counter.
    ///
    /// `Err(UniqueViolation)` means this address already liked the comment.
    /// The counter bump is a separate statement and is deliberately not
    /// retried on failure: a crash between the two leaves the counter one
    /// short, which the error surfaces, while a retry could count twice.
    pub async fn register_like(
        &self,
        comment: CommentId,
        ip: IpAddr,
        locale: Locale,
    ) -> Result<(), StorageError> {
        self.backend
            .insert_returning(
                Table::CommentLikes,
                vec![
                    (Column::CommentId, Scalar::from(comment)),
                    (Column::Ip, Scalar::from(ip.to_string())),
                    (Column::Locale, Scalar::from(locale.as_str())),
                ],
            )
            .await?;
        self.backend.bump_likes(comment).await
    }
}
