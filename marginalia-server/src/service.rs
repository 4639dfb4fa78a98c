use std::net::IpAddr;
use std::sync::Arc;

use marginalia_api::{
    Backend, Comment, CommentFilter, CommentId, CommentPage, ListAllParams, Locale, NewComment,
    StorageError,
};

use crate::ledger::LikeLedger;
use crate::store::CommentStore;
use crate::Error;

/// The one entry point the handlers talk to. Everything below is validation,
/// the schema-adjusting store, and the like ledger.
pub struct CommentService<B> {
    store: CommentStore<B>,
    ledger: LikeLedger<B>,
}

fn storage_fault(err: StorageError) -> Error {
    Error::Anyhow(anyhow::Error::new(err))
}

impl<B: Backend> CommentService<B> {
    pub fn new(backend: Arc<B>) -> CommentService<B> {
        CommentService {
            store: CommentStore::new(backend.clone()),
            ledger: LikeLedger::new(backend),
        }
    }

    pub async fn comments_for_post(
        &self,
        slug: &str,
        locale: Locale,
        filter: &CommentFilter,
    ) -> Result<Vec<Comment>, Error> {
        let slug = slug.trim().to_lowercase();
        if slug.is_empty() {
            return Err(Error::invalid_field("slug", "slug must not be empty"));
        }
        self.store
            .list_for_post(&slug, locale, filter)
            .await
            .map_err(storage_fault)
    }

    pub async fn all_comments(&self, params: &ListAllParams) -> Result<CommentPage, Error> {
        self.store.list_all(params).await.map_err(storage_fault)
    }

    pub async fn create_comment(
        &self,
        slug: &str,
        fallback_locale: Locale,
        submission: &NewComment,
    ) -> Result<Comment, Error> {
        let draft = submission.validate(slug, fallback_locale)?;
        self.store.create(&draft).await.map_err(storage_fault)
    }

    pub async fn like_comment(
        &self,
        id: CommentId,
        ip: IpAddr,
        locale: Locale,
    ) -> Result<(), Error> {
        match self.ledger.register_like(id, ip, locale).await {
            Ok(()) => Ok(()),
            Err(StorageError::UniqueViolation) => Err(Error::already_liked(id)),
            Err(err) => Err(storage_fault(err)),
        }
    }

    pub async fn delete_comment(&self, id: CommentId) -> Result<(), Error> {
        match self.store.delete(id).await.map_err(storage_fault)? {
            true => Ok(()),
            false => Err(Error::comment_not_found(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_api::Error as ApiError;
    use marginalia_mock_store::MockStore;

    fn service() -> (Arc<MockStore>, CommentService<MockStore>) {
        let backend = Arc::new(MockStore::new());
        (backend.clone(), CommentService::new(backend))
    }

    fn submission() -> NewComment {
        NewComment {
            author: Some(String::from("Ana")),
            body: Some(String::from("Great chapter!")),
            ..Default::default()
        }
    }

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    fn api_error(err: Error) -> ApiError {
        match err {
            Error::Api(err) => err,
            Error::Anyhow(err) => panic!("expected a client error, got {err:?}"),
        }
    }

    #[tokio::test]
    async fn created_comments_show_up_in_the_thread() {
        let (_, service) = service();
        let created = service
            .create_comment("Ch1", Locale::Br, &submission())
            .await
            .unwrap();
        assert_eq!(created.slug, "ch1");

        let thread = service
            .comments_for_post(" CH1 ", Locale::Br, &CommentFilter::default())
            .await
            .unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].id, created.id);
    }

    #[tokio::test]
    async fn invalid_submissions_become_validation_errors() {
        let (_, service) = service();
        let err = service
            .create_comment("ch1", Locale::Br, &NewComment::default())
            .await
            .unwrap_err();
        assert!(matches!(api_error(err), ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn empty_slug_is_rejected_on_listing() {
        let (_, service) = service();
        let err = service
            .comments_for_post("   ", Locale::Br, &CommentFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(api_error(err), ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn double_like_maps_to_already_liked() {
        let (backend, service) = service();
        let created = service
            .create_comment("ch1", Locale::Br, &submission())
            .await
            .unwrap();

        service
            .like_comment(created.id, ip("10.0.0.1"), Locale::Br)
            .await
            .unwrap();
        let err = service
            .like_comment(created.id, ip("10.0.0.1"), Locale::Br)
            .await
            .unwrap_err();
        assert!(matches!(api_error(err), ApiError::AlreadyLiked(id) if id == created.id));
        assert_eq!(backend.likes_of(created.id), 1);
    }

    #[tokio::test]
    async fn deleting_twice_reports_not_found() {
        let (_, service) = service();
        let created = service
            .create_comment("ch1", Locale::Br, &submission())
            .await
            .unwrap();

        service.delete_comment(created.id).await.unwrap();
        let err = service.delete_comment(created.id).await.unwrap_err();
        assert!(matches!(api_error(err), ApiError::CommentNotFound(id) if id == created.id));
    }

    #[tokio::test]
    async fn all_comments_pages_through_everything() {
        let (_, service) = service();
        for slug in ["ch1", "ch2", "ch3"] {
            service
                .create_comment(slug, Locale::Br, &submission())
                .await
                .unwrap();
        }
        let page = service
            .all_comments(&ListAllParams {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.comments.len(), 2);
        assert_eq!(page.comments[0].slug, "ch3");
    }
}
