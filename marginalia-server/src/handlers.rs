use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use http::StatusCode;
use marginalia_api::{
    Comment, CommentFilter, CommentId, CommentPage, ListAllParams, Locale, NewComment, Uuid,
};

use crate::extractors::ClientIp;
use crate::pg::PgStore;
use crate::service::CommentService;
use crate::Error;

type Comments = State<Arc<CommentService<PgStore>>>;

#[derive(serde::Deserialize)]
pub struct ThreadParams {
    locale: Option<String>,
    anchor_type: Option<String>,
    paragraph_id: Option<String>,
}

pub async fn thread_comments(
    State(comments): Comments,
    Path(slug): Path<String>,
    Query(params): Query<ThreadParams>,
) -> Result<Json<Vec<Comment>>, Error> {
    let locale = Locale::from_param(params.locale.as_deref())?;
    let filter = CommentFilter::from_params(
        params.anchor_type.as_deref(),
        params.paragraph_id.as_deref(),
    )?;
    Ok(Json(
        comments.comments_for_post(&slug, locale, &filter).await?,
    ))
}

#[derive(serde::Deserialize)]
pub struct LocaleParam {
    locale: Option<String>,
}

pub async fn create_comment(
    State(comments): Comments,
    Path(slug): Path<String>,
    Query(params): Query<LocaleParam>,
    Json(submission): Json<NewComment>,
) -> Result<(StatusCode, Json<Comment>), Error> {
    let fallback = Locale::from_param(params.locale.as_deref())?;
    let created = comments.create_comment(&slug, fallback, &submission).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(serde::Deserialize)]
pub struct ListAllQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    slug: Option<String>,
    locale: Option<String>,
    anchor_type: Option<String>,
    paragraph_id: Option<String>,
}

pub async fn all_comments(
    State(comments): Comments,
    Query(params): Query<ListAllQuery>,
) -> Result<Json<CommentPage>, Error> {
    let locale = match &params.locale {
        None => None,
        Some(raw) => Some(Locale::from_param(Some(raw))?),
    };
    let filter = CommentFilter::from_params(
        params.anchor_type.as_deref(),
        params.paragraph_id.as_deref(),
    )?;
    let slug = params
        .slug
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    let page = comments
        .all_comments(&ListAllParams {
            limit: params.limit,
            offset: params.offset,
            slug,
            locale,
            filter,
        })
        .await?;
    Ok(Json(page))
}

pub async fn like_comment(
    State(comments): Comments,
    Path(id): Path<Uuid>,
    Query(params): Query<LocaleParam>,
    ClientIp(ip): ClientIp,
) -> Result<(), Error> {
    let locale = Locale::from_param(params.locale.as_deref())?;
    comments.like_comment(CommentId(id), ip, locale).await
}

pub async fn delete_comment(
    State(comments): Comments,
    Path(id): Path<Uuid>,
) -> Result<(), Error> {
    comments.delete_comment(CommentId(id)).await
}
