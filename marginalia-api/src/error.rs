use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

use crate::CommentId;

/// One violated field of a request, with a human-readable message.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> FieldError {
        FieldError {
            field: String::from(field),
            message: message.into(),
        }
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("{}", summarize_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("Comment {0:?} was already liked from this address")]
    AlreadyLiked(CommentId),

    #[error("Comment {0:?} not found")]
    CommentNotFound(CommentId),
}

fn summarize_fields(fields: &[FieldError]) -> String {
    let names = fields
        .iter()
        .map(|f| f.field.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!("Invalid fields in request: {}", names)
}

impl Error {
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Error {
        Error::Validation(vec![FieldError::new(field, message)])
    }

    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            // the boundary treats a duplicate like as "try later", like the
            // original platform did
            Error::AlreadyLiked(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::CommentNotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::Validation(fields) => json!({
                "message": "invalid request",
                "type": "invalid-fields",
                "fields": fields,
            }),
            Error::AlreadyLiked(id) => json!({
                "message": "comment already liked from this address",
                "type": "already-liked",
                "id": id.0,
            }),
            Error::CommentNotFound(id) => json!({
                "message": "comment not found",
                "type": "comment-not-found",
                "id": id.0,
            }),
        })
        .expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let id_of = |data: &serde_json::Value| -> anyhow::Result<CommentId> {
            Ok(CommentId(
                data.get("id")
                    .and_then(|id| id.as_str())
                    .and_then(|id| Uuid::from_str(id).ok())
                    .ok_or_else(|| anyhow!("error contents has no proper comment id"))?,
            ))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(String::from(
                    data.get("message")
                        .and_then(|msg| msg.as_str())
                        .unwrap_or(""),
                )),
                "invalid-fields" => Error::Validation(
                    serde_json::from_value(
                        data.get("fields")
                            .cloned()
                            .ok_or_else(|| anyhow!("invalid-fields error without fields"))?,
                    )
                    .context("parsing field list")?,
                ),
                "already-liked" => Error::AlreadyLiked(id_of(&data)?),
                "comment-not-found" => Error::CommentNotFound(id_of(&data)?),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contents_parse_round_trips_every_variant() {
        let errors = [
            Error::Unknown(String::from("database fell over")),
            Error::Validation(vec![
                FieldError::new("author", "author is too short"),
                FieldError::new("body", "links are not allowed"),
            ]),
            Error::AlreadyLiked(CommentId(Uuid::new_v4())),
            Error::CommentNotFound(CommentId(Uuid::new_v4())),
        ];
        for err in errors {
            let parsed = Error::parse(&err.contents()).unwrap();
            assert_eq!(parsed, err);
        }
    }

    #[test]
    fn garbage_contents_do_not_parse() {
        assert!(Error::parse(b"not even json").is_err());
        assert!(Error::parse(br#"{"type":"weird"}"#).is_err());
        assert!(Error::parse(br#"{"type":"already-liked","id":"nope"}"#).is_err());
    }
}
