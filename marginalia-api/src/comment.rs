use std::str::FromStr;

use uuid::Uuid;

use crate::{Error, FieldError, Time};

const AUTHOR_MIN_CHARS: usize = 2;
const AUTHOR_MAX_CHARS: usize = 80;
const BODY_MIN_CHARS: usize = 5;
const BODY_MAX_CHARS: usize = 500;
const PARAGRAPH_MAX_CHARS: usize = 50;
const QUOTE_MAX_CHARS: usize = 300;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    Br,
    En,
}

impl Default for Locale {
    fn default() -> Locale {
        Locale::Br
    }
}

impl Locale {
    pub fn as_str(&self) -> &'static str {
        match self {
            Locale::Br => "br",
            Locale::En => "en",
        }
    }

    /// Case-insensitive parse, tolerating surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Locale> {
        match raw.trim().to_lowercase().as_str() {
            "br" => Some(Locale::Br),
            "en" => Some(Locale::En),
            _ => None,
        }
    }

    /// Parse an optional query/body parameter, defaulting to `br`.
    pub fn from_param(raw: Option<&str>) -> Result<Locale, Error> {
        match raw {
            None => Ok(Locale::default()),
            Some(raw) => Locale::parse(raw)
                .ok_or_else(|| Error::invalid_field("locale", "locale must be \"br\" or \"en\"")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AnchorKind {
    General,
    Inline,
}

impl AnchorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorKind::General => "general",
            AnchorKind::Inline => "inline",
        }
    }

    pub fn parse(raw: &str) -> Option<AnchorKind> {
        match raw.trim().to_lowercase().as_str() {
            "general" => Some(AnchorKind::General),
            "inline" => Some(AnchorKind::Inline),
            _ => None,
        }
    }
}

/// Where a comment is attached inside a post.
///
/// A `general` comment hangs off the post itself; an `inline` comment is
/// anchored to a text range inside one paragraph, with an optional verbatim
/// quote for re-display.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "anchor_type", rename_all = "lowercase")]
pub enum Anchor {
    General,
    Inline {
        paragraph_id: String,
        start_offset: i32,
        end_offset: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quote: Option<String>,
    },
}

impl Anchor {
    pub fn kind(&self) -> AnchorKind {
        match self {
            Anchor::General => AnchorKind::General,
            Anchor::Inline { .. } => AnchorKind::Inline,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub slug: String,
    pub author: String,
    pub body: String,
    pub locale: Locale,
    pub likes: i64,
    pub created_at: Time,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CommentId>,
    #[serde(flatten)]
    pub anchor: Anchor,
    /// Set when a stored inline anchor was incomplete and the comment had to
    /// be surfaced as `general` instead.
    #[serde(default)]
    pub reanchored: bool,
}

/// A page of the admin/moderation listing.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentPage {
    pub comments: Vec<Comment>,
    pub total: u64,
}

/// Optional anchor filters for listing endpoints.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommentFilter {
    pub kind: Option<AnchorKind>,
    pub paragraph_id: Option<String>,
}

impl CommentFilter {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.paragraph_id.is_none()
    }

    /// Parse the `anchor_type` / `paragraph_id` query parameters, reporting
    /// every violated field.
    pub fn from_params(
        anchor_type: Option<&str>,
        paragraph_id: Option<&str>,
    ) -> Result<CommentFilter, Error> {
        let mut violations = Vec::new();

        let kind = match anchor_type {
            None => None,
            Some(raw) => match AnchorKind::parse(raw) {
                Some(kind) => Some(kind),
                None => {
                    violations.push(FieldError::new(
                        "anchor_type",
                        "anchor_type must be \"general\" or \"inline\"",
                    ));
                    None
                }
            },
        };

        let paragraph_id = match paragraph_id {
            None => None,
            Some(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.chars().count() > PARAGRAPH_MAX_CHARS {
                    violations.push(FieldError::new(
                        "paragraph_id",
                        "paragraph_id must be between 1 and 50 characters",
                    ));
                    None
                } else {
                    Some(String::from(trimmed))
                }
            }
        };

        if violations.is_empty() {
            Ok(CommentFilter { kind, paragraph_id })
        } else {
            Err(Error::Validation(violations))
        }
    }
}

/// Parameters of the admin listing; clamping of limit/offset is the store's
/// responsibility.
#[derive(Clone, Debug, Default)]
pub struct ListAllParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub slug: Option<String>,
    pub locale: Option<Locale>,
    pub filter: CommentFilter,
}

/// A comment submission as it arrives on the wire. Everything is optional so
/// that validation can report all missing/invalid fields at once.
#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct NewComment {
    pub author: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub anchor_type: Option<String>,
    #[serde(default)]
    pub paragraph_id: Option<String>,
    #[serde(default)]
    pub start_offset: Option<i64>,
    #[serde(default)]
    pub end_offset: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub quote: Option<String>,
}

/// A fully validated submission, ready for the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommentDraft {
    pub slug: String,
    pub author: String,
    pub body: String,
    pub locale: Locale,
    pub parent_id: Option<CommentId>,
    pub anchor: Anchor,
}

fn contains_link(body: &str) -> bool {
    let lowered = body.to_lowercase();
    lowered.contains("http://") || lowered.contains("https://") || lowered.contains("www.")
}

impl NewComment {
    /// Validate a submission against the post `slug` it was sent to.
    ///
    /// `fallback_locale` is the locale of the surrounding request (query
    /// string); a locale in the body wins over it.
    pub fn validate(&self, slug: &str, fallback_locale: Locale) -> Result<CommentDraft, Error> {
        let mut violations = Vec::new();

        let slug = slug.trim().to_lowercase();
        if slug.is_empty() {
            violations.push(FieldError::new("slug", "slug must not be empty"));
        }

        let author = match self.author.as_deref().map(str::trim) {
            None => {
                violations.push(FieldError::new("author", "author is required"));
                ""
            }
            Some(author) => {
                let chars = author.chars().count();
                if chars < AUTHOR_MIN_CHARS {
                    violations.push(FieldError::new("author", "author is too short"));
                } else if chars > AUTHOR_MAX_CHARS {
                    violations.push(FieldError::new("author", "author is too long"));
                } else if author.contains(['<', '>']) {
                    violations.push(FieldError::new("author", "author must not contain markup"));
                }
                author
            }
        };

        let body = match self.body.as_deref().map(str::trim) {
            None => {
                violations.push(FieldError::new("body", "body is required"));
                ""
            }
            Some(body) => {
                let chars = body.chars().count();
                if chars < BODY_MIN_CHARS {
                    violations.push(FieldError::new("body", "body is too short"));
                } else if chars > BODY_MAX_CHARS {
                    violations.push(FieldError::new("body", "body is too long"));
                } else if contains_link(body) {
                    violations.push(FieldError::new("body", "links are not allowed"));
                }
                body
            }
        };

        let locale = match &self.locale {
            None => fallback_locale,
            Some(raw) => match Locale::parse(raw) {
                Some(locale) => locale,
                None => {
                    violations.push(FieldError::new("locale", "locale must be \"br\" or \"en\""));
                    fallback_locale
                }
            },
        };

        let parent_id = match &self.parent_id {
            None => None,
            Some(raw) => match Uuid::from_str(raw.trim()) {
                Ok(id) => Some(CommentId(id)),
                Err(_) => {
                    violations.push(FieldError::new("parent_id", "parent_id must be a valid id"));
                    None
                }
            },
        };

        let quote = match &self.quote {
            None => None,
            Some(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    None
                } else if trimmed.chars().count() > QUOTE_MAX_CHARS {
                    violations.push(FieldError::new("quote", "quote is too long"));
                    None
                } else {
                    Some(String::from(trimmed))
                }
            }
        };

        let kind = match &self.anchor_type {
            None => Some(AnchorKind::General),
            Some(raw) => match AnchorKind::parse(raw) {
                Some(kind) => Some(kind),
                None => {
                    violations.push(FieldError::new(
                        "anchor_type",
                        "anchor_type must be \"general\" or \"inline\"",
                    ));
                    None
                }
            },
        };

        let anchor = match kind {
            None => None,
            Some(AnchorKind::General) => Some(Anchor::General),
            Some(AnchorKind::Inline) => {
                // each inline field is checked on its own so that a request
                // missing several of them reports all of them
                let paragraph_id = match self.paragraph_id.as_deref().map(str::trim) {
                    None => {
                        violations.push(FieldError::new(
                            "paragraph_id",
                            "paragraph_id is required for inline comments",
                        ));
                        None
                    }
                    Some(trimmed)
                        if trimmed.is_empty()
                            || trimmed.chars().count() > PARAGRAPH_MAX_CHARS =>
                    {
                        violations.push(FieldError::new(
                            "paragraph_id",
                            "paragraph_id must be between 1 and 50 characters",
                        ));
                        None
                    }
                    Some(trimmed) => Some(String::from(trimmed)),
                };

                let start_offset = match self.start_offset {
                    None => {
                        violations.push(FieldError::new(
                            "start_offset",
                            "start_offset is required for inline comments",
                        ));
                        None
                    }
                    Some(start) if start < 0 => {
                        violations.push(FieldError::new(
                            "start_offset",
                            "start_offset must be at least 0",
                        ));
                        None
                    }
                    Some(start) => match i32::try_from(start) {
                        Ok(start) => Some(start),
                        Err(_) => {
                            violations.push(FieldError::new(
                                "start_offset",
                                "start_offset is out of range",
                            ));
                            None
                        }
                    },
                };

                let end_offset = match self.end_offset {
                    None => {
                        violations.push(FieldError::new(
                            "end_offset",
                            "end_offset is required for inline comments",
                        ));
                        None
                    }
                    Some(end) if end < 1 => {
                        violations.push(FieldError::new(
                            "end_offset",
                            "end_offset must be at least 1",
                        ));
                        None
                    }
                    Some(end) => match i32::try_from(end) {
                        Ok(end) => Some(end),
                        Err(_) => {
                            violations.push(FieldError::new(
                                "end_offset",
                                "end_offset is out of range",
                            ));
                            None
                        }
                    },
                };

                if let (Some(start), Some(end)) = (self.start_offset, self.end_offset) {
                    if end <= start {
                        violations.push(FieldError::new(
                            "end_offset",
                            "end_offset must be greater than start_offset",
                        ));
                    }
                }

                match (paragraph_id, start_offset, end_offset) {
                    (Some(paragraph_id), Some(start_offset), Some(end_offset))
                        if end_offset > start_offset =>
                    {
                        Some(Anchor::Inline {
                            paragraph_id,
                            start_offset,
                            end_offset,
                            quote: quote.clone(),
                        })
                    }
                    _ => None,
                }
            }
        };

        let anchor = match anchor {
            Some(anchor) if violations.is_empty() => anchor,
            _ => return Err(Error::Validation(violations)),
        };

        Ok(CommentDraft {
            slug,
            author: String::from(author),
            body: String::from(body),
            locale,
            parent_id,
            anchor,
        })
    }
}
