//! Importing review-platform comments as notes.
//!
//! The platform client (not part of this crate) fetches comments and hands
//! them over as ordered [`ReviewComment`] batches, oldest first. One batch
//! becomes one aggregated note: each comment is rendered into a canonical
//! text block with a stable field order and delimiter, so re-importing the
//! same batch produces the same payload bytes and deduplicates in the note
//! store. [`comments_from_json`] adapts a platform's raw JSON comment list.

use std::fmt;

use itertools::Itertools;
use serde_json::Value as JsonValue;

use crate::note::Note;

/// Author recorded on aggregated import notes.
pub const IMPORT_AUTHOR: &str = "import";

/// A single review comment as delivered by the platform client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewComment {
    pub author: String,
    /// Creation time as reported by the platform, in its own resolution.
    pub created_at: u64,
    pub body: String,
}

/// Renders one comment into its canonical text block.
pub fn format_comment(comment: &ReviewComment) -> String {
    format!(
        "author: {}\ndate: {}\n\n{}\n",
        comment.author, comment.created_at, comment.body
    )
}

/// Aggregates a non-empty batch of comments into one note payload.
///
/// The comments are kept in the order the caller supplied; the platform
/// client delivers them oldest first and this adapter does not re-sort.
pub fn aggregate(namespace: &str, comments: &[ReviewComment]) -> Note {
    let content = comments.iter().map(format_comment).join("\n");
    let created_at = comments
        .iter()
        .map(|comment| comment.created_at)
        .max()
        .expect("aggregate requires a non-empty batch");
    Note::new(namespace, IMPORT_AUTHOR, created_at, content.into_bytes())
}

/// Error raised while converting a platform's JSON comment list.
#[derive(Debug)]
pub enum JsonImportError {
    /// Failed to parse JSON text before conversion.
    Parse(serde_json::Error),
    /// The top-level document was not an array of comments.
    NotAnArray,
    /// A comment object lacked a required field.
    MissingField { index: usize, field: &'static str },
    /// A comment field had the wrong type.
    BadField { index: usize, field: &'static str },
}

impl fmt::Display for JsonImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "failed to parse JSON: {err}"),
            Self::NotAnArray => write!(f, "comment document root must be an array"),
            Self::MissingField { index, field } => {
                write!(f, "comment {index} is missing field {field:?}")
            }
            Self::BadField { index, field } => {
                write!(f, "comment {index} has a malformed field {field:?}")
            }
        }
    }
}

impl std::error::Error for JsonImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}

fn str_field(
    object: &serde_json::Map<String, JsonValue>,
    index: usize,
    field: &'static str,
) -> Result<String, JsonImportError> {
    let value = object
        .get(field)
        .ok_or(JsonImportError::MissingField { index, field })?;
    value
        .as_str()
        .map(str::to_string)
        .ok_or(JsonImportError::BadField { index, field })
}

/// Parses a JSON array of `{author, created_at, body}` objects into
/// [`ReviewComment`]s, preserving the array order.
pub fn comments_from_json(text: &str) -> Result<Vec<ReviewComment>, JsonImportError> {
    let document: JsonValue = serde_json::from_str(text).map_err(JsonImportError::Parse)?;
    let items = document.as_array().ok_or(JsonImportError::NotAnArray)?;

    let mut comments = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let object = item.as_object().ok_or(JsonImportError::BadField {
            index,
            field: "comment",
        })?;
        let author = str_field(object, index, "author")?;
        let body = str_field(object, index, "body")?;
        let created_at = object
            .get("created_at")
            .ok_or(JsonImportError::MissingField {
                index,
                field: "created_at",
            })?
            .as_u64()
            .ok_or(JsonImportError::BadField {
                index,
                field: "created_at",
            })?;
        comments.push(ReviewComment {
            author,
            created_at,
            body,
        });
    }
    Ok(comments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_blocks_are_stable() {
        let comment = ReviewComment {
            author: "drew".to_string(),
            created_at: 12,
            body: "ship it".to_string(),
        };
        assert_eq!(format_comment(&comment), "author: drew\ndate: 12\n\nship it\n");
    }

    #[test]
    fn aggregate_keeps_caller_order() {
        let comments = vec![
            ReviewComment {
                author: "drew".to_string(),
                created_at: 5,
                body: "first".to_string(),
            },
            ReviewComment {
                author: "sam".to_string(),
                created_at: 9,
                body: "second".to_string(),
            },
        ];
        let note = aggregate("github-comments", &comments);
        assert_eq!(note.author, IMPORT_AUTHOR);
        assert_eq!(note.created_at, 9);
        let text = std::str::from_utf8(&note.content).unwrap();
        assert!(text.find("first").unwrap() < text.find("second").unwrap());
    }

    #[test]
    fn json_comments_parse_in_order() {
        let text = r#"[
            {"author": "drew", "created_at": 5, "body": "first"},
            {"author": "sam", "created_at": 9, "body": "second"}
        ]"#;
        let comments = comments_from_json(text).expect("well-formed comments");
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].author, "drew");
        assert_eq!(comments[1].created_at, 9);
    }

    #[test]
    fn json_missing_field_is_reported() {
        let text = r#"[{"author": "drew", "created_at": 5}]"#;
        let err = comments_from_json(text).expect_err("body is required");
        assert!(matches!(
            err,
            JsonImportError::MissingField { index: 0, field: "body" }
        ));
    }

    #[test]
    fn json_root_must_be_an_array() {
        let err = comments_from_json(r#"{"author": "drew"}"#).expect_err("object root");
        assert!(matches!(err, JsonImportError::NotAnArray));
    }
}
