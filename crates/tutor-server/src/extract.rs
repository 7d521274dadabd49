//! Extraction of structured answers from model output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Error text returned when a completion holds no fenced code block.
pub const NO_CODE_BLOCK: &str = "No code block found in the response.";

/// Fenced Markdown block with an optional language tag on the opening line.
static CODE_BLOCK: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"```(?:[a-zA-Z]*\n)?([\s\S]*?)```").ok());

/// Returns the trimmed content of the first fenced code block in `text`.
///
/// Blocks that are empty after trimming count as missing.
#[must_use]
pub fn first_code_block(text: &str) -> Option<&str> {
    CODE_BLOCK
        .as_ref()?
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|code| !code.is_empty())
}

/// The JSON object the model emits for build, patch and fix requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReply {
    /// Blockly XML document.
    pub xml: String,
    /// Explanation shown to the child.
    pub message: String,
}

impl BlockReply {
    /// Parses the model's text as a `BlockReply`.
    ///
    /// Accepts the object either bare or wrapped in a fenced code block.
    /// Returns `None` unless both fields are present strings and `xml` is
    /// non-empty.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let candidate = serde_json::from_str::<Self>(text.trim()).ok().or_else(|| {
            first_code_block(text).and_then(|inner| serde_json::from_str::<Self>(inner).ok())
        })?;

        if candidate.xml.trim().is_empty() {
            return None;
        }
        Some(candidate)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_block_trimmed() {
        let text = "Here you go:\n```xml\n  <xml><block type=\"text\"/></xml>\n```\nand\n```\nsecond\n```";
        assert_eq!(
            first_code_block(text),
            Some("<xml><block type=\"text\"/></xml>")
        );
    }

    #[test]
    fn extracts_block_without_language_tag() {
        assert_eq!(first_code_block("```\n<xml/>\n```"), Some("<xml/>"));
        assert_eq!(first_code_block("```<xml/>```"), Some("<xml/>"));
    }

    #[test]
    fn missing_or_unterminated_block_is_none() {
        assert_eq!(first_code_block("no fences here"), None);
        assert_eq!(first_code_block("```xml\n<xml/>"), None);
        assert_eq!(first_code_block("```xml\n   \n```"), None);
    }

    #[test]
    fn language_tag_requires_newline() {
        // Without a newline the tag is part of the content.
        assert_eq!(first_code_block("```xml <xml/>```"), Some("xml <xml/>"));
    }

    #[test]
    fn block_reply_parses_bare_json() {
        let reply = BlockReply::parse(r#" {"xml": "<xml/>", "message": "できたよ"} "#).unwrap();
        assert_eq!(reply.xml, "<xml/>");
        assert_eq!(reply.message, "できたよ");
    }

    #[test]
    fn block_reply_parses_fenced_json() {
        let text = "```json\n{\"xml\": \"<xml/>\", \"message\": \"ok\"}\n```";
        assert_eq!(BlockReply::parse(text).unwrap().message, "ok");
    }

    #[test]
    fn block_reply_rejects_incomplete_objects() {
        assert!(BlockReply::parse(r#"{"xml": "<xml/>"}"#).is_none());
        assert!(BlockReply::parse(r#"{"xml": "", "message": "m"}"#).is_none());
        assert!(BlockReply::parse(r#"{"xml": 1, "message": "m"}"#).is_none());
        assert!(BlockReply::parse("").is_none());
    }
}
