//! Normalize stage: canonical whitespace, contiguous chunk indices, hashes.
//!
//! Scanned legal texts come back from the model with zero-width characters,
//! soft hyphens, CRLF line endings, runs of spaces and piles of blank lines.
//! Two rules handle it:
//!
//! - **inline** (title, authority, headings): every whitespace run becomes a
//!   single space.
//! - **block** (chunk text): line structure is kept, horizontal runs are
//!   collapsed, trailing spaces are dropped, and at most one blank line
//!   separates paragraphs.
//!
//! Both rules strip invisible characters and trim the ends. ZWNJ/ZWJ are
//! kept: they change how Arabic-script text is shaped.

use crate::document::{Chunk, ExtractedDocument};
use crate::pipeline::validate::ValidatedExtraction;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_HSPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\S\n]+").unwrap());
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn remove_invisible_chars(input: &str) -> String {
    input.replace(['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{2060}'], "")
}

/// Single-line canonical form.
pub fn canonical_inline(input: &str) -> String {
    let visible = remove_invisible_chars(input);
    RE_WS.replace_all(&visible, " ").trim().to_string()
}

/// Multi-line canonical form.
pub fn canonical_block(input: &str) -> String {
    let visible = remove_invisible_chars(input).replace("\r\n", "\n").replace('\r', "\n");
    let collapsed = RE_HSPACE.replace_all(&visible, " ");
    let lines: Vec<&str> = collapsed.lines().map(str::trim).collect();
    let joined = lines.join("\n");
    RE_BLANK_LINES
        .replace_all(&joined, "\n\n")
        .trim()
        .to_string()
}

/// True when nothing but whitespace and invisible characters remain.
pub fn is_blank(input: &str) -> bool {
    canonical_inline(input).is_empty()
}

/// Hex SHA-256 of `heading` + `\n` + `text`.
pub fn content_hash(heading: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(heading.as_bytes());
    hasher.update(b"\n");
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Run the Normalize stage.
///
/// Chunks whose text canonicalises to nothing are dropped before indices
/// are assigned, so `chunks[i].sequence_index == i` always holds.
pub fn normalize(
    validated: ValidatedExtraction,
    source_url: &str,
    url_hash: &str,
) -> ExtractedDocument {
    let chunks: Vec<Chunk> = validated
        .chunks
        .into_iter()
        .filter_map(|c| {
            let text = canonical_block(&c.text);
            (!text.is_empty()).then(|| (canonical_inline(&c.heading), text))
        })
        .enumerate()
        .map(|(sequence_index, (heading, text))| Chunk {
            sequence_index,
            content_hash: content_hash(&heading, &text),
            heading,
            text,
        })
        .collect();

    ExtractedDocument::new(
        Uuid::new_v4(),
        source_url.to_string(),
        url_hash.to_string(),
        canonical_inline(&validated.title),
        validated.year,
        canonical_inline(&validated.issuing_authority),
        chunks,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::validate::ValidatedChunk;

    fn chunk(heading: &str, text: &str) -> ValidatedChunk {
        ValidatedChunk {
            heading: heading.into(),
            text: text.into(),
        }
    }

    #[test]
    fn inline_collapses_everything() {
        assert_eq!(canonical_inline("  Décret\t n°\n 12 \u{200B}"), "Décret n° 12");
    }

    #[test]
    fn block_keeps_paragraphs() {
        let raw = "Article 1\r\n\r\n\r\n\r\nLe   présent\u{00AD} décret   \nentre en vigueur.  ";
        assert_eq!(
            canonical_block(raw),
            "Article 1\n\nLe présent décret\nentre en vigueur."
        );
    }

    #[test]
    fn zwnj_survives() {
        assert_eq!(canonical_inline("می\u{200C}شود"), "می\u{200C}شود");
    }

    #[test]
    fn blank_detection() {
        assert!(is_blank(""));
        assert!(is_blank(" \n\t\u{FEFF}"));
        assert!(!is_blank(" a "));
    }

    #[test]
    fn hash_is_stable_and_separates_heading() {
        assert_eq!(content_hash("a", "b"), content_hash("a", "b"));
        assert_ne!(content_hash("a", "b"), content_hash("", "a\nb\n"));
        assert_eq!(content_hash("a", "b").len(), 64);
    }

    #[test]
    fn reindexes_contiguously() {
        let doc = normalize(
            ValidatedExtraction {
                title: " Decree  12 ".into(),
                year: 2023,
                issuing_authority: "Ministry\nof Justice".into(),
                chunks: vec![
                    chunk("Art. 1", "one"),
                    chunk("", "\u{200B} \n"),
                    chunk(" Art.  2 ", " two "),
                ],
            },
            "https://gov.example/decree-12.pdf",
            "abc",
        );
        assert_eq!(doc.title(), "Decree 12");
        assert_eq!(doc.issuing_authority(), "Ministry of Justice");
        let chunks = doc.chunks();
        assert_eq!(chunks.len(), 2);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence_index, i);
        }
        assert_eq!(chunks[1].heading, "Art. 2");
        assert_eq!(chunks[1].text, "two");
        assert_eq!(chunks[1].content_hash, content_hash("Art. 2", "two"));
    }
}
