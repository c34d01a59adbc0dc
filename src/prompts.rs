//! Extraction instructions sent to the vision-language model.
//!
//! Centralising every prompt here keeps prompt edits away from the retry and
//! parsing logic in [`crate::pipeline::parse`], and lets tests inspect the
//! exact text without calling a model.
//!
//! Callers can override the first-request instruction via
//! [`crate::config::IngestConfig::extraction_prompt`].

/// Instruction for the first request of a document (pages `1..=N`).
///
/// Asks for the document metadata plus the chunks found on those pages.
pub const EXTRACTION_PROMPT: &str = r#"You are reading scanned pages of a legal or government document. The text may be in Arabic, English or French.

Extract:
- "title": the full official title of the document, as printed
- "year": the year the document was issued, as an integer (e.g. 2024)
- "issuing_authority": the ministry, court or body that issued it
- "chunks": the complete text of every page, split into logical sections
  (articles, clauses, chapters) in reading order

Rules:
1. Copy text exactly as printed. Do not translate, summarise or correct it.
2. Each chunk has a "heading" (the article or section label, or "" if none)
   and a "text" (the section body).
3. Ignore page numbers, stamps and repeated headers/footers.
4. Answer with ONE JSON object and nothing else, no commentary, no fences:

{"title": "...", "year": 2024, "issuing_authority": "...", "chunks": [{"heading": "...", "text": "..."}]}"#;

/// Build the instruction for a follow-up request (pages after the first batch).
///
/// Only chunks are requested; metadata comes from the first request.
pub fn continuation_prompt(first_page: usize, last_page: usize) -> String {
    format!(
        r#"These are pages {first_page} to {last_page} of the same legal document.

Extract the complete text of these pages, split into logical sections in reading order.
Copy text exactly as printed. Continue any article or section that began on an earlier page.

Answer with ONE JSON object and nothing else, no commentary, no fences:

{{"chunks": [{{"heading": "...", "text": "..."}}]}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_prompt_names_every_required_field() {
        for field in ["\"title\"", "\"year\"", "\"issuing_authority\"", "\"chunks\""] {
            assert!(EXTRACTION_PROMPT.contains(field), "missing {field}");
        }
    }

    #[test]
    fn continuation_prompt_mentions_page_range() {
        let p = continuation_prompt(11, 20);
        assert!(p.contains("pages 11 to 20"));
        assert!(p.contains("{\"chunks\""));
        assert!(!p.contains("issuing_authority"));
    }
}
