//! Validate stage: schema checks on a decoded extraction.
//!
//! Checks run in a fixed order and stop at the first violation:
//!
//! 1. `title` present and not blank
//! 2. `year` present and within the plausible range
//! 3. `issuing_authority` present and not blank
//! 4. `chunks` present and non-empty, every chunk with non-blank `text`
//!
//! Every violation is a [`ValidationError`], which the retry policy never
//! retries: a model that omitted the title will usually omit it again.

use crate::error::ValidationError;
use crate::pipeline::normalize::is_blank;
use crate::pipeline::parse::RawExtraction;

/// An extraction that passed every check. Fields are still un-normalised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedExtraction {
    pub title: String,
    pub year: i32,
    pub issuing_authority: String,
    pub chunks: Vec<ValidatedChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedChunk {
    pub heading: String,
    pub text: String,
}

/// Run the Validate stage. `year_bounds` is inclusive.
pub fn validate(
    raw: &RawExtraction,
    year_bounds: (i32, i32),
) -> Result<ValidatedExtraction, ValidationError> {
    let title = non_blank(raw.title.as_deref()).ok_or(ValidationError::MissingTitle)?;

    let year = raw.year.ok_or(ValidationError::MissingYear)?;
    let (min, max) = year_bounds;
    if year < i64::from(min) || year > i64::from(max) {
        return Err(ValidationError::YearOutOfRange { year, min, max });
    }

    let issuing_authority = non_blank(raw.issuing_authority.as_deref())
        .ok_or(ValidationError::MissingIssuingAuthority)?;

    let raw_chunks = match raw.chunks.as_deref() {
        Some(chunks) if !chunks.is_empty() => chunks,
        _ => return Err(ValidationError::NoChunks),
    };
    let mut chunks = Vec::with_capacity(raw_chunks.len());
    for (index, chunk) in raw_chunks.iter().enumerate() {
        let text =
            non_blank(chunk.text.as_deref()).ok_or(ValidationError::EmptyChunkText { index })?;
        chunks.push(ValidatedChunk {
            heading: chunk.heading.clone().unwrap_or_default(),
            text,
        });
    }

    Ok(ValidatedExtraction {
        title,
        // In range, so it fits.
        year: year as i32,
        issuing_authority,
        chunks,
    })
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.filter(|v| !is_blank(v)).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::parse::RawChunk;

    const BOUNDS: (i32, i32) = (1900, 2027);

    fn good() -> RawExtraction {
        RawExtraction {
            title: Some("Décret n° 2-23-12".into()),
            year: Some(2023),
            issuing_authority: Some("Ministère de la Justice".into()),
            chunks: Some(vec![
                RawChunk {
                    heading: Some("Article 1".into()),
                    text: Some("Le présent décret...".into()),
                },
                RawChunk {
                    heading: None,
                    text: Some("Fait à Rabat".into()),
                },
            ]),
        }
    }

    #[test]
    fn accepts_a_complete_extraction() {
        let v = validate(&good(), BOUNDS).unwrap();
        assert_eq!(v.year, 2023);
        assert_eq!(v.chunks.len(), 2);
        assert_eq!(v.chunks[1].heading, "");
    }

    #[test]
    fn blank_title_is_rejected() {
        let mut x = good();
        x.title = Some(" \u{200B}\n".into());
        assert_eq!(validate(&x, BOUNDS), Err(ValidationError::MissingTitle));
    }

    #[test]
    fn year_bounds_are_inclusive() {
        let mut x = good();
        x.year = Some(1900);
        assert!(validate(&x, BOUNDS).is_ok());
        x.year = Some(2027);
        assert!(validate(&x, BOUNDS).is_ok());
        x.year = Some(2028);
        assert_eq!(
            validate(&x, BOUNDS),
            Err(ValidationError::YearOutOfRange {
                year: 2028,
                min: 1900,
                max: 2027
            })
        );
        x.year = Some(1899);
        assert!(validate(&x, BOUNDS).is_err());
    }

    #[test]
    fn checks_run_in_order() {
        // Everything is wrong; the title is reported first.
        assert_eq!(
            validate(&RawExtraction::default(), BOUNDS),
            Err(ValidationError::MissingTitle)
        );

        let mut x = good();
        x.year = None;
        x.issuing_authority = None;
        assert_eq!(validate(&x, BOUNDS), Err(ValidationError::MissingYear));

        let mut x = good();
        x.issuing_authority = Some(String::new());
        x.chunks = None;
        assert_eq!(
            validate(&x, BOUNDS),
            Err(ValidationError::MissingIssuingAuthority)
        );
    }

    #[test]
    fn chunk_rules() {
        let mut x = good();
        x.chunks = Some(vec![]);
        assert_eq!(validate(&x, BOUNDS), Err(ValidationError::NoChunks));

        let mut x = good();
        x.chunks.as_mut().unwrap()[1].text = Some("   ".into());
        assert_eq!(
            validate(&x, BOUNDS),
            Err(ValidationError::EmptyChunkText { index: 1 })
        );
    }
}
