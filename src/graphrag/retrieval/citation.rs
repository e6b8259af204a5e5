//! Maps answer sentences back to the context records that support them.
//!
//! Every citation produced here points at a record of the
//! [`AssembledContext`] the answer was generated from. Markers naming a
//! label outside the context are removed from the answer text.

use std::collections::{BTreeSet, HashMap};

use crate::graphrag::domain::{AnswerSegment, Citation};

use super::context::AssembledContext;

const EXCERPT_CHARS: usize = 200;

const ABBREVIATIONS: &[&str] = &["dr", "mr", "mrs", "ms", "st", "vs", "no", "fig", "e.g", "i.e", "approx"];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "with", "that", "this", "from", "has", "have",
    "not", "but", "its", "can", "may", "who", "what", "which", "their", "there", "into", "also",
    "been", "should", "would", "could", "these", "those", "than", "then", "they", "them",
];

/// Answer text with segment-level citations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CitedAnswer {
    pub answer: String,
    pub segments: Vec<AnswerSegment>,
    pub citations: Vec<Citation>,
}

/// Attach citations to every sentence of `raw`.
pub fn assemble(raw: &str, context: &AssembledContext) -> CitedAnswer {
    let answer = clean_markers(raw, context);
    if context.is_empty() {
        return CitedAnswer {
            answer,
            ..CitedAnswer::default()
        };
    }

    let mut citations: Vec<Citation> = Vec::new();
    let mut by_label: HashMap<usize, usize> = HashMap::new();
    let mut segments = Vec::new();

    for sentence in split_segments(&answer) {
        let mut labels = marker_labels(&sentence);
        if labels.is_empty() {
            labels.push(best_overlap(&sentence, context));
        }

        let mut indices = Vec::new();
        for label in labels {
            let Some(record) = context.record(label) else {
                continue;
            };
            let index = *by_label.entry(label).or_insert_with(|| {
                citations.push(Citation {
                    source_type: record.source.source_type,
                    source_id: record.source.source_id.clone(),
                    excerpt: excerpt(&record.text),
                });
                citations.len() - 1
            });
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        segments.push(AnswerSegment {
            text: sentence,
            citations: indices,
        });
    }

    CitedAnswer {
        answer,
        segments,
        citations,
    }
}

fn excerpt(text: &str) -> String {
    let mut out: String = text.chars().take(EXCERPT_CHARS).collect();
    if out.len() < text.len() {
        out.push_str("...");
    }
    out
}

// =============================================================================
// Markers
// =============================================================================

/// A bracketed marker such as `[3]` or `[1, 4]` starting at `open`.
/// Returns the labels and the byte offset just past `]`.
fn parse_marker(text: &str, open: usize) -> Option<(Vec<usize>, usize)> {
    let rest = text.get(open..)?;
    if !rest.starts_with('[') {
        return None;
    }
    let close = rest.find(']')?;
    let inner = &rest[1..close];
    if inner.trim().is_empty() || inner.len() > 40 {
        return None;
    }
    let labels = inner
        .split(',')
        .map(|part| part.trim().parse::<usize>().ok())
        .collect::<Option<Vec<_>>>()?;
    Some((labels, open + close + 1))
}

/// Rewrite markers so only labels present in the context remain.
fn clean_markers(raw: &str, context: &AssembledContext) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pos = 0;
    while let Some(offset) = raw[pos..].find('[') {
        let open = pos + offset;
        out.push_str(&raw[pos..open]);
        match parse_marker(raw, open) {
            Some((labels, end)) => {
                let valid: Vec<String> = labels
                    .into_iter()
                    .filter(|l| context.record(*l).is_some())
                    .map(|l| l.to_string())
                    .collect();
                if valid.is_empty() {
                    let trimmed = out.trim_end_matches([' ', '\t']).len();
                    out.truncate(trimmed);
                } else {
                    out.push('[');
                    out.push_str(&valid.join(", "));
                    out.push(']');
                }
                pos = end;
            }
            None => {
                out.push('[');
                pos = open + 1;
            }
        }
    }
    out.push_str(&raw[pos..]);
    out
}

fn marker_labels(sentence: &str) -> Vec<usize> {
    let mut labels = Vec::new();
    let mut pos = 0;
    while let Some(offset) = sentence[pos..].find('[') {
        let open = pos + offset;
        match parse_marker(sentence, open) {
            Some((found, end)) => {
                for label in found {
                    if !labels.contains(&label) {
                        labels.push(label);
                    }
                }
                pos = end;
            }
            None => pos = open + 1,
        }
    }
    labels
}

// =============================================================================
// Segmentation
// =============================================================================

/// Offset past any markers (and the blanks before them) that follow `end`.
fn absorb_markers(text: &str, mut end: usize) -> usize {
    loop {
        let rest = &text[end..];
        let blanks = rest.len() - rest.trim_start_matches([' ', '\t']).len();
        match parse_marker(text, end + blanks) {
            Some((_, after)) => end = after,
            None => return end,
        }
    }
}

fn ends_with_abbreviation(segment: &str) -> bool {
    let last = segment
        .rsplit(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    ABBREVIATIONS.contains(&last.as_str())
}

/// Split into sentences. Citation markers directly after the terminating
/// punctuation stay with the sentence they follow.
fn split_segments(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut pos = 0;

    while let Some(c) = text[pos..].chars().next() {
        let next = pos + c.len_utf8();
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => {
                let follows = text[next..].chars().next();
                let spaced = follows.is_none_or(|f| f.is_whitespace() || f == '[');
                spaced && !(c == '.' && ends_with_abbreviation(&text[start..pos]))
            }
            _ => false,
        };
        if boundary {
            let end = absorb_markers(text, next);
            push_segment(&mut segments, &text[start..end]);
            start = end;
            pos = end;
        } else {
            pos = next;
        }
    }
    push_segment(&mut segments, &text[start..]);
    segments
}

fn push_segment(segments: &mut Vec<String>, piece: &str) {
    let piece = piece.trim();
    if piece.chars().any(char::is_alphanumeric) {
        segments.push(piece.to_string());
    }
}

// =============================================================================
// Lexical fallback
// =============================================================================

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Label of the record sharing the most terms with `sentence`; the first
/// record when nothing overlaps.
fn best_overlap(sentence: &str, context: &AssembledContext) -> usize {
    let wanted = terms(sentence);
    let mut best = (0, 1);
    for record in &context.records {
        let overlap = terms(&record.text).intersection(&wanted).count();
        if overlap > best.0 {
            best = (overlap, record.label);
        }
    }
    best.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphrag::domain::SourceType;
    use crate::graphrag::retrieval::context::ContextBuilder;

    fn context() -> AssembledContext {
        let mut builder = ContextBuilder::new(10_000);
        builder.push(SourceType::Chunk, "c1", "Dr. Smith treats diabetes at Toronto General.");
        builder.push(SourceType::Entity, "e1", "Toronto General (organization): a hospital in Toronto");
        builder.push(SourceType::Community, "0-0", "# Diabetes care\n\nMetformin is first line.");
        builder.finish()
    }

    #[test]
    fn test_markers_attach_to_sentences() {
        let result = assemble(
            "Dr. Smith treats diabetes [1]. Toronto General is a hospital. [2][1]",
            &context(),
        );
        assert_eq!(result.segments.len(), 2);
        assert_eq!(result.segments[0].text, "Dr. Smith treats diabetes [1].");
        assert_eq!(result.segments[0].citations, [0]);
        assert_eq!(result.segments[1].citations, [1, 0]);
        assert_eq!(result.citations.len(), 2);
        assert_eq!(result.citations[0].source_id, "c1");
        assert_eq!(result.citations[1].source_type, SourceType::Entity);
    }

    #[test]
    fn test_unknown_markers_are_dropped() {
        let result = assemble("Metformin is first line [3, 9]. Insulin helps [42].", &context());
        assert_eq!(result.answer, "Metformin is first line [3]. Insulin helps.");
        let cited: Vec<_> = result.citations.iter().map(|c| c.source_id.as_str()).collect();
        assert!(cited.contains(&"0-0"));
        assert!(!result.answer.contains("42"));
        for segment in &result.segments {
            assert!(!segment.citations.is_empty());
        }
    }

    #[test]
    fn test_uncited_sentence_uses_overlap() {
        let result = assemble("Toronto General is a hospital.", &context());
        assert_eq!(result.citations.len(), 1);
        assert_eq!(result.citations[0].source_id, "e1");
    }

    #[test]
    fn test_empty_context_yields_no_citations() {
        let result = assemble("Nothing found [1].", &AssembledContext::default());
        assert!(result.citations.is_empty());
        assert!(result.segments.is_empty());
        assert_eq!(result.answer, "Nothing found.");
    }

    #[test]
    fn test_decimals_do_not_split() {
        assert_eq!(split_segments("Target A1C is 7.0 or lower. Check yearly."), [
            "Target A1C is 7.0 or lower.",
            "Check yearly."
        ]);
    }
}
