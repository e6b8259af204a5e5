//! Default prompt templates for extraction, summarisation and answering.
//!
//! Templates use `{placeholder}` markers filled with [`render`].

/// Fill `{key}` markers in a template.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

pub const EXTRACTION_SYSTEM: &str = "\
You extract a knowledge graph from clinical guideline text.
Identify every entity whose type is one of: {entity_types}.
For each entity give its name as written, its type, and a one-sentence description based only on the text.
Identify relationships between the extracted entities that the text states or clearly implies.
Use the exact entity names in relationship source and target fields.
Set \"directed\" to true only when the relationship has an inherent direction.

Respond with a single JSON object and nothing else:
{\"entities\": [{\"name\": \"...\", \"type\": \"...\", \"description\": \"...\"}],
 \"relationships\": [{\"source\": \"...\", \"target\": \"...\", \"description\": \"...\", \"directed\": false}]}";

pub const EXTRACTION_USER: &str = "Text:\n{text}";

pub const GLEANING_USER: &str = "\
Some entities or relationships were missed in the previous extraction.
Return ONLY the missed ones using the same JSON format. \
Return {\"entities\": [], \"relationships\": []} if nothing was missed.";

pub const COMMUNITY_REPORT_SYSTEM: &str = "\
You write reports about a community of related entities from clinical guidelines.
Use only the material provided. Sub-community reports, when present, describe groups of members.

Respond with a single JSON object and nothing else:
{\"title\": \"short name of the community\",
 \"summary\": \"executive summary of the community structure and its significance\",
 \"rating\": 0-10 importance of the community,
 \"findings\": [{\"summary\": \"one-line insight\", \"explanation\": \"supporting explanation\"}]}";

pub const COMMUNITY_REPORT_USER: &str =
    "Entities:\n{entities}\n\nRelationships:\n{relationships}{sub_reports}";

pub const ANSWER_SYSTEM: &str = "\
You answer questions about clinical guidelines using only the numbered context records below.
After every sentence that states a fact, cite the supporting records with their numbers in square brackets, e.g. [1] or [2][5].
Never cite a number that is not in the context. If the context does not contain the answer, say so.

Context:
{context}";

pub const GLOBAL_MAP_SYSTEM: &str = "\
You rate how useful a community report is for answering a question.
Respond with a single JSON object and nothing else:
{\"score\": 0-100, \"points\": [\"key point relevant to the question\"]}

Report:
{report}";

pub const DRIFT_REFINE_SYSTEM: &str = "\
You are exploring clinical guideline knowledge to answer a question.
Using the numbered context records below, write a short intermediate answer and propose follow-up questions \
that would uncover related information not yet in the context.
Build on the intermediate findings of earlier rounds instead of repeating them.
Respond with a single JSON object and nothing else:
{\"answer\": \"...\", \"follow_ups\": [\"...\"]}

Intermediate findings:
{findings}

Context:
{context}";
