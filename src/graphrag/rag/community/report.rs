//! Community report generation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::graphrag::defaults::{COMMUNITY_REPORT_SYSTEM, COMMUNITY_REPORT_USER, render};
use crate::graphrag::domain::{Community, CommunityReport, Finding, KnowledgeGraph};
use crate::graphrag::rag::extraction::parse::parse_json;
use crate::graphrag::runtime::TokenService;
use crate::llm::{CompletionRequest, LanguageModel, LlmError, ModelBudget, RetryPolicy};

/// Number of highest-degree members listed as key entities.
const KEY_ENTITIES: usize = 10;

#[derive(Debug, Deserialize)]
struct RawReport {
    title: String,
    summary: String,
    #[serde(default)]
    rating: f32,
    #[serde(default)]
    findings: Vec<RawFinding>,
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    summary: String,
    #[serde(default)]
    explanation: String,
}

/// A report that could not be produced.
#[derive(Debug, Clone)]
pub struct ReportFailure {
    pub community_id: String,
    pub attempts: u32,
    pub reason: String,
}

/// Summarises communities with the language model.
#[derive(Clone)]
pub struct CommunityReporter {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    max_input_tokens: usize,
}

impl std::fmt::Debug for CommunityReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunityReporter")
            .field("model", &self.model.model_id())
            .field("max_input_tokens", &self.max_input_tokens)
            .finish()
    }
}

impl CommunityReporter {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy, max_input_tokens: usize) -> Self {
        Self {
            model,
            retry,
            max_input_tokens,
        }
    }

    /// Generate reports for every community, deepest level first, so that a
    /// parent whose member list exceeds the input budget can be described
    /// through its children's reports. Communities of one level run
    /// concurrently within the budget; levels not yet started when `cancel`
    /// fires are skipped.
    pub async fn generate_all(
        &self,
        graph: &KnowledgeGraph,
        budget: &ModelBudget,
        cancel: &CancellationToken,
    ) -> (Vec<CommunityReport>, Vec<ReportFailure>) {
        let mut reports: BTreeMap<String, CommunityReport> = BTreeMap::new();
        let mut failures = Vec::new();

        let Some(max_level) = graph.max_level() else {
            return (Vec::new(), failures);
        };
        for level in (0..=max_level).rev() {
            if cancel.is_cancelled() {
                break;
            }
            let mut tasks = JoinSet::new();
            for community in graph.communities_at(level) {
                let input = self.prompt_input(graph, community, &reports);
                let key_entity_ids = key_entities(graph, community);
                let reporter = self.clone();
                let budget = budget.clone();
                let community_id = community.id.clone();
                tasks.spawn(async move {
                    let outcome = reporter.generate(&community_id, &input, key_entity_ids, &budget).await;
                    (community_id, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((community_id, Ok(report))) => {
                        reports.insert(community_id, report);
                    }
                    Ok((community_id, Err(failure))) => {
                        warn!(community_id = %community_id, reason = %failure.reason, "Community report failed");
                        failures.push(failure);
                    }
                    Err(e) => warn!(error = %e, "Community report task panicked"),
                }
            }
            debug!(level, reports = reports.len(), "Community level reported");
        }

        failures.sort_by(|a, b| a.community_id.cmp(&b.community_id));
        (reports.into_values().collect(), failures)
    }

    async fn generate(
        &self,
        community_id: &str,
        input: &ReportInput,
        key_entity_ids: Vec<String>,
        budget: &ModelBudget,
    ) -> Result<CommunityReport, ReportFailure> {
        let sub_reports = if input.sub_reports.is_empty() {
            String::new()
        } else {
            format!("\n\nSub-community reports:\n{}", input.sub_reports)
        };
        let user = render(
            COMMUNITY_REPORT_USER,
            &[
                ("entities", &input.entities),
                ("relationships", &input.relationships),
                ("sub_reports", &sub_reports),
            ],
        );
        let mut used = 0;
        let raw: RawReport = self
            .retry
            .run(budget, |attempt| {
                used = attempt;
                let model = Arc::clone(&self.model);
                let request = CompletionRequest::new(COMMUNITY_REPORT_SYSTEM, user.clone()).json();
                async move {
                    let text = model.complete(request).await?;
                    let raw: RawReport = parse_json(&text)?;
                    if raw.title.trim().is_empty() || raw.summary.trim().is_empty() {
                        return Err(LlmError::MalformedResponse(
                            "report title and summary are required".into(),
                        ));
                    }
                    Ok(raw)
                }
            })
            .await
            .map_err(|f| ReportFailure {
                community_id: community_id.to_string(),
                attempts: f.attempts,
                reason: f.error.to_string(),
            })?;

        debug!(community_id, attempts = used, "Community report generated");
        Ok(CommunityReport {
            community_id: community_id.to_string(),
            title: raw.title.trim().to_string(),
            summary: raw.summary.trim().to_string(),
            rating: raw.rating.clamp(0.0, 10.0),
            findings: raw
                .findings
                .into_iter()
                .map(|f| Finding {
                    summary: f.summary,
                    explanation: f.explanation,
                })
                .collect(),
            key_entity_ids,
        })
    }

    /// Prompt material for one community.
    ///
    /// Member entities and internal relationships are used as they are when
    /// they fit the input budget. Otherwise the reports of child communities
    /// stand in for their members, largest child first, and only members no
    /// included child covers are listed. Whatever still exceeds the budget is
    /// truncated.
    fn prompt_input(
        &self,
        graph: &KnowledgeGraph,
        community: &Community,
        reports: &BTreeMap<String, CommunityReport>,
    ) -> ReportInput {
        let all: BTreeSet<&str> = community.member_entity_ids.iter().map(String::as_str).collect();
        let (entities, relationships) = member_lines(graph, &all);
        let full_cost =
            TokenService::estimate_string(&entities) + TokenService::estimate_string(&relationships);
        if full_cost <= self.max_input_tokens {
            return ReportInput {
                entities,
                relationships,
                sub_reports: String::new(),
            };
        }

        let mut children: Vec<(&Community, &CommunityReport)> = community
            .child_community_ids
            .iter()
            .filter_map(|id| Some((graph.communities.get(id)?, reports.get(id)?)))
            .collect();
        children.sort_by(|(a, _), (b, _)| {
            b.member_entity_ids
                .len()
                .cmp(&a.member_entity_ids.len())
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut remaining = self.max_input_tokens;
        let mut covered: BTreeSet<&str> = BTreeSet::new();
        let mut sub_reports = Vec::new();
        for (child, report) in children {
            let text = report.full_text();
            let cost = TokenService::estimate_string(&text) + 1;
            if cost > remaining {
                continue;
            }
            remaining -= cost;
            covered.extend(child.member_entity_ids.iter().map(String::as_str));
            sub_reports.push(text);
        }
        if sub_reports.is_empty() {
            debug!(community_id = %community.id, full_cost, "Community input truncated");
        }

        let uncovered: BTreeSet<&str> = all.difference(&covered).copied().collect();
        let (entities, relationships) = member_lines(graph, &uncovered);
        // Entities get at most two thirds of what is left.
        let entities = TokenService::truncate_to(&entities, remaining * 2 / 3).to_string();
        remaining = remaining.saturating_sub(TokenService::estimate_string(&entities));
        let relationships = TokenService::truncate_to(&relationships, remaining).to_string();
        ReportInput {
            entities,
            relationships,
            sub_reports: sub_reports.join("\n\n"),
        }
    }
}

/// Rendered prompt sections for one community.
#[derive(Debug, Clone, Default)]
struct ReportInput {
    entities: String,
    relationships: String,
    sub_reports: String,
}

/// Entity lines, highest degree first, and the relationships internal to
/// `members`, heaviest first.
fn member_lines(graph: &KnowledgeGraph, members: &BTreeSet<&str>) -> (String, String) {
    let mut entities: Vec<_> = members.iter().filter_map(|id| graph.entities.get(*id)).collect();
    entities.sort_by(|a, b| b.degree.cmp(&a.degree).then_with(|| a.id.cmp(&b.id)));
    let entity_lines = entities
        .iter()
        .map(|e| format!("- {} ({}): {}", e.name, e.entity_type, e.description.replace('\n', " ")))
        .collect::<Vec<_>>()
        .join("\n");

    let mut rels: Vec<_> = graph
        .relationships
        .values()
        .filter(|r| members.contains(r.source_id.as_str()) && members.contains(r.target_id.as_str()))
        .collect();
    rels.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.id.cmp(&b.id)));
    let relationship_lines = rels
        .iter()
        .filter_map(|r| {
            let s = graph.entities.get(&r.source_id)?;
            let t = graph.entities.get(&r.target_id)?;
            Some(format!(
                "- {} -> {}: {}",
                s.name,
                t.name,
                r.description.replace('\n', " ")
            ))
        })
        .collect::<Vec<_>>()
        .join("\n");
    (entity_lines, relationship_lines)
}

fn key_entities(graph: &KnowledgeGraph, community: &Community) -> Vec<String> {
    let mut members: Vec<_> = community
        .member_entity_ids
        .iter()
        .filter_map(|id| graph.entities.get(id))
        .collect();
    members.sort_by(|a, b| b.degree.cmp(&a.degree).then_with(|| a.id.cmp(&b.id)));
    members.into_iter().take(KEY_ENTITIES).map(|e| e.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphrag::domain::{Entity, EntityType};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Fixed(&'static str);

    #[async_trait]
    impl LanguageModel for Fixed {
        async fn complete(&self, _req: CompletionRequest) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }

        fn model_id(&self) -> &str {
            "fixed"
        }
    }

    fn graph() -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::default();
        for (id, degree) in [("a", 1), ("b", 3)] {
            graph.entities.insert(
                id.into(),
                Entity {
                    id: id.into(),
                    name: id.to_uppercase(),
                    entity_type: EntityType::new("person"),
                    description: "desc".into(),
                    chunk_ids: BTreeSet::from(["c1".to_string()]),
                    degree,
                },
            );
        }
        graph.communities.insert(
            "0-0".into(),
            Community {
                id: "0-0".into(),
                level: 0,
                member_entity_ids: vec!["a".into(), "b".into()],
                parent_community_id: None,
                child_community_ids: vec![],
            },
        );
        graph
    }

    #[tokio::test]
    async fn test_reports_are_generated() {
        let reporter = CommunityReporter::new(
            Arc::new(Fixed(r#"{"title": "T", "summary": "S", "rating": 42, "findings": [{"summary": "f"}]}"#)),
            RetryPolicy::immediate(0),
            1000,
        );
        let (reports, failures) = reporter
            .generate_all(&graph(), &ModelBudget::new(2, None), &CancellationToken::new())
            .await;
        assert!(failures.is_empty());
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].rating, 10.0);
        assert_eq!(reports[0].key_entity_ids, ["b", "a"]);
    }

    #[derive(Debug, Default)]
    struct Recording(std::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl LanguageModel for Recording {
        async fn complete(&self, req: CompletionRequest) -> Result<String, LlmError> {
            let user = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.0.lock().unwrap().push(user);
            Ok(r#"{"title": "Group", "summary": "Members of one group.", "rating": 5}"#.to_string())
        }

        fn model_id(&self) -> &str {
            "recording"
        }
    }

    fn hierarchy() -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::default();
        for id in ["a", "b", "c", "d"] {
            graph.entities.insert(
                id.into(),
                Entity {
                    id: id.into(),
                    name: id.to_uppercase(),
                    entity_type: EntityType::new("person"),
                    description: "clinician in the diabetes program ".repeat(8),
                    chunk_ids: BTreeSet::from(["c1".to_string()]),
                    degree: 1,
                },
            );
        }
        let community = |id: &str, level, members: &[&str], parent: Option<&str>, children: &[&str]| Community {
            id: id.into(),
            level,
            member_entity_ids: members.iter().map(|m| m.to_string()).collect(),
            parent_community_id: parent.map(String::from),
            child_community_ids: children.iter().map(|c| c.to_string()).collect(),
        };
        for c in [
            community("0-0", 0, &["a", "b", "c", "d"], None, &["1-0", "1-1"]),
            community("1-0", 1, &["a", "b"], Some("0-0"), &[]),
            community("1-1", 1, &["c", "d"], Some("0-0"), &[]),
        ] {
            graph.communities.insert(c.id.clone(), c);
        }
        graph
    }

    #[tokio::test]
    async fn test_parent_uses_child_reports_when_members_exceed_budget() {
        let graph = hierarchy();
        let member_cost = TokenService::estimate_string(&member_lines(
            &graph,
            &BTreeSet::from(["a", "b"]),
        ).0);
        // Room for one child's members but not for all four.
        let model = Arc::new(Recording::default());
        let reporter = CommunityReporter::new(
            Arc::clone(&model) as Arc<dyn LanguageModel>,
            RetryPolicy::immediate(0),
            member_cost + 10,
        );
        let (reports, failures) = reporter
            .generate_all(&graph, &ModelBudget::new(2, None), &CancellationToken::new())
            .await;
        assert!(failures.is_empty());
        assert_eq!(reports.len(), 3);

        let prompts = model.0.lock().unwrap().clone();
        assert_eq!(prompts.len(), 3);
        // Children are reported before their parent.
        assert!(prompts[..2].iter().all(|p| !p.contains("Sub-community reports")));
        assert!(prompts[..2].iter().any(|p| p.contains("- A (person)") && p.contains("- B (person)")));
        let parent = &prompts[2];
        assert!(parent.contains("Sub-community reports:"));
        assert!(parent.contains("# Group"));
        assert!(!parent.contains("- A (person)"));
    }

    #[tokio::test]
    async fn test_small_parent_lists_members_directly() {
        let model = Arc::new(Recording::default());
        let reporter = CommunityReporter::new(
            Arc::clone(&model) as Arc<dyn LanguageModel>,
            RetryPolicy::immediate(0),
            10_000,
        );
        reporter
            .generate_all(&hierarchy(), &ModelBudget::new(1, None), &CancellationToken::new())
            .await;
        let prompts = model.0.lock().unwrap().clone();
        assert!(prompts[2].contains("- D (person)"));
        assert!(!prompts[2].contains("Sub-community reports"));
    }

    #[tokio::test]
    async fn test_invalid_reports_are_recorded() {
        let reporter =
            CommunityReporter::new(Arc::new(Fixed("{\"title\": \"\"}")), RetryPolicy::immediate(2), 1000);
        let (reports, failures) = reporter
            .generate_all(&graph(), &ModelBudget::new(2, None), &CancellationToken::new())
            .await;
        assert!(reports.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 3);
    }
}
