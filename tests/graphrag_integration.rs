//! End-to-end tests: index, build and query against offline model doubles.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{
    DownEmbedder, HashingEmbedder, SMITH_TEXT, ScriptedModel, service_with, smith_model,
    test_config,
};
use guideline_graphrag::graphrag::GraphRagService;
use guideline_graphrag::graphrag::domain::{
    Document, QueryFilters, QueryRequest, QueryResult, SearchMethod, SourceRef, SourceType,
};
use guideline_graphrag::graphrag::embedding::InMemoryVectorStoreProvider;
use guideline_graphrag::graphrag::{GraphNode, JobStatus};

// =============================================================================
// Helpers
// =============================================================================

async fn indexed(service: &GraphRagService, graph_id: &str, docs: Vec<Document>) {
    let report = service.index(graph_id, docs).wait().await.unwrap();
    assert!(report.rejected.is_empty(), "{:?}", report.rejected);
}

async fn built_smith(graph_id: &str) -> GraphRagService {
    let service = service_with(test_config(), Arc::new(smith_model()));
    indexed(&service, graph_id, vec![Document::new("smith", SMITH_TEXT)]).await;
    service.build(graph_id, false).wait().await.unwrap();
    service
}

fn assert_citations_in_context(result: &QueryResult) {
    let context: BTreeSet<&SourceRef> = result.context_sources.iter().collect();
    for citation in &result.citations {
        let source = SourceRef {
            source_type: citation.source_type,
            source_id: citation.source_id.clone(),
        };
        assert!(context.contains(&source), "cited {source:?} outside context");
    }
    for segment in &result.segments {
        assert!(!segment.citations.is_empty(), "uncited segment {:?}", segment.text);
        for index in &segment.citations {
            assert!(*index < result.citations.len());
        }
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_single_document_is_built_and_answered_with_chunk_citation() {
    let service = built_smith("g").await;
    let snapshot = service.snapshot("g").await.unwrap();
    let graph = &snapshot.graph;
    graph.check_invariants().unwrap();

    let find = |name: &str| {
        graph
            .entities
            .values()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("missing entity {name}"))
    };
    let smith = find("Dr. Smith");
    let hospital = find("Toronto General");
    assert_eq!(smith.entity_type.as_str(), "person");
    assert_eq!(hospital.entity_type.as_str(), "organization");
    assert!(graph.relationships.values().any(|r| {
        let ends = BTreeSet::from([r.source_id.as_str(), r.target_id.as_str()]);
        ends == BTreeSet::from([smith.id.as_str(), hospital.id.as_str()])
    }));

    let result = service
        .query("g", QueryRequest::new("Who treats diabetes?").with_method("local"))
        .await
        .unwrap();
    assert_eq!(result.method, SearchMethod::Local);
    assert!(result.answer.contains("Dr. Smith"));
    let chunk_id = snapshot.chunks.keys().next().unwrap();
    assert!(
        result
            .citations
            .iter()
            .any(|c| c.source_type == SourceType::Chunk && &c.source_id == chunk_id)
    );
    assert_citations_in_context(&result);
}

#[tokio::test]
async fn test_query_without_build_fails() {
    let service = service_with(test_config(), Arc::new(smith_model()));
    let err = service
        .query("nothing", QueryRequest::new("Who treats diabetes?"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "graph_not_built");

    indexed(&service, "pending", vec![Document::new("smith", SMITH_TEXT)]).await;
    let err = service
        .query("pending", QueryRequest::new("Who treats diabetes?"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "graph_not_built");
}

#[tokio::test]
async fn test_method_validation() {
    let service = built_smith("g").await;

    let err = service
        .query("g", QueryRequest::new("q").with_method("bogus"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unsupported_method");

    // Validation happens before the graph lookup.
    let err = service
        .query("unbuilt", QueryRequest::new("q").with_method("bogus"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unsupported_method");

    let result = service.query("g", QueryRequest::new("Who treats diabetes?")).await.unwrap();
    assert_eq!(result.method, SearchMethod::Local);
}

#[tokio::test]
async fn test_failed_chunk_does_not_fail_build() {
    let model = Arc::new(smith_model().fail_on("Broken passage"));
    let service = service_with(test_config(), Arc::clone(&model));
    indexed(
        &service,
        "g",
        vec![
            Document::new("smith", SMITH_TEXT),
            Document::new("broken", "Broken passage about insulin dosing."),
        ],
    )
    .await;

    let mut handle = service.build("g", false);
    assert_eq!(handle.finished().await, JobStatus::Succeeded);
    let manifest = handle.wait().await.unwrap();

    assert!(manifest.is_partial());
    assert_eq!(manifest.failed_chunks.len(), 1);
    let failed = &manifest.failed_chunks[0];
    assert_eq!(failed.kind, "extraction_failed");
    assert_eq!(failed.attempts, 11);
    assert_eq!(model.failed_calls.load(Ordering::SeqCst), 11);

    let snapshot = service.snapshot("g").await.unwrap();
    assert!(snapshot.graph.entities.values().any(|e| e.name == "Dr. Smith"));
    assert!(snapshot.graph.entities.values().all(|e| !e.chunk_ids.contains(&failed.id)));
}

#[tokio::test]
async fn test_archive_restore_reproduces_citations() {
    let service = built_smith("g").await;
    let question = QueryRequest::new("Who treats diabetes?");
    let before = service.query("g", question.clone()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    service.archive("g", dir.path()).await.unwrap();

    let fresh = service_with(test_config(), Arc::new(smith_model()));
    let manifest = fresh.restore("restored", dir.path()).await.unwrap();
    assert_eq!(manifest.stats.entities, 2);

    let after = fresh.query("restored", question).await.unwrap();
    assert_eq!(before.citations, after.citations);
    assert_eq!(before.context_sources, after.context_sources);
    assert_eq!(
        service.snapshot("g").await.unwrap().graph,
        fresh.snapshot("restored").await.unwrap().graph
    );
}

// =============================================================================
// Graph properties
// =============================================================================

#[tokio::test]
async fn test_alias_mentions_merge_into_one_entity() {
    let model = ScriptedModel::new()
        .extract(
            "recommends annual",
            r#"{"entities": [{"name": "Diabetes Canada", "type": "organization", "description": "National diabetes charity"}]}"#,
        )
        .extract(
            "2018 guidelines",
            r#"{"entities": [{"name": "DIABETES-CANADA", "type": "Organization", "description": "Publisher of the 2018 guidelines"}]}"#,
        );
    let service = service_with(test_config(), Arc::new(model));
    indexed(
        &service,
        "g",
        vec![
            Document::new("dc1", "Diabetes Canada recommends annual eye exams."),
            Document::new("dc2", "The 2018 guidelines from DIABETES-CANADA cover insulin."),
        ],
    )
    .await;
    service.build("g", false).wait().await.unwrap();

    let snapshot = service.snapshot("g").await.unwrap();
    let entities: Vec<_> = snapshot.graph.entities.values().collect();
    assert_eq!(entities.len(), 1);
    let chunk_ids: BTreeSet<&String> = snapshot.chunks.keys().collect();
    assert_eq!(chunk_ids.len(), 2);
    assert_eq!(entities[0].chunk_ids.iter().collect::<BTreeSet<_>>(), chunk_ids);
    assert!(entities[0].description.contains("National diabetes charity"));
    assert!(entities[0].description.contains("Publisher of the 2018 guidelines"));
}

#[tokio::test]
async fn test_rebuild_is_idempotent_and_reuses_cache() {
    let service = built_smith("g").await;
    let first = service.snapshot("g").await.unwrap();

    let forced = service.build("g", true).wait().await.unwrap();
    assert_eq!(forced.cached_chunks, 0);
    let second = service.snapshot("g").await.unwrap();
    assert_eq!(first.graph.entities, second.graph.entities);
    assert_eq!(first.graph.relationships, second.graph.relationships);
    assert_eq!(first.graph.communities, second.graph.communities);

    let cached = service.build("g", false).wait().await.unwrap();
    assert_eq!(cached.cached_chunks, cached.chunks);
    let third = service.snapshot("g").await.unwrap();
    assert_eq!(first.graph.entities, third.graph.entities);
}

// =============================================================================
// Indexing
// =============================================================================

#[tokio::test]
async fn test_documents_are_immutable() {
    let service = service_with(test_config(), Arc::new(smith_model()));
    indexed(&service, "g", vec![Document::new("smith", SMITH_TEXT)]).await;

    let report = service
        .index(
            "g",
            vec![
                Document::new("smith", SMITH_TEXT),
                Document::new("smith", "Different text."),
                Document::new("empty", "   "),
            ],
        )
        .wait()
        .await
        .unwrap();
    assert_eq!(report.unchanged, ["smith"]);
    assert!(report.accepted.is_empty());
    assert_eq!(report.rejected.len(), 2);
    assert!(report.rejected.iter().all(|r| r.kind == "malformed_document"));

    let manifest = service.build("g", false).wait().await.unwrap();
    assert_eq!(manifest.documents, 1);
    assert_eq!(manifest.rejected_documents.len(), 1);
    assert_eq!(manifest.rejected_documents[0].id, "empty");
}

#[tokio::test]
async fn test_batch_with_only_rejections_fails() {
    let service = service_with(test_config(), Arc::new(smith_model()));

    let mut handle = service.index("g", vec![Document::new("empty", "  "), Document::new("", "text")]);
    assert_eq!(handle.finished().await, JobStatus::Failed);
    let report = handle.wait().await.unwrap();
    assert_eq!(report.rejected.len(), 2);

    let mut handle = service.index(
        "g",
        vec![Document::new("smith", SMITH_TEXT), Document::new("empty", "  ")],
    );
    assert_eq!(handle.finished().await, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_restore_rejects_conflicting_document() {
    let source = built_smith("g").await;
    let dir = tempfile::tempdir().unwrap();
    source.archive("g", dir.path()).await.unwrap();

    let target = service_with(test_config(), Arc::new(smith_model()));
    indexed(&target, "g", vec![Document::new("smith", "Dr. Smith retired in 2020.")]).await;

    let err = target.restore("g", dir.path()).await.unwrap_err();
    assert_eq!(err.kind(), "malformed_document");
    assert!(err.to_string().contains("smith"));

    // Nothing was published and the ingested text is untouched.
    let err = target.query("g", QueryRequest::new("q")).await.unwrap_err();
    assert_eq!(err.kind(), "graph_not_built");
    let report = target
        .index("g", vec![Document::new("smith", "Dr. Smith retired in 2020.")])
        .wait()
        .await
        .unwrap();
    assert_eq!(report.unchanged, ["smith"]);
}

// =============================================================================
// Strategies
// =============================================================================

#[tokio::test]
async fn test_drift_stops_when_follow_ups_find_nothing_new() {
    let model = Arc::new(smith_model());
    let service = service_with(test_config(), Arc::clone(&model));
    indexed(&service, "g", vec![Document::new("smith", SMITH_TEXT)]).await;
    service.build("g", false).wait().await.unwrap();

    let result = service
        .query("g", QueryRequest::new("Who treats diabetes?").with_method("drift"))
        .await
        .unwrap();
    assert!(!result.citations.is_empty());
    // Both entities are already in the first context.
    assert_eq!(model.refine_calls(), 1);
}

#[tokio::test]
async fn test_drift_runs_at_most_the_configured_rounds() {
    let model = Arc::new(
        smith_model()
            .extract(
                "oral glucose",
                r#"{"entities": [{"name": "Metformin", "type": "medication", "description": "Oral glucose lowering tablet"}]}"#,
            )
            .extract(
                "injected hormone",
                r#"{"entities": [{"name": "Insulin", "type": "medication", "description": "Injected hormone therapy"}]}"#,
            )
            .extract(
                "Nurse Jones",
                r#"{"entities": [{"name": "Nurse Jones", "type": "person", "description": "Educator at the clinic"}]}"#,
            )
            .refine_with(&[&["Metformin"], &["Insulin"], &["Nurse Jones"], &["Toronto General"]]),
    );
    let mut config = test_config();
    config.extraction.entity_types = vec![
        "person".to_string(),
        "organization".to_string(),
        "medication".to_string(),
    ];
    config.query.top_k_entities = 1;
    config.query.drift_max_rounds = 3;
    config.query.drift_follow_ups = 1;
    let service = GraphRagService::new(
        config,
        Arc::clone(&model) as Arc<dyn guideline_graphrag::llm::LanguageModel>,
        Arc::new(HashingEmbedder { dimensions: 4096 }),
        Arc::new(InMemoryVectorStoreProvider),
    )
    .unwrap();
    indexed(
        &service,
        "g",
        vec![
            Document::new("smith", SMITH_TEXT),
            Document::new("metformin", "Metformin is an oral glucose lowering tablet."),
            Document::new("insulin", "Insulin is an injected hormone therapy."),
            Document::new("jones", "Nurse Jones educates patients at the clinic."),
        ],
    )
    .await;
    service.build("g", false).wait().await.unwrap();

    let result = service
        .query("g", QueryRequest::new("Who is Dr. Smith?").with_method("drift"))
        .await
        .unwrap();
    assert_eq!(model.refine_calls(), 3);

    let prompts = model.refine_prompts.lock().unwrap().clone();
    assert!(prompts[0].contains("(none yet)"));
    assert!(prompts[1].contains("Finding of round 1"));
    assert!(prompts[2].contains("Finding of round 2"));

    let snapshot = service.snapshot("g").await.unwrap();
    let entity_names: BTreeSet<&str> = result
        .context_sources
        .iter()
        .filter(|s| s.source_type == SourceType::Entity)
        .map(|s| snapshot.graph.entities[&s.source_id].name.as_str())
        .collect();
    assert_eq!(
        entity_names,
        BTreeSet::from(["Dr. Smith", "Metformin", "Insulin", "Nurse Jones"])
    );
}

#[tokio::test]
async fn test_every_method_cites_only_context() {
    let service = built_smith("g").await;
    for method in SearchMethod::ALL {
        let result = service
            .query(
                "g",
                QueryRequest::new("Who treats diabetes?").with_method(method.as_str()),
            )
            .await
            .unwrap();
        assert_eq!(result.method, method);
        assert!(!result.citations.is_empty(), "{method} produced no citations");
        assert_citations_in_context(&result);
    }
}

#[tokio::test]
async fn test_global_uses_community_reports() {
    let service = built_smith("g").await;
    let result = service
        .query("g", QueryRequest::new("What are the main themes?").with_method("global"))
        .await
        .unwrap();
    assert!(
        result
            .context_sources
            .iter()
            .all(|s| s.source_type == SourceType::Community)
    );
    assert_eq!(result.citations[0].source_type, SourceType::Community);
}

#[tokio::test]
async fn test_global_without_communities_uses_entities() {
    let mut config = test_config();
    config.community.enabled = false;
    let service = service_with(config, Arc::new(smith_model()));
    indexed(&service, "g", vec![Document::new("smith", SMITH_TEXT)]).await;
    let manifest = service.build("g", false).wait().await.unwrap();
    assert_eq!(manifest.stats.communities, 0);
    assert!(!manifest.communities_enabled);

    let result = service
        .query("g", QueryRequest::new("Who treats diabetes?").with_method("global"))
        .await
        .unwrap();
    assert!(!result.context_sources.is_empty());
    assert!(
        result
            .context_sources
            .iter()
            .all(|s| s.source_type == SourceType::Entity)
    );
    assert_citations_in_context(&result);
}

#[tokio::test]
async fn test_filters_restrict_context() {
    let model = smith_model().extract(
        "recommends annual",
        r#"{"entities": [{"name": "Diabetes Canada", "type": "organization", "description": "National diabetes charity"}]}"#,
    );
    let service = service_with(test_config(), Arc::new(model));
    indexed(
        &service,
        "g",
        vec![
            Document::new("smith", SMITH_TEXT),
            Document::new("dc1", "Diabetes Canada recommends annual eye exams."),
        ],
    )
    .await;
    service.build("g", false).wait().await.unwrap();
    let snapshot = service.snapshot("g").await.unwrap();

    let filters = QueryFilters {
        document_ids: vec!["dc1".to_string()],
        entity_types: Vec::new(),
    };
    for method in ["basic", "local"] {
        let result = service
            .query(
                "g",
                QueryRequest::new("Who treats diabetes?")
                    .with_method(method)
                    .with_filters(filters.clone()),
            )
            .await
            .unwrap();
        for source in result.context_sources.iter().filter(|s| s.source_type == SourceType::Chunk) {
            assert_eq!(snapshot.chunks[&source.source_id].document_id, "dc1");
        }
        for source in result.context_sources.iter().filter(|s| s.source_type == SourceType::Entity) {
            assert_eq!(snapshot.graph.entities[&source.source_id].name, "Diabetes Canada");
        }
    }
}

#[tokio::test]
async fn test_embedding_outage() {
    let service = GraphRagService::new(
        test_config(),
        Arc::new(smith_model()),
        Arc::new(DownEmbedder),
        Arc::new(InMemoryVectorStoreProvider),
    )
    .unwrap();
    indexed(&service, "g", vec![Document::new("smith", SMITH_TEXT)]).await;
    let manifest = service.build("g", false).wait().await.unwrap();
    assert!(!manifest.index_errors.is_empty());

    for method in ["local", "drift", "basic"] {
        let err = service
            .query("g", QueryRequest::new("Who treats diabetes?").with_method(method))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "index_unavailable", "{method}");
    }

    let result = service
        .query("g", QueryRequest::new("Who treats diabetes?").with_method("global"))
        .await
        .unwrap();
    assert!(!result.citations.is_empty());
}

#[tokio::test]
async fn test_fetch_nodes() {
    let service = built_smith("g").await;
    let snapshot = service.snapshot("g").await.unwrap();

    let entity_id = snapshot.graph.entities.keys().next().unwrap();
    assert!(matches!(
        service.fetch("g", entity_id).await.unwrap(),
        GraphNode::Entity(e) if &e.id == entity_id
    ));

    let community_id = snapshot.graph.communities.keys().next().unwrap();
    match service.fetch("g", community_id).await.unwrap() {
        GraphNode::Community { community, report } => {
            assert_eq!(&community.id, community_id);
            assert!(report.is_some());
        }
        other => panic!("expected community, got {other:?}"),
    }

    let err = service.fetch("g", "missing").await.unwrap_err();
    assert_eq!(err.kind(), "node_not_found");
}

// =============================================================================
// Cancellation
// =============================================================================

fn many_documents(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| Document::new(format!("doc{i}"), format!("Dr. Smith saw patient {i} at Toronto General.")))
        .collect()
}

#[tokio::test]
async fn test_cancelled_build_publishes_nothing() {
    let model = Arc::new(smith_model().with_delay(Duration::from_millis(50)));
    let service = service_with(test_config(), Arc::clone(&model));
    indexed(&service, "g", many_documents(20)).await;

    let mut handle = service.build("g", false);
    handle.cancel();
    assert_eq!(handle.finished().await, JobStatus::Cancelled);
    assert_eq!(handle.wait().await.unwrap_err().kind(), "cancelled");

    // Each document needs an extraction and a gleaning call when it runs.
    assert!(model.calls.load(Ordering::SeqCst) < 40);
    let err = service.query("g", QueryRequest::new("q")).await.unwrap_err();
    assert_eq!(err.kind(), "graph_not_built");
}

#[tokio::test]
async fn test_cancelled_rebuild_keeps_previous_snapshot() {
    let model = Arc::new(smith_model().with_delay(Duration::from_millis(20)));
    let service = service_with(test_config(), Arc::clone(&model));
    indexed(&service, "g", vec![Document::new("smith", SMITH_TEXT)]).await;
    let first = service.build("g", false).wait().await.unwrap();

    indexed(&service, "g", many_documents(20)).await;
    let mut handle = service.build("g", true);
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.cancel();
    assert_eq!(handle.finished().await, JobStatus::Cancelled);

    let current = service.stats("g").await.unwrap();
    assert_eq!(current.documents, first.documents);
    assert_eq!(current.completed_at, first.completed_at);
}
