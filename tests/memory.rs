//! Conversation memory integration tests

use std::sync::Arc;

use docchat_memory::{
    BudgetState, ChatMemory, ContextRole, ConversationRepo, Error, HistoryAssembler, MemoryConfig,
    NoopSummarizer, db,
};

mod common;
use common::{
    FailingSummarizer, ScriptedSummarizer, assert_totals_consistent, fill_conversation,
    setup_engine, setup_repo,
};

const SHORT_SUMMARY: &str = "Summary of earlier discussion.";

/// Ids of live messages and summaries, for before/after comparisons
fn snapshot(repo: &ConversationRepo, conversation_id: &str) -> (Vec<String>, Vec<String>, i64) {
    let messages = repo
        .get_recent_messages(conversation_id, 0)
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    let summaries = repo
        .list_summaries(conversation_id)
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    let total = repo
        .require_conversation(conversation_id)
        .unwrap()
        .token_count_total;
    (messages, summaries, total)
}

#[tokio::test]
async fn test_raw_compaction_brings_conversation_under_target() {
    let repo = setup_repo();
    let summarizer = ScriptedSummarizer::new(SHORT_SUMMARY);
    let engine = setup_engine(&repo, summarizer.clone());

    let conversation = repo.create_conversation("alice", None, 1000).unwrap();
    // 10 messages of 120 tokens each
    fill_conversation(&repo, &conversation.id, 5, 480);
    let before = repo.get_recent_messages(&conversation.id, 0).unwrap();
    assert_eq!(repo.require_conversation(&conversation.id).unwrap().token_count_total, 1200);

    let outcome = engine
        .summarize_if_needed(&conversation.id, 1000, 0.8)
        .await
        .unwrap();

    assert_eq!(outcome.state, BudgetState::Balanced);
    assert_eq!(outcome.tokens_before, 1200);
    assert!(outcome.tokens_after <= 800);
    assert_eq!(outcome.messages_compacted, 4);
    assert_eq!(summarizer.calls(), 1);

    let summaries = repo.list_summaries(&conversation.id).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].layer, 1);
    assert_eq!(summaries[0].summary_text, SHORT_SUMMARY);

    // The newest messages survive verbatim, oldest first
    let after = repo.get_recent_messages(&conversation.id, 0).unwrap();
    let expected: Vec<&str> = before[4..].iter().map(|m| m.id.as_str()).collect();
    let actual: Vec<&str> = after.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(actual, expected);

    assert_totals_consistent(&repo, &conversation.id);
}

#[tokio::test]
async fn test_layer_merge_when_only_summaries_remain() {
    let repo = setup_repo();
    let engine = setup_engine(&repo, ScriptedSummarizer::new("Merged overview."));

    let conversation = repo.create_conversation("alice", None, 400).unwrap();
    repo.add_summary(&conversation.id, 1, "first stretch", Some(250))
        .unwrap();
    repo.add_summary(&conversation.id, 1, "second stretch", Some(250))
        .unwrap();

    let outcome = engine
        .summarize_if_needed(&conversation.id, 400, 0.8)
        .await
        .unwrap();

    assert_eq!(outcome.state, BudgetState::Balanced);
    assert_eq!(outcome.summaries_merged, 2);

    let summaries = repo.list_summaries(&conversation.id).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].layer, 2);
    assert_eq!(summaries[0].summary_text, "Merged overview.");
    assert!(outcome.tokens_after <= 400);
    assert_totals_consistent(&repo, &conversation.id);
}

#[tokio::test]
async fn test_failing_summarizer_falls_back_to_truncation() {
    let repo = setup_repo();
    let engine = setup_engine(&repo, Arc::new(FailingSummarizer));

    let conversation = repo.create_conversation("alice", None, 1000).unwrap();
    fill_conversation(&repo, &conversation.id, 5, 480);

    let outcome = engine
        .summarize_if_needed(&conversation.id, 1000, 0.8)
        .await
        .unwrap();

    assert_eq!(outcome.fallbacks_used, 1);
    assert_eq!(outcome.tokens_after, 970);
    assert_eq!(outcome.state, BudgetState::Balanced);

    let summaries = repo.list_summaries(&conversation.id).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].summary_text.chars().count(), 1000);
    assert_eq!(summaries[0].token_count, 250);
    assert!(summaries[0].summary_text.starts_with("User: uuu"));
    assert_totals_consistent(&repo, &conversation.id);
}

#[tokio::test]
async fn test_oversized_tail_stays_over_budget_without_writes() {
    let repo = setup_repo();
    let summarizer = ScriptedSummarizer::new(SHORT_SUMMARY);
    let engine = setup_engine(&repo, summarizer.clone());

    let conversation = repo.create_conversation("alice", None, 50).unwrap();
    repo.append_message_pair(&conversation.id, &"x".repeat(400), "ok")
        .unwrap();
    let before = snapshot(&repo, &conversation.id);
    assert_eq!(before.2, 101);

    let outcome = engine
        .summarize_if_needed(&conversation.id, 50, 0.8)
        .await
        .unwrap();

    assert_eq!(outcome.state, BudgetState::OverBudget);
    assert!(!outcome.changed());
    assert_eq!(summarizer.calls(), 0);
    assert_eq!(snapshot(&repo, &conversation.id), before);
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let repo = setup_repo();
    let summarizer = ScriptedSummarizer::new(SHORT_SUMMARY);
    let engine = setup_engine(&repo, summarizer.clone());

    let conversation = repo.create_conversation("alice", None, 1000).unwrap();
    fill_conversation(&repo, &conversation.id, 5, 480);

    engine
        .summarize_if_needed(&conversation.id, 1000, 0.8)
        .await
        .unwrap();
    let calls = summarizer.calls();
    let before = snapshot(&repo, &conversation.id);

    let outcome = engine
        .summarize_if_needed(&conversation.id, 1000, 0.8)
        .await
        .unwrap();

    assert_eq!(outcome.state, BudgetState::Balanced);
    assert!(!outcome.changed());
    assert_eq!(summarizer.calls(), calls);
    assert_eq!(snapshot(&repo, &conversation.id), before);
}

#[tokio::test]
async fn test_invalid_budget_is_rejected_without_writes() {
    let repo = setup_repo();
    let engine = setup_engine(&repo, ScriptedSummarizer::new(SHORT_SUMMARY));

    let conversation = repo.create_conversation("alice", None, 1000).unwrap();
    fill_conversation(&repo, &conversation.id, 5, 480);
    let before = snapshot(&repo, &conversation.id);

    for (limit, ratio) in [(0, 0.8), (-10, 0.8), (1000, 0.0), (1000, 1.01)] {
        let result = engine
            .summarize_if_needed(&conversation.id, limit, ratio)
            .await;
        assert!(matches!(result, Err(Error::Config(_))), "{limit} {ratio}");
    }

    assert_eq!(snapshot(&repo, &conversation.id), before);
}

#[tokio::test]
async fn test_merge_terminates_when_fallback_cannot_reach_budget() {
    let repo = setup_repo();
    let engine = setup_engine(&repo, Arc::new(FailingSummarizer));

    let conversation = repo.create_conversation("alice", None, 100).unwrap();
    for _ in 0..10 {
        repo.add_summary(&conversation.id, 1, &"s".repeat(400), None)
            .unwrap();
    }

    let outcome = engine
        .summarize_if_needed(&conversation.id, 100, 0.8)
        .await
        .unwrap();

    // One merge to layer 2, then a single summary is left and nothing merges
    assert_eq!(outcome.state, BudgetState::OverBudget);
    assert_eq!(outcome.summaries_merged, 10);
    assert_eq!(outcome.tokens_after, 250);

    let summaries = repo.list_summaries(&conversation.id).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].layer, 2);
    assert_totals_consistent(&repo, &conversation.id);
}

#[tokio::test]
async fn test_totals_stay_consistent_over_many_turns() {
    let repo = setup_repo();
    let engine = setup_engine(&repo, ScriptedSummarizer::new(SHORT_SUMMARY));
    let conversation = repo.create_conversation("alice", None, 600).unwrap();

    for turn in 0..30 {
        let question = format!("question {turn} {}", "q".repeat(150));
        let answer = format!("answer {turn} {}", "a".repeat(250));
        repo.append_message_pair(&conversation.id, &question, &answer)
            .unwrap();

        let outcome = engine.summarize_conversation(&conversation.id).await.unwrap();
        assert_totals_consistent(&repo, &conversation.id);

        if outcome.changed() {
            assert!(outcome.tokens_after < outcome.tokens_before);
        }
        if outcome.state == BudgetState::Balanced {
            assert!(outcome.tokens_after <= 600);
        }
    }

    // The latest pair is never compacted
    let recent = repo.get_recent_messages(&conversation.id, 2).unwrap();
    assert!(recent[0].content.starts_with("question 29"));
    assert!(recent[1].content.starts_with("answer 29"));
}

#[tokio::test]
async fn test_context_places_summaries_before_recent_messages() {
    let repo = setup_repo();
    let engine = setup_engine(&repo, ScriptedSummarizer::new(SHORT_SUMMARY));
    let assembler = HistoryAssembler::new(repo.clone());

    let conversation = repo.create_conversation("alice", None, 1000).unwrap();
    fill_conversation(&repo, &conversation.id, 5, 480);
    engine
        .summarize_if_needed(&conversation.id, 1000, 0.8)
        .await
        .unwrap();

    let context = assembler
        .build_model_context(&conversation.id, Some("Answer from the documents."), 4)
        .unwrap();

    let roles: Vec<ContextRole> = context.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            ContextRole::System,
            ContextRole::System,
            ContextRole::User,
            ContextRole::Assistant,
            ContextRole::User,
            ContextRole::Assistant,
        ]
    );
    assert_eq!(context.messages[0].content, "Answer from the documents.");
    assert_eq!(
        context.messages[1].content,
        format!("Conversation summary (layer 1): {SHORT_SUMMARY}")
    );
    assert_eq!(context.summary_count, 1);
    assert_eq!(context.recent_count, 4);
}

#[tokio::test]
async fn test_record_turn_names_and_compacts_conversation() {
    let config = MemoryConfig {
        token_limit: 1000,
        ..MemoryConfig::default()
    };
    let memory = ChatMemory::new(db::init_memory().unwrap(), Arc::new(NoopSummarizer), config)
        .unwrap();
    let conversation = memory.create_conversation("alice", None, None).unwrap();
    assert_eq!(conversation.title, "New Chat");

    let first = format!("What does the onboarding guide say about laptops? {}", "u".repeat(430));
    memory
        .record_turn(&conversation.id, &first, &"a".repeat(480))
        .await
        .unwrap();
    for _ in 0..4 {
        memory
            .record_turn(&conversation.id, &"u".repeat(480), &"a".repeat(480))
            .await
            .unwrap();
    }

    let stored = memory.get_conversation(&conversation.id).unwrap().unwrap();
    assert_eq!(stored.title, "What does the onboarding guide say about laptops?...");
    assert_eq!(stored.message_count, 10);
    assert!(stored.token_count_total <= 1000);
    assert_eq!(memory.list_summaries(&conversation.id).unwrap().len(), 1);
}

#[test]
fn test_file_database_persists_across_pools() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("memory.db");

    let conversation_id = {
        let repo = ConversationRepo::new(db::init(&path).unwrap());
        let conversation = repo.create_conversation("alice", Some("Docs"), 500).unwrap();
        repo.append_message_pair(&conversation.id, "hello", "hi there")
            .unwrap();
        repo.add_summary(&conversation.id, 1, "earlier", None).unwrap();
        conversation.id
    };

    let repo = ConversationRepo::new(db::init(&path).unwrap());
    let conversation = repo.require_conversation(&conversation_id).unwrap();
    assert_eq!(conversation.title, "Docs");
    assert_eq!(repo.get_recent_messages(&conversation_id, 0).unwrap().len(), 2);
    assert_eq!(repo.list_summaries(&conversation_id).unwrap().len(), 1);
    assert_totals_consistent(&repo, &conversation_id);

    assert!(repo.delete_conversation(&conversation_id).unwrap());
    assert!(repo.get_conversation(&conversation_id).unwrap().is_none());
    assert!(repo.list_summaries(&conversation_id).unwrap().is_empty());
}
