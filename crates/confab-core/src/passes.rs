use crate::{Conversation, Message, Role, TOOL_CALL_PLACEHOLDER};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

/// Extensions the reconciliation pass recognizes inside assistant text.
pub const GENERATED_FILE_EXTENSIONS: [&str; 5] = ["xlsx", "xls", "png", "jpg", "jpeg"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScrubReport {
    pub conversations_touched: usize,
    pub messages_cleared: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupReport {
    pub conversations_touched: usize,
    pub messages_removed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub conversations_touched: usize,
    pub messages_updated: usize,
    pub files_linked: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OwnershipReport {
    pub total: usize,
    pub changed: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Owner to backfill; ownership assignment is skipped when `None`.
    pub username: Option<String>,
    pub only_empty: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            username: None,
            only_empty: true,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub conversations: usize,
    pub scrub: ScrubReport,
    pub dedup: DedupReport,
    pub reconcile: ReconcileReport,
    pub ownership: Option<OwnershipReport>,
}

/// Clears assistant content that reduces to nothing once placeholder
/// markers and newlines are removed. Cleared messages are kept in place, so
/// count and order never change.
pub fn scrub_messages(messages: &mut [Message]) -> usize {
    let mut cleared = 0;
    for message in messages.iter_mut() {
        if message.role != Role::Assistant
            || message.has_tool_calls()
            || message.has_backend_passthrough()
        {
            continue;
        }
        if message.content.is_empty() {
            continue;
        }
        let residue = message
            .content
            .replace(TOOL_CALL_PLACEHOLDER, "")
            .replace(['\n', '\r'], "");
        if residue.trim().is_empty() {
            message.content.clear();
            cleared += 1;
        }
    }
    cleared
}

/// Collapses runs of adjacent duplicates. Comparison is always against the
/// last kept message, so the collapse is transitive.
pub fn dedupe_messages(messages: &mut Vec<Message>) -> usize {
    let mut kept: Vec<Message> = Vec::with_capacity(messages.len());
    let mut removed = 0;
    for message in messages.drain(..) {
        let is_duplicate = kept.last().map_or(false, |last| {
            last.role == message.role
                && last.content == message.content
                && generated_files_match(
                    last.generated_files.as_deref(),
                    message.generated_files.as_deref(),
                )
        });
        if is_duplicate {
            removed += 1;
        } else {
            kept.push(message);
        }
    }
    *messages = kept;
    removed
}

// Order-insensitive; duplicate entries stay significant. Non-string entries
// fall back to structural equality in stored order.
fn generated_files_match(left: Option<&[Value]>, right: Option<&[Value]>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if a.len() != b.len() {
                return false;
            }
            match (string_entries(a), string_entries(b)) {
                (Some(mut x), Some(mut y)) => {
                    x.sort_unstable();
                    y.sort_unstable();
                    x == y
                }
                _ => a == b,
            }
        }
        _ => false,
    }
}

fn string_entries(files: &[Value]) -> Option<Vec<&str>> {
    files.iter().map(Value::as_str).collect()
}

/// Filename tokens referenced in `content`, deduplicated preserving
/// first-seen order.
pub fn extract_file_candidates(content: &str) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    for extension in GENERATED_FILE_EXTENSIONS {
        let matcher = Regex::new(&format!(r"(?i)[\w-]+\.{extension}")).expect("valid regex");
        for found in matcher.find_iter(content) {
            let token = found.as_str();
            if token.contains('/') || token.contains('\\') {
                continue;
            }
            if !candidates.iter().any(|existing| existing == token) {
                candidates.push(token.to_string());
            }
        }
    }
    candidates
}

/// Provenance backfill for one message. Returns `None` when the message is
/// ineligible or nothing survives the existence filter, so callers never
/// assign an empty list.
pub fn reconcile_message<F>(message: &Message, mut file_exists: F) -> Option<Vec<String>>
where
    F: FnMut(&str) -> bool,
{
    if message.role != Role::Assistant || message.has_generated_files() {
        return None;
    }
    let found: Vec<String> = extract_file_candidates(&message.content)
        .into_iter()
        .filter(|name| file_exists(name))
        .collect();
    if found.is_empty() {
        None
    } else {
        Some(found)
    }
}

pub fn scrub_conversations(conversations: &mut BTreeMap<String, Conversation>) -> ScrubReport {
    let mut report = ScrubReport::default();
    for conversation in conversations.values_mut() {
        let cleared = scrub_messages(&mut conversation.messages);
        if cleared > 0 {
            report.conversations_touched += 1;
            report.messages_cleared += cleared;
        }
    }
    report
}

pub fn dedupe_conversations(conversations: &mut BTreeMap<String, Conversation>) -> DedupReport {
    let mut report = DedupReport::default();
    for conversation in conversations.values_mut() {
        let removed = dedupe_messages(&mut conversation.messages);
        if removed > 0 {
            report.conversations_touched += 1;
            report.messages_removed += removed;
        }
    }
    report
}

pub fn reconcile_conversations<F>(
    conversations: &mut BTreeMap<String, Conversation>,
    mut file_exists: F,
) -> ReconcileReport
where
    F: FnMut(&str) -> bool,
{
    let mut report = ReconcileReport::default();
    for conversation in conversations.values_mut() {
        let mut updated_here = 0;
        for message in conversation.messages.iter_mut() {
            if let Some(files) = reconcile_message(message, &mut file_exists) {
                report.files_linked += files.len();
                message.generated_files = Some(files.into_iter().map(Value::String).collect());
                updated_here += 1;
            }
        }
        if updated_here > 0 {
            report.conversations_touched += 1;
            report.messages_updated += updated_here;
        }
    }
    report
}

/// Overwrites conversation owners with `username`; `only_empty` restricts
/// the rewrite to absent, empty, or anonymous owners.
pub fn assign_owner(
    conversations: &mut BTreeMap<String, Conversation>,
    username: &str,
    only_empty: bool,
) -> OwnershipReport {
    let mut report = OwnershipReport::default();
    for conversation in conversations.values_mut() {
        report.total += 1;
        if only_empty && conversation.has_named_owner() {
            continue;
        }
        if conversation.username.as_deref() == Some(username) {
            continue;
        }
        conversation.username = Some(username.to_string());
        report.changed += 1;
    }
    report
}

/// Applies the passes in their fixed order: scrub first so placeholder
/// variants normalize before dedup, reconcile on the surviving messages,
/// ownership last.
pub fn run_pipeline<F>(
    conversations: &mut BTreeMap<String, Conversation>,
    options: &PipelineOptions,
    file_exists: F,
) -> PipelineReport
where
    F: FnMut(&str) -> bool,
{
    let mut report = PipelineReport {
        conversations: conversations.len(),
        ..PipelineReport::default()
    };
    report.scrub = scrub_conversations(conversations);
    report.dedup = dedupe_conversations(conversations);
    report.reconcile = reconcile_conversations(conversations, file_exists);
    if let Some(username) = options.username.as_deref() {
        report.ownership = Some(assign_owner(conversations, username, options.only_empty));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ANONYMOUS_OWNER;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn message(role: Role, content: &str) -> Message {
        Message {
            role,
            content: content.to_string(),
            tool_calls: None,
            generated_files: None,
            original_parts: None,
            extra: BTreeMap::new(),
        }
    }

    fn assistant(content: &str) -> Message {
        message(Role::Assistant, content)
    }

    fn with_files(mut msg: Message, files: &[&str]) -> Message {
        msg.generated_files = Some(files.iter().map(|name| json!(name)).collect());
        msg
    }

    fn conversation(messages: Vec<Message>) -> Conversation {
        Conversation {
            title: None,
            username: None,
            model: None,
            created_at: None,
            updated_at: None,
            messages,
            extra: BTreeMap::new(),
        }
    }

    fn store_of(entries: Vec<(&str, Conversation)>) -> BTreeMap<String, Conversation> {
        entries
            .into_iter()
            .map(|(id, conversation)| (id.to_string(), conversation))
            .collect()
    }

    #[test]
    fn scrub_clears_placeholder_only_content() {
        let mut messages = vec![
            assistant(TOOL_CALL_PLACEHOLDER),
            assistant(&format!("{TOOL_CALL_PLACEHOLDER}\n{TOOL_CALL_PLACEHOLDER}")),
        ];
        let cleared = scrub_messages(&mut messages);
        assert_eq!(cleared, 2);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "");
        assert_eq!(messages[1].content, "");
    }

    #[test]
    fn scrub_clears_whitespace_only_assistant_content() {
        let mut messages = vec![assistant("  \n  ")];
        assert_eq!(scrub_messages(&mut messages), 1);
        assert_eq!(messages[0].content, "");
    }

    #[test]
    fn scrub_keeps_content_with_real_residue() {
        let mut messages = vec![assistant(&format!(
            "{TOOL_CALL_PLACEHOLDER}\nHere is the summary."
        ))];
        assert_eq!(scrub_messages(&mut messages), 0);
        assert!(messages[0].content.contains("Here is the summary."));
    }

    #[test]
    fn scrub_skips_messages_with_tool_calls_or_passthrough() {
        let mut with_tool = assistant(TOOL_CALL_PLACEHOLDER);
        with_tool.tool_calls = Some(vec![json!({"name": "make_chart"})]);
        let mut with_parts = assistant(TOOL_CALL_PLACEHOLDER);
        with_parts.original_parts = Some(json!([{"type": "tool_use"}]));
        let mut messages = vec![with_tool, with_parts];

        assert_eq!(scrub_messages(&mut messages), 0);
        assert_eq!(messages[0].content, TOOL_CALL_PLACEHOLDER);
        assert_eq!(messages[1].content, TOOL_CALL_PLACEHOLDER);
    }

    #[test]
    fn scrub_treats_empty_tool_calls_as_eligible() {
        let mut msg = assistant(TOOL_CALL_PLACEHOLDER);
        msg.tool_calls = Some(Vec::new());
        let mut messages = vec![msg];
        assert_eq!(scrub_messages(&mut messages), 1);
        assert_eq!(messages[0].content, "");
    }

    #[test]
    fn scrub_only_touches_assistant_messages() {
        let mut messages = vec![message(Role::User, TOOL_CALL_PLACEHOLDER)];
        assert_eq!(scrub_messages(&mut messages), 0);
        assert_eq!(messages[0].content, TOOL_CALL_PLACEHOLDER);
    }

    #[test]
    fn scrub_second_run_clears_nothing() {
        let mut messages = vec![assistant(TOOL_CALL_PLACEHOLDER)];
        assert_eq!(scrub_messages(&mut messages), 1);
        assert_eq!(scrub_messages(&mut messages), 0);
    }

    #[test]
    fn dedup_collapses_three_identical_adjacent_messages() {
        let mut messages = vec![
            message(Role::User, "hi"),
            message(Role::User, "hi"),
            message(Role::User, "hi"),
        ];
        let removed = dedupe_messages(&mut messages);
        assert_eq!(removed, 2);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hi");
    }

    #[test]
    fn dedup_keeps_non_adjacent_duplicates() {
        let mut messages = vec![
            message(Role::User, "hi"),
            assistant("hello"),
            message(Role::User, "hi"),
        ];
        assert_eq!(dedupe_messages(&mut messages), 0);
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn dedup_requires_matching_role_and_exact_content() {
        let mut messages = vec![message(Role::User, "hi"), assistant("hi")];
        assert_eq!(dedupe_messages(&mut messages), 0);

        let mut messages = vec![message(Role::User, "Hi"), message(Role::User, "hi")];
        assert_eq!(dedupe_messages(&mut messages), 0);
    }

    #[test]
    fn dedup_ignores_generated_file_order() {
        let mut messages = vec![
            with_files(assistant("done"), &["a.png", "b.png"]),
            with_files(assistant("done"), &["b.png", "a.png"]),
        ];
        assert_eq!(dedupe_messages(&mut messages), 1);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn dedup_requires_same_file_multiplicity() {
        let mut messages = vec![
            with_files(assistant("done"), &["a.png", "a.png"]),
            with_files(assistant("done"), &["a.png"]),
        ];
        assert_eq!(dedupe_messages(&mut messages), 0);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn dedup_distinguishes_absent_from_empty_files() {
        let mut first = assistant("done");
        first.generated_files = Some(Vec::new());
        let second = assistant("done");
        let mut messages = vec![first, second];
        assert_eq!(dedupe_messages(&mut messages), 0);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn dedup_unsortable_files_fall_back_to_structural_equality() {
        let mut matching_order = vec![assistant("done"), assistant("done")];
        matching_order[0].generated_files = Some(vec![json!(1), json!("a.png")]);
        matching_order[1].generated_files = Some(vec![json!(1), json!("a.png")]);
        assert_eq!(dedupe_messages(&mut matching_order), 1);

        let mut swapped_order = vec![assistant("done"), assistant("done")];
        swapped_order[0].generated_files = Some(vec![json!(1), json!("a.png")]);
        swapped_order[1].generated_files = Some(vec![json!("a.png"), json!(1)]);
        assert_eq!(dedupe_messages(&mut swapped_order), 0);
    }

    #[test]
    fn dedup_is_idempotent() {
        let mut messages = vec![
            message(Role::User, "hi"),
            message(Role::User, "hi"),
            assistant("hello"),
            assistant("hello"),
        ];
        assert_eq!(dedupe_messages(&mut messages), 2);
        assert_eq!(dedupe_messages(&mut messages), 0);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn dedup_leaves_no_adjacent_duplicates_behind() {
        let mut messages = vec![
            message(Role::User, "a"),
            message(Role::User, "a"),
            message(Role::User, "b"),
            message(Role::User, "b"),
            message(Role::User, "a"),
        ];
        dedupe_messages(&mut messages);
        for pair in messages.windows(2) {
            let same = pair[0].role == pair[1].role && pair[0].content == pair[1].content;
            assert!(!same, "adjacent duplicates survived");
        }
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn extract_candidates_supports_unicode_and_dedupes() {
        let candidates = extract_file_candidates("生成了 report.xlsx 和 chart.png 以及 chart.png");
        assert_eq!(
            candidates,
            vec!["report.xlsx", "report.xls", "chart.png"],
            "xlsx matcher runs before xls, so the xls-prefix token comes second"
        );

        let unicode = extract_file_candidates("已生成 统计表.xlsx");
        assert_eq!(unicode, vec!["统计表.xlsx", "统计表.xls"]);
    }

    #[test]
    fn extract_candidates_is_case_insensitive_on_extension() {
        let candidates = extract_file_candidates("saved Photo-1.PNG");
        assert_eq!(candidates, vec!["Photo-1.PNG"]);
    }

    #[test]
    fn reconcile_keeps_only_files_that_exist() {
        let existing: BTreeSet<&str> = ["report.xlsx"].into_iter().collect();
        let msg = assistant("生成了 report.xlsx 和 chart.png");
        let resolved = reconcile_message(&msg, |name| existing.contains(name));
        assert_eq!(resolved, Some(vec!["report.xlsx".to_string()]));
    }

    #[test]
    fn reconcile_returns_none_instead_of_empty_list() {
        let msg = assistant("生成了 chart.png");
        let resolved = reconcile_message(&msg, |_| false);
        assert_eq!(resolved, None);
    }

    #[test]
    fn reconcile_skips_messages_with_existing_provenance() {
        let msg = with_files(assistant("see chart.png"), &["chart.png"]);
        let resolved = reconcile_message(&msg, |_| true);
        assert_eq!(resolved, None);
    }

    #[test]
    fn reconcile_treats_empty_provenance_as_missing() {
        let mut msg = assistant("see chart.png");
        msg.generated_files = Some(Vec::new());
        let resolved = reconcile_message(&msg, |_| true);
        assert_eq!(resolved, Some(vec!["chart.png".to_string()]));
    }

    #[test]
    fn reconcile_ignores_non_assistant_messages() {
        let msg = message(Role::User, "please open chart.png");
        assert_eq!(reconcile_message(&msg, |_| true), None);
    }

    #[test]
    fn reconcile_conversations_writes_string_entries() {
        let mut store = store_of(vec![(
            "c1",
            conversation(vec![assistant("wrote summary-2024.xlsx")]),
        )]);
        let report = reconcile_conversations(&mut store, |name| name == "summary-2024.xlsx");
        assert_eq!(report.messages_updated, 1);
        assert_eq!(report.files_linked, 1);
        let files = &store["c1"].messages[0].generated_files;
        assert_eq!(files, &Some(vec![json!("summary-2024.xlsx")]));
    }

    #[test]
    fn assign_owner_backfills_missing_empty_and_anonymous() {
        let mut empty_owner = conversation(Vec::new());
        empty_owner.username = Some(String::new());
        let mut anonymous_owner = conversation(Vec::new());
        anonymous_owner.username = Some(ANONYMOUS_OWNER.to_string());
        let mut named_owner = conversation(Vec::new());
        named_owner.username = Some("bob".to_string());

        let mut store = store_of(vec![
            ("missing", conversation(Vec::new())),
            ("empty", empty_owner),
            ("anonymous", anonymous_owner),
            ("named", named_owner),
        ]);
        let report = assign_owner(&mut store, "alice", true);
        assert_eq!(report.total, 4);
        assert_eq!(report.changed, 3);
        assert_eq!(store["missing"].username.as_deref(), Some("alice"));
        assert_eq!(store["empty"].username.as_deref(), Some("alice"));
        assert_eq!(store["anonymous"].username.as_deref(), Some("alice"));
        assert_eq!(store["named"].username.as_deref(), Some("bob"));
    }

    #[test]
    fn assign_owner_overwrite_mode_replaces_named_owners() {
        let mut named_owner = conversation(Vec::new());
        named_owner.username = Some("bob".to_string());
        let mut store = store_of(vec![("named", named_owner)]);

        let report = assign_owner(&mut store, "alice", false);
        assert_eq!(report.changed, 1);
        assert_eq!(store["named"].username.as_deref(), Some("alice"));
    }

    #[test]
    fn assign_owner_does_not_count_matching_owner_as_changed() {
        let mut owned = conversation(Vec::new());
        owned.username = Some("alice".to_string());
        let mut store = store_of(vec![("owned", owned)]);

        let report = assign_owner(&mut store, "alice", false);
        assert_eq!(report.total, 1);
        assert_eq!(report.changed, 0);
    }

    #[test]
    fn assign_owner_never_touches_messages() {
        let mut store = store_of(vec![(
            "c1",
            conversation(vec![message(Role::User, "hi"), assistant("hello")]),
        )]);
        let before = store["c1"].messages.clone();
        assign_owner(&mut store, "alice", true);
        assert_eq!(store["c1"].messages, before);
    }

    #[test]
    fn pipeline_scrubs_before_deduping() {
        let mut store = store_of(vec![(
            "c1",
            conversation(vec![
                assistant(TOOL_CALL_PLACEHOLDER),
                assistant(&format!("{TOOL_CALL_PLACEHOLDER}\n{TOOL_CALL_PLACEHOLDER}")),
            ]),
        )]);
        let report = run_pipeline(&mut store, &PipelineOptions::default(), |_| false);
        assert_eq!(report.scrub.messages_cleared, 2);
        assert_eq!(report.dedup.messages_removed, 1);
        let messages = &store["c1"].messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "");
        assert_eq!(messages[0].role, Role::Assistant);
    }

    #[test]
    fn pipeline_skips_ownership_without_username() {
        let mut store = store_of(vec![("c1", conversation(Vec::new()))]);
        let report = run_pipeline(&mut store, &PipelineOptions::default(), |_| false);
        assert_eq!(report.ownership, None);
        assert_eq!(store["c1"].username, None);

        let options = PipelineOptions {
            username: Some("alice".to_string()),
            only_empty: true,
        };
        let report = run_pipeline(&mut store, &options, |_| false);
        assert_eq!(
            report.ownership,
            Some(OwnershipReport {
                total: 1,
                changed: 1
            })
        );
    }
}
