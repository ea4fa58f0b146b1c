use confab_core::{Conversation, Role};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileScopeReport {
    pub conversations_scoped: usize,
    pub files_copied: usize,
    pub files_already_scoped: usize,
    pub files_missing_source: usize,
    pub files_failed: usize,
}

impl FileScopeReport {
    pub fn files_examined(&self) -> usize {
        self.files_copied
            + self.files_already_scoped
            + self.files_missing_source
            + self.files_failed
    }
}

/// Copies legacy shared files into per-conversation scope directories.
/// Files are copied, never moved, and an existing destination is never
/// overwritten; a failed copy is counted and logged, not fatal.
pub fn resolve_file_scopes(
    conversations: &BTreeMap<String, Conversation>,
    outputs_root: &Path,
    legacy_root: &Path,
    dry_run: bool,
) -> FileScopeReport {
    let mut report = FileScopeReport::default();
    for (conversation_id, conversation) in conversations {
        let names = scoped_file_names(conversation);
        if names.is_empty() {
            continue;
        }
        report.conversations_scoped += 1;

        let scope_dir = outputs_root.join(conversation_id);
        if !dry_run {
            if let Err(err) = fs::create_dir_all(&scope_dir) {
                warn!(
                    conversation = conversation_id.as_str(),
                    error = %err,
                    "could not create scope directory"
                );
                report.files_failed += names.len();
                continue;
            }
        }

        for name in names {
            if name.contains('/') || name.contains('\\') {
                warn!(
                    conversation = conversation_id.as_str(),
                    file = name,
                    "refusing file name with path separator"
                );
                report.files_failed += 1;
                continue;
            }
            let destination = scope_dir.join(name);
            if destination.exists() {
                report.files_already_scoped += 1;
                continue;
            }
            let source = legacy_root.join(name);
            if !source.is_file() {
                report.files_missing_source += 1;
                continue;
            }
            if dry_run {
                report.files_copied += 1;
                continue;
            }
            match fs::copy(&source, &destination) {
                Ok(_) => report.files_copied += 1,
                Err(err) => {
                    warn!(
                        conversation = conversation_id.as_str(),
                        file = name,
                        error = %err,
                        "copy into conversation scope failed"
                    );
                    report.files_failed += 1;
                }
            }
        }
    }
    report
}

fn scoped_file_names(conversation: &Conversation) -> Vec<&str> {
    let mut names: Vec<&str> = Vec::new();
    for message in &conversation.messages {
        if message.role != Role::Assistant || !message.has_generated_files() {
            continue;
        }
        for name in message.generated_file_names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}
