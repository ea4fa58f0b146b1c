use anyhow::{Context, Result};
use chrono::Utc;
use confab_core::passes::{self, PipelineOptions};
use confab_store::file_scope::{resolve_file_scopes, FileScopeReport};
use confab_store::{snapshot_store, ConversationStore, MaintenanceLock};
use std::path::{Path, PathBuf};
use tracing::info;

pub struct RunOptions {
    pub store: PathBuf,
    pub outputs_root: PathBuf,
    pub legacy_root: Option<PathBuf>,
    pub username: Option<String>,
    pub only_empty: bool,
    pub dry_run: bool,
}

// The returned lock must stay alive until the final write has finished.
fn open_store(path: &Path, dry_run: bool) -> Result<(ConversationStore, Option<MaintenanceLock>)> {
    let lock = if dry_run {
        None
    } else {
        let lock_path = MaintenanceLock::path_for_store(path);
        let lock = MaintenanceLock::acquire(&lock_path, Utc::now())
            .context("Failed to take the maintenance lock; is the serving process still running?")?;
        info!(lock = %lock.path().display(), "maintenance lock taken");
        Some(lock)
    };
    let store = ConversationStore::load(path).context("Failed to load conversation store")?;
    info!(
        store = %path.display(),
        conversations = store.len(),
        "store loaded"
    );
    Ok((store, lock))
}

// A backup failure aborts the run before anything is written.
fn take_snapshot(path: &Path, dry_run: bool) -> Result<()> {
    if dry_run {
        return Ok(());
    }
    let snapshot = snapshot_store(path, Utc::now()).context("Failed to write store backup")?;
    info!(
        files = snapshot.files.len(),
        timestamp = snapshot.timestamp.as_str(),
        "backup written"
    );
    match snapshot.files.as_slice() {
        [single] => println!("backup written to {}", single.display()),
        files => println!(
            "backed up {} store documents (suffix backup_{})",
            files.len(),
            snapshot.timestamp
        ),
    }
    Ok(())
}

fn persist(store: &ConversationStore, dry_run: bool) -> Result<()> {
    if dry_run {
        println!("dry run: store left untouched");
        return Ok(());
    }
    store.save().context("Failed to write conversation store")?;
    info!(store = %store.path().display(), "store written");
    Ok(())
}

pub fn scrub(store_path: &Path, dry_run: bool) -> Result<()> {
    let (mut store, _lock) = open_store(store_path, dry_run)?;
    take_snapshot(store_path, dry_run)?;
    let report = passes::scrub_conversations(store.conversations_mut());
    persist(&store, dry_run)?;
    println!(
        "cleared {} placeholder-only message(s) in {} conversation(s)",
        report.messages_cleared, report.conversations_touched
    );
    Ok(())
}

pub fn dedupe(store_path: &Path, dry_run: bool) -> Result<()> {
    let (mut store, _lock) = open_store(store_path, dry_run)?;
    take_snapshot(store_path, dry_run)?;
    let report = passes::dedupe_conversations(store.conversations_mut());
    persist(&store, dry_run)?;
    println!(
        "removed {} adjacent duplicate message(s) in {} conversation(s)",
        report.messages_removed, report.conversations_touched
    );
    Ok(())
}

pub fn reconcile(store_path: &Path, outputs_root: &Path, dry_run: bool) -> Result<()> {
    let (mut store, _lock) = open_store(store_path, dry_run)?;
    take_snapshot(store_path, dry_run)?;
    let report = passes::reconcile_conversations(store.conversations_mut(), |name| {
        outputs_root.join(name).is_file()
    });
    persist(&store, dry_run)?;
    println!(
        "linked {} file(s) on {} message(s) in {} conversation(s)",
        report.files_linked, report.messages_updated, report.conversations_touched
    );
    Ok(())
}

pub fn assign_owner(
    store_path: &Path,
    username: &str,
    only_empty: bool,
    dry_run: bool,
) -> Result<()> {
    let (mut store, _lock) = open_store(store_path, dry_run)?;
    take_snapshot(store_path, dry_run)?;
    let report = passes::assign_owner(store.conversations_mut(), username, only_empty);
    persist(&store, dry_run)?;
    println!(
        "owner set to {username} on {} of {} conversation(s)",
        report.changed, report.total
    );
    Ok(())
}

// The resolver never writes the store, so it runs without lock or backup.
pub fn resolve_files(
    store_path: &Path,
    outputs_root: &Path,
    legacy_root: Option<&Path>,
    dry_run: bool,
) -> Result<()> {
    let store = ConversationStore::load(store_path).context("Failed to load conversation store")?;
    let legacy = legacy_root.unwrap_or(outputs_root);
    let report = resolve_file_scopes(store.conversations(), outputs_root, legacy, dry_run);
    print_file_scope_summary(&report, dry_run);
    Ok(())
}

pub fn run_all(options: &RunOptions) -> Result<()> {
    let (mut store, _lock) = open_store(&options.store, options.dry_run)?;
    take_snapshot(&options.store, options.dry_run)?;

    let pipeline_options = PipelineOptions {
        username: options.username.clone(),
        only_empty: options.only_empty,
    };
    let outputs_root = options.outputs_root.as_path();
    let report = passes::run_pipeline(store.conversations_mut(), &pipeline_options, |name| {
        outputs_root.join(name).is_file()
    });
    persist(&store, options.dry_run)?;

    let legacy = options.legacy_root.as_deref().unwrap_or(outputs_root);
    let scope_report =
        resolve_file_scopes(store.conversations(), outputs_root, legacy, options.dry_run);

    println!("processed {} conversation(s)", report.conversations);
    println!(
        "  scrub: cleared {} message(s) in {} conversation(s)",
        report.scrub.messages_cleared, report.scrub.conversations_touched
    );
    println!(
        "  dedup: removed {} message(s) in {} conversation(s)",
        report.dedup.messages_removed, report.dedup.conversations_touched
    );
    println!(
        "  reconcile: linked {} file(s) on {} message(s)",
        report.reconcile.files_linked, report.reconcile.messages_updated
    );
    if let Some(ownership) = &report.ownership {
        println!(
            "  ownership: changed {} of {} conversation(s)",
            ownership.changed, ownership.total
        );
    }
    print_file_scope_summary(&scope_report, options.dry_run);
    Ok(())
}

pub fn check(store_path: &Path, outputs_root: &Path, legacy_root: Option<&Path>) -> Result<()> {
    let mut store =
        ConversationStore::load(store_path).context("Failed to load conversation store")?;
    let report = passes::run_pipeline(
        store.conversations_mut(),
        &PipelineOptions::default(),
        |name| outputs_root.join(name).is_file(),
    );
    let legacy = legacy_root.unwrap_or(outputs_root);
    let scope_report = resolve_file_scopes(store.conversations(), outputs_root, legacy, true);

    println!(
        "checked {} conversation(s); nothing was written",
        report.conversations
    );
    println!(
        "  scrub would clear {} message(s)",
        report.scrub.messages_cleared
    );
    println!(
        "  dedup would remove {} message(s)",
        report.dedup.messages_removed
    );
    println!(
        "  reconcile would link {} file(s)",
        report.reconcile.files_linked
    );
    println!(
        "  file scopes: would copy {} file(s)",
        scope_report.files_copied
    );
    Ok(())
}

fn print_file_scope_summary(report: &FileScopeReport, dry_run: bool) {
    let verb = if dry_run { "would copy" } else { "copied" };
    println!(
        "{verb} {} file(s) into {} conversation scope(s); {} already scoped, {} missing from legacy root, {} failed",
        report.files_copied,
        report.conversations_scoped,
        report.files_already_scoped,
        report.files_missing_source,
        report.files_failed
    );
}
