use anyhow::{Result, bail};
use serde::Serialize;
use sha2::{Digest, Sha256};
use similar::TextDiff;

use crate::model::{DocPage, Mode, Namespace, PageStore, PageTitle};
use crate::tree::{TreeItem, build_tree};

/// Policy hook deciding whether an existing published page may be
/// overwritten. The current policy always allows it; `Blocked` stays a
/// live classification for stricter policies.
pub trait OverwritePolicy {
    fn overwrite_allowed(&self, target: &PageTitle) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOverwrite;

impl OverwritePolicy for AlwaysOverwrite {
    fn overwrite_allowed(&self, _target: &PageTitle) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    NewPage,
    Changed,
    Unchanged,
    Blocked,
}

impl SelectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewPage => "new_page",
            Self::Changed => "changed",
            Self::Unchanged => "unchanged",
            Self::Blocked => "blocked",
        }
    }
}

/// One candidate page of a plan. The orchestrator re-derives titles from
/// the submitted source name; only `source_name` is authoritative input.
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub selection_id: String,
    pub source_name: String,
    pub source_title: String,
    pub target_title: String,
    pub display_label: String,
    pub checkable: bool,
    pub default_checked: bool,
    pub reason: SelectionReason,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PagePlan {
    pub mode: Mode,
    pub root: String,
    pub selections: Vec<Selection>,
    pub unresolved: Vec<String>,
    pub actionable: usize,
}

/// Stable per-page identifier: derived from the source title so it does
/// not vary across requests.
pub fn selection_id(source_title: &PageTitle) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_title.full().as_bytes());
    let digest = hasher.finalize();
    let mut id = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// Classify a single page for the given mode. Returns checkability, the
/// reason, and an optional human-readable detail.
pub fn classify(
    store: &mut dyn PageStore,
    policy: &dyn OverwritePolicy,
    source: &PageTitle,
    target: &PageTitle,
    mode: Mode,
) -> Result<(bool, SelectionReason, Option<String>)> {
    match mode {
        Mode::Publish => {
            if source.namespace != Namespace::Draft {
                bail!("must be a draft page: {source}");
            }
            if target.namespace != Namespace::Published {
                bail!("publish target must be a published-location page: {target}");
            }
        }
        Mode::Refresh => {
            if target.namespace == Namespace::Draft {
                bail!("must be a published page: {target}");
            }
        }
    }

    if !store.exists(target)? {
        return Ok((true, SelectionReason::NewPage, None));
    }
    if !policy.overwrite_allowed(target) {
        return Ok((
            false,
            SelectionReason::Blocked,
            Some("already exists".to_string()),
        ));
    }

    if mode == Mode::Refresh {
        // Refresh recomputes derived data even when the text is
        // unchanged, so an existing page is always actionable.
        return Ok((true, SelectionReason::Changed, None));
    }

    let source_body = store
        .read(source)?
        .ok_or_else(|| anyhow::anyhow!("draft page does not exist: {source}"))?;
    let target_body = store
        .read(target)?
        .ok_or_else(|| anyhow::anyhow!("published page vanished during diff: {target}"))?;
    if source_body == target_body {
        return Ok((
            false,
            SelectionReason::Unchanged,
            Some("no change".to_string()),
        ));
    }
    Ok((
        true,
        SelectionReason::Changed,
        Some(change_detail(&target_body, &source_body)),
    ))
}

fn change_detail(old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut added = 0usize;
    let mut removed = 0usize;
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Insert => added += 1,
            similar::ChangeTag::Delete => removed += 1,
            similar::ChangeTag::Equal => {}
        }
    }
    format!("+{added}/-{removed} lines")
}

/// Walk the hierarchy below `root` and classify every visible page,
/// producing the selection list the submission form is rendered from.
pub fn plan_pages(
    store: &mut dyn PageStore,
    policy: &dyn OverwritePolicy,
    root: &DocPage,
    mode: Mode,
) -> Result<PagePlan> {
    let tree = build_tree(root);
    let mut selections = Vec::new();
    let mut unresolved = Vec::new();

    for item in tree.visible_items() {
        let page = match item {
            TreeItem::Page(page) => page,
            TreeItem::Unresolved(name) => {
                unresolved.push(name.to_string());
                continue;
            }
        };
        let name = &page.title().name;
        let source = PageTitle::draft(name)?;
        let target = PageTitle::published(name)?;

        if mode == Mode::Refresh && page.is_borrowed() {
            selections.push(Selection {
                selection_id: selection_id(&source),
                source_name: name.clone(),
                source_title: source.full(),
                target_title: target.full(),
                display_label: format!("{name} (this is a borrowed page)"),
                checkable: false,
                default_checked: false,
                reason: SelectionReason::Blocked,
                detail: Some("this is a borrowed page".to_string()),
            });
            continue;
        }

        let (checkable, reason, detail) = classify(store, policy, &source, &target, mode)?;
        let display_label = match (&reason, &detail) {
            (SelectionReason::Unchanged, _) => format!("{name} (no change)"),
            (SelectionReason::Blocked, _) => format!("{name} (already exists)"),
            _ => name.clone(),
        };
        selections.push(Selection {
            selection_id: selection_id(&source),
            source_name: name.clone(),
            source_title: source.full(),
            target_title: target.full(),
            display_label,
            checkable,
            default_checked: checkable,
            reason,
            detail,
        });
    }

    let actionable = selections
        .iter()
        .filter(|selection| selection.checkable)
        .count();
    Ok(PagePlan {
        mode,
        root: root.title().name.clone(),
        selections,
        unresolved,
        actionable,
    })
}
