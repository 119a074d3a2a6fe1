use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::model::{IdentityProvider, PageStore, PageTitle, RevisionStore, WriteAction};

pub const CREATE_TASK_KIND: &str = "create-page";
pub const REFRESH_TASK_KIND: &str = "refresh-page";

/// Suffix appended to the edit summary of the follow-up refresh a
/// successful create task enqueues.
pub const REFRESH_SUMMARY_SUFFIX: &str = " (refresh)";

/// Where a create task finds the body to write. Bodies small enough to
/// travel inline are frozen at submission time; oversized bodies are
/// parked in the revision store and referenced by id, with the original
/// source title kept as a last-resort live fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ContentSource {
    Inline {
        body: String,
    },
    RevisionRef {
        revision_id: i64,
        fallback_title: PageTitle,
    },
    LiveTitle {
        title: PageTitle,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishTaskParams {
    pub source_title: PageTitle,
    pub target_title: PageTitle,
    pub acting_user_id: i64,
    pub edit_summary: String,
    /// Present only when the page has a hierarchy parent; its absence
    /// means no parent check is required (top-level Product pages).
    pub parent_target_title: Option<PageTitle>,
    pub content: ContentSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTaskParams {
    pub target_title: PageTitle,
    pub acting_user_id: i64,
    pub edit_summary: String,
}

/// A unit of work handed to the queue. The queue executes each task
/// independently; failures are isolated per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "task")]
pub enum TaskSpec {
    Create(PublishTaskParams),
    Refresh(RefreshTaskParams),
}

impl TaskSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create(_) => CREATE_TASK_KIND,
            Self::Refresh(_) => REFRESH_TASK_KIND,
        }
    }

    pub fn target_title(&self) -> &PageTitle {
        match self {
            Self::Create(params) => &params.target_title,
            Self::Refresh(params) => &params.target_title,
        }
    }
}

pub trait TaskQueue {
    /// Hand a whole batch to the queue in one call. No execution-order
    /// guarantee across the batch is implied.
    fn enqueue(&mut self, batch: Vec<TaskSpec>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    Succeeded {
        action: WriteAction,
        detail: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => Some(error),
            Self::Succeeded { .. } => None,
        }
    }
}

/// Execute a create task. Returns the outcome plus the follow-up refresh
/// to enqueue on success. No error escapes the task boundary.
pub fn run_create_page(
    store: &mut dyn PageStore,
    revisions: &mut dyn RevisionStore,
    identity: &dyn IdentityProvider,
    params: &PublishTaskParams,
) -> (TaskOutcome, Option<RefreshTaskParams>) {
    match create_page_inner(store, revisions, identity, params) {
        Ok((action, detail)) => {
            let follow_up = RefreshTaskParams {
                target_title: params.target_title.clone(),
                acting_user_id: params.acting_user_id,
                edit_summary: format!("{}{}", params.edit_summary, REFRESH_SUMMARY_SUFFIX),
            };
            (TaskOutcome::Succeeded { action, detail }, Some(follow_up))
        }
        Err(error) => (
            TaskOutcome::Failed {
                error: format!("{CREATE_TASK_KIND}: {error:#}"),
            },
            None,
        ),
    }
}

fn create_page_inner(
    store: &mut dyn PageStore,
    revisions: &mut dyn RevisionStore,
    identity: &dyn IdentityProvider,
    params: &PublishTaskParams,
) -> Result<(WriteAction, Option<String>)> {
    // Batch execution order is not guaranteed, so a declared parent is
    // re-checked now, not at submission time.
    if let Some(parent) = &params.parent_target_title
        && !store.exists(parent)?
    {
        bail!("parent page is missing; canceling save");
    }

    let (body, detail) = resolve_content(store, revisions, &params.content)?;
    let actor = identity
        .actor_by_id(params.acting_user_id)
        .context("failed to resolve acting user")?;
    let action = store
        .create_or_modify(&params.target_title, &body, &params.edit_summary, &actor)
        .with_context(|| format!("failed to write {}", params.target_title))?;
    Ok((action, detail))
}

fn resolve_content(
    store: &mut dyn PageStore,
    revisions: &mut dyn RevisionStore,
    content: &ContentSource,
) -> Result<(String, Option<String>)> {
    match content {
        ContentSource::Inline { body } => Ok((body.clone(), None)),
        ContentSource::RevisionRef {
            revision_id,
            fallback_title,
        } => {
            if let Some(revision) = revisions.revision_by_id(*revision_id)? {
                return Ok((revision.content, None));
            }
            // The frozen revision is gone; the live source may have
            // drifted from what was diffed at submission time.
            let body = store.read(fallback_title)?.ok_or_else(|| {
                anyhow::anyhow!(
                    "revision {revision_id} not found and fallback page {fallback_title} is missing"
                )
            })?;
            Ok((
                body,
                Some(format!(
                    "stale fallback: revision {revision_id} not found, used live content of {fallback_title}"
                )),
            ))
        }
        ContentSource::LiveTitle { title } => {
            let body = store
                .read(title)?
                .ok_or_else(|| anyhow::anyhow!("source page does not exist: {title}"))?;
            Ok((body, None))
        }
    }
}

/// Execute a refresh task: re-read the page's own current content and
/// rewrite it unchanged, forcing recomputation of content-derived data.
pub fn run_refresh_page(
    store: &mut dyn PageStore,
    identity: &dyn IdentityProvider,
    params: &RefreshTaskParams,
) -> TaskOutcome {
    match refresh_page_inner(store, identity, params) {
        Ok(action) => TaskOutcome::Succeeded {
            action,
            detail: None,
        },
        Err(error) => TaskOutcome::Failed {
            error: format!("{REFRESH_TASK_KIND}: {error:#}"),
        },
    }
}

fn refresh_page_inner(
    store: &mut dyn PageStore,
    identity: &dyn IdentityProvider,
    params: &RefreshTaskParams,
) -> Result<WriteAction> {
    let body = store
        .read(&params.target_title)?
        .ok_or_else(|| anyhow::anyhow!("page does not exist: {}", params.target_title))?;
    let actor = identity
        .actor_by_id(params.acting_user_id)
        .context("failed to resolve acting user")?;
    store
        .create_or_modify(&params.target_title, &body, &params.edit_summary, &actor)
        .with_context(|| format!("failed to rewrite {}", params.target_title))
}
