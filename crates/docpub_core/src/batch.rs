use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::model::{DocPage, Mode, Namespace, PageStore, PageTitle, RevisionStore};
use crate::task::{ContentSource, PublishTaskParams, RefreshTaskParams, TaskQueue, TaskSpec};

/// Default ceiling on how many bytes of content travel inline inside
/// queued task parameters; larger bodies are frozen into the revision
/// store instead.
pub const DEFAULT_MAX_INLINE_BODY_BYTES: usize = 65_535;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub edit_summary: String,
    pub max_inline_body_bytes: usize,
}

impl BatchOptions {
    pub fn new(edit_summary: &str) -> Self {
        Self {
            edit_summary: edit_summary.to_string(),
            max_inline_body_bytes: DEFAULT_MAX_INLINE_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub mode: Mode,
    pub message: String,
    pub queued: usize,
    /// Pages excluded from the batch rather than queued, with the reason.
    pub skipped: Vec<String>,
}

/// Turn a set of selected page names into queued tasks. Content is
/// frozen here, synchronously, so later draft edits cannot leak into an
/// already submitted batch. The whole batch goes to the queue in one
/// enqueue call. The queue backend doubles as the revision store so
/// frozen bodies land next to the tasks that reference them.
pub fn submit_batch<B>(
    store: &mut dyn PageStore,
    queue: &mut B,
    root: &DocPage,
    selected_names: &[String],
    mode: Mode,
    acting_user_id: i64,
    options: &BatchOptions,
) -> Result<BatchResult>
where
    B: TaskQueue + RevisionStore + ?Sized,
{
    if selected_names.is_empty() {
        return Ok(BatchResult {
            mode,
            message: "No pages were specified.".to_string(),
            queued: 0,
            skipped: Vec::new(),
        });
    }

    let mut tasks = Vec::new();
    let mut queued_titles = Vec::new();
    let mut skipped = Vec::new();
    // Tracks the single-page wording: created vs modified.
    let mut any_existing_target = false;

    for name in selected_names {
        let page = root
            .find(name)
            .with_context(|| format!("selected page is not in the hierarchy: {name}"))?;
        let target = PageTitle::published(name)?;

        match mode {
            Mode::Publish => {
                let source = PageTitle::draft(name)?;
                let body = store
                    .read(&source)?
                    .ok_or_else(|| anyhow::anyhow!("draft page does not exist: {source}"))?;
                if store.exists(&target)? {
                    any_existing_target = true;
                }
                let content = if body.len() > options.max_inline_body_bytes {
                    let revision_id = queue
                        .store_revision(&target.full(), &body)
                        .with_context(|| format!("failed to freeze content for {target}"))?;
                    ContentSource::RevisionRef {
                        revision_id,
                        fallback_title: source.clone(),
                    }
                } else {
                    ContentSource::Inline { body }
                };
                tasks.push(TaskSpec::Create(PublishTaskParams {
                    source_title: source,
                    target_title: target.clone(),
                    acting_user_id,
                    edit_summary: options.edit_summary.clone(),
                    parent_target_title: page
                        .parent_title()
                        .map(|parent| parent.in_namespace(Namespace::Published)),
                    content,
                }));
            }
            Mode::Refresh => {
                if page.is_borrowed() {
                    skipped.push(format!("{name} (borrowed page)"));
                    continue;
                }
                if !store.exists(&target)? {
                    bail!("page to refresh does not exist: {target}");
                }
                tasks.push(TaskSpec::Refresh(RefreshTaskParams {
                    target_title: target.clone(),
                    acting_user_id,
                    edit_summary: options.edit_summary.clone(),
                }));
            }
        }
        queued_titles.push(target.full());
    }

    let queued = tasks.len();
    if queued > 0 {
        queue.enqueue(tasks).context("failed to enqueue batch")?;
    }

    let message = batch_message(mode, &queued_titles, any_existing_target);
    Ok(BatchResult {
        mode,
        message,
        queued,
        skipped,
    })
}

fn batch_message(mode: Mode, titles: &[String], any_existing_target: bool) -> String {
    match (mode, titles) {
        (_, []) => "No pages were specified.".to_string(),
        (Mode::Publish, [title]) => {
            if any_existing_target {
                format!("The page {title} will be modified.")
            } else {
                format!("The page {title} will be created.")
            }
        }
        (Mode::Refresh, [title]) => format!("The page {title} will be refreshed."),
        (Mode::Publish, titles) => format!(
            "The following pages will be created or modified: {}.",
            titles.join(", ")
        ),
        (Mode::Refresh, titles) => format!(
            "The following pages will be refreshed: {}.",
            titles.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{BatchOptions, submit_batch};
    use crate::model::{
        Actor, DocPage, FrozenRevision, Mode, PageStore, PageTitle, RevisionStore, TocEntry,
        TocNode, WriteAction,
    };
    use crate::task::{ContentSource, TaskQueue, TaskSpec};

    #[derive(Default)]
    struct MockStore {
        pages: BTreeMap<String, String>,
    }

    impl MockStore {
        fn insert(&mut self, title: &PageTitle, body: &str) {
            self.pages.insert(title.full(), body.to_string());
        }
    }

    impl PageStore for MockStore {
        fn exists(&mut self, title: &PageTitle) -> anyhow::Result<bool> {
            Ok(self.pages.contains_key(&title.full()))
        }

        fn read(&mut self, title: &PageTitle) -> anyhow::Result<Option<String>> {
            Ok(self.pages.get(&title.full()).cloned())
        }

        fn create_or_modify(
            &mut self,
            title: &PageTitle,
            body: &str,
            _summary: &str,
            _actor: &Actor,
        ) -> anyhow::Result<WriteAction> {
            let action = if self.pages.contains_key(&title.full()) {
                WriteAction::Modified
            } else {
                WriteAction::Created
            };
            self.pages.insert(title.full(), body.to_string());
            Ok(action)
        }
    }

    #[derive(Default)]
    struct MockBackend {
        revisions: Vec<FrozenRevision>,
        batches: Vec<Vec<TaskSpec>>,
    }

    impl RevisionStore for MockBackend {
        fn store_revision(&mut self, target_title: &str, content: &str) -> anyhow::Result<i64> {
            let id = self.revisions.len() as i64 + 1;
            self.revisions.push(FrozenRevision {
                id,
                target_title: target_title.to_string(),
                content: content.to_string(),
            });
            Ok(id)
        }

        fn revision_by_id(&mut self, id: i64) -> anyhow::Result<Option<FrozenRevision>> {
            Ok(self
                .revisions
                .iter()
                .find(|revision| revision.id == id)
                .cloned())
        }
    }

    impl TaskQueue for MockBackend {
        fn enqueue(&mut self, batch: Vec<TaskSpec>) -> anyhow::Result<()> {
            self.batches.push(batch);
            Ok(())
        }
    }

    fn hierarchy(borrowed: bool) -> DocPage {
        DocPage::Product {
            title: PageTitle::draft("Widget").expect("title"),
            versions: vec![DocPage::Version {
                title: PageTitle::draft("Widget/1.0").expect("title"),
                parent: PageTitle::draft("Widget").expect("parent"),
                manuals: vec![DocPage::Manual {
                    title: PageTitle::draft("Widget/1.0/Guide").expect("title"),
                    parent: PageTitle::draft("Widget/1.0").expect("parent"),
                    toc: vec![TocEntry {
                        node: TocNode::Topic(Box::new(DocPage::Topic {
                            title: PageTitle::draft("Widget/1.0/Guide/Install").expect("title"),
                            parent: PageTitle::draft("Widget/1.0/Guide").expect("parent"),
                            borrowed,
                        })),
                        level: 1,
                    }],
                }],
            }],
        }
    }

    fn seed_drafts(store: &mut MockStore) {
        for name in [
            "Widget",
            "Widget/1.0",
            "Widget/1.0/Guide",
            "Widget/1.0/Guide/Install",
        ] {
            store.insert(&PageTitle::draft(name).expect("title"), "draft body");
        }
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn empty_selection_queues_nothing() {
        let mut store = MockStore::default();
        let mut queue = MockBackend::default();
        let root = hierarchy(false);

        let result = submit_batch(
            &mut store,
            &mut queue,
            &root,
            &[],
            Mode::Publish,
            7,
            &BatchOptions::new("Published"),
        )
        .expect("submit");

        assert_eq!(result.message, "No pages were specified.");
        assert_eq!(result.queued, 0);
        assert!(queue.batches.is_empty());
    }

    #[test]
    fn single_new_page_says_created_and_carries_parent() {
        let mut store = MockStore::default();
        seed_drafts(&mut store);
        let mut queue = MockBackend::default();
        let root = hierarchy(false);

        let result = submit_batch(
            &mut store,
            &mut queue,
            &root,
            &names(&["Widget/1.0"]),
            Mode::Publish,
            7,
            &BatchOptions::new("Published"),
        )
        .expect("submit");

        assert_eq!(result.message, "The page Widget/1.0 will be created.");
        assert_eq!(queue.batches.len(), 1);
        match &queue.batches[0][0] {
            TaskSpec::Create(params) => {
                assert_eq!(
                    params
                        .parent_target_title
                        .as_ref()
                        .map(super::PageTitle::full),
                    Some("Widget".to_string())
                );
                assert!(matches!(&params.content, ContentSource::Inline { body } if body == "draft body"));
            }
            TaskSpec::Refresh(_) => panic!("expected a create task"),
        }
    }

    #[test]
    fn single_existing_page_says_modified() {
        let mut store = MockStore::default();
        seed_drafts(&mut store);
        store.insert(&PageTitle::published("Widget").expect("title"), "old body");
        let mut queue = MockBackend::default();
        let root = hierarchy(false);

        let result = submit_batch(
            &mut store,
            &mut queue,
            &root,
            &names(&["Widget"]),
            Mode::Publish,
            7,
            &BatchOptions::new("Published"),
        )
        .expect("submit");

        assert_eq!(result.message, "The page Widget will be modified.");
        match &queue.batches[0][0] {
            TaskSpec::Create(params) => assert!(params.parent_target_title.is_none()),
            TaskSpec::Refresh(_) => panic!("expected a create task"),
        }
    }

    #[test]
    fn multiple_pages_go_in_one_enqueue_call() {
        let mut store = MockStore::default();
        seed_drafts(&mut store);
        let mut queue = MockBackend::default();
        let root = hierarchy(false);

        let result = submit_batch(
            &mut store,
            &mut queue,
            &root,
            &names(&["Widget", "Widget/1.0", "Widget/1.0/Guide"]),
            Mode::Publish,
            7,
            &BatchOptions::new("Published"),
        )
        .expect("submit");

        assert_eq!(
            result.message,
            "The following pages will be created or modified: Widget, Widget/1.0, Widget/1.0/Guide."
        );
        assert_eq!(result.queued, 3);
        assert_eq!(queue.batches.len(), 1);
        assert_eq!(queue.batches[0].len(), 3);
    }

    #[test]
    fn oversized_body_is_frozen_into_the_revision_store() {
        let mut store = MockStore::default();
        seed_drafts(&mut store);
        let big_body = "x".repeat(100);
        store.insert(&PageTitle::draft("Widget").expect("title"), &big_body);
        let mut queue = MockBackend::default();
        let root = hierarchy(false);
        let options = BatchOptions {
            edit_summary: "Published".to_string(),
            max_inline_body_bytes: 64,
        };

        submit_batch(
            &mut store,
            &mut queue,
            &root,
            &names(&["Widget"]),
            Mode::Publish,
            7,
            &options,
        )
        .expect("submit");

        assert_eq!(queue.revisions.len(), 1);
        assert_eq!(queue.revisions[0].content, big_body);
        match &queue.batches[0][0] {
            TaskSpec::Create(params) => match &params.content {
                ContentSource::RevisionRef {
                    revision_id,
                    fallback_title,
                } => {
                    assert_eq!(*revision_id, 1);
                    assert_eq!(fallback_title.full(), "Draft:Widget");
                }
                other => panic!("expected a revision reference, got {other:?}"),
            },
            TaskSpec::Refresh(_) => panic!("expected a create task"),
        }
    }

    #[test]
    fn frozen_content_ignores_later_draft_edits() {
        let mut store = MockStore::default();
        seed_drafts(&mut store);
        let mut queue = MockBackend::default();
        let root = hierarchy(false);

        submit_batch(
            &mut store,
            &mut queue,
            &root,
            &names(&["Widget"]),
            Mode::Publish,
            7,
            &BatchOptions::new("Published"),
        )
        .expect("submit");

        // Edit the draft after submission; the queued task keeps the
        // frozen body.
        store.insert(&PageTitle::draft("Widget").expect("title"), "edited later");
        match &queue.batches[0][0] {
            TaskSpec::Create(params) => {
                assert!(matches!(&params.content, ContentSource::Inline { body } if body == "draft body"));
            }
            TaskSpec::Refresh(_) => panic!("expected a create task"),
        }
    }

    #[test]
    fn refresh_skips_borrowed_pages() {
        let mut store = MockStore::default();
        for name in ["Widget", "Widget/1.0/Guide/Install"] {
            store.insert(&PageTitle::published(name).expect("title"), "body");
        }
        let mut queue = MockBackend::default();
        let root = hierarchy(true);

        let result = submit_batch(
            &mut store,
            &mut queue,
            &root,
            &names(&["Widget", "Widget/1.0/Guide/Install"]),
            Mode::Refresh,
            7,
            &BatchOptions::new("Refreshed"),
        )
        .expect("submit");

        assert_eq!(result.queued, 1);
        assert_eq!(
            result.skipped,
            vec!["Widget/1.0/Guide/Install (borrowed page)".to_string()]
        );
        assert_eq!(result.message, "The page Widget will be refreshed.");
    }

    #[test]
    fn refresh_of_many_pages_lists_them() {
        let mut store = MockStore::default();
        for name in ["Widget", "Widget/1.0"] {
            store.insert(&PageTitle::published(name).expect("title"), "body");
        }
        let mut queue = MockBackend::default();
        let root = hierarchy(false);

        let result = submit_batch(
            &mut store,
            &mut queue,
            &root,
            &names(&["Widget", "Widget/1.0"]),
            Mode::Refresh,
            7,
            &BatchOptions::new("Refreshed"),
        )
        .expect("submit");

        assert_eq!(
            result.message,
            "The following pages will be refreshed: Widget, Widget/1.0."
        );
    }

    #[test]
    fn unknown_selection_is_an_error() {
        let mut store = MockStore::default();
        let mut queue = MockBackend::default();
        let root = hierarchy(false);

        let error = submit_batch(
            &mut store,
            &mut queue,
            &root,
            &names(&["Gadget"]),
            Mode::Publish,
            7,
            &BatchOptions::new("Published"),
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("not in the hierarchy"));
    }
}
