use crate::model::{DocPage, TocNode};

/// One node of the selection tree. A `None` node with children is a
/// collapsed shell level: a topic whose TOC indentation implies ancestors
/// that have no page of their own.
#[derive(Debug)]
pub struct PageTree<'a> {
    pub node: Option<TreeItem<'a>>,
    pub children: Vec<PageTree<'a>>,
}

#[derive(Debug, Clone, Copy)]
pub enum TreeItem<'a> {
    Page(&'a DocPage),
    Unresolved(&'a str),
}

impl<'a> TreeItem<'a> {
    pub fn label(&self) -> &'a str {
        match self {
            Self::Page(page) => &page.title().name,
            Self::Unresolved(name) => name,
        }
    }
}

/// Expand a hierarchy node into the ordered tree mirroring
/// product -> version -> manual -> topic.
pub fn build_tree(page: &DocPage) -> PageTree<'_> {
    build_item(TreeItem::Page(page), 0)
}

fn build_item<'a>(item: TreeItem<'a>, topic_indent_budget: u32) -> PageTree<'a> {
    let page = match item {
        TreeItem::Page(page) => page,
        TreeItem::Unresolved(_) => return build_leafish(item, topic_indent_budget),
    };

    match page {
        DocPage::Product { versions, .. } => PageTree {
            node: Some(item),
            children: versions
                .iter()
                .map(|version| build_item(TreeItem::Page(version), 0))
                .collect(),
        },
        DocPage::Version { manuals, .. } => PageTree {
            node: Some(item),
            children: manuals
                .iter()
                .map(|manual| build_item(TreeItem::Page(manual), 0))
                .collect(),
        },
        DocPage::Manual { toc, .. } => {
            let mut children = Vec::new();
            for entry in toc {
                // Levels are 1-based; a top-level topic gets budget 0.
                let budget = entry.level.saturating_sub(1);
                match &entry.node {
                    TocNode::Topic(topic) => {
                        children.push(build_item(TreeItem::Page(topic), budget));
                    }
                    TocNode::Unresolved(name) => {
                        children.push(build_item(TreeItem::Unresolved(name), budget));
                    }
                }
            }
            PageTree {
                node: Some(item),
                children,
            }
        }
        DocPage::Topic { .. } => build_leafish(item, topic_indent_budget),
    }
}

fn build_leafish<'a>(item: TreeItem<'a>, topic_indent_budget: u32) -> PageTree<'a> {
    if topic_indent_budget > 0 {
        // Manufacture the missing intermediate shell level instead of
        // duplicating the ancestor chain.
        return PageTree {
            node: None,
            children: vec![build_leafish(item, topic_indent_budget - 1)],
        };
    }
    PageTree {
        node: Some(item),
        children: Vec::new(),
    }
}

impl<'a> PageTree<'a> {
    /// Number of nodes carrying an actual entry (shells excluded).
    pub fn visible_count(&self) -> usize {
        let own = usize::from(self.node.is_some());
        own + self
            .children
            .iter()
            .map(PageTree::visible_count)
            .sum::<usize>()
    }

    /// Depth-first listing of non-shell entries, in display order.
    pub fn visible_items(&self) -> Vec<TreeItem<'a>> {
        let mut items = Vec::new();
        self.collect_items(&mut items);
        items
    }

    fn collect_items(&self, items: &mut Vec<TreeItem<'a>>) {
        if let Some(item) = self.node {
            items.push(item);
        }
        for child in &self.children {
            child.collect_items(items);
        }
    }

    /// Indented text rendering used by the CLI tree view. Shell levels
    /// render as a bare `-`.
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        self.render_into(0, &mut lines);
        lines
    }

    fn render_into(&self, depth: usize, lines: &mut Vec<String>) {
        let indent = "  ".repeat(depth);
        match self.node {
            Some(TreeItem::Page(page)) => {
                lines.push(format!("{indent}{} ({})", page.title().name, page.kind_label()));
            }
            Some(TreeItem::Unresolved(name)) => {
                lines.push(format!("{indent}{name} (unresolved)"));
            }
            None => lines.push(format!("{indent}-")),
        }
        for child in &self.children {
            child.render_into(depth + 1, lines);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TreeItem, build_tree};
    use crate::model::{DocPage, PageTitle, TocEntry, TocNode};

    fn topic(name: &str, parent: &str) -> Box<DocPage> {
        Box::new(DocPage::Topic {
            title: PageTitle::draft(name).expect("title"),
            parent: PageTitle::draft(parent).expect("parent"),
            borrowed: false,
        })
    }

    fn manual_with_toc(toc: Vec<TocEntry>) -> DocPage {
        DocPage::Manual {
            title: PageTitle::draft("Widget/1.0/Guide").expect("title"),
            parent: PageTitle::draft("Widget/1.0").expect("parent"),
            toc,
        }
    }

    fn product(manual: DocPage) -> DocPage {
        DocPage::Product {
            title: PageTitle::draft("Widget").expect("title"),
            versions: vec![DocPage::Version {
                title: PageTitle::draft("Widget/1.0").expect("title"),
                parent: PageTitle::draft("Widget").expect("parent"),
                manuals: vec![manual],
            }],
        }
    }

    #[test]
    fn top_level_topic_builds_without_shells() {
        let root = product(manual_with_toc(vec![TocEntry {
            node: TocNode::Topic(topic("Widget/1.0/Guide/Install", "Widget/1.0/Guide")),
            level: 1,
        }]));

        let tree = build_tree(&root);
        // Product -> Version -> Manual -> Topic, each a real node.
        assert_eq!(tree.visible_count(), 4);
        let manual = &tree.children[0].children[0];
        assert!(manual.node.is_some());
        let leaf = &manual.children[0];
        assert!(matches!(leaf.node, Some(TreeItem::Page(_))));
        assert!(leaf.children.is_empty());
    }

    #[test]
    fn over_indented_topic_gets_a_shell_level() {
        let root = product(manual_with_toc(vec![TocEntry {
            node: TocNode::Topic(topic("Widget/1.0/Guide/Install", "Widget/1.0/Guide")),
            level: 2,
        }]));

        let tree = build_tree(&root);
        let manual = &tree.children[0].children[0];
        let shell = &manual.children[0];
        assert!(shell.node.is_none());
        assert_eq!(shell.children.len(), 1);
        assert!(matches!(shell.children[0].node, Some(TreeItem::Page(_))));
        // The shell does not count as a visible page.
        assert_eq!(tree.visible_count(), 4);
    }

    #[test]
    fn visible_count_matches_entries_with_zero_final_budget() {
        let root = product(manual_with_toc(vec![
            TocEntry {
                node: TocNode::Topic(topic("Widget/1.0/Guide/Install", "Widget/1.0/Guide")),
                level: 1,
            },
            TocEntry {
                node: TocNode::Topic(topic("Widget/1.0/Guide/Configure", "Widget/1.0/Guide")),
                level: 3,
            },
            TocEntry {
                node: TocNode::Unresolved("Upgrade notes".to_string()),
                level: 2,
            },
        ]));

        let tree = build_tree(&root);
        // 3 hierarchy pages + 3 TOC entries; shells are not visible.
        assert_eq!(tree.visible_count(), 6);
        let labels = tree
            .visible_items()
            .iter()
            .map(TreeItem::label)
            .map(str::to_string)
            .collect::<Vec<_>>();
        assert!(labels.contains(&"Upgrade notes".to_string()));
        assert!(labels.contains(&"Widget/1.0/Guide/Configure".to_string()));
    }

    #[test]
    fn unresolved_entry_is_indented_like_a_topic() {
        let root = manual_with_toc(vec![TocEntry {
            node: TocNode::Unresolved("Glossary".to_string()),
            level: 2,
        }]);

        let tree = build_tree(&root);
        let shell = &tree.children[0];
        assert!(shell.node.is_none());
        assert!(matches!(
            shell.children[0].node,
            Some(TreeItem::Unresolved("Glossary"))
        ));
    }

    #[test]
    fn render_lines_marks_shells() {
        let root = product(manual_with_toc(vec![TocEntry {
            node: TocNode::Topic(topic("Widget/1.0/Guide/Install", "Widget/1.0/Guide")),
            level: 2,
        }]));
        let lines = build_tree(&root).render_lines();
        assert!(lines.iter().any(|line| line.trim() == "-"));
        assert!(
            lines
                .iter()
                .any(|line| line.contains("Widget/1.0/Guide/Install (topic)"))
        );
    }
}
