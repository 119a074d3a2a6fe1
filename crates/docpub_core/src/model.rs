use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// The two locations a publish operation copies between. Draft pages carry
/// the `Draft:` prefix; published pages live in the main namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Draft,
    Published,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::Published => "Main",
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Draft => "Draft:",
            Self::Published => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageTitle {
    pub namespace: Namespace,
    pub name: String,
}

impl PageTitle {
    pub fn new(namespace: Namespace, name: &str) -> Result<Self> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            bail!("page name must be set");
        }
        if trimmed.contains('#') || trimmed.contains('|') {
            bail!("malformed page name: {trimmed}");
        }
        Ok(Self {
            namespace,
            name: trimmed.to_string(),
        })
    }

    pub fn draft(name: &str) -> Result<Self> {
        Self::new(Namespace::Draft, name)
    }

    pub fn published(name: &str) -> Result<Self> {
        Self::new(Namespace::Published, name)
    }

    /// Full title string including the namespace prefix.
    pub fn full(&self) -> String {
        format!("{}{}", self.namespace.prefix(), self.name)
    }

    /// Same page name re-targeted into another namespace.
    pub fn in_namespace(&self, namespace: Namespace) -> Self {
        Self {
            namespace,
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for PageTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.namespace.prefix(), self.name)
    }
}

/// Whether a batch copies draft pages into the published location or
/// re-saves already published pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Publish,
    Refresh,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Refresh => "refresh",
        }
    }
}

/// One table-of-contents row of a manual. Levels are 1-based: a top-level
/// topic has level 1.
#[derive(Debug, Clone)]
pub struct TocEntry {
    pub node: TocNode,
    pub level: u32,
}

#[derive(Debug, Clone)]
pub enum TocNode {
    Topic(Box<DocPage>),
    /// A TOC name with no resolvable page behind it. Carried through the
    /// tree for display, never selectable.
    Unresolved(String),
}

/// The documentation hierarchy, resolved once per request. Products own
/// versions, versions own manuals, manuals own an ordered TOC. A borrowed
/// topic is referenced from more than one TOC without being a distinct
/// content copy.
#[derive(Debug, Clone)]
pub enum DocPage {
    Product {
        title: PageTitle,
        versions: Vec<DocPage>,
    },
    Version {
        title: PageTitle,
        parent: PageTitle,
        manuals: Vec<DocPage>,
    },
    Manual {
        title: PageTitle,
        parent: PageTitle,
        toc: Vec<TocEntry>,
    },
    Topic {
        title: PageTitle,
        parent: PageTitle,
        borrowed: bool,
    },
}

impl DocPage {
    pub fn title(&self) -> &PageTitle {
        match self {
            Self::Product { title, .. }
            | Self::Version { title, .. }
            | Self::Manual { title, .. }
            | Self::Topic { title, .. } => title,
        }
    }

    /// Parent lookup; `None` only for the Product root level.
    pub fn parent_title(&self) -> Option<&PageTitle> {
        match self {
            Self::Product { .. } => None,
            Self::Version { parent, .. }
            | Self::Manual { parent, .. }
            | Self::Topic { parent, .. } => Some(parent),
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Product { .. } => "product",
            Self::Version { .. } => "version",
            Self::Manual { .. } => "manual",
            Self::Topic { .. } => "topic",
        }
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, Self::Topic { borrowed: true, .. })
    }

    /// Find a page by bare name anywhere in this subtree.
    pub fn find(&self, name: &str) -> Option<&DocPage> {
        if self.title().name == name {
            return Some(self);
        }
        let children: &[DocPage] = match self {
            Self::Product { versions, .. } => versions,
            Self::Version { manuals, .. } => manuals,
            Self::Manual { toc, .. } => {
                for entry in toc {
                    if let TocNode::Topic(topic) = &entry.node
                        && let Some(found) = topic.find(name)
                    {
                        return Some(found);
                    }
                }
                return None;
            }
            Self::Topic { .. } => return None,
        };
        children.iter().find_map(|child| child.find(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: i64,
    pub name: String,
}

/// Outcome of a create-or-modify write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    Created,
    Modified,
}

impl WriteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
        }
    }
}

/// The content repository the pipeline reads from and writes to. Writes
/// have create-or-modify semantics; per-page atomicity is the store's
/// responsibility.
pub trait PageStore {
    fn exists(&mut self, title: &PageTitle) -> Result<bool>;
    fn read(&mut self, title: &PageTitle) -> Result<Option<String>>;
    fn create_or_modify(
        &mut self,
        title: &PageTitle,
        body: &str,
        summary: &str,
        actor: &Actor,
    ) -> Result<WriteAction>;
}

/// Resolves the acting user for write attribution.
pub trait IdentityProvider {
    fn actor_by_id(&self, id: i64) -> Result<Actor>;
}

/// A frozen copy of draft content, durably stored when a body is too
/// large to travel inline through task parameters.
#[derive(Debug, Clone, Serialize)]
pub struct FrozenRevision {
    pub id: i64,
    pub target_title: String,
    pub content: String,
}

pub trait RevisionStore {
    fn store_revision(&mut self, target_title: &str, content: &str) -> Result<i64>;
    fn revision_by_id(&mut self, id: i64) -> Result<Option<FrozenRevision>>;
}
