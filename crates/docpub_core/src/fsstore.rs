use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::model::{
    Actor, DocPage, Namespace, PageStore, PageTitle, TocEntry, TocNode, WriteAction,
};
use crate::runtime::ResolvedPaths;

/// Page repository backed by the project tree: draft pages under
/// draft/, published pages under published/, one .wiki file per page.
pub struct FileStore {
    draft_dir: PathBuf,
    published_dir: PathBuf,
}

impl FileStore {
    pub fn new(paths: &ResolvedPaths) -> Self {
        Self {
            draft_dir: paths.draft_dir.clone(),
            published_dir: paths.published_dir.clone(),
        }
    }

    fn page_path(&self, title: &PageTitle) -> PathBuf {
        let base = match title.namespace {
            Namespace::Draft => &self.draft_dir,
            Namespace::Published => &self.published_dir,
        };
        base.join(format!("{}.wiki", name_to_filename(&title.name)))
    }
}

impl PageStore for FileStore {
    fn exists(&mut self, title: &PageTitle) -> Result<bool> {
        Ok(self.page_path(title).is_file())
    }

    fn read(&mut self, title: &PageTitle) -> Result<Option<String>> {
        let path = self.page_path(title);
        if !path.is_file() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(content))
    }

    fn create_or_modify(
        &mut self,
        title: &PageTitle,
        body: &str,
        _summary: &str,
        _actor: &Actor,
    ) -> Result<WriteAction> {
        let path = self.page_path(title);
        let action = if path.is_file() {
            WriteAction::Modified
        } else {
            WriteAction::Created
        };
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(action)
    }
}

pub fn name_to_filename(name: &str) -> String {
    name.replace(' ', "_").replace('/', "___").replace(':', "--")
}

pub fn filename_to_name(value: &str) -> String {
    value
        .replace("___", "/")
        .replace("--", ":")
        .replace('_', " ")
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannedPage {
    pub name: String,
    pub relative_path: String,
    pub content_hash: String,
    pub bytes: u64,
}

/// List the draft pages on disk, sorted by name.
pub fn scan_drafts(paths: &ResolvedPaths) -> Result<Vec<ScannedPage>> {
    let mut pages = Vec::new();
    if !paths.draft_dir.exists() {
        return Ok(pages);
    }
    for entry in WalkDir::new(&paths.draft_dir).follow_links(false) {
        let entry =
            entry.with_context(|| format!("failed to walk {}", paths.draft_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("wiki") {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("");
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let relative = path
            .strip_prefix(&paths.project_root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        pages.push(ScannedPage {
            name: filename_to_name(stem),
            relative_path: relative,
            content_hash: compute_hash(&content),
            bytes: content.len() as u64,
        });
    }
    pages.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(pages)
}

fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub const DOCMAP_FILENAME: &str = "docmap.toml";

#[derive(Debug, Deserialize)]
struct DocMap {
    #[serde(default)]
    products: Vec<ProductSpec>,
}

#[derive(Debug, Deserialize)]
struct ProductSpec {
    name: String,
    #[serde(default)]
    versions: Vec<VersionSpec>,
}

#[derive(Debug, Deserialize)]
struct VersionSpec {
    name: String,
    #[serde(default)]
    manuals: Vec<ManualSpec>,
}

#[derive(Debug, Deserialize)]
struct ManualSpec {
    name: String,
    #[serde(default)]
    topics: Vec<TopicSpec>,
}

#[derive(Debug, Deserialize)]
struct TopicSpec {
    /// Bare topic name, or a full slash-separated page name when the
    /// entry points at a topic owned by another manual.
    name: String,
    #[serde(default = "default_level")]
    level: u32,
}

fn default_level() -> u32 {
    1
}

impl TopicSpec {
    fn full_name(&self, manual_name: &str) -> String {
        if self.name.contains('/') {
            self.name.clone()
        } else {
            format!("{manual_name}/{}", self.name)
        }
    }
}

/// Load the documentation hierarchy declared in draft/docmap.toml.
/// Topics referenced from more than one TOC are marked borrowed; TOC
/// names with no draft file behind them become unresolved entries.
pub fn load_hierarchy(paths: &ResolvedPaths) -> Result<Vec<DocPage>> {
    let docmap_path = paths.draft_dir.join(DOCMAP_FILENAME);
    let raw = fs::read_to_string(&docmap_path)
        .with_context(|| format!("failed to read {}", docmap_path.display()))?;
    let docmap: DocMap = toml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", docmap_path.display()))?;

    let reference_counts = topic_reference_counts(&docmap);
    let mut store = FileStore::new(paths);
    let mut products = Vec::new();

    for product in &docmap.products {
        let product_title = PageTitle::draft(&product.name)?;
        let mut versions = Vec::new();
        for version in &product.versions {
            let version_name = format!("{}/{}", product.name, version.name);
            let version_title = PageTitle::draft(&version_name)?;
            let mut manuals = Vec::new();
            for manual in &version.manuals {
                let manual_name = format!("{version_name}/{}", manual.name);
                let manual_title = PageTitle::draft(&manual_name)?;
                let mut toc = Vec::new();
                for topic in &manual.topics {
                    if topic.level == 0 {
                        bail!(
                            "topic levels are 1-based: {} in manual {manual_name}",
                            topic.name
                        );
                    }
                    let full_name = topic.full_name(&manual_name);
                    let topic_title = PageTitle::draft(&full_name)?;
                    let node = if store.exists(&topic_title)? {
                        let borrowed = reference_counts
                            .get(&full_name)
                            .is_some_and(|count| *count > 1);
                        TocNode::Topic(Box::new(DocPage::Topic {
                            title: topic_title,
                            parent: manual_title.clone(),
                            borrowed,
                        }))
                    } else {
                        TocNode::Unresolved(full_name)
                    };
                    toc.push(TocEntry {
                        node,
                        level: topic.level,
                    });
                }
                manuals.push(DocPage::Manual {
                    title: manual_title,
                    parent: version_title.clone(),
                    toc,
                });
            }
            versions.push(DocPage::Version {
                title: version_title,
                parent: product_title.clone(),
                manuals,
            });
        }
        products.push(DocPage::Product {
            title: product_title,
            versions,
        });
    }

    Ok(products)
}

/// Find the named page across all products of the hierarchy.
pub fn find_page<'a>(products: &'a [DocPage], name: &str) -> Option<&'a DocPage> {
    products.iter().find_map(|product| product.find(name))
}

fn topic_reference_counts(docmap: &DocMap) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for product in &docmap.products {
        for version in &product.versions {
            for manual in &version.manuals {
                let manual_name =
                    format!("{}/{}/{}", product.name, version.name, manual.name);
                for topic in &manual.topics {
                    *counts.entry(topic.full_name(&manual_name)).or_insert(0) += 1;
                }
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{FileStore, filename_to_name, find_page, load_hierarchy, name_to_filename, scan_drafts};
    use crate::model::{Actor, DocPage, PageStore, PageTitle, TocNode, WriteAction};
    use crate::runtime::{InitOptions, PathOverrides, ResolutionContext, init_layout, resolve_paths};

    fn test_paths(root: &std::path::Path) -> crate::runtime::ResolvedPaths {
        let context = ResolutionContext {
            cwd: root.to_path_buf(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            project_root: Some(root.to_path_buf()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths(&context, &overrides).expect("resolve");
        init_layout(
            &paths,
            &InitOptions {
                materialize_config: false,
                ..InitOptions::default()
            },
        )
        .expect("init");
        paths
    }

    fn write_draft(paths: &crate::runtime::ResolvedPaths, name: &str, body: &str) {
        let filename = format!("{}.wiki", name_to_filename(name));
        fs::write(paths.draft_dir.join(filename), body).expect("write draft");
    }

    fn actor() -> Actor {
        Actor {
            id: 7,
            name: "Publisher".to_string(),
        }
    }

    #[test]
    fn filename_encoding_round_trips() {
        for name in ["Widget/1.0/User Guide", "Widget:Special", "Plain"] {
            assert_eq!(filename_to_name(&name_to_filename(name)), name);
        }
    }

    #[test]
    fn store_reads_and_writes_both_namespaces() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());
        let mut store = FileStore::new(&paths);

        let draft = PageTitle::draft("Widget/1.0").expect("title");
        let published = PageTitle::published("Widget/1.0").expect("title");
        assert!(!store.exists(&draft).expect("exists"));

        let action = store
            .create_or_modify(&draft, "draft body", "summary", &actor())
            .expect("write");
        assert_eq!(action, WriteAction::Created);
        assert!(store.exists(&draft).expect("exists"));
        assert!(!store.exists(&published).expect("exists"));
        assert_eq!(
            store.read(&draft).expect("read").as_deref(),
            Some("draft body")
        );

        let action = store
            .create_or_modify(&draft, "updated", "summary", &actor())
            .expect("rewrite");
        assert_eq!(action, WriteAction::Modified);
    }

    #[test]
    fn scan_lists_draft_pages_sorted() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());
        write_draft(&paths, "Widget/1.0", "b");
        write_draft(&paths, "Widget", "a");

        let pages = scan_drafts(&paths).expect("scan");
        let names: Vec<&str> = pages.iter().map(|page| page.name.as_str()).collect();
        assert_eq!(names, vec!["Widget", "Widget/1.0"]);
        assert_eq!(pages[0].bytes, 1);
    }

    const DOCMAP: &str = r#"
[[products]]
name = "Widget"

[[products.versions]]
name = "1.0"

[[products.versions.manuals]]
name = "Guide"

[[products.versions.manuals.topics]]
name = "Install"

[[products.versions.manuals.topics]]
name = "Configure"
level = 2

[[products.versions.manuals]]
name = "Reference"

[[products.versions.manuals.topics]]
name = "Widget/1.0/Guide/Install"
"#;

    fn seed_project(root: &std::path::Path) -> crate::runtime::ResolvedPaths {
        let paths = test_paths(root);
        fs::write(paths.draft_dir.join("docmap.toml"), DOCMAP).expect("write docmap");
        for name in [
            "Widget",
            "Widget/1.0",
            "Widget/1.0/Guide",
            "Widget/1.0/Guide/Install",
            "Widget/1.0/Reference",
        ] {
            write_draft(&paths, name, "body");
        }
        paths
    }

    #[test]
    fn hierarchy_resolves_topics_and_marks_missing_ones_unresolved() {
        let temp = tempdir().expect("tempdir");
        let paths = seed_project(temp.path());

        let products = load_hierarchy(&paths).expect("load");
        assert_eq!(products.len(), 1);

        let guide = find_page(&products, "Widget/1.0/Guide").expect("manual");
        let DocPage::Manual { toc, .. } = guide else {
            panic!("expected a manual");
        };
        assert_eq!(toc.len(), 2);
        assert!(matches!(&toc[0].node, TocNode::Topic(_)));
        assert_eq!(toc[1].level, 2);
        // Configure has no draft file.
        assert!(
            matches!(&toc[1].node, TocNode::Unresolved(name) if name == "Widget/1.0/Guide/Configure")
        );
    }

    #[test]
    fn doubly_referenced_topic_is_borrowed() {
        let temp = tempdir().expect("tempdir");
        let paths = seed_project(temp.path());

        let products = load_hierarchy(&paths).expect("load");
        let reference = find_page(&products, "Widget/1.0/Reference").expect("manual");
        let DocPage::Manual { toc, .. } = reference else {
            panic!("expected a manual");
        };
        let TocNode::Topic(topic) = &toc[0].node else {
            panic!("expected a resolved topic");
        };
        assert!(topic.is_borrowed());
        // The same topic is borrowed from the owning manual's view too.
        let guide_topic = find_page(&products, "Widget/1.0/Guide/Install").expect("topic");
        assert!(guide_topic.is_borrowed());
    }

    #[test]
    fn zero_level_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());
        fs::write(
            paths.draft_dir.join("docmap.toml"),
            r#"
[[products]]
name = "Widget"

[[products.versions]]
name = "1.0"

[[products.versions.manuals]]
name = "Guide"

[[products.versions.manuals.topics]]
name = "Install"
level = 0
"#,
        )
        .expect("write docmap");

        let error = load_hierarchy(&paths).expect_err("must fail");
        assert!(error.to_string().contains("1-based"));
    }
}
