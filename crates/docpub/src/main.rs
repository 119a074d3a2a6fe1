use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use docpub_core::batch::{BatchOptions, submit_batch};
use docpub_core::config::{ConfigIdentityProvider, DocpubConfig, load_config};
use docpub_core::diff::{AlwaysOverwrite, plan_pages};
use docpub_core::fsstore::{FileStore, find_page, load_hierarchy, scan_drafts};
use docpub_core::model::{DocPage, Mode, PageStore};
use docpub_core::queue::{SqliteTaskQueue, run_pending_tasks};
use docpub_core::remote::{RemotePageStore, RemoteStoreConfig};
use docpub_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    resolve_paths,
};
use docpub_core::tree::build_tree;

#[derive(Debug, Parser)]
#[command(
    name = "docpub",
    version,
    about = "Publish and refresh a draft documentation hierarchy"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Status,
    Tree(TreeArgs),
    Plan(PlanArgs),
    Publish(SubmitArgs),
    Refresh(SubmitArgs),
    Queue(QueueArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .docpub/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct TreeArgs {
    page: String,
}

#[derive(Debug, Args)]
struct PlanArgs {
    page: String,
    #[arg(long, help = "Plan a refresh instead of a publish")]
    refresh: bool,
    #[arg(long, help = "Diff against the remote site instead of published/")]
    remote: bool,
    #[arg(long, help = "Print the plan as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    page: String,
    #[arg(long = "page", value_name = "NAME", help = "Select a specific page (repeatable)")]
    pages: Vec<String>,
    #[arg(long, help = "Select every actionable page in the plan")]
    all: bool,
    #[arg(long, value_name = "ID", default_value_t = 0, help = "Acting user id")]
    actor: i64,
    #[arg(long, help = "Diff against the remote site instead of published/")]
    remote: bool,
}

#[derive(Debug, Args)]
struct QueueArgs {
    #[command(subcommand)]
    command: QueueSubcommand,
}

#[derive(Debug, Subcommand)]
enum QueueSubcommand {
    Run(QueueRunArgs),
    Stats,
}

#[derive(Debug, Args)]
struct QueueRunArgs {
    #[arg(long, value_name = "N", help = "Run at most N tasks")]
    limit: Option<usize>,
    #[arg(long, help = "Write to the remote site instead of published/")]
    remote: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Tree(args)) => run_tree(&runtime, args),
        Some(Commands::Plan(args)) => run_plan(&runtime, args),
        Some(Commands::Publish(args)) => run_submit(&runtime, args, Mode::Publish),
        Some(Commands::Refresh(args)) => run_submit(&runtime, args, Mode::Refresh),
        Some(Commands::Queue(QueueArgs { command })) => match command {
            QueueSubcommand::Run(args) => run_queue_run(&runtime, args),
            QueueSubcommand::Stats => run_queue_stats(&runtime),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };
    let paths = resolve_paths(&context, &overrides)?;
    if runtime.diagnostics {
        println!("[diagnostics]\n{}\n", paths.diagnostics());
    }
    Ok(paths)
}

fn load_runtime_config(paths: &ResolvedPaths) -> Result<DocpubConfig> {
    load_config(&paths.config_path)
}

fn open_store(
    paths: &ResolvedPaths,
    config: &DocpubConfig,
    remote: bool,
) -> Result<Box<dyn PageStore>> {
    if remote {
        let store = RemotePageStore::new(RemoteStoreConfig::from_config(config))?;
        Ok(Box::new(store))
    } else {
        Ok(Box::new(FileStore::new(paths)))
    }
}

fn load_root(paths: &ResolvedPaths, name: &str) -> Result<Vec<DocPage>> {
    let products = load_hierarchy(paths)?;
    if find_page(&products, name).is_none() {
        bail!("page is not in the hierarchy: {name}");
    }
    Ok(products)
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized docpub project layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("draft_dir: {}", normalize_path(&paths.draft_dir));
    println!("published_dir: {}", normalize_path(&paths.published_dir));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let pages = scan_drafts(&paths)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("draft_exists: {}", status.draft_exists);
    println!("published_exists: {}", status.published_exists);
    println!("db_exists: {}", status.db_exists);
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", status.config_exists);
    println!("draft_pages: {}", pages.len());
    for page in &pages {
        println!("  {} ({} bytes)", page.name, page.bytes);
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    Ok(())
}

fn run_tree(runtime: &RuntimeOptions, args: TreeArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let products = load_root(&paths, &args.page)?;
    let root = find_page(&products, &args.page)
        .ok_or_else(|| anyhow::anyhow!("page is not in the hierarchy: {}", args.page))?;
    let tree = build_tree(root);

    println!("tree for {}", args.page);
    println!("visible_pages: {}", tree.visible_count());
    for line in tree.render_lines() {
        println!("{line}");
    }
    Ok(())
}

fn run_plan(runtime: &RuntimeOptions, args: PlanArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let products = load_root(&paths, &args.page)?;
    let root = find_page(&products, &args.page)
        .ok_or_else(|| anyhow::anyhow!("page is not in the hierarchy: {}", args.page))?;

    let mode = if args.refresh {
        Mode::Refresh
    } else {
        Mode::Publish
    };
    let mut store = open_store(&paths, &config, args.remote)?;
    let plan = plan_pages(store.as_mut(), &AlwaysOverwrite, root, mode)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("{} plan for {}", plan.mode.as_str(), plan.root);
    println!("selections: {}", plan.selections.len());
    println!("actionable: {}", plan.actionable);
    for selection in &plan.selections {
        let marker = if selection.default_checked { "x" } else { " " };
        println!(
            "  [{marker}] {} ({}{})",
            selection.display_label,
            selection.reason.as_str(),
            selection
                .detail
                .as_deref()
                .map(|detail| format!(": {detail}"))
                .unwrap_or_default()
        );
    }
    if !plan.unresolved.is_empty() {
        println!("unresolved:");
        for name in &plan.unresolved {
            println!("  - {name}");
        }
    }
    Ok(())
}

fn run_submit(runtime: &RuntimeOptions, args: SubmitArgs, mode: Mode) -> Result<()> {
    if args.pages.is_empty() && !args.all {
        bail!("nothing selected: pass --page NAME (repeatable) or --all");
    }

    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let products = load_root(&paths, &args.page)?;
    let root = find_page(&products, &args.page)
        .ok_or_else(|| anyhow::anyhow!("page is not in the hierarchy: {}", args.page))?;

    let mut store = open_store(&paths, &config, args.remote)?;
    let selected = if args.all {
        let plan = plan_pages(store.as_mut(), &AlwaysOverwrite, root, mode)?;
        plan.selections
            .into_iter()
            .filter(|selection| selection.default_checked)
            .map(|selection| selection.source_name)
            .collect()
    } else {
        args.pages.clone()
    };

    let mut queue = SqliteTaskQueue::open(&paths.db_path)?;
    let summary = match mode {
        Mode::Publish => config.edit_summary(),
        Mode::Refresh => config.refresh_summary(),
    };
    let options = BatchOptions {
        edit_summary: summary,
        max_inline_body_bytes: config.max_inline_body_bytes(),
    };
    let result = submit_batch(
        store.as_mut(),
        &mut queue,
        root,
        &selected,
        mode,
        args.actor,
        &options,
    )?;

    println!("{}", result.message);
    println!("queued: {}", result.queued);
    for skipped in &result.skipped {
        println!("skipped: {skipped}");
    }
    println!("run `docpub queue run` to execute the batch");
    Ok(())
}

fn run_queue_run(runtime: &RuntimeOptions, args: QueueRunArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let identity = ConfigIdentityProvider::new(&config);
    let mut store = open_store(&paths, &config, args.remote)?;
    let mut queue = SqliteTaskQueue::open(&paths.db_path)?;

    let report = run_pending_tasks(&mut queue, store.as_mut(), &identity, args.limit)?;

    println!("queue run");
    println!("ran: {}", report.ran);
    println!("succeeded: {}", report.succeeded);
    println!("failed: {}", report.failed);
    println!("follow_ups_enqueued: {}", report.follow_ups_enqueued);
    for task in &report.tasks {
        println!(
            "  {} {} {}{}",
            task.kind,
            task.target_title,
            task.status,
            task.detail
                .as_deref()
                .or(task.error.as_deref())
                .map(|text| format!(" ({text})"))
                .unwrap_or_default()
        );
    }
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  - {error}");
        }
    }
    Ok(())
}

fn run_queue_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let queue = SqliteTaskQueue::open(&paths.db_path)?;
    let stats = queue.stats()?;

    println!("queue stats");
    println!("pending: {}", stats.pending);
    println!("succeeded: {}", stats.succeeded);
    println!("failed: {}", stats.failed);
    println!("frozen_revisions: {}", stats.frozen_revisions);
    Ok(())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
