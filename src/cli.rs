use crate::{
    app::{App, DeployRequest},
    backup, config,
    deploy::{DeployOutcome, DeploymentResult},
    error::PathFailure,
    library::{self, Library, ModEntry, ModRepository, Profile},
    logging::{self, Verbosity},
    manifest::LinkKind,
    ownership::DriftReport,
    task::{CancelToken, TaskHandle, TaskMessage},
    undeploy::UndeployResult,
};
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

struct GlobalOptions {
    format: OutputFormat,
    profile: Option<String>,
    verbosity: Verbosity,
}

struct CliAction {
    command: CliCommand,
    global: GlobalOptions,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    ModsList,
    ModsAdd { name: String, path: PathBuf },
    ModsRemove(String),
    ModsSearch(String),
    ModsSet { key: String, field: String, value: String },
    ProfilesList,
    ProfilesCreate(String),
    ProfilesRename { from: String, to: String },
    ProfilesDelete(String),
    ProfilesUse(String),
    Enable(String),
    Disable(String),
    Move { key: String, to: MoveTarget },
    Conflicts,
    Deploy(DeployArgs),
    Undeploy,
    Status,
    ConfigShow,
    ConfigSet { key: String, value: String },
    Unlock,
    Help,
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveTarget {
    Up,
    Down,
    Position(usize),
}

#[derive(Debug, Default, PartialEq, Eq)]
struct DeployArgs {
    mode: Option<LinkKind>,
    no_backup: bool,
    abort_on_error: bool,
}

impl DeployArgs {
    fn request(&self) -> DeployRequest {
        DeployRequest {
            mode: self.mode,
            backup: self.no_backup.then_some(false),
            abort_on_first_error: self.abort_on_error.then_some(true),
        }
    }
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let action = parse_args(&args)?;
    match action.command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("stagehand v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let data_dir = config::base_data_dir()?;
            logging::init(&data_dir, action.global.verbosity)?;
            let mut app = App::initialize_in(&data_dir)?;
            run_command(&mut app, command, &action.global)
        }
    }
}

fn parse_args(args: &[String]) -> Result<CliAction> {
    let (global, tokens) = parse_global_options(args);
    let command = parse_subcommand(&tokens)?;
    Ok(CliAction { command, global })
}

fn parse_global_options(args: &[String]) -> (GlobalOptions, Vec<String>) {
    let mut format = OutputFormat::Text;
    let mut profile = None;
    let mut verbosity = Verbosity::Normal;
    let mut tokens = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            if let Some(parsed) = OutputFormat::parse(value) {
                format = parsed;
            }
            continue;
        }
        if arg == "--format" {
            if let Some(value) = iter.next() {
                if let Some(parsed) = OutputFormat::parse(value) {
                    format = parsed;
                }
            }
            continue;
        }
        if let Some(value) = arg.strip_prefix("--profile=") {
            profile = Some(value.to_string());
            continue;
        }
        if arg == "--profile" {
            if let Some(value) = iter.next() {
                profile = Some(value.to_string());
            }
            continue;
        }
        match arg.as_str() {
            "-q" | "--quiet" => verbosity = Verbosity::Quiet,
            "-v" | "--verbose" => verbosity = Verbosity::Verbose,
            _ => tokens.push(arg.to_string()),
        }
    }

    (
        GlobalOptions {
            format,
            profile,
            verbosity,
        },
        tokens,
    )
}

fn parse_subcommand(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let arg = |index: usize, what: &str| -> Result<String> {
        tokens
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("{head} requires {what}"))
    };
    let sub = tokens.get(1).map(|value| value.as_str());

    let command = match head.as_str() {
        "mods" => match sub.unwrap_or("list") {
            "list" => CliCommand::ModsList,
            "add" => CliCommand::ModsAdd {
                name: arg(2, "a name")?,
                path: PathBuf::from(arg(3, "a path")?),
            },
            "remove" => CliCommand::ModsRemove(arg(2, "a mod id or name")?),
            "search" => CliCommand::ModsSearch(arg(2, "a query")?),
            "set" => CliCommand::ModsSet {
                key: arg(2, "a mod id or name")?,
                field: arg(3, "a field")?,
                value: arg(4, "a value")?,
            },
            other => bail!(
                "Unknown mods command: {other} (use 'list', 'add', 'remove', 'search', or 'set')"
            ),
        },
        "profiles" => match sub.unwrap_or("list") {
            "list" => CliCommand::ProfilesList,
            "create" => CliCommand::ProfilesCreate(arg(2, "a profile name")?),
            "rename" => CliCommand::ProfilesRename {
                from: arg(2, "the current name")?,
                to: arg(3, "the new name")?,
            },
            "delete" => CliCommand::ProfilesDelete(arg(2, "a profile name")?),
            "use" => CliCommand::ProfilesUse(arg(2, "a profile name")?),
            other => bail!(
                "Unknown profiles command: {other} (use 'list', 'create', 'rename', 'delete', or 'use')"
            ),
        },
        "enable" => CliCommand::Enable(arg(1, "a mod id or name")?),
        "disable" => CliCommand::Disable(arg(1, "a mod id or name")?),
        "move" => CliCommand::Move {
            key: arg(1, "a mod id or name")?,
            to: parse_move_target(&arg(2, "up, down, or a position")?)?,
        },
        "conflicts" => CliCommand::Conflicts,
        "deploy" => CliCommand::Deploy(parse_deploy_args(&tokens[1..])?),
        "undeploy" => CliCommand::Undeploy,
        "status" => CliCommand::Status,
        "config" => match sub.unwrap_or("show") {
            "show" => CliCommand::ConfigShow,
            "set" => CliCommand::ConfigSet {
                key: arg(2, "a key")?,
                value: arg(3, "a value")?,
            },
            other => bail!("Unknown config command: {other} (use 'show' or 'set')"),
        },
        "unlock" => CliCommand::Unlock,
        "help" | "--help" | "-h" => CliCommand::Help,
        "version" | "--version" | "-V" => CliCommand::Version,
        other => bail!("Unknown command: {other} (see 'stagehand help')"),
    };
    Ok(command)
}

fn parse_move_target(value: &str) -> Result<MoveTarget> {
    match value {
        "up" => Ok(MoveTarget::Up),
        "down" => Ok(MoveTarget::Down),
        other => match other.parse::<usize>() {
            Ok(position) if position > 0 => Ok(MoveTarget::Position(position)),
            _ => bail!("Invalid move target: {other} (use up, down, or a position from 1)"),
        },
    }
}

fn parse_deploy_args(args: &[String]) -> Result<DeployArgs> {
    let mut parsed = DeployArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--mode" => {
                let Some(value) = iter.next() else {
                    bail!("--mode requires a value");
                };
                parsed.mode = Some(parse_mode(value)?);
            }
            value if value.starts_with("--mode=") => {
                parsed.mode = Some(parse_mode(value.trim_start_matches("--mode="))?);
            }
            "--no-backup" => parsed.no_backup = true,
            "--abort-on-error" => parsed.abort_on_error = true,
            other => bail!("Unknown deploy option: {other}"),
        }
    }
    Ok(parsed)
}

fn parse_mode(value: &str) -> Result<LinkKind> {
    LinkKind::parse(value).ok_or_else(|| anyhow!("Unknown mode: {value} (use symlink or copy)"))
}

fn run_command(app: &mut App, command: CliCommand, global: &GlobalOptions) -> Result<()> {
    let format = global.format;
    let profile = global.profile.as_deref();
    match command {
        CliCommand::ModsList => list_mods(&app.library, app.profile(profile)?, format),
        CliCommand::ModsAdd { name, path } => {
            let entry = app.add_mod(&name, &path)?;
            print_mod_change("Added", &entry, format)
        }
        CliCommand::ModsRemove(key) => {
            let entry = app.remove_mod(&key)?;
            print_mod_change("Removed", &entry, format)
        }
        CliCommand::ModsSearch(query) => search_mods(&app.library, &query, format),
        CliCommand::ModsSet { key, field, value } => {
            let mut entry = find_mod(&app.library, &key)?.clone();
            set_mod_field(&mut entry, &field, &value)?;
            app.library.update_mod(entry.clone())?;
            app.save()?;
            print_mod_change("Updated", &entry, format)
        }
        CliCommand::ProfilesList => list_profiles(&app.library, format),
        CliCommand::ProfilesCreate(name) => {
            app.library.create_profile(&name)?;
            app.save()?;
            println!("Created profile {name}");
            Ok(())
        }
        CliCommand::ProfilesRename { from, to } => {
            app.rename_profile(&from, &to)?;
            println!("Renamed profile {from} to {to}");
            Ok(())
        }
        CliCommand::ProfilesDelete(name) => {
            app.delete_profile(&name)?;
            println!("Deleted profile {name}");
            Ok(())
        }
        CliCommand::ProfilesUse(name) => {
            app.set_active_profile(&name)?;
            println!("Active profile: {name}");
            Ok(())
        }
        CliCommand::Enable(key) => set_enabled(app, profile, &key, true),
        CliCommand::Disable(key) => set_enabled(app, profile, &key, false),
        CliCommand::Move { key, to } => move_mod(app, profile, &key, to),
        CliCommand::Conflicts => show_conflicts(app, profile, format),
        CliCommand::Deploy(args) => {
            let handle = app.start_deploy(profile, &args.request(), CancelToken::new())?;
            let result = wait_for(handle, format)?;
            print_deploy(&result, format)
        }
        CliCommand::Undeploy => {
            let handle = app.start_undeploy(CancelToken::new())?;
            let result = wait_for(handle, format)?;
            print_undeploy(&result, format)
        }
        CliCommand::Status => show_status(app, format),
        CliCommand::ConfigShow => show_config(app, format),
        CliCommand::ConfigSet { key, value } => {
            if key == "active_profile" {
                app.set_active_profile(&value)?;
            } else {
                app.config.set(&key, &value)?;
                app.save()?;
            }
            println!("{key} = {value}");
            Ok(())
        }
        CliCommand::Unlock => {
            if app.unlock()? {
                println!("Removed lock for {}", app.target_root()?.display());
            } else {
                println!("No lock held for {}", app.target_root()?.display());
            }
            Ok(())
        }
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

/// Polls the worker until it reports, mentioning it once if it runs long.
fn wait_for<T>(handle: TaskHandle<T>, format: OutputFormat) -> Result<T> {
    let started = Instant::now();
    let mut announced = false;
    loop {
        if let Some(message) = handle.try_poll() {
            return match message {
                TaskMessage::Completed(value) => Ok(value),
                TaskMessage::Failed(error) => Err(anyhow!("{} failed: {error}", handle.label())),
            };
        }
        if !announced && format == OutputFormat::Text && started.elapsed() > Duration::from_secs(2)
        {
            eprintln!("{}: still working...", handle.label());
            announced = true;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn find_mod<'a>(library: &'a Library, key: &str) -> Result<&'a ModEntry> {
    library
        .find_mod(key)
        .ok_or_else(|| anyhow!("Unknown mod: {key}"))
}

fn set_mod_field(entry: &mut ModEntry, field: &str, value: &str) -> Result<()> {
    let optional = |value: &str| {
        let value = value.trim();
        (!value.is_empty() && value != "-").then(|| value.to_string())
    };
    match field {
        "version" => entry.version = optional(value),
        "author" => entry.author = optional(value),
        "description" => entry.description = optional(value),
        "tags" => {
            entry.tags = value
                .split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect();
        }
        _ => bail!("Unknown mod field: {field} (use version, author, description, or tags)"),
    }
    Ok(())
}

fn set_enabled(app: &mut App, profile: Option<&str>, key: &str, enabled: bool) -> Result<()> {
    let entry = find_mod(&app.library, key)?.clone();
    let target = app.profile_mut(profile)?;
    target.set_enabled(&entry.id, enabled);
    let profile_name = target.name.clone();
    app.save()?;
    let state = if enabled { "Enabled" } else { "Disabled" };
    println!("{state} {} in {profile_name}", entry.name);
    Ok(())
}

fn move_mod(app: &mut App, profile: Option<&str>, key: &str, to: MoveTarget) -> Result<()> {
    let entry = find_mod(&app.library, key)?.clone();
    let target = app.profile_mut(profile)?;
    let index = target
        .position(&entry.id)
        .with_context(|| format!("{} is not in profile {}", entry.name, target.name))?;
    match to {
        MoveTarget::Up => target.move_up(index),
        MoveTarget::Down => target.move_down(index),
        MoveTarget::Position(position) => target.move_to(index, position - 1),
    }
    let now = target.position(&entry.id).map(|index| index + 1).unwrap_or(0);
    app.save()?;
    println!("{} is now at position {now}", entry.name);
    Ok(())
}

#[derive(Serialize)]
struct ModListItem {
    id: String,
    name: String,
    root: String,
    staged: bool,
    version: Option<String>,
    author: Option<String>,
    tags: Vec<String>,
    added_at: i64,
    enabled: bool,
    order: Option<usize>,
}

fn list_mods(library: &Library, profile: &Profile, format: OutputFormat) -> Result<()> {
    let mut order_map = BTreeMap::new();
    for (index, entry) in profile.order.iter().enumerate() {
        order_map.entry(entry.id.clone()).or_insert((index + 1, entry.enabled));
    }

    let mut items: Vec<ModListItem> = library
        .mods
        .iter()
        .map(|mod_entry| {
            let order = order_map.get(&mod_entry.id).copied();
            ModListItem {
                id: mod_entry.id.clone(),
                name: mod_entry.name.clone(),
                root: mod_entry.root.display().to_string(),
                staged: mod_entry.is_staged(),
                version: mod_entry.version.clone(),
                author: mod_entry.author.clone(),
                tags: mod_entry.tags.clone(),
                added_at: mod_entry.added_at,
                enabled: order.is_some_and(|(_, enabled)| enabled),
                order: order.map(|(position, _)| position),
            }
        })
        .collect();
    items.sort_by_key(|item| item.order.unwrap_or(usize::MAX));
    let dangling = library::dangling_ids(library, profile);

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            if items.is_empty() {
                println!("No mods registered.");
            }
            for item in items {
                let order = item
                    .order
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let enabled = if item.enabled { "x" } else { " " };
                let added = format_date(item.added_at);
                let missing = if item.staged { "" } else { "  (folder missing)" };
                println!("{order:>3} [{enabled}] {added} {}{missing}", item.name);
            }
            let mut dangling: Vec<String> = dangling.into_iter().collect();
            dangling.sort();
            for id in dangling {
                println!("  ? [ ] {id} (not in library)");
            }
        }
    }
    Ok(())
}

fn search_mods(library: &Library, query: &str, format: OutputFormat) -> Result<()> {
    let hits = library.search(query);
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
        OutputFormat::Text => {
            if hits.is_empty() {
                println!("No mods match {query:?}.");
            }
            for entry in hits {
                let author = entry.author.as_deref().unwrap_or("-");
                println!("{}  {}  by {author}", entry.id, entry.name);
            }
        }
    }
    Ok(())
}

fn print_mod_change(verb: &str, entry: &ModEntry, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entry)?),
        OutputFormat::Text => println!("{verb} {} ({})", entry.name, entry.id),
    }
    Ok(())
}

#[derive(Serialize)]
struct ProfileListItem {
    name: String,
    active: bool,
    enabled: usize,
}

fn list_profiles(library: &Library, format: OutputFormat) -> Result<()> {
    let items: Vec<ProfileListItem> = library
        .profiles
        .iter()
        .map(|profile| ProfileListItem {
            name: profile.name.clone(),
            active: profile.name == library.active_profile,
            enabled: profile.enabled_ids().len(),
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            for item in items {
                let marker = if item.active { "*" } else { " " };
                println!("{marker} {} ({} enabled)", item.name, item.enabled);
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ConflictItem {
    path: String,
    winner: String,
    overridden: Vec<String>,
}

#[derive(Serialize)]
struct ConflictReport {
    profile: String,
    files: usize,
    conflicts: Vec<ConflictItem>,
    overridden_counts: BTreeMap<String, usize>,
    missing_mods: Vec<String>,
    index_errors: Vec<(String, String)>,
}

fn show_conflicts(app: &App, profile: Option<&str>, format: OutputFormat) -> Result<()> {
    let profile = app.profile(profile)?;
    let resolution = app.engine().resolve(profile);
    let names = app.library.index_by_id();
    let name_of = |id: &str| {
        names
            .get(id)
            .map(|entry| entry.name.clone())
            .unwrap_or_else(|| id.to_string())
    };

    let report = ConflictReport {
        profile: profile.name.clone(),
        files: resolution.winning_paths.len(),
        conflicts: resolution
            .conflicts
            .iter()
            .map(|conflict| ConflictItem {
                path: conflict.path.clone(),
                winner: name_of(&conflict.winner),
                overridden: conflict
                    .contenders
                    .iter()
                    .filter(|id| **id != conflict.winner)
                    .map(|id| name_of(id))
                    .collect(),
            })
            .collect(),
        overridden_counts: resolution
            .overridden_counts()
            .into_iter()
            .map(|(id, count)| (name_of(&id), count))
            .collect(),
        missing_mods: resolution.missing_mods.clone(),
        index_errors: resolution
            .index_errors
            .iter()
            .map(|(id, error)| (name_of(id), error.clone()))
            .collect(),
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            for (name, error) in &report.index_errors {
                println!("Warning: {name} contributes no files: {error}");
            }
            for id in &report.missing_mods {
                println!("Warning: profile references unknown mod {id}");
            }
            if !resolution.has_conflicts() {
                println!("No conflicts in {} ({} files).", report.profile, report.files);
                return Ok(());
            }
            for item in &report.conflicts {
                println!("{}", item.path);
                println!("  winner: {}", item.winner);
                println!("  overrides: {}", item.overridden.join(", "));
            }
            println!();
            for (name, count) in &report.overridden_counts {
                println!("{name}: {count} file(s) overridden");
            }
            println!(
                "{} conflict(s) across {} files in {}",
                report.conflicts.len(),
                report.files,
                report.profile
            );
        }
    }
    Ok(())
}

fn print_deploy(result: &DeploymentResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => {
            println!(
                "Deploy {}: {} created, {} removed, {} unchanged",
                result.outcome.label(),
                result.created,
                result.removed,
                result.unchanged
            );
            if result.fallbacks > 0 {
                println!("{} file(s) copied because symlinks failed", result.fallbacks);
            }
            print_failures(&result.failures);
            print_drift(&result.drift);
        }
    }
    match result.outcome {
        DeployOutcome::RolledBack => bail!("deploy rolled back after an error"),
        _ if !result.failures.is_empty() => {
            bail!("deploy finished with {} failure(s)", result.failures.len())
        }
        _ => Ok(()),
    }
}

fn print_undeploy(result: &UndeployResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => {
            println!(
                "Undeploy: {} removed, {} still recorded",
                result.removed, result.remaining
            );
            if result.cancelled {
                println!("Cancelled before all files were processed.");
            }
            print_failures(&result.failures);
            print_drift(&result.drift);
        }
    }
    if !result.failures.is_empty() {
        bail!("undeploy finished with {} failure(s)", result.failures.len());
    }
    Ok(())
}

fn print_failures(failures: &[PathFailure]) {
    if failures.is_empty() {
        return;
    }
    println!("Failures:");
    for failure in failures {
        println!("  {failure}");
    }
}

fn print_drift(drift: &[DriftReport]) {
    if drift.is_empty() {
        return;
    }
    println!("Changed outside stagehand:");
    for report in drift {
        println!("  {} ({})", report.path, report.kind.label());
    }
}

#[derive(Serialize)]
struct StatusReport {
    target: String,
    locked: bool,
    profile: Option<String>,
    mode: Option<LinkKind>,
    deployed_at: Option<String>,
    files: usize,
    directories: usize,
    owned: usize,
    drift: Vec<DriftReport>,
    failures: Vec<PathFailure>,
    mods: usize,
    unstaged_mods: Vec<String>,
    last_backup: Option<String>,
}

fn show_status(app: &App, format: OutputFormat) -> Result<()> {
    let target = app.target_root()?;
    let store = app.store();
    let manifest = store.load(&target)?;
    let verify = app.engine().verify(&target)?;
    let mods = app.library.list_mods();
    let report = StatusReport {
        target: target.display().to_string(),
        locked: store.lock_path(&target).exists(),
        profile: manifest.profile.as_ref().map(|profile| profile.name.clone()),
        mode: manifest.mode,
        deployed_at: manifest.deployed_at.clone(),
        files: manifest.entries.len(),
        directories: manifest.directories.len(),
        owned: verify.owned,
        unstaged_mods: mods
            .iter()
            .filter(|staged| !staged.root.is_dir())
            .map(|staged| staged.name.clone())
            .collect(),
        mods: mods.len(),
        drift: verify.drift,
        failures: verify.failures,
        last_backup: backup::load_last_backup(&app.data_dir)?
            .map(|path| path.display().to_string()),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("Target: {}", report.target);
            if report.locked {
                println!("Locked: an operation is running (or crashed; see 'stagehand unlock')");
            }
            if report.files == 0 {
                println!("Nothing deployed.");
            } else {
                println!(
                    "Deployed: {} ({}) at {}",
                    report.profile.as_deref().unwrap_or("-"),
                    report.mode.map(LinkKind::label).unwrap_or("-"),
                    report
                        .deployed_at
                        .as_deref()
                        .map(format_timestamp)
                        .unwrap_or_else(|| "-".to_string())
                );
                println!(
                    "Files: {} recorded, {} intact, {} directories created",
                    report.files, report.owned, report.directories
                );
            }
            print_failures(&report.failures);
            print_drift(&report.drift);
            println!("Mods: {}", report.mods);
            for name in &report.unstaged_mods {
                println!("  missing folder: {name}");
            }
            if let Some(path) = &report.last_backup {
                println!("Last backup: {path}");
            }
        }
    }
    Ok(())
}

fn show_config(app: &App, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&app.config)?),
        OutputFormat::Text => {
            for (key, value) in app.config.entries() {
                println!("{key} = {value}");
            }
            println!("data_dir = {}", app.data_dir.display());
        }
    }
    Ok(())
}

fn format_date(timestamp: i64) -> String {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()
        .filter(|_| timestamp > 0)
        .and_then(|date| date.format(&format).ok())
        .unwrap_or_else(|| "----------".to_string())
}

fn format_timestamp(value: &str) -> String {
    let format = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute] UTC");
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .and_then(|time| time.format(&format).ok())
        .unwrap_or_else(|| value.to_string())
}

fn print_help() {
    println!("stagehand v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  stagehand mods list                  List mods in load order");
    println!("  stagehand mods add <name> <path>     Register a staged mod folder");
    println!("  stagehand mods remove <mod>          Forget a mod");
    println!("  stagehand mods search <query>        Search by name, author, or tag");
    println!("  stagehand mods set <mod> <field> <value>");
    println!("                                       Set version, author, description, or tags");
    println!("  stagehand profiles list              List profiles");
    println!("  stagehand profiles create <name>     Create a profile");
    println!("  stagehand profiles rename <from> <to>");
    println!("  stagehand profiles delete <name>     Delete a profile");
    println!("  stagehand profiles use <name>        Switch the active profile");
    println!("  stagehand enable <mod>               Enable a mod in the profile");
    println!("  stagehand disable <mod>              Disable a mod in the profile");
    println!("  stagehand move <mod> <up|down|N>     Change load order (later wins)");
    println!("  stagehand conflicts                  Show which mod wins each shared file");
    println!("  stagehand deploy [options]           Deploy the profile to the game dir");
    println!("  stagehand undeploy                   Remove everything stagehand deployed");
    println!("  stagehand status                     Show what is deployed and what changed");
    println!("  stagehand config [show]              Show configuration");
    println!("  stagehand config set <key> <value>   Change configuration");
    println!("  stagehand unlock                     Clear a lock left by a crashed run");
    println!();
    println!("Deploy options:");
    println!("  --mode <symlink|copy>                Override the configured mode");
    println!("  --no-backup                          Skip the pre-deploy backup");
    println!("  --abort-on-error                     Roll back on the first failed file");
    println!();
    println!("Global options:");
    println!("  --format <json|text>                 Output format");
    println!("  --profile <name>                     Profile to use instead of the active one");
    println!("  -q, --quiet                          Warnings and errors only");
    println!("  -v, --verbose                        Debug logging");
    println!("  -h, --help                           Show help");
    println!("  -V, --version                        Show version");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn global_options_are_accepted_anywhere() {
        let action = parse_args(&args(&["deploy", "--format=json", "--profile", "Modded", "-q"]))
            .unwrap();
        assert!(action.global.format == OutputFormat::Json);
        assert_eq!(action.global.profile.as_deref(), Some("Modded"));
        assert_eq!(action.global.verbosity, Verbosity::Quiet);
        assert_eq!(action.command, CliCommand::Deploy(DeployArgs::default()));
    }

    #[test]
    fn deploy_flags_map_to_request_overrides() {
        let action = parse_args(&args(&[
            "deploy",
            "--mode",
            "copy",
            "--no-backup",
            "--abort-on-error",
        ]))
        .unwrap();
        let CliCommand::Deploy(deploy) = action.command else {
            panic!("expected deploy");
        };
        let request = deploy.request();
        assert_eq!(request.mode, Some(LinkKind::Copy));
        assert_eq!(request.backup, Some(false));
        assert_eq!(request.abort_on_first_error, Some(true));

        assert!(parse_args(&args(&["deploy", "--mode", "hardlink"])).is_err());
        assert!(parse_args(&args(&["deploy", "--force"])).is_err());
    }

    #[test]
    fn subcommands_parse() {
        assert_eq!(
            parse_args(&args(&["mods", "add", "tex_a", "/staging/tex_a"]))
                .unwrap()
                .command,
            CliCommand::ModsAdd {
                name: "tex_a".to_string(),
                path: PathBuf::from("/staging/tex_a"),
            }
        );
        assert_eq!(
            parse_args(&args(&["move", "tex_a", "3"])).unwrap().command,
            CliCommand::Move {
                key: "tex_a".to_string(),
                to: MoveTarget::Position(3),
            }
        );
        assert_eq!(
            parse_args(&args(&["config"])).unwrap().command,
            CliCommand::ConfigShow
        );
        assert_eq!(parse_args(&args(&[])).unwrap().command, CliCommand::Help);
        assert!(parse_args(&args(&["move", "tex_a", "0"])).is_err());
        assert!(parse_args(&args(&["mods", "add", "only-name"])).is_err());
        assert!(parse_args(&args(&["frobnicate"])).is_err());
    }

    #[test]
    fn mod_fields_are_editable() {
        let mut entry = ModEntry::new("tex_a", std::path::Path::new("/staging/tex_a"));
        set_mod_field(&mut entry, "tags", "textures, hd ,").unwrap();
        set_mod_field(&mut entry, "author", "someone").unwrap();
        assert_eq!(entry.tags, vec!["textures", "hd"]);
        assert_eq!(entry.author.as_deref(), Some("someone"));
        set_mod_field(&mut entry, "author", "-").unwrap();
        assert_eq!(entry.author, None);
        assert!(set_mod_field(&mut entry, "colour", "red").is_err());
    }

    #[test]
    fn timestamps_render_as_dates() {
        assert_eq!(format_date(0), "----------");
        assert_eq!(format_date(1_600_000_000), "2020-09-13");
        assert_eq!(
            format_timestamp("2026-10-16T10:00:00Z"),
            "2026-10-16 10:00 UTC"
        );
    }
}
