mod build;
mod config;
mod detect;
mod docker;
mod error;
mod fsutil;
mod generate;
mod health;
mod model;
mod platforms;
mod registry;
mod scan;
mod wrap;

use crate::config::{
    build_default_config_yaml, load_config_or_default, read_config, resolve_config_dir,
    validate_config, Config, CONFIG_FILE_NAME,
};
use crate::detect::{default_detectors, discover_candidates, Detector};
use crate::docker::RealDockerRunner;
use crate::error::{LibrarianError, ProcessErrorDetails};
use crate::fsutil::ensure_parent;
use crate::generate::Generator;
use crate::health::{HealthReport, HealthStatus};
use crate::platforms::{PlatformId, PlatformManager, PlatformPaths};
use crate::registry::{RegistryEntry, RegistryStore, ServerStatus};
use crate::scan::{describe_blocking, scan_path, Fixer, SmartScanResult};
use crate::wrap::{
    batch_error, ensure_docker_available, health_failure, validate_workers, BatchReport,
    Librarian, WrapOptions, WrapReport,
};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::json;
use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "mcp-librarian",
    version,
    about = "Containerize MCP servers, health-check them and register them with AI coding tools"
)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Falls back to ~/.config/mcp-librarian.
    #[arg(long = "config-dir", global = true, env = "MCP_LIBRARIAN_HOME")]
    config_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Containerize one MCP server directory.
    Wrap {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "platform", value_enum)]
        platforms: Vec<PlatformId>,
        #[arg(long, default_value_t = false)]
        no_health_check: bool,
        #[arg(long, default_value_t = false)]
        no_register: bool,
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Containerize every server directory directly below DIR.
    WrapAll {
        dir: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long = "platform", value_enum)]
        platforms: Vec<PlatformId>,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    List {
        #[arg(long, value_enum)]
        status: Option<ServerStatus>,
    },
    Status {
        name: String,
        #[arg(long, default_value_t = false)]
        history: bool,
    },
    Health {
        name: Option<String>,
        #[arg(long, default_value_t = false)]
        recover: bool,
        #[arg(long, default_value_t = false)]
        history: bool,
    },
    Remove {
        name: String,
        #[arg(long, default_value_t = false)]
        keep_config: bool,
        #[arg(long, default_value_t = false)]
        keep_platform_entry: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    Scan {
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        fix: bool,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    config_root: PathBuf,
    config_path: PathBuf,
    json: bool,
    verbose: bool,
}

/// Long-lived collaborators shared by the pipeline commands.
struct Services {
    config: Config,
    store: RegistryStore,
    platforms: PlatformManager,
    detectors: Vec<Box<dyn Detector>>,
    generator: Generator,
}

impl Services {
    fn load(ctx: &Context) -> Result<Self, LibrarianError> {
        let config = load_config_or_default(&ctx.config_path)?;
        Ok(Self {
            store: RegistryStore::new(&ctx.config_root),
            platforms: PlatformManager::new(PlatformPaths::from_env()?),
            detectors: default_detectors(),
            generator: Generator::new()?,
            config,
        })
    }

    fn librarian<'a>(
        &'a self,
        ctx: &'a Context,
        runner: &'a RealDockerRunner,
    ) -> Librarian<'a, RealDockerRunner> {
        Librarian {
            runner,
            config: &self.config,
            config_root: &ctx.config_root,
            store: &self.store,
            platforms: &self.platforms,
            detectors: &self.detectors,
            generator: &self.generator,
        }
    }
}

fn main() -> Result<(), LibrarianError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let ctx = build_context(&cli);
    let runner = RealDockerRunner;

    let result = match cli.command {
        Commands::Wrap {
            path,
            name,
            platforms,
            no_health_check,
            no_register,
            force,
            dry_run,
        } => {
            let opts = WrapOptions {
                name,
                platforms,
                skip_health_check: no_health_check,
                skip_register: no_register,
                force,
                dry_run,
                verbose: ctx.verbose,
            };
            handle_wrap(&ctx, path, opts, &runner)
        }
        Commands::WrapAll {
            dir,
            workers,
            platforms,
            filter,
            force,
            yes,
        } => {
            let opts = WrapOptions {
                platforms,
                force,
                verbose: ctx.verbose,
                ..WrapOptions::default()
            };
            handle_wrap_all(&ctx, dir, workers, filter, yes, opts, &runner)
        }
        Commands::List { status } => handle_list(&ctx, status),
        Commands::Status { name, history } => handle_status(&ctx, &name, history),
        Commands::Health {
            name,
            recover,
            history,
        } => handle_health(&ctx, name.as_deref(), recover, history, &runner),
        Commands::Remove {
            name,
            keep_config,
            keep_platform_entry,
            yes,
        } => handle_remove(&ctx, &name, keep_config, keep_platform_entry, yes, &runner),
        Commands::Scan { path, fix } => handle_scan(&ctx, path, fix, &runner),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: Some(error_details(&err, ctx.verbose)),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{}", err.render(ctx.verbose));
        }
        std::process::exit(err.exit_code());
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn build_context(cli: &Cli) -> Context {
    let config_root = resolve_config_dir(cli.config_dir.as_deref());
    Context {
        config_path: config_root.join(CONFIG_FILE_NAME),
        config_root,
        json: cli.json,
        verbose: cli.verbose,
    }
}

fn error_details(err: &LibrarianError, verbose: bool) -> ProcessErrorDetails {
    match err.details() {
        Some(mut details) => {
            if !verbose {
                details.raw_stderr = None;
            }
            details
        }
        None => ProcessErrorDetails {
            error_code: err.code(),
            hint: Some(err.next_step()),
            command: None,
            raw_stderr: None,
        },
    }
}

fn confirm(prompt: &str, yes: bool) -> Result<bool, LibrarianError> {
    if yes {
        return Ok(true);
    }
    if !io::stdin().is_terminal() {
        return Err(LibrarianError::Process(
            "confirmation required; re-run with --yes in non-interactive sessions".to_string(),
        ));
    }
    Ok(Confirm::new().with_prompt(prompt).default(false).interact()?)
}

fn handle_wrap(
    ctx: &Context,
    path: PathBuf,
    opts: WrapOptions,
    runner: &RealDockerRunner,
) -> Result<(), LibrarianError> {
    if !opts.dry_run {
        ensure_docker_available()?;
    }
    let services = Services::load(ctx)?;
    let report = services.librarian(ctx, runner).wrap(&path, &opts)?;
    if ctx.json {
        return output(ctx, serde_json::to_value(&report)?);
    }
    print_wrap_report(&report);
    Ok(())
}

fn handle_wrap_all(
    ctx: &Context,
    dir: PathBuf,
    workers: Option<usize>,
    filter: Option<String>,
    yes: bool,
    opts: WrapOptions,
    runner: &RealDockerRunner,
) -> Result<(), LibrarianError> {
    ensure_docker_available()?;
    let services = Services::load(ctx)?;
    let workers = validate_workers(workers.unwrap_or(services.config.workers))?;
    let candidates = discover_candidates(&dir, filter.as_deref())?;
    if candidates.is_empty() {
        return output(
            ctx,
            json!({"root": dir, "candidates": 0, "message": "no server directories found"}),
        );
    }
    let prompt = format!(
        "Wrap {} server directories under {} with {workers} workers?",
        candidates.len(),
        dir.display()
    );
    if !confirm(&prompt, yes)? {
        return output(ctx, json!({"root": dir, "cancelled": true}));
    }

    let report = services
        .librarian(ctx, runner)
        .wrap_all(&candidates, &dir, workers, &opts);
    let failure = (report.failed > 0).then(|| batch_error(&report));
    finish(ctx, serde_json::to_value(&report)?, || print_batch_report(&report), failure)
}

fn handle_list(ctx: &Context, status: Option<ServerStatus>) -> Result<(), LibrarianError> {
    let store = RegistryStore::new(&ctx.config_root);
    let entries: Vec<RegistryEntry> = store
        .list_all()?
        .into_iter()
        .filter(|entry| status.map_or(true, |wanted| entry.status == wanted))
        .collect();
    if ctx.json {
        let servers: Vec<serde_json::Value> = entries.iter().map(entry_summary).collect();
        return output(ctx, json!({"servers": servers}));
    }
    print_entries(&entries);
    Ok(())
}

fn handle_status(ctx: &Context, name: &str, history: bool) -> Result<(), LibrarianError> {
    let mut entry = RegistryStore::new(&ctx.config_root).require(name)?;
    if !history {
        entry.health_history.clear();
    }
    if ctx.json {
        return output(ctx, serde_json::to_value(&entry)?);
    }
    print!("{}", serde_yaml::to_string(&entry)?);
    Ok(())
}

fn handle_health(
    ctx: &Context,
    name: Option<&str>,
    recover: bool,
    history: bool,
    runner: &RealDockerRunner,
) -> Result<(), LibrarianError> {
    let services = Services::load(ctx)?;
    let results = services.librarian(ctx, runner).check_health(name, recover)?;
    let payload: Vec<serde_json::Value> = results
        .iter()
        .map(|(entry, report)| {
            let mut value = json!({
                "name": entry.name,
                "status": report.result.status,
                "registry_status": entry.status,
                "result": report.result,
                "tool_names": report.tool_names,
            });
            if let Some(recovered) = report.recovered {
                value["recovered"] = json!(recovered);
            }
            if history {
                value["history"] = json!(entry.health_history);
            }
            value
        })
        .collect();
    let failure = results
        .iter()
        .find(|(_, report)| {
            !matches!(
                report.result.status,
                HealthStatus::Healthy | HealthStatus::Degraded
            )
        })
        .map(|(entry, report)| health_failure(&entry.name, report));
    finish(
        ctx,
        json!({"servers": payload}),
        || print_health(&results, history),
        failure,
    )
}

fn handle_remove(
    ctx: &Context,
    name: &str,
    keep_config: bool,
    keep_platform_entry: bool,
    yes: bool,
    runner: &RealDockerRunner,
) -> Result<(), LibrarianError> {
    let services = Services::load(ctx)?;
    let entry = services.store.require(name)?;
    let prompt = format!(
        "Remove '{}' (container, registry entry{}{})?",
        entry.name,
        if keep_platform_entry { "" } else { ", platform entries" },
        if keep_config { "" } else { ", generated config" }
    );
    if !confirm(&prompt, yes)? {
        return output(ctx, json!({"name": entry.name, "removed": false}));
    }
    let report = services
        .librarian(ctx, runner)
        .remove(name, keep_config, keep_platform_entry)?;
    if ctx.json {
        return output(ctx, serde_json::to_value(&report)?);
    }
    println!("[OK] removed {}", report.name);
    for change in report.platforms.iter().filter(|change| change.changed) {
        println!("  - {} entry removed from {}", change.platform, change.path.display());
    }
    if report.config_removed {
        println!("  - generated config deleted");
    }
    println!("  source left untouched: {}", report.source_path.display());
    Ok(())
}

fn handle_scan(
    ctx: &Context,
    path: PathBuf,
    fix: bool,
    runner: &RealDockerRunner,
) -> Result<(), LibrarianError> {
    let config = load_config_or_default(&ctx.config_path)?;
    let detectors = default_detectors();
    let mut result = scan_path(&path, &detectors)?;
    let fixes = if fix {
        let fixes = Fixer::new(runner, &config.fixer).fix_all(&result, None);
        if !fixes.is_empty() {
            result = scan_path(&path, &detectors)?;
        }
        fixes
    } else {
        Vec::new()
    };
    let blocking = result.blocking_unfixable();
    let failure = (!blocking.is_empty())
        .then(|| LibrarianError::BlockingIssues(describe_blocking(&blocking)));
    finish(
        ctx,
        json!({"scan": result, "fixes": fixes}),
        || print_scan(&result, &fixes),
        failure,
    )
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), LibrarianError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, build_default_config_yaml()?)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let cfg = read_config(&ctx.config_path).map_err(|err| match err {
                LibrarianError::Config(_) => err,
                other => LibrarianError::Config(format!("{}: {other}", ctx.config_path.display())),
            })?;
            validate_config(&cfg)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config_or_default(&ctx.config_path)?;
            let registry = RegistryStore::new(&ctx.config_root);
            if ctx.json {
                return output(
                    ctx,
                    json!({
                        "path": ctx.config_path,
                        "exists": ctx.config_path.exists(),
                        "registry": registry.path(),
                        "config": cfg,
                    }),
                );
            }
            println!("# {}", ctx.config_path.display());
            println!("# registry: {}", registry.path().display());
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
    }
}

fn entry_summary(entry: &RegistryEntry) -> serde_json::Value {
    json!({
        "name": entry.name,
        "status": entry.status,
        "runtime": entry.runtime,
        "source_path": entry.source_path,
        "image": entry.image,
        "registered_platforms": entry.registered_platforms,
        "triggers": entry.triggers,
        "health": entry.health,
    })
}

/// Prints the payload, then exits with the failure's code when there is one.
fn finish(
    ctx: &Context,
    payload: serde_json::Value,
    human: impl FnOnce(),
    failure: Option<LibrarianError>,
) -> Result<(), LibrarianError> {
    let Some(err) = failure else {
        if ctx.json {
            return output(ctx, payload);
        }
        human();
        return Ok(());
    };
    if ctx.json {
        print_json(&JsonResult {
            ok: false,
            result: Some(payload),
            error: Some(err.to_string()),
            error_details: Some(error_details(&err, ctx.verbose)),
        })?;
    } else {
        human();
        eprintln!("{}", err.render(ctx.verbose));
    }
    std::process::exit(err.exit_code());
}

fn print_wrap_report(report: &WrapReport) {
    if report.dry_run {
        println!("[DRY RUN] {} ({})", report.name, report.runtime);
        if let Some(rendered) = &report.rendered {
            println!("--- {}", rendered.config.dockerfile.display());
            print!("{}", rendered.dockerfile);
            println!("--- {}", rendered.config.compose_file.display());
            print!("{}", rendered.compose);
            println!("--- {}", rendered.config.env_example.display());
            print!("{}", rendered.env_example);
        }
        return;
    }
    println!("[OK] wrapped {} ({})", report.name, report.runtime);
    for fix in &report.fixes {
        let mark = if fix.success { "fixed" } else { "fix failed" };
        println!("  - {mark}: {}", fix.description);
    }
    for warning in &report.warnings {
        println!("  - warning: {warning}");
    }
    if let Some(image) = &report.image {
        println!("  image:    {image}");
    }
    if let Some(dir) = &report.config_dir {
        println!("  config:   {}", dir.display());
    }
    if let Some(health) = &report.health {
        println!(
            "  health:   {} ({} ms, {} tools)",
            health.status.as_str(),
            health.response_time_ms,
            health.tool_count
        );
    }
    for change in &report.platforms {
        println!("  platform: {} -> {}", change.platform, change.path.display());
    }
    if !report.registered {
        println!("  not registered (--no-register)");
    }
}

fn print_batch_report(report: &BatchReport) {
    println!("{:<28} {:<8} {:<12} DETAIL", "SERVER", "RESULT", "HEALTH");
    for item in &report.items {
        let result = if item.ok { "ok" } else { "FAILED" };
        let health = item.status.map(|status| status.as_str()).unwrap_or("-");
        let detail = match (&item.error_code, &item.error) {
            (Some(code), Some(error)) => format!("{code}: {error}"),
            _ => String::new(),
        };
        println!("{:<28} {:<8} {:<12} {}", item.name, result, health, detail);
    }
    println!(
        "{} succeeded, {} failed ({} workers)",
        report.succeeded, report.failed, report.workers
    );
}

fn print_entries(entries: &[RegistryEntry]) {
    if entries.is_empty() {
        println!("No servers registered.");
        return;
    }
    println!(
        "{:<24} {:<15} {:<8} {:<10} {:<26} PLATFORMS",
        "NAME", "STATUS", "RUNTIME", "HEALTH", "LAST CHECK"
    );
    for entry in entries {
        let last_check = entry
            .health
            .last_check
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        let platforms: Vec<&str> = entry.registered_platforms.iter().map(PlatformId::as_str).collect();
        println!(
            "{:<24} {:<15} {:<8} {:<10} {:<26} {}",
            entry.name,
            entry.status.as_str(),
            entry.runtime.as_str(),
            entry.health.last_status.as_str(),
            last_check,
            if platforms.is_empty() { "-".to_string() } else { platforms.join(",") }
        );
    }
}

fn print_health(results: &[(RegistryEntry, HealthReport)], history: bool) {
    if results.is_empty() {
        println!("No servers registered.");
        return;
    }
    for (entry, report) in results {
        let result = &report.result;
        let mut line = format!("{:<24} {:<10}", entry.name, result.status.as_str());
        if result.protocol_responds {
            line.push_str(&format!(" {} ms, {} tools", result.response_time_ms, result.tool_count));
        }
        if !result.error_message.is_empty() {
            line.push_str(&format!(" ({})", result.error_message));
        }
        match report.recovered {
            Some(true) => line.push_str(" [recovered]"),
            Some(false) => line.push_str(" [unrecovered]"),
            None => {}
        }
        println!("{line}");
        if history {
            for past in entry.health_history.iter().rev() {
                println!(
                    "    {} {:<10} {} ms",
                    past.checked_at.format("%Y-%m-%d %H:%M:%S"),
                    past.status.as_str(),
                    past.response_time_ms
                );
            }
        }
    }
}

fn print_scan(result: &SmartScanResult, fixes: &[scan::Fix]) {
    match &result.server {
        Some(server) => println!(
            "{} ({} {}, entry {})",
            result.source_path.display(),
            server.runtime,
            server.runtime_version,
            if server.entry_point.is_empty() { "-" } else { server.entry_point.as_str() }
        ),
        None => println!("{}", result.source_path.display()),
    }
    if result.issues.is_empty() {
        println!("  no issues found");
    }
    for issue in &result.issues {
        let fixable = if issue.auto_fixable { " [auto-fixable]" } else { "" };
        let severity = serde_json::to_value(issue.severity)
            .ok()
            .and_then(|value| value.as_str().map(str::to_uppercase))
            .unwrap_or_default();
        println!("  {severity:<8} {}: {}{fixable}", issue.issue_type.as_str(), issue.description);
    }
    for warning in &result.warnings {
        println!("  INFO     {warning}");
    }
    for fix in fixes {
        let mark = if fix.success { "fixed" } else { "fix failed" };
        println!("  {mark}: {}", fix.description);
    }
    println!(
        "  ready to build: {}",
        if result.ready_to_build { "yes" } else { "no" }
    );
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), LibrarianError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), LibrarianError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
