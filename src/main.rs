mod instance;
mod limits;
mod logging;
mod memory;
mod settings;
mod shell;
mod tmux;

use clap::{Parser, Subcommand};
use dirs::home_dir;
use instance::{collect_env_mods, read_config, Config, EnvMap};
use log::info;
use serde::Serialize;
use serde_json::json;
use settings::Settings;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tmux::{AssumeYes, CollisionResolver, PromptResolver, RealTmuxRunner, Tmux, WindowLauncher};

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

#[derive(Parser, Debug)]
#[command(name = "kvlaunch", version, about = "Launch serving instances in tmux")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Create the tmux session and start one window per instance.
    Launch {
        #[arg(long)]
        session: Option<String>,
        /// Restart an existing session without asking.
        #[arg(long, short = 'y')]
        yes: bool,
        /// Print the composed window commands without touching tmux.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the merged environment overrides of one instance.
    Env { instance: String },
    /// Print runtime settings resolved from KVCACHED_* variables.
    Settings,
    /// Round a cell count up to whole memory pages.
    Align {
        cells: u64,
        #[arg(long)]
        cell_size: u64,
    },
    Doctor,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid env entry: {0}")]
    InvalidEnv(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    config_path: PathBuf,
    settings: Settings,
    json: bool,
}

fn main() -> Result<(), LaunchError> {
    let cli = Cli::parse();
    let settings = Settings::from_env();
    logging::init(&settings.log);
    let ctx = Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        settings,
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Launch {
            session,
            yes,
            dry_run,
        } => handle_launch(&ctx, session, yes, dry_run),
        Commands::Env { instance } => handle_env(&ctx, &instance),
        Commands::Settings => handle_settings(&ctx),
        Commands::Align { cells, cell_size } => handle_align(&ctx, cells, cell_size),
        Commands::Doctor => handle_doctor(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("KVLAUNCH_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("KVLAUNCH_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("kvlaunch");
    base
}

fn ensure_parent(path: &Path) -> Result<(), LaunchError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), LaunchError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let cfg = read_config(&ctx.config_path)?;
            output(
                ctx,
                json!({"path": ctx.config_path, "valid": true, "instances": cfg.instances.len()}),
            )
        }
    }
}

/// Validates every instance's env up front so a bad entry never leaves a
/// half-launched session behind.
fn collect_all_envs(cfg: &Config) -> Result<Vec<EnvMap>, LaunchError> {
    cfg.instances
        .iter()
        .map(|inst| {
            collect_env_mods(inst).map_err(|err| match err {
                LaunchError::InvalidEnv(msg) => {
                    LaunchError::InvalidEnv(format!("instance {}: {msg}", inst.name))
                }
                other => other,
            })
        })
        .collect()
}

fn handle_launch(
    ctx: &Context,
    session: Option<String>,
    yes: bool,
    dry_run: bool,
) -> Result<(), LaunchError> {
    let cfg = read_config(&ctx.config_path)?;
    let session = session.unwrap_or_else(|| cfg.tmux.session.clone());
    if session.trim().is_empty() {
        return Err(LaunchError::Config("session name must not be empty".to_string()));
    }
    let envs = collect_all_envs(&cfg)?;

    if dry_run {
        let mut windows = Vec::new();
        for (inst, env_mod) in cfg.instances.iter().zip(&envs) {
            let script = tmux::compose_command(&inst.command, env_mod, inst)?;
            windows.push(json!({"window": inst.name, "command": script.render()}));
        }
        return output(ctx, json!({"session": session, "dry_run": true, "windows": windows}));
    }

    limits::raise_nofile_limit(limits::DEFAULT_NOFILE_TARGET);

    let runner = RealTmuxRunner::locate()?;
    let mux = Tmux::new(&runner);
    let resolver: &dyn CollisionResolver = if yes { &AssumeYes } else { &PromptResolver };
    if !tmux::ensure_session(&mux, resolver, &session)? {
        return output(ctx, json!({"session": session, "launched": false, "windows": []}));
    }

    let mut launcher = WindowLauncher::new(&mux, &session);
    let mut windows = Vec::new();
    for (inst, env_mod) in cfg.instances.iter().zip(&envs) {
        launcher.launch(&inst.name, &inst.command, env_mod, inst)?;
        info!("Launched {} in tmux session {session}", inst.name);
        windows.push(inst.name.clone());
    }
    output(ctx, json!({"session": session, "launched": true, "windows": windows}))
}

fn handle_env(ctx: &Context, name: &str) -> Result<(), LaunchError> {
    let cfg = read_config(&ctx.config_path)?;
    let inst = cfg.instance(name)?;
    let env_mod = collect_env_mods(inst)?;
    output(ctx, json!({"instance": name, "env": env_mod}))
}

fn handle_settings(ctx: &Context) -> Result<(), LaunchError> {
    let mut payload = serde_json::to_value(&ctx.settings)?;
    payload["ipc_path"] = json!(ctx.settings.ipc_path());
    output(ctx, payload)
}

fn handle_align(ctx: &Context, cells: u64, cell_size: u64) -> Result<(), LaunchError> {
    if cell_size == 0 || cell_size > ctx.settings.page_size {
        return Err(LaunchError::Config(format!(
            "cell size must be between 1 and {} bytes",
            ctx.settings.page_size
        )));
    }
    let aligned = memory::align_up_to_page(cells, cell_size).ok_or_else(|| {
        LaunchError::Config(format!("{cells} cells of {cell_size} bytes are too large to align"))
    })?;
    let pages = aligned / (ctx.settings.page_size / cell_size);
    output(ctx, json!({"cells": cells, "aligned_cells": aligned, "pages": pages}))
}

fn handle_doctor(ctx: &Context) -> Result<(), LaunchError> {
    let tmux_path = RealTmuxRunner::locate().ok().map(|r| r.program().to_path_buf());
    let nofile = limits::current_nofile_limit().ok();

    if ctx.json {
        let payload = JsonResult {
            ok: tmux_path.is_some(),
            result: Some(json!({
                "tmux": tmux_path,
                "nofile_soft": nofile.map(|l| l.soft),
                "nofile_hard": nofile.map(|l| l.hard),
            })),
            error: if tmux_path.is_some() {
                None
            } else {
                Some("tmux is not available".to_string())
            },
        };
        print_json(&payload)?;
        return Ok(());
    }

    match &tmux_path {
        Some(path) => println!("tmux: {}", path.display()),
        None => println!("tmux: missing"),
    }
    match nofile {
        Some(limit) => println!("RLIMIT_NOFILE: soft {} / hard {}", limit.soft, limit.hard),
        None => println!("RLIMIT_NOFILE: unknown"),
    }
    if tmux_path.is_none() {
        return Err(LaunchError::Process("tmux is not available".to_string()));
    }
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), LaunchError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), LaunchError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
