use crate::instance::{EnvMap, Instance};
use crate::limits::DEFAULT_NOFILE_TARGET;
use crate::shell::{Fragment, ShellScript};
use crate::LaunchError;
use dialoguer::Input;
use log::{debug, info};
use std::env;
use std::fs;
use std::io::{self, BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const SESSION_WIDTH: u16 = 120;
pub const SESSION_HEIGHT: u16 = 30;
pub const HISTORY_LIMIT: &str = "999999";

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

pub trait TmuxRunner {
    fn run(&self, args: &[String]) -> Result<CommandOutput, io::Error>;
}

#[derive(Debug)]
pub struct RealTmuxRunner {
    program: PathBuf,
}

impl RealTmuxRunner {
    /// Uses `KVLAUNCH_TMUX` when set, otherwise the first `tmux` on PATH.
    pub fn locate() -> Result<Self, LaunchError> {
        if let Ok(path) = env::var("KVLAUNCH_TMUX") {
            if !path.trim().is_empty() {
                return Ok(Self {
                    program: PathBuf::from(path),
                });
            }
        }
        let program = which::which("tmux")
            .map_err(|err| LaunchError::Process(format!("tmux not found on PATH: {err}")))?;
        Ok(Self { program })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl TmuxRunner for RealTmuxRunner {
    fn run(&self, args: &[String]) -> Result<CommandOutput, io::Error> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// The handful of tmux operations the launcher needs, on top of a runner.
pub struct Tmux<'a> {
    runner: &'a dyn TmuxRunner,
}

impl<'a> Tmux<'a> {
    pub fn new(runner: &'a dyn TmuxRunner) -> Self {
        Self { runner }
    }

    fn invoke(&self, args: &[&str]) -> Result<CommandOutput, LaunchError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner
            .run(&args)
            .map_err(|err| LaunchError::Process(format!("failed to run tmux: {err}")))
    }

    fn invoke_checked(&self, args: &[&str]) -> Result<(), LaunchError> {
        let output = self.invoke(args)?;
        if output.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let mut message = format!(
            "tmux {} failed with status {}",
            args.first().copied().unwrap_or_default(),
            output.status_code
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        Err(LaunchError::Process(message))
    }

    /// A non-zero exit means the session is absent; only a failure to run
    /// tmux at all is an error.
    pub fn has_session(&self, session: &str) -> Result<bool, LaunchError> {
        Ok(self.invoke(&["has-session", "-t", &exact_session(session)])?.success())
    }

    pub fn kill_session(&self, session: &str) -> Result<(), LaunchError> {
        self.invoke_checked(&["kill-session", "-t", &exact_session(session)])
    }

    pub fn new_session(&self, session: &str, width: u16, height: u16) -> Result<(), LaunchError> {
        let width = width.to_string();
        let height = height.to_string();
        self.invoke_checked(&["new-session", "-d", "-s", session, "-x", &width, "-y", &height])
    }

    pub fn set_option(&self, session: &str, option: &str, value: &str) -> Result<(), LaunchError> {
        self.invoke_checked(&["set-option", "-t", &session_window(session, ""), option, value])
    }

    /// Creates the window at the session's lowest free index.
    pub fn new_window(&self, session: &str, window: &str, body: &str) -> Result<(), LaunchError> {
        let target = session_window(session, "");
        self.invoke_checked(&["new-window", "-t", &target, "-n", window, "bash", "-c", body])
    }

    pub fn kill_window(&self, session: &str, index: u32) -> Result<(), LaunchError> {
        self.invoke_checked(&["kill-window", "-t", &session_window(session, &index.to_string())])
    }
}

/// `=name` only matches a session called exactly `name`; a bare name would
/// also match `name-2` by prefix.
fn exact_session(session: &str) -> String {
    format!("={session}")
}

fn session_window(session: &str, window: &str) -> String {
    format!("={session}:{window}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionDecision {
    Restart,
    Skip,
}

/// Decides what to do when the target session already exists.
pub trait CollisionResolver {
    fn resolve_collision(&self, session: &str) -> Result<CollisionDecision, LaunchError>;
}

/// Asks the operator on the controlling terminal, or reads one line from
/// stdin when there is no terminal. Only `y`/`Y` restarts.
#[derive(Debug, Default)]
pub struct PromptResolver;

impl CollisionResolver for PromptResolver {
    fn resolve_collision(&self, session: &str) -> Result<CollisionDecision, LaunchError> {
        let prompt = format!("Tmux session '{session}' already exists. Kill it and restart? (y/N)");
        let answer = if io::stdin().is_terminal() {
            Input::<String>::new()
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()?
        } else {
            eprint!("{prompt}: ");
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line
        };
        Ok(parse_answer(&answer))
    }
}

/// Always restarts; backs `--yes`.
#[derive(Debug, Default)]
pub struct AssumeYes;

impl CollisionResolver for AssumeYes {
    fn resolve_collision(&self, _session: &str) -> Result<CollisionDecision, LaunchError> {
        Ok(CollisionDecision::Restart)
    }
}

fn parse_answer(answer: &str) -> CollisionDecision {
    if answer.trim().eq_ignore_ascii_case("y") {
        CollisionDecision::Restart
    } else {
        CollisionDecision::Skip
    }
}

/// Makes sure a detached session named `session` exists.
///
/// Returns `false` when the session already existed and the resolver chose
/// to leave it alone.
pub fn ensure_session(
    tmux: &Tmux,
    resolver: &dyn CollisionResolver,
    session: &str,
) -> Result<bool, LaunchError> {
    if tmux.has_session(session)? {
        match resolver.resolve_collision(session)? {
            CollisionDecision::Restart => {
                info!("Killing existing tmux session: {session}");
                tmux.kill_session(session)?;
            }
            CollisionDecision::Skip => {
                info!("Skipping launch for session: {session}");
                return Ok(false);
            }
        }
    }

    tmux.new_session(session, SESSION_WIDTH, SESSION_HEIGHT)?;
    tmux.set_option(session, "history-limit", HISTORY_LIMIT)?;
    tmux.set_option(session, "mouse", "on")?;
    Ok(true)
}

/// Builds the command an instance's pane runs, without the banners.
pub fn compose_command(
    command: &[String],
    env_mod: &EnvMap,
    inst: &Instance,
) -> Result<ShellScript, LaunchError> {
    let mut script = ShellScript::new();
    script.push(Fragment::Ulimit(DEFAULT_NOFILE_TARGET));
    if inst.using_venv {
        if let Some(venv) = inst.venv_path.as_deref() {
            let activate = resolve_venv(venv)?.join("bin").join("activate");
            script.push(Fragment::Source(activate));
        }
    }
    for (key, value) in env_mod.iter() {
        script.push(Fragment::Export {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    script.push(Fragment::Exec(command.to_vec()));
    Ok(script)
}

/// Wraps a composed command with start/finish banners and a final `read`
/// so the pane stays open after the command exits.
pub fn window_body(window_name: &str, command: ShellScript) -> ShellScript {
    let mut body = ShellScript::new();
    body.push(Fragment::Echo(format!("Starting {window_name}...")))
        .extend(command)
        .push(Fragment::Echo("Press Enter to close...".to_string()))
        .push(Fragment::Read);
    body
}

/// Starts instance windows in a session that `ensure_session` just made
/// ready.
///
/// tmux reuses the lowest free index, so after the placeholder at index 0
/// is gone the next window lands on 0. The placeholder is therefore removed
/// once, right after the first window exists, and never again.
pub struct WindowLauncher<'t, 'a> {
    tmux: &'t Tmux<'a>,
    session: String,
    placeholder_pending: bool,
}

impl<'t, 'a> WindowLauncher<'t, 'a> {
    pub fn new(tmux: &'t Tmux<'a>, session: &str) -> Self {
        Self {
            tmux,
            session: session.to_string(),
            placeholder_pending: true,
        }
    }

    pub fn launch(
        &mut self,
        window_name: &str,
        command: &[String],
        env_mod: &EnvMap,
        inst: &Instance,
    ) -> Result<(), LaunchError> {
        let full_cmd = compose_command(command, env_mod, inst)?;
        debug!("Command for {window_name}: {full_cmd}");
        let body = window_body(window_name, full_cmd);

        self.tmux.new_window(&self.session, window_name, &body.render())?;

        if self.placeholder_pending {
            self.placeholder_pending = false;
            if let Err(err) = self.tmux.kill_window(&self.session, 0) {
                debug!("placeholder window already removed: {err}");
            }
        }
        Ok(())
    }
}

fn resolve_venv(raw: &str) -> Result<PathBuf, LaunchError> {
    let expanded = match raw.strip_prefix("~/") {
        Some(stripped) => match dirs::home_dir() {
            Some(home) => home.join(stripped),
            None => PathBuf::from(raw),
        },
        None if raw == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    };
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        env::current_dir()?.join(expanded)
    };
    Ok(fs::canonicalize(&absolute).unwrap_or(absolute))
}
