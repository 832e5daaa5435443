use crate::LaunchError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

pub const DEFAULT_SESSION: &str = "kvcached";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub tmux: TmuxConfig,
    pub instances: Vec<Instance>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct TmuxConfig {
    pub session: String,
}

/// One engine + cache-manager deployment unit. Keys this tool does not know
/// about are ignored so the same file can carry settings for other tools.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Instance {
    pub name: String,
    pub command: Vec<String>,
    pub engine_env: Vec<String>,
    pub kvcached_env: Vec<String>,
    pub using_venv: bool,
    pub venv_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            tmux: TmuxConfig::default(),
            instances: Vec::new(),
        }
    }
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            session: DEFAULT_SESSION.to_string(),
        }
    }
}

impl Config {
    pub fn instance(&self, name: &str) -> Result<&Instance, LaunchError> {
        self.instances
            .iter()
            .find(|inst| inst.name == name)
            .ok_or_else(|| LaunchError::Config(format!("unknown instance: {name}")))
    }
}

pub fn read_config(path: &Path) -> Result<Config, LaunchError> {
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<(), LaunchError> {
    if cfg.version != 1 {
        return Err(LaunchError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg.tmux.session.trim().is_empty() {
        return Err(LaunchError::Config("tmux.session must not be empty".to_string()));
    }
    let mut seen = BTreeSet::new();
    for inst in &cfg.instances {
        if inst.name.trim().is_empty() {
            return Err(LaunchError::Config("instance name must not be empty".to_string()));
        }
        if !seen.insert(inst.name.as_str()) {
            return Err(LaunchError::Config(format!(
                "duplicate instance name: {}",
                inst.name
            )));
        }
        if inst.command.is_empty() {
            return Err(LaunchError::Config(format!(
                "instance {} has an empty command",
                inst.name
            )));
        }
        if inst.using_venv && inst.venv_path.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(LaunchError::Config(format!(
                "instance {} sets using_venv without venv_path",
                inst.name
            )));
        }
    }
    Ok(())
}

/// Insertion-ordered env overrides. Re-inserting a key replaces its value
/// but keeps the key where it first appeared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvMap {
    entries: Vec<(String, String)>,
}

impl EnvMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl Serialize for EnvMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Merges `engine_env` then `kvcached_env` into one mapping; later entries
/// win. Any malformed entry fails the whole merge.
pub fn collect_env_mods(inst: &Instance) -> Result<EnvMap, LaunchError> {
    let mut env = EnvMap::new();
    for entry in inst.engine_env.iter().chain(inst.kvcached_env.iter()) {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(LaunchError::InvalidEnv(format!(
                "expected KEY=VALUE, got {entry:?}"
            )));
        };
        if !is_shell_identifier(key) {
            return Err(LaunchError::InvalidEnv(format!(
                "invalid variable name in {entry:?}"
            )));
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn is_shell_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
