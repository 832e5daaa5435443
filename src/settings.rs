use log::LevelFilter;
use serde::Serialize;
use std::env;
use std::path::PathBuf;

/// Fixed page size assumed by the cache manager (2 MiB).
pub const PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Root directory of the shared-memory segment.
pub const SHM_DIR: &str = "/dev/shm";

pub const DEFAULT_IPC_NAME: &str = "kvcached_mem_info";
pub const DEFAULT_COLOR_CODE: &str = "\x1b[36m";

/// Process-wide runtime settings, resolved once at startup from the
/// `KVCACHED_*` environment variables and passed down explicitly.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub log: LogSettings,
    pub gpu_utilization: f64,
    pub page_prealloc_enabled: bool,
    pub min_reserved_pages: u64,
    pub max_reserved_pages: u64,
    pub sanity_check: bool,
    pub ipc_name: String,
    pub page_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogSettings {
    #[serde(serialize_with = "serialize_level")]
    pub level: LevelFilter,
    pub use_color: bool,
    pub uniform_color: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            use_color: true,
            uniform_color: DEFAULT_COLOR_CODE.to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let log = LogSettings {
            level: parse_level(lookup("KVCACHED_LOG_LEVEL").as_deref()),
            use_color: parse_flag(lookup("KVCACHED_LOG_COLOR").as_deref(), true),
            uniform_color: lookup("KVCACHED_LOG_COLOR_CODE")
                .unwrap_or_else(|| DEFAULT_COLOR_CODE.to_string()),
        };
        Self {
            log,
            gpu_utilization: parse_or(lookup("KVCACHED_GPU_UTILIZATION").as_deref(), 0.95),
            page_prealloc_enabled: parse_flag(
                lookup("KVCACHED_PAGE_PREALLOC_ENABLED").as_deref(),
                true,
            ),
            min_reserved_pages: parse_or(lookup("KVCACHED_MIN_RESERVED_PAGES").as_deref(), 5),
            max_reserved_pages: parse_or(lookup("KVCACHED_MAX_RESERVED_PAGES").as_deref(), 10),
            sanity_check: parse_flag(lookup("KVCACHED_SANITY_CHECK").as_deref(), false),
            ipc_name: lookup("KVCACHED_IPC_NAME")
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_IPC_NAME.to_string()),
            page_size: PAGE_SIZE,
        }
    }

    /// Location of the shared-memory segment used by the cache managers.
    pub fn ipc_path(&self) -> PathBuf {
        PathBuf::from(SHM_DIR).join(&self.ipc_name)
    }
}

/// Parses a level name; unset or unknown names fall back to `INFO`.
pub fn parse_level(raw: Option<&str>) -> LevelFilter {
    let Some(raw) = raw else {
        return LevelFilter::Info;
    };
    match raw.trim().to_ascii_uppercase().as_str() {
        "WARNING" => LevelFilter::Warn,
        "CRITICAL" | "FATAL" => LevelFilter::Error,
        other => other.parse().unwrap_or(LevelFilter::Info),
    }
}

fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some(value) => value.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<&str>, default: T) -> T {
    raw.and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn serialize_level<S: serde::Serializer>(level: &LevelFilter, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(level.as_str())
}
