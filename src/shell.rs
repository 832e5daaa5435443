//! Ordered shell fragments rendered into a single `bash -c` string.
//!
//! Values are quoted at render time, so callers only ever hand over raw
//! strings and paths.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Ulimit(u64),
    Source(PathBuf),
    Export { key: String, value: String },
    Exec(Vec<String>),
    Echo(String),
    Read,
}

impl Fragment {
    fn render(&self) -> String {
        match self {
            Fragment::Ulimit(limit) => format!("ulimit -n {limit}"),
            Fragment::Source(path) => {
                format!("source {}", shell_words::quote(&path.to_string_lossy()))
            }
            // Keys are checked to be shell identifiers when collected.
            Fragment::Export { key, value } => {
                format!("export {key}={}", shell_words::quote(value))
            }
            Fragment::Exec(argv) => shell_words::join(argv),
            Fragment::Echo(text) => format!("echo {}", quote_always(text)),
            Fragment::Read => "read".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellScript {
    fragments: Vec<Fragment>,
}

impl ShellScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: Fragment) -> &mut Self {
        self.fragments.push(fragment);
        self
    }

    pub fn extend(&mut self, other: ShellScript) -> &mut Self {
        self.fragments.extend(other.fragments);
        self
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn render(&self) -> String {
        self.fragments
            .iter()
            .map(Fragment::render)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for ShellScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn quote_always(text: &str) -> Cow<'_, str> {
    match shell_words::quote(text) {
        Cow::Borrowed(_) => Cow::Owned(format!("'{text}'")),
        owned => owned,
    }
}
