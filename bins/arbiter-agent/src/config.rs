// Agent settings: companion port, workspace layout, timing knobs, and the
// language registry. Loaded from arbiter.json with explicit defaults.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timing knobs for the collection pipeline. These were tuned by use, not
/// derived; tests override them freely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Delay between reaching the expected contest size and resolving the
    /// session, so near-simultaneous payloads finish their handling first.
    pub grace_delay_ms: u64,
    /// Hard ceiling on how long a collection session stays open.
    pub collect_timeout_ms: u64,
    /// How long the processing flag lingers after a session stops; payloads
    /// arriving inside this window are dropped.
    pub processing_reset_ms: u64,
    /// Idle time before a sequencer chain retires its map entry.
    pub sequencer_retention_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            grace_delay_ms: 500,
            collect_timeout_ms: 60_000,
            processing_reset_ms: 1_000,
            sequencer_retention_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One entry of the language registry. `compile` is absent for interpreted
/// languages; command templates use `{source}` and `{binary}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub id: String,
    pub name: String,
    pub file_extension: String,
    #[serde(default)]
    pub compile: Option<CommandSpec>,
    pub run: CommandSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: u16,
    pub workspace_root: PathBuf,
    pub default_language: String,
    /// Whether non-empty stderr fails a test on its own.
    pub stderr_fails: bool,
    /// Stands in for the user's answer to the destructive-reinit prompt.
    pub allow_reinit: bool,
    pub timing: Timing,
    pub languages: Vec<LanguageSpec>,
}

fn default_languages() -> Vec<LanguageSpec> {
    vec![
        LanguageSpec {
            id: "cpp".to_string(),
            name: "C++".to_string(),
            file_extension: "cpp".to_string(),
            compile: Some(CommandSpec {
                program: "g++".to_string(),
                args: vec![
                    "-O2".to_string(),
                    "-o".to_string(),
                    "{binary}".to_string(),
                    "{source}".to_string(),
                ],
            }),
            run: CommandSpec {
                program: "{binary}".to_string(),
                args: vec![],
            },
        },
        LanguageSpec {
            id: "python".to_string(),
            name: "Python 3".to_string(),
            file_extension: "py".to_string(),
            compile: None,
            run: CommandSpec {
                program: "python3".to_string(),
                args: vec!["{source}".to_string()],
            },
        },
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 27121,
            workspace_root: PathBuf::from("."),
            default_language: "cpp".to_string(),
            stderr_fails: false,
            allow_reinit: false,
            timing: Timing::default(),
            languages: default_languages(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
        Ok(settings)
    }

    /// Load from an explicit path, from `arbiter.json` if present, or fall
    /// back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default_path = Path::new("arbiter.json");
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Look up a language by registry id.
    pub fn language(&self, id: &str) -> Result<&LanguageSpec> {
        match self.languages.iter().find(|l| l.id == id) {
            Some(spec) => Ok(spec),
            None => bail!("No configured language with id: {}", id),
        }
    }

    /// Resolve a language from a source file's extension, falling back to
    /// the configured default language.
    pub fn language_for_path(&self, path: &Path) -> Result<&LanguageSpec> {
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if let Some(spec) = self.languages.iter().find(|l| l.file_extension == ext) {
                return Ok(spec);
            }
        }
        self.language(&self.default_language)
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.timing.grace_delay_ms)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.collect_timeout_ms)
    }

    pub fn processing_reset(&self) -> Duration {
        Duration::from_millis(self.timing.processing_reset_ms)
    }

    pub fn sequencer_retention(&self) -> Duration {
        Duration::from_millis(self.timing.sequencer_retention_ms)
    }
}
