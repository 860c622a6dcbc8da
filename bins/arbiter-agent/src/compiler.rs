// Compile step for judged solutions. Compilation happens once per run; the
// produced artifact is deleted when the run reaches a terminal state.
use crate::config::{CommandSpec, Settings};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fully resolved invocation for a judged process.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// A solution ready to run. `artifact` is the compiled file to delete on
/// release; interpreted languages have none.
#[derive(Debug)]
pub struct CompiledBinary {
    pub exec: ExecSpec,
    artifact: Option<PathBuf>,
}

impl CompiledBinary {
    /// Delete the compiled artifact, if any. Best-effort: a failed removal
    /// is logged, not propagated.
    pub async fn release(self) {
        if let Some(path) = self.artifact {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(artifact = %path.display(), "released compiled binary"),
                Err(e) => warn!(artifact = %path.display(), error = %e, "failed to remove compiled binary"),
            }
        }
    }
}

fn substitute(template: &str, source: &Path, binary: &Path) -> String {
    template
        .replace("{source}", &source.to_string_lossy())
        .replace("{binary}", &binary.to_string_lossy())
}

fn resolve(spec: &CommandSpec, source: &Path, binary: &Path) -> ExecSpec {
    ExecSpec {
        program: substitute(&spec.program, source, binary),
        args: spec
            .args
            .iter()
            .map(|a| substitute(a, source, binary))
            .collect(),
    }
}

fn artifact_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "solution".to_string());
    let name = format!("{}-{}.bin", stem, Uuid::new_v4());
    match source.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

pub struct Compiler {
    settings: Arc<Settings>,
}

impl Compiler {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Compile `source` under the given language. Interpreted languages skip
    /// the compile step and resolve to a run spec over the source itself.
    /// On compiler failure the error carries the compiler's stderr.
    pub async fn compile(&self, language: &str, source: &Path) -> Result<CompiledBinary> {
        let lang = self.settings.language(language)?;

        let Some(compile) = &lang.compile else {
            return Ok(CompiledBinary {
                exec: resolve(&lang.run, source, source),
                artifact: None,
            });
        };

        let binary = artifact_path(source);
        let spec = resolve(compile, source, &binary);
        info!(
            language = %lang.id,
            source = %source.display(),
            program = %spec.program,
            "compiling solution"
        );

        let output = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to spawn compiler: {}", spec.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            warn!(
                language = %lang.id,
                source = %source.display(),
                error_preview = stderr.lines().next().unwrap_or(""),
                "compilation failed"
            );
            bail!("Compilation failed:\n{}", stderr.trim_end());
        }

        debug!(binary = %binary.display(), "compilation succeeded");
        Ok(CompiledBinary {
            exec: resolve(&lang.run, source, &binary),
            artifact: Some(binary),
        })
    }
}
