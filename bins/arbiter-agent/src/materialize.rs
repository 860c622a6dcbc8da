// Turns accepted payloads into materialized problems on disk: fresh test
// ids, workspace path layout, contest folder lifecycle, and the persistence
// collaborator boundary.
use crate::config::Settings;
use anyhow::{bail, Context, Result};
use arbiter_common::events::UiEvent;
use arbiter_common::types::{CompanionPayload, Problem};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

/// Persistence collaborator. Called once per materialized problem, never
/// concurrently for the same path.
pub trait ProblemStore: Send + Sync {
    fn save<'a>(&'a self, path: &'a Path, problem: &'a Problem) -> BoxFuture<'a, Result<()>>;
}

/// Directory, next to the source files, that holds problem metadata.
pub const METADATA_DIR: &str = ".arbiter";

/// Filesystem store: the source file (created empty when absent, so an
/// editor template collaborator can fill it later) plus a metadata document
/// under [`METADATA_DIR`].
pub struct FsStore;

impl FsStore {
    pub fn metadata_path(source_path: &Path) -> PathBuf {
        let stem = source_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "problem".to_string());
        let dir = source_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        dir.join(METADATA_DIR).join(format!("{}.prob.json", stem))
    }
}

impl ProblemStore for FsStore {
    fn save<'a>(&'a self, path: &'a Path, problem: &'a Problem) -> BoxFuture<'a, Result<()>> {
        async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                // Re-pushing a problem must not clobber user edits.
                info!(path = %path.display(), "source file already exists, keeping it");
            } else {
                tokio::fs::write(path, b"")
                    .await
                    .with_context(|| format!("Failed to create {}", path.display()))?;
            }

            let meta_path = Self::metadata_path(path);
            if let Some(parent) = meta_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let doc = serde_json::to_vec_pretty(problem).context("Failed to encode problem")?;
            tokio::fs::write(&meta_path, doc)
                .await
                .with_context(|| format!("Failed to write {}", meta_path.display()))?;
            Ok(())
        }
        .boxed()
    }
}

/// Collapse a problem name into a safe file stem.
pub fn sanitize(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let stem = stem.trim_matches('_').to_string();
    if stem.is_empty() {
        "problem".to_string()
    } else {
        stem
    }
}

/// Everything a materialization unit needs; cheap to clone into sequencer
/// chains.
#[derive(Clone)]
pub struct MaterializeCtx {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn ProblemStore>,
    pub events: UnboundedSender<UiEvent>,
}

impl MaterializeCtx {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn ProblemStore>,
        events: UnboundedSender<UiEvent>,
    ) -> Self {
        Self {
            settings,
            store,
            events,
        }
    }

    fn source_path(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        let lang = self.settings.language(&self.settings.default_language)?;
        Ok(dir.join(format!("{}.{}", sanitize(name), lang.file_extension)))
    }

    /// Materialize one payload into `dir`.
    pub async fn commit_into(&self, dir: &Path, payload: CompanionPayload) -> Result<Problem> {
        let mut problem = Problem::from_payload(payload);
        problem.source_path = self.source_path(dir, &problem.name)?;
        self.store
            .save(&problem.source_path, &problem)
            .await
            .with_context(|| format!("Failed to materialize {}", problem.name))?;
        info!(
            problem = %problem.name,
            path = %problem.source_path.display(),
            tests = problem.tests.len(),
            "materialized problem"
        );
        let _ = self.events.send(UiEvent::NewProblem {
            name: problem.name.clone(),
        });
        Ok(problem)
    }

    /// Materialize a standalone (non-contest) problem into the workspace
    /// root.
    pub async fn commit(&self, payload: CompanionPayload) -> Result<Problem> {
        let root = self.settings.workspace_root.clone();
        self.commit_into(&root, payload).await
    }

    pub fn contest_dir(&self, contest_id: &str) -> PathBuf {
        self.settings
            .workspace_root
            .join(format!("contest-{}", contest_id))
    }

    /// Materialize one individually pushed member of a contest. Creates the
    /// contest folder when missing, without the destructive-reinit check;
    /// that check belongs to explicit contest initialization.
    pub async fn commit_contest_member(
        &self,
        contest_id: &str,
        payload: CompanionPayload,
    ) -> Result<Problem> {
        let dir = self.contest_dir(contest_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        self.commit_into(&dir, payload).await
    }

    /// Materialize a resolved collection session, in collection order, into
    /// a freshly initialized contest folder.
    pub async fn commit_contest(
        &self,
        contest_id: &str,
        payloads: Vec<CompanionPayload>,
    ) -> Result<Vec<Problem>> {
        let dir = self.contest_dir(contest_id);
        self.init_contest_dir(&dir).await?;
        let mut problems = Vec::with_capacity(payloads.len());
        for payload in payloads {
            problems.push(self.commit_into(&dir, payload).await?);
        }
        info!(contest_id = %contest_id, problems = problems.len(), "contest materialized");
        Ok(problems)
    }

    async fn init_contest_dir(&self, dir: &Path) -> Result<()> {
        if tokio::fs::try_exists(dir).await.unwrap_or(false) {
            if !self.settings.allow_reinit {
                bail!(
                    "Contest folder {} already exists; reinitialization declined",
                    dir.display()
                );
            }
            warn!(dir = %dir.display(), "reinitializing existing contest folder");
            tokio::fs::remove_dir_all(dir)
                .await
                .with_context(|| format!("Failed to clear {}", dir.display()))?;
        }
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_common::types::PayloadTest;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn payload(name: &str, url: &str) -> CompanionPayload {
        CompanionPayload {
            name: name.to_string(),
            url: url.to_string(),
            interactive: false,
            memory_limit: 1024,
            time_limit: 3000,
            group: String::new(),
            tests: vec![PayloadTest {
                input: "1 2".to_string(),
                output: "3".to_string(),
            }],
            batch: None,
        }
    }

    fn ctx() -> (MaterializeCtx, mpsc::UnboundedReceiver<UiEvent>, PathBuf) {
        let root = std::env::temp_dir().join(format!("arbiter-mat-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        let settings = Arc::new(Settings {
            workspace_root: root.clone(),
            ..Settings::default()
        });
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MaterializeCtx::new(settings, Arc::new(FsStore), tx),
            rx,
            root,
        )
    }

    #[test]
    fn sanitize_keeps_only_alphanumerics() {
        assert_eq!(sanitize("A. Sum of Two"), "A__Sum_of_Two");
        assert_eq!(sanitize("..."), "problem");
        assert_eq!(sanitize("B"), "B");
    }

    #[tokio::test]
    async fn commit_writes_source_and_metadata() {
        let (ctx, mut rx, root) = ctx();
        let problem = ctx
            .commit(payload(
                "A. Sum",
                "https://judge.example/contest/2167/problem/A",
            ))
            .await
            .unwrap();

        assert_eq!(problem.source_path, root.join("A__Sum.cpp"));
        assert!(problem.source_path.exists());
        let meta_path = FsStore::metadata_path(&problem.source_path);
        let doc = std::fs::read_to_string(meta_path).unwrap();
        let stored: Problem = serde_json::from_str(&doc).unwrap();
        assert_eq!(stored.name, "A. Sum");
        assert_eq!(stored.tests.len(), 1);
        assert_eq!(stored.tests[0].id, problem.tests[0].id);

        assert!(matches!(
            rx.try_recv().unwrap(),
            UiEvent::NewProblem { .. }
        ));
    }

    #[tokio::test]
    async fn recommit_keeps_an_edited_source_file() {
        let (ctx, _rx, _root) = ctx();
        let p = payload("A", "https://judge.example/contest/1/problem/A");
        let first = ctx.commit(p.clone()).await.unwrap();
        std::fs::write(&first.source_path, "int main() {}").unwrap();
        ctx.commit(p).await.unwrap();
        let kept = std::fs::read_to_string(&first.source_path).unwrap();
        assert_eq!(kept, "int main() {}");
    }

    #[tokio::test]
    async fn contest_batch_lands_in_the_contest_folder_in_order() {
        let (ctx, _rx, root) = ctx();
        let problems = ctx
            .commit_contest(
                "2167",
                vec![
                    payload("A", "https://judge.example/contest/2167/problem/A"),
                    payload("B", "https://judge.example/contest/2167/problem/B"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(problems.len(), 2);
        assert_eq!(problems[0].name, "A");
        assert!(root.join("contest-2167").join("A.cpp").exists());
        assert!(root.join("contest-2167").join("B.cpp").exists());
    }

    #[tokio::test]
    async fn existing_contest_folder_aborts_cleanly_when_reinit_is_declined() {
        let (ctx, _rx, root) = ctx();
        let dir = root.join("contest-2167");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("keep.cpp"), "precious").unwrap();

        let err = ctx
            .commit_contest(
                "2167",
                vec![payload("A", "https://judge.example/contest/2167/problem/A")],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        // Declining leaves no partial state behind.
        assert_eq!(std::fs::read_to_string(dir.join("keep.cpp")).unwrap(), "precious");
        assert!(!dir.join("A.cpp").exists());
    }

    #[tokio::test]
    async fn allow_reinit_replaces_the_contest_folder() {
        let (ctx, _rx, root) = ctx();
        let mut settings = (*ctx.settings).clone();
        settings.allow_reinit = true;
        let ctx = MaterializeCtx::new(Arc::new(settings), ctx.store.clone(), ctx.events.clone());

        let dir = root.join("contest-2167");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stale.cpp"), "old").unwrap();

        ctx.commit_contest(
            "2167",
            vec![payload("A", "https://judge.example/contest/2167/problem/A")],
        )
        .await
        .unwrap();
        assert!(!dir.join("stale.cpp").exists());
        assert!(dir.join("A.cpp").exists());
    }

    #[tokio::test]
    async fn contest_member_creates_the_folder_without_reinit() {
        let (ctx, _rx, root) = ctx();
        ctx.commit_contest_member(
            "2167",
            payload("A", "https://judge.example/contest/2167/problem/A"),
        )
        .await
        .unwrap();
        // A second member must not trip the reinit check.
        ctx.commit_contest_member(
            "2167",
            payload("B", "https://judge.example/contest/2167/problem/B"),
        )
        .await
        .unwrap();
        assert!(root.join("contest-2167").join("A.cpp").exists());
        assert!(root.join("contest-2167").join("B.cpp").exists());
    }
}
