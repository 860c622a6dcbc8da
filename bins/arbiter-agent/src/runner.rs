/// Run controller.
///
/// Owns run/stop state and drives compile → judge over a problem's ordered
/// test list. One run at a time: a second run-all while one is in flight is
/// a logged no-op. The first failing test halts iteration; remaining tests
/// are not executed. The compiled binary is released on every terminal path.
use crate::compiler::Compiler;
use crate::config::Settings;
use crate::judge::{self, OutputChecker};
use anyhow::{bail, Result};
use arbiter_common::events::UiEvent;
use arbiter_common::types::{Problem, RunReport, RunResult, Verdict};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};
use uuid::Uuid;

pub struct RunController {
    settings: Arc<Settings>,
    compiler: Compiler,
    checker: Arc<dyn OutputChecker>,
    events: UnboundedSender<UiEvent>,
    busy: AtomicBool,
    stop_requested: AtomicBool,
}

impl RunController {
    pub fn new(
        settings: Arc<Settings>,
        checker: Arc<dyn OutputChecker>,
        events: UnboundedSender<UiEvent>,
    ) -> Self {
        Self {
            compiler: Compiler::new(settings.clone()),
            settings,
            checker,
            events,
            busy: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: UiEvent) {
        // The UI collaborator may not be listening; that is its problem.
        let _ = self.events.send(event);
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Ask the in-flight run to halt. Best-effort: the flag is observed
    /// between test cases; an already-spawned process runs to its own time
    /// limit.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Compile once and run every test in order, stopping on the first
    /// failure. Returns `None` when a run is already in progress or the
    /// problem cannot be judged at all.
    pub async fn run_all(&self, problem: &Problem) -> Option<RunReport> {
        if problem.interactive {
            warn!(problem = %problem.name, "interactive problems are not judged");
            self.emit(UiEvent::Error {
                message: format!("{} is interactive; test it manually", problem.name),
            });
            return None;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(problem = %problem.name, "a run is already in progress, ignoring");
            return None;
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        let report = self.run_all_inner(problem).await;
        self.busy.store(false, Ordering::SeqCst);

        match report.verdict {
            Verdict::Pass => self.emit(UiEvent::StatusYay {
                problem: problem.name.clone(),
            }),
            Verdict::Fail => self.emit(UiEvent::StatusNay {
                problem: problem.name.clone(),
            }),
        }
        info!(
            problem = %problem.name,
            verdict = ?report.verdict,
            tests_run = report.results.len(),
            stopped = report.stopped,
            "run finished"
        );
        Some(report)
    }

    async fn run_all_inner(&self, problem: &Problem) -> RunReport {
        self.emit(UiEvent::CompilingStart {
            problem: problem.name.clone(),
        });
        let compiled = self.compile(problem).await;
        self.emit(UiEvent::CompilingStop {
            problem: problem.name.clone(),
        });

        let binary = match compiled {
            Ok(binary) => binary,
            Err(e) => {
                warn!(problem = %problem.name, error = %e, "compilation failed, no test executed");
                return RunReport {
                    problem: problem.name.clone(),
                    verdict: Verdict::Fail,
                    first_failure: None,
                    compile_error: Some(e.to_string()),
                    stopped: false,
                    results: Vec::new(),
                };
            }
        };

        let mut results = Vec::new();
        let mut first_failure = None;
        let mut stopped = false;

        for test in &problem.tests {
            if self.stop_requested.load(Ordering::SeqCst) {
                info!(problem = %problem.name, "stop requested, halting run");
                stopped = true;
                break;
            }
            self.emit(UiEvent::Running {
                problem: problem.name.clone(),
                test_id: test.id,
            });
            match judge::evaluate(
                &binary.exec,
                test,
                Duration::from_millis(problem.time_limit),
                self.settings.stderr_fails,
                self.checker.as_ref(),
            )
            .await
            {
                Ok(result) => {
                    let failed = result.verdict == Verdict::Fail;
                    results.push(result);
                    if failed {
                        first_failure = Some(test.id);
                        break;
                    }
                }
                Err(e) => {
                    // Could not even run the process; counts as the first
                    // failure.
                    warn!(problem = %problem.name, test_id = %test.id, error = %e, "test execution failed");
                    first_failure = Some(test.id);
                    break;
                }
            }
        }

        binary.release().await;

        let verdict = if first_failure.is_none() && !stopped {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
        RunReport {
            problem: problem.name.clone(),
            verdict,
            first_failure,
            compile_error: None,
            stopped,
            results,
        }
    }

    /// Judge a single test by id without advancing run-all state. An unknown
    /// id is a local error, logged, not a controller-state change.
    pub async fn run_single(&self, problem: &Problem, test_id: Uuid) -> Result<RunResult> {
        let Some(test) = problem.test(test_id) else {
            warn!(problem = %problem.name, %test_id, "unknown test id");
            bail!("No test with id {} in {}", test_id, problem.name);
        };

        self.emit(UiEvent::CompilingStart {
            problem: problem.name.clone(),
        });
        let compiled = self.compile(problem).await;
        self.emit(UiEvent::CompilingStop {
            problem: problem.name.clone(),
        });
        let binary = compiled?;

        self.emit(UiEvent::Running {
            problem: problem.name.clone(),
            test_id,
        });
        let result = judge::evaluate(
            &binary.exec,
            test,
            Duration::from_millis(problem.time_limit),
            self.settings.stderr_fails,
            self.checker.as_ref(),
        )
        .await;
        binary.release().await;
        result
    }

    async fn compile(&self, problem: &Problem) -> Result<crate::compiler::CompiledBinary> {
        let lang = self.settings.language_for_path(&problem.source_path)?;
        self.compiler.compile(&lang.id, &problem.source_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandSpec, LanguageSpec, Timing};
    use crate::judge::LineChecker;
    use arbiter_common::types::TestCase;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn sh_settings() -> Arc<Settings> {
        Arc::new(Settings {
            languages: vec![LanguageSpec {
                id: "sh".to_string(),
                name: "Shell".to_string(),
                file_extension: "sh".to_string(),
                compile: None,
                run: CommandSpec {
                    program: "sh".to_string(),
                    args: vec!["{source}".to_string()],
                },
            }],
            default_language: "sh".to_string(),
            timing: Timing::default(),
            ..Settings::default()
        })
    }

    fn failing_compile_settings() -> Arc<Settings> {
        Arc::new(Settings {
            languages: vec![LanguageSpec {
                id: "sh".to_string(),
                name: "Shell".to_string(),
                file_extension: "sh".to_string(),
                compile: Some(CommandSpec {
                    program: "sh".to_string(),
                    args: vec!["-c".to_string(), "echo nope >&2; exit 2".to_string()],
                }),
                run: CommandSpec {
                    program: "{binary}".to_string(),
                    args: vec![],
                },
            }],
            default_language: "sh".to_string(),
            ..Settings::default()
        })
    }

    fn echo_solution() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("arbiter-runner-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("solve.sh");
        std::fs::write(&path, "cat\n").unwrap();
        path
    }

    fn problem(tests: Vec<TestCase>) -> Problem {
        Problem {
            name: "A. Sum".to_string(),
            url: "https://judge.example/contest/1/problem/A".to_string(),
            interactive: false,
            memory_limit: 1024,
            time_limit: 5000,
            group: "local".to_string(),
            tests,
            source_path: echo_solution(),
            fetched_at: chrono_now(),
        }
    }

    fn chrono_now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }

    fn controller(settings: Arc<Settings>) -> (Arc<RunController>, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(RunController::new(settings, Arc::new(LineChecker), tx)),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn first_failure_halts_the_run() {
        // The solution echoes its input, so pass/fail is controlled by the
        // expected outputs: pass, fail, pass.
        let tests = vec![
            TestCase::fetched("a", "a"),
            TestCase::fetched("b", "X"),
            TestCase::fetched("c", "c"),
        ];
        let failing = tests[1].id;
        let (controller, mut rx) = controller(sh_settings());
        let report = controller.run_all(&problem(tests)).await.unwrap();

        assert_eq!(report.verdict, Verdict::Fail);
        assert_eq!(report.first_failure, Some(failing));
        assert_eq!(report.results.len(), 2, "third test must never execute");

        let events = drain(&mut rx);
        let running: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, UiEvent::Running { .. }))
            .collect();
        assert_eq!(running.len(), 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, UiEvent::StatusNay { .. })));
    }

    #[tokio::test]
    async fn all_passing_tests_yield_pass() {
        let tests = vec![TestCase::fetched("a", "a"), TestCase::fetched("b", "b")];
        let (controller, mut rx) = controller(sh_settings());
        let report = controller.run_all(&problem(tests)).await.unwrap();
        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.first_failure, None);
        assert_eq!(report.results.len(), 2);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, UiEvent::StatusYay { .. })));
    }

    #[tokio::test]
    async fn compile_failure_aborts_without_running_tests() {
        let tests = vec![TestCase::fetched("a", "a")];
        let (controller, mut rx) = controller(failing_compile_settings());
        let report = controller.run_all(&problem(tests)).await.unwrap();
        assert_eq!(report.verdict, Verdict::Fail);
        assert!(report.results.is_empty());
        assert!(report.compile_error.unwrap().contains("nope"));
        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, UiEvent::Running { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, UiEvent::CompilingStop { .. })));
    }

    #[tokio::test]
    async fn overlapping_run_all_is_a_noop() {
        let tests = vec![TestCase::fetched("a", "a")];
        let p = problem(tests);
        let (controller, _rx) = controller(sh_settings());
        let (first, second) = tokio::join!(controller.run_all(&p), controller.run_all(&p));
        assert_eq!(
            first.is_some() as u8 + second.is_some() as u8,
            1,
            "exactly one of the overlapping runs must proceed"
        );
    }

    #[tokio::test]
    async fn run_single_with_unknown_id_leaves_state_alone() {
        let tests = vec![TestCase::fetched("a", "a")];
        let p = problem(tests);
        let (controller, _rx) = controller(sh_settings());
        assert!(controller.run_single(&p, Uuid::new_v4()).await.is_err());
        assert!(!controller.is_running());
        // A normal run still works afterwards.
        let report = controller.run_all(&p).await.unwrap();
        assert_eq!(report.verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn run_single_judges_exactly_one_test() {
        let tests = vec![TestCase::fetched("a", "a"), TestCase::fetched("b", "X")];
        let p = problem(tests);
        let wrong = p.tests[1].id;
        let (controller, _rx) = controller(sh_settings());
        let result = controller.run_single(&p, wrong).await.unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.test_id, wrong);
    }

    #[tokio::test]
    async fn interactive_problems_are_refused() {
        let mut p = problem(vec![TestCase::fetched("a", "a")]);
        p.interactive = true;
        let (controller, mut rx) = controller(sh_settings());
        assert!(controller.run_all(&p).await.is_none());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, UiEvent::Error { .. })));
    }

    #[tokio::test]
    async fn stop_halts_between_tests() {
        // Each test sleeps briefly; stopping mid-run must leave later tests
        // unexecuted and flag the report.
        let dir = std::env::temp_dir().join(format!("arbiter-runner-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("slow.sh");
        std::fs::write(&path, "sleep 0.2; cat\n").unwrap();

        let mut p = problem(vec![
            TestCase::fetched("a", "a"),
            TestCase::fetched("b", "b"),
            TestCase::fetched("c", "c"),
        ]);
        p.source_path = path;

        let (controller, _rx) = controller(sh_settings());
        let handle = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run_all(&p).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.stop();
        let report = handle.await.unwrap().unwrap();
        assert!(report.stopped);
        assert_eq!(report.verdict, Verdict::Fail);
        assert!(report.results.len() < 3);
    }
}
