use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Group marker for problems that were not pushed as part of a contest.
pub const LOCAL_GROUP: &str = "local";

pub fn default_memory_limit() -> u32 {
    1024
}

pub fn default_time_limit() -> u64 {
    3000
}

/// Where a test case came from. Fetched cases belong to the problem statement
/// and cannot be deleted; user-added cases can.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOrigin {
    Fetched,
    UserAdded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: Uuid,
    pub input: String,
    pub expected_output: String,
    pub origin: TestOrigin,
}

impl TestCase {
    /// A statement-supplied case. Ids are generated here and never reused
    /// from upstream payloads.
    pub fn fetched(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            input: input.into(),
            expected_output: expected_output.into(),
            origin: TestOrigin::Fetched,
        }
    }

    pub fn user_added(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            input: input.into(),
            expected_output: expected_output.into(),
            origin: TestOrigin::UserAdded,
        }
    }

    pub fn deletable(&self) -> bool {
        self.origin == TestOrigin::UserAdded
    }
}

/// A problem materialized to the workspace. `source_path` is empty until the
/// backing file exists on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u32,
    #[serde(default = "default_time_limit")]
    pub time_limit: u64,
    pub group: String,
    pub tests: Vec<TestCase>,
    #[serde(default)]
    pub source_path: PathBuf,
    pub fetched_at: DateTime<Utc>,
}

impl Problem {
    /// Convert a raw payload into a problem. Every test case gets a freshly
    /// generated id; upstream ids are never trusted.
    pub fn from_payload(payload: CompanionPayload) -> Self {
        let group = if payload.group.is_empty() {
            LOCAL_GROUP.to_string()
        } else {
            payload.group
        };
        Self {
            name: payload.name,
            url: payload.url,
            interactive: payload.interactive,
            memory_limit: payload.memory_limit,
            time_limit: payload.time_limit,
            group,
            tests: payload
                .tests
                .into_iter()
                .map(|t| TestCase::fetched(t.input, t.output))
                .collect(),
            source_path: PathBuf::new(),
            fetched_at: Utc::now(),
        }
    }

    pub fn test(&self, id: Uuid) -> Option<&TestCase> {
        self.tests.iter().find(|t| t.id == id)
    }
}

/// Raw problem data as pushed over the ingestion channel, prior to
/// conversion into a [`Problem`]. Upstream omits fields freely, so every
/// field carries a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanionPayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u32,
    #[serde(default = "default_time_limit")]
    pub time_limit: u64,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub tests: Vec<PayloadTest>,
    /// Informational only; correctness never depends on it.
    #[serde(default)]
    pub batch: Option<BatchInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadTest {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub size: usize,
}

/// The process-wide pending submission slot, echoed back to the out-of-band
/// submission client. At most one record exists at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSubmission {
    pub url: String,
    pub problem_name: String,
    pub source_code: String,
    pub language_id: i64,
}

impl PendingSubmission {
    /// Wire shape for the companion response body: `{"empty":true}` when the
    /// slot is vacant, the record plus `"empty":false` otherwise.
    pub fn echo(slot: Option<&Self>) -> serde_json::Value {
        match slot {
            None => serde_json::json!({ "empty": true }),
            Some(record) => serde_json::json!({
                "empty": false,
                "url": record.url,
                "problemName": record.problem_name,
                "sourceCode": record.source_code,
                "languageId": record.language_id,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Outcome of running one compiled binary against one test case.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub test_id: Uuid,
    pub verdict: Verdict,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Problem-level aggregate for a run-all invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub problem: String,
    pub verdict: Verdict,
    /// First failing test, if any. Iteration halts here.
    pub first_failure: Option<Uuid>,
    pub compile_error: Option<String>,
    pub stopped: bool,
    pub results: Vec<RunResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(name: &str, url: &str) -> CompanionPayload {
        CompanionPayload {
            name: name.to_string(),
            url: url.to_string(),
            interactive: false,
            memory_limit: default_memory_limit(),
            time_limit: default_time_limit(),
            group: String::new(),
            tests: vec![PayloadTest {
                input: "1 2".to_string(),
                output: "3".to_string(),
            }],
            batch: None,
        }
    }

    #[test]
    fn payload_defaults_fill_missing_fields() {
        let parsed: CompanionPayload =
            serde_json::from_str(r#"{"name":"A. Sum","url":"https://judge.example/contest/1/problem/A"}"#)
                .unwrap();
        assert_eq!(parsed.name, "A. Sum");
        assert_eq!(parsed.memory_limit, 1024);
        assert_eq!(parsed.time_limit, 3000);
        assert!(parsed.tests.is_empty());
        assert!(parsed.batch.is_none());
    }

    #[test]
    fn payload_reads_camel_case_limits() {
        let parsed: CompanionPayload = serde_json::from_str(
            r#"{"name":"B","url":"u","memoryLimit":256,"timeLimit":1000,"tests":[{"input":"x","output":"y"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.memory_limit, 256);
        assert_eq!(parsed.time_limit, 1000);
        assert_eq!(parsed.tests.len(), 1);
    }

    #[test]
    fn from_payload_generates_fresh_test_ids() {
        let a = Problem::from_payload(payload("A. Sum", "https://judge.example/contest/1/problem/A"));
        let b = Problem::from_payload(payload("A. Sum", "https://judge.example/contest/1/problem/A"));
        assert_eq!(a.tests.len(), 1);
        assert_ne!(a.tests[0].id, b.tests[0].id);
        assert_eq!(a.tests[0].origin, TestOrigin::Fetched);
        assert!(a.source_path.as_os_str().is_empty());
    }

    #[test]
    fn from_payload_defaults_group_to_local_marker() {
        let p = Problem::from_payload(payload("A", "u"));
        assert_eq!(p.group, LOCAL_GROUP);
    }

    #[test]
    fn only_user_added_tests_are_deletable() {
        assert!(!TestCase::fetched("i", "o").deletable());
        assert!(TestCase::user_added("i", "o").deletable());
    }

    #[test]
    fn submission_echo_shapes() {
        assert_eq!(
            PendingSubmission::echo(None),
            serde_json::json!({ "empty": true })
        );
        let record = PendingSubmission {
            url: "https://judge.example/contest/1/problem/A".to_string(),
            problem_name: "A. Sum".to_string(),
            source_code: "int main() {}".to_string(),
            language_id: 54,
        };
        let echoed = PendingSubmission::echo(Some(&record));
        assert_eq!(echoed["empty"], false);
        assert_eq!(echoed["problemName"], "A. Sum");
        assert_eq!(echoed["languageId"], 54);
    }
}
