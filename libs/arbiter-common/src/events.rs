use serde::Serialize;
use uuid::Uuid;

/// Commands emitted to the editor-facing UI channel. The channel is
/// one-directional: the core never consumes responses on it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum UiEvent {
    NewProblem { name: String },
    Running { problem: String, test_id: Uuid },
    StatusYay { problem: String },
    StatusNay { problem: String },
    CompilingStart { problem: String },
    CompilingStop { problem: String },
    SubmitFinished,
    Error { message: String },
}
