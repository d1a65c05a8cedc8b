//! AgenticLoop-W: drives a bounded multi-turn conversation against
//! [`crate::engine::EngineW`] where each turn may produce text only, or one
//! or more tool calls the loop resolves locally and feeds back as
//! tool-results on the next turn.
//!
//! Local tool dispatch runs against whatever [`crate::wire::WireEventW::ToolCall`]
//! actually carries, which is only a recognized command *name* — the
//! upstream protobuf schema is not decoded deeply enough to recover full
//! arguments. Local handlers run against the session's working directory
//! where that alone is sufficient (`ls`, `find`); commands that need an
//! argument the wire format doesn't carry (`cat`, `grep`) surface as a
//! captured tool-execution error rather than guessing one.

use crate::error::{Error, Result};
use crate::model::{ContentPart, Message, ToolResultStatus};
use crate::session::Session;
use crate::wire::WireEventW;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use uuid::Uuid;

/// Default bound on tool-execution iterations.
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// Timeout for local tool execution.
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Local tool names the dispatcher recognizes.
const ALLOWED_COMMANDS: &[&str] = &["ls", "cat", "grep", "find"];

/// Knobs controlling one [`run`] invocation.
#[derive(Debug, Clone)]
pub struct AgenticLoopConfig {
    pub max_iterations: u32,
    pub auto_execute_tools: bool,
    /// Unrestricted local execution is the minimum acceptable policy, not a
    /// good one. Default `false` restricts the generic `shell` command to an
    /// explicit opt-in; the allowlisted single-binary commands (`ls`, `cat`,
    /// `grep`, `find`) are always available regardless of this flag.
    pub permit_raw_shell: bool,
}

impl Default for AgenticLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            auto_execute_tools: true,
            permit_raw_shell: false,
        }
    }
}

/// One local tool invocation and its outcome, as surfaced to the caller of
/// [`run`] alongside the aggregated text.
#[derive(Debug, Clone)]
pub struct ExecutedToolCall {
    pub call_id: String,
    pub command: String,
    pub output: Value,
}

/// Outcome of a full [`run`] invocation.
#[derive(Debug, Clone)]
pub struct AgenticLoopResult {
    pub text: String,
    pub tool_calls: Vec<ExecutedToolCall>,
    pub max_iterations_reached: bool,
}

/// Seam between [`run`] and the transport, so the bounded-iteration and
/// tool-dispatch logic can be tested without a live `EngineW`/HTTP round
/// trip. [`crate::engine::EngineW`] implements this directly over
/// `send_session`.
#[async_trait]
pub trait TurnSource {
    async fn send_turn(&self, session: &Session, access_token: &str) -> Result<Vec<WireEventW>>;
}

#[async_trait]
impl TurnSource for crate::engine::EngineW {
    async fn send_turn(&self, session: &Session, access_token: &str) -> Result<Vec<WireEventW>> {
        self.send_session(session, access_token).await
    }
}

/// Run the agentic loop for one new user query.
///
/// Rotates the session's `turn-id` once for this query and keeps it stable
/// across every internal tool-execution iteration the query triggers;
/// `cascade-id` is untouched and stays stable across the whole session.
pub async fn run<E: TurnSource + ?Sized>(
    engine: &E,
    session: &mut Session,
    user_query: impl Into<String>,
    access_token: &str,
    config: &AgenticLoopConfig,
) -> Result<AgenticLoopResult> {
    session.start_new_turn();
    session.push_message(Message::user(user_query.into()));

    let mut aggregated_text = String::new();
    let mut trail = Vec::new();
    let mut iteration = 0u32;

    loop {
        let events = engine.send_turn(session, access_token).await?;

        let mut turn_text = String::new();
        let mut tool_calls = Vec::new();
        for event in events {
            match event {
                WireEventW::AgentText(text) => turn_text.push_str(&text),
                WireEventW::ToolCall { call_id, command } => tool_calls.push((call_id, command)),
                WireEventW::Reasoning(text) => {
                    tracing::debug!(text, "dropping reasoning event from agentic loop");
                }
            }
        }

        if !turn_text.is_empty() {
            session.push_message(Message::assistant(turn_text.clone()));
            aggregated_text.push_str(&turn_text);
        }

        if tool_calls.is_empty() {
            return Ok(AgenticLoopResult {
                text: aggregated_text,
                tool_calls: trail,
                max_iterations_reached: false,
            });
        }

        if !config.auto_execute_tools {
            return Ok(AgenticLoopResult {
                text: aggregated_text,
                tool_calls: trail,
                max_iterations_reached: false,
            });
        }

        iteration += 1;

        // Tool calls within one iteration are executed sequentially in
        // upstream-emitted order, and their results are submitted in the
        // same order on the next iteration.
        for (call_id, command) in tool_calls {
            let call_id = call_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let outcome = execute_local_tool(&command, &session.context.working_dir, config).await;

            let (status, payload) = match outcome {
                Ok(value) => (ToolResultStatus::Success, value),
                // Tool execution errors are captured as the tool-result
                // payload, never abort the loop.
                Err(err) => (ToolResultStatus::Error, json!({ "error": err.to_string() })),
            };

            session.push_message(Message::user_parts(vec![ContentPart::ToolResult {
                id: call_id.clone(),
                status,
                payload: payload.clone(),
            }]));
            trail.push(ExecutedToolCall { call_id, command, output: payload });
        }

        if iteration >= config.max_iterations {
            return Ok(AgenticLoopResult {
                text: aggregated_text,
                tool_calls: trail,
                max_iterations_reached: true,
            });
        }
    }
}

/// Dispatch one recognized command (ls, cat, grep, find, or generic shell)
/// to its local handler. Never returns an upstream-facing error type for
/// execution failures — callers capture the `Err` into the tool-result
/// payload.
async fn execute_local_tool(command: &str, working_dir: &str, config: &AgenticLoopConfig) -> Result<Value> {
    match command {
        "ls" => run_subprocess("ls", &[working_dir.to_string()]).await,
        "find" => run_subprocess("find", &[working_dir.to_string()]).await,
        "cat" | "grep" => Err(Error::tool(format!(
            "{command}: no target argument was recoverable from the decoded wire event"
        ))),
        "shell" if config.permit_raw_shell => Err(Error::tool(
            "no command text was recoverable from the decoded wire event",
        )),
        "shell" => Err(Error::tool(
            "generic shell execution is disabled by default (see AgenticLoopConfig::permit_raw_shell)",
        )),
        other if !ALLOWED_COMMANDS.contains(&other) => {
            Err(Error::tool(format!("'{other}' is not on the local tool allowlist")))
        }
        other => Err(Error::tool(format!("unsupported tool: {other}"))),
    }
}

/// Spawn `program` with `args`, capturing stdout/stderr under the tool
/// execution timeout, inheriting the parent process environment.
async fn run_subprocess(program: &str, args: &[String]) -> Result<Value> {
    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = timeout(TOOL_TIMEOUT, command.output())
        .await
        .map_err(|_| Error::tool(format!("{program}: execution timed out after {}s", TOOL_TIMEOUT.as_secs())))?
        .map_err(|e| Error::tool(format!("{program}: failed to spawn: {e}")))?;

    Ok(json!({
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
        "exit_code": output.status.code(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionContext;
    use std::sync::Mutex;

    /// A canned, deterministic [`TurnSource`] for loop-shape tests.
    struct FakeTurns {
        rounds: Mutex<Vec<Vec<WireEventW>>>,
    }

    impl FakeTurns {
        fn new(rounds: Vec<Vec<WireEventW>>) -> Self {
            Self { rounds: Mutex::new(rounds) }
        }
    }

    #[async_trait]
    impl TurnSource for FakeTurns {
        async fn send_turn(&self, _session: &Session, _access_token: &str) -> Result<Vec<WireEventW>> {
            let mut rounds = self.rounds.lock().unwrap();
            if !rounds.is_empty() {
                return Ok(rounds.remove(0));
            }
            Ok(Vec::new())
        }
    }

    fn session() -> Session {
        Session::new("model-w", SessionContext::default())
    }

    #[tokio::test]
    async fn test_text_only_response_completes_without_tool_calls() {
        let source = FakeTurns::new(vec![vec![WireEventW::AgentText("hello there".to_string())]]);
        let mut session = session();
        let config = AgenticLoopConfig::default();

        let result = run(&source, &mut session, "hi", "token", &config).await.unwrap();
        assert_eq!(result.text, "hello there");
        assert!(result.tool_calls.is_empty());
        assert!(!result.max_iterations_reached);
    }

    #[tokio::test]
    async fn test_tool_call_then_text_appends_one_tool_result_and_completes() {
        let source = FakeTurns::new(vec![
            vec![WireEventW::ToolCall {
                call_id: Some("call_abc".to_string()),
                command: "ls".to_string(),
            }],
            vec![WireEventW::AgentText("done".to_string())],
        ]);
        let mut session = session();
        let config = AgenticLoopConfig::default();

        let result = run(&source, &mut session, "list files", "token", &config).await.unwrap();
        assert_eq!(result.text, "done");
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].call_id, "call_abc");
        assert!(!result.max_iterations_reached);

        // One ToolResult content part should have been appended to the session.
        let has_tool_result = session.messages.iter().any(|m| {
            matches!(&m.content, crate::model::Content::Parts(parts)
                if parts.iter().any(|p| matches!(p, ContentPart::ToolResult { .. })))
        });
        assert!(has_tool_result);
    }

    #[tokio::test]
    async fn test_bounded_at_max_iterations_with_trail_length_matching() {
        // A provider emitting `call_X ls` every round terminates at
        // iteration 20 with `max_iterations_reached=true` and 20 tool-result
        // messages appended.
        let event = WireEventW::ToolCall { call_id: Some("call_x".to_string()), command: "ls".to_string() };
        let source = FakeTurns::new(
            std::iter::repeat(vec![event]).take(25).collect(),
        );
        let mut session = session();
        let config = AgenticLoopConfig { max_iterations: 20, ..Default::default() };

        let result = run(&source, &mut session, "loop forever", "token", &config).await.unwrap();
        assert!(result.max_iterations_reached);
        assert_eq!(result.tool_calls.len(), 20);

        let tool_result_count = session
            .messages
            .iter()
            .filter(|m| {
                matches!(&m.content, crate::model::Content::Parts(parts)
                    if parts.iter().any(|p| matches!(p, ContentPart::ToolResult { .. })))
            })
            .count();
        assert_eq!(tool_result_count, 20);
    }

    #[tokio::test]
    async fn test_turn_id_rotates_once_per_run_cascade_id_stable() {
        let source = FakeTurns::new(vec![vec![WireEventW::AgentText("ok".to_string())]]);
        let mut session = session();
        let cascade_before = session.cascade_id.clone();
        let turn_before = session.turn_id.clone();
        let config = AgenticLoopConfig::default();

        run(&source, &mut session, "hi", "token", &config).await.unwrap();
        assert_eq!(session.cascade_id, cascade_before);
        assert_ne!(session.turn_id, turn_before);
    }

    #[tokio::test]
    async fn test_auto_execute_tools_disabled_stops_before_executing() {
        let source = FakeTurns::new(vec![vec![WireEventW::ToolCall {
            call_id: Some("call_1".to_string()),
            command: "ls".to_string(),
        }]]);
        let mut session = session();
        let config = AgenticLoopConfig { auto_execute_tools: false, ..Default::default() };

        let result = run(&source, &mut session, "hi", "token", &config).await.unwrap();
        assert!(result.tool_calls.is_empty());
        assert!(!result.max_iterations_reached);
    }

    #[tokio::test]
    async fn test_cat_without_target_captured_as_tool_error_not_aborted() {
        let output = execute_local_tool("cat", "/tmp", &AgenticLoopConfig::default()).await;
        assert!(output.is_err());
    }

    #[tokio::test]
    async fn test_shell_disabled_by_default() {
        let output = execute_local_tool("shell", "/tmp", &AgenticLoopConfig::default()).await;
        let err = output.unwrap_err().to_string();
        assert!(err.contains("disabled by default"));
    }

    #[tokio::test]
    async fn test_shell_permitted_but_still_lacks_command_text() {
        let config = AgenticLoopConfig { permit_raw_shell: true, ..Default::default() };
        let output = execute_local_tool("shell", "/tmp", &config).await;
        assert!(output.is_err());
        assert!(output.unwrap_err().to_string().contains("no command text"));
    }

    #[tokio::test]
    async fn test_unknown_command_rejected() {
        let output = execute_local_tool("rm", "/tmp", &AgenticLoopConfig::default()).await;
        assert!(output.is_err());
    }

    #[tokio::test]
    async fn test_ls_executes_against_working_dir() {
        let output = run_subprocess("ls", &["/tmp".to_string()]).await.unwrap();
        assert!(output.get("stdout").is_some());
        assert!(output.get("exit_code").is_some());
    }

    #[tokio::test]
    async fn test_nonexistent_binary_reports_spawn_failure() {
        let output = run_subprocess("definitely-not-a-real-binary", &[]).await;
        assert!(output.is_err());
    }
}
