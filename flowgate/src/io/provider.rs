//! Reasoning-provider abstraction.
//!
//! The [`ReasoningProvider`] trait decouples planning and workers from the
//! backend that produces responses. [`CommandProvider`] shells out to an
//! agent CLI; [`ScriptedProvider`] replays canned responses for tests and for
//! `--provider mock` runs.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::io::process::{command_from_argv, run_command_with_timeout};

/// One chat message exchanged with the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn tool(name: &str, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::new("tool", content)
        }
    }

    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            name: None,
        }
    }
}

/// Tool advertised to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub actions: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolDescriptor],
}

/// Raised when a provider call exceeds its timeout.
#[derive(Debug, Error)]
#[error("reasoning provider timed out after {0:?}")]
pub struct ProviderTimeout(pub Duration);

/// A backend that answers a conversation with one JSON response object:
/// a plan, a tool-call request, or a terminal status.
pub trait ReasoningProvider: Send + Sync {
    fn send(&self, request: &ProviderRequest<'_>) -> Result<Value>;
}

/// Provider replaying a fixed script of responses.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Value>>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Value>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Conversations received so far, in call order.
    pub fn seen_messages(&self) -> Vec<Vec<Message>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ReasoningProvider for ScriptedProvider {
    fn send(&self, request: &ProviderRequest<'_>) -> Result<Value> {
        self.seen
            .lock()
            .map_err(|_| anyhow!("scripted provider lock poisoned"))?
            .push(request.messages.to_vec());
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("scripted provider lock poisoned"))?
            .pop_front();
        Ok(next.unwrap_or_else(|| {
            json!({
                "status": "PARTIAL",
                "summary": "mock script exhausted",
                "artifacts": [],
                "metrics": {},
                "next_actions": [],
                "failure_signature": "mock-empty",
            })
        }))
    }
}

/// Provider that runs an external agent CLI once per call.
///
/// The conversation is rendered to a prompt on stdin; the last JSON object in
/// stdout is the response.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ReasoningProvider for CommandProvider {
    #[instrument(skip_all, fields(program = %self.argv.first().map(String::as_str).unwrap_or(""), messages = request.messages.len()))]
    fn send(&self, request: &ProviderRequest<'_>) -> Result<Value> {
        let prompt = render_conversation(request);
        let cmd = command_from_argv(&self.argv, &self.workdir)?;
        info!(workdir = %self.workdir.display(), "invoking reasoning provider");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run reasoning provider")?;
        if output.timed_out {
            return Err(ProviderTimeout(self.timeout).into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "reasoning provider failed");
            return Err(anyhow!(
                "reasoning provider exited with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let stdout = output.stdout_text();
        let response = extract_last_json_object(&stdout)
            .ok_or_else(|| anyhow!("reasoning provider printed no JSON object"))?;
        debug!("parsed provider response");
        Ok(response)
    }
}

const RESPONSE_CONTRACT: &str = "Reply with exactly one JSON object and nothing else. Use {\"tool_calls\": [{\"tool\", \"action\", \"args\", \"call_id\"}]} to call tools, or a terminal object {\"status\": \"SUCCESS|PARTIAL|FAILURE|BLOCKED\", \"summary\", \"artifacts\", \"metrics\", \"next_actions\", \"failure_signature\"}. Planning requests additionally include \"workflow\": {\"steps\": [...]}.";

/// Flatten a conversation into a single prompt for CLI agents.
pub fn render_conversation(request: &ProviderRequest<'_>) -> String {
    let mut prompt = String::new();
    for message in request.messages {
        match &message.name {
            Some(name) => prompt.push_str(&format!("## {} ({name})\n", message.role)),
            None => prompt.push_str(&format!("## {}\n", message.role)),
        }
        prompt.push_str(message.content.trim_end());
        prompt.push_str("\n\n");
    }
    if !request.tools.is_empty() {
        prompt.push_str("## tools\n");
        for tool in request.tools {
            prompt.push_str(&format!(
                "- {} [{}]: {}\n",
                tool.name,
                tool.actions.join(", "),
                tool.description
            ));
        }
        prompt.push('\n');
    }
    prompt.push_str(RESPONSE_CONTRACT);
    prompt.push('\n');
    prompt
}

/// Last complete top-level JSON object embedded in `text`.
pub fn extract_last_json_object(text: &str) -> Option<Value> {
    let mut last = None;
    let mut pos = 0;
    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) if value.is_object() => {
                last = Some(value);
                pos = start + stream.byte_offset();
            }
            _ => pos = start + 1,
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: &[Message]) -> ProviderRequest<'_> {
        ProviderRequest {
            messages,
            tools: &[],
        }
    }

    #[test]
    fn scripted_provider_replays_then_reports_exhaustion() {
        let provider = ScriptedProvider::new(vec![json!({"status": "SUCCESS", "summary": "one"})]);
        let messages = vec![Message::user("go")];
        assert_eq!(provider.send(&request(&messages)).expect("send")["summary"], "one");

        let exhausted = provider.send(&request(&messages)).expect("send");
        assert_eq!(exhausted["status"], "PARTIAL");
        assert_eq!(exhausted["failure_signature"], "mock-empty");
        assert_eq!(provider.seen_messages().len(), 2);
    }

    #[test]
    fn extracts_last_top_level_object() {
        let text = "thinking {\"draft\": true}\n```json\n{\"status\": \"SUCCESS\", \"metrics\": {\"x\": 1}}\n```\n";
        let value = extract_last_json_object(text).expect("object");
        assert_eq!(value["status"], "SUCCESS");
        assert_eq!(value["metrics"]["x"], 1);
        assert!(extract_last_json_object("no json here {").is_none());
    }

    #[test]
    fn conversation_prompt_lists_roles_and_tools() {
        let messages = vec![Message::system("sys"), Message::tool("file", "{}")];
        let tools = vec![ToolDescriptor {
            name: "file".to_string(),
            actions: vec!["read".to_string()],
            description: "files".to_string(),
        }];
        let prompt = render_conversation(&ProviderRequest {
            messages: &messages,
            tools: &tools,
        });
        assert!(prompt.starts_with("## system\nsys"));
        assert!(prompt.contains("## tool (file)"));
        assert!(prompt.contains("- file [read]: files"));
    }

    #[cfg(unix)]
    #[test]
    fn command_provider_parses_cli_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = CommandProvider {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; echo '{\"status\": \"SUCCESS\", \"summary\": \"cli\"}'".to_string(),
            ],
            workdir: temp.path().to_path_buf(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        };
        let messages = vec![Message::user("hi")];
        let value = provider.send(&request(&messages)).expect("send");
        assert_eq!(value["summary"], "cli");
    }

    #[cfg(unix)]
    #[test]
    fn command_provider_timeout_is_typed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = CommandProvider {
            argv: vec!["sh".to_string(), "-c".to_string(), "exec sleep 5".to_string()],
            workdir: temp.path().to_path_buf(),
            timeout: Duration::from_millis(100),
            output_limit_bytes: 10_000,
        };
        let messages = vec![Message::user("hi")];
        let err = provider.send(&request(&messages)).expect_err("timeout");
        assert!(err.downcast_ref::<ProviderTimeout>().is_some());
    }
}
