//! Chat bridge for brainstorm-style assistant turns.
//!
//! Shares the executor's spawn path but is tool-less: the assistant gets
//! no file access and the conversation transcript is rebuilt into a
//! single prompt each turn rather than relying on session persistence.
//! Output is streamed in fixed-size byte chunks with a per-chunk timeout
//! and an overall turn ceiling; hitting the ceiling kills the child and
//! pushes a timeout notice downstream.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::warn;

/// Bytes read per streaming chunk.
pub const CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Chat bridge configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Assistant binary plus fixed leading arguments.
    pub command: String,
    pub leading_args: Vec<String>,
    /// Ceiling per chunk read; slow starts are tolerated until the turn
    /// ceiling trips.
    pub chunk_timeout: Duration,
    /// Overall ceiling per turn.
    pub turn_timeout: Duration,
    /// Grace period for process exit after the stream closes.
    pub wait_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            leading_args: Vec::new(),
            chunk_timeout: Duration::from_secs(30),
            turn_timeout: Duration::from_secs(120),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// A tool-less streaming conversation with the assistant.
#[derive(Debug)]
pub struct ChatBridge {
    config: ChatConfig,
    system_prompt: String,
    messages: Vec<ChatMessage>,
}

impl ChatBridge {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self::with_config(system_prompt, ChatConfig::default())
    }

    pub fn with_config(system_prompt: impl Into<String>, config: ChatConfig) -> Self {
        Self {
            config,
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
        }
    }

    /// Seed the transcript, e.g. when resuming a stored conversation.
    pub fn load_history(&mut self, history: Vec<ChatMessage>) {
        self.messages = history;
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Send one user message, streaming response chunks through
    /// `chunk_tx` as they arrive. Returns the full response text, which
    /// is also appended to the transcript.
    pub async fn send_message(
        &mut self,
        user_message: &str,
        chunk_tx: &mpsc::Sender<String>,
    ) -> std::io::Result<String> {
        let prompt = self.build_conversation_prompt(user_message);
        self.messages.push(ChatMessage {
            role: "user".to_string(),
            content: user_message.to_string(),
        });

        let mut child = Command::new(&self.config.command)
            .args(&self.config.leading_args)
            .arg("-p")
            .arg(&prompt)
            .arg("--tools")
            .arg("")
            .arg("--output-format")
            .arg("text")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let Some(mut stdout) = child.stdout.take() else {
            return Err(std::io::Error::other("assistant stdout was not captured"));
        };
        let mut response = String::new();
        let start = tokio::time::Instant::now();
        let mut buf = [0u8; CHUNK_SIZE];

        loop {
            match tokio::time::timeout(self.config.chunk_timeout, stdout.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    response.push_str(&text);
                    let _ = chunk_tx.send(text).await;
                }
                Ok(Err(e)) => {
                    warn!("chat stream read error: {e}");
                    break;
                }
                Err(_) => {
                    if start.elapsed() > self.config.turn_timeout {
                        let notice =
                            "\n\n[Timeout - the assistant is taking too long. Try a shorter prompt.]";
                        response.push_str(notice);
                        let _ = chunk_tx.send(notice.to_string()).await;
                        let _ = child.kill().await;
                        break;
                    }
                    // Chunk timeout inside the turn ceiling: keep waiting.
                }
            }
        }

        if tokio::time::timeout(self.config.wait_timeout, child.wait())
            .await
            .is_err()
        {
            let notice = "\n\n[Process timeout - terminating the assistant]";
            response.push_str(notice);
            let _ = chunk_tx.send(notice.to_string()).await;
            let _ = child.kill().await;
        }

        if !response.is_empty() {
            self.messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: response.clone(),
            });
        }

        Ok(response)
    }

    /// Rebuild the whole conversation plus the new message into one
    /// prompt.
    fn build_conversation_prompt(&self, new_message: &str) -> String {
        let mut parts = vec![self.system_prompt.clone()];
        parts.push("\n\n---\n\nConversation:\n".to_string());

        for message in &self.messages {
            let label = if message.role == "user" {
                "User"
            } else {
                "Assistant"
            };
            parts.push(format!("\n{label}: {}\n", message.content));
        }

        parts.push(format!("\nUser: {new_message}\n"));
        parts.push("\nAssistant: ".to_string());
        parts.concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_bridge(script: &str, config: ChatConfig) -> ChatBridge {
        ChatBridge::with_config(
            "You are a brainstorm partner.",
            ChatConfig {
                command: "sh".to_string(),
                leading_args: vec!["-c".to_string(), script.to_string()],
                ..config
            },
        )
    }

    #[tokio::test]
    async fn streams_chunks_and_records_transcript() {
        let mut bridge = sh_bridge("printf 'hello from the assistant'", ChatConfig::default());
        let (tx, mut rx) = mpsc::channel(16);

        let response = bridge.send_message("hi there", &tx).await.unwrap();
        assert_eq!(response, "hello from the assistant");

        let first_chunk = rx.recv().await.unwrap();
        assert!(response.starts_with(&first_chunk));

        assert_eq!(bridge.messages().len(), 2);
        assert_eq!(bridge.messages()[0].role, "user");
        assert_eq!(bridge.messages()[1].role, "assistant");
    }

    #[tokio::test]
    async fn turn_ceiling_kills_slow_child() {
        let config = ChatConfig {
            chunk_timeout: Duration::from_millis(50),
            turn_timeout: Duration::from_millis(200),
            wait_timeout: Duration::from_millis(200),
            ..ChatConfig::default()
        };
        let mut bridge = sh_bridge("sleep 30", config);
        let (tx, mut rx) = mpsc::channel(16);

        let response = bridge.send_message("hi", &tx).await.unwrap();
        assert!(response.contains("[Timeout"));

        let chunk = rx.recv().await.unwrap();
        assert!(chunk.contains("[Timeout"));
    }

    #[tokio::test]
    async fn chunk_timeout_inside_ceiling_keeps_waiting() {
        let config = ChatConfig {
            chunk_timeout: Duration::from_millis(50),
            turn_timeout: Duration::from_secs(10),
            ..ChatConfig::default()
        };
        // Output arrives after several chunk timeouts but inside the turn
        // ceiling.
        let mut bridge = sh_bridge("sleep 0.3; printf 'late but fine'", config);
        let (tx, _rx) = mpsc::channel(16);

        let response = bridge.send_message("hi", &tx).await.unwrap();
        assert_eq!(response, "late but fine");
    }

    #[tokio::test]
    async fn transcript_is_rebuilt_into_prompt() {
        let mut bridge = sh_bridge("printf 'first answer'", ChatConfig::default());
        let (tx, _rx) = mpsc::channel(16);
        bridge.send_message("first question", &tx).await.unwrap();

        let prompt = bridge.build_conversation_prompt("second question");
        assert!(prompt.starts_with("You are a brainstorm partner."));
        assert!(prompt.contains("User: first question"));
        assert!(prompt.contains("Assistant: first answer"));
        assert!(prompt.ends_with("\nAssistant: "));
        assert!(prompt.contains("User: second question"));
    }

    #[test]
    fn load_history_seeds_transcript() {
        let mut bridge = ChatBridge::new("sys");
        bridge.load_history(vec![
            ChatMessage {
                role: "user".to_string(),
                content: "a".to_string(),
            },
            ChatMessage {
                role: "assistant".to_string(),
                content: "b".to_string(),
            },
        ]);
        assert_eq!(bridge.messages().len(), 2);
    }
}
