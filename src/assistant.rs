//! Conversation state and prompt templates for the Homy assistants.

use crate::{client::OracleClient, error::OracleError};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn label(&self) -> &'static str {
        match self {
            ChatRole::User => "You",
            ChatRole::Assistant => "Homy",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Append-only message log for one conversation.
#[derive(Clone, Debug, Default)]
pub struct ChatSession {
    messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn push(&mut self, role: ChatRole, content: impl Into<String>) {
        self.messages.push(ChatMessage {
            role,
            content: content.into(),
        });
    }

    /// Sends `input` to the oracle and records both sides of the exchange.
    ///
    /// Blank input is ignored and returns `Ok(None)`. On failure the user
    /// message stays in the log and the error is returned.
    pub async fn send(
        &mut self,
        client: &OracleClient,
        input: &str,
    ) -> Result<Option<String>, OracleError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(None);
        }
        self.push(ChatRole::User, input);
        let reply = client.ask(input).await?;
        self.push(ChatRole::Assistant, reply.clone());
        Ok(Some(reply))
    }

    /// Renders the log as `Speaker: text` lines.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|message| format!("{}: {}", message.role.label(), message.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Prompt for the planning assistant; `None` for a blank task.
pub fn plan_prompt(task: &str) -> Option<String> {
    let task = task.trim();
    (!task.is_empty()).then(|| format!("Generate a plan for: {task}"))
}

/// Prompt for the proposal writer; `None` if either field is blank.
pub fn proposal_prompt(title: &str, description: &str) -> Option<String> {
    let (title, description) = (title.trim(), description.trim());
    if title.is_empty() || description.is_empty() {
        return None;
    }
    Some(format!(
        "Write a proposal for \"{title}\". Description: {description}"
    ))
}
