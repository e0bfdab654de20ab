//! Conversation history and prompt composition.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// One message in a target's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Build the prompt sent to the tool.
///
/// With an empty history this is `prompt` unchanged. Otherwise prior turns
/// are replayed as role-labelled context ahead of the current request.
pub fn compose_prompt(history: &[Turn], prompt: &str) -> String {
    if history.is_empty() {
        return prompt.to_string();
    }

    let mut composed = String::from("Previous messages in this conversation:\n\n");
    for turn in history {
        composed.push_str(turn.role.label());
        composed.push_str(": ");
        composed.push_str(&turn.text);
        composed.push_str("\n\n");
    }
    composed.push_str("---\n\nCurrent request:\n");
    composed.push_str(prompt);
    composed
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_passes_prompt_through() {
        assert_eq!(compose_prompt(&[], "add README"), "add README");
    }

    #[test]
    fn history_is_replayed_in_order() {
        let history = vec![Turn::user("add README"), Turn::assistant("OK")];
        let prompt = compose_prompt(&history, "add LICENSE");

        assert_eq!(
            prompt,
            "Previous messages in this conversation:\n\n\
             User: add README\n\n\
             Assistant: OK\n\n\
             ---\n\n\
             Current request:\n\
             add LICENSE"
        );
    }

    #[test]
    fn turn_serializes_lowercase_role() {
        let json = serde_json::to_value(Turn::assistant("hi")).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["text"], "hi");
    }
}
