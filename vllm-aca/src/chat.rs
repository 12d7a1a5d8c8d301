use anyhow::{anyhow, Result};
use common::{ChatCompletionRequest, ChatMessage};
use tracing::debug;

use crate::verify::Verifier;

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
}

pub fn build_request(options: &ChatOptions, message: &str) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &options.system {
        messages.push(ChatMessage::system(system.as_str()));
    }
    messages.push(ChatMessage::user(message));
    ChatCompletionRequest {
        model: options.model.clone(),
        messages,
        max_tokens: options.max_tokens,
        temperature: options.temperature,
    }
}

/// Sends one user message and returns the assistant's reply.
pub async fn ask(verifier: &Verifier, options: &ChatOptions, message: &str) -> Result<String> {
    let request = build_request(options, message);
    debug!("chat request: {:?}", request);
    let (status, completion) = verifier.chat(&request).await?;
    let completion = completion.ok_or_else(|| anyhow!("chat completion returned {}", status))?;
    completion
        .first_content()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("chat completion returned no choices"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_comes_first() {
        let options = ChatOptions {
            model: "LangAGI-Lab/camel".to_string(),
            system: Some("You are a counselor.".to_string()),
            temperature: Some(0.0),
            max_tokens: 256,
        };
        let request = build_request(&options, "I keep overthinking.");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.messages[1], ChatMessage::user("I keep overthinking."));
        assert_eq!(request.temperature, Some(0.0));
    }

    #[test]
    fn test_without_system_prompt() {
        let options = ChatOptions {
            model: "m".to_string(),
            system: None,
            temperature: None,
            max_tokens: 16,
        };
        let request = build_request(&options, "hi");
        assert_eq!(request.messages, vec![ChatMessage::user("hi")]);
    }
}
