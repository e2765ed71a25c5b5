//! Jinja2 templates for chat prompts using minijinja

use minijinja::{context, Environment};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// ChatML, used when no template is configured
pub const CHATML_TEMPLATE: &str = "{% for message in messages %}<|im_start|>{{ message.role }}\n{{ message.content }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

/// Chat message structure for template rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Renders a message history into a single prompt string
#[derive(Clone)]
pub struct ChatTemplate {
    env: Environment<'static>,
    source: String,
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTemplate").field("source", &self.source).finish()
    }
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self {
            env: Environment::new(),
            source: CHATML_TEMPLATE.to_string(),
        }
    }
}

impl ChatTemplate {
    /// Syntax-check `source` and keep it for rendering
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        Environment::new().template_from_str(&source).map(|_| ())?;
        Ok(Self {
            env: Environment::new(),
            source,
        })
    }

    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        let rendered = self.env.render_str(
            &self.source,
            context! {
                messages => messages,
                add_generation_prompt => add_generation_prompt,
            },
        )?;
        Ok(rendered)
    }
}

/// Renders the grading request from the riddle, its answer and the player's guess
#[derive(Clone)]
pub struct PromptTemplate {
    env: Environment<'static>,
    source: String,
}

impl std::fmt::Debug for PromptTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptTemplate").field("source", &self.source).finish()
    }
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        Environment::new().template_from_str(&source).map(|_| ())?;
        Ok(Self {
            env: Environment::new(),
            source,
        })
    }

    pub fn render_grading(&self, riddle: &str, answer: &str, guess: &str) -> Result<String> {
        let rendered = self.env.render_str(
            &self.source,
            context! {
                riddle => riddle,
                answer => answer,
                guess => guess,
            },
        )?;
        Ok(rendered)
    }
}
