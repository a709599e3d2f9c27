use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// A selectable model. The same OpenRouter id may appear twice, once with
/// reasoning enabled.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub provider: String,
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub image_model: bool,
    #[serde(default)]
    pub thinking: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

fn chat(provider: &str, id: &str, name: &str, thinking: bool) -> Model {
    Model {
        provider: provider.to_string(),
        id: id.to_string(),
        name: name.to_string(),
        image_model: false,
        thinking,
        default: false,
    }
}

fn image(provider: &str, id: &str, name: &str) -> Model {
    Model {
        image_model: true,
        ..chat(provider, id, name, false)
    }
}

pub fn available_models() -> &'static [Model] {
    static MODELS: OnceLock<Vec<Model>> = OnceLock::new();
    MODELS.get_or_init(|| {
        vec![
            Model {
                default: true,
                ..chat("google", "google/gemini-3-flash-preview", "Gemini 3 Flash", false)
            },
            chat("google", "google/gemini-3-flash-preview", "Gemini 3 Flash (Thinking)", true),
            chat("google", "google/gemini-3-pro-preview", "Gemini 3 Pro", true),
            chat("anthropic", "anthropic/claude-sonnet-4.5", "Claude Sonnet 4.5", false),
            chat("anthropic", "anthropic/claude-sonnet-4.5", "Claude Sonnet 4.5 (Thinking)", true),
            chat("anthropic", "anthropic/claude-opus-4.5", "Claude Opus 4.5", false),
            chat("anthropic", "anthropic/claude-opus-4.5", "Claude Opus 4.5 (Thinking)", true),
            chat("openai", "openai/gpt-5.2", "GPT-5.2", false),
            chat("openai", "openai/gpt-5.2", "GPT-5.2 (Thinking)", true),
            chat("z-ai", "z-ai/glm-4.7", "GLM 4.7", false),
            chat("z-ai", "z-ai/glm-4.7", "GLM 4.7 (Thinking)", true),
            chat("moonshotai", "moonshotai/kimi-k2-0905", "Kimi K2", false),
            chat("moonshotai", "moonshotai/kimi-k2-thinking", "Kimi K2 (Thinking)", true),
            image("google", "google/gemini-3-pro-image-preview", "Nano Banana Pro"),
            image("google", "google/gemini-2.5-flash-image", "Nano Banana"),
        ]
    })
}

pub fn default_model() -> &'static Model {
    let models = available_models();
    models.iter().find(|m| m.default).unwrap_or(&models[0])
}

/// Strips the legacy `reasoning-` prefix some clients put on model ids.
pub fn resolve_model_id(id: &str) -> &str {
    id.strip_prefix("reasoning-").unwrap_or(id)
}

pub fn find_chat_model(id: &str, thinking: bool) -> Option<&'static Model> {
    let id = resolve_model_id(id);
    available_models()
        .iter()
        .find(|m| !m.image_model && m.id == id && m.thinking == thinking)
}

pub fn is_image_model(id: &str) -> bool {
    available_models().iter().any(|m| m.image_model && m.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_gemini_flash_without_thinking() {
        let m = default_model();
        assert_eq!(m.id, "google/gemini-3-flash-preview");
        assert!(!m.thinking);
    }

    #[test]
    fn thinking_variant_is_a_distinct_entry() {
        let plain = find_chat_model("anthropic/claude-sonnet-4.5", false).unwrap();
        let thinking = find_chat_model("anthropic/claude-sonnet-4.5", true).unwrap();
        assert_ne!(plain.name, thinking.name);
        assert!(find_chat_model("moonshotai/kimi-k2-0905", true).is_none());
    }

    #[test]
    fn image_models_are_not_chat_models() {
        assert!(is_image_model("google/gemini-2.5-flash-image"));
        assert!(!is_image_model("openai/gpt-5.2"));
        assert!(find_chat_model("google/gemini-2.5-flash-image", false).is_none());
    }

    #[test]
    fn reasoning_prefix_is_stripped() {
        assert_eq!(resolve_model_id("reasoning-openai/gpt-5.2"), "openai/gpt-5.2");
        assert!(find_chat_model("reasoning-openai/gpt-5.2", true).is_some());
    }
}
