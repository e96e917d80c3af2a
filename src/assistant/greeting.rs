//! Greeting templates and random selection.

use rand::Rng;
use rand::seq::SliceRandom;

use crate::config::ConfigError;

/// Placeholder replaced by the member's display name.
pub const NAME_PLACEHOLDER: &str = "{name}";

pub const DEFAULT_TEMPLATES: &[&str] = &[
    "👋 Welcome {name} to Maker's Vault! Let's build magic together.",
    "🎉 Hey {name}, you've just joined a community of storytellers and creators!",
    "🔥 Big welcome {name}! Let's grow together in Maker's Vault.",
    "🚀 {name} just landed in Maker's Vault. Time to collaborate!",
    "✨ Welcome aboard {name}! Let's create greatness together.",
];

/// A greeting with exactly one `{name}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetingTemplate(String);

impl GreetingTemplate {
    pub fn new(text: impl Into<String>) -> Result<Self, ConfigError> {
        let text = text.into();
        let count = text.matches(NAME_PLACEHOLDER).count();
        if count != 1 {
            return Err(ConfigError::Validation(format!(
                "greeting template must contain exactly one {NAME_PLACEHOLDER} placeholder (found {count}): {text:?}"
            )));
        }
        Ok(Self(text))
    }

    pub fn render(&self, display_name: &str) -> String {
        self.0.replacen(NAME_PLACEHOLDER, display_name, 1)
    }
}

/// Fixed, non-empty set of greetings.
#[derive(Debug, Clone)]
pub struct TemplateSelector {
    templates: Vec<GreetingTemplate>,
}

impl TemplateSelector {
    pub fn new<I, S>(templates: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let templates = templates
            .into_iter()
            .map(GreetingTemplate::new)
            .collect::<Result<Vec<_>, _>>()?;
        if templates.is_empty() {
            return Err(ConfigError::Validation("greeting template list is empty".into()));
        }
        Ok(Self { templates })
    }

    pub fn builtin() -> Self {
        Self {
            templates: DEFAULT_TEMPLATES
                .iter()
                .map(|t| GreetingTemplate(t.to_string()))
                .collect(),
        }
    }

    pub fn templates(&self) -> &[GreetingTemplate] {
        &self.templates
    }

    pub fn select_greeting(&self, display_name: &str) -> String {
        self.select_greeting_with(&mut rand::thread_rng(), display_name)
    }

    pub fn select_greeting_with<R: Rng + ?Sized>(&self, rng: &mut R, display_name: &str) -> String {
        // Non-empty by construction
        match self.templates.choose(rng) {
            Some(template) => template.render(display_name),
            None => display_name.to_string(),
        }
    }
}
