//! Minijinja template rendering for notification text.
//!
//! Templates are plain strings (the defaults live in [`crate::message`] and
//! can be overridden from settings), so a fresh [`minijinja::Environment`]
//! is created per render call.

use serde::Serialize;

use crate::traits::{clip, NotifyError};

#[derive(Debug, Default)]
pub struct TemplateRenderer {
    _private: (),
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Build a configured minijinja environment with custom filters and globals.
    fn build_env() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();
        env.add_filter("clip", clip_filter);
        env.add_filter("compact", compact_filter);
        env.add_function("env", env_function);
        env
    }

    /// Render a template string with any serializable context.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Template`] if the template is invalid or
    /// rendering fails.
    pub fn render<C: Serialize>(&self, template_str: &str, ctx: &C) -> Result<String, NotifyError> {
        let env = Self::build_env();
        env.render_str(template_str, ctx)
            .map_err(|e| NotifyError::Template(e.to_string()))
    }

    /// Check that a template string parses. Does not evaluate it.
    pub fn validate(&self, template_str: &str) -> Result<(), NotifyError> {
        let env = Self::build_env();
        env.template_from_str(template_str)
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        Ok(())
    }
}

fn clip_filter(value: String, max: usize) -> String {
    clip(&value, max)
}

/// Compact counter: 1234 -> "1.2K", 2500000 -> "2.5M".
fn compact_filter(value: u64) -> String {
    match value {
        0..=999 => value.to_string(),
        1_000..=999_999 => format!("{:.1}K", value as f64 / 1_000.0),
        _ => format!("{:.1}M", value as f64 / 1_000_000.0),
    }
}

/// Global function: read an environment variable, empty when unset.
/// Unset variables render as an empty string.
fn env_function(name: String) -> String {
    std::env::var(&name).unwrap_or_else(|_| {
        tracing::warn!(var = %name, "template references unset env var");
        String::new()
    })
}
