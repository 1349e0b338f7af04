//! Command Renderer - Whole-Token Substitution
//!
//! A command token is rendered only when the entire argv element is a
//! template (`{{inputs.<key>}}` or `{{image.reference}}`). Anything else,
//! including a template embedded in a longer string, is passed through.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::catalog::{Tool, ToolInput};

pub const IMAGE_REFERENCE_TOKEN: &str = "image.reference";
pub const INPUTS_TOKEN_PREFIX: &str = "inputs.";

static TOKEN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}$").expect("token pattern is a valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("Unsupported command token: {token}")]
    UnknownToken { token: String },
}

/// A recognised whole-argument template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    ImageReference,
    Input(&'a str),
}

/// Classify one argv element.
///
/// Returns `Ok(None)` for plain arguments. An element that is wrapped in
/// `{{ }}` but names nothing we can render is an error.
pub fn parse_token(arg: &str) -> Result<Option<Token<'_>>, RenderError> {
    if !(arg.starts_with("{{") && arg.ends_with("}}")) {
        return Ok(None);
    }

    let name = TOKEN_PATTERN
        .captures(arg)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| RenderError::UnknownToken { token: arg.to_string() })?;

    if name == IMAGE_REFERENCE_TOKEN {
        return Ok(Some(Token::ImageReference));
    }
    match name.strip_prefix(INPUTS_TOKEN_PREFIX) {
        Some(key) if !key.is_empty() => Ok(Some(Token::Input(key))),
        _ => Err(RenderError::UnknownToken { token: name.to_string() }),
    }
}

/// Schema-time check: every template in `command` must be renderable
/// against the declared `inputs`.
pub fn check_tokens(
    command: &[String],
    inputs: &BTreeMap<String, ToolInput>,
) -> Result<(), RenderError> {
    for arg in command {
        if let Some(Token::Input(key)) = parse_token(arg)? {
            if !inputs.contains_key(key) {
                return Err(RenderError::UnknownToken {
                    token: format!("{INPUTS_TOKEN_PREFIX}{key}"),
                });
            }
        }
    }
    Ok(())
}

/// Values substituted into command templates.
#[derive(Debug, Clone, Default)]
pub struct TokenValues {
    image_reference: String,
    destinations: BTreeMap<String, String>,
}

impl TokenValues {
    pub fn new(image_reference: impl Into<String>) -> Self {
        Self {
            image_reference: image_reference.into(),
            destinations: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, destination: impl Into<String>) -> Self {
        self.destinations.insert(key.into(), destination.into());
        self
    }

    /// Destinations are declared on the tool, so they are known before any
    /// host path has been resolved.
    pub fn for_tool(tool: &Tool, image_reference: impl Into<String>) -> Self {
        tool.inputs.iter().fold(Self::new(image_reference), |values, (key, input)| {
            values.with_input(key.clone(), input.destination.clone())
        })
    }
}

/// Render an argv against the given values. Total for pre-validated tools.
pub fn render_argv(command: &[String], values: &TokenValues) -> Result<Vec<String>, RenderError> {
    command
        .iter()
        .map(|arg| match parse_token(arg)? {
            None => Ok(arg.clone()),
            Some(Token::ImageReference) => Ok(values.image_reference.clone()),
            Some(Token::Input(key)) => values.destinations.get(key).cloned().ok_or_else(|| {
                RenderError::UnknownToken {
                    token: format!("{INPUTS_TOKEN_PREFIX}{key}"),
                }
            }),
        })
        .collect()
}

/// Render a tool's command for one run.
pub fn render(tool: &Tool, image_reference: &str) -> Result<Vec<String>, RenderError> {
    render_argv(&tool.command, &TokenValues::for_tool(tool, image_reference))
}

pub fn uses_image_reference(command: &[String]) -> bool {
    command
        .iter()
        .any(|arg| matches!(parse_token(arg), Ok(Some(Token::ImageReference))))
}
