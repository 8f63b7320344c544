//! Normalize and scrub hooks.
//!
//! Both hooks mutate an [`Interaction`] in place. `normalize` strips volatile fields before the
//! fingerprint is taken; `scrub` redacts what must not reach disk (or the digest). A hook that
//! rewrites a field to a constant collapses every request that differed only in that field onto
//! one fingerprint, so redaction that still has to tell requests apart should keep some of the
//! original value (see [`rewrite_header`]).

use std::sync::Arc;

use regex::Regex;

use crate::{
    config::{ConfigurationError, HeaderRewriteConfig, HeaderScope, NormalizeConfig, ScrubConfig},
    interaction::{Headers, Interaction},
};

pub type HookFn = Arc<dyn Fn(&mut Interaction) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    Normalize,
    Scrub,
}

impl HookStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::Scrub => "scrub",
        }
    }
}

#[derive(Debug)]
pub struct HookError {
    pub stage: HookStage,
    source: anyhow::Error,
}

impl std::fmt::Display for HookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} hook failed: {:#}", self.stage.as_str(), self.source)
    }
}

impl std::error::Error for HookError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

#[derive(Clone, Default)]
pub struct Hooks {
    normalize: Option<HookFn>,
    scrub: Option<HookFn>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("normalize", &self.normalize.is_some())
            .field("scrub", &self.scrub.is_some())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_normalize(mut self, hook: HookFn) -> Self {
        self.normalize = Some(hook);
        self
    }

    pub fn with_scrub(mut self, hook: HookFn) -> Self {
        self.scrub = Some(hook);
        self
    }

    pub fn has_normalize(&self) -> bool {
        self.normalize.is_some()
    }

    pub fn has_scrub(&self) -> bool {
        self.scrub.is_some()
    }

    pub fn normalize(&self, interaction: &mut Interaction) -> Result<(), HookError> {
        run_hook(self.normalize.as_ref(), HookStage::Normalize, interaction)
    }

    pub fn scrub(&self, interaction: &mut Interaction) -> Result<(), HookError> {
        run_hook(self.scrub.as_ref(), HookStage::Scrub, interaction)
    }

    /// Builds hooks from the `[normalize]` and `[scrub]` config tables.
    pub fn from_config(
        normalize: Option<&NormalizeConfig>,
        scrub: Option<&ScrubConfig>,
    ) -> Result<Self, ConfigurationError> {
        let mut hooks = Self::new();
        if let Some(normalize) = normalize
            && !normalize.remove_headers.is_empty()
        {
            hooks = hooks.with_normalize(remove_request_headers(
                normalize.remove_headers.iter().cloned(),
            ));
        }
        if let Some(scrub) = scrub
            && !scrub.headers.is_empty()
        {
            let rules = scrub
                .headers
                .iter()
                .map(HeaderRewrite::from_config)
                .collect::<Result<Vec<_>, _>>()?;
            hooks = hooks.with_scrub(rewrite_headers(rules));
        }
        Ok(hooks)
    }
}

fn run_hook(
    hook: Option<&HookFn>,
    stage: HookStage,
    interaction: &mut Interaction,
) -> Result<(), HookError> {
    let Some(hook) = hook else {
        return Ok(());
    };
    hook(interaction).map_err(|source| HookError { stage, source })
}

/// Wraps a closure as a [`HookFn`].
pub fn hook<F>(f: F) -> HookFn
where
    F: Fn(&mut Interaction) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Normalize hook that deletes the named request headers.
pub fn remove_request_headers<I, S>(names: I) -> HookFn
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let names: Vec<String> = names.into_iter().map(Into::into).collect();
    hook(move |interaction| {
        for name in &names {
            interaction.request.headers.remove(name);
        }
        Ok(())
    })
}

/// Regex rewrite applied to every value of one header.
#[derive(Debug, Clone)]
pub struct HeaderRewrite {
    name: String,
    pattern: Regex,
    replacement: String,
    scope: HeaderScope,
}

impl HeaderRewrite {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        replacement: impl Into<String>,
        scope: HeaderScope,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        let pattern = Regex::new(pattern).map_err(|err| {
            ConfigurationError::new(format!("invalid scrub pattern for header `{name}`: {err}"))
        })?;
        Ok(Self {
            name,
            pattern,
            replacement: replacement.into(),
            scope,
        })
    }

    fn from_config(config: &HeaderRewriteConfig) -> Result<Self, ConfigurationError> {
        Self::new(
            config.name.clone(),
            &config.pattern,
            config.replacement.clone(),
            config.scope,
        )
    }

    fn apply(&self, interaction: &mut Interaction) {
        if matches!(self.scope, HeaderScope::Request | HeaderScope::Both) {
            self.apply_to(&mut interaction.request.headers);
        }
        if matches!(self.scope, HeaderScope::Response | HeaderScope::Both)
            && let Some(response) = interaction.response.as_mut()
        {
            self.apply_to(&mut response.headers);
        }
    }

    fn apply_to(&self, headers: &mut Headers) {
        for value in headers.values_mut(&self.name) {
            // Non UTF-8 values cannot be matched by a `Regex` and are left untouched.
            let Ok(text) = std::str::from_utf8(value) else {
                continue;
            };
            let rewritten = self.pattern.replace(text, self.replacement.as_str());
            if rewritten != text {
                *value = rewritten.into_owned().into_bytes();
            }
        }
    }
}

/// Scrub hook that applies a single header rewrite.
pub fn rewrite_header(rewrite: HeaderRewrite) -> HookFn {
    rewrite_headers(vec![rewrite])
}

pub fn rewrite_headers(rewrites: Vec<HeaderRewrite>) -> HookFn {
    hook(move |interaction| {
        for rewrite in &rewrites {
            rewrite.apply(interaction);
        }
        Ok(())
    })
}
