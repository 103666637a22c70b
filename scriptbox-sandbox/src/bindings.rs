//! Which data-context entries a script actually refers to

use crate::error::BindingError;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

/// A referenced identifier and the value it resolves to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationPair {
    pub name: String,
    pub value: Value,
}

impl EvaluationPair {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Extracts the candidate identifiers referenced by a script
#[async_trait]
pub trait BindingExtractor: Send + Sync {
    /// Return the referenced subset of `candidates`, in first-reference order,
    /// with values resolved from `data_context`
    async fn extract(
        &self,
        code: &str,
        candidates: &BTreeSet<String>,
        data_context: &Map<String, Value>,
    ) -> Result<Vec<EvaluationPair>, BindingError>;
}

static INTERPOLATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").unwrap());

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r#"(?P<comment>//[^\n]*|/\*[\s\S]*?\*/)"#,
        r#"|(?P<string>"(?:[^"\\\n]|\\.)*"|'(?:[^'\\\n]|\\.)*')"#,
        r#"|(?P<template>`(?:[^`\\]|\\[\s\S])*`)"#,
        r#"|(?P<unterminated>/\*|["'`])"#,
        r#"|(?P<number>[0-9][0-9A-Za-z_]*(?:\.[0-9A-Za-z_]*)?)"#,
        r#"|(?P<spread>\.\.\.)"#,
        r#"|(?P<member>\?\.|\.)"#,
        r#"|(?P<ident>[A-Za-z_$][A-Za-z0-9_$]*)"#,
    ))
    .unwrap()
});

/// Regex tokenizer that ignores comments, string literals and property names.
///
/// Only `${...}` interpolations of template literals are scanned, and they may
/// not nest braces. Referenced candidates missing from the data context
/// resolve to `null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentifierBindingExtractor;

impl IdentifierBindingExtractor {
    /// Identifiers referenced by `code`, deduplicated, in first-reference order
    pub fn referenced_identifiers(code: &str) -> Result<Vec<String>, BindingError> {
        let mut seen = HashSet::new();
        let mut identifiers = Vec::new();
        let mut after_member = false;

        for caps in TOKEN_RE.captures_iter(code) {
            if let Some(open) = caps.name("unterminated") {
                return Err(BindingError::Tokenize(format!(
                    "unterminated `{}` at byte {}",
                    open.as_str(),
                    open.start()
                )));
            }
            if caps.name("comment").is_some() {
                continue;
            }
            if let Some(template) = caps.name("template") {
                for interpolation in INTERPOLATION_RE.captures_iter(template.as_str()) {
                    for name in Self::referenced_identifiers(&interpolation[1])? {
                        if seen.insert(name.clone()) {
                            identifiers.push(name);
                        }
                    }
                }
                after_member = false;
                continue;
            }
            if caps.name("member").is_some() {
                after_member = true;
                continue;
            }
            if let Some(ident) = caps.name("ident") {
                let name = ident.as_str();
                if !after_member && seen.insert(name.to_string()) {
                    identifiers.push(name.to_string());
                }
            }
            after_member = false;
        }

        Ok(identifiers)
    }
}

#[async_trait]
impl BindingExtractor for IdentifierBindingExtractor {
    async fn extract(
        &self,
        code: &str,
        candidates: &BTreeSet<String>,
        data_context: &Map<String, Value>,
    ) -> Result<Vec<EvaluationPair>, BindingError> {
        let pairs = Self::referenced_identifiers(code)?
            .into_iter()
            .filter(|name| candidates.contains(name))
            .map(|name| {
                let value = data_context.get(&name).cloned().unwrap_or(Value::Null);
                EvaluationPair::new(name, value)
            })
            .collect();
        Ok(pairs)
    }
}
