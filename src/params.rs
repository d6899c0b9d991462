//! Step parameter resolution.
//!
//! A step declares its parameters as [`ParameterDefinition`]s. The
//! [`ParameterResolver`] turns them into concrete JSON values: literals
//! pass through, user inputs and earlier step outputs are looked up, and
//! novel data is fetched through an injected [`NovelDataLookup`]. A
//! definition's value may itself be a definition; those are unwrapped up to
//! [`MAX_PARAMETER_DEPTH`] levels, never further.
//!
//! Every string in a resolved value has been through the
//! [`Sanitizer`](crate::prompt::Sanitizer).

use crate::error::{ChainError, Result};
use crate::exec_ctx::ExecutionContext;
use crate::prompt::Sanitizer;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Hard bound on nested definitions. Unwrapping more levels than this is
/// treated as a cycle.
pub const MAX_PARAMETER_DEPTH: usize = 5;

/// How a parameter's value is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Literal,
    UserInput,
    PreviousStepOutput,
    NovelDataRef,
    /// The value is another definition.
    Nested,
}

/// Either another definition or a plain JSON value.
///
/// Deserialized untagged: an object that parses as a definition (it has a
/// valid `kind`) is a nested definition; anything else is plain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Nested(Box<ParameterDefinition>),
    Plain(Value),
}

impl Default for ParamValue {
    fn default() -> Self {
        ParamValue::Plain(Value::Null)
    }
}

/// A declared step parameter.
///
/// # Example
///
/// ```
/// use novel_rulechain::params::{ParamKind, ParameterDefinition};
/// use serde_json::json;
///
/// let def: ParameterDefinition = serde_json::from_value(json!({
///     "kind": "nested",
///     "value": {"kind": "user_input", "value": "lang", "required": true}
/// })).unwrap();
/// assert_eq!(def.kind, ParamKind::Nested);
/// assert_eq!(def.depth(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub kind: ParamKind,
    #[serde(default)]
    pub value: ParamValue,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub required: bool,
}

impl ParameterDefinition {
    fn plain(kind: ParamKind, value: Value) -> Self {
        Self {
            kind,
            value: ParamValue::Plain(value),
            label: String::new(),
            required: false,
        }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Self::plain(ParamKind::Literal, value.into())
    }

    /// Look up `key` in the user inputs. An empty key means the parameter's own name.
    pub fn user_input(key: impl Into<String>) -> Self {
        Self::plain(ParamKind::UserInput, Value::String(key.into()))
    }

    /// Look up `variable[.path…]` in the variable table.
    pub fn previous_step_output(path: impl Into<String>) -> Self {
        Self::plain(ParamKind::PreviousStepOutput, Value::String(path.into()))
    }

    /// Fetch novel data. `reference` is `"kind:identifier"` or an object
    /// with `kind` and `identifier` plus any extra lookup config.
    pub fn novel_data(reference: impl Into<Value>) -> Self {
        Self::plain(ParamKind::NovelDataRef, reference.into())
    }

    pub fn nested(inner: ParameterDefinition) -> Self {
        Self {
            kind: ParamKind::Nested,
            value: ParamValue::Nested(Box::new(inner)),
            label: String::new(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Number of nested definitions below this one.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let ParamValue::Nested(inner) = &current.value {
            depth += 1;
            current = inner;
        }
        depth
    }
}

/// Request passed to the novel-data collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NovelDataRequest {
    /// What to fetch, e.g. `"chapter"` or `"character"`.
    pub kind: String,
    pub identifier: String,
    pub novel_id: Option<String>,
    /// Remaining fields of the reference object.
    pub config: Map<String, Value>,
}

impl NovelDataRequest {
    fn parse(reference: &Value, novel_id: Option<&str>) -> std::result::Result<Self, String> {
        match reference {
            Value::String(s) => {
                let (kind, identifier) = s
                    .split_once(':')
                    .ok_or_else(|| format!("novel data reference '{s}' is not 'kind:identifier'"))?;
                Ok(Self {
                    kind: kind.trim().to_string(),
                    identifier: identifier.trim().to_string(),
                    novel_id: novel_id.map(str::to_string),
                    config: Map::new(),
                })
            }
            Value::Object(map) => {
                let mut config = map.clone();
                let kind = take_string(&mut config, "kind")
                    .ok_or("novel data reference has no 'kind'")?;
                let identifier = take_string(&mut config, "identifier").unwrap_or_default();
                let novel_id = take_string(&mut config, "novel_id")
                    .or_else(|| novel_id.map(str::to_string));
                Ok(Self {
                    kind,
                    identifier,
                    novel_id,
                    config,
                })
            }
            other => Err(format!("unsupported novel data reference: {other}")),
        }
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Access to novel data held outside the engine (chapters, characters,
/// similarity search results).
///
/// `Ok(None)` means not found, which only fails required parameters. An
/// `Err` fails the step either way.
#[async_trait]
pub trait NovelDataLookup: Send + Sync {
    async fn lookup(&self, request: &NovelDataRequest) -> anyhow::Result<Option<Value>>;
}

/// Inputs a resolution reads from.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionScope<'a> {
    pub user_inputs: &'a HashMap<String, Value>,
    pub novel_id: Option<&'a str>,
    pub context: &'a ExecutionContext,
}

/// Resolves parameter definitions to sanitized values.
#[derive(Clone, Default)]
pub struct ParameterResolver {
    sanitizer: Sanitizer,
    novel_data: Option<Arc<dyn NovelDataLookup>>,
}

impl std::fmt::Debug for ParameterResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterResolver")
            .field("sanitizer", &self.sanitizer)
            .field("has_novel_data", &self.novel_data.is_some())
            .finish()
    }
}

impl ParameterResolver {
    pub fn new(sanitizer: Sanitizer) -> Self {
        Self {
            sanitizer,
            novel_data: None,
        }
    }

    pub fn with_novel_data(mut self, lookup: Arc<dyn NovelDataLookup>) -> Self {
        self.novel_data = Some(lookup);
        self
    }

    /// Resolve every definition. Fails on the first parameter that cannot
    /// be resolved.
    pub async fn resolve(
        &self,
        definitions: &BTreeMap<String, ParameterDefinition>,
        scope: ResolutionScope<'_>,
    ) -> Result<BTreeMap<String, Value>> {
        let mut resolved = BTreeMap::new();
        for (name, definition) in definitions {
            let value = self.resolve_one(name, definition, scope).await?;
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    pub async fn resolve_one(
        &self,
        name: &str,
        definition: &ParameterDefinition,
        scope: ResolutionScope<'_>,
    ) -> Result<Value> {
        let (kind, raw, required) = unwrap_nested(name, definition)?;

        let missing = |reason: String| -> Result<Value> {
            if required {
                Err(ChainError::ParameterResolution {
                    parameter: name.to_string(),
                    reason,
                })
            } else {
                debug!(parameter = name, %reason, "optional parameter resolved to null");
                Ok(Value::Null)
            }
        };

        let value = match kind {
            ParamKind::Literal => raw.clone(),
            ParamKind::UserInput => {
                let key = match raw.as_str() {
                    Some(k) if !k.is_empty() => k,
                    _ => name,
                };
                match scope.user_inputs.get(key).filter(|v| !v.is_null()) {
                    Some(v) => v.clone(),
                    None => return missing(format!("user input '{key}' was not provided")),
                }
            }
            ParamKind::PreviousStepOutput => {
                let path = match raw.as_str() {
                    Some(p) if !p.is_empty() => p,
                    _ => name,
                };
                match scope.context.lookup(path) {
                    Some(v) => v.clone(),
                    None => return missing(format!("variable '{path}' is not set")),
                }
            }
            ParamKind::NovelDataRef => {
                let Some(lookup) = self.novel_data.as_ref() else {
                    return missing("no novel data source configured".into());
                };
                let request = match NovelDataRequest::parse(raw, scope.novel_id) {
                    Ok(request) => request,
                    Err(reason) => return missing(reason),
                };
                let found = lookup.lookup(&request).await.with_context(|| {
                    format!(
                        "novel data lookup for {} '{}' failed",
                        request.kind, request.identifier
                    )
                })?;
                match found.filter(|v| !v.is_null()) {
                    Some(v) => v,
                    None => {
                        return missing(format!(
                            "{} '{}' not found",
                            request.kind, request.identifier
                        ))
                    }
                }
            }
            ParamKind::Nested => {
                return Err(ChainError::ParameterResolution {
                    parameter: name.to_string(),
                    reason: "nested parameter has no inner definition".into(),
                })
            }
        };

        Ok(self.sanitizer.sanitize_value(value))
    }
}

/// Follow nested definitions to the terminal one. A parameter is required
/// if any level says so.
fn unwrap_nested<'d>(
    name: &str,
    definition: &'d ParameterDefinition,
) -> Result<(ParamKind, &'d Value, bool)> {
    let mut current = definition;
    let mut required = definition.required;
    let mut depth = 0;
    loop {
        match &current.value {
            ParamValue::Plain(value) => return Ok((current.kind, value, required)),
            ParamValue::Nested(inner) => {
                depth += 1;
                if depth > MAX_PARAMETER_DEPTH {
                    return Err(ChainError::CyclicOrTooDeepParameter {
                        parameter: name.to_string(),
                        depth,
                    });
                }
                current = inner;
                required |= current.required;
            }
        }
    }
}
