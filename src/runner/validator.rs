use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::Regex;

use crate::errors::RunnerError;
use crate::models::config::ScriptSpec;

/// A script entry with its argument pattern compiled once at load time.
#[derive(Debug)]
pub struct RegisteredScript {
    pub spec: ScriptSpec,
    pattern: Option<Regex>,
}

impl RegisteredScript {
    fn arg_matches(&self, arg: &str) -> bool {
        match &self.pattern {
            Some(p) => p.is_match(arg),
            None => true,
        }
    }
}

/// Immutable registry of everything this daemon is allowed to execute,
/// keyed by script id. Built once from configuration; duplicate ids and
/// invalid patterns are rejected at construction.
#[derive(Debug)]
pub struct ScriptRegistry {
    scripts: HashMap<String, RegisteredScript>,
}

impl ScriptRegistry {
    pub fn from_specs(specs: &[ScriptSpec]) -> Result<Self> {
        let mut scripts = HashMap::new();
        for spec in specs {
            let pattern = spec
                .args
                .item_pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .with_context(|| format!("Invalid itemPattern for script '{}'", spec.id))?;
            let entry = RegisteredScript {
                spec: spec.clone(),
                pattern,
            };
            if scripts.insert(spec.id.clone(), entry).is_some() {
                anyhow::bail!("Duplicate script id '{}'", spec.id);
            }
        }
        Ok(Self { scripts })
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredScript> {
        self.scripts.get(id)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Check a run request against the registry, returning the resolved script.
///
/// Checks run in order: script lookup, argument count, then per-argument
/// length and pattern. The pattern applies to each argument individually,
/// exactly as the operator wrote it.
pub fn validate<'a>(
    registry: &'a ScriptRegistry,
    script_id: &str,
    args: &[String],
) -> Result<&'a RegisteredScript, RunnerError> {
    let script = registry
        .get(script_id)
        .ok_or_else(|| RunnerError::ScriptNotFound(script_id.to_string()))?;

    let policy = &script.spec.args;
    if args.len() > policy.max_items {
        return Err(RunnerError::InvalidArgs(format!(
            "too many arguments: {} exceeds the limit of {}",
            args.len(),
            policy.max_items
        )));
    }

    for (i, arg) in args.iter().enumerate() {
        if arg.len() > policy.item_max_length {
            return Err(RunnerError::InvalidArgs(format!(
                "argument {} is {} bytes, exceeding the limit of {}",
                i,
                arg.len(),
                policy.item_max_length
            )));
        }
        if !script.arg_matches(arg) {
            return Err(RunnerError::InvalidArgs(format!(
                "argument {} does not match the allowed pattern",
                i
            )));
        }
    }

    Ok(script)
}
