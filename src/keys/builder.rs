//! Admission key generation.

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{trace, warn};

use super::client_ip::resolve_client_ip;
use super::CallIdentity;
use crate::config::AdmissionConfig;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::Scope;

/// Builds namespaced store keys from a [`CallIdentity`].
///
/// Keys are deterministic: the same call, scope and template always produce
/// the same key, on every instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    rate_limit_prefix: String,
    duplicate_prefix: String,
}

impl KeyBuilder {
    pub fn new(rate_limit_prefix: impl Into<String>, duplicate_prefix: impl Into<String>) -> Self {
        Self {
            rate_limit_prefix: rate_limit_prefix.into(),
            duplicate_prefix: duplicate_prefix.into(),
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(&config.rate_limit_prefix, &config.duplicate_prefix)
    }

    pub fn rate_limit_prefix(&self) -> &str {
        &self.rate_limit_prefix
    }

    pub fn duplicate_prefix(&self) -> &str {
        &self.duplicate_prefix
    }

    /// Key for a rate limit on `call` partitioned by `scope`.
    ///
    /// A non-empty `template` is rendered against the call's arguments and
    /// appended as a final `:`-separated segment.
    pub fn rate_limit_key(&self, call: &CallIdentity, scope: Scope, template: Option<&str>) -> String {
        let prefix = &self.rate_limit_prefix;
        let mut key = match scope {
            Scope::Api => format!("{}api:{}", prefix, call.operation()),
            Scope::User => format!("{}user:{}:{}", prefix, call.principal_or_anonymous(), call.operation()),
            Scope::Ip => format!("{}ip:{}:{}", prefix, resolve_client_ip(&call.client), call.operation()),
            Scope::Global => format!("{}global", prefix),
        };
        append_template(&mut key, call, template);

        trace!(key = %key, scope = %scope, "Built rate limit key");
        key
    }

    /// Key for a duplicate-submission lock on `call`.
    ///
    /// With `include_args`, a digest of the argument values is appended so
    /// only resubmissions with identical arguments collide.
    pub fn duplicate_key(&self, call: &CallIdentity, template: Option<&str>, include_args: bool) -> String {
        let mut key = format!(
            "{}{}:{}",
            self.duplicate_prefix,
            call.principal_or_anonymous(),
            call.operation()
        );
        append_template(&mut key, call, template);
        if include_args {
            key.push(':');
            key.push_str(&args_digest(&call.args));
        }

        trace!(key = %key, "Built duplicate lock key");
        key
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::from_config(&AdmissionConfig::default())
    }
}

fn append_template(key: &mut String, call: &CallIdentity, template: Option<&str>) {
    let Some(template) = template.filter(|t| !t.is_empty()) else {
        return;
    };
    match render_template(template, call) {
        Ok(rendered) => {
            key.push(':');
            key.push_str(&rendered);
        }
        Err(e) => warn!(key = %key, template = %template, error = %e, "Key template failed, using base key"),
    }
}

/// Render `{arg.field...}` placeholders against the call's arguments.
pub(crate) fn render_template(template: &str, call: &CallIdentity) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find(is_brace) {
        if rest.as_bytes()[open] == b'}' {
            return Err(template_error(template, "unmatched '}'"));
        }
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find(is_brace)
            .filter(|&i| after.as_bytes()[i] == b'}')
            .ok_or_else(|| template_error(template, "unclosed '{'"))?;

        let path = after[..close].trim();
        let value = lookup(call, path).ok_or_else(|| template_error(template, &format!("unresolved '{}'", path)))?;
        out.push_str(&render_value(value));
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn is_brace(c: char) -> bool {
    c == '{' || c == '}'
}

fn lookup<'a>(call: &'a CallIdentity, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut value = call.arg(segments.next().filter(|s| !s.is_empty())?)?;
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn template_error(template: &str, reason: &str) -> FloodgateError {
    FloodgateError::Config(format!("key template '{}': {}", template, reason))
}

/// SHA-256 over the compact JSON of each argument value, comma separated.
fn args_digest(args: &[(String, Value)]) -> String {
    let joined = args
        .iter()
        .map(|(_, v)| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("{:x}", Sha256::digest(joined.as_bytes()))
}
