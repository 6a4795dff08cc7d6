//! Request variables and predicate evaluation
//!
//! Route predicates are `[variable, operator, value]` triples evaluated
//! against request attributes: `uri`, `method`, `host`, `remote_addr`,
//! `arg_<name>` (query), `cookie_<name>`, `http_<header>`, and any named
//! value a plugin registered on the context.

use crate::store::types::{VarOp, VarPredicate};
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;

/// Request attributes predicates resolve against
#[derive(Debug, Clone, Default)]
pub struct RequestVars {
    pub uri: String,
    pub method: String,
    pub host: Option<String>,
    pub remote_addr: Option<IpAddr>,
    /// Parsed query parameters
    pub args: HashMap<String, String>,
    /// Header name (lowercased, `-` as `_`) → value
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    /// Named context values registered by plugins
    pub extra: HashMap<String, String>,
}

impl RequestVars {
    /// Resolve a variable by name; `None` when the attribute is absent.
    /// Query and cookie lookups accept both the `arg_x`/`cookie_x` and
    /// the dotted `args.x`/`cookie.x` spellings.
    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(arg) = name.strip_prefix("arg_").or_else(|| name.strip_prefix("args.")) {
            return self.args.get(arg).cloned();
        }
        if let Some(cookie) = name
            .strip_prefix("cookie_")
            .or_else(|| name.strip_prefix("cookie."))
        {
            return self.cookies.get(cookie).cloned();
        }
        if let Some(header) = name.strip_prefix("http_") {
            return self.headers.get(header).cloned();
        }
        match name {
            "uri" => Some(self.uri.clone()),
            "method" | "request_method" => Some(self.method.clone()),
            "host" => self.host.clone(),
            "remote_addr" => self.remote_addr.map(|ip| ip.to_string()),
            _ => self.extra.get(name).cloned(),
        }
    }

    /// Parse a raw query string into `args`
    pub fn set_query(&mut self, query: &str) {
        self.args.clear();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((k, v)) => self.args.insert(k.to_string(), v.to_string()),
                None => self.args.insert(pair.to_string(), String::new()),
            };
        }
    }

    /// Parse a `Cookie:` header value into `cookies`
    pub fn set_cookies(&mut self, header: &str) {
        self.cookies.clear();
        for pair in header.split(';') {
            if let Some((k, v)) = pair.split_once('=') {
                self.cookies.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
}

/// Normalize a header name into variable form: `X-API-Key` → `x_api_key`
pub fn header_var_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}

/// A predicate with its regex compiled once at router build time
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    pred: VarPredicate,
    regex: Option<Regex>,
}

impl CompiledPredicate {
    pub fn compile(pred: &VarPredicate) -> crate::error::Result<Self> {
        let regex = if pred.op == VarOp::Regex {
            let pattern = pred.value.as_str().ok_or_else(|| {
                crate::error::GatewayError::Config(format!(
                    "Predicate on '{}' uses ~~ with a non-string pattern",
                    pred.var
                ))
            })?;
            Some(Regex::new(pattern).map_err(|e| {
                crate::error::GatewayError::Config(format!(
                    "Predicate on '{}' has invalid regex: {}",
                    pred.var, e
                ))
            })?)
        } else {
            None
        };
        Ok(Self {
            pred: pred.clone(),
            regex,
        })
    }

    pub fn var(&self) -> &str {
        &self.pred.var
    }

    /// Evaluate against the request. An absent variable satisfies only `!=`.
    pub fn holds(&self, vars: &RequestVars) -> bool {
        let actual = vars.get(&self.pred.var);
        match self.pred.op {
            VarOp::Has => actual.is_some(),
            VarOp::Eq => actual.map(|a| a == expected_str(&self.pred.value)).unwrap_or(false),
            VarOp::Ne => actual
                .map(|a| a != expected_str(&self.pred.value))
                .unwrap_or(true),
            VarOp::Gt => numeric(&actual, &self.pred.value, |a, b| a > b),
            VarOp::Lt => numeric(&actual, &self.pred.value, |a, b| a < b),
            VarOp::Ge => numeric(&actual, &self.pred.value, |a, b| a >= b),
            VarOp::Le => numeric(&actual, &self.pred.value, |a, b| a <= b),
            VarOp::Regex => match (&actual, &self.regex) {
                (Some(a), Some(re)) => re.is_match(a),
                _ => false,
            },
            VarOp::In => match (&actual, self.pred.value.as_array()) {
                (Some(a), Some(items)) => items.iter().any(|item| expected_str(item) == *a),
                _ => false,
            },
        }
    }
}

fn expected_str(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn numeric(actual: &Option<String>, expected: &serde_json::Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    let a = match actual.as_ref().and_then(|s| s.parse::<f64>().ok()) {
        Some(a) => a,
        None => return false,
    };
    let b = match expected.as_f64().or_else(|| expected.as_str().and_then(|s| s.parse().ok())) {
        Some(b) => b,
        None => return false,
    };
    cmp(a, b)
}
