//! Compose manifest rendering
//!
//! Structured parameters rewrite whole `ports`, `volumes` and `environment`
//! sections per service. Legacy raw environment pairs are merged into every
//! service and substituted into `${VAR}` placeholders instead.

use std::collections::HashMap;

use openapi_client::models::DeploymentParameter;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::deploy::params::{group_parameters, is_self_placeholder, ParamGroup, ParamKind};
use crate::errors::PanelError;

fn parse(compose: &str) -> Result<Value, PanelError> {
    let doc: Value = serde_yaml::from_str(compose)?;
    if !doc.is_mapping() {
        return Err(PanelError::ValidationError(
            "compose manifest must be a mapping".to_string(),
        ));
    }
    Ok(doc)
}

fn services_mut(doc: &mut Value) -> Result<&mut Mapping, PanelError> {
    doc.get_mut("services")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| PanelError::ValidationError("compose manifest has no services".to_string()))
}

/// Check a manifest parses and declares services
pub fn validate(compose: &str) -> Result<(), PanelError> {
    let mut doc = parse(compose)?;
    services_mut(&mut doc)?;
    Ok(())
}

/// Entries a group writes into its section, `None` when the kind rewrites nothing
fn group_section(group: &ParamGroup<'_>) -> Option<Value> {
    match group.kind {
        ParamKind::Port | ParamKind::Volume => {
            let entries: Vec<Value> = group
                .params
                .iter()
                .filter(|p| !p.name.trim().is_empty() && !p.default.trim().is_empty())
                .map(|p| Value::String(format!("{}:{}", p.name.trim(), p.default.trim())))
                .collect();
            (!entries.is_empty()).then_some(Value::Sequence(entries))
        }
        ParamKind::Env => {
            let mut env = Mapping::new();
            for p in &group.params {
                let name = p.name.trim();
                if name.is_empty() || p.default.is_empty() || is_self_placeholder(name, &p.default) {
                    continue;
                }
                env.insert(Value::String(name.to_string()), Value::String(p.default.clone()));
            }
            (!env.is_empty()).then_some(Value::Mapping(env))
        }
        ParamKind::Hardware | ParamKind::Other => None,
    }
}

/// Apply structured parameters to a manifest.
///
/// A `(service, kind)` group replaces the service's section only when it yields
/// at least one entry. Groups naming a service the manifest lacks are skipped.
pub fn render(compose: &str, params: &[DeploymentParameter]) -> Result<String, PanelError> {
    let mut doc = parse(compose)?;
    let services = services_mut(&mut doc)?;

    for group in group_parameters(params) {
        let Some(section) = group.kind.section() else {
            continue;
        };
        let Some(service) = services
            .get_mut(group.service)
            .and_then(Value::as_mapping_mut)
        else {
            debug!("service {} not in manifest, skipping {} parameters", group.service, section);
            continue;
        };
        if let Some(entries) = group_section(&group) {
            service.insert(Value::String(section.to_string()), entries);
        }
    }

    Ok(serde_yaml::to_string(&doc)?)
}

/// Replace `${NAME}`, `${NAME:-default}` and similar expressions whose name is
/// present in `env`. Unknown names and `$${...}` escapes are left untouched.
pub fn substitute_placeholders(text: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find("${") {
        let escaped = pos > 0 && rest.as_bytes()[pos - 1] == b'$';
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[pos..]);
            return out;
        };
        let expr = &after[..close];
        let name = expr
            .split([':', '-', '?', '+'])
            .next()
            .unwrap_or_default();
        match env.get(name) {
            Some(value) if !escaped => out.push_str(value),
            _ => {
                out.push_str("${");
                out.push_str(expr);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn merge_environment(service: &mut Mapping, env: &[(&String, &String)]) {
    let key = Value::String("environment".to_string());
    match service.get_mut(&key) {
        Some(Value::Mapping(map)) => {
            for (k, v) in env {
                map.insert(Value::String((*k).clone()), Value::String((*v).clone()));
            }
        }
        Some(Value::Sequence(list)) => {
            for (k, v) in env {
                let entry = Value::String(format!("{}={}", k, v));
                let existing = list.iter_mut().find(|item| {
                    item.as_str()
                        .map(|s| s.split('=').next() == Some(k.as_str()))
                        .unwrap_or(false)
                });
                match existing {
                    Some(item) => *item = entry,
                    None => list.push(entry),
                }
            }
        }
        _ => {
            let mut map = Mapping::new();
            for (k, v) in env {
                map.insert(Value::String((*k).clone()), Value::String((*v).clone()));
            }
            service.insert(key, Value::Mapping(map));
        }
    }
}

/// Inject raw environment pairs into every service and resolve placeholders
pub fn render_legacy(compose: &str, env: &HashMap<String, String>) -> Result<String, PanelError> {
    let substituted = substitute_placeholders(compose, env);
    let mut doc = parse(&substituted)?;
    let services = services_mut(&mut doc)?;

    let mut pairs: Vec<(&String, &String)> = env.iter().collect();
    pairs.sort();

    for (_, service) in services.iter_mut() {
        if let Some(service) = service.as_mapping_mut() {
            merge_environment(service, &pairs);
        }
    }

    Ok(serde_yaml::to_string(&doc)?)
}
