//! Deployment parameter kinds and grouping

use openapi_client::models::DeploymentParameter;

/// What part of a service a parameter rewrites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKind {
    /// `host:container` entry of `ports`
    Port,
    /// `host:container` entry of `volumes`
    Volume,
    /// `KEY=value` entry of `environment`
    Env,
    /// Device passthrough, informational only
    Hardware,
    Other,
}

impl ParamKind {
    pub fn from_param_type(param_type: &str) -> Self {
        match param_type.trim().to_lowercase().as_str() {
            "port" => ParamKind::Port,
            "path" | "volume" => ParamKind::Volume,
            "env" | "environment" => ParamKind::Env,
            "hardware" => ParamKind::Hardware,
            _ => ParamKind::Other,
        }
    }

    /// Compose section this kind replaces, if any
    pub fn section(self) -> Option<&'static str> {
        match self {
            ParamKind::Port => Some("ports"),
            ParamKind::Volume => Some("volumes"),
            ParamKind::Env => Some("environment"),
            ParamKind::Hardware | ParamKind::Other => None,
        }
    }
}

/// Parameters sharing a service and a kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamGroup<'a> {
    pub service: &'a str,
    pub kind: ParamKind,
    pub params: Vec<&'a DeploymentParameter>,
}

/// Group by `(serviceName, kind)` in order of first appearance. Parameters
/// without a service name are not tied to any manifest section and are skipped.
pub fn group_parameters(params: &[DeploymentParameter]) -> Vec<ParamGroup<'_>> {
    let mut groups: Vec<ParamGroup<'_>> = Vec::new();
    for param in params {
        let service = param.service_name.trim();
        if service.is_empty() {
            continue;
        }
        let kind = ParamKind::from_param_type(&param.param_type);
        match groups
            .iter_mut()
            .find(|g| g.service == service && g.kind == kind)
        {
            Some(group) => group.params.push(param),
            None => groups.push(ParamGroup {
                service,
                kind,
                params: vec![param],
            }),
        }
    }
    groups
}

/// `${NAME}` with the name itself as value is an unfilled placeholder
pub fn is_self_placeholder(name: &str, value: &str) -> bool {
    let value = value.trim();
    value == format!("${{{}}}", name) || value == format!("${}", name)
}

/// Host port a port parameter binds, from `port` or `ip:port`
pub fn host_port(param: &DeploymentParameter) -> Option<u16> {
    let name = param.name.trim();
    name.rsplit(':').next()?.trim().parse().ok()
}
