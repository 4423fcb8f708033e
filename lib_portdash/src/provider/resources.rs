//! # Resource Endpoint Table
//!
//! Every (resource, verb) pair the backend supports has exactly one rule that
//! builds the HTTP method, path, query and body for it. The rules live in a
//! static table that is checked for duplicates when the provider loads it, so
//! an unsupported combination is known before any request is attempted.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use reqwest::Method;
use serde_json::Value;

use crate::provider::error::{ProviderError, ProviderResult};

/// Canonical resource names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Brokerage accounts.
    Accounts,
    /// Positions held by one account.
    Positions,
    /// Managed service containers.
    Containers,
    /// Resource statistics for one container.
    ContainerStats,
    /// Backend environment configuration document.
    ConfigEnv,
    /// Account configuration document.
    ConfigAccounts,
    /// Service restart trigger for a configuration type.
    RestartServices,
    /// Push-only system status.
    SystemStatus,
}

impl Resource {
    /// All resources, in table order.
    pub const ALL: [Resource; 8] = [
        Resource::Accounts,
        Resource::Positions,
        Resource::Containers,
        Resource::ContainerStats,
        Resource::ConfigEnv,
        Resource::ConfigAccounts,
        Resource::RestartServices,
        Resource::SystemStatus,
    ];

    /// The canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Accounts => "accounts",
            Resource::Positions => "positions",
            Resource::Containers => "containers",
            Resource::ContainerStats => "container-stats",
            Resource::ConfigEnv => "config-env",
            Resource::ConfigAccounts => "config-accounts",
            Resource::RestartServices => "restart-services",
            Resource::SystemStatus => "system_status",
        }
    }

    /// Field identifying an element of this resource when it carries none of
    /// the generic identity keys. Positions are keyed by their symbol so a
    /// reordered response keeps its ids.
    pub fn natural_key(self) -> Option<&'static str> {
        match self {
            Resource::Positions => Some("symbol"),
            _ => None,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ProviderError::UnknownResource(s.to_string()))
    }
}

/// The fixed verb set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Fetch a collection.
    List,
    /// Fetch one record by id.
    Get,
    /// Fetch the records belonging to a parent.
    GetRelated,
    /// Replace one record.
    Update,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::List => "list",
            Verb::Get => "get",
            Verb::GetRelated => "getRelated",
            Verb::Update => "update",
        };
        f.write_str(name)
    }
}

/// Configuration documents that can be edited and restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigType {
    /// Environment variables of the backend services.
    Env,
    /// Account definitions.
    Accounts,
}

impl ConfigType {
    /// Name used in `config_type` query parameters.
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigType::Env => "env",
            ConfigType::Accounts => "accounts",
        }
    }

    /// The resource holding this configuration document.
    pub fn resource(self) -> Resource {
        match self {
            ConfigType::Env => Resource::ConfigEnv,
            ConfigType::Accounts => Resource::ConfigAccounts,
        }
    }
}

/// Extra query parameters for `list`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    /// Pairs appended to the list URL.
    pub query: Vec<(String, String)>,
}

impl ListParams {
    /// Adds one query pair.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Arguments of one provider call.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    /// `list(resource, params)`
    List(&'a ListParams),
    /// `get(resource, id)`
    Get(&'a str),
    /// `get_related(resource, parent_id)`
    GetRelated(&'a str),
    /// `update(resource, id, body)`
    Update(&'a str, &'a Value),
}

impl Request<'_> {
    /// The verb this request uses.
    pub fn verb(&self) -> Verb {
        match self {
            Request::List(_) => Verb::List,
            Request::Get(_) => Verb::Get,
            Request::GetRelated(_) => Verb::GetRelated,
            Request::Update(..) => Verb::Update,
        }
    }

    fn id(&self) -> &str {
        match self {
            Request::List(_) => "",
            Request::Get(id) | Request::GetRelated(id) | Request::Update(id, _) => id,
        }
    }

    fn query(&self) -> Vec<(String, String)> {
        match self {
            Request::List(params) => params.query.clone(),
            _ => Vec::new(),
        }
    }
}

/// A fully built HTTP call.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute path on the origin.
    pub path: String,
    /// Query pairs.
    pub query: Vec<(String, String)>,
    /// JSON body, if the call sends one.
    pub body: Option<Value>,
}

impl EndpointRequest {
    fn get(path: impl Into<String>, req: &Request<'_>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: req.query(),
            body: None,
        }
    }
}

/// One entry of the endpoint table.
#[derive(Clone, Copy)]
pub struct EndpointRule {
    /// Resource served.
    pub resource: Resource,
    /// Verb served.
    pub verb: Verb,
    /// Builds the HTTP call from the request arguments.
    pub build: fn(&Request<'_>) -> EndpointRequest,
}

/// Percent-encodes one path segment.
fn segment(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn accounts_list(req: &Request<'_>) -> EndpointRequest {
    EndpointRequest::get("/api/dashboard/accounts", req)
}

fn accounts_get(req: &Request<'_>) -> EndpointRequest {
    EndpointRequest::get(format!("/api/dashboard/accounts/{}", segment(req.id())), req)
}

fn account_positions(req: &Request<'_>) -> EndpointRequest {
    EndpointRequest::get(format!("/api/dashboard/accounts/{}/positions", segment(req.id())), req)
}

fn containers_list(req: &Request<'_>) -> EndpointRequest {
    EndpointRequest::get("/api/containers", req)
}

fn container_stats(req: &Request<'_>) -> EndpointRequest {
    EndpointRequest::get(format!("/api/containers/{}/stats", segment(req.id())), req)
}

fn config_env_get(req: &Request<'_>) -> EndpointRequest {
    EndpointRequest::get("/api/config/env", req)
}

fn config_accounts_get(req: &Request<'_>) -> EndpointRequest {
    EndpointRequest::get("/api/config/accounts", req)
}

fn config_put(path: &str, req: &Request<'_>) -> EndpointRequest {
    let body = match req {
        Request::Update(_, body) => Some((*body).clone()),
        _ => None,
    };
    EndpointRequest {
        method: Method::PUT,
        path: path.to_string(),
        query: Vec::new(),
        body,
    }
}

fn config_env_put(req: &Request<'_>) -> EndpointRequest {
    config_put("/api/config/env", req)
}

fn config_accounts_put(req: &Request<'_>) -> EndpointRequest {
    config_put("/api/config/accounts", req)
}

fn restart_services(req: &Request<'_>) -> EndpointRequest {
    EndpointRequest {
        method: Method::POST,
        path: "/api/config/restart-services".to_string(),
        query: vec![("config_type".to_string(), req.id().to_string())],
        body: None,
    }
}

/// The backend endpoint table.
pub static ENDPOINTS: &[EndpointRule] = &[
    EndpointRule { resource: Resource::Accounts, verb: Verb::List, build: accounts_list },
    EndpointRule { resource: Resource::Accounts, verb: Verb::Get, build: accounts_get },
    EndpointRule { resource: Resource::Positions, verb: Verb::GetRelated, build: account_positions },
    EndpointRule { resource: Resource::Containers, verb: Verb::List, build: containers_list },
    EndpointRule { resource: Resource::ContainerStats, verb: Verb::GetRelated, build: container_stats },
    EndpointRule { resource: Resource::ConfigEnv, verb: Verb::List, build: config_env_get },
    EndpointRule { resource: Resource::ConfigEnv, verb: Verb::Get, build: config_env_get },
    EndpointRule { resource: Resource::ConfigEnv, verb: Verb::Update, build: config_env_put },
    EndpointRule { resource: Resource::ConfigAccounts, verb: Verb::List, build: config_accounts_get },
    EndpointRule { resource: Resource::ConfigAccounts, verb: Verb::Get, build: config_accounts_get },
    EndpointRule { resource: Resource::ConfigAccounts, verb: Verb::Update, build: config_accounts_put },
    EndpointRule { resource: Resource::RestartServices, verb: Verb::Update, build: restart_services },
];

/// Validated lookup over a rule table.
#[derive(Clone)]
pub struct EndpointTable {
    rules: HashMap<(Resource, Verb), EndpointRule>,
}

impl EndpointTable {
    /// Loads the backend table.
    pub fn load() -> ProviderResult<Self> {
        Self::from_rules(ENDPOINTS)
    }

    /// Loads `rules`, rejecting duplicate (resource, verb) pairs.
    pub fn from_rules(rules: &[EndpointRule]) -> ProviderResult<Self> {
        let mut map = HashMap::with_capacity(rules.len());
        for rule in rules {
            if map.insert((rule.resource, rule.verb), *rule).is_some() {
                return Err(ProviderError::DuplicateEndpoint {
                    resource: rule.resource,
                    verb: rule.verb,
                });
            }
        }
        Ok(Self { rules: map })
    }

    /// True if `resource` supports `verb`.
    pub fn supports(&self, resource: Resource, verb: Verb) -> bool {
        self.rules.contains_key(&(resource, verb))
    }

    /// Builds the HTTP call for `request`, or fails with `NotSupported`.
    pub fn build(&self, resource: Resource, request: &Request<'_>) -> ProviderResult<EndpointRequest> {
        let verb = request.verb();
        let rule = self
            .rules
            .get(&(resource, verb))
            .ok_or(ProviderError::NotSupported { resource, verb })?;
        Ok((rule.build)(request))
    }
}

impl fmt::Debug for EndpointTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointTable").field("rules", &self.rules.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_names_round_trip() {
        for r in Resource::ALL {
            assert_eq!(r.as_str().parse::<Resource>().unwrap(), r);
        }
        assert!(matches!(
            "env-config".parse::<Resource>(),
            Err(ProviderError::UnknownResource(name)) if name == "env-config"
        ));
    }

    #[test]
    fn test_backend_table_loads() {
        let table = EndpointTable::load().unwrap();
        assert!(table.supports(Resource::Accounts, Verb::List));
        assert!(table.supports(Resource::ConfigEnv, Verb::Update));
        assert!(!table.supports(Resource::Accounts, Verb::Update));
        assert!(!table.supports(Resource::SystemStatus, Verb::List));
    }

    #[test]
    fn test_duplicate_rules_rejected() {
        let rules = [
            EndpointRule { resource: Resource::Accounts, verb: Verb::List, build: accounts_list },
            EndpointRule { resource: Resource::Accounts, verb: Verb::List, build: containers_list },
        ];
        assert!(matches!(
            EndpointTable::from_rules(&rules),
            Err(ProviderError::DuplicateEndpoint { resource: Resource::Accounts, verb: Verb::List })
        ));
    }

    #[test]
    fn test_builds_paths_and_bodies() {
        let table = EndpointTable::load().unwrap();

        let positions = table.build(Resource::Positions, &Request::GetRelated("DU 1/2")).unwrap();
        assert_eq!(positions.method, Method::GET);
        assert_eq!(positions.path, "/api/dashboard/accounts/DU%201%2F2/positions");

        let body = json!({"A": "1"});
        let put = table.build(Resource::ConfigEnv, &Request::Update("id1", &body)).unwrap();
        assert_eq!(put.method, Method::PUT);
        assert_eq!(put.path, "/api/config/env");
        assert_eq!(put.body, Some(body));

        let restart = table.build(Resource::RestartServices, &Request::Update("env", &Value::Null)).unwrap();
        assert_eq!(restart.method, Method::POST);
        assert_eq!(restart.query, vec![("config_type".to_string(), "env".to_string())]);

        let params = ListParams::default().with("status", "running");
        let list = table.build(Resource::Containers, &Request::List(&params)).unwrap();
        assert_eq!(list.query, params.query);
    }

    #[test]
    fn test_unsupported_combination() {
        let table = EndpointTable::load().unwrap();
        let err = table.build(Resource::Containers, &Request::Get("c1")).unwrap_err();
        assert!(err.is_not_supported());
        assert_eq!(err.to_string(), "Operation get is not supported for resource containers");
    }
}
