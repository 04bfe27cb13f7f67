//! In-memory routing model: nodes, their endpoints, and the entry points that
//! route a domain + path to a node.

use serde::Serialize;
use thiserror::Error;

/// Errors raised when a mutation would break a model invariant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("node '{0}' already exists")]
    DuplicateNodeId(String),

    #[error("entry point references unknown node '{0}'")]
    UnknownNodeId(String),

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("node '{0}' has no endpoints")]
    MissingEndpoint(String),

    #[error("node '{node_id}' has {len} endpoint(s), index {index} is out of range")]
    EndpointIndexOutOfRange {
        node_id: String,
        index: usize,
        len: usize,
    },

    #[error("invalid node id '{node_id}': {reason}")]
    InvalidNodeId { node_id: String, reason: &'static str },

    #[error("node id '{0}' is reserved")]
    ReservedNodeId(String),

    #[error("entry point {domain}{path} already exists")]
    DuplicateEntryPoint { domain: String, path: String },

    #[error("invalid {field} '{value}': {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// A single forwarding destination under a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub destination: String,
}

impl Endpoint {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
        }
    }
}

/// A registered backend service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Opaque credential supplied by the node; never exposed in listings
    #[serde(skip_serializing)]
    pub key: String,
    /// Stable identity, also used as the per-node config file name
    pub node_id: String,
    pub endpoints: Vec<Endpoint>,
}

impl Node {
    /// Create a node with a single endpoint
    pub fn new(key: impl Into<String>, node_id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            node_id: node_id.into(),
            endpoints: vec![Endpoint::new(destination)],
        }
    }

    /// The endpoint entry points forward to
    pub fn primary_endpoint(&self) -> Option<&Endpoint> {
        self.endpoints.first()
    }

    fn validate(&self) -> Result<(), ModelError> {
        validate_node_id(&self.node_id)?;
        if self.endpoints.is_empty() {
            return Err(ModelError::MissingEndpoint(self.node_id.clone()));
        }
        for endpoint in &self.endpoints {
            validate_endpoint(&endpoint.destination)?;
        }
        Ok(())
    }
}

/// A domain + path routing rule pointing at a node by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryPoint {
    pub domain: String,
    pub path: String,
    pub node_id: String,
}

impl EntryPoint {
    pub fn new(domain: impl Into<String>, path: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            path: path.into(),
            node_id: node_id.into(),
        }
    }

    fn validate(&self) -> Result<(), ModelError> {
        validate_directive_value("domain", &self.domain)?;
        validate_directive_value("path", &self.path)?;
        if !self.path.starts_with('/') {
            return Err(ModelError::InvalidValue {
                field: "path",
                value: self.path.clone(),
                reason: "must start with '/'",
            });
        }
        Ok(())
    }
}

/// Result of comparing a node's own view of its endpoint with the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum NodeActivity {
    /// The registry holds the claimed endpoint
    Match,
    /// The node is known but the registry forwards elsewhere
    Conflict { existing: String, claimed: String },
    /// No node with that id is registered
    Unknown,
}

/// The full registry of nodes and entry points.
///
/// Insertion order of both sequences is preserved; it decides the order in
/// which server blocks are emitted and therefore their precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingModel {
    nodes: Vec<Node>,
    entry_points: Vec<EntryPoint>,
}

impl RoutingModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    pub fn find_node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    fn find_node_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }

    /// Append a node; fails if the id is taken or the node has no endpoints
    pub fn add_node(&mut self, node: Node) -> Result<(), ModelError> {
        node.validate()?;
        if self.find_node(&node.node_id).is_some() {
            return Err(ModelError::DuplicateNodeId(node.node_id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Append an entry point; fails if the referenced node is absent or the
    /// domain + path pair is already routed
    pub fn add_entry_point(&mut self, entry_point: EntryPoint) -> Result<(), ModelError> {
        entry_point.validate()?;
        if self.find_node(&entry_point.node_id).is_none() {
            return Err(ModelError::UnknownNodeId(entry_point.node_id));
        }
        if self
            .entry_points
            .iter()
            .any(|e| e.domain == entry_point.domain && e.path == entry_point.path)
        {
            return Err(ModelError::DuplicateEntryPoint {
                domain: entry_point.domain,
                path: entry_point.path,
            });
        }
        self.entry_points.push(entry_point);
        Ok(())
    }

    /// Replace the first endpoint of a node
    pub fn update_node_endpoint(&mut self, node_id: &str, endpoint: Endpoint) -> Result<(), ModelError> {
        self.update_endpoint_at(node_id, 0, endpoint)
    }

    /// Replace the endpoint at `index` of a node
    pub fn update_endpoint_at(
        &mut self,
        node_id: &str,
        index: usize,
        endpoint: Endpoint,
    ) -> Result<(), ModelError> {
        validate_endpoint(&endpoint.destination)?;
        let node = self
            .find_node_mut(node_id)
            .ok_or_else(|| ModelError::NodeNotFound(node_id.to_string()))?;
        let len = node.endpoints.len();
        let slot = node
            .endpoints
            .get_mut(index)
            .ok_or_else(|| ModelError::EndpointIndexOutOfRange {
                node_id: node_id.to_string(),
                index,
                len,
            })?;
        *slot = endpoint;
        Ok(())
    }

    /// Resolve an entry point to its node
    pub fn resolve(&self, entry_point: &EntryPoint) -> Result<&Node, ModelError> {
        self.find_node(&entry_point.node_id)
            .ok_or_else(|| ModelError::UnknownNodeId(entry_point.node_id.clone()))
    }

    /// Compare what a node believes its endpoint to be with what is recorded
    pub fn check_node_active(&self, node_id: &str, claimed: &str) -> NodeActivity {
        match self.find_node(node_id).and_then(Node::primary_endpoint) {
            Some(existing) if existing.destination == claimed => NodeActivity::Match,
            Some(existing) => NodeActivity::Conflict {
                existing: existing.destination.clone(),
                claimed: claimed.to_string(),
            },
            None => NodeActivity::Unknown,
        }
    }
}

/// Node ids name files on disk, so only a conservative character set is allowed
pub fn validate_node_id(node_id: &str) -> Result<(), ModelError> {
    let invalid = |reason| ModelError::InvalidNodeId {
        node_id: node_id.to_string(),
        reason,
    };

    if node_id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if node_id.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if !node_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(invalid("only ASCII letters, digits, '.', '-' and '_' are allowed"));
    }
    Ok(())
}

// Values are interpolated into nginx directives verbatim.
fn validate_directive_value(field: &'static str, value: &str) -> Result<(), ModelError> {
    let invalid = |reason| ModelError::InvalidValue {
        field,
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ';' | '{' | '}' | '"' | '\''))
    {
        return Err(invalid("contains characters not allowed in proxy configuration"));
    }
    Ok(())
}

/// Schemes nginx accepts in `proxy_pass`
const ENDPOINT_SCHEMES: &[&str] = &["http://", "https://", "unix:"];

// `$` would turn the destination into a runtime variable lookup
fn validate_endpoint(destination: &str) -> Result<(), ModelError> {
    validate_directive_value("endpoint", destination)?;
    let invalid = |reason| ModelError::InvalidValue {
        field: "endpoint",
        value: destination.to_string(),
        reason,
    };

    if !ENDPOINT_SCHEMES.iter().any(|scheme| destination.starts_with(scheme)) {
        return Err(invalid("must start with http://, https:// or unix:"));
    }
    if destination.contains('$') {
        return Err(invalid("must not contain '$'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with_node() -> RoutingModel {
        let mut model = RoutingModel::new();
        model
            .add_node(Node::new("secret", "a", "http://10.0.0.1:9000"))
            .unwrap();
        model
    }

    #[test]
    fn test_add_node_preserves_order() {
        let mut model = RoutingModel::new();
        model.add_node(Node::new("k", "b", "http://b")).unwrap();
        model.add_node(Node::new("k", "a", "http://a")).unwrap();

        let ids: Vec<_> = model.nodes().iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_add_duplicate_node_leaves_model_unchanged() {
        let mut model = model_with_node();
        let before = model.clone();

        let err = model
            .add_node(Node::new("other", "a", "http://10.0.0.2:9000"))
            .unwrap_err();

        assert_eq!(err, ModelError::DuplicateNodeId("a".to_string()));
        assert_eq!(model, before);
    }

    #[test]
    fn test_add_node_without_endpoints_rejected() {
        let mut model = RoutingModel::new();
        let node = Node {
            key: "k".to_string(),
            node_id: "empty".to_string(),
            endpoints: Vec::new(),
        };

        assert_eq!(
            model.add_node(node).unwrap_err(),
            ModelError::MissingEndpoint("empty".to_string())
        );
        assert!(model.nodes().is_empty());
    }

    #[test]
    fn test_add_entry_point_unknown_node() {
        let mut model = model_with_node();
        let before = model.clone();

        let err = model
            .add_entry_point(EntryPoint::new("x.example.com", "/", "missing"))
            .unwrap_err();

        assert_eq!(err, ModelError::UnknownNodeId("missing".to_string()));
        assert_eq!(model, before);
    }

    #[test]
    fn test_add_entry_point_resolves() {
        let mut model = model_with_node();
        model
            .add_entry_point(EntryPoint::new("a.example.com", "/api", "a"))
            .unwrap();

        let entry = &model.entry_points()[0];
        assert_eq!(model.resolve(entry).unwrap().node_id, "a");
    }

    #[test]
    fn test_entry_point_path_must_be_absolute() {
        let mut model = model_with_node();
        let err = model
            .add_entry_point(EntryPoint::new("a.example.com", "api", "a"))
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidValue { field: "path", .. }));
    }

    #[test]
    fn test_update_node_endpoint_replaces_first() {
        let mut model = RoutingModel::new();
        let mut node = Node::new("k", "multi", "http://one");
        node.endpoints.push(Endpoint::new("http://two"));
        model.add_node(node).unwrap();

        model
            .update_node_endpoint("multi", Endpoint::new("http://uno"))
            .unwrap();

        let node = model.find_node("multi").unwrap();
        assert_eq!(node.endpoints[0].destination, "http://uno");
        assert_eq!(node.endpoints[1].destination, "http://two");
    }

    #[test]
    fn test_update_endpoint_at_index() {
        let mut model = RoutingModel::new();
        let mut node = Node::new("k", "multi", "http://one");
        node.endpoints.push(Endpoint::new("http://two"));
        model.add_node(node).unwrap();

        model
            .update_endpoint_at("multi", 1, Endpoint::new("http://dos"))
            .unwrap();
        assert_eq!(
            model.find_node("multi").unwrap().endpoints[1].destination,
            "http://dos"
        );

        let err = model
            .update_endpoint_at("multi", 2, Endpoint::new("http://tres"))
            .unwrap_err();
        assert_eq!(
            err,
            ModelError::EndpointIndexOutOfRange {
                node_id: "multi".to_string(),
                index: 2,
                len: 2
            }
        );
    }

    #[test]
    fn test_update_unknown_node() {
        let mut model = model_with_node();
        assert_eq!(
            model
                .update_node_endpoint("nope", Endpoint::new("http://x"))
                .unwrap_err(),
            ModelError::NodeNotFound("nope".to_string())
        );
    }

    #[test]
    fn test_check_node_active() {
        let model = model_with_node();

        assert_eq!(
            model.check_node_active("a", "http://10.0.0.1:9000"),
            NodeActivity::Match
        );
        assert_eq!(
            model.check_node_active("a", "http://10.0.0.9:9000"),
            NodeActivity::Conflict {
                existing: "http://10.0.0.1:9000".to_string(),
                claimed: "http://10.0.0.9:9000".to_string(),
            }
        );
        assert_eq!(
            model.check_node_active("b", "http://10.0.0.1:9000"),
            NodeActivity::Unknown
        );
    }

    #[test]
    fn test_node_id_validation() {
        assert!(validate_node_id("svc1").is_ok());
        assert!(validate_node_id("api.example-1_x").is_ok());
        assert!(validate_node_id("").is_err());
        assert!(validate_node_id(".hidden").is_err());
        assert!(validate_node_id("../etc/passwd").is_err());
        assert!(validate_node_id("a/b").is_err());
        assert!(validate_node_id("a b").is_err());
    }

    #[test]
    fn test_directive_injection_rejected() {
        let mut model = RoutingModel::new();
        let err = model
            .add_node(Node::new("k", "evil", "http://x; include /etc/passwd"))
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidValue { field: "endpoint", .. }));
    }

    #[test]
    fn test_endpoint_requires_scheme() {
        let mut model = RoutingModel::new();
        let err = model
            .add_node(Node::new("k", "svc1", "10.0.0.1:9000"))
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidValue { field: "endpoint", .. }));

        model
            .add_node(Node::new("k", "svc1", "https://10.0.0.1:9000"))
            .unwrap();
        model
            .add_node(Node::new("k", "sock", "unix:/run/app.sock"))
            .unwrap();

        let err = model
            .update_node_endpoint("svc1", Endpoint::new("10.0.0.2:9000"))
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidValue { field: "endpoint", .. }));
        assert_eq!(
            model.find_node("svc1").unwrap().endpoints[0].destination,
            "https://10.0.0.1:9000"
        );
    }

    #[test]
    fn test_endpoint_variable_rejected() {
        let mut model = RoutingModel::new();
        let err = model
            .add_node(Node::new("k", "svc1", "http://x/$undefined_var"))
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidValue { field: "endpoint", .. }));
        assert!(model.nodes().is_empty());
    }

    #[test]
    fn test_duplicate_entry_point_rejected() {
        let mut model = model_with_node();
        model
            .add_entry_point(EntryPoint::new("x.example.com", "/api", "a"))
            .unwrap();

        let err = model
            .add_entry_point(EntryPoint::new("x.example.com", "/api", "a"))
            .unwrap_err();
        assert_eq!(
            err,
            ModelError::DuplicateEntryPoint {
                domain: "x.example.com".to_string(),
                path: "/api".to_string(),
            }
        );
        assert_eq!(model.entry_points().len(), 1);

        // Same domain, different path is a separate route
        model
            .add_entry_point(EntryPoint::new("x.example.com", "/", "a"))
            .unwrap();
        assert_eq!(model.entry_points().len(), 2);
    }

    #[test]
    fn test_node_activity_serializes_with_status_tag() {
        let json = serde_json::to_value(NodeActivity::Conflict {
            existing: "http://a".to_string(),
            claimed: "http://b".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "conflict");
        assert_eq!(json["existing"], "http://a");

        let json = serde_json::to_value(NodeActivity::Match).unwrap();
        assert_eq!(json["status"], "match");
    }
}
