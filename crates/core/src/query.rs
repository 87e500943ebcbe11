//! Distributed queries and their targets.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

/// Kind of distributed query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Plain on-demand query.
    Query,
    /// Query that asks agents to carve a file.
    Carve,
}

impl QueryType {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "query" => Ok(Self::Query),
            "carve" => Ok(Self::Carve),
            _ => Err(crate::Error::InvalidQueryType(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Carve => "carve",
        }
    }

    /// Prefix used for generated query names.
    pub fn name_prefix(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Carve => "carve",
        }
    }
}

/// Per-node state of a dispatched query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeQueryStatus {
    Pending,
    Completed,
    Error,
}

impl NodeQueryStatus {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(crate::Error::InvalidNodeQueryStatus(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Status for an agent-reported result code; non-zero is an error.
    pub fn from_result_code(code: i64) -> Self {
        if code == 0 {
            Self::Completed
        } else {
            Self::Error
        }
    }
}

/// Generate a unique query name such as `query_3f9a…` or `carve_8c01…`.
pub fn generate_query_name(query_type: QueryType) -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    format!("{}_{}", query_type.name_prefix(), hex::encode(bytes))
}

/// Target selection for a distributed query.
///
/// Each non-empty list is one category. A node is targeted when it matches
/// every supplied category.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSpec {
    /// Environment names or identifiers; all active nodes of each.
    pub environments: Vec<String>,
    /// Platform names; active nodes reporting that platform.
    pub platforms: Vec<String>,
    /// Device UUIDs.
    pub uuids: Vec<String>,
    /// Host names, local names or UUIDs.
    pub hosts: Vec<String>,
    /// Tag names.
    pub tags: Vec<String>,
}

impl TargetSpec {
    /// Check whether no category was supplied.
    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
            && self.platforms.is_empty()
            && self.uuids.is_empty()
            && self.hosts.is_empty()
            && self.tags.is_empty()
    }
}

/// Accumulates the intersection of resolved target categories.
///
/// Starts unconstrained; the first category sets the candidate set and
/// every later one narrows it. A category that resolved to nothing empties
/// the result.
#[derive(Clone, Debug, Default)]
pub struct TargetSet {
    nodes: Option<HashSet<Uuid>>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Narrow the set to nodes that also belong to `category`.
    pub fn constrain(&mut self, category: HashSet<Uuid>) {
        self.nodes = Some(match self.nodes.take() {
            None => category,
            Some(current) => current.intersection(&category).copied().collect(),
        });
    }

    /// Final, deduplicated node set. Unconstrained means no targets.
    pub fn into_nodes(self) -> BTreeSet<Uuid> {
        self.nodes.unwrap_or_default().into_iter().collect()
    }
}

/// Kind of log pushed by an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Status,
    Result,
    /// Distributed query results forwarded after a query write.
    Query,
}

impl LogType {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "status" => Ok(Self::Status),
            "result" => Ok(Self::Result),
            "query" => Ok(Self::Query),
            _ => Err(crate::Error::InvalidLogType(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Result => "result",
            Self::Query => "query",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u128) -> Vec<Uuid> {
        (1..=n).map(Uuid::from_u128).collect()
    }

    #[test]
    fn test_unconstrained_set_is_empty() {
        assert!(TargetSet::new().into_nodes().is_empty());
    }

    #[test]
    fn test_intersection_across_categories() {
        let n = ids(3);
        let mut set = TargetSet::new();
        // platform=linux -> {n1, n2}
        set.constrain([n[0], n[1]].into_iter().collect());
        // tag=prod -> {n2, n3}
        set.constrain([n[1], n[2]].into_iter().collect());
        assert_eq!(set.into_nodes(), [n[1]].into_iter().collect());
    }

    #[test]
    fn test_empty_category_empties_result() {
        let n = ids(2);
        let mut set = TargetSet::new();
        set.constrain(n.iter().copied().collect());
        set.constrain(HashSet::new());
        set.constrain(n.iter().copied().collect());
        assert!(set.into_nodes().is_empty());
    }

    #[test]
    fn test_intersection_is_order_independent() {
        let n = ids(4);
        let a: HashSet<_> = [n[0], n[1], n[2]].into_iter().collect();
        let b: HashSet<_> = [n[1], n[2], n[3]].into_iter().collect();
        let c: HashSet<_> = [n[2], n[1]].into_iter().collect();

        let mut forward = TargetSet::new();
        forward.constrain(a.clone());
        forward.constrain(b.clone());
        forward.constrain(c.clone());

        let mut backward = TargetSet::new();
        backward.constrain(c);
        backward.constrain(b);
        backward.constrain(a);

        assert_eq!(forward.into_nodes(), backward.into_nodes());
    }

    #[test]
    fn test_generated_names() {
        let name = generate_query_name(QueryType::Carve);
        assert!(name.starts_with("carve_"));
        assert_ne!(name, generate_query_name(QueryType::Carve));
        assert!(generate_query_name(QueryType::Query).starts_with("query_"));
    }

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(
            NodeQueryStatus::from_result_code(0),
            NodeQueryStatus::Completed
        );
        assert_eq!(NodeQueryStatus::from_result_code(1), NodeQueryStatus::Error);
        assert_eq!(NodeQueryStatus::from_result_code(-1), NodeQueryStatus::Error);
    }

    #[test]
    fn test_target_spec_deserializes_partial() {
        let spec: TargetSpec = serde_json::from_str(r#"{"platforms":["linux"]}"#).unwrap();
        assert_eq!(spec.platforms, vec!["linux".to_string()]);
        assert!(spec.tags.is_empty());
        assert!(!spec.is_empty());
        assert!(TargetSpec::default().is_empty());
    }
}
