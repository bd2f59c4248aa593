//! Data models for drive API requests and responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a node in the drive graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Asset,
    File,
    Folder,
    Group,
    #[serde(other)]
    Unknown,
}

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Available,
    Pending,
    Trash,
    Purged,
    #[serde(other)]
    Unknown,
}

/// Metadata for a file, folder, asset or group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub modified_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content_properties: Option<ContentProperties>,
    /// Short-lived pre-authorized download URL, only present when requested.
    #[serde(default)]
    pub temp_link: Option<String>,
}

impl Node {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    /// Content size in bytes, if the node has content.
    pub fn size(&self) -> Option<u64> {
        self.content_properties.as_ref().map(|p| p.size)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let size_str = self
            .size()
            .map(format_size)
            .unwrap_or_else(|| "-".to_string());
        let kind = match self.kind {
            NodeKind::Asset => "asset",
            NodeKind::File => "file",
            NodeKind::Folder => "folder",
            NodeKind::Group => "group",
            NodeKind::Unknown => "-",
        };
        write!(f, "{}\t{}\t{}\t{}", self.id, size_str, kind, self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentProperties {
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
}

/// Format bytes into human-readable size.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// One page of a node listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeList {
    #[serde(default, rename = "data")]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next_token: Option<String>,
}

/// Body of a node creation request.
#[derive(Debug, Serialize)]
pub struct NodeCreate<'a> {
    pub name: &'a str,
    pub kind: NodeKind,
    pub parents: [&'a str; 1],
}

#[derive(Debug, Serialize)]
pub struct NodeRename<'a> {
    pub name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMove<'a> {
    pub from_parent: &'a str,
    pub child_id: &'a str,
}

/// Storage quota of the account.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub quota: u64,
    #[serde(default)]
    pub last_calculated: Option<DateTime<Utc>>,
    pub available: u64,
}

/// Accumulated result of one change feed poll.
#[derive(Debug, Clone, Default)]
pub struct Changes {
    /// Cursor to pass to the next poll.
    pub checkpoint: String,
    pub nodes: Vec<Node>,
    /// Set when the feed restarted from scratch and local state must be rebuilt.
    pub reset: bool,
}

/// One object of the change feed stream.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChangeSet {
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub reset: bool,
    #[serde(default)]
    pub end: bool,
}

/// Response from the endpoint discovery API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointResponse {
    pub customer_exists: bool,
    #[serde(default)]
    pub content_url: String,
    #[serde(default)]
    pub metadata_url: String,
}

/// OAuth2 credentials of one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// OAuth2 token response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// OAuth2 error response.
#[derive(Debug, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: String,
}
