//! Drive API client for node, content, change feed and quota operations.

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use futures::StreamExt;
use reqwest::header::CONTENT_ENCODING;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::Authenticator;
use crate::config::ClientConfig;
use crate::endpoint::{discover, Endpoints};
use crate::error::{ApiError, CloudDriveError, ErrorCode, Result};
use crate::executor::Executor;
use crate::models::{
    ChangeSet, Changes, Node, NodeCreate, NodeKind, NodeList, NodeMove, NodeRename, Quota,
};
use crate::request::{ByteRange, RequestBody, RequestData, StreamBody};

/// Client for one drive account.
///
/// Cheap to clone; clones share credentials, transport and endpoints.
#[derive(Clone)]
pub struct CloudDrive {
    executor: Executor,
    endpoints: Endpoints,
}

impl CloudDrive {
    /// Create a client, discovering the account endpoints first.
    ///
    /// # Arguments
    /// * `http` - Transport shared by every request
    /// * `auth` - Authenticator for obtaining access tokens
    /// * `config` - Retry and discovery settings
    pub async fn connect(http: Client, auth: Authenticator, config: ClientConfig) -> Result<Self> {
        let executor = Executor::new(http, auth, &config);
        let endpoints = discover(&executor, &config.discovery_url).await?;
        Ok(Self {
            executor,
            endpoints,
        })
    }

    /// Create a client for endpoints that were discovered earlier.
    pub fn with_endpoints(
        http: Client,
        auth: Authenticator,
        config: &ClientConfig,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            executor: Executor::new(http, auth, config),
            endpoints,
        }
    }

    /// A handle whose calls abort with [`CloudDriveError::Cancelled`] once `token` is cancelled.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            executor: self.executor.with_cancellation(token),
            endpoints: self.endpoints.clone(),
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn auth(&self) -> &Authenticator {
        self.executor.auth()
    }

    /// Send a request to the metadata service.
    pub async fn metadata_request(&self, request: RequestData) -> Result<Response> {
        self.executor
            .execute(self.endpoints.metadata_url(), request)
            .await
    }

    /// Send a request to the content service.
    pub async fn content_request(&self, request: RequestData) -> Result<Response> {
        self.executor
            .execute(self.endpoints.content_url(), request)
            .await
    }

    /// Get the root folder of the account.
    pub async fn lookup_root(&self) -> Result<Node> {
        debug!("Looking up root node");

        let request = RequestData::new(Method::GET, "/nodes").param("filters", "isRoot:true");
        let list: NodeList = self.decode(self.metadata_request(request).await?).await?;

        list.nodes.into_iter().next().ok_or_else(|| {
            ApiError::synthesized(ErrorCode::NodeNotFound, "Root node not found").into()
        })
    }

    /// Find a child of `parent_id` by name.
    pub async fn lookup_node(&self, parent_id: &str, name: &str) -> Result<Option<Node>> {
        debug!(parent_id, name, "Looking up node by name");

        let filters = format!(
            "parents:{} AND name:\"{}\"",
            parent_id,
            escape_filter_value(name)
        );
        let request = RequestData::new(Method::GET, "/nodes").param("filters", filters);
        let list: NodeList = self.decode(self.metadata_request(request).await?).await?;

        Ok(list.nodes.into_iter().next())
    }

    /// Get node metadata by ID, including a temporary download link.
    pub async fn lookup_node_by_id(&self, node_id: &str) -> Result<Node> {
        let request = RequestData::new(Method::GET, format!("/nodes/{}", node_id))
            .param("tempLink", "true");
        self.decode(self.metadata_request(request).await?).await
    }

    /// List all children of a folder, following pagination.
    pub async fn node_children(&self, parent_id: &str) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request =
                RequestData::new(Method::GET, format!("/nodes/{}/children", parent_id));
            if let Some(ref token) = next_token {
                request = request.param("startToken", token.as_str());
            }

            let page: NodeList = self.decode(self.metadata_request(request).await?).await?;
            debug!(parent_id, count = page.nodes.len(), "Fetched children page");

            if page.nodes.is_empty() {
                break;
            }
            nodes.extend(page.nodes);

            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        Ok(nodes)
    }

    /// Poll the change feed. An empty checkpoint starts from the beginning.
    pub async fn changes(&self, checkpoint: &str) -> Result<Changes> {
        debug!(has_checkpoint = !checkpoint.is_empty(), "Polling change feed");

        let mut request = RequestData::new(Method::POST, "/changes");
        if !checkpoint.is_empty() {
            request = request.body(RequestBody::Json(serde_json::json!({
                "checkpoint": checkpoint
            })));
        }

        let response = self.metadata_request(request).await?;
        let gzip = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
        let body = self.executor.read_body(response).await?;

        let changes = decode_changes(&body, gzip)?;
        debug!(
            nodes = changes.nodes.len(),
            reset = changes.reset,
            "Change feed polled"
        );
        Ok(changes)
    }

    /// Create a folder under `parent_id`.
    pub async fn create_folder(&self, parent_id: &str, name: &str) -> Result<Node> {
        debug!(parent_id, name, "Creating folder");

        let body = RequestBody::json(&NodeCreate {
            name,
            kind: NodeKind::Folder,
            parents: [parent_id],
        })?;
        let request = RequestData::new(Method::POST, "/nodes")
            .body(body)
            .expect(&[StatusCode::CREATED]);
        self.decode(self.metadata_request(request).await?).await
    }

    /// Move a node to the trash.
    pub async fn delete_node(&self, node_id: &str) -> Result<Node> {
        debug!(node_id, "Trashing node");

        let request = RequestData::new(Method::PUT, format!("/trash/{}", node_id));
        self.decode(self.metadata_request(request).await?).await
    }

    pub async fn rename_node(&self, node_id: &str, new_name: &str) -> Result<Node> {
        debug!(node_id, new_name, "Renaming node");

        let body = RequestBody::json(&NodeRename { name: new_name })?;
        let request = RequestData::new(Method::PATCH, format!("/nodes/{}", node_id)).body(body);
        self.decode(self.metadata_request(request).await?).await
    }

    pub async fn move_node(
        &self,
        node_id: &str,
        from_parent_id: &str,
        to_parent_id: &str,
    ) -> Result<Node> {
        debug!(node_id, from_parent_id, to_parent_id, "Moving node");

        let body = RequestBody::json(&NodeMove {
            from_parent: from_parent_id,
            child_id: node_id,
        })?;
        let request =
            RequestData::new(Method::POST, format!("/nodes/{}/children", to_parent_id)).body(body);
        self.decode(self.metadata_request(request).await?).await
    }

    /// Download node content, optionally limited to an inclusive byte range.
    pub async fn download_node(&self, node_id: &str, range: Option<ByteRange>) -> Result<Download> {
        debug!(node_id, ?range, "Downloading node");

        let request = RequestData::new(Method::GET, format!("/nodes/{}/content", node_id))
            .range(range)?
            .expect(&[StatusCode::OK, StatusCode::PARTIAL_CONTENT]);
        let response = self.content_request(request).await?;
        Ok(self.download(response))
    }

    /// Download node content through its temporary link.
    pub async fn download_node_by_temp_link(
        &self,
        node_id: &str,
        range: Option<ByteRange>,
    ) -> Result<Download> {
        let node = self.lookup_node_by_id(node_id).await?;
        let temp_link = node
            .temp_link
            .ok_or_else(|| CloudDriveError::MissingTempLink(node_id.to_string()))?;
        debug!(node_id, ?range, "Downloading node by temporary link");

        let request = RequestData::to_url(Method::GET, temp_link)
            .range(range)?
            .expect(&[StatusCode::OK, StatusCode::PARTIAL_CONTENT]);
        let response = self.content_request(request).await?;
        Ok(self.download(response))
    }

    /// Upload new content as a file named `name` under `parent_id`.
    ///
    /// The reader is streamed once; the request is not retried.
    pub async fn upload_node<R>(&self, parent_id: &str, name: &str, reader: R) -> Result<Node>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        self.upload_stream(parent_id, name, StreamBody::new("file", name, reader))
            .await
    }

    /// Upload a local file under `parent_id`, keeping its file name.
    pub async fn upload_file<P: AsRef<Path>>(&self, local_path: P, parent_id: &str) -> Result<Node> {
        let local_path = local_path.as_ref();
        let filename = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CloudDriveError::FileNotFound(local_path.display().to_string()))?;

        let mime_type = mime_guess::from_path(local_path)
            .first_or_octet_stream()
            .to_string();
        let file = File::open(local_path).await?;

        let body = StreamBody::new("file", filename, file).with_mime_type(mime_type);
        self.upload_stream(parent_id, filename, body).await
    }

    async fn upload_stream(&self, parent_id: &str, name: &str, body: StreamBody) -> Result<Node> {
        debug!(parent_id, name, "Uploading node");

        let metadata = serde_json::to_string(&NodeCreate {
            name,
            kind: NodeKind::File,
            parents: [parent_id],
        })?;

        let request = RequestData::new(Method::POST, "/nodes")
            .param("suppress", "deduplication")
            .body(RequestBody::Stream(body.with_field("metadata", metadata)))
            .expect(&[StatusCode::CREATED]);
        self.decode(self.content_request(request).await?).await
    }

    /// Replace the content of an existing node.
    pub async fn overwrite_node<R>(&self, node_id: &str, reader: R) -> Result<Node>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        debug!(node_id, "Overwriting node content");

        let request = RequestData::new(Method::PUT, format!("/nodes/{}/content", node_id))
            .body(RequestBody::Stream(StreamBody::new("file", "file", reader)));
        self.decode(self.content_request(request).await?).await
    }

    pub async fn quota(&self) -> Result<Quota> {
        let request = RequestData::new(Method::GET, "/account/quota");
        self.decode(self.metadata_request(request).await?).await
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let body = self.executor.read_body(response).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn download(&self, response: Response) -> Download {
        Download {
            response,
            cancel: self.executor.cancellation_token().clone(),
        }
    }
}

/// Node content being downloaded.
///
/// Reads abort with [`CloudDriveError::Cancelled`] when the issuing client is cancelled.
pub struct Download {
    response: Response,
    cancel: CancellationToken,
}

impl Download {
    /// Size of the returned content, as reported by the server.
    pub fn size(&self) -> Option<u64> {
        self.response.content_length()
    }

    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Read the whole content into memory.
    pub async fn bytes(self) -> Result<Vec<u8>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CloudDriveError::Cancelled),
            body = self.response.bytes() => Ok(body?.into()),
        }
    }

    /// Stream the content to a local file, returning the number of bytes written.
    pub async fn save_to<P: AsRef<Path>>(self, destination: P) -> Result<u64> {
        let mut file = File::create(destination.as_ref()).await?;
        let mut stream = self.response.bytes_stream();
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CloudDriveError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        Ok(written)
    }

    pub fn into_response(self) -> Response {
        self.response
    }
}

/// Escape a value placed inside a double-quoted filter term.
fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Merge the stream of change sets in a change feed response.
fn decode_changes(body: &[u8], gzip: bool) -> Result<Changes> {
    let reader: Box<dyn Read + '_> = if gzip {
        Box::new(GzDecoder::new(body))
    } else {
        Box::new(body)
    };

    let mut changes = Changes::default();
    for set in serde_json::Deserializer::from_reader(reader).into_iter::<ChangeSet>() {
        let set = set?;
        if set.end {
            break;
        }
        if let Some(checkpoint) = set.checkpoint {
            changes.checkpoint = checkpoint;
        }
        changes.reset |= set.reset;
        changes.nodes.extend(set.nodes);
    }

    Ok(changes)
}
