//! Request descriptors consumed by the [`Executor`](crate::executor::Executor).

use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::error::Result;

/// Reader used for streaming uploads.
pub type BoxReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// A multipart body whose file part is read from a stream.
///
/// The stream can only be consumed once, so requests carrying it are never retried.
pub struct StreamBody {
    fields: Vec<(String, String)>,
    file_field: String,
    file_name: String,
    mime_type: String,
    reader: BoxReader,
}

impl StreamBody {
    pub fn new(
        file_field: impl Into<String>,
        file_name: impl Into<String>,
        reader: impl AsyncRead + Send + Sync + Unpin + 'static,
    ) -> Self {
        Self {
            fields: Vec::new(),
            file_field: file_field.into(),
            file_name: file_name.into(),
            mime_type: "application/octet-stream".to_string(),
            reader: Box::new(reader),
        }
    }

    /// Add a JSON field sent before the file part.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    fn into_form(self) -> Result<Form> {
        let mut form = Form::new();
        for (name, value) in self.fields {
            let part = Part::text(value).mime_str("application/json")?;
            form = form.part(name, part);
        }

        let body = Body::wrap_stream(ReaderStream::new(self.reader));
        let file_part = Part::stream(body)
            .file_name(self.file_name)
            .mime_str(&self.mime_type)?;

        Ok(form.part(self.file_field, file_part))
    }
}

impl fmt::Debug for StreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBody")
            .field("fields", &self.fields)
            .field("file_field", &self.file_field)
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

/// Request body. Every variant except `Stream` can be replayed.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Stream(StreamBody),
}

impl RequestBody {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(RequestBody::Json(serde_json::to_value(value)?))
    }

    pub fn is_replayable(&self) -> bool {
        !matches!(self, RequestBody::Stream(_))
    }

    fn replay(&self) -> Option<Self> {
        match self {
            RequestBody::Empty => Some(RequestBody::Empty),
            RequestBody::Json(value) => Some(RequestBody::Json(value.clone())),
            RequestBody::Form(fields) => Some(RequestBody::Form(fields.clone())),
            RequestBody::Stream(_) => None,
        }
    }
}

/// Where a request is sent.
#[derive(Debug, Clone)]
pub enum Target {
    /// Path appended to the service base URL.
    Path(String),
    /// Absolute URL, used for temporary links.
    Url(String),
}

impl Default for Target {
    fn default() -> Self {
        Target::Path(String::new())
    }
}

/// Inclusive byte range of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Description of one HTTP exchange.
#[derive(Debug)]
pub struct RequestData {
    pub method: Method,
    pub target: Target,
    pub params: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub expected_status: Vec<StatusCode>,
}

impl Default for RequestData {
    fn default() -> Self {
        Self {
            method: Method::GET,
            target: Target::default(),
            params: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            expected_status: vec![StatusCode::OK],
        }
    }
}

impl RequestData {
    /// Request to a path relative to the service base URL.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            target: Target::Path(path.into()),
            ..Default::default()
        }
    }

    /// Request to an absolute URL.
    pub fn to_url(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            target: Target::Url(url.into()),
            ..Default::default()
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn range(self, range: Option<ByteRange>) -> Result<Self> {
        match range {
            Some(range) => {
                let value = HeaderValue::from_str(&range.header_value())
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                Ok(self.header(RANGE, value))
            }
            None => Ok(self),
        }
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn expect(mut self, statuses: &[StatusCode]) -> Self {
        self.expected_status = statuses.to_vec();
        self
    }

    pub fn is_replayable(&self) -> bool {
        self.body.is_replayable()
    }

    /// A fresh copy of this request, or `None` if its body is a stream.
    pub fn replay(&self) -> Option<Self> {
        Some(Self {
            method: self.method.clone(),
            target: self.target.clone(),
            params: self.params.clone(),
            headers: self.headers.clone(),
            body: self.body.replay()?,
            expected_status: self.expected_status.clone(),
        })
    }

    pub(crate) fn url(&self, base: &str) -> String {
        match &self.target {
            Target::Path(path) => format!("{}{}", base.trim_end_matches('/'), path),
            Target::Url(url) => url.clone(),
        }
    }

    pub(crate) fn into_builder(
        self,
        http: &Client,
        base: &str,
        token: &str,
        timeout: Option<Duration>,
    ) -> Result<RequestBuilder> {
        let url = self.url(base);
        let mut builder = http
            .request(self.method, url)
            .headers(self.headers)
            .bearer_auth(token);

        if !self.params.is_empty() {
            builder = builder.query(&self.params);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let builder = match self.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Stream(stream) => builder.multipart(stream.into_form()?),
        };

        Ok(builder)
    }
}
