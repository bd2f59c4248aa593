//! Discovery of the per-account service endpoints.

use reqwest::Method;
use tracing::{debug, info};
use url::Url;

use crate::error::{ApiError, ErrorCode, Result};
use crate::executor::Executor;
use crate::models::EndpointResponse;
use crate::request::RequestData;

/// Base URLs of the two services an account talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    content: String,
    metadata: String,
}

impl Endpoints {
    /// Validate and store previously discovered base URLs.
    pub fn new(content_url: &str, metadata_url: &str) -> Result<Self> {
        Ok(Self {
            content: Url::parse(content_url)?.to_string(),
            metadata: Url::parse(metadata_url)?.to_string(),
        })
    }

    pub fn content_url(&self) -> &str {
        &self.content
    }

    pub fn metadata_url(&self) -> &str {
        &self.metadata
    }
}

/// Ask the discovery service which content and metadata hosts serve this account.
pub async fn discover(executor: &Executor, discovery_url: &str) -> Result<Endpoints> {
    debug!(discovery_url, "Discovering account endpoints");

    let response = executor
        .execute(
            discovery_url,
            RequestData::new(Method::GET, "/account/endpoint"),
        )
        .await?;
    let body = executor.read_body(response).await?;
    let endpoint: EndpointResponse = serde_json::from_slice(&body)?;

    if !endpoint.customer_exists {
        return Err(ApiError::synthesized(
            ErrorCode::CustomerNotFound,
            "Endpoint customer does not exist",
        )
        .into());
    }

    let endpoints = Endpoints::new(&endpoint.content_url, &endpoint.metadata_url)?;
    info!(
        content = endpoints.content_url(),
        metadata = endpoints.metadata_url(),
        "Discovered account endpoints"
    );
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_validated() {
        let endpoints = Endpoints::new(
            "https://content-na.drive.amazonaws.com/cdproxy/",
            "https://cdws.us-east-1.amazonaws.com/drive/v1/",
        )
        .unwrap();
        assert_eq!(
            endpoints.content_url(),
            "https://content-na.drive.amazonaws.com/cdproxy/"
        );
        assert!(Endpoints::new("not a url", "https://ok.example.com").is_err());
    }
}
