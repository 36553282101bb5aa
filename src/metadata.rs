// Copyright the runsd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The region/token oracle: everything runsd learns from the compute
//! metadata endpoint and the Cloud Run admin API.
//!
//! No caching anywhere. Identity tokens are fetched per proxied request; the
//! metadata endpoint already serves them from its own cache.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::version;

const METADATA_HOST: &str = "metadata.google.internal";
const ID_TOKEN_ENV: &str = "CLOUD_RUN_ID_TOKEN";
const SERVICE_NAME_ENV: &str = "K_SERVICE";

/// The instance zone looks like `projects/123456/zones/us-central1-1`; the
/// region is everything between `/zones/` and the trailing zone suffix.
/// Splitting on `-` instead would mangle regions with trailing digits.
static ZONE_REGION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/zones/([a-z]+-[a-z0-9]+)").expect("static regex should build"));

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("request failed: {0}")]
    Http(#[from] hyper_util::client::legacy::Error),

    #[error("building request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),

    #[error("reading response body: {0}")]
    Body(#[from] hyper::Error),

    #[error("{url} responded with code={status}")]
    Status { url: String, status: StatusCode },

    #[error("unable to parse region from zone value {0:?}")]
    MalformedZone(String),

    #[error("cannot extract project hash from service URL {0:?}")]
    MalformedServiceUrl(String),

    #[error("decoding response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("K_SERVICE is not set")]
    MissingServiceName,

    #[error("loading TLS roots: {0}")]
    TlsRoots(std::io::Error),
}

/// Issues short-lived identity tokens for proxied requests. A trait so the
/// proxy can be exercised with a fake in tests.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn identity_token(&self, audience: &str) -> Result<String, Error>;
}

#[derive(Clone)]
pub struct MetadataClient {
    http: hyper_util::client::legacy::Client<HttpConnector, Empty<Bytes>>,
    host: String,
}

impl MetadataClient {
    pub fn new() -> Self {
        Self {
            http: crate::hyper_util::pooling_client(),
            host: METADATA_HOST.to_string(),
        }
    }

    /// Fetches a metadata path, returning the trimmed plain-text body.
    async fn query(&self, path_and_query: &str) -> Result<String, Error> {
        let url = format!("http://{}{}", self.host, path_and_query);
        let uri: Uri = url.parse().map_err(hyper::http::Error::from)?;
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Metadata-Flavor", "Google")
            .body(Empty::new())?;

        debug!(%url, "querying metadata endpoint");
        let resp = self.http.request(req).await?;
        read_body(url, resp).await
    }

    /// The deployment's region, parsed out of the instance zone.
    pub async fn region(&self) -> Result<String, Error> {
        let zone = self
            .query("/computeMetadata/v1/instance/zone")
            .await?;
        let captures = ZONE_REGION
            .captures(&zone)
            .ok_or_else(|| Error::MalformedZone(zone.clone()))?;
        Ok(captures[1].to_string())
    }

    async fn project_id(&self) -> Result<String, Error> {
        self.query("/computeMetadata/v1/project/project-id").await
    }

    /// An OAuth access token for the default service account, used only to
    /// call the admin API during bootstrap.
    async fn access_token(&self) -> Result<String, Error> {
        let body = self
            .query("/computeMetadata/v1/instance/service-accounts/default/token")
            .await?;
        let token: AccessToken = serde_json::from_str(&body)?;
        Ok(token.access_token)
    }

    /// Discovers the per-project URL hash by resolving this deployment's own
    /// URL through the admin API and picking the hash segment apart.
    pub async fn project_hash(&self, region: &str) -> Result<String, Error> {
        let project = self.project_id().await?;
        let service = std::env::var(SERVICE_NAME_ENV).map_err(|_| Error::MissingServiceName)?;
        let access_token = self.access_token().await?;

        let url = format!(
            "https://{region}-run.googleapis.com/apis/serving.knative.dev/v1/namespaces/{project}/services/{service}"
        );
        let uri: Uri = url.parse().map_err(hyper::http::Error::from)?;
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(AUTHORIZATION, bearer(&access_token)?)
            .header(USER_AGENT, format!("runsd version={}", version::VERSION))
            .body(Empty::<Bytes>::new())?;

        let client = crate::hyper_util::https_client().map_err(Error::TlsRoots)?;
        let resp = client.request(req).await?;
        let body = read_body(url, resp).await?;

        let service: Service = serde_json::from_str(&body)?;
        hash_from_url(&service.status.url)
            .ok_or(Error::MalformedServiceUrl(service.status.url))
    }
}

impl Default for MetadataClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TokenSource for MetadataClient {
    /// An audience-scoped identity token. `CLOUD_RUN_ID_TOKEN` overrides the
    /// metadata endpoint for testing outside the platform.
    async fn identity_token(&self, audience: &str) -> Result<String, Error> {
        if let Ok(token) = std::env::var(ID_TOKEN_ENV) {
            let token = token.trim();
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
        self.query(&format!(
            "/computeMetadata/v1/instance/service-accounts/default/identity?audience={audience}"
        ))
        .await
    }
}

async fn read_body(url: String, resp: Response<hyper::body::Incoming>) -> Result<String, Error> {
    let status = resp.status();
    if status != StatusCode::OK {
        // Body intentionally discarded; error bodies are not trusted input.
        return Err(Error::Status { url, status });
    }
    let bytes = resp.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8_lossy(&bytes).trim().to_string())
}

fn bearer(token: &str) -> Result<HeaderValue, Error> {
    Ok(HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(hyper::http::Error::from)?)
}

/// `https://hello-dpyb4duzqq-uc.a.run.app` → `dpyb4duzqq`.
fn hash_from_url(url: &str) -> Option<String> {
    let trimmed = url.strip_suffix(".a.run.app")?;
    let tokens: Vec<&str> = trimmed.split('-').collect();
    if tokens.len() < 2 {
        return None;
    }
    Some(tokens[tokens.len() - 2].to_string())
}

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Deserialize)]
struct Service {
    status: ServiceStatus,
}

#[derive(Deserialize)]
struct ServiceStatus {
    url: String,
}
