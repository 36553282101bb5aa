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

//! Shared hyper plumbing: canned responses, body helpers, and the pooled
//! clients used for metadata lookups and upstream HTTPS dispatch.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;

/// The body type served by the proxy: either an upstream `Incoming` or a
/// locally synthesized full body.
pub type Body = BoxBody<Bytes, hyper::Error>;

pub fn full_body(text: impl Into<Bytes>) -> Body {
    Full::new(text.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn plaintext_response(code: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("builder with known status code should not fail")
}

/// A pooled plaintext HTTP client (the metadata endpoint is HTTP-only).
pub fn pooling_client<B>() -> ::hyper_util::client::legacy::Client<HttpConnector, B>
where
    B: hyper::body::Body + Send,
    B::Data: Send,
{
    ::hyper_util::client::legacy::Client::builder(::hyper_util::rt::TokioExecutor::new())
        .build_http()
}

/// A pooled HTTPS-only client trusting the platform's native roots, speaking
/// HTTP/1.1 or HTTP/2 as ALPN negotiates.
pub fn https_client<B>()
-> std::io::Result<::hyper_util::client::legacy::Client<HttpsConnector<HttpConnector>, B>>
where
    B: hyper::body::Body + Send,
    B::Data: Send,
{
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    let https: HttpsConnector<HttpConnector> = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()?
        .https_only()
        .enable_all_versions()
        .wrap_connector(http);

    Ok(
        ::hyper_util::client::legacy::Client::builder(::hyper_util::rt::TokioExecutor::new())
            .build(https),
    )
}
