//! Outbound HTTP calls of the gateway.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use bytes::BytesMut;
use framex_core::consts::{OPENAPI_PATH, PROXY_FUNC_HTTP_PATH};
use framex_core::{Kwargs, ModelSchema};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, Response, Url};
use serde_json::Value;
use tracing::{debug, error};

use super::openapi::{RemoteOperation, BODY_PARAM};
use crate::config::AuthConfig;

/// A mirrored remote operation bound to the service that serves it.
#[derive(Debug)]
pub struct RemoteTarget {
    pub base_url: String,
    pub op: RemoteOperation,
    /// Validates the arguments of every forwarded call.
    pub model: ModelSchema,
}

impl RemoteTarget {
    #[must_use]
    pub fn new(base_url: &str, op: RemoteOperation) -> Self {
        let model = ModelSchema::from_params(format!("{}_RequestModel", op.operation_id), &op.params);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            op,
            model,
        }
    }
}

/// One outbound request, before it is sent.
#[derive(Debug)]
struct Outbound {
    url: Url,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Splits validated arguments into path segments, query pairs and the body.
fn build_outbound(target: &RemoteTarget, kwargs: &Kwargs) -> anyhow::Result<Outbound> {
    let mut args = target.model.validate(kwargs)?;
    let body = if target.op.has_body() {
        args.remove(BODY_PARAM)
    } else {
        None
    };

    let mut url = Url::parse(&target.base_url)?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|()| anyhow::anyhow!("`{}` cannot be a base URL", target.base_url))?;
        segments.pop_if_empty();
        for segment in target.op.path.split('/').filter(|s| !s.is_empty()) {
            match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => {
                    let value = args
                        .remove(name)
                        .and_then(scalar_text)
                        .ok_or_else(|| anyhow::anyhow!("missing path parameter `{name}`"))?;
                    segments.push(&value);
                }
                None => {
                    segments.push(segment);
                }
            }
        }
    }

    let mut query = Vec::new();
    for (name, value) in args {
        match value {
            Value::Array(items) => {
                query.extend(items.into_iter().filter_map(scalar_text).map(|v| (name.clone(), v)));
            }
            other => query.extend(scalar_text(other).map(|v| (name.clone(), v))),
        }
    }
    Ok(Outbound { url, query, body })
}

/// Removes every complete `\n\n`-terminated frame from the front of `buffer`.
fn drain_frames(buffer: &mut BytesMut) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(end) = buffer.windows(2).position(|w| w == b"\n\n") {
        let frame = buffer.split_to(end + 2);
        frames.push(String::from_utf8_lossy(&frame).into_owned());
    }
    frames
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

/// HTTP client of the gateway.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    auth: Arc<AuthConfig>,
}

impl Forwarder {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(timeout: Duration, auth: AuthConfig) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            auth: Arc::new(auth),
        })
    }

    /// First configured key for `path`, sent as the `Authorization` header.
    fn authorization(&self, path: &str) -> Option<String> {
        self.auth
            .get_auth_keys(path)
            .and_then(|keys| keys.into_iter().next())
    }

    fn request(&self, method: Method, url: Url, auth_path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match self.authorization(auth_path) {
            Some(key) => builder.header(AUTHORIZATION, key),
            None => builder,
        }
    }

    async fn send(&self, target: &RemoteTarget, kwargs: &Kwargs) -> anyhow::Result<Response> {
        let outbound = build_outbound(target, kwargs)?;
        let method = Method::from_bytes(target.op.method.as_str().as_bytes())?;
        debug!(url = %outbound.url, %method, "forwarding proxy api");

        let mut builder = self
            .request(method, outbound.url, &target.op.path)
            .query(&outbound.query);
        if let (true, Some(body)) = (target.op.method.has_body(), &outbound.body) {
            builder = builder.json(body);
        }
        Ok(builder.send().await?.error_for_status()?)
    }

    /// Forwards one call and returns the decoded JSON answer.
    ///
    /// # Errors
    ///
    /// Invalid arguments, transport failures and non-success statuses.
    pub async fn call(&self, target: &RemoteTarget, kwargs: Kwargs) -> anyhow::Result<Value> {
        let result = match self.send(target, &kwargs).await {
            Ok(response) => response.json::<Value>().await.map_err(anyhow::Error::from),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            error!(
                url = %format!("{}{}", target.base_url, target.op.path),
                method = %target.op.method,
                error = %format!("{err:#}"),
                "error calling proxy api"
            );
        }
        result
    }

    /// Forwards one call and yields the answer as server-sent-event frames.
    ///
    /// The response is owned by the stream; dropping the stream early closes
    /// the connection.
    pub fn call_stream(
        &self,
        target: Arc<RemoteTarget>,
        kwargs: Kwargs,
    ) -> BoxStream<'static, anyhow::Result<String>> {
        let this = self.clone();
        stream! {
            let response = match this.send(&target, &kwargs).await {
                Ok(response) => response,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            let mut body = response.bytes_stream();
            let mut buffer = BytesMut::new();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        for frame in drain_frames(&mut buffer) {
                            yield Ok(frame);
                        }
                    }
                    Err(err) => {
                        yield Err(err.into());
                        return;
                    }
                }
            }
            if !buffer.is_empty() {
                yield Ok(String::from_utf8_lossy(&buffer).into_owned());
            }
        }
        .boxed()
    }

    /// Fetches the API description published by the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Transport failures, non-success statuses and non-JSON bodies.
    pub async fn fetch_description(&self, base_url: &str) -> anyhow::Result<Value> {
        let url = Url::parse(&format!("{}{OPENAPI_PATH}", base_url.trim_end_matches('/')))?;
        let response = self
            .request(Method::GET, url, OPENAPI_PATH)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Posts an encoded function call to the function route of `base_url`.
    ///
    /// # Errors
    ///
    /// Transport failures, non-success statuses and non-JSON bodies.
    pub async fn post_function(&self, base_url: &str, body: &Value) -> anyhow::Result<Value> {
        let url = Url::parse(&format!(
            "{}{PROXY_FUNC_HTTP_PATH}",
            base_url.trim_end_matches('/')
        ))?;
        let response = self
            .request(Method::POST, url, PROXY_FUNC_HTTP_PATH)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
