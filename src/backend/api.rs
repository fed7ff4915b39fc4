//! HTTP client for the Alcubierre device API.
//!
//! Every operation is a JSON document `{"op": ..., "op_args": {...}}` posted
//! to `<node url>/<api path>/dev`. The node URL is published by the backend as
//! a RADOS object attribute and cached for a while.

use super::{CommandRunner, DeviceBackend};
use crate::error::{Error, Result};
use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use moka::future::Cache;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DEVICE_DIR: &str = "/dev";

/// Finds the backend URL serving a node.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn resolve(&self, node: &str) -> Result<String>;
}

/// Reads `alcubierre_node_<node>` from the backend pool: `rados -p <pool> getxattr <attr> URL`.
pub struct RadosUrlResolver {
    runner: Arc<dyn CommandRunner>,
    pool: String,
}

impl RadosUrlResolver {
    pub fn new(runner: Arc<dyn CommandRunner>, pool: impl Into<String>) -> Self {
        Self { runner, pool: pool.into() }
    }
}

#[async_trait]
impl UrlResolver for RadosUrlResolver {
    async fn resolve(&self, node: &str) -> Result<String> {
        let args = vec![
            "-p".to_string(),
            self.pool.clone(),
            "getxattr".to_string(),
            format!("alcubierre_node_{}", node),
            "URL".to_string(),
        ];
        let url = self.runner.run("rados", &args).await?.trim().to_string();
        if url.is_empty() {
            return Err(Error::Backend(format!("no backend url published for node {}", node)));
        }
        Ok(url)
    }
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub api_path: String,
    pub user: String,
    pub password: String,
    pub request_timeout: Duration,
    pub url_cache_ttl: Duration,
}

#[derive(Serialize)]
struct OpRequest<'a> {
    op: &'a str,
    op_args: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct ImageQuery<'a> {
    pool: &'a str,
    image: &'a str,
}

#[derive(Deserialize, Default)]
struct ConnectResponse {
    #[serde(default)]
    alcubierre_dev: String,
}

#[derive(Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
}

#[derive(Deserialize, Default)]
struct StatusResponse {
    #[serde(default)]
    status: String,
}

pub struct AlcubApi {
    http: Client,
    resolver: Arc<dyn UrlResolver>,
    urls: Cache<String, Url>,
    settings: ApiSettings,
}

impl AlcubApi {
    pub fn new(settings: ApiSettings, resolver: Arc<dyn UrlResolver>) -> Result<Self> {
        let http = Client::builder().timeout(settings.request_timeout).build()?;
        let urls = Cache::builder().max_capacity(1024).time_to_live(settings.url_cache_ttl).build();
        Ok(Self { http, resolver, urls, settings })
    }

    async fn base_url(&self, node: &str) -> Result<Url> {
        if let Some(url) = self.urls.get(node).await {
            return Ok(url);
        }
        let raw = self.resolver.resolve(node).await?;
        let url = Url::parse(&raw)
            .map_err(|e| Error::Backend(format!("invalid backend url {:?}: {}", raw, e)))?;
        debug!("Resolved backend url for node {}: {}", node, url);
        self.urls.insert(node.to_string(), url.clone()).await;
        Ok(url)
    }

    fn endpoint(&self, base: &Url) -> Url {
        let mut url = base.clone();
        match self.settings.api_path.trim_matches('/') {
            "" => url.set_path("/dev"),
            path => url.set_path(&format!("/{}/dev", path)),
        }
        url.set_query(None);
        url
    }

    fn parse_base(raw: &str) -> Result<Url> {
        Url::parse(raw).map_err(|e| Error::InvalidArgument(format!("invalid url {:?}: {}", raw, e)))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        if self.settings.user.is_empty() {
            req
        } else {
            req.basic_auth(&self.settings.user, Some(&self.settings.password))
        }
    }

    async fn post(&self, base: &Url, op: &str, args: &[(&str, &str)]) -> Result<Response> {
        let body = OpRequest { op, op_args: args.iter().copied().collect() };
        let url = self.endpoint(base);
        debug!("POST {} op={}", url, op);
        let resp = self.authorize(self.http.post(url).json(&body)).send().await?;
        Self::check(op, resp).await
    }

    async fn check(op: &str, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(Error::Backend(format!("{} returned {}: {}", op, status, text.trim())))
    }
}

fn origin(url: &Url) -> String {
    url.origin().ascii_serialization()
}

#[async_trait]
impl DeviceBackend for AlcubApi {
    async fn connect(&self, node: &str, pool: &str, image: &str) -> Result<String> {
        let base = self.base_url(node).await?;
        let resp = self.post(&base, "dev_connect", &[("pool", pool), ("image", image)]).await?;
        let body: ConnectResponse = resp.json().await?;
        if body.alcubierre_dev.is_empty() {
            return Err(Error::Backend(format!("no device returned for {}/{}", pool, image)));
        }
        let device = format!("{}/{}", DEVICE_DIR, body.alcubierre_dev.trim_start_matches('/'));
        info!("Connected {}/{} on {} as {}", pool, image, node, device);
        Ok(device)
    }

    async fn disconnect(&self, node: &str, pool: &str, image: &str) -> Result<()> {
        let base = self.base_url(node).await?;
        let resp = self.post(&base, "dev_disconnect", &[("pool", pool), ("image", image)]).await?;
        let text = resp.text().await?;
        let body: ErrorResponse = serde_json::from_str(&text).unwrap_or_default();
        if !body.error.is_empty() {
            return Err(Error::Backend(format!("dev_disconnect {}/{}: {}", pool, image, body.error)));
        }
        info!("Disconnected {}/{} on {}", pool, image, node);
        Ok(())
    }

    async fn image_clean(&self, node: &str, pool: &str, image: &str) -> Result<bool> {
        let base = self.base_url(node).await?;
        let req = self.http.get(self.endpoint(&base)).json(&ImageQuery { pool, image });
        let resp = Self::check("image status", self.authorize(req).send().await?).await?;
        let body: StatusResponse = resp.json().await?;
        debug!("Image {}/{} status {:?}", pool, image, body.status);
        Ok(body.status.is_empty() || body.status == "clean")
    }

    async fn peer_urls(&self, node: &str) -> Result<Vec<String>> {
        let base = self.base_url(node).await?;
        let resp = self.post(&base, "get_secondary_urls", &[("node", node)]).await?;
        let mut urls: Vec<String> = resp.json().await?;
        urls.push(origin(&base));

        let mut peers: Vec<String> = Vec::with_capacity(urls.len());
        for url in urls {
            if !url.is_empty() && !peers.contains(&url) {
                peers.push(url);
            }
        }
        Ok(peers)
    }

    async fn node_url(&self, node: &str) -> Result<String> {
        Ok(origin(&self.base_url(node).await?))
    }

    async fn fail_node(&self, url: &str, node: &str) -> Result<()> {
        let base = Self::parse_base(url)?;
        self.post(&base, "node_fail", &[("node", node)]).await?;
        info!("Reported node {} failed to {}", node, url);
        Ok(())
    }

    async fn dev_stop(&self, url: &str, pool: &str, image: &str) -> Result<()> {
        let base = Self::parse_base(url)?;
        self.post(&base, "dev_stop", &[("pool", pool), ("image", image)]).await?;
        info!("Stopped device {}/{} via {}", pool, image, url);
        Ok(())
    }
}
