//! Template resolution with an on-disk cache
//!
//! Templates are fetched from the origin (`GET {base}/api/templates/{key}`) and
//! mirrored to `cache/templates/<name>.json`. When the origin is unreachable the
//! cache answers instead, first by file name, then by scanning for a matching
//! id or name.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use openapi_client::models::Template;
use reqwest::{header, Client, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::PanelError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Template store options
#[derive(Debug, Clone)]
pub struct Options {
    /// Base URL of the origin, `None` serves from the cache only
    pub origin_url: Option<String>,
    pub request_timeout: Duration,
    /// How long a fetched template is served from memory without revalidation
    pub memory_ttl: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            origin_url: None,
            request_timeout: Duration::from_secs(6),
            memory_ttl: Duration::from_secs(60),
        }
    }
}

struct CachedTemplate {
    template: Template,
    etag: Option<String>,
    fetched_at: Instant,
}

/// Resolves templates by id or name
pub struct TemplateStore {
    client: Client,
    origin: Option<Url>,
    cache_dir: Dir,
    memory_ttl: Duration,
    memory: Mutex<HashMap<String, CachedTemplate>>,
}

/// File name a template is cached under
pub fn cache_file_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.json", safe.trim_start_matches('.'))
}

impl TemplateStore {
    pub fn new(options: Options, cache_dir: Dir) -> Result<Self, PanelError> {
        let client = Client::builder().timeout(options.request_timeout).build()?;
        let origin = match options.origin_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Some(
                Url::parse(url)
                    .map_err(|e| PanelError::ConfigError(format!("invalid template origin {}: {}", url, e)))?,
            ),
            _ => None,
        };
        Ok(Self {
            client,
            origin,
            cache_dir,
            memory_ttl: options.memory_ttl,
            memory: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a template by id or name
    pub async fn resolve(&self, key: &str) -> Result<Template, PanelError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(PanelError::ValidationError("template id is required".to_string()));
        }

        let (cached, etag) = {
            let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            match memory.get(key) {
                Some(entry) if entry.fetched_at.elapsed() < self.memory_ttl => {
                    debug!("Template {} served from memory", key);
                    return Ok(entry.template.clone());
                }
                Some(entry) => (Some(entry.template.clone()), entry.etag.clone()),
                None => (None, None),
            }
        };

        let Some(origin) = &self.origin else {
            return self.load_cached(key).await?.ok_or_else(|| {
                PanelError::NotFound(format!("template {} is not cached and no origin is configured", key))
            });
        };

        match self.fetch(origin, key, etag.as_deref()).await {
            Ok(Fetched::NotModified) => {
                if let Some(template) = cached {
                    self.remember(key, &template, etag);
                    return Ok(template);
                }
                // a 304 without a memory copy only happens after a restart race
                self.load_cached(key).await?.ok_or_else(|| {
                    PanelError::TemplateError(format!("template {} not modified but not cached", key))
                })
            }
            Ok(Fetched::Template(template, etag)) => {
                if let Err(e) = self.write_cache(&template).await {
                    warn!("Failed to cache template {}: {}", template.name, e);
                }
                self.remember(key, &template, etag);
                Ok(template)
            }
            Ok(Fetched::Missing) => Err(PanelError::NotFound(format!("template {} not found", key))),
            Err(e) => {
                warn!("Template origin unavailable for {}: {}", key, e);
                match self.load_cached(key).await? {
                    Some(template) => {
                        info!("Using cached copy of template {}", key);
                        Ok(template)
                    }
                    None => Err(PanelError::TemplateError(format!(
                        "template {} unavailable: {}",
                        key, e
                    ))),
                }
            }
        }
    }

    async fn fetch(&self, origin: &Url, key: &str, etag: Option<&str>) -> Result<Fetched, PanelError> {
        let mut url = origin.clone();
        url.path_segments_mut()
            .map_err(|_| PanelError::ConfigError(format!("template origin {} cannot be a base", origin)))?
            .pop_if_empty()
            .extend(["api", "templates", key]);
        debug!("GET {}", url);

        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(Fetched::NotModified),
            StatusCode::NOT_FOUND => Ok(Fetched::Missing),
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let template: Template = response.json().await?;
                Ok(Fetched::Template(template, etag))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(PanelError::TemplateError(format!("origin returned {}: {}", status, body)))
            }
        }
    }

    fn remember(&self, key: &str, template: &Template, etag: Option<String>) {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        memory.insert(
            key.to_string(),
            CachedTemplate {
                template: template.clone(),
                etag,
                fetched_at: Instant::now(),
            },
        );
    }

    async fn write_cache(&self, template: &Template) -> Result<(), PanelError> {
        self.cache_dir.create().await?;
        self.cache_dir
            .file(&cache_file_name(&template.name))
            .write_json(template)
            .await
    }

    /// Persist a template, typically after its parameters were edited
    pub async fn save(&self, template: &Template) -> Result<(), PanelError> {
        self.write_cache(template).await?;
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        memory.retain(|_, entry| !entry.template.matches(&template.name));
        Ok(())
    }

    /// Look a template up in the disk cache
    pub async fn load_cached(&self, key: &str) -> Result<Option<Template>, PanelError> {
        let direct = self.cache_dir.file(&cache_file_name(key));
        if direct.exists().await {
            match direct.read_json::<Template>().await {
                Ok(template) => return Ok(Some(template)),
                Err(e) => warn!("Ignoring unreadable cache file {}: {}", direct.path().display(), e),
            }
        }

        if !self.cache_dir.exists().await {
            return Ok(None);
        }
        for path in self.cache_dir.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match File::new(&path).read_json::<Template>().await {
                Ok(template) if template.matches(key) => return Ok(Some(template)),
                Ok(_) => {}
                Err(e) => debug!("Skipping cache file {}: {}", path.display(), e),
            }
        }
        Ok(None)
    }
}

enum Fetched {
    Template(Template, Option<String>),
    NotModified,
    Missing,
}
