use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use cacheproxy::{build_app, proxy::listener, settings::Settings};

use super::{TestResponse, get_request, send_raw};

fn default_test_settings(workspace: &Path) -> Settings {
    Settings {
        listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        cache_dir: workspace.join("cache"),
        error_pages_dir: workspace.join("error_pages"),
        expiry_time: 20,
        client_timeout: 5,
        origin_connect_timeout: 2,
        origin_timeout: 2,
        ..Settings::default()
    }
}

pub struct ProxyHarness {
    _temp: TempDir,
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn get(&self, path: &str, origin_port: u16) -> Result<TestResponse> {
        send_raw(self.addr, &get_request(path, origin_port)).await
    }

    pub async fn send(&self, request: &str) -> Result<TestResponse> {
        send_raw(self.addr, request).await
    }

    pub fn cache_dir(&self) -> &Path {
        &self.settings.cache_dir
    }

    pub fn error_pages_dir(&self) -> &Path {
        &self.settings.error_pages_dir
    }

    /// Where the proxy stores `path` fetched from 127.0.0.1:`origin_port`.
    pub fn entry_path(&self, path: &str, origin_port: u16) -> PathBuf {
        let relative = path.trim_start_matches('/');
        let relative = if relative.is_empty() || relative.ends_with('/') {
            format!("{relative}index.html")
        } else {
            relative.to_string()
        };
        self.cache_dir()
            .join(format!("{}_{origin_port}", Ipv4Addr::LOCALHOST))
            .join(relative)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

pub struct ProxyHarnessBuilder {
    temp: TempDir,
    error_pages: Vec<(u16, String)>,
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl ProxyHarnessBuilder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: TempDir::new()?,
            error_pages: Vec::new(),
            settings_override: None,
        })
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    /// Pre-seeds an operator-supplied error page.
    pub fn with_error_page(mut self, status: u16, body: &str) -> Self {
        self.error_pages.push((status, body.to_string()));
        self
    }

    pub async fn spawn(mut self) -> Result<ProxyHarness> {
        let mut settings = default_test_settings(self.temp.path());
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        settings.validate()?;

        if !self.error_pages.is_empty() {
            std::fs::create_dir_all(&settings.error_pages_dir)?;
            for (status, body) in &self.error_pages {
                std::fs::write(settings.error_pages_dir.join(format!("{status}.html")), body)?;
            }
        }

        let settings = Arc::new(settings);
        let app = build_app(settings.clone()).await?;
        let bound = listener::bind(settings.listen).await?;
        let addr = bound.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            if let Err(err) = listener::serve(bound, app, shutdown_rx).await {
                tracing::error!(error = ?err, "proxy listener failed");
            }
        });

        Ok(ProxyHarness {
            _temp: self.temp,
            addr,
            settings,
            shutdown: shutdown_tx,
            handle,
        })
    }
}
