pub mod cache;
pub mod date;
pub mod error;
pub mod error_pages;
pub mod handler;
pub mod listener;
pub mod origin;
pub mod relay;
pub mod request;
pub(crate) mod wire;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

use crate::settings::Settings;

use self::cache::DiskCache;
use self::error_pages::ErrorPages;
use self::origin::OriginLimits;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Arc<DiskCache>,
    pub error_pages: Arc<ErrorPages>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, cache: Arc<DiskCache>, error_pages: Arc<ErrorPages>) -> Self {
        Self {
            settings,
            cache,
            error_pages,
        }
    }

    pub(crate) fn origin_limits(&self) -> OriginLimits {
        OriginLimits {
            connect_timeout: self.settings.origin_connect_timeout(),
            io_timeout: self.settings.origin_timeout(),
            max_line_len: self.settings.max_header_line_size,
            max_header_lines: self.settings.max_header_lines,
            max_body_size: self.cache.max_entry_size(),
        }
    }
}

pub async fn run(app: AppContext, shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = listener::bind(app.settings.listen).await?;
    listener::serve(listener, app, shutdown).await
}
