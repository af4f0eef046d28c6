//! Headless Chrome implementation of the page-load capability.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use headless_chrome::Tab;
use tracing::{debug, info};

use crate::{Browser, BrowserOptions, FetchError, LoadedPage, PageLoader};

#[derive(Debug, Clone)]
pub struct ChromeBrowser {
    pub headless: bool,
    /// Extra settle time after navigation for client-rendered listings.
    pub settle: Duration,
}

impl Default for ChromeBrowser {
    fn default() -> Self {
        Self {
            headless: true,
            settle: Duration::from_millis(1500),
        }
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn launch(&self, options: &BrowserOptions) -> Result<Box<dyn PageLoader>, FetchError> {
        let headless = self.headless;
        let user_agent = options.user_agent.clone();
        let timeout = options.navigation_timeout;

        let launched = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            info!("launching headless Chrome");
            let launch = headless_chrome::LaunchOptions::default_builder()
                .headless(headless)
                .sandbox(false)
                .build()
                .context("building launch options")?;
            let browser = headless_chrome::Browser::new(launch).context("launching Chrome")?;
            let tab = browser.new_tab().context("opening tab")?;
            tab.set_default_timeout(timeout);
            tab.set_user_agent(&user_agent, None, None)
                .context("setting user agent")?;
            Ok((browser, tab))
        })
        .await
        .map_err(|err| FetchError::Launch(err.to_string()))?
        .map_err(|err| FetchError::Launch(format!("{err:#}")))?;

        let (browser, tab) = launched;
        Ok(Box::new(ChromePageLoader {
            _browser: browser,
            tab,
            settle: self.settle,
        }))
    }
}

pub struct ChromePageLoader {
    _browser: headless_chrome::Browser,
    tab: Arc<Tab>,
    settle: Duration,
}

#[async_trait]
impl PageLoader for ChromePageLoader {
    async fn load(&self, url: &str) -> Result<LoadedPage, FetchError> {
        let tab = Arc::clone(&self.tab);
        let target = url.to_string();
        let settle = self.settle;
        let (final_url, html) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            tab.navigate_to(&target)
                .with_context(|| format!("navigating to {target}"))?
                .wait_until_navigated()
                .with_context(|| format!("waiting for {target}"))?;
            std::thread::sleep(settle);
            let html = tab.get_content().context("reading page content")?;
            Ok((tab.get_url(), html))
        })
        .await
        .map_err(|err| FetchError::Browser(err.to_string()))?
        .map_err(|err| FetchError::Browser(format!("{err:#}")))?;

        debug!(url = %final_url, bytes = html.len(), "page loaded");

        Ok(LoadedPage {
            url: final_url,
            status: 200,
            html,
        })
    }
}
