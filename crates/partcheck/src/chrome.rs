//! Navigation over a real Chrome instance.
//!
//! [`ChromeNavigator`] drives headless Chrome through chromiumoxide and
//! implements [`NavigationService`]: every opened scenario is its own tab,
//! and a load counts as complete once `document.readyState` reports
//! `"complete"`.
//!
//! Chrome exposes neither its HTTP cache contents nor a synchronous channel
//! hook over CDP, so the other three collaborators still come from the
//! embedding browser (or [`crate::sim`]).
//!
//! # Resource Safety
//!
//! Dropping a navigator kills the Chrome process through chromiumoxide's own
//! `Drop`, but [`ChromeNavigator::shutdown`] shuts it down gracefully and should
//! be preferred.

use crate::driver::{NavigationService, TabHandle};
use crate::error::{HarnessError, Result};
use crate::wait::{wait_for_result, WaitConfig, DEFAULT_POLL_INTERVAL};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for launching Chrome.
#[derive(Debug, Clone)]
pub struct ChromeConfig {
    /// Run without a window (default: true unless the `visible` feature is on).
    pub headless: bool,

    /// Browser window size (default: 1280x800).
    pub window_size: (u32, u32),

    /// Additional Chrome arguments.
    pub args: Vec<String>,

    /// Chrome executable path (None = auto-detect).
    pub chrome_path: Option<PathBuf>,

    /// Interval between `readyState` polls.
    pub poll_interval: Duration,
}

impl ChromeConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shows the browser window.
    #[must_use]
    pub fn visible(mut self) -> Self {
        self.headless = false;
        self
    }

    /// Uses the Chrome executable at `path`.
    #[must_use]
    pub fn with_chrome_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_path = Some(path.into());
        self
    }

    /// Adds Chrome arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    fn launch_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 3);
        if self.headless {
            args.push("--headless".to_string());
        }
        args.push(format!(
            "--window-size={},{}",
            self.window_size.0, self.window_size.1
        ));

        // A fresh profile per instance keeps parallel runs from sharing a
        // cache or tripping over the profile lock.
        let user_data_dir = std::env::temp_dir().join(format!("partcheck-{}", uuid::Uuid::new_v4()));
        args.push(format!("--user-data-dir={}", user_data_dir.display()));

        args.extend(self.args.iter().cloned());
        args
    }

    fn to_browser_config(&self) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder();
        if !self.headless {
            // the builder defaults to headless mode on its own
            builder = builder.with_head();
        }
        for arg in self.launch_args() {
            builder = builder.arg(arg);
        }
        if let Some(path) = &self.chrome_path {
            builder = builder.chrome_executable(path);
        }

        builder.build().map_err(|reason| HarnessError::NavigationFailed {
            url: "about:blank".into(),
            reason: format!("invalid browser configuration: {reason}"),
        })
    }
}

impl Default for ChromeConfig {
    fn default() -> Self {
        Self {
            headless: !cfg!(feature = "visible"),
            window_size: (1280, 800),
            args: vec![
                // Required when user namespaces are unavailable (containers, CI).
                // Never point a sandboxless browser at untrusted content.
                "--no-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
            ],
            chrome_path: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A Chrome instance serving as the harness's navigation collaborator.
pub struct ChromeNavigator {
    browser: Mutex<Option<Browser>>,
    pages: Mutex<HashMap<TabHandle, Page>>,
    next_tab: AtomicU64,
    poll_interval: Duration,
    handler: JoinHandle<()>,
}

impl ChromeNavigator {
    /// Launches Chrome and starts driving its CDP connection.
    ///
    /// # Errors
    ///
    /// Returns `NavigationFailed` for a bad configuration, or the
    /// chromiumoxide error if Chrome cannot be started.
    pub async fn launch(config: ChromeConfig) -> Result<Self> {
        debug!(?config, "launching chrome");
        let (browser, mut handler) = Browser::launch(config.to_browser_config()?).await?;

        // chromiumoxide only processes CDP traffic while its handler is polled
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("chrome handler error: {e}");
                }
            }
        });

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            pages: Mutex::new(HashMap::new()),
            next_tab: AtomicU64::new(0),
            poll_interval: config.poll_interval,
            handler,
        })
    }

    /// Number of tabs currently open through this navigator.
    pub async fn open_tabs(&self) -> usize {
        self.pages.lock().await.len()
    }

    /// Closes any remaining tabs, then Chrome itself.
    ///
    /// # Errors
    ///
    /// Returns the first CDP error; remaining cleanup still runs.
    pub async fn shutdown(self) -> Result<()> {
        let pages: Vec<Page> = self.pages.lock().await.drain().map(|(_, page)| page).collect();
        let mut result: Result<()> = Ok(());
        for page in pages {
            if let Err(e) = page.close().await {
                warn!("failed to close leftover tab: {e}");
                result = result.and(Err(e.into()));
            }
        }

        if let Some(mut browser) = self.browser.lock().await.take() {
            debug!("closing chrome");
            if let Err(e) = browser.close().await {
                result = result.and(Err(e.into()));
            }
            let _ = browser.wait().await;
        }
        self.handler.abort();

        result
    }
}

#[async_trait]
impl NavigationService for ChromeNavigator {
    async fn open(&self, url: &str) -> Result<TabHandle> {
        let browser = self.browser.lock().await;
        let browser = browser.as_ref().ok_or_else(|| HarnessError::NavigationFailed {
            url: url.to_string(),
            reason: "browser already closed".into(),
        })?;

        let page = browser
            .new_page(url)
            .await
            .map_err(|e| HarnessError::NavigationFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let tab = TabHandle::new(self.next_tab.fetch_add(1, Ordering::Relaxed));
        self.pages.lock().await.insert(tab, page);
        debug!(%tab, url, "tab opened");
        Ok(tab)
    }

    async fn wait_for_load(&self, tab: TabHandle, timeout: Duration) -> Result<()> {
        let page = self
            .pages
            .lock()
            .await
            .get(&tab)
            .cloned()
            .ok_or(HarnessError::UnknownHandle(tab))?;

        wait_for_result(
            || {
                let page = page.clone();
                async move {
                    let result = page.evaluate("document.readyState").await?;
                    Ok(result
                        .value()
                        .and_then(|v| v.as_str())
                        .is_some_and(|s| s == "complete"))
                }
            },
            WaitConfig::new(timeout, self.poll_interval),
            &format!("load of {tab}"),
        )
        .await
    }

    async fn close(&self, tab: TabHandle) -> Result<()> {
        let page = self
            .pages
            .lock()
            .await
            .remove(&tab)
            .ok_or(HarnessError::UnknownHandle(tab))?;
        page.close().await?;
        debug!(%tab, "tab closed");
        Ok(())
    }
}

impl Drop for ChromeNavigator {
    fn drop(&mut self) {
        if self.browser.get_mut().is_some() {
            warn!("ChromeNavigator dropped without shutdown() - killing chrome via Drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sandboxless() {
        let config = ChromeConfig::default();
        assert_eq!(config.headless, !cfg!(feature = "visible"));
        assert!(config.args.iter().any(|a| a == "--no-sandbox"));
    }

    #[test]
    fn every_launch_gets_its_own_profile() {
        let config = ChromeConfig::new().visible();
        let first = config.launch_args();
        let second = config.launch_args();

        assert!(!first.iter().any(|a| a == "--headless"));
        let profile = |args: &[String]| {
            args.iter()
                .find(|a| a.starts_with("--user-data-dir="))
                .cloned()
                .unwrap()
        };
        assert_ne!(profile(&first), profile(&second));
    }

    #[test]
    fn extra_args_come_last() {
        let args = ChromeConfig::new()
            .with_args(["--disable-gpu".to_string()])
            .launch_args();
        assert_eq!(args.last().map(String::as_str), Some("--disable-gpu"));
    }

    #[tokio::test]
    #[ignore] // Requires Chrome to be installed
    async fn launch_open_and_close() {
        let navigator = ChromeNavigator::launch(ChromeConfig::default())
            .await
            .expect("failed to launch chrome");

        let tab = navigator.open("about:blank").await.expect("failed to open");
        navigator
            .wait_for_load(tab, Duration::from_secs(5))
            .await
            .expect("about:blank never loaded");
        navigator.close(tab).await.expect("failed to close tab");

        assert!(matches!(
            navigator.close(tab).await,
            Err(HarnessError::UnknownHandle(_))
        ));
        navigator.shutdown().await.expect("failed to shut down chrome");
    }
}
