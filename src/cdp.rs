//! Chrome DevTools Protocol render backend

use crate::{Error, RenderEngine, RenderSession, Result, Viewport};
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions};
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// Full document size in CSS pixels, never smaller than the viewport.
const PAGE_SIZE_SCRIPT: &str = r#"
(function() {
    const el = document.documentElement;
    const body = document.body || el;
    return JSON.stringify([
        Math.max(el.scrollWidth, body.scrollWidth, el.clientWidth),
        Math.max(el.scrollHeight, body.scrollHeight, el.clientHeight)
    ]);
})()
"#;

/// Headless Chrome render engine (uses the `headless_chrome` crate)
///
/// Every session launches its own browser process sized to the viewport and
/// drives a single tab, so partitions never share cookies or cache.
#[derive(Debug, Clone, Default)]
pub struct CdpRenderer;

impl RenderEngine for CdpRenderer {
    fn open_session(&self, viewport: Viewport) -> Result<Box<dyn RenderSession>> {
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some((viewport.width, viewport.height)))
            .build()
            .map_err(|e| Error::SessionEstablish(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::SessionEstablish(format!("Failed to launch browser: {}", e)))?;

        let tab = browser
            .new_tab()
            .map_err(|e| Error::SessionEstablish(format!("Failed to create tab: {}", e)))?;

        debug!("Chrome session opened at {}x{}", viewport.width, viewport.height);
        Ok(Box::new(CdpSession { browser, tab }))
    }
}

/// One browser process plus its tab.
pub struct CdpSession {
    browser: Browser,
    tab: Arc<Tab>,
}

impl CdpSession {
    fn page_size(&self) -> Result<(f64, f64)> {
        let eval = self
            .tab
            .evaluate(PAGE_SIZE_SCRIPT, false)
            .map_err(|e| Error::Render(format!("Failed to measure page: {}", e)))?;

        let raw = eval
            .value
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Render("Page size evaluation returned no value".into()))?;
        let [width, height]: [f64; 2] = serde_json::from_str(raw)
            .map_err(|e| Error::Render(format!("Unexpected page size '{}': {}", raw, e)))?;
        Ok((width, height))
    }
}

impl RenderSession for CdpSession {
    fn render(&mut self, url: &str, timeout: Duration, jpeg_quality: u8) -> Result<Vec<u8>> {
        let timeout_ms = timeout.as_millis() as u64;
        self.tab.set_default_timeout(timeout);

        self.tab
            .navigate_to(url)
            .map_err(|e| nav_error(e, timeout_ms, "Navigation failed"))?;
        self.tab
            .wait_until_navigated()
            .map_err(|e| nav_error(e, timeout_ms, "Wait for navigation failed"))?;

        let (width, height) = self.page_size()?;
        let clip = Page::Viewport {
            x: 0.0,
            y: 0.0,
            width,
            height,
            scale: 1.0,
        };

        let jpeg = self
            .tab
            .capture_screenshot(
                Page::CaptureScreenshotFormatOption::Jpeg,
                Some(u32::from(jpeg_quality)),
                Some(clip),
                true,
            )
            .map_err(|e| Error::Render(format!("Screenshot failed: {}", e)))?;

        debug!("Rendered {} ({}x{} css px, {} bytes)", url, width, height, jpeg.len());
        Ok(jpeg)
    }

    fn close(self: Box<Self>) -> Result<()> {
        // Dropping the browser terminates the child process.
        let CdpSession { browser, tab } = *self;
        drop(tab);
        drop(browser);
        Ok(())
    }
}

fn nav_error(err: anyhow::Error, timeout_ms: u64, context: &str) -> Error {
    if err.downcast_ref::<headless_chrome::util::Timeout>().is_some() {
        Error::Timeout(timeout_ms)
    } else {
        Error::Render(format!("{}: {}", context, err))
    }
}
