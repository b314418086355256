//! Scripted in-process render engine shared by the integration tests

#![allow(dead_code)]

use refhub::{Error, RenderEngine, RenderSession, Result, Viewport};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fake JPEG payload written for every successful render.
pub const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];

#[derive(Default)]
struct Script {
    /// Remaining failures per URL
    failures: HashMap<String, u32>,
    /// 1-based session open ordinals that fail
    failing_opens: HashSet<usize>,
    attempts: HashMap<String, u32>,
}

/// Render engine whose per-URL behaviour is scripted up front.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` renders of `url`.
    pub fn fail_times(&self, url: &str, n: u32) -> &Self {
        self.script.lock().unwrap().failures.insert(url.to_string(), n);
        self
    }

    pub fn always_fail(&self, url: &str) -> &Self {
        self.fail_times(url, u32::MAX)
    }

    /// Make the `nth` (1-based) session open fail.
    pub fn fail_open(&self, nth: usize) -> &Self {
        self.script.lock().unwrap().failing_opens.insert(nth);
        self
    }

    /// Forget all scripted failures.
    pub fn heal(&self) {
        let mut script = self.script.lock().unwrap();
        script.failures.clear();
        script.failing_opens.clear();
    }

    pub fn attempts(&self, url: &str) -> u32 {
        self.script
            .lock()
            .unwrap()
            .attempts
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn shared(&self) -> Arc<dyn RenderEngine> {
        Arc::new(self.clone())
    }
}

impl RenderEngine for ScriptedEngine {
    fn open_session(&self, _viewport: Viewport) -> Result<Box<dyn RenderSession>> {
        let nth = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if self.script.lock().unwrap().failing_opens.contains(&nth) {
            return Err(Error::SessionEstablish(format!("browser #{} did not start", nth)));
        }
        Ok(Box::new(ScriptedSession {
            engine: self.clone(),
        }))
    }
}

struct ScriptedSession {
    engine: ScriptedEngine,
}

impl RenderSession for ScriptedSession {
    fn render(&mut self, url: &str, _timeout: Duration, _jpeg_quality: u8) -> Result<Vec<u8>> {
        let mut script = self.engine.script.lock().unwrap();
        *script.attempts.entry(url.to_string()).or_insert(0) += 1;
        match script.failures.get_mut(url) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(Error::Render(format!("navigation to {} failed", url)))
            }
            _ => Ok(JPEG.to_vec()),
        }
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.engine.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
