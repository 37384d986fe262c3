use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use arboard::Clipboard;

use crate::engine::{ApplyOptions, Engine, TxOutcome};
use crate::parser::parse;

pub trait ClipboardSource {
    /// Current text content, `None` when the clipboard holds no text.
    fn read(&mut self) -> Result<Option<String>>;
}

pub struct SystemClipboard {
    clipboard: Clipboard,
}

impl SystemClipboard {
    pub fn new() -> Result<Self> {
        let clipboard = Clipboard::new().context("opening clipboard")?;
        Ok(Self { clipboard })
    }
}

impl ClipboardSource for SystemClipboard {
    fn read(&mut self) -> Result<Option<String>> {
        match self.clipboard.get_text() {
            Ok(text) => Ok(Some(text)),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(err) => Err(err).context("reading clipboard text"),
        }
    }
}

/// Clears the watcher's loop from any thread.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Polls a clipboard and feeds every new patch through the engine. Each tick runs
/// the pipeline to completion before the next read, so invocations never overlap.
pub struct ClipboardWatcher<S> {
    source: S,
    interval: Duration,
    last_seen: Option<String>,
    stop: StopHandle,
}

impl<S: ClipboardSource> ClipboardWatcher<S> {
    pub fn new(source: S, interval: Duration) -> Self {
        Self {
            source,
            interval,
            last_seen: None,
            stop: StopHandle::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Remembers what is on the clipboard now so it is not applied on startup.
    pub fn prime(&mut self) -> Result<()> {
        self.last_seen = self.source.read()?;
        Ok(())
    }

    pub fn poll_once(&mut self, engine: &mut Engine) -> Result<Option<TxOutcome>> {
        let Some(text) = self.source.read()? else {
            return Ok(None);
        };
        if self.last_seen.as_deref() == Some(text.as_str()) {
            return Ok(None);
        }
        let parsed = parse(&text);
        self.last_seen = Some(text);

        let Some(change_set) = parsed else {
            engine.logger().debug("clipboard changed but holds no patch");
            return Ok(None);
        };
        let outcome = engine.apply_change_set(&change_set, ApplyOptions::default())?;
        Ok(Some(outcome))
    }

    pub fn run(&mut self, engine: &mut Engine) -> Result<()> {
        self.prime()?;
        engine.logger().info(format!(
            "watching the clipboard every {} ms; Ctrl+C to stop",
            self.interval.as_millis()
        ));
        while !self.stop.is_stopped() {
            if let Err(err) = self.poll_once(engine) {
                engine.logger().error(format!("{err:#}"));
            }
            thread::sleep(self.interval);
        }
        Ok(())
    }
}
