//! Line-delimited JSON bridge to the host's embedded browser.
//!
//! Outbound (stdout), one object per line:
//! - `{"id":1,"command":"loadUrl","surface":"identity","url":"…"}`
//! - `{"id":2,"command":"injectScript","surface":"conversion","source":"…"}`
//! - `{"id":3,"command":"currentUrl","surface":"identity"}`
//! - `{"event":"state","state":{…}}` for every orchestrator transition
//!
//! Inbound (stdin): `{"reply":1,"ok":true,"value":…}` answers a command (`error`
//! instead of `value` when `ok` is false). Any other line is a page message and goes
//! to the message bus.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use ka_activation::{ActivationState, BrowserAutomation, MessageBus, Surface};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
enum Command<'a> {
    LoadUrl { surface: &'static str, url: &'a str },
    InjectScript { surface: &'static str, source: &'a str },
    CurrentUrl { surface: &'static str },
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    command: Command<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HostEvent<'a> {
    State { state: &'a ActivationState },
}

#[derive(Debug, Deserialize)]
struct Reply {
    reply: u64,
    ok: bool,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

fn surface_name(surface: Surface) -> &'static str {
    match surface {
        Surface::Identity => "identity",
        Surface::Conversion => "conversion",
    }
}

enum Outbound {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// [`BrowserAutomation`] over stdio.
pub struct StdioBridge {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    out: mpsc::UnboundedSender<Outbound>,
}

impl StdioBridge {
    /// Start the stdout writer. Pair with [`StdioBridge::read_stdin`].
    pub fn spawn() -> Arc<Self> {
        let (out, mut rx) = mpsc::unbounded_channel::<Outbound>();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(outbound) = rx.recv().await {
                let line = match outbound {
                    Outbound::Line(line) => line,
                    Outbound::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                let written = async {
                    stdout.write_all(line.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                    stdout.flush().await
                };
                if let Err(e) = written.await {
                    warn!(error = %e, "Host bridge closed stdout");
                    break;
                }
            }
        });

        Arc::new(Self {
            next_id: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
            out,
        })
    }

    pub fn emit(&self, event: HostEvent<'_>) {
        match serde_json::to_string(&event) {
            Ok(line) => {
                let _ = self.out.send(Outbound::Line(line));
            }
            Err(e) => warn!(error = %e, "Unserializable host event"),
        }
    }

    /// Wait until everything emitted so far has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.out.send(Outbound::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Route stdin lines until EOF: command replies to their caller, everything
    /// else to `bus`.
    pub async fn read_stdin(self: Arc<Self>, bus: Arc<MessageBus>) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.route(&line, &bus),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read from host");
                    break;
                }
            }
        }
        debug!("Host closed stdin");
        // Nothing can answer any more.
        self.waiting.lock().clear();
        bus.cancel_all();
    }

    fn route(&self, line: &str, bus: &MessageBus) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if let Ok(reply) = serde_json::from_str::<Reply>(line) {
            match self.waiting.lock().remove(&reply.reply) {
                Some(waiter) => {
                    let _ = waiter.send(reply);
                }
                None => warn!(id = reply.reply, "Reply for unknown command"),
            }
            return;
        }
        if let Err(e) = bus.dispatch_json(line) {
            warn!(error = %e, "Unrecognized message from host");
        }
    }

    async fn call(&self, command: Command<'_>) -> Result<serde_json::Value, String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&Envelope { id, command }).map_err(|e| e.to_string())?;

        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(id, tx);
        if self.out.send(Outbound::Line(line)).is_err() {
            self.waiting.lock().remove(&id);
            return Err("host bridge closed".to_string());
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(reply)) if reply.ok => Ok(reply.value),
            Ok(Ok(reply)) => Err(reply
                .error
                .unwrap_or_else(|| "command failed".to_string())),
            Ok(Err(_)) => Err("host bridge closed".to_string()),
            Err(_) => {
                self.waiting.lock().remove(&id);
                Err(format!("host did not answer command {} in time", id))
            }
        }
    }
}

#[async_trait]
impl BrowserAutomation for StdioBridge {
    async fn load_url(&self, surface: Surface, url: &str) -> Result<(), String> {
        self.call(Command::LoadUrl {
            surface: surface_name(surface),
            url,
        })
        .await
        .map(|_| ())
    }

    async fn inject_script(&self, surface: Surface, source: &str) -> Result<serde_json::Value, String> {
        self.call(Command::InjectScript {
            surface: surface_name(surface),
            source,
        })
        .await
    }

    async fn current_url(&self, surface: Surface) -> Option<String> {
        match self
            .call(Command::CurrentUrl {
                surface: surface_name(surface),
            })
            .await
        {
            Ok(serde_json::Value::String(url)) => Some(url),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Host could not report current URL");
                None
            }
        }
    }
}
