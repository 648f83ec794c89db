//! GENA eventing: subscription bookkeeping and property-change NOTIFY
//! callbacks.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};
use url::Url;

use crate::soap::xml_escape;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone)]
pub struct Subscriber {
    pub sid: String,
    pub callbacks: Vec<Url>,
    pub expiry: Instant,
    /// 0 is reserved for the initial event; afterwards the counter wraps
    /// from `u32::MAX` back to 1.
    pub next_seq: u32,
}

/// The subscriber table for one evented service. Expired entries are
/// dropped lazily on the next touch; there is no background reaper.
#[derive(Default)]
pub struct Subscriptions {
    subs: Mutex<HashMap<String, Subscriber>>,
}

/// Extracts the `<url>` entries of a CALLBACK header.
pub fn parse_callback_urls(callback: &str) -> Vec<Url> {
    let mut out = Vec::new();
    let mut rest = callback;
    while let Some(open) = rest.find('<') {
        let Some(close) = rest[open..].find('>') else {
            break;
        };
        let raw = &rest[open + 1..open + close];
        match Url::parse(raw) {
            Ok(url) => out.push(url),
            Err(e) => debug!("bad callback url {raw:?}: {e}"),
        }
        rest = &rest[open + close + 1..];
    }
    out
}

/// Parses a `TIMEOUT: Second-<n>` header; `Second-infinite` and anything
/// unparseable fall back to the default.
pub fn parse_timeout(header: Option<&str>) -> Duration {
    header
        .and_then(|h| h.trim().strip_prefix("Second-"))
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT)
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(subs: &mut HashMap<String, Subscriber>) {
        let now = Instant::now();
        subs.retain(|_, sub| sub.expiry > now);
    }

    /// Registers a subscriber; returns the SID and granted timeout.
    pub fn subscribe(&self, callbacks: Vec<Url>, timeout: Duration) -> Result<(String, Duration)> {
        if callbacks.is_empty() {
            bail!("subscription carries no callback URLs");
        }
        let sid = format!("uuid:{}", uuid::Uuid::new_v4());
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut subs);
        subs.insert(
            sid.clone(),
            Subscriber {
                sid: sid.clone(),
                callbacks,
                expiry: Instant::now() + timeout,
                next_seq: 0,
            },
        );
        Ok((sid, timeout))
    }

    /// Refreshes an existing subscription's expiry.
    pub fn renew(&self, sid: &str, timeout: Duration) -> Result<Duration> {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut subs);
        let sub = subs
            .get_mut(sid)
            .with_context(|| format!("no such subscription {sid:?}"))?;
        sub.expiry = Instant::now() + timeout;
        Ok(timeout)
    }

    pub fn unsubscribe(&self, sid: &str) -> Result<()> {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.remove(sid)
            .with_context(|| format!("no such subscription {sid:?}"))?;
        Ok(())
    }

    /// Takes the event sequence number for a subscriber and advances it,
    /// wrapping from the maximum back to 1 so 0 stays unique to the
    /// initial event.
    pub fn take_seq(&self, sid: &str) -> Result<(u32, Vec<Url>)> {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut subs);
        let sub = subs
            .get_mut(sid)
            .with_context(|| format!("no such subscription {sid:?}"))?;
        let seq = sub.next_seq;
        sub.next_seq = match sub.next_seq {
            u32::MAX => 1,
            n => n + 1,
        };
        Ok((seq, sub.callbacks.clone()))
    }

    pub fn len(&self) -> usize {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut subs);
        subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Renders the `e:propertyset` body for a property-change event.
pub fn render_property_set(properties: &[(&str, String)]) -> String {
    let mut out = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">"#,
    );
    for (name, value) in properties {
        out.push_str(&format!(
            "<e:property><{name}>{}</{name}></e:property>",
            xml_escape(value)
        ));
    }
    out.push_str("</e:propertyset>");
    out
}

/// Delivers one NOTIFY to a callback URL.
pub async fn notify(url: &Url, sid: &str, seq: u32, body: String) -> Result<()> {
    let method = reqwest::Method::from_bytes(b"NOTIFY").expect("static method name");
    let resp = reqwest::Client::new()
        .request(method, url.clone())
        .header("CONTENT-TYPE", "text/xml; charset=\"utf-8\"")
        .header("NT", "upnp:event")
        .header("NTS", "upnp:propchange")
        .header("SID", sid)
        .header("SEQ", seq.to_string())
        .body(body)
        .send()
        .await
        .with_context(|| format!("delivering event to {url}"))?;
    if !resp.status().is_success() {
        bail!("event callback {url} answered {}", resp.status());
    }
    Ok(())
}

/// Fire-and-forget initial event for a fresh subscription.
pub fn spawn_initial_notify(subs: &Subscriptions, sid: String, properties: Vec<(&'static str, String)>) {
    let seq_and_urls = subs.take_seq(&sid);
    tokio::spawn(async move {
        let (seq, urls) = match seq_and_urls {
            Ok(pair) => pair,
            Err(e) => {
                debug!("skipping initial event: {e}");
                return;
            }
        };
        let body = render_property_set(&properties);
        for url in urls {
            if let Err(e) = notify(&url, &sid, seq, body.clone()).await {
                warn!("initial event delivery failed: {e:#}");
            }
        }
    });
}
