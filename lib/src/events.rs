//! Reporting update lifecycle events to the device gateway.
//!
//! Events queue in memory and flush opportunistically; a flush is
//! skipped while the device looks offline. Only name resolution failure
//! counts as offline: a TLS or connection error still means the network
//! is there, and the POST is allowed to fail on its own.

use std::cell::RefCell;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::target::Target;

/// Download of a Target has started.
pub(crate) const EVENT_DOWNLOAD_STARTED: &str = "EcuDownloadStarted";
/// Download of a Target finished, successfully or not.
pub(crate) const EVENT_DOWNLOAD_COMPLETED: &str = "EcuDownloadCompleted";
/// Installation of a downloaded Target has started.
pub(crate) const EVENT_INSTALLATION_STARTED: &str = "EcuInstallationStarted";
/// Installation staged, pending a reboot or finalize.
pub(crate) const EVENT_INSTALLATION_APPLIED: &str = "EcuInstallationApplied";
/// Installation finalized, successfully or not.
pub(crate) const EVENT_INSTALLATION_COMPLETED: &str = "EcuInstallationCompleted";

#[derive(Debug, Serialize)]
struct EventType {
    id: String,
    version: u32,
}

#[derive(Debug, Serialize)]
struct EventBody {
    #[serde(rename = "targetName")]
    target_name: String,
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
}

/// One lifecycle event.
#[derive(Debug, Serialize)]
pub(crate) struct Event {
    id: String,
    #[serde(rename = "deviceTime")]
    device_time: String,
    #[serde(rename = "eventType")]
    event_type: EventType,
    event: EventBody,
}

impl Event {
    /// Create an event of the given kind about `target`.
    pub(crate) fn new(kind: &str, target: &Target, success: Option<bool>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            event_type: EventType {
                id: kind.to_string(),
                version: 1,
            },
            event: EventBody {
                target_name: target.name.clone(),
                version: target.custom.version.clone(),
                success,
            },
        }
    }
}

/// Bounded queue of events awaiting delivery to the gateway.
#[derive(Debug)]
pub(crate) struct ReportQueue {
    client: reqwest::blocking::Client,
    server: String,
    event_number_limit: Option<usize>,
    events: RefCell<Vec<Event>>,
}

impl ReportQueue {
    /// Create a queue posting to `<server>/events`; `event_number_limit`
    /// bounds how many undelivered events are retained.
    pub(crate) fn new(
        client: reqwest::blocking::Client,
        server: String,
        event_number_limit: Option<usize>,
    ) -> Self {
        Self {
            client,
            server,
            event_number_limit,
            events: RefCell::new(Vec::new()),
        }
    }

    /// Queue an event. Past the limit new events are dropped (and
    /// logged), never the backlog: the oldest events describe how the
    /// device got into its current state.
    pub(crate) fn push(&self, event: Event) {
        let mut events = self.events.borrow_mut();
        if let Some(limit) = self.event_number_limit {
            if events.len() >= limit {
                tracing::warn!(
                    "Event queue limit ({limit}) reached, dropping {} event",
                    event.event_type.id
                );
                return;
            }
        }
        events.push(event);
    }

    /// Try to deliver the queued events; undelivered events stay queued
    /// for the next flush.
    pub(crate) fn flush(&self) {
        if self.events.borrow().is_empty() {
            return;
        }
        if !check_connectivity(&self.server) {
            tracing::debug!("Device appears to be offline, postponing event delivery");
            return;
        }
        let url = format!("{}/events", self.server);
        let events = self.events.borrow();
        let r = self
            .client
            .post(&url)
            .json(&*events)
            .send()
            .and_then(|r| r.error_for_status());
        drop(events);
        match r {
            Ok(_) => self.events.borrow_mut().clear(),
            Err(e) => tracing::warn!("Failed to report events to {url}: {e}"),
        }
    }
}

/// Probe whether the device can reach `server` at all, without a full
/// TLS handshake. Returns offline only when the resolver fails; any
/// reachable-network outcome (including refused connections and
/// certificate errors later on) counts as online.
pub(crate) fn check_connectivity(server: &str) -> bool {
    let url = match reqwest::Url::parse(server) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!("Unparseable server url {server}: {e}");
            return true;
        }
    };
    let host = match url.host_str() {
        Some(h) => h.to_string(),
        None => return true,
    };
    let port = url.port_or_known_default().unwrap_or(443);
    match (host.as_str(), port).to_socket_addrs() {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.next() {
                // Connect-only; the outcome doesn't matter.
                let _ = TcpStream::connect_timeout(&addr, Duration::from_secs(10));
            }
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetCustom;

    fn target() -> Target {
        let mut custom = TargetCustom::default();
        custom.version = "2".into();
        Target {
            name: "lmp-2".into(),
            sha256: "a".repeat(64),
            custom,
        }
    }

    #[test]
    fn test_event_shape() {
        let e = Event::new(EVENT_DOWNLOAD_COMPLETED, &target(), Some(true));
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["eventType"]["id"], "EcuDownloadCompleted");
        assert_eq!(v["eventType"]["version"], 1);
        assert_eq!(v["event"]["targetName"], "lmp-2");
        assert_eq!(v["event"]["success"], true);
        assert!(v["id"].as_str().is_some());
    }

    #[test]
    fn test_queue_limit_drops_new() {
        let q = ReportQueue::new(reqwest::blocking::Client::new(), "http://gw".into(), Some(1));
        q.push(Event::new(EVENT_DOWNLOAD_STARTED, &target(), None));
        q.push(Event::new(EVENT_DOWNLOAD_COMPLETED, &target(), Some(true)));
        assert_eq!(q.events.borrow().len(), 1);
        assert_eq!(q.events.borrow()[0].event_type.id, EVENT_DOWNLOAD_STARTED);
    }

    #[test]
    fn test_unresolvable_host_is_offline() {
        assert!(!check_connectivity(
            "https://does-not-resolve.invalid.example.test"
        ));
    }
}
