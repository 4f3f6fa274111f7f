//! Change-notification subscriptions.
//!
//! A subscription registers interest in a resource with SUBSCRIBE, names a
//! local UDP callback endpoint, and renews its lease in the background
//! before it expires. The server pushes lightweight NOTIFY datagrams that
//! carry subscription ids only; a coalesced POLL follow-up resolves every
//! id that fired, and the caller's callback is invoked per subscription,
//! rate-limited to its minimum re-notify interval (deferred, never dropped,
//! never duplicated).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset};
use hyper::{HeaderMap, Method, header};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::{Duration, Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::dav::client::Connection;
use crate::dav::transport::Transport;
use crate::error::{Error, Result};

/// Ceiling for the doubling lease.
const DEFAULT_MAX_LEASE: Duration = Duration::from_secs(3600);
/// How long before lease expiry a renewal is attempted.
const RENEW_MARGIN: Duration = Duration::from_secs(60);

/// Lease requested on renewal: double the current one, capped.
pub fn next_lease(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Which change a subscription watches for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    /// Content of the resource changed.
    Update,
    /// A member was added below the watched collection.
    NewMember,
    /// The resource was removed.
    Delete,
    /// The resource was moved.
    Move,
}

impl ChangeType {
    pub fn as_header(self) -> &'static str {
        match self {
            ChangeType::Update => "update",
            ChangeType::NewMember => "update/newmember",
            ChangeType::Delete => "delete",
            ChangeType::Move => "move",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Registering,
    Active,
    Renewing,
    Expired,
}

pub type ChangeCallback = Arc<dyn Fn(&str, ChangeType) + Send + Sync>;

struct SubEntry {
    href: String,
    change_type: ChangeType,
    min_interval: Duration,
    lease: Duration,
    state: SubscriptionState,
    last_fired: Option<Instant>,
    /// Server clock at the last resolved change, from the POLL response's
    /// `Date` header.
    last_change: Option<DateTime<FixedOffset>>,
    callback: ChangeCallback,
    /// Cancels this subscription's renewal timer.
    renewal: CancellationToken,
}

/// Placeholder ids for subscriptions whose SUBSCRIBE is still in flight.
static REGISTRATION_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
struct Tables {
    by_id: HashMap<String, SubEntry>,
    ids_by_href: HashMap<String, Vec<String>>,
}

struct ListenerHandle {
    addr: SocketAddr,
}

/// Per-connection subscription state, owned by [`Connection`].
pub(crate) struct NotifyState {
    tables: Mutex<Tables>,
    listener: tokio::sync::Mutex<Option<ListenerHandle>>,
    pub(crate) max_lease: Duration,
}

impl Default for NotifyState {
    fn default() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            listener: tokio::sync::Mutex::new(None),
            max_lease: DEFAULT_MAX_LEASE,
        }
    }
}

/// Extract subscription ids from a NOTIFY datagram. The payload is a
/// loose HTTP-style header block; only `Subscription-id` matters.
pub fn parse_notify_ids(datagram: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(datagram);
    let mut ids = Vec::new();
    for line in text.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("subscription-id") {
            continue;
        }
        for id in value.split(',') {
            let id = id.trim();
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }
    }
    ids
}

impl<T: Transport> Connection<T> {
    /// Cap for the doubling renewal lease. Registration starts at half of
    /// this value.
    pub fn with_max_lease(mut self, max_lease: Duration) -> Self {
        self.notify.max_lease = max_lease;
        self
    }

    /// Register for change notifications on `href`. The callback runs on
    /// the notification task whenever the watched change is observed, at
    /// most once per `min_interval` (closer arrivals are deferred to the
    /// interval boundary and fire exactly once). Returns the
    /// server-assigned subscription id.
    pub async fn subscribe(
        self: Arc<Self>,
        href: &str,
        change_type: ChangeType,
        min_interval: Duration,
        callback: ChangeCallback,
    ) -> Result<String> {
        let listener_addr = start_listener(&self).await?;
        let lease = self.notify.max_lease / 2;
        let renewal = CancellationToken::new();

        let mut headers = HeaderMap::new();
        headers.insert(
            "Notification-Type",
            header::HeaderValue::from_static(change_type.as_header()),
        );
        headers.insert(
            "Subscription-Lifetime",
            header::HeaderValue::from_str(&lease.as_secs().to_string())?,
        );
        headers.insert(
            "Call-Back",
            header::HeaderValue::from_str(&format!("httpu://{}/", listener_addr))?,
        );
        headers.insert(
            "Notification-Delay",
            header::HeaderValue::from_str(&min_interval.as_secs().to_string())?,
        );

        // The entry exists, observable as Registering, while the SUBSCRIBE
        // is in flight; the server's id replaces the placeholder on success.
        let pending = format!(
            "pending-{}",
            REGISTRATION_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        {
            let mut tables = lock_tables(&self.notify);
            tables.by_id.insert(
                pending.clone(),
                SubEntry {
                    href: href.to_string(),
                    change_type,
                    min_interval,
                    lease,
                    state: SubscriptionState::Registering,
                    last_fired: None,
                    last_change: None,
                    callback,
                    renewal: renewal.clone(),
                },
            );
            tables
                .ids_by_href
                .entry(href.to_string())
                .or_default()
                .push(pending.clone());
        }

        let outcome = async {
            let resp = self
                .send(Method::from_bytes(b"SUBSCRIBE")?, href, headers, None)
                .await?;
            self.check_response(&resp)?;
            header_value(resp.headers(), "Subscription-Id")
                .ok_or_else(|| Error::Decode("subscribe response carried no id".to_string()))
                .map(|id| {
                    let lease = header_value(resp.headers(), "Subscription-Lifetime")
                        .and_then(|v| v.parse().ok())
                        .map(Duration::from_secs)
                        .unwrap_or(lease);
                    (id, lease)
                })
        }
        .await;

        let (id, lease) = match outcome {
            Ok(granted) => granted,
            Err(err) => {
                self.remove_entry(&pending);
                return Err(err);
            }
        };
        tracing::debug!(href, id, lease_secs = lease.as_secs(), "subscribed");

        {
            let mut tables = lock_tables(&self.notify);
            if let Some(mut entry) = tables.by_id.remove(&pending) {
                entry.state = SubscriptionState::Active;
                entry.lease = lease;
                tables.by_id.insert(id.clone(), entry);
            }
            if let Some(ids) = tables.ids_by_href.get_mut(href)
                && let Some(slot) = ids.iter_mut().find(|i| **i == pending)
            {
                *slot = id.clone();
            }
        }
        arm_renewal(&self, id.clone(), lease, renewal);
        Ok(id)
    }

    fn remove_entry(&self, id: &str) {
        let mut tables = lock_tables(&self.notify);
        if let Some(entry) = tables.by_id.remove(id) {
            entry.renewal.cancel();
            if let Some(ids) = tables.ids_by_href.get_mut(&entry.href) {
                ids.retain(|i| i != id);
                if ids.is_empty() {
                    tables.ids_by_href.remove(&entry.href);
                }
            }
        }
    }

    /// Cancel every subscription on `href`. The server is told on a best
    /// effort basis; an unreachable server is non-fatal since the lease
    /// expires on its own.
    pub async fn unsubscribe(&self, href: &str) -> Result<()> {
        let ids = {
            let mut tables = lock_tables(&self.notify);
            let ids = tables.ids_by_href.remove(href).unwrap_or_default();
            for id in &ids {
                if let Some(entry) = tables.by_id.remove(id) {
                    entry.renewal.cancel();
                }
            }
            ids
        };
        if ids.is_empty() {
            return Ok(());
        }
        self.drop_server_side(href, &ids).await;
        Ok(())
    }

    /// Tear the connection down: stop the listener and every background
    /// task, cancel all subscriptions, and drop the cache.
    pub async fn logout(&self) {
        self.shutdown.cancel();
        let by_href: Vec<(String, Vec<String>)> = {
            let mut tables = lock_tables(&self.notify);
            for entry in tables.by_id.values() {
                entry.renewal.cancel();
            }
            tables.by_id.clear();
            tables.ids_by_href.drain().collect()
        };
        for (href, ids) in by_href {
            self.drop_server_side(&href, &ids).await;
        }
        self.cache.clear();
    }

    pub fn subscription_state(&self, id: &str) -> Option<SubscriptionState> {
        lock_tables(&self.notify).by_id.get(id).map(|e| e.state)
    }

    /// States of every subscription on `href`, registrations in flight
    /// included.
    pub fn subscription_states(&self, href: &str) -> Vec<SubscriptionState> {
        let tables = lock_tables(&self.notify);
        tables
            .ids_by_href
            .get(href)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.by_id.get(id).map(|e| e.state))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Server clock at the last change resolved for `id`, taken from the
    /// POLL response's `Date` header.
    pub fn last_change_time(&self, id: &str) -> Option<DateTime<FixedOffset>> {
        lock_tables(&self.notify)
            .by_id
            .get(id)
            .and_then(|e| e.last_change)
    }

    pub fn active_subscriptions(&self) -> usize {
        lock_tables(&self.notify).by_id.len()
    }

    async fn drop_server_side(&self, href: &str, ids: &[String]) {
        let mut headers = HeaderMap::new();
        match header::HeaderValue::from_str(&ids.join(",")) {
            Ok(value) => {
                headers.insert("Subscription-Id", value);
            }
            Err(_) => return,
        }
        let unsubscribe = match Method::from_bytes(b"UNSUBSCRIBE") {
            Ok(m) => m,
            Err(_) => return,
        };
        if let Err(err) = self.send(unsubscribe, href, headers, None).await {
            tracing::debug!(%err, href, "unsubscribe not acknowledged, lease will expire");
        }
    }

    /// The local address the server can reach us at, learned by routing a
    /// (never sent) datagram towards it.
    async fn local_ip(&self) -> Result<std::net::IpAddr> {
        let uri = self.build_uri("")?;
        let host = uri.host().unwrap_or("127.0.0.1");
        let port = uri.port_u16().unwrap_or(80);
        let probe = UdpSocket::bind(("0.0.0.0", 0)).await?;
        probe.connect(format!("{}:{}", host, port)).await?;
        Ok(probe.local_addr()?.ip())
    }

    async fn renew_subscription(&self, id: &str) -> Result<Duration> {
        let (href, requested) = {
            let mut tables = lock_tables(&self.notify);
            let entry = tables
                .by_id
                .get_mut(id)
                .ok_or_else(|| Error::Decode(format!("unknown subscription {}", id)))?;
            entry.state = SubscriptionState::Renewing;
            (entry.href.clone(), next_lease(entry.lease, self.notify.max_lease))
        };

        let mut headers = HeaderMap::new();
        headers.insert("Subscription-Id", header::HeaderValue::from_str(id)?);
        headers.insert(
            "Subscription-Lifetime",
            header::HeaderValue::from_str(&requested.as_secs().to_string())?,
        );
        let resp = self
            .send(Method::from_bytes(b"SUBSCRIBE")?, &href, headers, None)
            .await?;
        self.check_response(&resp)?;

        let granted = header_value(resp.headers(), "Subscription-Lifetime")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(requested);
        let mut tables = lock_tables(&self.notify);
        if let Some(entry) = tables.by_id.get_mut(id) {
            entry.lease = granted;
            entry.state = SubscriptionState::Active;
        }
        tracing::trace!(id, lease_secs = granted.as_secs(), "subscription renewed");
        Ok(granted)
    }

    fn mark_expired(&self, id: &str) {
        let mut tables = lock_tables(&self.notify);
        if let Some(entry) = tables.by_id.get_mut(id) {
            entry.state = SubscriptionState::Expired;
        }
    }

    fn check_response(&self, resp: &hyper::Response<bytes::Bytes>) -> Result<()> {
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::from_status(status, None))
        }
    }

    /// Decide when a freshly notified subscription should fire: now, unless
    /// it fired within its minimum interval, in which case it is deferred
    /// to the interval boundary. An id already scheduled stays scheduled,
    /// so a burst collapses to one delivery.
    fn schedule_notification(&self, id: &str, due: &mut HashMap<String, Instant>) {
        if due.contains_key(id) {
            return;
        }
        let tables = lock_tables(&self.notify);
        let Some(entry) = tables.by_id.get(id) else {
            tracing::trace!(id, "notification for unknown subscription dropped");
            return;
        };
        let now = Instant::now();
        let at = match entry.last_fired {
            Some(last) if now < last + entry.min_interval => last + entry.min_interval,
            _ => now,
        };
        due.insert(id.to_string(), at);
    }

    /// Resolve a batch of fired subscriptions with one POLL, then invoke
    /// each callback. A failed POLL is logged but does not lose the
    /// notification; the change observation came from the server already.
    async fn resolve_notifications(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        // Server state changed under any cached search result.
        self.cache.clear();

        if let (Ok(value), Ok(poll)) = (
            header::HeaderValue::from_str(&ids.join(",")),
            Method::from_bytes(b"POLL"),
        ) {
            let mut headers = HeaderMap::new();
            headers.insert("Subscription-Id", value);
            match self.send(poll, "", headers, None).await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::trace!(count = ids.len(), "poll resolved notifications")
                }
                Ok(resp) => tracing::debug!(status = %resp.status(), "poll rejected"),
                Err(err) => tracing::debug!(%err, "poll failed"),
            }
        }

        let now = Instant::now();
        let server_time = self.last_server_time();
        let mut fired = Vec::with_capacity(ids.len());
        {
            let mut tables = lock_tables(&self.notify);
            for id in ids {
                if let Some(entry) = tables.by_id.get_mut(id) {
                    entry.last_fired = Some(now);
                    entry.last_change = server_time;
                    fired.push((entry.href.clone(), entry.change_type, entry.callback.clone()));
                }
            }
        }
        for (href, change_type, callback) in fired {
            callback(&href, change_type);
        }
    }
}

/// Bind the UDP callback endpoint and start the listener and dispatcher
/// tasks, once per connection.
async fn start_listener<T: Transport>(conn: &Arc<Connection<T>>) -> Result<SocketAddr> {
    let mut slot = conn.notify.listener.lock().await;
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.addr);
    }

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let port = socket.local_addr()?.port();
    let addr = SocketAddr::new(conn.local_ip().await?, port);

    let (tx, rx) = unbounded_channel();
    tokio::spawn(listen_loop(socket, tx, conn.shutdown.clone()));
    tokio::spawn(dispatch_loop(
        Arc::downgrade(conn),
        rx,
        conn.shutdown.clone(),
    ));

    *slot = Some(ListenerHandle { addr });
    tracing::debug!(%addr, "notification listener started");
    Ok(addr)
}

/// Renewal timer: sleeps until shortly before lease expiry, renews with a
/// doubled (capped) lease, and keeps going until cancelled or the server
/// stops cooperating. Holds the connection weakly so it never outlives it.
fn arm_renewal<T: Transport>(
    conn: &Arc<Connection<T>>,
    id: String,
    lease: Duration,
    cancel: CancellationToken,
) {
    let weak = Arc::downgrade(conn);
    tokio::spawn(async move {
        let mut lease = lease;
        loop {
            let wait = lease
                .checked_sub(RENEW_MARGIN)
                .unwrap_or(Duration::from_secs(1))
                .max(Duration::from_secs(1));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(wait) => {}
            }
            let Some(conn) = weak.upgrade() else { return };
            match conn.renew_subscription(&id).await {
                Ok(new_lease) => lease = new_lease,
                Err(err) => {
                    tracing::debug!(%err, id, "subscription renewal failed");
                    conn.mark_expired(&id);
                    return;
                }
            }
        }
    });
}

fn lock_tables(state: &NotifyState) -> std::sync::MutexGuard<'_, Tables> {
    // The tables mutex is never held across an await, so poisoning can
    // only come from a panicking callback-free section; recover the data.
    match state.tables.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn listen_loop(socket: UdpSocket, tx: UnboundedSender<String>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _)) => {
                    for id in parse_notify_ids(&buf[..len]) {
                        if tx.send(id).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => tracing::debug!(%err, "notification listener receive error"),
            }
        }
    }
}

async fn dispatch_loop<T: Transport>(
    conn: std::sync::Weak<Connection<T>>,
    mut rx: UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let mut due: HashMap<String, Instant> = HashMap::new();
    loop {
        let next_due = due.values().min().copied();
        tokio::select! {
            _ = cancel.cancelled() => return,
            id = rx.recv() => {
                let Some(id) = id else { return };
                let Some(conn) = conn.upgrade() else { return };
                conn.schedule_notification(&id, &mut due);
            }
            _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let Some(conn) = conn.upgrade() else { return };
                let now = Instant::now();
                let fire: Vec<String> = due
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in &fire {
                    due.remove(id);
                }
                conn.resolve_notifications(&fire).await;
            }
        }
    }
}
