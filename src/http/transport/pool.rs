//! Connection pooling
//!
//! Connections are grouped by [`Route`]. An HTTP/2 connection serves every
//! request of its route while it has a free stream slot, the least loaded one
//! first; an HTTP/1.1 connection is leased to one request at a time and comes
//! back once that response has been read to the end.
//!
//! Lock order: the pool lock may be held while a connection's own state is
//! locked, and a connection may signal a release while holding its state
//! lock, but the release signal is never held while taking either.

use super::{establish, Destination, Error, Protocol, Result, Scheme, TransportConfig};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Pool key: connections are only shared between identical routes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    scheme: Scheme,
    host: String,
    port: u16,
    /// Proxy the connections go through
    proxy: Option<Destination>,
}

impl Route {
    /// The route to `destination` under `config`, proxy included
    pub fn new(destination: &Destination, config: &TransportConfig) -> Route {
        Route {
            proxy: config.proxy_for(destination).map(|proxy| proxy.address().clone()),
            ..Route::from(destination)
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> Option<&Destination> {
        self.proxy.as_ref()
    }
}

impl From<&Destination> for Route {
    fn from(destination: &Destination) -> Self {
        Route {
            scheme: destination.scheme(),
            host: destination.host().to_string(),
            port: destination.port(),
            proxy: None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        match &self.proxy {
            Some(proxy) => write!(f, " via {}", proxy),
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wakes acquirers waiting for a connection to free up
///
/// The generation counter makes a release between "nothing available" and
/// the wait visible.
#[derive(Default)]
struct ReleaseSignal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl ReleaseSignal {
    fn generation(&self) -> u64 {
        *lock(&self.generation)
    }

    fn notify(&self) {
        *lock(&self.generation) += 1;
        self.changed.notify_all();
    }

    fn wait(&self, seen: u64, timeout: Duration) {
        let guard = lock(&self.generation);
        let _ = self
            .changed
            .wait_timeout_while(guard, timeout, |generation| *generation == seen);
    }
}

#[derive(Default)]
struct RouteEntry {
    connections: Vec<Arc<dyn Protocol>>,
    /// Connections being established, counted against the route limit
    connecting: usize,
}

impl RouteEntry {
    /// Take out connections that can no longer carry requests
    fn evict(&mut self, now: Instant, idle_timeout: Option<Duration>) -> Vec<Arc<dyn Protocol>> {
        let (keep, evicted): (Vec<_>, Vec<_>) = mem::take(&mut self.connections)
            .into_iter()
            .partition(|conn| is_usable(&**conn, now, idle_timeout));
        self.connections = keep;
        evicted
    }
}

fn is_usable(conn: &dyn Protocol, now: Instant, idle_timeout: Option<Duration>) -> bool {
    let expired = match (conn.idle_since(), idle_timeout) {
        (Some(since), Some(limit)) => now.saturating_duration_since(since) >= limit,
        _ => false,
    };
    conn.is_open() && !expired
}

/// Close evicted connections that have nothing in flight; the rest finish
/// their exchanges and close once the last handle goes away
fn retire(evicted: Vec<Arc<dyn Protocol>>) {
    for conn in evicted {
        if conn.load() == 0 {
            conn.close();
        }
    }
}

type Connector = dyn Fn(&Destination, &TransportConfig) -> Result<Arc<dyn Protocol>> + Send + Sync;

enum Step {
    Ready(Arc<dyn Protocol>),
    Connect,
    Wait,
}

/// Connections per route, up to the configured limit
pub struct ConnectionPool {
    config: Arc<TransportConfig>,
    routes: Mutex<HashMap<Route, RouteEntry>>,
    released: Arc<ReleaseSignal>,
    connector: Box<Connector>,
}

impl ConnectionPool {
    pub fn new(config: Arc<TransportConfig>) -> Self {
        ConnectionPool::with_connector(config, Box::new(establish))
    }

    pub(crate) fn with_connector(config: Arc<TransportConfig>, connector: Box<Connector>) -> Self {
        ConnectionPool {
            config,
            routes: Mutex::new(HashMap::new()),
            released: Arc::new(ReleaseSignal::default()),
            connector,
        }
    }

    /// A connection ready for one request to `destination`
    ///
    /// Reuses a pooled connection when one has room, opens a new one while
    /// the route is below its limit, and otherwise waits for a release up
    /// to the acquire timeout.
    pub(crate) fn acquire(&self, destination: &Destination) -> Result<Arc<dyn Protocol>> {
        let route = Route::new(destination, &self.config);
        let timeout = self.config.acquire_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            let seen = self.released.generation();
            let (step, evicted) = {
                let mut routes = lock(&self.routes);
                let entry = routes.entry(route.clone()).or_default();
                let evicted = entry.evict(Instant::now(), self.config.idle_timeout());

                let mut candidates: Vec<&Arc<dyn Protocol>> = entry.connections.iter().collect();
                candidates.sort_by_key(|conn| conn.load());
                let chosen = candidates
                    .into_iter()
                    .find(|conn| conn.try_acquire())
                    .map(Arc::clone);

                let step = match chosen {
                    Some(conn) => Step::Ready(conn),
                    None if entry.connections.len() + entry.connecting
                        < self.config.max_connections_per_route() =>
                    {
                        entry.connecting += 1;
                        Step::Connect
                    }
                    None => Step::Wait,
                };
                (step, evicted)
            };
            if !evicted.is_empty() {
                log::debug!("pool: evicted {} connection(s) for {}", evicted.len(), route);
                retire(evicted);
            }

            match step {
                Step::Ready(conn) => {
                    log::trace!("pool: reusing {} connection for {}", conn.version(), route);
                    return Ok(conn);
                }
                Step::Connect => return self.connect(&route, destination),
                Step::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        log::debug!("pool: no connection for {} within {:?}", route, timeout);
                        return Err(Error::PoolExhausted(timeout));
                    }
                    self.released.wait(seen, deadline - now);
                }
            }
        }
    }

    fn connect(&self, route: &Route, destination: &Destination) -> Result<Arc<dyn Protocol>> {
        let result = (self.connector)(destination, &self.config);

        let mut routes = lock(&self.routes);
        let entry = routes.entry(route.clone()).or_default();
        entry.connecting -= 1;
        match result {
            Ok(conn) => {
                let signal: Weak<ReleaseSignal> = Arc::downgrade(&self.released);
                conn.set_release_hook(Arc::new(move || {
                    if let Some(signal) = signal.upgrade() {
                        signal.notify();
                    }
                }));
                // reserve it for this caller before anyone else can see it
                conn.try_acquire();
                entry.connections.push(Arc::clone(&conn));
                log::debug!(
                    "pool: new {} connection for {} ({} open)",
                    conn.version(),
                    route,
                    entry.connections.len()
                );
                Ok(conn)
            }
            Err(e) => {
                drop(routes);
                // the slot counted for this attempt is free again
                self.released.notify();
                Err(e)
            }
        }
    }

    /// Drop dead connections and those idle past the idle timeout,
    /// returning how many went away
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let evicted: Vec<_> = {
            let mut routes = lock(&self.routes);
            let evicted = routes
                .values_mut()
                .flat_map(|entry| entry.evict(now, self.config.idle_timeout()))
                .collect();
            routes.retain(|_, entry| !entry.connections.is_empty() || entry.connecting > 0);
            evicted
        };
        let count = evicted.len();
        if count > 0 {
            log::debug!("pool: evicted {} idle or dead connection(s)", count);
        }
        retire(evicted);
        count
    }

    /// Pooled connections for `destination`
    pub fn connections(&self, destination: &Destination) -> usize {
        lock(&self.routes)
            .get(&Route::new(destination, &self.config))
            .map_or(0, |entry| entry.connections.len())
    }

    /// Pooled connections across all routes
    pub fn total_connections(&self) -> usize {
        lock(&self.routes)
            .values()
            .map(|entry| entry.connections.len())
            .sum()
    }

    /// Close every pooled connection
    pub fn close(&self) {
        let all: Vec<_> = lock(&self.routes)
            .drain()
            .flat_map(|(_, entry)| entry.connections)
            .collect();
        for conn in all {
            conn.close();
        }
        self.released.notify();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("routes", &lock(&self.routes).len())
            .field("max_connections_per_route", &self.config.max_connections_per_route())
            .finish()
    }
}
