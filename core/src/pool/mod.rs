//! A bounded broker over the unpooled datasource. One mutex guards the pool
//! state; waiters share one condition variable. Callers receive a wrapper
//! whose `close` returns the underlying connection to the pool, and the pool
//! may reclaim an underlying connection from a wrapper whose checkout is
//! overdue, leaving the holder with a dead wrapper whose `close` is a no-op.

mod unpooled;
pub use unpooled::UnpooledDataSource;

use crate::{Error, Result};
use constants::{
    DEFAULT_POOL_BAD_CONNECTION_TOLERANCE, DEFAULT_POOL_MAX_ACTIVE, DEFAULT_POOL_MAX_CHECKOUT_MS,
    DEFAULT_POOL_MAX_IDLE, DEFAULT_POOL_PING_NOT_USED_FOR_MS, DEFAULT_POOL_PING_QUERY,
    DEFAULT_POOL_TIME_TO_WAIT_MS,
};
use driver::{Connection, DataSource, IsolationLevel, PreparedStatement, StatementConfig};
use log::{debug, warn};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_active: usize,
    pub max_idle: usize,
    pub max_checkout_time: Duration,
    pub time_to_wait: Duration,
    pub bad_connection_tolerance: usize,
    pub ping_query: String,
    pub ping_enabled: bool,
    pub ping_not_used_for: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_active: DEFAULT_POOL_MAX_ACTIVE,
            max_idle: DEFAULT_POOL_MAX_IDLE,
            max_checkout_time: Duration::from_millis(DEFAULT_POOL_MAX_CHECKOUT_MS),
            time_to_wait: Duration::from_millis(DEFAULT_POOL_TIME_TO_WAIT_MS),
            bad_connection_tolerance: DEFAULT_POOL_BAD_CONNECTION_TOLERANCE,
            ping_query: DEFAULT_POOL_PING_QUERY.to_string(),
            ping_enabled: false,
            ping_not_used_for: Duration::from_millis(DEFAULT_POOL_PING_NOT_USED_FOR_MS),
        }
    }
}

/// Counter snapshot for diagnostics.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct PoolStatus {
    pub request_count: u64,
    pub wait_count: u64,
    pub bad_connection_count: u64,
    pub claimed_overdue_count: u64,
    pub accumulated_request_time: Duration,
    pub accumulated_wait_time: Duration,
    pub accumulated_checkout_time: Duration,
    pub idle_count: usize,
    pub active_count: usize,
}

struct PooledEntry {
    real: Mutex<Option<Box<dyn Connection>>>,
    valid: AtomicBool,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    checkout_at: Mutex<Instant>,
    type_code: u64,
}

impl PooledEntry {
    fn new(real: Box<dyn Connection>, type_code: u64) -> PooledEntry {
        let now = Instant::now();
        PooledEntry {
            real: Mutex::new(Some(real)),
            valid: AtomicBool::new(true),
            created_at: now,
            last_used_at: Mutex::new(now),
            checkout_at: Mutex::new(now),
            type_code,
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct PoolCounters {
    request_count: u64,
    wait_count: u64,
    bad_connection_count: u64,
    claimed_overdue_count: u64,
    accumulated_request_time: Duration,
    accumulated_wait_time: Duration,
    accumulated_checkout_time: Duration,
}

struct PoolState {
    // reclaimed wrappers, ready to hand out
    idle: VecDeque<Arc<PooledEntry>>,
    // handed-out wrappers, earliest checkout first
    active: VecDeque<Arc<PooledEntry>>,
    counters: PoolCounters,
}

struct PoolInner {
    unpooled: UnpooledDataSource,
    state: Mutex<PoolState>,
    cond: Condvar,
    config: RwLock<PoolConfig>,
    expected_type_code: u64,
}

pub struct PooledDataSource {
    inner: Arc<PoolInner>,
}

fn connection_type_code(url: &str, username: &str, password: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    username.hash(&mut hasher);
    password.hash(&mut hasher);
    hasher.finish()
}

impl PooledDataSource {
    pub fn new(unpooled: UnpooledDataSource, config: PoolConfig) -> PooledDataSource {
        let expected_type_code = connection_type_code(
            unpooled.url(),
            unpooled.username(),
            unpooled.password(),
        );
        PooledDataSource {
            inner: Arc::new(PoolInner {
                unpooled,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: VecDeque::new(),
                    counters: PoolCounters::default(),
                }),
                cond: Condvar::new(),
                config: RwLock::new(config),
                expected_type_code,
            }),
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock().unwrap();
        PoolStatus {
            request_count: state.counters.request_count,
            wait_count: state.counters.wait_count,
            bad_connection_count: state.counters.bad_connection_count,
            claimed_overdue_count: state.counters.claimed_overdue_count,
            accumulated_request_time: state.counters.accumulated_request_time,
            accumulated_wait_time: state.counters.accumulated_wait_time,
            accumulated_checkout_time: state.counters.accumulated_checkout_time,
            idle_count: state.idle.len(),
            active_count: state.active.len(),
        }
    }

    /// Replace the pool parameters. All live connections are force-closed so
    /// the next acquires see a pool built from the new values.
    pub fn reconfigure(&self, config: PoolConfig) {
        *self.inner.config.write().unwrap() = config;
        self.force_close_all();
    }

    pub fn force_close_all(&self) {
        let drained: Vec<Arc<PooledEntry>> = {
            let mut state = self.inner.state.lock().unwrap();
            let mut drained: Vec<Arc<PooledEntry>> = state.active.drain(..).collect();
            drained.extend(state.idle.drain(..));
            drained
        };
        for entry in drained {
            entry.invalidate();
            if let Some(mut real) = entry.real.lock().unwrap().take() {
                if let Ok(false) = real.auto_commit() {
                    let _ = real.rollback();
                }
                let _ = real.close();
            }
        }
        debug!("pool forcefully closed/removed all connections");
    }

    /// The acquire algorithm. Runs under the pool mutex; waiters sleep on
    /// the shared condition up to `time_to_wait` per round.
    pub fn acquire(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        let started = Instant::now();
        let mut local_bad = 0usize;
        loop {
            let config = inner.config.read().unwrap().clone();
            let mut state = inner.state.lock().unwrap();

            let candidate = if let Some(entry) = state.idle.pop_front() {
                debug!("checked out idle connection from pool");
                Some(entry)
            } else if state.active.len() < config.max_active {
                match inner.unpooled.connection() {
                    Ok(real) => {
                        debug!("created new pooled connection");
                        Some(Arc::new(PooledEntry::new(real, inner.expected_type_code)))
                    }
                    Err(e) => {
                        warn!("could not create a new connection: {e}");
                        state.counters.bad_connection_count += 1;
                        local_bad += 1;
                        if local_bad > config.max_idle + config.bad_connection_tolerance {
                            return Err(Error::PoolExhausted(format!(
                                "could not create a connection: {e}"
                            )));
                        }
                        None
                    }
                }
            } else {
                let overdue_age = state
                    .active
                    .front()
                    .map(|e| e.checkout_at.lock().unwrap().elapsed())
                    .unwrap_or_default();
                if overdue_age > config.max_checkout_time {
                    // claim the earliest-checked-out connection from its holder
                    state.counters.claimed_overdue_count += 1;
                    state.counters.accumulated_checkout_time += overdue_age;
                    let overdue = state.active.pop_front().unwrap();
                    let real = overdue.real.lock().unwrap().take();
                    overdue.invalidate();
                    match real {
                        Some(mut real) => {
                            if let Ok(false) = real.auto_commit() {
                                if let Err(e) = real.rollback() {
                                    debug!("bad connection while rolling back overdue claim: {e}");
                                }
                            }
                            debug!("claimed overdue connection");
                            Some(Arc::new(PooledEntry::new(real, overdue.type_code)))
                        }
                        // the holder returned it between our age check and
                        // the take; just go around again
                        None => None,
                    }
                } else {
                    state.counters.wait_count += 1;
                    debug!("waiting as long as {:?} for connection", config.time_to_wait);
                    let wait_started = Instant::now();
                    let (guard, _) = inner
                        .cond
                        .wait_timeout(state, config.time_to_wait)
                        .unwrap();
                    state = guard;
                    state.counters.accumulated_wait_time += wait_started.elapsed();
                    None
                }
            };

            let Some(entry) = candidate else { continue };

            if inner.ping(&entry, &config) && discard_prior_transaction(&entry) {
                *entry.checkout_at.lock().unwrap() = Instant::now();
                *entry.last_used_at.lock().unwrap() = Instant::now();
                state.active.push_back(entry.clone());
                state.counters.request_count += 1;
                state.counters.accumulated_request_time += started.elapsed();
                return Ok(PooledConnection {
                    inner: inner.clone(),
                    entry,
                    returned: false,
                });
            }

            debug!("a bad connection was returned from the pool, getting another");
            state.counters.bad_connection_count += 1;
            local_bad += 1;
            if let Some(mut real) = entry.real.lock().unwrap().take() {
                let _ = real.close();
            }
            if local_bad > config.max_idle + config.bad_connection_tolerance {
                warn!("pool could not get a good connection to the database");
                return Err(Error::PoolExhausted(
                    "could not get a good connection to the database".to_string(),
                ));
            }
        }
    }
}

// Roll back any transaction a previous holder left open. A failure marks the
// connection bad.
fn discard_prior_transaction(entry: &Arc<PooledEntry>) -> bool {
    let mut slot = entry.real.lock().unwrap();
    let Some(real) = slot.as_mut() else {
        return false;
    };
    match real.auto_commit() {
        Ok(true) => true,
        Ok(false) => real.rollback().is_ok(),
        Err(_) => false,
    }
}

impl PoolInner {
    /// A real validity check: closed connections fail immediately; when
    /// pinging is on and the connection has been unused long enough, the
    /// ping query must execute.
    fn ping(&self, entry: &Arc<PooledEntry>, config: &PoolConfig) -> bool {
        let mut slot = entry.real.lock().unwrap();
        let Some(real) = slot.as_mut() else {
            return false;
        };
        if real.is_closed() {
            return false;
        }
        if config.ping_enabled
            && entry.last_used_at.lock().unwrap().elapsed() > config.ping_not_used_for
        {
            debug!("testing connection with '{}'", config.ping_query);
            let outcome = real
                .prepare(&config.ping_query, &StatementConfig::default())
                .and_then(|mut stmt| stmt.execute_query().map(|_| ()));
            if let Err(e) = outcome {
                warn!("execution of ping query '{}' failed: {e}", config.ping_query);
                let _ = real.close();
                return false;
            }
        }
        true
    }

    /// The release algorithm: valid wrappers re-enter the idle list as fresh
    /// wrappers (waking one waiter) or close outright; invalid wrappers only
    /// count as bad.
    fn release(self: &Arc<PoolInner>, entry: &Arc<PooledEntry>) {
        let config = self.config.read().unwrap().clone();
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.active.iter().position(|e| Arc::ptr_eq(e, entry)) {
            state.active.remove(pos);
        }
        if !entry.is_valid() {
            state.counters.bad_connection_count += 1;
            return;
        }
        state.counters.accumulated_checkout_time += entry.checkout_at.lock().unwrap().elapsed();
        let real = entry.real.lock().unwrap().take();
        entry.invalidate();
        let Some(mut real) = real else {
            state.counters.bad_connection_count += 1;
            return;
        };
        if let Ok(false) = real.auto_commit() {
            if let Err(e) = real.rollback() {
                debug!("closing returned connection after failed rollback: {e}");
                let _ = real.close();
                state.counters.bad_connection_count += 1;
                return;
            }
        }
        if state.idle.len() < config.max_idle && entry.type_code == self.expected_type_code {
            let fresh = Arc::new(PooledEntry {
                real: Mutex::new(Some(real)),
                valid: AtomicBool::new(true),
                created_at: entry.created_at,
                last_used_at: Mutex::new(*entry.last_used_at.lock().unwrap()),
                checkout_at: Mutex::new(Instant::now()),
                type_code: entry.type_code,
            });
            state.idle.push_back(fresh);
            debug!("returned connection to pool");
            self.cond.notify_one();
        } else {
            debug!("closed returned connection");
            let _ = real.close();
        }
    }
}

impl DataSource for PooledDataSource {
    fn connection(&self) -> driver::Result<Box<dyn Connection>> {
        match self.acquire() {
            Ok(conn) => Ok(Box::new(conn)),
            Err(Error::PoolExhausted(message)) => Err(driver::Error::PoolExhausted(message)),
            Err(e) => Err(driver::Error::General(e.to_string())),
        }
    }

    fn url(&self) -> &str {
        self.inner.unpooled.url()
    }

    fn username(&self) -> &str {
        self.inner.unpooled.username()
    }

    fn password(&self) -> &str {
        self.inner.unpooled.password()
    }
}

/// The wrapper handed to callers. Every operation proxies to the pooled
/// underlying connection; `close` returns it to the pool instead of the
/// driver. A wrapper invalidated by an overdue claim or a force-close turns
/// every operation into `ConnectionClosed` and its `close` into a no-op.
pub struct PooledConnection {
    inner: Arc<PoolInner>,
    entry: Arc<PooledEntry>,
    returned: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("returned", &self.returned)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn with_real<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn Connection>) -> driver::Result<T>,
    ) -> driver::Result<T> {
        if self.returned || !self.entry.is_valid() {
            return Err(driver::Error::ConnectionClosed);
        }
        let mut slot = self.entry.real.lock().unwrap();
        match slot.as_mut() {
            Some(real) => {
                let result = f(real);
                if result.is_ok() {
                    *self.entry.last_used_at.lock().unwrap() = Instant::now();
                }
                result
            }
            None => Err(driver::Error::ConnectionClosed),
        }
    }
}

impl Connection for PooledConnection {
    fn prepare(
        &mut self,
        sql: &str,
        config: &StatementConfig,
    ) -> driver::Result<Box<dyn PreparedStatement>> {
        self.with_real(|real| real.prepare(sql, config))
    }

    fn auto_commit(&mut self) -> driver::Result<bool> {
        self.with_real(|real| real.auto_commit())
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> driver::Result<()> {
        self.with_real(|real| real.set_auto_commit(auto_commit))
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> driver::Result<()> {
        self.with_real(|real| real.set_isolation(level))
    }

    fn commit(&mut self) -> driver::Result<()> {
        self.with_real(|real| real.commit())
    }

    fn rollback(&mut self) -> driver::Result<()> {
        self.with_real(|real| real.rollback())
    }

    fn is_closed(&self) -> bool {
        self.returned || !self.entry.is_valid()
    }

    fn product_name(&mut self) -> driver::Result<String> {
        self.with_real(|real| real.product_name())
    }

    fn close(&mut self) -> driver::Result<()> {
        if !self.returned {
            self.returned = true;
            self.inner.release(&self.entry);
        }
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let _ = Connection::close(self);
    }
}

#[cfg(test)]
mod unit {
    use super::*;
    use driver::testing;

    fn pool_for(url: &str, config: PoolConfig) -> (testing::Script, PooledDataSource) {
        let script = testing::install(url);
        let unpooled = UnpooledDataSource::new(url, "app", "secret");
        (script, PooledDataSource::new(unpooled, config))
    }

    #[test]
    fn released_connections_are_reused() {
        let (script, pool) = pool_for("mem://pool-reuse", PoolConfig::default());
        let mut first = pool.acquire().unwrap();
        Connection::close(&mut first).unwrap();
        let _second = pool.acquire().unwrap();
        assert_eq!(script.total_connections(), 1);
        let status = pool.status();
        assert_eq!(status.request_count, 2);
        assert_eq!(status.active_count, 1);
    }

    #[test]
    fn overdue_checkout_is_claimed() {
        let config = PoolConfig {
            max_active: 1,
            max_checkout_time: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        let (script, pool) = pool_for("mem://pool-overdue", config);
        let mut holder = pool.acquire().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let claimer = pool.acquire().unwrap();

        // same underlying connection, no second open
        assert_eq!(script.total_connections(), 1);
        assert_eq!(pool.status().claimed_overdue_count, 1);
        // the holder's wrapper is dead: operations fail, close is a no-op
        assert!(holder.is_closed());
        assert!(holder
            .prepare("SELECT 1", &StatementConfig::default())
            .is_err());
        Connection::close(&mut holder).unwrap();
        assert_eq!(pool.status().active_count, 1);
        drop(claimer);
    }

    #[test]
    fn waiter_wakes_when_connection_returns() {
        let config = PoolConfig {
            max_active: 1,
            max_checkout_time: Duration::from_secs(60),
            time_to_wait: Duration::from_millis(40),
            ..PoolConfig::default()
        };
        let (script, pool) = pool_for("mem://pool-wait", config);
        let pool = Arc::new(pool);
        let mut holder = pool.acquire().unwrap();

        let shared = pool.clone();
        let waiter = std::thread::spawn(move || shared.acquire().map(|c| drop(c)));
        std::thread::sleep(Duration::from_millis(20));
        Connection::close(&mut holder).unwrap();
        waiter.join().unwrap().unwrap();

        assert_eq!(script.total_connections(), 1);
        assert!(pool.status().wait_count >= 1);
    }

    #[test]
    fn failing_ping_exhausts_the_pool() {
        let config = PoolConfig {
            max_idle: 0,
            bad_connection_tolerance: 1,
            ping_enabled: true,
            ping_query: "SELECT 1".to_string(),
            ping_not_used_for: Duration::from_millis(0),
            ..PoolConfig::default()
        };
        let (script, pool) = pool_for("mem://pool-badping", config);
        script.when("SELECT 1").fails("server down");
        std::thread::sleep(Duration::from_millis(5));
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));
        assert!(pool.status().bad_connection_count >= 2);
    }

    #[test]
    fn force_close_invalidates_everything() {
        let (script, pool) = pool_for("mem://pool-force", PoolConfig::default());
        let mut held = pool.acquire().unwrap();
        let mut idle = pool.acquire().unwrap();
        Connection::close(&mut idle).unwrap();
        pool.force_close_all();
        assert!(held.is_closed());
        assert_eq!(script.open_connections(), 0);
        // the pool recovers by opening fresh connections
        let _fresh = pool.acquire().unwrap();
        assert_eq!(script.total_connections(), 3);
        Connection::close(&mut held).unwrap();
    }
}
