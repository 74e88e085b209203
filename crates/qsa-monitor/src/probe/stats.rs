//! Per-request statistics gathered inside the worker.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::bridge::protocol::StatsReport;

/// Source of wall-clock time for request timing.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(by, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .unwrap_or_default()
    }
}

/// What the worker is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub project: Option<String>,
    /// OGC service, e.g. `WMS`.
    pub service: String,
    /// Operation within the service, e.g. `GetMap`.
    pub request: String,
}

impl RequestInfo {
    pub fn new(service: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            project: None,
            service: service.into(),
            request: request.into(),
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }
}

/// Instrumentation points the worker's dispatcher calls around each request.
///
/// `request_finished` must run whatever the outcome; [`RequestGuard`] takes
/// care of that.
pub trait RequestHook: Send + Sync {
    /// Returns a ticket identifying this request.
    fn request_started(&self, info: RequestInfo) -> u64;

    fn request_finished(&self, ticket: u64);
}

/// Calls `request_finished` when dropped.
#[must_use = "the request is reported finished as soon as the guard is dropped"]
pub struct RequestGuard {
    hook: Arc<dyn RequestHook>,
    ticket: u64,
}

impl RequestGuard {
    pub fn new(hook: Arc<dyn RequestHook>, info: RequestInfo) -> Self {
        let ticket = hook.request_started(info);
        Self { hook, ticket }
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.hook.request_finished(self.ticket);
    }
}

struct InFlight {
    ticket: u64,
    info: RequestInfo,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct StatsState {
    count: u64,
    in_flight: Option<InFlight>,
}

pub struct StatsAccumulator {
    state: StdMutex<StatsState>,
    clock: Arc<dyn Clock>,
}

impl StatsAccumulator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: StdMutex::new(StatsState::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatsState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start tracking a request; it ends when the guard drops.
    pub fn track(self: &Arc<Self>, info: RequestInfo) -> RequestGuard {
        RequestGuard::new(Arc::clone(self) as Arc<dyn RequestHook>, info)
    }

    pub fn count(&self) -> u64 {
        self.lock().count
    }

    pub fn report(&self) -> StatsReport {
        let state = self.lock();
        let mut report = StatsReport {
            count: state.count,
            ..Default::default()
        };

        if let Some(in_flight) = &state.in_flight {
            let elapsed = self.clock.now() - in_flight.started_at;
            report.service = Some(in_flight.info.service.clone());
            report.request = Some(in_flight.info.request.clone());
            report.project = in_flight.info.project.clone();
            report.duration = Some(elapsed.num_milliseconds().max(0) as u64);
        }
        report
    }
}

impl Default for StatsAccumulator {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl RequestHook for StatsAccumulator {
    fn request_started(&self, info: RequestInfo) -> u64 {
        let started_at = self.clock.now();
        let mut state = self.lock();
        state.count += 1;
        let ticket = state.count;
        tracing::trace!(ticket, service = %info.service, request = %info.request, "Request started");
        state.in_flight = Some(InFlight {
            ticket,
            info,
            started_at,
        });
        ticket
    }

    fn request_finished(&self, ticket: u64) {
        let mut state = self.lock();
        // A newer request may already own the slot.
        if state.in_flight.as_ref().is_some_and(|f| f.ticket == ticket) {
            state.in_flight = None;
        }
    }
}
