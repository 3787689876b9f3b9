//! Connection-lifecycle timing for a single request.
//!
//! A [`TraceRecorder`] is installed on a [`Request`](crate::Request) when tracing is
//! enabled. The transport reports phase boundaries into it; once the response body has
//! been read the recorder freezes them into a [`TraceInfo`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::util::lock_unpoisoned;

/// Durations derived from one traced exchange. Phases that never happened are zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceInfo {
    pub dns_lookup: Duration,
    pub conn_time: Duration,
    pub tcp_conn_time: Duration,
    pub tls_handshake: Duration,
    pub server_time: Duration,
    pub response_time: Duration,
    pub total_time: Duration,
    pub is_conn_reused: bool,
    pub is_conn_was_idle: bool,
    pub conn_idle_time: Duration,
    pub remote_addr: Option<SocketAddr>,
}

#[derive(Debug, Default)]
struct Timeline {
    get_conn: Option<Instant>,
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    connect_start: Option<Instant>,
    connect_done: Option<Instant>,
    tls_start: Option<Instant>,
    tls_done: Option<Instant>,
    got_conn: Option<Instant>,
    first_byte: Option<Instant>,
    is_conn_reused: bool,
    is_conn_was_idle: bool,
    conn_idle_time: Duration,
}

fn span(from: Option<Instant>, to: Option<Instant>) -> Duration {
    match (from, to) {
        (Some(from), Some(to)) => to.saturating_duration_since(from),
        _ => Duration::ZERO,
    }
}

impl Timeline {
    fn derive(&self, completed_at: Instant, remote_addr: Option<SocketAddr>) -> TraceInfo {
        let tls_handshake = span(self.tls_start, self.tls_done);
        TraceInfo {
            dns_lookup: span(self.dns_start, self.dns_done),
            conn_time: span(self.get_conn, self.got_conn),
            tcp_conn_time: span(self.connect_start, self.connect_done).saturating_sub(tls_handshake),
            tls_handshake,
            server_time: span(self.got_conn, self.first_byte),
            response_time: span(self.first_byte, Some(completed_at)),
            total_time: span(self.get_conn, Some(completed_at)),
            is_conn_reused: self.is_conn_reused,
            is_conn_was_idle: self.is_conn_was_idle,
            conn_idle_time: self.conn_idle_time,
            remote_addr,
        }
    }
}

#[derive(Debug, Default)]
pub struct TraceRecorder {
    timeline: Mutex<Timeline>,
    info: OnceLock<TraceInfo>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start of a hop: the caller is about to ask the pool for a connection.
    ///
    /// Clears whatever an earlier hop recorded.
    pub fn get_conn(&self) {
        *lock_unpoisoned(&self.timeline) = Timeline {
            get_conn: Some(Instant::now()),
            ..Timeline::default()
        };
    }

    pub fn dns_start(&self) {
        lock_unpoisoned(&self.timeline).dns_start = Some(Instant::now());
    }

    pub fn dns_done(&self) {
        lock_unpoisoned(&self.timeline).dns_done = Some(Instant::now());
    }

    pub fn connect_start(&self) {
        self.connect_start_at(Instant::now());
    }

    /// Without a resolver step (IP literal, proxy), DNS collapses onto the connect start.
    pub(crate) fn connect_start_at(&self, at: Instant) {
        let mut timeline = lock_unpoisoned(&self.timeline);
        if timeline.dns_done.is_none() {
            timeline.dns_done = Some(at);
        }
        if timeline.dns_start.is_none() {
            timeline.dns_start = timeline.dns_done;
        }
        timeline.connect_start = Some(at);
    }

    pub fn connect_done(&self) {
        lock_unpoisoned(&self.timeline).connect_done = Some(Instant::now());
    }

    pub fn tls_start(&self) {
        lock_unpoisoned(&self.timeline).tls_start = Some(Instant::now());
    }

    pub fn tls_done(&self) {
        lock_unpoisoned(&self.timeline).tls_done = Some(Instant::now());
    }

    pub fn got_conn(&self, reused: bool, idle_time: Option<Duration>) {
        let mut timeline = lock_unpoisoned(&self.timeline);
        timeline.got_conn = Some(Instant::now());
        timeline.is_conn_reused = reused;
        timeline.is_conn_was_idle = idle_time.is_some();
        timeline.conn_idle_time = idle_time.unwrap_or_default();
    }

    /// Only the first call per hop counts.
    pub fn first_byte(&self) {
        let mut timeline = lock_unpoisoned(&self.timeline);
        if timeline.first_byte.is_none() {
            timeline.first_byte = Some(Instant::now());
        }
    }

    pub(crate) fn tcp_connected(&self, started_at: Instant, tls: bool) {
        let connect_started = lock_unpoisoned(&self.timeline).connect_start.is_some();
        if !connect_started {
            self.connect_start_at(started_at);
        }
        if tls {
            self.tls_start();
        }
    }

    pub(crate) fn connection_ready(&self, tls: bool) {
        let now = Instant::now();
        let mut timeline = lock_unpoisoned(&self.timeline);
        timeline.connect_done = Some(now);
        if tls {
            timeline.tls_done = Some(now);
        }
    }

    /// Called once the response head is in.
    ///
    /// When the transport did not report `got_conn` itself: a connection dialed during
    /// this hop counts as new, anything else came out of the pool.
    pub(crate) fn response_head_received(&self) {
        let now = Instant::now();
        let mut timeline = lock_unpoisoned(&self.timeline);
        if timeline.got_conn.is_none() {
            match timeline.connect_done {
                Some(connect_done) => {
                    timeline.got_conn = Some(connect_done);
                    timeline.is_conn_reused = false;
                }
                None => {
                    timeline.got_conn = timeline.get_conn.or(Some(now));
                    timeline.is_conn_reused = true;
                }
            }
        }
        if timeline.first_byte.is_none() {
            timeline.first_byte = Some(now);
        }
    }

    /// Freezes the timeline. Later calls keep the first result.
    pub fn finish(&self, remote_addr: Option<SocketAddr>) -> TraceInfo {
        *self.info.get_or_init(|| {
            lock_unpoisoned(&self.timeline).derive(Instant::now(), remote_addr)
        })
    }

    pub fn info(&self) -> Option<TraceInfo> {
        self.info.get().copied()
    }
}

tokio::task_local! {
    static ACTIVE_RECORDER: Arc<TraceRecorder>;
}

/// Recorder of the exchange currently running on this task, if it is traced.
pub(crate) fn active_recorder() -> Option<Arc<TraceRecorder>> {
    ACTIVE_RECORDER.try_with(Arc::clone).ok()
}

pub(crate) async fn scoped<F: Future>(recorder: Option<Arc<TraceRecorder>>, future: F) -> F::Output {
    match recorder {
        Some(recorder) => ACTIVE_RECORDER.scope(recorder, future).await,
        None => future.await,
    }
}
