use crate::{
    protocol::{Heartbeat, OutboundMessage, StateReport},
    registry::SwitchRegistry,
    session::SessionContext,
};

/// Rate-limited full-state announcements plus the periodic heartbeat.
///
/// Forced announcements always go out immediately. Unforced ones are limited
/// to one per `min_interval_ms`; a request inside the interval is remembered
/// and flushed by [`StateReporter::poll`] once the interval has passed.
#[derive(Debug, Clone)]
pub struct StateReporter {
    min_interval_ms: u64,
    heartbeat_interval_ms: u64,
    last_announce_ms: Option<u64>,
    pending: bool,
    last_heartbeat_ms: u64,
    reports: u64,
}

impl StateReporter {
    pub fn new(min_interval_ms: u64, heartbeat_interval_ms: u64) -> Self {
        Self {
            min_interval_ms,
            heartbeat_interval_ms,
            last_announce_ms: None,
            pending: false,
            last_heartbeat_ms: 0,
            reports: 0,
        }
    }

    pub fn reports_sent(&self) -> u64 {
        self.reports
    }

    pub fn announce(
        &mut self,
        session: &SessionContext,
        registry: &SwitchRegistry,
        forced: bool,
        now_ms: u64,
    ) -> Option<OutboundMessage> {
        if !forced && !self.interval_elapsed(now_ms) {
            self.pending = true;
            return None;
        }
        Some(self.emit(session, registry, now_ms))
    }

    /// Flushes a deferred announcement once its interval has elapsed.
    pub fn poll(
        &mut self,
        session: &SessionContext,
        registry: &SwitchRegistry,
        now_ms: u64,
    ) -> Option<OutboundMessage> {
        if self.pending && self.interval_elapsed(now_ms) {
            Some(self.emit(session, registry, now_ms))
        } else {
            None
        }
    }

    pub fn heartbeat(&mut self, session: &SessionContext, now_ms: u64) -> Option<OutboundMessage> {
        if now_ms.saturating_sub(self.last_heartbeat_ms) < self.heartbeat_interval_ms {
            return None;
        }
        self.last_heartbeat_ms = now_ms;
        Some(OutboundMessage::Heartbeat(Heartbeat {
            mac: session.mac().to_string(),
            uptime_ms: now_ms,
        }))
    }

    fn interval_elapsed(&self, now_ms: u64) -> bool {
        match self.last_announce_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.min_interval_ms,
            None => true,
        }
    }

    fn emit(
        &mut self,
        session: &SessionContext,
        registry: &SwitchRegistry,
        now_ms: u64,
    ) -> OutboundMessage {
        self.pending = false;
        self.last_announce_ms = Some(now_ms);
        self.reports += 1;

        let fields = registry
            .line_states()
            .iter()
            .map(|state| format!("{}:{}", state.line, u8::from(state.on)))
            .collect::<Vec<_>>()
            .join(",");
        let ts = now_ms.to_string();

        OutboundMessage::StateUpdate(StateReport {
            mac: session.mac().to_string(),
            switches: registry.snapshot(),
            report: self.reports,
            ts: now_ms,
            sig: session.sign(&[session.mac(), &ts, &fields]),
        })
    }
}
