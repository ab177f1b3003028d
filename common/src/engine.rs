use std::collections::VecDeque;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    config::{ControllerConfig, PersistedSwitches},
    protocol::{CommandResult, FailureReason, InboundMessage, OutboundMessage, RemoteCommand},
    registry::{Switch, SwitchRegistry},
    relay::{ManualInputs, RelayDriver, RelayOutputs},
    reporter::StateReporter,
    sampler::{InputSampler, ManualEdge},
    sequencer::{CommandSequencer, SequenceVerdict},
    session::SessionContext,
    types::{Line, ManualMode, SwitchConfigEntry, SwitchView},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    /// Backend command; answered with a `switch_result`.
    Remote,
    /// Operator command from the device itself; never carries a sequence number.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("command queue full ({capacity} pending), dropped command for {target}")]
pub struct CommandQueueFull {
    pub capacity: usize,
    pub target: String,
}

#[derive(Debug, Clone)]
struct QueuedCommand {
    command: RemoteCommand,
    source: CommandSource,
}

/// Owns the switch table and every relay output. Each method takes the
/// logical clock and returns the messages the runtime should send.
pub struct ReconciliationEngine<O> {
    config: ControllerConfig,
    registry: SwitchRegistry,
    sampler: InputSampler,
    sequencer: CommandSequencer,
    driver: RelayDriver<O>,
    reporter: StateReporter,
    inbox: VecDeque<QueuedCommand>,
    entries: Vec<SwitchConfigEntry>,
    dirty: bool,
}

impl<O: RelayOutputs> ReconciliationEngine<O> {
    pub fn new(mut config: ControllerConfig, outputs: O) -> Self {
        config.sanitize();
        Self {
            registry: SwitchRegistry::new(),
            sampler: InputSampler::new(config.debounce_ms),
            sequencer: CommandSequencer::new(),
            driver: RelayDriver::new(outputs, config.relay_active_low),
            reporter: StateReporter::new(config.announce_interval_ms, config.heartbeat_interval_ms),
            inbox: VecDeque::with_capacity(config.command_queue_capacity),
            entries: Vec::new(),
            dirty: false,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SwitchRegistry {
        &self.registry
    }

    pub fn snapshot(&self) -> Vec<SwitchView> {
        self.registry.snapshot()
    }

    pub fn outputs(&self) -> &O {
        self.driver.outputs()
    }

    pub fn queued_commands(&self) -> usize {
        self.inbox.len()
    }

    pub fn reports_sent(&self) -> u64 {
        self.reporter.reports_sent()
    }

    /// Boot-time rebuild from the persisted configuration. Drives every line.
    pub fn restore(&mut self, persisted: &PersistedSwitches) {
        let rebuild = self
            .registry
            .restore(&persisted.entries, &persisted.states, &self.config);
        self.driver
            .apply(&rebuild.writes, self.config.config_stagger_ms());
        self.entries = persisted.entries.clone();
    }

    /// Reads every manual line once. Maintained switches adopt the wall position.
    pub fn prime_inputs(&mut self, inputs: &mut impl ManualInputs, now_ms: u64) {
        let mut writes = Vec::new();

        for switch in self.registry.switches_mut() {
            let Some(manual_line) = switch.manual_line else {
                continue;
            };
            let raw_high = match inputs.read_level(manual_line) {
                Ok(level) => level,
                Err(err) => {
                    warn!("manual input not primed: {err}");
                    continue;
                }
            };

            self.sampler.prime(switch, raw_high, now_ms);
            if switch.mode == ManualMode::Maintained {
                let active = switch.polarity.is_active(raw_high);
                if active != switch.logical_state {
                    info!(
                        "{}: wall switch on gpio{manual_line} holds {}, adopting it",
                        switch.name,
                        on_off(active)
                    );
                    switch.logical_state = active;
                    writes.push(switch.write());
                }
            }
        }

        if !writes.is_empty() {
            self.driver.apply(&writes, self.config.config_stagger_ms());
            self.dirty = true;
        }
    }

    pub fn handle_inbound(
        &mut self,
        session: &SessionContext,
        message: InboundMessage,
        now_ms: u64,
    ) -> Vec<OutboundMessage> {
        match message {
            InboundMessage::Identified(entries) => self.on_identified(session, entries, now_ms),
            InboundMessage::ConfigUpdate(entries) => self.on_config_update(session, entries, now_ms),
            InboundMessage::SwitchCommand(command) => {
                if let Err(err) = self.enqueue_command(command, CommandSource::Remote) {
                    error!("{err}");
                }
                Vec::new()
            }
        }
    }

    /// Fresh session. `None` keeps the current configuration.
    pub fn on_identified(
        &mut self,
        session: &SessionContext,
        entries: Option<Vec<SwitchConfigEntry>>,
        now_ms: u64,
    ) -> Vec<OutboundMessage> {
        self.sequencer.reset();
        if let Some(entries) = entries {
            self.apply_configuration(entries);
        }
        self.reporter
            .announce(session, &self.registry, true, now_ms)
            .into_iter()
            .collect()
    }

    pub fn on_config_update(
        &mut self,
        session: &SessionContext,
        entries: Vec<SwitchConfigEntry>,
        now_ms: u64,
    ) -> Vec<OutboundMessage> {
        self.sequencer.reset();
        self.apply_configuration(entries);
        self.reporter
            .announce(session, &self.registry, true, now_ms)
            .into_iter()
            .collect()
    }

    pub fn enqueue_command(
        &mut self,
        command: RemoteCommand,
        source: CommandSource,
    ) -> Result<(), CommandQueueFull> {
        if self.inbox.len() >= self.config.command_queue_capacity {
            return Err(CommandQueueFull {
                capacity: self.config.command_queue_capacity,
                target: describe_target(&command),
            });
        }
        self.inbox.push_back(QueuedCommand { command, source });
        Ok(())
    }

    /// One control cycle: re-drive failed lines, sample inputs, drain one
    /// command, flush a deferred announcement, then the heartbeat.
    pub fn run_cycle(
        &mut self,
        session: &SessionContext,
        inputs: &mut impl ManualInputs,
        now_ms: u64,
    ) -> Vec<OutboundMessage> {
        let mut outbound = Vec::new();

        self.redrive_failed_lines();
        self.sample_inputs(session, inputs, now_ms, &mut outbound);
        self.drain_command(session, now_ms, &mut outbound);

        if session.is_connected() {
            outbound.extend(self.reporter.poll(session, &self.registry, now_ms));
            outbound.extend(self.reporter.heartbeat(session, now_ms));
        }

        outbound
    }

    /// Clears and returns the "needs persisting" flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn persisted_switches(&self) -> PersistedSwitches {
        PersistedSwitches {
            entries: self
                .entries
                .iter()
                .filter(|entry| entry.malformed.is_none())
                .cloned()
                .collect(),
            states: self.registry.line_states(),
        }
    }

    fn apply_configuration(&mut self, entries: Vec<SwitchConfigEntry>) {
        let rebuild = self.registry.rebuild(&entries, &self.config);
        self.driver
            .apply(&rebuild.writes, self.config.config_stagger_ms());
        self.entries = entries;
        self.dirty = true;
    }

    fn redrive_failed_lines(&mut self) {
        if !self.driver.has_failed_lines() {
            return;
        }
        let writes = self
            .driver
            .take_failed()
            .into_iter()
            .filter_map(|line| self.registry.get(line).map(Switch::write))
            .collect::<Vec<_>>();
        self.driver.apply(&writes, 0);
    }

    fn sample_inputs(
        &mut self,
        session: &SessionContext,
        inputs: &mut impl ManualInputs,
        now_ms: u64,
        outbound: &mut Vec<OutboundMessage>,
    ) {
        let mut changed = Vec::new();

        for switch in self.registry.switches_mut() {
            let Some(manual_line) = switch.manual_line else {
                continue;
            };
            let raw_high = match inputs.read_level(manual_line) {
                Ok(level) => level,
                Err(err) => {
                    debug!("manual input skipped: {err}");
                    continue;
                }
            };
            let Some(edge) = self.sampler.sample(switch, raw_high, now_ms) else {
                continue;
            };

            switch.logical_state = match edge {
                ManualEdge::Set(on) => on,
                ManualEdge::Toggle => !switch.logical_state,
            };
            info!(
                "{}: manual {} input on gpio{manual_line} -> {}",
                switch.name,
                switch.mode.as_str(),
                on_off(switch.logical_state)
            );
            changed.push(switch.write());
        }

        for write in changed {
            self.driver.apply(&[write], 0);
            self.dirty = true;
            self.announce(session, true, now_ms, outbound);
        }
    }

    fn drain_command(
        &mut self,
        session: &SessionContext,
        now_ms: u64,
        outbound: &mut Vec<OutboundMessage>,
    ) {
        let Some(QueuedCommand { command, source }) = self.inbox.pop_front() else {
            return;
        };

        let Some(line) = self
            .registry
            .resolve_target(command.name.as_deref(), command.gpio)
        else {
            warn!(
                "switch command for {} rejected: {}",
                describe_target(&command),
                FailureReason::UnknownTarget.as_str()
            );
            if source == CommandSource::Remote {
                outbound.push(self.command_result(
                    session,
                    &command,
                    None,
                    Some(FailureReason::UnknownTarget),
                    now_ms,
                ));
            }
            return;
        };

        if let SequenceVerdict::Stale { last_accepted } =
            self.sequencer.accept(line, command.seq, command.state)
        {
            warn!(
                "gpio{line}: command seq {:?} rejected: {}, last accepted {last_accepted}",
                command.seq,
                FailureReason::StaleSeq.as_str()
            );
            outbound.push(self.command_result(
                session,
                &command,
                Some(line),
                Some(FailureReason::StaleSeq),
                now_ms,
            ));
            return;
        }

        if let Some(write) = self.registry.set_state(line, command.state) {
            self.driver.apply(&[write], 0);
            self.dirty = true;
        }

        match source {
            CommandSource::Remote => {
                outbound.push(self.command_result(session, &command, Some(line), None, now_ms));
                self.announce(session, false, now_ms, outbound);
            }
            CommandSource::Local => {
                info!("gpio{line}: local command -> {}", on_off(command.state));
                self.announce(session, true, now_ms, outbound);
            }
        }
    }

    fn announce(
        &mut self,
        session: &SessionContext,
        forced: bool,
        now_ms: u64,
        outbound: &mut Vec<OutboundMessage>,
    ) {
        // Offline changes are resynced by the next identify.
        if session.is_connected() {
            outbound.extend(self.reporter.announce(session, &self.registry, forced, now_ms));
        }
    }

    fn command_result(
        &self,
        session: &SessionContext,
        command: &RemoteCommand,
        line: Option<Line>,
        reason: Option<FailureReason>,
        now_ms: u64,
    ) -> OutboundMessage {
        let switch = line.and_then(|line| self.registry.get(line));
        let gpio = line.or(command.gpio);
        let success = reason.is_none();

        let stamp = command.seq.unwrap_or(now_ms).to_string();
        let line_field = gpio.map(|gpio| gpio.to_string()).unwrap_or_default();
        let sig = session.sign(&[
            session.mac(),
            &stamp,
            &line_field,
            bit(command.state),
            bit(success),
        ]);

        OutboundMessage::SwitchResult(CommandResult {
            mac: session.mac().to_string(),
            gpio,
            name: switch
                .map(|switch| switch.name.clone())
                .or_else(|| command.name.clone()),
            requested_state: command.state,
            actual_state: switch.map(|switch| switch.logical_state),
            success,
            reason,
            seq: command.seq,
            ts: now_ms,
            sig,
        })
    }
}

fn describe_target(command: &RemoteCommand) -> String {
    match (&command.name, command.gpio) {
        (Some(name), Some(gpio)) => format!("`{name}` (gpio{gpio})"),
        (Some(name), None) => format!("`{name}`"),
        (None, Some(gpio)) => format!("gpio{gpio}"),
        (None, None) => "<none>".to_string(),
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

fn bit(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}
