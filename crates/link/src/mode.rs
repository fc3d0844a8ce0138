//! Mode controller: the one owner of the active communication mode.
//!
//! The controller is a synchronous state machine. It never touches a radio;
//! every entry point returns the [`ModeCommand`]s the facade must execute
//! (activate channels, run handshakes, purge sessions, persist cooldowns),
//! and results come back through [`ModeController::on_authenticated`],
//! [`ModeController::on_auth_failed`] and [`ModeController::on_delivery`].
//!
//! # Transitions
//!
//! ```text
//! Steady --sustained recommendation--> Pending
//! Pending --time-to-switch <= lead--> Authenticating
//! Authenticating --all channels keyed--> Ready
//! Authenticating --failure / timeout--> Steady (cancelled)
//! Ready --time-to-switch <= overlap--> Overlap
//! Overlap --stabilization window clean--> Steady (committed)
//! Overlap --delivery failure on new channels--> Steady (rolled back, target cooled down)
//! ```
//!
//! A threat at or above the configured severity on a channel of the active
//! mode skips the forecast stages: the most secure viable mode without that
//! channel is authenticated at once and overlapped as soon as it is keyed.
//! `EMERGENCY` is entered directly from any state.

use crate::context::FlightSnapshot;
use crate::error::LinkError;
use crate::forecast::{LinkOutlook, Recommendation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use swarmlink_core::{
    event_types, ChannelKind, ConfigHandle, EventBuilder, EventBus, EventCategory, EventSeverity,
    LinkConfig, Mode, Timestamp,
};
use swarmlink_threat::ThreatEvent;
use tokio::sync::watch;

const SOURCE: &str = "mode-controller";

/// Where the controller is in a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPhase {
    /// No transition
    Steady,
    /// Target chosen, waiting for the pre-transition lead
    Pending,
    /// Target channels are being keyed
    Authenticating,
    /// Target channels keyed, waiting for the overlap point
    Ready,
    /// Old and new channels both active
    Overlap,
}

/// Read-only snapshot of the authoritative mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeState {
    /// Committed mode
    pub mode: Mode,
    /// Transition phase
    pub phase: TransitionPhase,
    /// Mode being transitioned to
    pub pending_target: Option<Mode>,
    /// When the current transition was initiated
    pub transition_started_at: Option<Timestamp>,
    /// When the overlap ends and the transition commits
    pub overlap_deadline: Option<Timestamp>,
    /// The transition was forced by a threat
    pub forced: bool,
    /// Channels under threat lockout; they carry no traffic
    pub suspended_channels: Vec<ChannelKind>,
}

impl ModeState {
    /// Whether a transition is in flight.
    pub fn is_transitioning(&self) -> bool {
        self.phase != TransitionPhase::Steady
    }

    /// `(from, to)` while a forced transition has not yet reached overlap.
    ///
    /// The active mode's channel is compromised and the target is not yet
    /// keyed, so there is nothing safe to send on.
    pub fn blocked_transition(&self) -> Option<(Mode, Mode)> {
        match (self.forced, self.phase, self.pending_target) {
            (true, TransitionPhase::Pending | TransitionPhase::Authenticating | TransitionPhase::Ready, Some(to)) => {
                Some((self.mode, to))
            }
            _ => None,
        }
    }

    /// Target mode while overlapping.
    pub fn overlap_target(&self) -> Option<Mode> {
        match self.phase {
            TransitionPhase::Overlap => self.pending_target,
            _ => None,
        }
    }

    /// Whether `channel` is suspended.
    pub fn is_suspended(&self, channel: ChannelKind) -> bool {
        self.suspended_channels.contains(&channel)
    }
}

/// Side effect requested by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeCommand {
    /// Run key exchange on each channel and report back with `attempt`
    Authenticate {
        /// Correlates results with this request
        attempt: u64,
        /// Channels to key
        channels: Vec<ChannelKind>,
        /// Results arriving after this are treated as failures
        deadline: Timestamp,
    },
    /// Power up channels
    Activate(Vec<ChannelKind>),
    /// Power down channels
    Deactivate(Vec<ChannelKind>),
    /// Zeroize and drop the session keys of channels
    Purge(Vec<ChannelKind>),
    /// Begin beacon broadcast
    StartBeacon,
    /// End beacon broadcast
    StopBeacon,
    /// Persist a cooldown so it survives restart
    PersistCooldown {
        /// `mode:<MODE>` or `channel:<channel>`
        key: String,
        /// Expiry time
        until: Timestamp,
    },
}

/// Persistence key for a mode cooldown.
pub fn mode_cooldown_key(mode: Mode) -> String {
    format!("mode:{}", mode.as_str())
}

/// Persistence key for a channel lockout.
pub fn channel_lockout_key(channel: ChannelKind) -> String {
    format!("channel:{}", channel.as_str())
}

#[derive(Debug, Clone)]
struct AuthRound {
    attempt: u64,
    awaiting: BTreeSet<ChannelKind>,
    deadline: Timestamp,
}

#[derive(Debug, Clone)]
struct Transition {
    from: Mode,
    target: Mode,
    started_at: Timestamp,
    forced: bool,
    phase: TransitionPhase,
    auth: Option<AuthRound>,
    overlap_deadline: Option<Timestamp>,
}

impl Transition {
    fn new_channels(&self) -> Vec<ChannelKind> {
        self.target
            .channels()
            .iter()
            .copied()
            .filter(|c| !self.from.uses_channel(*c))
            .collect()
    }

    fn old_channels(&self) -> Vec<ChannelKind> {
        self.from
            .channels()
            .iter()
            .copied()
            .filter(|c| !self.target.uses_channel(*c))
            .collect()
    }
}

/// Channels of `mode` that carry a session key.
fn keyed_channels(mode: Mode) -> Vec<ChannelKind> {
    mode.channels()
        .iter()
        .copied()
        .filter(|c| *c != ChannelKind::EmergencyRadio)
        .collect()
}

fn push_channels(commands: &mut Vec<ModeCommand>, make: fn(Vec<ChannelKind>) -> ModeCommand, channels: Vec<ChannelKind>) {
    if !channels.is_empty() {
        commands.push(make(channels));
    }
}

/// The mode state machine.
pub struct ModeController {
    mode: Mode,
    transition: Option<Transition>,
    candidate: Option<(Mode, Timestamp)>,
    mode_cooldowns: HashMap<Mode, Timestamp>,
    channel_lockouts: HashMap<ChannelKind, Timestamp>,
    blackout_since: Option<Timestamp>,
    restore: Option<AuthRound>,
    restore_needed: bool,
    last_outlook: Option<LinkOutlook>,
    next_attempt: u64,
    last_now: Timestamp,
    config: ConfigHandle,
    events: EventBus,
    state_tx: watch::Sender<ModeState>,
}

impl ModeController {
    /// Controller starting in `initial`.
    pub fn new(initial: Mode, config: ConfigHandle, events: EventBus) -> Self {
        let (state_tx, _) = watch::channel(ModeState {
            mode: initial,
            phase: TransitionPhase::Steady,
            pending_target: None,
            transition_started_at: None,
            overlap_deadline: None,
            forced: false,
            suspended_channels: Vec::new(),
        });
        Self {
            mode: initial,
            transition: None,
            candidate: None,
            mode_cooldowns: HashMap::new(),
            channel_lockouts: HashMap::new(),
            blackout_since: None,
            restore: None,
            restore_needed: false,
            last_outlook: None,
            next_attempt: 0,
            last_now: 0,
            config,
            events,
            state_tx,
        }
    }

    /// Reload persisted cooldowns; expired and unknown keys are ignored.
    pub fn restore_cooldowns(&mut self, records: Vec<(String, Timestamp)>, now: Timestamp) {
        for (key, until) in records {
            if until <= now {
                continue;
            }
            if let Some(mode) = key.strip_prefix("mode:").and_then(Mode::from_key) {
                self.mode_cooldowns.insert(mode, until);
            } else if let Some(channel) = key
                .strip_prefix("channel:")
                .and_then(|name| ChannelKind::ALL.into_iter().find(|c| c.as_str() == name))
            {
                self.channel_lockouts.insert(channel, until);
            } else {
                tracing::debug!(key = %key, "Ignoring unknown cooldown record");
            }
        }
        self.last_now = now;
        self.publish_state();
    }

    /// Commands that bring up the initial mode.
    pub fn start(&mut self, now: Timestamp) -> Vec<ModeCommand> {
        let mut commands = vec![ModeCommand::Activate(self.mode.channels().to_vec())];
        if self.mode == Mode::Emergency {
            commands.push(ModeCommand::StartBeacon);
        } else {
            self.request_restore(now, &mut commands);
        }
        tracing::info!(mode = %self.mode, "Mode controller started");
        self.last_now = now;
        self.publish_state();
        commands
    }

    /// Watch the mode state.
    pub fn subscribe(&self) -> watch::Receiver<ModeState> {
        self.state_tx.subscribe()
    }

    /// Committed mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current state.
    pub fn snapshot(&self) -> ModeState {
        let transition = self.transition.as_ref();
        let mut suspended_channels: Vec<ChannelKind> = self
            .channel_lockouts
            .iter()
            .filter(|(_, until)| **until > self.last_now)
            .map(|(c, _)| *c)
            .collect();
        suspended_channels.sort();
        ModeState {
            mode: self.mode,
            phase: transition.map_or(TransitionPhase::Steady, |t| t.phase),
            pending_target: transition.map(|t| t.target),
            transition_started_at: transition.map(|t| t.started_at),
            overlap_deadline: transition.and_then(|t| t.overlap_deadline),
            forced: transition.is_some_and(|t| t.forced),
            suspended_channels,
        }
    }

    /// Whether `mode` is under a rollback cooldown or threat lockout.
    pub fn is_excluded(&self, mode: Mode, now: Timestamp) -> bool {
        self.mode_cooldowns.get(&mode).is_some_and(|until| *until > now)
    }

    /// One forecast cycle.
    pub fn evaluate(&mut self, now: Timestamp, outlook: &LinkOutlook, flight: &FlightSnapshot) -> Vec<ModeCommand> {
        let config = self.config.snapshot();
        let mut commands = Vec::new();
        self.last_now = now;
        self.mode_cooldowns.retain(|_, until| *until > now);
        self.channel_lockouts.retain(|_, until| *until > now);
        self.last_outlook = Some(outlook.clone());

        if self.mode == Mode::Emergency {
            self.blackout_since = None;
            if Self::policy_demands_emergency(flight, &config).is_some() {
                self.publish_state();
                return commands;
            }
        } else if let Some(reason) = self.emergency_reason(now, outlook, flight, &config) {
            self.enter_emergency(now, &reason, &mut commands);
            self.publish_state();
            return commands;
        }

        self.check_deadlines(now, &mut commands);
        if self.restore_needed && self.restore.is_none() && self.transition.is_none() {
            self.request_restore(now, &mut commands);
        }

        let rec = outlook.recommend(self.mode, |m| self.is_excluded(m, now));
        match self.transition.as_ref().map(|t| t.phase) {
            None => self.consider(now, rec, &config, &mut commands),
            Some(TransitionPhase::Pending) => self.advance_pending(now, rec, &config, &mut commands),
            Some(TransitionPhase::Authenticating | TransitionPhase::Ready) => {
                self.advance_prepared(now, rec, &config, &mut commands)
            }
            Some(TransitionPhase::Overlap) => self.advance_overlap(now, &mut commands),
            Some(TransitionPhase::Steady) => {}
        }

        self.publish_state();
        commands
    }

    /// React to a threat. Threats below the force-switch severity, and
    /// relay or path threats, leave the mode alone.
    pub fn on_threat(&mut self, event: &ThreatEvent, now: Timestamp) -> Vec<ModeCommand> {
        let config = self.config.snapshot();
        let mut commands = Vec::new();
        self.last_now = now;
        let Some(channel) = event.affected.channel() else {
            return commands;
        };
        if event.severity < config.force_switch_severity {
            tracing::debug!(
                kind = %event.kind,
                severity = %event.severity,
                channel = %channel,
                "Threat below force-switch severity"
            );
            return commands;
        }

        let until = now + config.threat_lockout_s * 1_000;
        self.lock_out(channel, until, &mut commands);

        if self
            .transition
            .as_ref()
            .is_some_and(|t| t.target.uses_channel(channel))
        {
            let reason = format!("{} on {}", event.kind, event.affected);
            self.cancel(now, &reason, &mut commands);
        }

        if self.mode == Mode::Emergency || !self.mode.uses_channel(channel) {
            self.publish_state();
            return commands;
        }

        let reason = format!("{} {} on {}", event.severity, event.kind, event.affected);
        if let Some(transition) = self.transition.as_mut() {
            transition.forced = true;
            let (target, phase) = (transition.target, transition.phase);
            match phase {
                TransitionPhase::Pending => self.start_auth(now, &config, &mut commands),
                TransitionPhase::Ready => self.start_overlap(now, &config, &mut commands),
                _ => {}
            }
            self.publish_forced(now, target, &reason);
        } else {
            let target = self.last_outlook.as_ref().and_then(|outlook| {
                outlook.most_secure_avoiding(channel, |m| self.is_excluded(m, now))
            });
            match target {
                Some(target) => {
                    self.begin(now, target, true);
                    self.publish_forced(now, target, &reason);
                    self.start_auth(now, &config, &mut commands);
                }
                None => self.enter_emergency(now, &format!("no safe mode after {reason}"), &mut commands),
            }
        }

        self.publish_state();
        commands
    }

    /// A channel of authentication round `attempt` was keyed.
    pub fn on_authenticated(&mut self, attempt: u64, channel: ChannelKind, now: Timestamp) -> Vec<ModeCommand> {
        let config = self.config.snapshot();
        let mut commands = Vec::new();
        self.last_now = now;

        if let Some(transition) = self.transition.as_mut() {
            if let Some(round) = transition.auth.as_mut().filter(|r| r.attempt == attempt) {
                round.awaiting.remove(&channel);
                if round.awaiting.is_empty() {
                    transition.auth = None;
                    transition.phase = TransitionPhase::Ready;
                    tracing::info!(target_mode = %transition.target, "Target mode authenticated");
                    if transition.forced {
                        self.start_overlap(now, &config, &mut commands);
                    }
                }
                self.publish_state();
                return commands;
            }
        }

        if let Some(round) = self.restore.as_mut().filter(|r| r.attempt == attempt) {
            round.awaiting.remove(&channel);
            if round.awaiting.is_empty() {
                self.restore = None;
                self.restore_needed = false;
                tracing::info!(mode = %self.mode, "Mode credentials established");
            }
        } else {
            tracing::debug!(attempt, channel = %channel, "Ignoring stale authentication result");
        }
        self.publish_state();
        commands
    }

    /// A channel of authentication round `attempt` failed to key.
    pub fn on_auth_failed(&mut self, attempt: u64, channel: ChannelKind, reason: &str, now: Timestamp) -> Vec<ModeCommand> {
        let mut commands = Vec::new();
        self.last_now = now;
        let error = LinkError::AuthenticationFailed {
            channel,
            reason: reason.to_string(),
        };

        let matches_transition = self
            .transition
            .as_ref()
            .and_then(|t| t.auth.as_ref())
            .is_some_and(|r| r.attempt == attempt);
        if matches_transition {
            self.cancel(now, &error.to_string(), &mut commands);
        } else if self.restore.as_ref().is_some_and(|r| r.attempt == attempt) {
            self.restore = None;
            self.restore_needed = true;
            tracing::warn!(mode = %self.mode, error = %error, "Could not re-establish mode credentials");
            self.events.publish(
                EventBuilder::new(event_types::TRANSITION_CANCELLED, SOURCE)
                    .severity(EventSeverity::Error)
                    .category(EventCategory::Mode)
                    .subject(self.mode.as_str())
                    .at(now)
                    .message(format!("Credential restore for {} failed: {error}", self.mode))
                    .build(),
            );
        } else {
            tracing::debug!(attempt, channel = %channel, "Ignoring stale authentication failure");
        }
        self.publish_state();
        commands
    }

    /// Delivery outcome for a frame sent on `channel`.
    ///
    /// A failure on a channel introduced by the overlapping target rolls the
    /// transition back.
    pub fn on_delivery(&mut self, channel: ChannelKind, delivered: bool, now: Timestamp) -> Vec<ModeCommand> {
        let mut commands = Vec::new();
        self.last_now = now;
        let in_overlap_on_new = self.transition.as_ref().is_some_and(|t| {
            t.phase == TransitionPhase::Overlap && t.new_channels().contains(&channel)
        });
        if !delivered && in_overlap_on_new {
            self.rollback(now, &format!("delivery failed on {channel}"), &mut commands);
            self.publish_state();
        }
        commands
    }

    fn policy_demands_emergency(flight: &FlightSnapshot, config: &LinkConfig) -> Option<String> {
        if flight.emergency_demanded {
            return Some("mission policy demands EMERGENCY".to_string());
        }
        if flight.battery_pct <= config.emergency_battery_pct {
            return Some(format!("battery at {:.1}%", flight.battery_pct));
        }
        None
    }

    fn emergency_reason(
        &mut self,
        now: Timestamp,
        outlook: &LinkOutlook,
        flight: &FlightSnapshot,
        config: &LinkConfig,
    ) -> Option<String> {
        if let Some(reason) = Self::policy_demands_emergency(flight, config) {
            return Some(reason);
        }
        let viable = outlook
            .modes
            .iter()
            .any(|o| o.viable_now && !self.is_excluded(o.mode, now));
        if viable {
            self.blackout_since = None;
            return None;
        }
        let since = *self.blackout_since.get_or_insert(now);
        let elapsed_ms = now.saturating_sub(since);
        if elapsed_ms >= config.blackout_to_emergency_s * 1_000 {
            Some(format!("no viable mode for {}s", elapsed_ms / 1_000))
        } else {
            None
        }
    }

    fn check_deadlines(&mut self, now: Timestamp, commands: &mut Vec<ModeCommand>) {
        let transition_timed_out = self
            .transition
            .as_ref()
            .and_then(|t| t.auth.as_ref())
            .is_some_and(|r| now >= r.deadline);
        if transition_timed_out {
            self.cancel(now, "authentication timed out", commands);
        }
        if self.restore.as_ref().is_some_and(|r| now >= r.deadline) {
            tracing::warn!(mode = %self.mode, "Credential restore timed out");
            self.restore = None;
            self.restore_needed = true;
        }
    }

    fn consider(&mut self, now: Timestamp, rec: Option<Recommendation>, config: &LinkConfig, commands: &mut Vec<ModeCommand>) {
        let locked_out = self.is_excluded(self.mode, now);
        let Some(rec) = rec.filter(|r| r.target != self.mode) else {
            self.candidate = None;
            if rec.is_none() && locked_out {
                self.enter_emergency(now, &format!("{} locked out and no alternative", self.mode), commands);
            }
            return;
        };

        let since = match self.candidate {
            Some((target, since)) if target == rec.target => since,
            _ => {
                self.candidate = Some((rec.target, now));
                now
            }
        };
        if !locked_out && now.saturating_sub(since) < config.sustain_window_s * 1_000 {
            return;
        }

        self.candidate = None;
        self.begin(now, rec.target, false);
        tracing::info!(
            from = %self.mode,
            to = %rec.target,
            time_to_switch_s = ?rec.time_to_switch_s,
            "Transition pending"
        );
        self.events.publish(
            EventBuilder::new(event_types::TRANSITION_PENDING, SOURCE)
                .severity(EventSeverity::Info)
                .category(EventCategory::Mode)
                .subject(rec.target.as_str())
                .at(now)
                .message(format!("Pending transition {} -> {}", self.mode, rec.target))
                .metadata("time_to_switch_s", rec.time_to_switch_s.unwrap_or(0))
                .build(),
        );
        self.advance_pending(now, Some(rec), config, commands);
    }

    fn advance_pending(&mut self, now: Timestamp, rec: Option<Recommendation>, config: &LinkConfig, commands: &mut Vec<ModeCommand>) {
        let Some(transition) = self.transition.as_ref() else {
            return;
        };
        let time_to_switch = match rec {
            Some(r) if r.target == transition.target => r.time_to_switch_s.unwrap_or(0),
            _ if transition.forced => 0,
            _ => {
                self.cancel(now, "forecast no longer recommends target", commands);
                return;
            }
        };
        if transition.forced || time_to_switch <= config.pretransition_lead_s {
            self.start_auth(now, config, commands);
            if self.transition.as_ref().is_some_and(|t| t.phase == TransitionPhase::Ready) {
                self.advance_prepared(now, rec, config, commands);
            }
        }
    }

    fn advance_prepared(&mut self, now: Timestamp, rec: Option<Recommendation>, config: &LinkConfig, commands: &mut Vec<ModeCommand>) {
        let Some(transition) = self.transition.as_ref() else {
            return;
        };
        let time_to_switch = match rec {
            _ if transition.forced => 0,
            Some(r) if r.target == transition.target => r.time_to_switch_s.unwrap_or(0),
            _ => {
                self.cancel(now, "forecast no longer recommends target", commands);
                return;
            }
        };
        if transition.phase == TransitionPhase::Ready && time_to_switch <= config.overlap_window_s {
            self.start_overlap(now, config, commands);
        }
    }

    fn advance_overlap(&mut self, now: Timestamp, commands: &mut Vec<ModeCommand>) {
        let due = self
            .transition
            .as_ref()
            .and_then(|t| t.overlap_deadline)
            .is_some_and(|deadline| now >= deadline);
        if due {
            self.commit(now, commands);
        }
    }

    fn begin(&mut self, now: Timestamp, target: Mode, forced: bool) {
        self.transition = Some(Transition {
            from: self.mode,
            target,
            started_at: now,
            forced,
            phase: TransitionPhase::Pending,
            auth: None,
            overlap_deadline: None,
        });
    }

    fn start_auth(&mut self, now: Timestamp, config: &LinkConfig, commands: &mut Vec<ModeCommand>) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let Some(transition) = self.transition.as_mut() else {
            return;
        };
        let channels: Vec<ChannelKind> = transition
            .new_channels()
            .into_iter()
            .filter(|c| *c != ChannelKind::EmergencyRadio)
            .collect();
        if channels.is_empty() {
            transition.phase = TransitionPhase::Ready;
            return;
        }
        let deadline = now + config.auth_timeout_ms;
        transition.phase = TransitionPhase::Authenticating;
        transition.auth = Some(AuthRound {
            attempt,
            awaiting: channels.iter().copied().collect(),
            deadline,
        });
        tracing::info!(target_mode = %transition.target, attempt, channels = ?channels, "Authenticating target mode");
        commands.push(ModeCommand::Authenticate {
            attempt,
            channels,
            deadline,
        });
    }

    fn start_overlap(&mut self, now: Timestamp, config: &LinkConfig, commands: &mut Vec<ModeCommand>) {
        let Some(transition) = self.transition.as_mut() else {
            return;
        };
        transition.phase = TransitionPhase::Overlap;
        let deadline = now + config.stabilization_window_s * 1_000;
        transition.overlap_deadline = Some(deadline);
        push_channels(commands, ModeCommand::Activate, transition.new_channels());
        tracing::info!(from = %transition.from, to = %transition.target, overlap_deadline = deadline, "Overlap started");
        self.events.publish(
            EventBuilder::new(event_types::OVERLAP_STARTED, SOURCE)
                .severity(EventSeverity::Info)
                .category(EventCategory::Mode)
                .subject(transition.target.as_str())
                .at(now)
                .message(format!("Overlapping {} and {}", transition.from, transition.target))
                .metadata("overlap_deadline", deadline)
                .build(),
        );
    }

    fn commit(&mut self, now: Timestamp, commands: &mut Vec<ModeCommand>) {
        let Some(transition) = self.transition.take() else {
            return;
        };
        let retired = transition.old_channels();
        push_channels(commands, ModeCommand::Deactivate, retired.clone());
        push_channels(
            commands,
            ModeCommand::Purge,
            retired.into_iter().filter(|c| *c != ChannelKind::EmergencyRadio).collect(),
        );
        if transition.from == Mode::Emergency {
            commands.push(ModeCommand::StopBeacon);
        }
        self.mode = transition.target;
        self.restore = None;
        self.restore_needed = false;
        tracing::info!(from = %transition.from, to = %transition.target, forced = transition.forced, "Transition committed");
        self.events.publish(
            EventBuilder::new(event_types::TRANSITION_COMMITTED, SOURCE)
                .severity(EventSeverity::Info)
                .category(EventCategory::Mode)
                .subject(transition.target.as_str())
                .at(now)
                .message(format!("Committed {} -> {}", transition.from, transition.target))
                .metadata("forced", transition.forced)
                .metadata("duration_ms", now.saturating_sub(transition.started_at))
                .build(),
        );
    }

    fn cancel(&mut self, now: Timestamp, reason: &str, commands: &mut Vec<ModeCommand>) {
        let Some(transition) = self.transition.take() else {
            return;
        };
        let introduced = transition.new_channels();
        if transition.phase == TransitionPhase::Overlap {
            push_channels(commands, ModeCommand::Deactivate, introduced.clone());
        }
        push_channels(
            commands,
            ModeCommand::Purge,
            introduced.into_iter().filter(|c| *c != ChannelKind::EmergencyRadio).collect(),
        );
        tracing::warn!(from = %transition.from, to = %transition.target, reason, "Transition cancelled");
        self.events.publish(
            EventBuilder::new(event_types::TRANSITION_CANCELLED, SOURCE)
                .severity(EventSeverity::Warning)
                .category(EventCategory::Mode)
                .subject(transition.target.as_str())
                .at(now)
                .message(format!("Cancelled {} -> {}: {reason}", transition.from, transition.target))
                .build(),
        );
    }

    fn rollback(&mut self, now: Timestamp, reason: &str, commands: &mut Vec<ModeCommand>) {
        let Some(transition) = self.transition.take() else {
            return;
        };
        let config = self.config.snapshot();
        let introduced = transition.new_channels();
        push_channels(commands, ModeCommand::Deactivate, introduced.clone());
        push_channels(commands, ModeCommand::Purge, introduced);

        let until = now + config.rollback_cooldown_s * 1_000;
        self.cool_down(transition.target, until, commands);

        let error = LinkError::StabilizationFailed {
            target: transition.target,
            reason: reason.to_string(),
        };
        tracing::warn!(from = %transition.from, to = %transition.target, error = %error, "Transition rolled back");
        self.events.publish(
            EventBuilder::new(event_types::TRANSITION_ROLLED_BACK, SOURCE)
                .severity(EventSeverity::Error)
                .category(EventCategory::Mode)
                .subject(transition.target.as_str())
                .at(now)
                .message(error.to_string())
                .metadata("cooldown_until", until)
                .build(),
        );

        if self.is_excluded(self.mode, now) {
            self.enter_emergency(now, &format!("{} locked out after rollback", self.mode), commands);
        } else {
            self.request_restore(now, commands);
        }
    }

    fn enter_emergency(&mut self, now: Timestamp, reason: &str, commands: &mut Vec<ModeCommand>) {
        let mut retired: BTreeSet<ChannelKind> = self.mode.channels().iter().copied().collect();
        if let Some(transition) = self.transition.take() {
            retired.extend(transition.target.channels().iter().copied());
        }
        retired.remove(&ChannelKind::EmergencyRadio);
        let retired: Vec<ChannelKind> = retired.into_iter().collect();

        commands.push(ModeCommand::Activate(vec![ChannelKind::EmergencyRadio]));
        push_channels(commands, ModeCommand::Deactivate, retired.clone());
        push_channels(commands, ModeCommand::Purge, retired);
        if self.mode != Mode::Emergency {
            commands.push(ModeCommand::StartBeacon);
        }

        let from = self.mode;
        self.mode = Mode::Emergency;
        self.candidate = None;
        self.blackout_since = None;
        self.restore = None;
        self.restore_needed = false;
        tracing::error!(from = %from, reason, "Entering EMERGENCY");
        self.events.publish(
            EventBuilder::new(event_types::EMERGENCY_ENTERED, SOURCE)
                .severity(EventSeverity::Critical)
                .category(EventCategory::Mode)
                .subject(Mode::Emergency.as_str())
                .at(now)
                .message(format!("EMERGENCY from {from}: {reason}"))
                .build(),
        );
    }

    fn request_restore(&mut self, now: Timestamp, commands: &mut Vec<ModeCommand>) {
        let channels = keyed_channels(self.mode);
        if channels.is_empty() {
            self.restore_needed = false;
            return;
        }
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let deadline = now + self.config.snapshot().auth_timeout_ms;
        self.restore = Some(AuthRound {
            attempt,
            awaiting: channels.iter().copied().collect(),
            deadline,
        });
        self.restore_needed = false;
        commands.push(ModeCommand::Authenticate {
            attempt,
            channels,
            deadline,
        });
    }

    fn lock_out(&mut self, channel: ChannelKind, until: Timestamp, commands: &mut Vec<ModeCommand>) {
        let entry = self.channel_lockouts.entry(channel).or_insert(until);
        *entry = (*entry).max(until);
        commands.push(ModeCommand::PersistCooldown {
            key: channel_lockout_key(channel),
            until: *entry,
        });
        for mode in Mode::SECURITY_ORDER {
            if mode != Mode::Emergency && mode.uses_channel(channel) {
                self.cool_down(mode, until, commands);
            }
        }
    }

    fn cool_down(&mut self, mode: Mode, until: Timestamp, commands: &mut Vec<ModeCommand>) {
        let entry = self.mode_cooldowns.entry(mode).or_insert(until);
        *entry = (*entry).max(until);
        commands.push(ModeCommand::PersistCooldown {
            key: mode_cooldown_key(mode),
            until: *entry,
        });
    }

    fn publish_forced(&self, now: Timestamp, target: Mode, reason: &str) {
        tracing::warn!(from = %self.mode, to = %target, reason, "Forced transition");
        self.events.publish(
            EventBuilder::new(event_types::TRANSITION_FORCED, SOURCE)
                .severity(EventSeverity::Critical)
                .category(EventCategory::Mode)
                .subject(target.as_str())
                .at(now)
                .message(format!("Forced {} -> {target}: {reason}", self.mode))
                .build(),
        );
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.snapshot());
    }
}
