//! Debate engine: opens sessions, collects arguments and votes, and
//! resolves or abandons them.
//!
//! Every operation runs under the session's own lock, so distinct sessions
//! never contend. Phase changes and terminal outcomes are buffered and
//! handed to the next run of the `debate` step.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::consensus::{Decision, Tally};
use super::guardrails::{AbandonReason, DeadlineVerdict, Guardrails};
use super::state::{Argument, DebatePhase, DebateSession, DebateTransition, Vote};
use crate::clock::SharedClock;
use crate::config::DebateConfig;
use crate::context::ExecutionContext;
use crate::contracts::{Queryable, Step, StepOutcome, StepResult};
use crate::ids::{prefixed_id, AgentId, SessionId};
use crate::metrics::MetricEvent;
use crate::state::{lock, SessionTable, SharedState};

/// Step name of the debate engine.
pub const DEBATE_STEP: &str = "debate";

/// Error type for debate operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DebateError {
    #[error("unknown debate session: {0}")]
    UnknownSession(SessionId),

    #[error("debate topic must not be empty")]
    EmptyTopic,

    #[error("debate needs at least {need} distinct participants, got {got}")]
    TooFewParticipants { need: usize, got: usize },

    #[error("{agent} is not a participant of {session}")]
    NotParticipant { session: SessionId, agent: AgentId },

    #[error("cannot {operation} session {session} in phase {phase}")]
    WrongPhase {
        session: SessionId,
        phase: DebatePhase,
        operation: &'static str,
    },

    #[error("position must not be empty")]
    EmptyPosition,

    #[error("session {0} has no arguments")]
    NoArguments(SessionId),

    #[error("position '{position}' was never argued in {session}")]
    UnarguedPosition { session: SessionId, position: String },

    #[error("quorum not reached in {session}: {have}/{need}")]
    QuorumNotReached {
        session: SessionId,
        have: usize,
        need: usize,
    },

    #[error("no consensus in {session}: {detail}")]
    NoConsensus { session: SessionId, detail: String },
}

/// Result type for debate operations
pub type DebateResult<T> = Result<T, DebateError>;

/// Debate request staged as a cycle input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DebateCommand {
    /// Open a new session.
    Open {
        topic: String,
        participants: Vec<AgentId>,
    },
    /// Submit an argument.
    Argue {
        session_id: SessionId,
        agent: AgentId,
        position: String,
        #[serde(default)]
        rationale: String,
    },
    /// Close arguments and start voting.
    BeginVoting { session_id: SessionId },
    /// Cast or replace a vote.
    Vote {
        session_id: SessionId,
        agent: AgentId,
        position: String,
    },
    /// Resolve now.
    Resolve { session_id: SessionId },
    /// Cancel administratively.
    Cancel { session_id: SessionId, reason: String },
}

/// Session-level result written into the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DebateOutcome {
    /// A session was opened.
    Opened { session_id: SessionId },
    /// A session reached a decision.
    Resolved(Decision),
    /// A session closed without a decision.
    Abandoned {
        session_id: SessionId,
        reason: AbandonReason,
    },
}

#[derive(Debug, Default)]
struct Pending {
    metrics: Vec<MetricEvent>,
    outcomes: Vec<DebateOutcome>,
}

/// Owner of debate sessions.
pub struct DebateEngine {
    sessions: Arc<SessionTable<DebateSession>>,
    clock: SharedClock,
    guardrails: Guardrails,
    config: DebateConfig,
    pending: Mutex<Pending>,
}

impl DebateEngine {
    /// Engine over the shared session table.
    pub fn new(shared: &SharedState, config: DebateConfig) -> Self {
        Self {
            sessions: Arc::clone(&shared.debates),
            clock: Arc::clone(&shared.clock),
            guardrails: Guardrails::new(config.quorum_fraction),
            config,
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &DebateConfig {
        &self.config
    }

    /// Open a session among at least two distinct participants.
    pub fn open_session(
        &self,
        topic: &str,
        participants: impl IntoIterator<Item = AgentId>,
    ) -> DebateResult<SessionId> {
        if topic.trim().is_empty() {
            return Err(DebateError::EmptyTopic);
        }
        let participants: BTreeSet<AgentId> = participants
            .into_iter()
            .filter(|p| !p.is_blank())
            .collect();
        let need = self.config.min_participants.max(2);
        if participants.len() < need {
            return Err(DebateError::TooFewParticipants {
                need,
                got: participants.len(),
            });
        }

        let now = self.clock.now();
        let id = prefixed_id("debate");
        let window = Duration::seconds(self.config.argument_window_secs as i64);
        let count = participants.len();
        self.sessions
            .insert(id.clone(), DebateSession::new(id.clone(), topic, participants, now, window));
        lock(&self.pending).outcomes.push(DebateOutcome::Opened {
            session_id: id.clone(),
        });
        info!(session_id = %id, topic, participants = count, "debate opened");
        Ok(id)
    }

    /// Submit an argument while the session is `Open` or `Arguing`.
    pub fn submit_argument(
        &self,
        session_id: &str,
        agent: &AgentId,
        position: &str,
        rationale: &str,
    ) -> DebateResult<()> {
        self.mutate(session_id, "argue in", |session, now| {
            if !session.phase.accepts_arguments() {
                return Err(wrong_phase(session, "argue in"));
            }
            if !session.is_participant(agent) {
                return Err(DebateError::NotParticipant {
                    session: session.id.clone(),
                    agent: agent.clone(),
                });
            }
            if position.trim().is_empty() {
                return Err(DebateError::EmptyPosition);
            }
            session.arguments.push(Argument {
                agent: agent.clone(),
                position: position.to_string(),
                rationale: rationale.to_string(),
                submitted_at: now,
            });
            if session.phase == DebatePhase::Open {
                transition(session, DebatePhase::Arguing, "first argument", now);
            }
            debug!(session_id = %session.id, agent_id = %agent, position, "argument submitted");
            Ok(())
        })
    }

    /// Close arguments and start voting.
    pub fn begin_voting(&self, session_id: &str) -> DebateResult<()> {
        self.mutate(session_id, "begin voting in", |session, now| {
            if session.phase != DebatePhase::Arguing {
                return Err(wrong_phase(session, "begin voting in"));
            }
            if session.arguments.is_empty() {
                return Err(DebateError::NoArguments(session.id.clone()));
            }
            self.start_voting(session, "arguments closed", now);
            Ok(())
        })
    }

    /// Cast or replace a participant's vote.
    pub fn cast_vote(&self, session_id: &str, agent: &AgentId, position: &str) -> DebateResult<()> {
        self.mutate(session_id, "vote in", |session, now| {
            if session.phase != DebatePhase::Voting {
                return Err(wrong_phase(session, "vote in"));
            }
            if !session.is_participant(agent) {
                return Err(DebateError::NotParticipant {
                    session: session.id.clone(),
                    agent: agent.clone(),
                });
            }
            if !session.was_argued(position) {
                return Err(DebateError::UnarguedPosition {
                    session: session.id.clone(),
                    position: position.to_string(),
                });
            }
            let replaced = session
                .votes
                .insert(
                    agent.clone(),
                    Vote {
                        position: position.to_string(),
                        cast_at: now,
                    },
                )
                .is_some();
            debug!(session_id = %session.id, agent_id = %agent, position, replaced, "vote cast");
            Ok(())
        })
    }

    /// Resolve a `Voting` session into a decision.
    ///
    /// Fails without changing the session when quorum or the strategy is
    /// not met.
    pub fn resolve(&self, session_id: &str) -> DebateResult<Decision> {
        self.mutate(session_id, "resolve", |session, now| {
            if session.phase != DebatePhase::Voting {
                return Err(wrong_phase(session, "resolve"));
            }
            self.try_decide(session, now)
        })
    }

    /// Request cancellation; applied at the next run of the debate step.
    pub fn cancel_session(&self, session_id: &str, reason: &str) -> DebateResult<()> {
        self.mutate(session_id, "cancel", |session, _| {
            if session.is_complete() {
                return Err(wrong_phase(session, "cancel"));
            }
            session.cancel_requested = Some(reason.to_string());
            info!(session_id = %session.id, reason, "debate cancellation requested");
            Ok(())
        })
    }

    /// Apply cancellations and deadlines to every open session.
    ///
    /// Returns the terminal outcomes produced by this tick.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<DebateOutcome> {
        let before = lock(&self.pending).outcomes.len();
        for id in self.sessions.ids() {
            let _ = self.mutate_at(&id, "tick", now, |session, now| {
                self.apply_tick(session, now);
                Ok(())
            });
        }
        lock(&self.pending)
            .outcomes
            .get(before..)
            .map(|closed| closed.to_vec())
            .unwrap_or_default()
    }

    /// Snapshot of an open or archived session.
    pub fn session(&self, session_id: &str) -> Option<DebateSession> {
        self.sessions.lookup(session_id)
    }

    fn apply_tick(&self, session: &mut DebateSession, now: DateTime<Utc>) {
        if let Some(reason) = session.cancel_requested.take() {
            abandon(session, AbandonReason::Cancelled { reason }, now);
            return;
        }
        match self.guardrails.check_deadline(session, now) {
            DeadlineVerdict::Continue => {}
            DeadlineVerdict::BeginVoting => {
                self.start_voting(session, "argument deadline", now);
            }
            DeadlineVerdict::Resolve => {
                if let Err(e) = self.try_decide(session, now) {
                    let reason = match e {
                        DebateError::QuorumNotReached { have, need, .. } => {
                            AbandonReason::QuorumNotReached {
                                phase: DebatePhase::Voting,
                                have,
                                need,
                            }
                        }
                        other => AbandonReason::NoConsensus {
                            detail: other.to_string(),
                        },
                    };
                    abandon(session, reason, now);
                }
            }
            DeadlineVerdict::Abandon(reason) => abandon(session, reason, now),
        }
    }

    fn start_voting(&self, session: &mut DebateSession, reason: &str, now: DateTime<Utc>) {
        transition(session, DebatePhase::Voting, reason, now);
        session.voting_deadline =
            Some(now + Duration::seconds(self.config.voting_window_secs as i64));
    }

    fn try_decide(&self, session: &mut DebateSession, now: DateTime<Utc>) -> DebateResult<Decision> {
        let need = self.guardrails.quorum_for(session);
        if session.votes.len() < need {
            return Err(DebateError::QuorumNotReached {
                session: session.id.clone(),
                have: session.votes.len(),
                need,
            });
        }

        let tally = Tally::of(session);
        let selection = self
            .config
            .strategy
            .select(&tally, &session.argued_positions())
            .map_err(|detail| DebateError::NoConsensus {
                session: session.id.clone(),
                detail,
            })?;

        let decision = Decision {
            session_id: session.id.clone(),
            topic: session.topic.clone(),
            position: selection.position,
            votes_cast: tally.total,
            tally,
            tie_broken: selection.tie_broken,
            strategy: self.config.strategy,
            decided_at: now,
        };
        transition(session, DebatePhase::Resolved, "consensus reached", now);
        session.decision = Some(decision.clone());
        info!(
            session_id = %session.id,
            position = %decision.position,
            votes = decision.votes_cast,
            tie_broken = decision.tie_broken,
            "debate resolved"
        );
        Ok(decision)
    }

    fn mutate<R>(
        &self,
        session_id: &str,
        operation: &'static str,
        f: impl FnOnce(&mut DebateSession, DateTime<Utc>) -> DebateResult<R>,
    ) -> DebateResult<R> {
        self.mutate_at(session_id, operation, self.clock.now(), f)
    }

    /// Run `f` under the session lock, then record phase changes and
    /// archive the session if it closed.
    fn mutate_at<R>(
        &self,
        session_id: &str,
        operation: &'static str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut DebateSession, DateTime<Utc>) -> DebateResult<R>,
    ) -> DebateResult<R> {
        let Some(handle) = self.sessions.get(session_id) else {
            return Err(match self.sessions.lookup(session_id) {
                Some(closed) => wrong_phase(&closed, operation),
                None => DebateError::UnknownSession(session_id.to_string()),
            });
        };

        let (result, changes, complete) = {
            let mut session = lock(&handle);
            let before = session.transitions.len();
            let result = f(&mut session, now);
            let changes: Vec<DebateTransition> = session.transitions[before..].to_vec();
            (result, changes, session.is_complete())
        };

        let mut pending = lock(&self.pending);
        for change in changes {
            pending.metrics.push(MetricEvent::DebatePhase {
                session_id: session_id.to_string(),
                from: change.from,
                to: change.to,
                at: change.timestamp,
            });
        }
        if complete {
            if let Some(closed) = self.sessions.archive(session_id) {
                match (&closed.decision, &closed.abandon_reason) {
                    (Some(decision), _) => {
                        pending.outcomes.push(DebateOutcome::Resolved(decision.clone()))
                    }
                    (None, Some(reason)) => pending.outcomes.push(DebateOutcome::Abandoned {
                        session_id: closed.id.clone(),
                        reason: reason.clone(),
                    }),
                    (None, None) => {}
                }
            }
        }
        result
    }

    fn apply_command(&self, command: &DebateCommand) -> DebateResult<()> {
        match command {
            DebateCommand::Open {
                topic,
                participants,
            } => self.open_session(topic, participants.iter().cloned()).map(|_| ()),
            DebateCommand::Argue {
                session_id,
                agent,
                position,
                rationale,
            } => self.submit_argument(session_id, agent, position, rationale),
            DebateCommand::BeginVoting { session_id } => self.begin_voting(session_id),
            DebateCommand::Vote {
                session_id,
                agent,
                position,
            } => self.cast_vote(session_id, agent, position),
            DebateCommand::Resolve { session_id } => self.resolve(session_id).map(|_| ()),
            DebateCommand::Cancel { session_id, reason } => {
                self.cancel_session(session_id, reason)
            }
        }
    }

    fn apply_cancellations(&self, now: DateTime<Utc>) {
        for id in self.sessions.ids() {
            let _ = self.mutate_at(&id, "cancel", now, |session, now| {
                if let Some(reason) = session.cancel_requested.take() {
                    abandon(session, AbandonReason::Cancelled { reason }, now);
                }
                Ok(())
            });
        }
    }
}

fn wrong_phase(session: &DebateSession, operation: &'static str) -> DebateError {
    DebateError::WrongPhase {
        session: session.id.clone(),
        phase: session.phase,
        operation,
    }
}

fn transition(session: &mut DebateSession, to: DebatePhase, reason: &str, now: DateTime<Utc>) {
    if let Err(e) = session.transition(to, reason, now) {
        warn!(session_id = %session.id, error = %e, "debate transition refused");
    }
}

fn abandon(session: &mut DebateSession, reason: AbandonReason, now: DateTime<Utc>) {
    if session.is_complete() {
        return;
    }
    transition(session, DebatePhase::Abandoned, &reason.to_string(), now);
    info!(session_id = %session.id, reason = %reason, "debate abandoned");
    session.abandon_reason = Some(reason);
}

#[async_trait]
impl Step for DebateEngine {
    fn name(&self) -> &str {
        DEBATE_STEP
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> StepResult {
        let now = ctx.now();
        self.apply_cancellations(now);

        let commands: Vec<DebateCommand> = ctx.debate_commands().cloned().collect();
        let mut applied = 0;
        for command in &commands {
            match self.apply_command(command) {
                Ok(()) => applied += 1,
                Err(e) => ctx.reject(DEBATE_STEP, e.to_string()),
            }
        }

        self.tick(now);

        let pending = std::mem::take(&mut *lock(&self.pending));
        for event in pending.metrics {
            ctx.emit(event);
        }
        let closed = pending
            .outcomes
            .iter()
            .filter(|o| !matches!(o, DebateOutcome::Opened { .. }))
            .count();
        ctx.debates.extend(pending.outcomes);

        Ok(StepOutcome::processed(applied + closed).with_detail(format!(
            "{} commands applied, {} sessions closed, {} open",
            applied,
            closed,
            self.sessions.len()
        )))
    }
}

impl Queryable for DebateEngine {
    type Key = str;
    type View = DebateSession;

    fn query(&self, key: &str) -> Option<DebateSession> {
        self.session(key)
    }

    fn list(&self) -> Vec<DebateSession> {
        self.sessions.snapshot()
    }
}
