//! Debate Engine: structured argument and voting between agents.
//!
//! Sessions collect arguments from participants, then votes, and close
//! with a [`Decision`] or an [`AbandonReason`]. Deadlines are checked on
//! every run of the `debate` step.
//!
//! # Debate Flow
//!
//! ```text
//! Open → Arguing → Voting → [strategy satisfied?]
//!   │       │         │              │
//!   │       │         │              ├─ Yes → Resolved
//!   │       │         │              └─ No, deadline → Abandoned
//!   │       │         └─ voting deadline without quorum → Abandoned
//!   │       └─ argument deadline: quorum → Voting, else → Abandoned
//!   └─ cancel at any point → Abandoned
//! ```

pub mod consensus;
pub mod engine;
pub mod guardrails;
pub mod state;

pub use consensus::{ConsensusStrategy, Decision, Selection, Tally};
pub use engine::{
    DebateCommand, DebateEngine, DebateError, DebateOutcome, DebateResult, DEBATE_STEP,
};
pub use guardrails::{quorum, AbandonReason, DeadlineVerdict, Guardrails};
pub use state::{Argument, DebatePhase, DebateSession, DebateTransition, TransitionError, Vote};
