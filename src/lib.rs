//! Progressive Correlation Power Analysis against AES key bytes.
//!
//! [`cpa_subkey::SubkeyCpa`] keeps the running sums for one key byte and can be
//! fed batch after batch; [`cpa_progressive::ProgressiveCpa`] drives several of
//! them over a growing trace corpus.

pub mod config;
pub mod corpus;
pub mod cpa_progressive;
pub mod cpa_subkey;
pub mod error;
pub mod leakage;
pub mod progress;
pub mod ranking;
pub mod tools;

pub use config::{AttackConfig, Direction, KeyRound, SampleWindow, Schedule};
pub use corpus::TraceCorpus;
pub use cpa_progressive::{AttackState, ProgressiveCpa, RunSummary};
pub use cpa_subkey::{IngestOutcome, ResumeMarker, SubkeyCpa, GUESS_RANGE};
pub use error::{Error, Result};
pub use leakage::{KeyRequirement, LeakageModel, ModelInput};
pub use progress::{BarProgress, NoProgress, Progress, ProgressState};
pub use ranking::{RankTracker, Ranking};
