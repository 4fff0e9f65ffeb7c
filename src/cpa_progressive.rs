use ndarray::Array2;
use num_traits::AsPrimitive;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::{AttackConfig, SampleWindow, Schedule};
use crate::corpus::TraceCorpus;
use crate::cpa_subkey::{IngestOutcome, SubkeyCpa, GUESS_RANGE};
use crate::error::{Error, Result};
use crate::leakage::{KeyRequirement, LeakageModel};
use crate::progress::Progress;
use crate::ranking::Ranking;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttackState {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Outcome of a completed [`ProgressiveCpa::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub state: AttackState,
    /// Traces folded so far, per attacked subkey
    pub traces_seen: BTreeMap<usize, usize>,
    /// Subkeys left early during this run, in the order they were left
    pub skipped: Vec<usize>,
    /// Number of batches folded during this run
    pub batches: usize,
}

/// Progressive CPA over several key bytes.
///
/// Owns one [`SubkeyCpa`] per attacked position. The corpus given to
/// [`ProgressiveCpa::run`] is cumulative: every position picks up at its own
/// `traces_seen`, so running again with a longer corpus, or after a
/// cancellation, continues where the previous run stopped.
#[derive(Debug, Default)]
pub struct ProgressiveCpa {
    accumulators: BTreeMap<usize, SubkeyCpa>,
    state: AttackState,
}

enum Step {
    Ingested,
    Exhausted,
    Skipped,
}

struct Session<'s, 'c, T, M: ?Sized, P: ?Sized, R: ?Sized> {
    corpus: &'s TraceCorpus<'c, T>,
    config: &'s AttackConfig,
    model: &'s M,
    progress: &'s P,
    ranking: &'s mut R,
    skipped: Vec<usize>,
    batches: usize,
}

impl<'s, 'c, T, M, P, R> Session<'s, 'c, T, M, P, R>
where
    T: AsPrimitive<f64>,
    M: LeakageModel + ?Sized,
    P: Progress + ?Sized,
    R: Ranking + ?Sized,
{
    /// Units still planned for a position that has folded `from` traces.
    fn units_left(&self, from: usize) -> u64 {
        let remaining = self.corpus.len().saturating_sub(from);
        (remaining.div_ceil(self.config.batch_size) * GUESS_RANGE) as u64
    }

    /// Folds the next batch of one position.
    ///
    /// Only completed batches reach the ranking. The rows of a batch cut short
    /// by a skip request are not forwarded: they cover part of the candidates
    /// and their trace count was never committed.
    fn step(&mut self, cpa: &mut SubkeyCpa) -> Result<Step> {
        let subkey = cpa.subkey();
        let start = cpa.traces_seen();
        if start >= self.corpus.len() {
            return Ok(Step::Exhausted);
        }

        if self.config.skip_if_ranked && self.ranking.current_rank(subkey) == Some(0) {
            info!(subkey, traces_seen = start, "subkey ranked first, skipping");
            self.progress.advance(self.units_left(start));
            return Ok(Step::Skipped);
        }

        let end = (start + self.config.batch_size).min(self.corpus.len());
        self.progress.update_status(start..end, subkey);
        if self.progress.is_cancelled() {
            return Err(Error::OperationCancelled);
        }
        debug!(subkey, start, end, "ingesting batch");

        let outcome = cpa.ingest(
            &self.corpus.batch(start..end),
            self.config.key_round,
            self.config.direction,
            self.model,
            self.progress,
        )?;
        match outcome {
            IngestOutcome::Complete(corr) => {
                self.batches += 1;
                self.ranking.update(subkey, corr.view(), cpa.traces_seen());
                if self.progress.is_skip_requested() {
                    self.progress.clear_skip();
                    info!(subkey, traces_seen = end, "skip requested");
                    self.progress.advance(self.units_left(end));
                    return Ok(Step::Skipped);
                }
                Ok(Step::Ingested)
            }
            IngestOutcome::Skipped { resume, .. } => {
                self.progress.clear_skip();
                info!(
                    subkey,
                    next_candidate = resume.next_candidate,
                    "skip requested mid-batch"
                );
                self.progress.advance(
                    self.units_left(start)
                        .saturating_sub(resume.next_candidate as u64),
                );
                Ok(Step::Skipped)
            }
        }
    }
}

impl ProgressiveCpa {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AttackState {
        self.state
    }

    /// Subkeys with an accumulator.
    pub fn subkeys(&self) -> Vec<usize> {
        self.accumulators.keys().copied().collect()
    }

    pub fn accumulator(&self, subkey: usize) -> Option<&SubkeyCpa> {
        self.accumulators.get(&subkey)
    }

    pub fn correlation_matrix(&self, subkey: usize) -> Option<Array2<f64>> {
        self.accumulators
            .get(&subkey)
            .map(SubkeyCpa::correlation_matrix)
    }

    pub fn traces_seen(&self, subkey: usize) -> usize {
        self.accumulators
            .get(&subkey)
            .map_or(0, SubkeyCpa::traces_seen)
    }

    /// Zeroes the sums of one position.
    pub fn reset(&mut self, subkey: usize) {
        if let Some(cpa) = self.accumulators.get_mut(&subkey) {
            cpa.reset();
        }
    }

    /// Drops every accumulator.
    pub fn reset_all(&mut self) {
        self.accumulators.clear();
        self.state = AttackState::Idle;
    }

    /// Folds the traces of `corpus` not yet seen into every position of
    /// `config.subkeys`, in the order given by `config.schedule`.
    ///
    /// On cancellation the state built so far is kept and
    /// [`Error::OperationCancelled`] is returned.
    pub fn run<T, M, P, R>(
        &mut self,
        corpus: &TraceCorpus<'_, T>,
        config: &AttackConfig,
        model: &M,
        progress: &P,
        ranking: &mut R,
    ) -> Result<RunSummary>
    where
        T: AsPrimitive<f64>,
        M: LeakageModel + ?Sized,
        P: Progress + ?Sized,
        R: Ranking + ?Sized,
    {
        if let Err(e) = self.prepare(corpus, config, model) {
            self.state = AttackState::Failed;
            return Err(e);
        }
        self.state = AttackState::Running;
        info!(
            subkeys = ?config.subkeys,
            traces = corpus.len(),
            schedule = ?config.schedule,
            "starting progressive CPA run"
        );

        let mut session = Session {
            corpus,
            config,
            model,
            progress,
            ranking,
            skipped: Vec::new(),
            batches: 0,
        };
        let total: u64 = config
            .subkeys
            .iter()
            .map(|subkey| session.units_left(self.traces_seen(*subkey)))
            .sum();
        progress.set_total(total);

        let result = match config.schedule {
            Schedule::BreadthFirst => self.breadth_first(&mut session),
            Schedule::DepthFirst => self.depth_first(&mut session),
        };
        match result {
            Ok(()) => {
                self.state = AttackState::Completed;
                if session.batches == 0 && session.skipped.is_empty() && !config.subkeys.is_empty() {
                    warn!(
                        traces = corpus.len(),
                        "no traces beyond those already folded; run expects the whole corpus, not only new traces"
                    );
                }
                info!(
                    batches = session.batches,
                    skipped = ?session.skipped,
                    "progressive CPA run completed"
                );
                Ok(RunSummary {
                    state: self.state,
                    traces_seen: config
                        .subkeys
                        .iter()
                        .map(|&subkey| (subkey, self.traces_seen(subkey)))
                        .collect(),
                    skipped: session.skipped,
                    batches: session.batches,
                })
            }
            Err(Error::OperationCancelled) => {
                self.state = AttackState::Cancelled;
                warn!(batches = session.batches, "progressive CPA run cancelled");
                Err(Error::OperationCancelled)
            }
            Err(e) => {
                self.state = AttackState::Failed;
                Err(e)
            }
        }
    }

    /* Every batch goes to every active position before the next batch */
    fn breadth_first<T, M, P, R>(&mut self, session: &mut Session<'_, '_, T, M, P, R>) -> Result<()>
    where
        T: AsPrimitive<f64>,
        M: LeakageModel + ?Sized,
        P: Progress + ?Sized,
        R: Ranking + ?Sized,
    {
        let mut active = session.config.subkeys.clone();
        while !active.is_empty() {
            let mut still_active = Vec::with_capacity(active.len());
            for subkey in active {
                let cpa = self.accumulator_mut(subkey)?;
                match session.step(cpa)? {
                    Step::Ingested => still_active.push(subkey),
                    Step::Exhausted => {}
                    Step::Skipped => session.skipped.push(subkey),
                }
            }
            active = still_active;
        }
        Ok(())
    }

    /* One position at a time, through the whole corpus */
    fn depth_first<T, M, P, R>(&mut self, session: &mut Session<'_, '_, T, M, P, R>) -> Result<()>
    where
        T: AsPrimitive<f64>,
        M: LeakageModel + ?Sized,
        P: Progress + ?Sized,
        R: Ranking + ?Sized,
    {
        let config = session.config;
        for &subkey in &config.subkeys {
            let cpa = self.accumulator_mut(subkey)?;
            loop {
                match session.step(cpa)? {
                    Step::Ingested => {}
                    Step::Exhausted => break,
                    Step::Skipped => {
                        session.skipped.push(subkey);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn accumulator_mut(&mut self, subkey: usize) -> Result<&mut SubkeyCpa> {
        self.accumulators.get_mut(&subkey).ok_or_else(|| {
            Error::InvalidConfiguration(format!("no accumulator for subkey {subkey}"))
        })
    }

    /// Checks the run parameters against the corpus and the existing
    /// accumulators, then creates the missing accumulators. Nothing is touched
    /// if a check fails.
    fn prepare<T, M>(
        &mut self,
        corpus: &TraceCorpus<'_, T>,
        config: &AttackConfig,
        model: &M,
    ) -> Result<()>
    where
        M: LeakageModel + ?Sized,
    {
        config.validate()?;
        if model.key_requirement() == KeyRequirement::WithKnownKey && !corpus.has_known_keys() {
            return Err(Error::InvalidConfiguration(
                "leakage model needs known keys but none were supplied".to_string(),
            ));
        }

        let num_samples = corpus.num_samples();
        let mut created = Vec::new();
        for &subkey in &config.subkeys {
            let window = config.window(subkey);
            match self.accumulators.get(&subkey) {
                Some(cpa) => {
                    if cpa.num_samples() != num_samples {
                        return Err(Error::ShapeMismatch(format!(
                            "subkey {subkey} was attacked with traces of {} samples, got {num_samples}",
                            cpa.num_samples()
                        )));
                    }
                    if cpa.window() != window.unwrap_or_else(|| SampleWindow::full(num_samples)) {
                        return Err(Error::InvalidConfiguration(format!(
                            "sample window of subkey {subkey} changed, reset it first"
                        )));
                    }
                    if cpa.traces_seen() > corpus.len() {
                        return Err(Error::ShapeMismatch(format!(
                            "subkey {subkey} has seen {} traces but the corpus holds {}",
                            cpa.traces_seen(),
                            corpus.len()
                        )));
                    }
                }
                None => created.push(SubkeyCpa::new(subkey, num_samples, window)?),
            }
        }
        for cpa in created {
            self.accumulators.insert(cpa.subkey(), cpa);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Direction, KeyRound};
    use crate::leakage::{HwSboxOutput, HwTweakedSboxOutput};
    use crate::progress::{NoProgress, ProgressState};
    use crate::ranking::RankTracker;

    fn blocks(num_traces: usize) -> (Array2<i16>, Array2<u8>) {
        let traces = Array2::from_shape_fn((num_traces, 5), |(i, j)| ((i * 31 + j * 7) % 23) as i16);
        let plaintexts = Array2::from_shape_fn((num_traces, 16), |(i, j)| (i * 13 + j) as u8);
        (traces, plaintexts)
    }

    fn config(subkeys: Vec<usize>) -> AttackConfig {
        AttackConfig {
            subkeys,
            key_round: KeyRound::First,
            direction: Direction::Encrypt,
            batch_size: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_state_and_summary() {
        let (traces, plaintexts) = blocks(35);
        let corpus = TraceCorpus::new(traces.view(), plaintexts.view(), plaintexts.view()).unwrap();
        let mut attack = ProgressiveCpa::new();
        assert_eq!(attack.state(), AttackState::Idle);

        let progress = ProgressState::new();
        let summary = attack
            .run(&corpus, &config(vec![0, 3]), &HwSboxOutput, &progress, &mut RankTracker::new())
            .unwrap();
        assert_eq!(attack.state(), AttackState::Completed);
        assert_eq!(summary.state, AttackState::Completed);
        assert_eq!(summary.batches, 8);
        assert!(summary.skipped.is_empty());
        assert_eq!(summary.traces_seen[&0], 35);
        assert_eq!(summary.traces_seen[&3], 35);
        assert_eq!(attack.subkeys(), vec![0, 3]);
        assert_eq!(progress.total(), 2 * 4 * 256);
        assert_eq!(progress.done(), 2 * 4 * 256);

        let corr = attack.correlation_matrix(3).unwrap();
        assert_eq!(corr.shape(), &[256, 5]);
        assert_eq!(attack.correlation_matrix(7), None);
        assert_eq!(attack.traces_seen(7), 0);

        // nothing new to fold
        let again = attack
            .run(&corpus, &config(vec![0, 3]), &HwSboxOutput, &NoProgress, &mut RankTracker::new())
            .unwrap();
        assert_eq!(again.batches, 0);

        attack.reset(0);
        assert_eq!(attack.traces_seen(0), 0);
        assert_eq!(attack.traces_seen(3), 35);
        attack.reset_all();
        assert!(attack.subkeys().is_empty());
        assert_eq!(attack.state(), AttackState::Idle);
    }

    #[test]
    fn test_invalid_configuration_fails_without_state() {
        let (traces, plaintexts) = blocks(20);
        let corpus = TraceCorpus::new(traces.view(), plaintexts.view(), plaintexts.view()).unwrap();
        let mut attack = ProgressiveCpa::new();

        let mut bad = config(vec![0, 1]);
        bad.batch_size = 0;
        assert!(matches!(
            attack.run(&corpus, &bad, &HwSboxOutput, &NoProgress, &mut RankTracker::new()),
            Err(Error::InvalidConfiguration(_))
        ));
        assert_eq!(attack.state(), AttackState::Failed);
        assert!(attack.subkeys().is_empty());

        let mut window = config(vec![0, 1]);
        window.windows.insert(1, SampleWindow { start: 2, end: 9 });
        assert!(matches!(
            attack.run(&corpus, &window, &HwSboxOutput, &NoProgress, &mut RankTracker::new()),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(attack.subkeys().is_empty());

        assert!(matches!(
            attack.run(&corpus, &config(vec![0]), &HwTweakedSboxOutput, &NoProgress, &mut RankTracker::new()),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(attack.subkeys().is_empty());
    }

    #[test]
    fn test_existing_accumulators_are_checked() {
        let (traces, plaintexts) = blocks(30);
        let corpus = TraceCorpus::new(traces.view(), plaintexts.view(), plaintexts.view()).unwrap();
        let mut attack = ProgressiveCpa::new();
        attack
            .run(&corpus, &config(vec![2]), &HwSboxOutput, &NoProgress, &mut RankTracker::new())
            .unwrap();

        let shorter = corpus.batch(0..20);
        assert!(matches!(
            attack.run(&shorter, &config(vec![2]), &HwSboxOutput, &NoProgress, &mut RankTracker::new()),
            Err(Error::ShapeMismatch(_))
        ));
        assert_eq!(attack.state(), AttackState::Failed);

        let mut windowed = config(vec![2]);
        windowed.windows.insert(2, SampleWindow { start: 1, end: 3 });
        assert!(matches!(
            attack.run(&corpus, &windowed, &HwSboxOutput, &NoProgress, &mut RankTracker::new()),
            Err(Error::InvalidConfiguration(_))
        ));

        let narrow = traces.slice(ndarray::s![.., ..4]).to_owned();
        let narrow_corpus =
            TraceCorpus::new(narrow.view(), plaintexts.view(), plaintexts.view()).unwrap();
        assert!(matches!(
            attack.run(&narrow_corpus, &config(vec![2]), &HwSboxOutput, &NoProgress, &mut RankTracker::new()),
            Err(Error::ShapeMismatch(_))
        ));
        assert_eq!(attack.traces_seen(2), 30);
    }

    #[test]
    fn test_cancel_before_first_batch() {
        let (traces, plaintexts) = blocks(30);
        let corpus = TraceCorpus::new(traces.view(), plaintexts.view(), plaintexts.view()).unwrap();
        let mut attack = ProgressiveCpa::new();
        let progress = ProgressState::new();
        progress.cancel();
        assert!(matches!(
            attack.run(&corpus, &config(vec![0]), &HwSboxOutput, &progress, &mut RankTracker::new()),
            Err(Error::OperationCancelled)
        ));
        assert_eq!(attack.state(), AttackState::Cancelled);
        assert_eq!(attack.traces_seen(0), 0);

        progress.reset_cancel();
        attack
            .run(&corpus, &config(vec![0]), &HwSboxOutput, &progress, &mut RankTracker::new())
            .unwrap();
        assert_eq!(attack.traces_seen(0), 30);
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Ok(mut logs) = self.0.lock() {
                logs.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_warns_when_nothing_new() {
        let (traces, plaintexts) = blocks(40);
        let corpus = TraceCorpus::new(traces.view(), plaintexts.view(), plaintexts.view()).unwrap();
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let mut attack = ProgressiveCpa::new();
        tracing::subscriber::with_default(subscriber, || {
            attack
                .run(&corpus.batch(0..20), &config(vec![1]), &HwSboxOutput, &NoProgress, &mut RankTracker::new())
                .unwrap();
            // only the new traces, as long as what was already folded
            let summary = attack
                .run(&corpus.batch(20..40), &config(vec![1]), &HwSboxOutput, &NoProgress, &mut RankTracker::new())
                .unwrap();
            assert_eq!(summary.batches, 0);
        });
        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(logs.matches("no traces beyond those already folded").count(), 1);
        assert_eq!(attack.traces_seen(1), 20);
    }
}
