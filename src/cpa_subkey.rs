use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use num_traits::AsPrimitive;
use rayon::prelude::{IntoParallelIterator, ParallelIterator};
use std::ops::Add;
use tracing::{debug, warn};

use crate::config::{select_inputs, Direction, KeyRound, SampleWindow};
use crate::corpus::TraceCorpus;
use crate::error::{Error, Result};
use crate::leakage::{KeyRequirement, LeakageModel, ModelInput};
use crate::progress::Progress;

/// Number of candidates for one key byte
pub const GUESS_RANGE: usize = 256;

/// Where an interrupted batch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeMarker {
    /// First candidate not folded yet
    pub next_candidate: usize,
    /// Number of traces in the interrupted batch
    pub batch_len: usize,
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// The batch was folded; holds the 256 x num_samples correlation matrix.
    Complete(Array2<f64>),
    /// A skip was requested mid-batch. `partial` holds the rows of the
    /// candidates handled so far, as they would read once the batch is folded.
    /// Nothing is committed until [`SubkeyCpa::resume`] finishes the batch.
    Skipped {
        partial: Array2<f64>,
        resume: ResumeMarker,
    },
}

/// Contributions of one batch, filled candidate by candidate.
#[derive(Debug, Clone)]
struct BatchSums {
    len: usize,
    sum_traces: Array1<f64>,
    sum_traces2: Array1<f64>,
    sum_hyp: Array1<f64>,
    sum_hyp2: Array1<f64>,
    sum_hyp_traces: Array2<f64>,
    next_candidate: usize,
}

impl BatchSums {
    fn new(traces: &Array2<f64>) -> Self {
        let window_len = traces.ncols();
        Self {
            len: traces.nrows(),
            sum_traces: traces.sum_axis(Axis(0)),
            sum_traces2: traces.mapv(|t| t * t).sum_axis(Axis(0)),
            sum_hyp: Array1::zeros(GUESS_RANGE),
            sum_hyp2: Array1::zeros(GUESS_RANGE),
            sum_hyp_traces: Array2::zeros((GUESS_RANGE, window_len)),
            next_candidate: 0,
        }
    }

    fn fold_candidate(&mut self, guess: usize, hyp: &Array1<f64>, traces: &Array2<f64>) {
        self.sum_hyp[guess] = hyp.sum();
        self.sum_hyp2[guess] = hyp.dot(hyp);
        self.sum_hyp_traces
            .row_mut(guess)
            .assign(&traces.t().dot(hyp));
        self.next_candidate = guess + 1;
    }

    fn marker(&self) -> ResumeMarker {
        ResumeMarker {
            next_candidate: self.next_candidate,
            batch_len: self.len,
        }
    }
}

/// Progressive CPA state for one key byte.
///
/// Keeps the running sums of the single-pass Pearson formula for every key
/// candidate. Traces are only ever folded in, so splitting a corpus into
/// batches does not change the result.
///
/// See Brier, Clavier, Olivier: <https://www.iacr.org/archive/ches2004/31560016/31560016.pdf>
#[derive(Debug, Clone)]
pub struct SubkeyCpa {
    /// Attacked key byte
    subkey: usize,
    /// Number of samples per full trace
    num_samples: usize,
    /// Samples actually folded
    window: SampleWindow,
    /// Sum of traces, shared by every candidate
    sum_traces: Array1<f64>,
    /// Sum of square of traces
    sum_traces2: Array1<f64>,
    /// Sum of hypotheses per key guess
    sum_hyp: Array1<f64>,
    /// Sum of square of hypotheses per key guess
    sum_hyp2: Array1<f64>,
    /// Sum of hypothesis times trace, per key guess and sample
    sum_hyp_traces: Array2<f64>,
    /// Number of traces processed
    num_traces: usize,
    pending: Option<BatchSums>,
}

impl SubkeyCpa {
    pub fn new(subkey: usize, num_samples: usize, window: Option<SampleWindow>) -> Result<Self> {
        let window = window.unwrap_or_else(|| SampleWindow::full(num_samples));
        window.check(num_samples)?;
        Ok(Self {
            subkey,
            num_samples,
            window,
            sum_traces: Array1::zeros(window.len()),
            sum_traces2: Array1::zeros(window.len()),
            sum_hyp: Array1::zeros(GUESS_RANGE),
            sum_hyp2: Array1::zeros(GUESS_RANGE),
            sum_hyp_traces: Array2::zeros((GUESS_RANGE, window.len())),
            num_traces: 0,
            pending: None,
        })
    }

    pub fn subkey(&self) -> usize {
        self.subkey
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn window(&self) -> SampleWindow {
        self.window
    }

    pub fn traces_seen(&self) -> usize {
        self.num_traces
    }

    pub fn pending(&self) -> Option<ResumeMarker> {
        self.pending.as_ref().map(BatchSums::marker)
    }

    /// Zeroes every sum.
    pub fn reset(&mut self) {
        self.sum_traces.fill(0.0);
        self.sum_traces2.fill(0.0);
        self.sum_hyp.fill(0.0);
        self.sum_hyp2.fill(0.0);
        self.sum_hyp_traces.fill(0.0);
        self.num_traces = 0;
        self.pending = None;
    }

    /// Folds `batch` into the running sums.
    ///
    /// Progress is polled once per key candidate. On cancellation nothing from
    /// this batch is kept. A pending partial batch left by an earlier skip is
    /// discarded.
    pub fn ingest<T, M, P>(
        &mut self,
        batch: &TraceCorpus<'_, T>,
        key_round: KeyRound,
        direction: Direction,
        model: &M,
        progress: &P,
    ) -> Result<IngestOutcome>
    where
        T: AsPrimitive<f64>,
        M: LeakageModel + ?Sized,
        P: Progress + ?Sized,
    {
        self.check_batch(batch, model)?;
        if let Some(pending) = self.pending.take() {
            warn!(
                subkey = self.subkey,
                next_candidate = pending.next_candidate,
                "discarding partially folded batch"
            );
        }
        if batch.is_empty() {
            return Ok(IngestOutcome::Complete(self.correlation_matrix()));
        }

        let traces = self.window_traces(batch);
        let sums = BatchSums::new(&traces);
        self.fold(sums, &traces, batch, key_round, direction, model, progress)
    }

    /// Finishes a batch interrupted by a skip request.
    ///
    /// `batch` must be the batch passed to the interrupted [`SubkeyCpa::ingest`].
    pub fn resume<T, M, P>(
        &mut self,
        marker: ResumeMarker,
        batch: &TraceCorpus<'_, T>,
        key_round: KeyRound,
        direction: Direction,
        model: &M,
        progress: &P,
    ) -> Result<IngestOutcome>
    where
        T: AsPrimitive<f64>,
        M: LeakageModel + ?Sized,
        P: Progress + ?Sized,
    {
        self.check_batch(batch, model)?;
        let sums = match self.pending.take() {
            Some(sums) if sums.marker() == marker && sums.len == batch.len() => sums,
            other => {
                self.pending = other;
                return Err(Error::InvalidConfiguration(format!(
                    "no pending batch of subkey {} matches {marker:?}",
                    self.subkey
                )));
            }
        };

        let traces = self.window_traces(batch);
        self.fold(sums, &traces, batch, key_round, direction, model, progress)
    }

    /// Correlation of every candidate against every sample, zero outside the
    /// sample window. Cells with a vanishing variance are NaN.
    pub fn correlation_matrix(&self) -> Array2<f64> {
        correlation(
            self.num_traces,
            self.sum_traces.view(),
            self.sum_traces2.view(),
            self.sum_hyp.view(),
            self.sum_hyp2.view(),
            self.sum_hyp_traces.view(),
            self.window,
            self.num_samples,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn fold<T, M, P>(
        &mut self,
        mut sums: BatchSums,
        traces: &Array2<f64>,
        batch: &TraceCorpus<'_, T>,
        key_round: KeyRound,
        direction: Direction,
        model: &M,
        progress: &P,
    ) -> Result<IngestOutcome>
    where
        M: LeakageModel + ?Sized,
        P: Progress + ?Sized,
    {
        let plaintexts = rows_of(batch.plaintexts());
        let ciphertexts = rows_of(batch.ciphertexts());
        let known_keys = match model.key_requirement() {
            KeyRequirement::WithKnownKey => batch.known_keys().map(rows_of),
            KeyRequirement::WithoutKnownKey => None,
        };
        let inputs: Vec<ModelInput<'_>> = (0..batch.len())
            .map(|row| {
                let (plaintext, ciphertext) =
                    select_inputs(key_round, direction, &plaintexts[row], &ciphertexts[row]);
                ModelInput {
                    plaintext,
                    ciphertext,
                    known_key: known_keys.as_ref().map(|keys| keys[row].as_slice()),
                }
            })
            .collect();

        let mut hyp: Array1<f64> = Array1::zeros(batch.len());
        for guess in sums.next_candidate..GUESS_RANGE {
            for (row, input) in inputs.iter().enumerate() {
                hyp[row] = model.leakage(input, guess as u8, self.subkey).ok_or_else(|| {
                    Error::InvalidConfiguration(format!(
                        "leakage model has no input for subkey {} ({key_round:?}, {direction:?})",
                        self.subkey
                    ))
                })?;
            }
            sums.fold_candidate(guess, &hyp, traces);

            progress.advance(1);
            if progress.is_cancelled() {
                return Err(Error::OperationCancelled);
            }
            if progress.is_skip_requested() && sums.next_candidate < GUESS_RANGE {
                let partial = self.prospective(&sums);
                let resume = sums.marker();
                debug!(subkey = self.subkey, ?resume, "batch interrupted by skip request");
                self.pending = Some(sums);
                return Ok(IngestOutcome::Skipped { partial, resume });
            }
        }

        self.commit(&sums);
        debug!(
            subkey = self.subkey,
            batch = sums.len,
            traces_seen = self.num_traces,
            "folded batch"
        );
        Ok(IngestOutcome::Complete(self.correlation_matrix()))
    }

    fn commit(&mut self, sums: &BatchSums) {
        self.sum_traces += &sums.sum_traces;
        self.sum_traces2 += &sums.sum_traces2;
        self.sum_hyp += &sums.sum_hyp;
        self.sum_hyp2 += &sums.sum_hyp2;
        self.sum_hyp_traces += &sums.sum_hyp_traces;
        self.num_traces += sums.len;
    }

    /* Rows of the candidates already in `sums`, as if the batch were committed */
    fn prospective(&self, sums: &BatchSums) -> Array2<f64> {
        let done = sums.next_candidate;
        let sum_hyp = &self.sum_hyp.slice(s![..done]) + &sums.sum_hyp.slice(s![..done]);
        let sum_hyp2 = &self.sum_hyp2.slice(s![..done]) + &sums.sum_hyp2.slice(s![..done]);
        let sum_hyp_traces = &self.sum_hyp_traces.slice(s![..done, ..])
            + &sums.sum_hyp_traces.slice(s![..done, ..]);
        correlation(
            self.num_traces + sums.len,
            (&self.sum_traces + &sums.sum_traces).view(),
            (&self.sum_traces2 + &sums.sum_traces2).view(),
            sum_hyp.view(),
            sum_hyp2.view(),
            sum_hyp_traces.view(),
            self.window,
            self.num_samples,
        )
    }

    fn check_batch<T, M>(&self, batch: &TraceCorpus<'_, T>, model: &M) -> Result<()>
    where
        M: LeakageModel + ?Sized,
    {
        if batch.num_samples() != self.num_samples {
            return Err(Error::ShapeMismatch(format!(
                "traces of {} samples fed to subkey {} expecting {}",
                batch.num_samples(),
                self.subkey,
                self.num_samples
            )));
        }
        if model.key_requirement() == KeyRequirement::WithKnownKey && !batch.has_known_keys() {
            return Err(Error::InvalidConfiguration(
                "leakage model needs known keys but none were supplied".to_string(),
            ));
        }
        Ok(())
    }

    /* Cut the window and widen to f64 before any summation */
    fn window_traces<T>(&self, batch: &TraceCorpus<'_, T>) -> Array2<f64>
    where
        T: AsPrimitive<f64>,
    {
        batch
            .traces()
            .slice(s![.., self.window.start..self.window.end])
            .mapv(|t| t.as_())
    }

    /// Determine if two [`SubkeyCpa`] are compatible for addition.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.subkey == other.subkey
            && self.num_samples == other.num_samples
            && self.window == other.window
    }
}

impl Add for SubkeyCpa {
    type Output = Self;

    /// Merge two accumulators fed with disjoint traces of the same subkey.
    /// Pending partial batches are dropped.
    ///
    /// # Panics
    /// Panics in debug if the accumulators are not compatible.
    fn add(self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        Self {
            subkey: self.subkey,
            num_samples: self.num_samples,
            window: self.window,
            sum_traces: self.sum_traces + rhs.sum_traces,
            sum_traces2: self.sum_traces2 + rhs.sum_traces2,
            sum_hyp: self.sum_hyp + rhs.sum_hyp,
            sum_hyp2: self.sum_hyp2 + rhs.sum_hyp2,
            sum_hyp_traces: self.sum_hyp_traces + rhs.sum_hyp_traces,
            num_traces: self.num_traces + rhs.num_traces,
            pending: None,
        }
    }
}

fn rows_of(blocks: ArrayView2<'_, u8>) -> Vec<Vec<u8>> {
    blocks.rows().into_iter().map(|row| row.to_vec()).collect()
}

/// Relative size under which a variance factor counts as zero
const VARIANCE_TOLERANCE: f64 = 1e-12;

/// Single-pass Pearson coefficient:
///
/// `(n·Σht − Σh·Σt) / sqrt((n·Σh² − (Σh)²) · (n·Σt² − (Σt)²))`
///
/// evaluated in f64, with the window padded back to `num_samples` columns.
/// A factor of the denominator at or near zero (constant hypothesis or
/// constant samples) gives NaN.
#[allow(clippy::too_many_arguments)]
fn correlation(
    num_traces: usize,
    sum_traces: ArrayView1<f64>,
    sum_traces2: ArrayView1<f64>,
    sum_hyp: ArrayView1<f64>,
    sum_hyp2: ArrayView1<f64>,
    sum_hyp_traces: ArrayView2<f64>,
    window: SampleWindow,
    num_samples: usize,
) -> Array2<f64> {
    let n = num_traces as f64;
    let guesses = sum_hyp.len();
    let var_traces: Array1<f64> = sum_traces
        .iter()
        .zip(sum_traces2.iter())
        .map(|(&t, &t2)| variance_factor(n, t, t2))
        .collect();

    /* Parallel operation using multi-threading */
    let rows: Vec<Array1<f64>> = (0..guesses)
        .into_par_iter()
        .map(|guess| {
            let var_hyp = variance_factor(n, sum_hyp[guess], sum_hyp2[guess]);
            let mut row = Array1::zeros(window.len());
            for x in 0..window.len() {
                let numerator = n * sum_hyp_traces[[guess, x]] - sum_hyp[guess] * sum_traces[x];
                row[x] = numerator / (var_hyp * var_traces[x]).sqrt();
            }
            row
        })
        .collect();

    let mut corr = Array2::zeros((guesses, num_samples));
    for (guess, row) in rows.iter().enumerate() {
        corr.slice_mut(s![guess, window.start..window.end])
            .assign(row);
    }
    corr
}

/* n·Σx² − (Σx)², NaN when it vanishes next to n·Σx² */
fn variance_factor(n: f64, sum: f64, sum2: f64) -> f64 {
    let scale = n * sum2;
    let factor = scale - sum * sum;
    if factor > scale * VARIANCE_TOLERANCE {
        factor
    } else {
        f64::NAN
    }
}
