use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::collections::BTreeMap;

use crate::cpa_subkey::GUESS_RANGE;

/// Receives correlation matrices as an attack progresses.
pub trait Ranking {
    fn update(&mut self, subkey: usize, corr: ArrayView2<'_, f64>, traces_seen: usize);

    /// Number of candidates scoring above the presumed-correct one, `None`
    /// before the first update of `subkey`. Zero means the position converged.
    fn current_rank(&self, subkey: usize) -> Option<usize>;
}

#[derive(Debug, Clone)]
struct SubkeyStats {
    max_corr: Array1<f64>,
    traces_seen: usize,
    checkpoints: Vec<usize>,
    rank_slice: Array2<f64>,
}

/// Ranks candidates by their peak absolute correlation.
///
/// NaN cells are ignored; a candidate without any finite cell is never ranked
/// first. With a known key the rank is the partial guessing entropy of the key
/// byte, otherwise the top candidate is presumed correct and its rank counts
/// the candidates tying it.
#[derive(Debug, Clone, Default)]
pub struct RankTracker {
    known_key: Option<Vec<u8>>,
    subkeys: BTreeMap<usize, SubkeyStats>,
}

impl RankTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known_key(key: &[u8]) -> Self {
        Self {
            known_key: Some(key.to_vec()),
            subkeys: BTreeMap::new(),
        }
    }

    pub fn max_corr(&self, subkey: usize) -> Option<ArrayView1<'_, f64>> {
        self.subkeys.get(&subkey).map(|stats| stats.max_corr.view())
    }

    pub fn traces_seen(&self, subkey: usize) -> Option<usize> {
        self.subkeys.get(&subkey).map(|stats| stats.traces_seen)
    }

    /// Peak correlation of every candidate at every update, one column per
    /// checkpoint, together with the trace count of each checkpoint.
    pub fn history(&self, subkey: usize) -> Option<(&[usize], ArrayView2<'_, f64>)> {
        self.subkeys
            .get(&subkey)
            .map(|stats| (stats.checkpoints.as_slice(), stats.rank_slice.view()))
    }

    pub fn best_guess(&self, subkey: usize) -> Option<u8> {
        let stats = self.subkeys.get(&subkey)?;
        let mut init_value = f64::NEG_INFINITY;
        let mut guess = None;
        for (candidate, &value) in stats.max_corr.iter().enumerate() {
            if score(value) > init_value {
                init_value = value;
                guess = Some(candidate as u8);
            }
        }
        guess
    }

    /// Candidates by decreasing peak correlation, NaN last.
    pub fn ranked_candidates(&self, subkey: usize) -> Option<Vec<(u8, f64)>> {
        let stats = self.subkeys.get(&subkey)?;
        let mut ranked: Vec<(u8, f64)> = stats
            .max_corr
            .iter()
            .enumerate()
            .map(|(candidate, &value)| (candidate as u8, value))
            .collect();
        ranked.sort_by(|a, b| score(b.1).total_cmp(&score(a.1)));
        Some(ranked)
    }
}

impl Ranking for RankTracker {
    fn update(&mut self, subkey: usize, corr: ArrayView2<'_, f64>, traces_seen: usize) {
        let max_corr: Array1<f64> = corr.rows().into_iter().map(peak).collect();
        let stats = self.subkeys.entry(subkey).or_insert_with(|| SubkeyStats {
            max_corr: Array1::from_elem(corr.nrows(), f64::NAN),
            traces_seen: 0,
            checkpoints: Vec::new(),
            rank_slice: Array2::zeros((corr.nrows(), 0)),
        });
        stats.rank_slice = concatenate![
            Axis(1),
            stats.rank_slice,
            max_corr.view().insert_axis(Axis(1))
        ];
        stats.checkpoints.push(traces_seen);
        stats.max_corr = max_corr;
        stats.traces_seen = traces_seen;
    }

    fn current_rank(&self, subkey: usize) -> Option<usize> {
        let stats = self.subkeys.get(&subkey)?;
        let target = match self.known_key.as_ref().and_then(|key| key.get(subkey)) {
            Some(&key_byte) => key_byte as usize,
            None => match self.best_guess(subkey) {
                Some(best) => best as usize,
                None => return Some(GUESS_RANGE - 1),
            },
        };
        let target_value = stats.max_corr[target];
        if target_value.is_nan() {
            return Some(stats.max_corr.len() - 1);
        }
        let presumed = self.known_key.is_none();
        let rank = stats
            .max_corr
            .iter()
            .enumerate()
            .filter(|&(candidate, &value)| {
                candidate != target
                    && (score(value) > target_value || (presumed && score(value) == target_value))
            })
            .count();
        Some(rank)
    }
}

fn peak(row: ArrayView1<'_, f64>) -> f64 {
    row.iter()
        .filter(|c| !c.is_nan())
        .map(|c| c.abs())
        .fold(f64::NAN, f64::max)
}

fn score(value: f64) -> f64 {
    if value.is_nan() {
        f64::NEG_INFINITY
    } else {
        value
    }
}
