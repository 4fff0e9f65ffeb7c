use ndarray::{s, ArrayView1, ArrayView2, Axis};
use std::ops::Range;

use crate::error::{Error, Result};

/// Index-aligned views over traces and their input/output blocks.
///
/// Row `i` of every array belongs to trace `i`. The same type is used for a
/// whole corpus and for a batch cut from it.
#[derive(Debug, Clone, Copy)]
pub struct TraceCorpus<'a, T> {
    traces: ArrayView2<'a, T>,
    plaintexts: ArrayView2<'a, u8>,
    ciphertexts: ArrayView2<'a, u8>,
    known_keys: Option<ArrayView2<'a, u8>>,
}

impl<'a, T> TraceCorpus<'a, T> {
    pub fn new(
        traces: ArrayView2<'a, T>,
        plaintexts: ArrayView2<'a, u8>,
        ciphertexts: ArrayView2<'a, u8>,
    ) -> Result<Self> {
        let num_traces = traces.nrows();
        check_rows("plaintexts", plaintexts.nrows(), num_traces)?;
        check_rows("ciphertexts", ciphertexts.nrows(), num_traces)?;
        Ok(Self {
            traces,
            plaintexts,
            ciphertexts,
            known_keys: None,
        })
    }

    pub fn with_known_keys(mut self, known_keys: ArrayView2<'a, u8>) -> Result<Self> {
        check_rows("known keys", known_keys.nrows(), self.len())?;
        self.known_keys = Some(known_keys);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.traces.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of samples per trace
    pub fn num_samples(&self) -> usize {
        self.traces.ncols()
    }

    pub fn traces(&self) -> ArrayView2<'a, T> {
        self.traces
    }

    pub fn plaintexts(&self) -> ArrayView2<'a, u8> {
        self.plaintexts
    }

    pub fn ciphertexts(&self) -> ArrayView2<'a, u8> {
        self.ciphertexts
    }

    pub fn known_keys(&self) -> Option<ArrayView2<'a, u8>> {
        self.known_keys
    }

    pub fn plaintext(&self, index: usize) -> ArrayView1<'a, u8> {
        self.plaintexts.index_axis_move(Axis(0), index)
    }

    pub fn ciphertext(&self, index: usize) -> ArrayView1<'a, u8> {
        self.ciphertexts.index_axis_move(Axis(0), index)
    }

    pub fn known_key(&self, index: usize) -> Option<ArrayView1<'a, u8>> {
        self.known_keys
            .map(|keys| keys.index_axis_move(Axis(0), index))
    }

    pub fn has_known_keys(&self) -> bool {
        self.known_keys.is_some()
    }

    /// Views the traces in `range`.
    ///
    /// # Panics
    /// Panics if `range` is out of bounds.
    pub fn batch(&self, range: Range<usize>) -> TraceCorpus<'a, T> {
        TraceCorpus {
            traces: self.traces.slice_move(s![range.clone(), ..]),
            plaintexts: self.plaintexts.slice_move(s![range.clone(), ..]),
            ciphertexts: self.ciphertexts.slice_move(s![range.clone(), ..]),
            known_keys: self.known_keys.map(|keys| keys.slice_move(s![range, ..])),
        }
    }
}

fn check_rows(what: &str, rows: usize, num_traces: usize) -> Result<()> {
    if rows != num_traces {
        return Err(Error::ShapeMismatch(format!(
            "{rows} {what} for {num_traces} traces"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_shape_mismatch() {
        let traces = Array2::<i16>::zeros((10, 4));
        let blocks = Array2::<u8>::zeros((10, 16));
        let short = Array2::<u8>::zeros((9, 16));
        assert!(matches!(
            TraceCorpus::new(traces.view(), short.view(), blocks.view()),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(matches!(
            TraceCorpus::new(traces.view(), blocks.view(), short.view()),
            Err(Error::ShapeMismatch(_))
        ));
        let corpus = TraceCorpus::new(traces.view(), blocks.view(), blocks.view()).unwrap();
        assert!(matches!(
            corpus.with_known_keys(short.view()),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_batch() {
        let traces = Array2::from_shape_fn((10, 3), |(i, j)| (i * 10 + j) as i16);
        let plaintexts = Array2::from_shape_fn((10, 16), |(i, _)| i as u8);
        let corpus = TraceCorpus::new(traces.view(), plaintexts.view(), plaintexts.view())
            .unwrap()
            .with_known_keys(plaintexts.view())
            .unwrap();
        let batch = corpus.batch(4..7);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.num_samples(), 3);
        assert_eq!(batch.traces()[[0, 2]], 42);
        assert_eq!(batch.plaintext(2)[0], 6);
        assert_eq!(batch.known_key(1).map(|k| k[5]), Some(5));
    }

    #[test]
    fn test_rows_outlive_corpus() {
        let traces = Array2::<i16>::zeros((4, 2));
        let blocks = Array2::from_shape_fn((4, 16), |(i, j)| (i * 16 + j) as u8);
        let (plaintext, ciphertext, known_key) = {
            let corpus = TraceCorpus::new(traces.view(), blocks.view(), blocks.view())
                .unwrap()
                .with_known_keys(blocks.view())
                .unwrap();
            (corpus.plaintext(1), corpus.ciphertext(2), corpus.known_key(3))
        };
        assert_eq!(plaintext[0], 16);
        assert_eq!(ciphertext[1], 33);
        assert_eq!(known_key.map(|k| k[15]), Some(63));
    }
}
