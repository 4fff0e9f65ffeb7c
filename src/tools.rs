use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, ArrayView2};
use ndarray_npy::{ReadNpyExt, ReadableElement, WritableElement, WriteNpyExt};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

pub fn read_array_2_from_npy_file<T: ReadableElement, P: AsRef<Path>>(
    path: P,
) -> Result<Array2<T>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(Array2::<T>::read_npy(reader)?)
}

pub fn write_array<T: WritableElement, P: AsRef<Path>>(path: P, ar: ArrayView2<T>) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    ar.write_npy(writer)?;
    Ok(())
}

/// Creates a [`ProgressBar`] with a predefined default style.
pub fn progress_bar(len: u64) -> ProgressBar {
    let style = ProgressStyle::with_template("{elapsed_precise} {wide_bar} {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let progress_bar = ProgressBar::new(len).with_style(style);
    progress_bar.enable_steady_tick(Duration::from_millis(100));
    progress_bar
}
