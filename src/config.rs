use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Which end of the cipher the attacked key byte is mixed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyRound {
    First,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Iteration order of an attack run.
///
/// Breadth-first ingests one batch into every position before moving to the
/// next batch. Depth-first exhausts the corpus for one position before the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    #[default]
    BreadthFirst,
    DepthFirst,
}

impl FromStr for KeyRound {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first" | "0" => Ok(KeyRound::First),
            "last" | "-1" => Ok(KeyRound::Last),
            other => Err(Error::InvalidConfiguration(format!(
                "key round invalid: {other}"
            ))),
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enc" | "encrypt" => Ok(Direction::Encrypt),
            "dec" | "decrypt" => Ok(Direction::Decrypt),
            other => Err(Error::InvalidConfiguration(format!(
                "direction invalid: {other}"
            ))),
        }
    }
}

impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bf" | "breadth-first" => Ok(Schedule::BreadthFirst),
            "df" | "depth-first" => Ok(Schedule::DepthFirst),
            other => Err(Error::InvalidConfiguration(format!(
                "schedule invalid: {other}"
            ))),
        }
    }
}

macro_rules! string_conversions {
    ($ty:ty, $($variant:path => $name:literal),+) => {
        impl TryFrom<String> for $ty {
            type Error = Error;

            fn try_from(s: String) -> Result<Self> {
                s.parse()
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> String {
                match value {
                    $($variant => $name.to_string()),+
                }
            }
        }
    };
}

string_conversions!(KeyRound, KeyRound::First => "first", KeyRound::Last => "last");
string_conversions!(Direction, Direction::Encrypt => "enc", Direction::Decrypt => "dec");
string_conversions!(Schedule, Schedule::BreadthFirst => "bf", Schedule::DepthFirst => "df");

/// Picks the (plaintext slot, ciphertext slot) pair handed to the leakage model.
///
/// The known input of the attacked round lands in one slot and the other slot
/// is left empty: for a decryption the block fed to the device travels in the
/// `plaintext` column but is the cipher's ciphertext, so it moves slots.
pub fn select_inputs<'a>(
    key_round: KeyRound,
    direction: Direction,
    plaintext: &'a [u8],
    ciphertext: &'a [u8],
) -> (Option<&'a [u8]>, Option<&'a [u8]>) {
    match (key_round, direction) {
        (KeyRound::First, Direction::Encrypt) => (Some(plaintext), None),
        (KeyRound::First, Direction::Decrypt) => (None, Some(plaintext)),
        (KeyRound::Last, Direction::Encrypt) => (None, Some(ciphertext)),
        (KeyRound::Last, Direction::Decrypt) => (Some(ciphertext), None),
    }
}

/// Half-open range `[start, end)` of sample positions an attack looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleWindow {
    pub start: usize,
    pub end: usize,
}

impl SampleWindow {
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidConfiguration(format!(
                "empty sample window {start}..{end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn full(num_samples: usize) -> Self {
        Self {
            start: 0,
            end: num_samples,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Checks the window fits inside traces of `num_samples` samples.
    pub fn check(&self, num_samples: usize) -> Result<()> {
        if self.is_empty() || self.end > num_samples {
            return Err(Error::InvalidConfiguration(format!(
                "sample window {}..{} does not fit traces of {num_samples} samples",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

fn default_subkeys() -> Vec<usize> {
    (0..16).collect()
}

fn default_batch_size() -> usize {
    100
}

/// Parameters of a progressive attack run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttackConfig {
    #[serde(default = "default_subkeys")]
    pub subkeys: Vec<usize>,
    pub key_round: KeyRound,
    pub direction: Direction,
    /// Reporting interval: number of traces folded per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub skip_if_ranked: bool,
    #[serde(default)]
    pub windows: BTreeMap<usize, SampleWindow>,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            subkeys: default_subkeys(),
            key_round: KeyRound::First,
            direction: Direction::Encrypt,
            batch_size: default_batch_size(),
            schedule: Schedule::default(),
            skip_if_ranked: false,
            windows: BTreeMap::new(),
        }
    }
}

impl AttackConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: AttackConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfiguration(
                "batch size must be at least one trace".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for subkey in &self.subkeys {
            if !seen.insert(*subkey) {
                return Err(Error::InvalidConfiguration(format!(
                    "subkey {subkey} listed twice"
                )));
            }
        }
        for (subkey, window) in &self.windows {
            if window.is_empty() {
                return Err(Error::InvalidConfiguration(format!(
                    "empty sample window {}..{} for subkey {subkey}",
                    window.start, window.end
                )));
            }
        }
        Ok(())
    }

    pub fn window(&self, subkey: usize) -> Option<SampleWindow> {
        self.windows.get(&subkey).copied()
    }
}
