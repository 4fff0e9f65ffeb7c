use clap::{Parser, ValueEnum};
use ndarray::Array2;
use ndarray_npy::ReadableElement;
use num_traits::AsPrimitive;
use progressive_cpa::leakage::{HdLastRoundState, HwInvSboxOutput, HwSboxOutput, HwTweakedSboxOutput};
use progressive_cpa::tools::{read_array_2_from_npy_file, write_array};
use progressive_cpa::{
    AttackConfig, BarProgress, Error, LeakageModel, ProgressiveCpa, RankTracker, Ranking,
    TraceCorpus,
};
use std::error;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Progressive CPA on AES key bytes")]
struct Args {
    /// Traces, one row per trace (.npy)
    #[arg(long)]
    traces: PathBuf,
    /// Input blocks fed to the device, one row per trace (.npy, u8)
    #[arg(long)]
    plaintexts: PathBuf,
    /// Output blocks, one row per trace (.npy, u8)
    #[arg(long)]
    ciphertexts: Option<PathBuf>,
    /// Per-trace known key material (.npy, u8)
    #[arg(long)]
    known_keys: Option<PathBuf>,
    /// Attack parameters (JSON); defaults attack all 16 bytes of the first round
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Model::HwSbox)]
    model: Model,
    #[arg(long, value_enum, default_value_t = TraceFormat::I16)]
    trace_format: TraceFormat,
    /// Correct key in hex, used to report the rank of each key byte
    #[arg(long)]
    known_key: Option<String>,
    #[arg(long, default_value = "results")]
    output_dir: PathBuf,
    #[arg(long, default_value = "info")]
    log: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Model {
    HwSbox,
    HwInvSbox,
    HdLastRound,
    HwTweakedSbox,
}

impl Model {
    fn leakage_model(self) -> Box<dyn LeakageModel> {
        match self {
            Model::HwSbox => Box::new(HwSboxOutput),
            Model::HwInvSbox => Box::new(HwInvSboxOutput),
            Model::HdLastRound => Box::new(HdLastRoundState),
            Model::HwTweakedSbox => Box::new(HwTweakedSboxOutput),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TraceFormat {
    I16,
    F32,
    F64,
}

fn parse_hex(key: &str) -> Result<Vec<u8>, Error> {
    let key = key.trim_start_matches("0x");
    if !key.is_ascii() || key.len() % 2 != 0 {
        return Err(Error::InvalidConfiguration(format!(
            "key must be an even number of hex digits, got {key}"
        )));
    }
    (0..key.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&key[i..i + 2], 16).map_err(|e| {
                Error::InvalidConfiguration(format!("invalid hex key {key}: {e}"))
            })
        })
        .collect()
}

/* Without a known key every position ranks its own top candidate first */
fn skips_on_presumed_rank(config: &AttackConfig, known_key: Option<&str>) -> bool {
    config.skip_if_ranked && known_key.is_none()
}

fn cpa<T>(args: &Args, config: &AttackConfig) -> Result<(), Box<dyn error::Error>>
where
    T: ReadableElement + AsPrimitive<f64>,
{
    let leakages: Array2<T> = read_array_2_from_npy_file(&args.traces)?;
    let plaintexts: Array2<u8> = read_array_2_from_npy_file(&args.plaintexts)?;
    /* Without output blocks, models reading the ciphertext slot fail */
    let ciphertexts: Array2<u8> = match &args.ciphertexts {
        Some(path) => read_array_2_from_npy_file(path)?,
        None => Array2::zeros((leakages.nrows(), 0)),
    };
    let known_keys: Option<Array2<u8>> = args
        .known_keys
        .as_ref()
        .map(read_array_2_from_npy_file)
        .transpose()?;

    let mut corpus = TraceCorpus::new(leakages.view(), plaintexts.view(), ciphertexts.view())?;
    if let Some(keys) = &known_keys {
        corpus = corpus.with_known_keys(keys.view())?;
    }

    let mut ranking = match &args.known_key {
        Some(key) => RankTracker::with_known_key(&parse_hex(key)?),
        None => RankTracker::new(),
    };
    let model = args.model.leakage_model();
    let progress = BarProgress::new();
    let mut attack = ProgressiveCpa::new();
    let summary = attack.run(&corpus, config, &*model, &progress, &mut ranking)?;
    progress.finish();

    std::fs::create_dir_all(&args.output_dir)?;
    for subkey in attack.subkeys() {
        if let Some(corr) = attack.correlation_matrix(subkey) {
            write_array(args.output_dir.join(format!("corr_{subkey:02}.npy")), corr.view())?;
        }
        let guess = ranking
            .best_guess(subkey)
            .map_or_else(|| "--".to_string(), |g| format!("{g:02x}"));
        let rank = ranking
            .current_rank(subkey)
            .map_or_else(|| "-".to_string(), |r| r.to_string());
        println!(
            "subkey {subkey:2}: guess {guess}  rank {rank}  traces {}",
            attack.traces_seen(subkey)
        );
    }
    info!(
        batches = summary.batches,
        skipped = ?summary.skipped,
        output = %args.output_dir.display(),
        "results saved in .npy"
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn error::Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .init();

    let config = match &args.config {
        Some(path) => AttackConfig::from_json_file(path)?,
        None => AttackConfig::default(),
    };

    if skips_on_presumed_rank(&config, args.known_key.as_deref()) {
        warn!("skip_if_ranked without --known-key ranks against the current top candidate; positions will likely stop after their first batch");
    }

    let t = Instant::now();
    match args.trace_format {
        TraceFormat::I16 => cpa::<i16>(&args, &config)?,
        TraceFormat::F32 => cpa::<f32>(&args, &config)?,
        TraceFormat::F64 => cpa::<f64>(&args, &config)?,
    }
    info!(elapsed = ?t.elapsed(), "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("2b7e").unwrap(), vec![0x2b, 0x7e]);
        assert_eq!(parse_hex("0x00ff").unwrap(), vec![0x00, 0xff]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_skip_policy_without_known_key() {
        let mut config = AttackConfig::default();
        assert!(!skips_on_presumed_rank(&config, None));
        config.skip_if_ranked = true;
        assert!(skips_on_presumed_rank(&config, None));
        assert!(!skips_on_presumed_rank(&config, Some("2b7e151628aed2a6abf7158809cf4f3c")));
    }
}
