use anyhow::{Context, Result};
use gnuplot::{Figure, PlotOption::Caption};
use ndarray::Array2;
use ndarray_npy::read_npy;
use scabox::{
    attack::{Attack, AttackConfig},
    leakage_model::aes::Aes128,
    trace::{ChannelEntry, Trace, unzip},
    util::chipwhisperer_float_to_u16,
};
use std::{env, iter::zip, path::PathBuf};

fn main() -> Result<()> {
    let traces_dir =
        PathBuf::from(env::var("TRACES_DIR").context("Missing TRACES_DIR environment variable")?);

    let traces: Array2<f64> =
        read_npy(traces_dir.join("traces.npy")).context("Failed to read traces.npy")?;
    let plaintexts: Array2<u8> =
        read_npy(traces_dir.join("plaintexts.npy")).context("Failed to read plaintexts.npy")?;
    anyhow::ensure!(
        traces.shape()[0] == plaintexts.shape()[0],
        "{} traces for {} plaintexts",
        traces.shape()[0],
        plaintexts.shape()[0]
    );

    let config = match env::var("ATTACK_CONFIG") {
        Ok(path) => AttackConfig::load(&path).with_context(|| format!("Failed to read {path}"))?,
        Err(_) => AttackConfig::default(),
    };

    let records: Vec<Trace<u16>> = zip(traces.rows(), plaintexts.rows())
        .map(|(trace, plaintext)| {
            Trace::new(
                trace.mapv(chipwhisperer_float_to_u16),
                ChannelEntry::new(plaintext.to_vec(), vec![], vec![]),
            )
        })
        .collect();
    let (leakages, channel) = unzip(records);

    let mut attack = Attack::new(Aes128, config)?;
    let guess = attack.run(&leakages, &channel)?;
    println!("Key guess: {guess}");
    if let Some(num_traces) = attack.statistics().stable_since() {
        println!("Stable since {num_traces} traces");
    }

    // Let's plot correlation coefficients of the best guess of each byte
    let mut fg = Figure::new();
    let axes = fg.axes2d();
    for ((byte, cpa), (_, stats)) in zip(attack.correlations(), &guess.bytes) {
        let corr = cpa.guess_corr(stats.guess);
        axes.lines(
            0..corr.len(),
            corr,
            &[Caption(&format!("Byte {byte}: 0x{:02x}", stats.guess))],
        );
    }
    fg.show()?;

    Ok(())
}
