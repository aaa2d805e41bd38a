use std::time::Duration;

use anyhow::{bail, Context, Result};
use p2p_sim::loopback::{self, LoopbackConfig};
use p2p_transport::config::LinkConfig;

const USAGE: &str = "usage: p2p_loopback [--packets N] [--seed S] [--config link.toml] \
[--drop P] [--corrupt P] [--spurious P] [--cut P] [--cut-length N] \
[--min-payload N] [--max-payload N] [--time-limit SECS] [--pretty]";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut cfg = LoopbackConfig::default();
    let mut pretty = false;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        let mut value = || args.next().with_context(|| format!("missing {arg} value"));
        match arg.as_str() {
            "--packets" => cfg.packets = value()?.parse()?,
            "--seed" => {
                let seed = value()?.parse()?;
                cfg.seed = seed;
                cfg.impairment.seed = seed;
            }
            "--config" => {
                let path = value()?;
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {path}"))?;
                cfg.link = LinkConfig::from_toml_str(&text)
                    .with_context(|| format!("parsing {path}"))?;
            }
            "--drop" => cfg.impairment.drop_probability = value()?.parse()?,
            "--corrupt" => cfg.impairment.corrupt_probability = value()?.parse()?,
            "--spurious" => cfg.impairment.spurious_start_probability = value()?.parse()?,
            "--cut" => cfg.impairment.cut_probability = value()?.parse()?,
            "--cut-length" => cfg.impairment.cut_length = value()?.parse()?,
            "--min-payload" => cfg.min_payload = value()?.parse()?,
            "--max-payload" => cfg.max_payload = value()?.parse()?,
            "--time-limit" => cfg.time_limit = Duration::try_from_secs_f64(value()?.parse()?)?,
            "--pretty" => pretty = true,
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            other => bail!("unknown argument {other}\n{USAGE}"),
        }
    }

    let report = loopback::run(&cfg)?;
    let json = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");
    Ok(())
}
