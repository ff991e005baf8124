use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use mdm::{init_tracing, Mdm, MdmConfig};
use tracing::{info, warn};

const USAGE: &str = "usage: mdm <config.yaml> <records.ndjson>";

fn main() -> Result<ExitCode> {
    let args: Vec<String> = env::args().skip(1).collect();
    let [config_path, records_path] = args.as_slice() else {
        eprintln!("{USAGE}");
        return Ok(ExitCode::from(2));
    };

    let config = MdmConfig::from_file(config_path)
        .with_context(|| format!("loading {config_path}"))?;
    let _logging = init_tracing(&config.logging)?;
    let mdm = Mdm::from_config(config)?;

    let reader = BufReader::new(
        File::open(records_path).with_context(|| format!("opening {records_path}"))?,
    );
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let (mut records, mut events, mut failed) = (0usize, 0usize, 0usize);

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading {records_path}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let resource: serde_json::Value = match serde_json::from_str(&line) {
            Ok(resource) => resource,
            Err(err) => {
                warn!(line = line_no, error = %err, "invalid_json_line");
                failed += 1;
                continue;
            }
        };
        records += 1;
        match mdm.submit_json(&resource) {
            Ok(Some(event)) => {
                serde_json::to_writer(&mut out, &event)?;
                writeln!(out)?;
                events += 1;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(line = line_no, error = %err, "record_rejected");
                failed += 1;
            }
        }
    }
    out.flush()?;

    info!(records, events, failed, "input_processed");
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
