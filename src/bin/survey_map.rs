use std::{fs::File, io::BufReader};

use clap::Parser;
use rssi_survey::{
    args::{convert_filter, MapArgs},
    survey::{output_path, parse_log, SurveyError, SurveyMap},
};
use tracing::{error, info};

fn run(args: &MapArgs) -> Result<(), SurveyError> {
    let (points, stats) = parse_log(BufReader::new(File::open(&args.log)?))?;
    info!(
        lines = stats.lines,
        sentences = stats.sentences,
        valid = stats.valid,
        "Parsed survey log"
    );
    let map = SurveyMap::from_points(points)?;
    println!("RSSI_max = {} dBm", map.rssi_max());
    println!("RSSI_min = {} dBm", map.rssi_min());

    let out = args
        .output
        .clone()
        .unwrap_or_else(|| output_path(&args.log));
    map.write_html(&out)?;
    println!("Map written to {}", out.display());
    Ok(())
}

fn main() {
    let args = MapArgs::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = run(&args) {
        error!("{}", e);
        std::process::exit(1);
    }
}
