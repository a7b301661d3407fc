use chrono::Utc;
use clap::Parser;
use crossbeam_channel::bounded;
use rssi_survey::{
    args::{convert_filter, Args},
    audio::{open_sink, AudioError},
    capture::{open_source, CaptureError},
    config::{ConfigError, SessionConfig},
    gps::{GpsError, GpsSensor, NmeaSensor, NoGps},
    pipeline::{Pipeline, PipelineError},
    telemetry::{create_log, TelemetryError, TelemetryLogger},
};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
enum DriveError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("could not open GPS: {0}")]
    Gps(#[from] GpsError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("could not install the ctrl-c handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

fn print_settings(args: &Args, config: &SessionConfig) {
    eprintln!("Receiver args \"{}\"", args.args);
    eprintln!("RX frequency = {} MHz", config.rx_freq / 1e6);
    eprintln!("Tuned frequency = {} MHz", config.tuned_freq() / 1e6);
    eprintln!("Source sample rate = {} Hz", config.src_samp_rate);
    eprintln!("Receiver gain = {} dB", config.src_gain_db);
    eprintln!("RSSI cal offset = {} dB", config.rssi_cal_offset_db);
    eprintln!("Audio volume = {} dB", config.volume_db);
    eprintln!("Sound card rate = {} Hz", config.snd_card_rate);
    eprintln!("Log directory = {}", config.log_dir.display());
}

fn run(args: &Args) -> Result<(), DriveError> {
    let config = args.session_config();
    config.validate()?;
    if args.verbose.log_level_filter() > log::LevelFilter::Error {
        print_settings(args, &config);
    }

    let source = open_source(&args.args)?;
    let sink = open_sink(args.audio.as_deref(), config.snd_card_rate as u32)?;
    // Records go to stderr instead when stdout carries audio
    let audio_on_stdout = args.audio.as_deref() == Some("-");

    let gps: Box<dyn GpsSensor> = match &args.gps {
        Some(path) => {
            let pace = args.gps_replay.then(|| config.log_period);
            Box::new(NmeaSensor::open(path, pace)?)
        }
        None => {
            warn!("No GPS given, positions will be logged as unavailable");
            Box::new(NoGps)
        }
    };

    let (path, file) = create_log(&config.log_dir, config.rx_freq, &Utc::now())?;
    info!(path = %path.display(), "Logging to file");

    let (shutdown_tx, shutdown_rx) = bounded(1);
    let source_done = shutdown_tx.clone();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })?;

    // Started last, nothing above may fail with the threads running
    let pipeline = Pipeline::start(&config, source, sink, args.capacity)?;

    let mut logger = TelemetryLogger::new(gps, pipeline.probe(), file, &config);
    let logged = logger.run(&shutdown_rx, |record| {
        if audio_on_stdout {
            eprintln!("{}", record);
        } else {
            println!("{}", record);
        }
        pipeline.stats().log_debug();
        if !pipeline.is_capturing() {
            info!("Sample source finished, stopping");
            let _ = source_done.try_send(());
        }
    });

    let report = pipeline.stop()?;
    report.stats.log_summary();
    if let Err(e) = &report.audio {
        warn!("Audio output stopped early - {}", e);
    }
    logged?;
    report.capture?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = run(&args) {
        error!("{}", e);
        std::process::exit(1);
    }
}
