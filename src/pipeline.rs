//! The streaming dataflow graph.
//!
//! ```text
//! capture --rtrb--> channel --+--crossbeam--> demod -> audio chain -> sink
//!                             +--crossbeam--> power estimator -> probe
//! ```
//!
//! Each arrow is a bounded queue and each box a thread. Queues between stages are
//! only ever written with non-blocking pushes: when a consumer falls behind its
//! blocks are dropped and counted, upstream never waits.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    audio::{AudioChain, AudioError, AudioSink},
    capture::{capture_samples, CaptureError, SampleSource},
    channel::ChannelSelector,
    config::{ConfigError, SessionConfig},
    demod::FmDemodulator,
    filter::FilterError,
    monitoring::{PipelineStats, StatsSnapshot},
    power::PowerEstimator,
    probe::RssiProbe,
    Sample, BLOCK_SIZE,
};

/// Blocks queued per branch after the channel selector
const BRANCH_DEPTH: usize = 64;
/// How long the channel thread naps when the ring is empty
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// A channel block shared read-only by both branches
pub type Block = Arc<[Sample]>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("could not start sample source: {0}")]
    Capture(#[from] CaptureError),
    #[error("filter design failed: {0}")]
    Filter(#[from] FilterError),
    #[error("could not start audio: {0}")]
    Audio(#[from] AudioError),
    #[error("could not spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

/// What happened to each thread, collected at shutdown
#[derive(Debug)]
pub struct PipelineReport {
    pub stats: StatsSnapshot,
    pub capture: Result<(), CaptureError>,
    pub audio: Result<(), AudioError>,
}

pub struct Pipeline {
    stop: Arc<AtomicBool>,
    capture_done: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    probe: RssiProbe,
    capture: JoinHandle<Result<(), CaptureError>>,
    channel: JoinHandle<()>,
    power: JoinHandle<()>,
    audio: JoinHandle<Result<(), AudioError>>,
}

impl Pipeline {
    /// Configure the source, build every stage and start the threads.
    ///
    /// `capacity` is the number of source blocks the capture ring can hold.
    pub fn start(
        config: &SessionConfig,
        mut source: Box<dyn SampleSource>,
        sink: Box<dyn AudioSink>,
        capacity: usize,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        source.configure(config.src_samp_rate, config.tuned_freq(), config.src_gain_db)?;

        let selector = ChannelSelector::from_config(config)?;
        let demod = FmDemodulator::from_config(config)?;
        let audio = AudioChain::from_config(config, sink)?;
        let probe = RssiProbe::new();
        let power = PowerEstimator::from_config(config, probe.clone());

        let stop = Arc::new(AtomicBool::new(false));
        let capture_done = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PipelineStats::default());
        let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(1));
        let (audio_tx, audio_rx) = bounded::<Block>(BRANCH_DEPTH);
        let (power_tx, power_rx) = bounded::<Block>(BRANCH_DEPTH);

        let audio = thread::Builder::new()
            .name("demod".to_owned())
            .spawn(move || run_audio(audio_rx, demod, audio))?;

        let power = {
            let stats = stats.clone();
            thread::Builder::new()
                .name("power".to_owned())
                .spawn(move || {
                    let mut power = power;
                    for block in power_rx {
                        stats.rssi_published(power.process(&block));
                    }
                })?
        };

        let channel = {
            let (stats, done) = (stats.clone(), capture_done.clone());
            thread::Builder::new()
                .name("channel".to_owned())
                .spawn(move || run_channel(consumer, selector, audio_tx, power_tx, &done, &stats))?
        };

        let capture = {
            let (stats, stop, done) = (stats.clone(), stop.clone(), capture_done.clone());
            thread::Builder::new()
                .name("capture".to_owned())
                .spawn(move || {
                    let res = capture_samples(source, producer, &stop, &stats);
                    if let Err(e) = &res {
                        error!("Sample capture failed - {}", e);
                    }
                    done.store(true, Ordering::Release);
                    res
                })?
        };

        info!(
            tuned = config.tuned_freq(),
            rate = config.src_samp_rate,
            "Streaming pipeline started"
        );
        Ok(Self {
            stop,
            capture_done,
            stats,
            probe,
            capture,
            channel,
            power,
            audio,
        })
    }

    /// Handle to the latest RSSI estimate
    pub fn probe(&self) -> RssiProbe {
        self.probe.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// False once the source has run dry or failed
    pub fn is_capturing(&self) -> bool {
        !self.capture_done.load(Ordering::Acquire)
    }

    /// Stop capturing and wait for every stage to wind down
    pub fn stop(self) -> Result<PipelineReport, PipelineError> {
        self.stop.store(true, Ordering::Relaxed);
        self.wait()
    }

    /// Wait for the source to end on its own, then for every stage to wind down
    pub fn wait(self) -> Result<PipelineReport, PipelineError> {
        let capture = self
            .capture
            .join()
            .map_err(|_| PipelineError::Panicked("capture"))?;
        self.channel
            .join()
            .map_err(|_| PipelineError::Panicked("channel"))?;
        self.power
            .join()
            .map_err(|_| PipelineError::Panicked("power"))?;
        let audio = self
            .audio
            .join()
            .map_err(|_| PipelineError::Panicked("demod"))?;
        Ok(PipelineReport {
            stats: self.stats.snapshot(),
            capture,
            audio,
        })
    }
}

/// Pop source blocks, select the channel and fan the result out to both branches.
///
/// Complete blocks still queued when capture ends are processed; then the branch
/// senders are dropped, which ends the branch threads.
fn run_channel(
    mut consumer: rtrb::Consumer<Vec<Sample>>,
    mut selector: ChannelSelector,
    audio_tx: Sender<Block>,
    power_tx: Sender<Block>,
    capture_done: &AtomicBool,
    stats: &PipelineStats,
) {
    let mut audio_tx = Some(audio_tx);
    let mut out = Vec::with_capacity(BLOCK_SIZE);
    loop {
        let raw = match consumer.pop() {
            Ok(raw) => raw,
            Err(_) if capture_done.load(Ordering::Acquire) => match consumer.pop() {
                Ok(raw) => raw,
                Err(_) => break,
            },
            Err(_) => {
                thread::sleep(IDLE_WAIT);
                continue;
            }
        };
        out.clear();
        selector.process(&raw, &mut out);
        let block: Block = Arc::from(&out[..]);

        if let Some(tx) = &audio_tx {
            match tx.try_send(block.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => stats.audio_drop(),
                Err(TrySendError::Disconnected(_)) => {
                    warn!("Audio branch has stopped, continuing without audio");
                    audio_tx = None;
                }
            }
        }
        match power_tx.try_send(block) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => stats.power_drop(),
            Err(TrySendError::Disconnected(_)) => {
                error!("Power branch has stopped");
                break;
            }
        }
    }
}

fn run_audio(
    rx: Receiver<Block>,
    mut demod: FmDemodulator,
    mut chain: AudioChain,
) -> Result<(), AudioError> {
    let mut pcm = Vec::with_capacity(BLOCK_SIZE);
    for block in rx {
        pcm.clear();
        demod.process(&block, &mut pcm);
        if let Err(e) = chain.process(&pcm) {
            error!("Audio output failed, RSSI logging continues - {}", e);
            return Err(e);
        }
    }
    chain.finish()
}
