//! Calibrated power estimation: |x|², integrate over one logging period, convert to dB.

use crate::{config::SessionConfig, probe::RssiProbe, Sample};

/// Smallest mean power fed to the log, keeps an all-zero window finite
const POWER_FLOOR: f64 = 1e-20;

pub fn mag_squared(input: &[Sample], output: &mut Vec<f32>) {
    output.extend(input.iter().map(|x| x.norm_sqr()));
}

/// Sums `len` consecutive samples into one output. Partial windows carry over
/// between calls, so block sizes need not divide the window.
#[derive(Debug, Clone)]
pub struct Integrator {
    len: usize,
    acc: f64,
    count: usize,
}

impl Integrator {
    pub fn new(len: usize) -> Self {
        Self {
            len: len.max(1),
            acc: 0.0,
            count: 0,
        }
    }

    /// Window length in samples
    pub fn window(&self) -> usize {
        self.len
    }

    /// Samples accumulated in the current, unfinished window
    pub fn pending(&self) -> usize {
        self.count
    }

    pub fn process(&mut self, input: &[f32], output: &mut Vec<f64>) {
        for &x in input {
            self.acc += x as f64;
            self.count += 1;
            if self.count == self.len {
                output.push(self.acc);
                self.acc = 0.0;
                self.count = 0;
            }
        }
    }
}

/// `n * log10(x) + k`
#[derive(Debug, Clone, Copy)]
pub struct NLog10 {
    pub n: f32,
    pub k: f32,
}

impl NLog10 {
    pub fn apply(&self, x: f64) -> f32 {
        self.n * x.max(POWER_FLOOR).log10() as f32 + self.k
    }
}

/// The whole RSSI branch, publishing one estimate per completed window
pub struct PowerEstimator {
    integrator: Integrator,
    log: NLog10,
    probe: RssiProbe,
    power: Vec<f32>,
    sums: Vec<f64>,
}

impl PowerEstimator {
    pub fn new(integration_len: usize, offset_db: f32, probe: RssiProbe) -> Self {
        Self {
            integrator: Integrator::new(integration_len),
            log: NLog10 { n: 10.0, k: offset_db },
            probe,
            power: Vec::new(),
            sums: Vec::new(),
        }
    }

    pub fn from_config(config: &SessionConfig, probe: RssiProbe) -> Self {
        Self::new(config.integration_len(), config.rssi_offset_db(), probe)
    }

    /// Feed one block of channel samples, returning how many estimates were published
    pub fn process(&mut self, input: &[Sample]) -> usize {
        self.power.clear();
        self.sums.clear();
        mag_squared(input, &mut self.power);
        self.integrator.process(&self.power, &mut self.sums);
        let len = self.integrator.window() as f64;
        for &sum in &self.sums {
            let rssi = self.log.apply(sum / len);
            tracing::trace!(rssi, "Publishing RSSI");
            self.probe.publish(rssi);
        }
        self.sums.len()
    }
}
