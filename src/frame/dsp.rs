/*
 *  Copyright (C) 2025 Pierre Contributors
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Per-channel spectral analysis and the worker pool that runs it.
//!
//! Each channel gets DC removal, a Hann or Blackman-Harris window and a
//! forward real FFT. Local maxima of the magnitude spectrum become peaks:
//! magnitude is `|a - 2b + c|` around the peak bin, frequency comes from
//! parabolic interpolation of the same three bins. Both channels of a frame
//! are processed sequentially within one task so the decoder context stays
//! single threaded.

use crate::{
    config::WindowConfig,
    error::FrameResult,
    frame::{
        Frame,
        av::{Av, Decoded, decipher},
        peaks::{Channel, Peak, Peaks},
        state::FrameState,
    },
    stats::Stats,
    time::InputInfo,
};
use crossbeam::channel::{Receiver, Sender, bounded};
use realfft::{RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};
use thread_priority::{ThreadPriority, set_current_thread_priority};
use tracing::{debug, error, info, warn};

const JOB_QUEUE_DEPTH: usize = 64;

pub struct Dsp {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    n: usize,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    mags: Vec<f32>,
}

impl Dsp {
    pub fn new(n: usize, window: WindowConfig) -> Self {
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(n);
        let input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();
        Self {
            fft,
            window: window_weights(n, window),
            n,
            input,
            spectrum,
            mags: vec![0.0; n / 2 + 1],
        }
    }

    /// Analyze both channels of a decoded frame.
    pub fn find_peaks(&mut self, decoded: &Decoded) -> Peaks {
        let mut peaks = Peaks::new();
        for ch in 0..decoded.info.channels.min(2) {
            let channel = if ch == 0 { Channel::Left } else { Channel::Right };
            self.process_channel(decoded.channel(ch), &mut peaks, channel);
        }
        peaks
    }

    fn process_channel(&mut self, samples: &[f32], peaks: &mut Peaks, channel: Channel) {
        let take = samples.len().min(self.n);
        self.input[..take].copy_from_slice(&samples[..take]);
        self.input[take..].fill(0.0);

        let mean = self.input.iter().sum::<f32>() / self.n as f32;
        for (value, weight) in self.input.iter_mut().zip(&self.window) {
            *value = (*value - mean) * weight;
        }

        if self.fft.process(&mut self.input, &mut self.spectrum).is_err() {
            warn!("FFT failed for {channel:?}");
            return;
        }

        let scale = 128.0 / self.n as f32;
        for (mag, bin) in self.mags.iter_mut().zip(&self.spectrum) {
            *mag = bin.norm() * scale;
        }

        for i in 1..self.n / 2 {
            let a = self.mags[i - 1];
            let b = self.mags[i];
            let c = self.mags[i + 1];
            if a < b && b > c {
                let mag = (a - 2.0 * b + c).abs();
                peaks.insert(channel, Peak::new(self.freq_at(i), mag));
            }
        }
    }

    fn freq_at(&self, i: usize) -> f32 {
        let a = self.mags[i - 1];
        let b = self.mags[i];
        let c = self.mags[i + 1];

        let delta = 0.5 * ((a - c) / (a - 2.0 * b + c));
        let rate = InputInfo::RATE as f32;
        if i == self.n / 2 {
            (i as f32 + delta) * rate / self.n as f32
        } else {
            (i as f32 + delta) * rate / (self.n as f32 - 1.0)
        }
    }
}

fn window_weights(n: usize, window: WindowConfig) -> Vec<f32> {
    use std::f32::consts::TAU;
    let last = (n - 1) as f32;
    (0..n)
        .map(|i| {
            let ratio = i as f32 / last;
            match window {
                WindowConfig::Hann => 0.5 * (1.0 - (TAU * ratio).cos()),
                WindowConfig::BlackmanHarris => {
                    0.35875 - 0.48829 * (TAU * ratio).cos() + 0.14128 * (2.0 * TAU * ratio).cos()
                        - 0.01168 * (3.0 * TAU * ratio).cos()
                }
            }
        })
        .collect()
}

/// One unit of work: a header-parsed frame and its raw packet bytes.
pub struct DspJob {
    pub frame: Arc<Frame>,
    pub packet: Vec<u8>,
    pub key: [u8; 32],
}

/// Fixed-size pool of OS threads running decipher, decode and DSP. Sized by
/// `available_parallelism * factor`, never below one. Frame state is
/// re-checked before each phase so a flush short-circuits obsolete work.
pub struct DspPool {
    tx: Option<Sender<DspJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl DspPool {
    pub fn new(factor: f32, window: WindowConfig, stats: Stats) -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        let count = ((cores as f32 * factor) as usize).max(1);
        info!("starting {count} DSP worker(s) ({cores} cores x {factor})");

        let (tx, rx) = bounded::<DspJob>(JOB_QUEUE_DEPTH);
        let workers = (0..count)
            .map(|i| {
                let rx = rx.clone();
                let stats = stats.clone();
                thread::Builder::new()
                    .name(format!("dsp-{i}"))
                    .spawn(move || worker(rx, window, stats))
            })
            .filter_map(|r| r.ok())
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Hand a frame to the pool. A full queue means the pool has fallen
    /// behind the stream; the frame is already late by the time a slot
    /// would free up, so it is dropped as outdated.
    pub fn dispatch(&self, job: DspJob) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(crossbeam::channel::TrySendError::Full(job)) => {
                warn!("DSP queue full, dropping frame sn={}", job.frame.seq_num);
                job.frame.state_handle().terminate(FrameState::Outdated);
                false
            }
            Err(crossbeam::channel::TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn shutdown(mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            worker.join().ok();
        }
        info!("DSP pool stopped.");
    }
}

impl Drop for DspPool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            worker.join().ok();
        }
    }
}

fn worker(rx: Receiver<DspJob>, window: WindowConfig, stats: Stats) {
    if set_current_thread_priority(ThreadPriority::Max).is_err() {
        debug!("could not raise DSP worker priority");
    }

    let mut av = match Av::new() {
        Ok(it) => it,
        Err(e) => {
            error!("could not create decoder context: {e}");
            for job in rx {
                job.frame.state_handle().terminate(FrameState::DecodeFail);
            }
            return;
        }
    };
    let mut dsp = Dsp::new(InputInfo::FRAMES_PER_PACKET as usize, window);

    for job in rx {
        if let Err(e) = process_job(&job, &mut av, &mut dsp, &stats) {
            debug!("frame sn={} dropped: {e}", job.frame.seq_num);
        }
    }
}

fn process_job(job: &DspJob, av: &mut Av, dsp: &mut Dsp, stats: &Stats) -> FrameResult<()> {
    let frame = &job.frame;

    // flushed or outdated while queued
    if frame.state() != FrameState::HeaderParsed {
        return Ok(());
    }

    let payload = match decipher(frame, &job.packet, &job.key) {
        Ok(it) => it,
        Err(e) => {
            stats.incr(|s| &s.decipher_failures);
            frame.state_handle().terminate(FrameState::DecipherFail);
            return Err(e);
        }
    };
    if !frame
        .state_handle()
        .transition(FrameState::HeaderParsed, FrameState::Deciphered)
    {
        return Ok(());
    }
    stats.incr(|s| &s.frames_deciphered);

    let decoded = match av.decode(&payload) {
        Ok(it) => it,
        Err(e) => {
            stats.incr(|s| &s.decode_failures);
            frame.state_handle().terminate(FrameState::DecodeFail);
            return Err(e);
        }
    };
    frame.save_sample_info(decoded.info);
    if !frame
        .state_handle()
        .transition(FrameState::Deciphered, FrameState::Decoded)
    {
        return Ok(());
    }
    stats.incr(|s| &s.frames_decoded);

    if !frame
        .state_handle()
        .transition(FrameState::Decoded, FrameState::DspInProgress)
    {
        return Ok(());
    }

    let peaks = dsp.find_peaks(&decoded);
    frame.set_peaks(peaks);

    if frame
        .state_handle()
        .transition(FrameState::DspInProgress, FrameState::DspComplete)
    {
        stats.incr(|s| &s.frames_dsp_complete);
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::frame::SampleInfo;
    use std::f32::consts::TAU;

    fn sine(freq: f32, amplitude: f32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| amplitude * (TAU * freq * i as f32 / InputInfo::RATE as f32).sin())
            .collect()
    }

    fn stereo(samples: Vec<f32>) -> Decoded {
        let n = samples.len();
        let mut planar = samples.clone();
        planar.extend_from_slice(&samples);
        Decoded {
            samples: planar,
            info: SampleInfo {
                channels: 2,
                samp_per_ch: n,
            },
        }
    }

    #[test]
    fn full_scale_tone_peaks_at_its_frequency() {
        let mut dsp = Dsp::new(1024, WindowConfig::Hann);
        let decoded = stereo(sine(1_000.0, 1.0, 1024));
        let peaks = dsp.find_peaks(&decoded);

        for channel in [Channel::Left, Channel::Right] {
            let major = peaks.major(channel).unwrap();
            assert!(
                (990.0..1010.0).contains(&major.freq),
                "freq={}",
                major.freq
            );
            assert!(major.mag > 10.0, "mag={}", major.mag);
        }
        assert!(peaks.audible());
    }

    #[test]
    fn blackman_harris_window_also_finds_the_tone() {
        let mut dsp = Dsp::new(1024, WindowConfig::BlackmanHarris);
        let decoded = stereo(sine(1_000.0, 1.0, 1024));
        let peaks = dsp.find_peaks(&decoded);
        let major = peaks.major(Channel::Left).unwrap();
        assert!((985.0..1015.0).contains(&major.freq), "freq={}", major.freq);
        assert!(major.mag > 5.0, "mag={}", major.mag);
    }

    #[test]
    fn near_silence_yields_no_audible_peaks() {
        let mut dsp = Dsp::new(1024, WindowConfig::Hann);
        let decoded = stereo(sine(1_000.0, 0.001, 1024));
        let peaks = dsp.find_peaks(&decoded);
        assert!(peaks.silence());
    }

    #[test]
    fn out_of_band_tone_is_filtered() {
        let mut dsp = Dsp::new(1024, WindowConfig::Hann);
        // 20 kHz is beyond the retained band
        let decoded = stereo(sine(20_000.0, 1.0, 1024));
        let peaks = dsp.find_peaks(&decoded);
        assert!(
            peaks
                .iter(Channel::Left)
                .all(|p| (40.0..=11_500.0).contains(&p.freq))
        );
    }

    #[test]
    fn dc_offset_does_not_create_a_peak() {
        let mut dsp = Dsp::new(1024, WindowConfig::Hann);
        let mut samples = sine(1_000.0, 0.5, 1024);
        for s in &mut samples {
            *s += 0.4;
        }
        let peaks = dsp.find_peaks(&stereo(samples));
        let major = peaks.major(Channel::Left).unwrap();
        assert!((990.0..1010.0).contains(&major.freq), "freq={}", major.freq);
    }

    #[test]
    fn window_weights_are_bounded() {
        for window in [WindowConfig::Hann, WindowConfig::BlackmanHarris] {
            let weights = window_weights(1024, window);
            assert_eq!(weights.len(), 1024);
            assert!(weights.iter().all(|w| (-0.01..=1.01).contains(w)));
        }
    }
}
