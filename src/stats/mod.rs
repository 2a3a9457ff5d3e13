//! Latency statistics for the streaming pipeline.
//!
//! [`LatencyCollector`] records per-frame stage timestamps keyed by tracking
//! frame index and derives the rolling latency figures reported back to the
//! server. The frame map sits behind a single mutex; every scalar that the
//! report generator reads is atomic, so readers never block the stages
//! writing their stamps.

mod timing;
mod reporter;

pub use timing::ClockSync;
pub use reporter::ReportGenerator;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::time;

/// Upper bound on the number of in-flight frame records.
pub const MAX_FRAMES: usize = 1024;

/// Saturation point of the server total latency EMA, in microseconds.
const MAX_SERVER_TOTAL_LATENCY_US: u64 = 200_000;

/// Stage timestamps of a single frame, all in monotonic microseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameTimestamps {
	pub tracking: u64,
	pub estimated_sent: u64,
	pub received: u64,
	pub received_first: u64,
	pub received_last: u64,
	pub decoder_input: u64,
	pub decoder_output: u64,
	pub rendered1: u64,
	pub rendered2: u64,
	pub submit: u64,
}

pub struct LatencyCollector {
	frames: Mutex<BTreeMap<u64, FrameTimestamps>>,

	/// Rolling latencies: total, transport, decode, send one-way, render idle.
	latency: [AtomicU64; 5],

	/// EMA of the server-reported total latency, stored as f64 bits.
	server_total_latency: AtomicU64,

	packets_lost_total: AtomicU64,
	packets_lost_in_second: AtomicU64,
	packets_lost_previous: AtomicU64,

	fec_failure_total: AtomicU64,
	fec_failure_in_second: AtomicU64,
	fec_failure_previous: AtomicU64,

	/// Frames per second, stored as f32 bits.
	frames_in_second: AtomicU32,
	last_submit_us: AtomicU64,

	/// Whole wall-clock second the in-second counters belong to.
	statistics_second: AtomicU64,
}

impl LatencyCollector {
	pub fn new() -> Self {
		Self {
			frames: Mutex::new(BTreeMap::new()),
			latency: Default::default(),
			server_total_latency: AtomicU64::new(0.0f64.to_bits()),
			packets_lost_total: AtomicU64::new(0),
			packets_lost_in_second: AtomicU64::new(0),
			packets_lost_previous: AtomicU64::new(0),
			fec_failure_total: AtomicU64::new(0),
			fec_failure_in_second: AtomicU64::new(0),
			fec_failure_previous: AtomicU64::new(0),
			frames_in_second: AtomicU32::new(0.0f32.to_bits()),
			last_submit_us: AtomicU64::new(0),
			statistics_second: AtomicU64::new(time::wall_clock_us() / 1_000_000),
		}
	}

	fn with_frame(&self, frame_index: u64, f: impl FnOnce(&mut FrameTimestamps)) {
		let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
		if !frames.contains_key(&frame_index) && frames.len() >= MAX_FRAMES {
			frames.pop_first();
		}
		f(frames.entry(frame_index).or_default())
	}

	pub fn tracking(&self, frame_index: u64) {
		self.tracking_at(frame_index, time::monotonic_us());
	}

	fn tracking_at(&self, frame_index: u64, now_us: u64) {
		self.with_frame(frame_index, |frame| frame.tracking = now_us);
	}

	/// Record when the server most likely sent this frame, as the current
	/// time plus a (non-positive) offset derived from the clock-offset
	/// estimator.
	pub fn estimated_sent(&self, frame_index: u64, offset_us: i64) {
		let now_us = time::monotonic_us();
		self.with_frame(frame_index, |frame| {
			frame.estimated_sent = now_us.saturating_add_signed(offset_us)
		});
	}

	pub fn received(&self, frame_index: u64) {
		self.received_at(frame_index, time::monotonic_us());
	}

	fn received_at(&self, frame_index: u64, now_us: u64) {
		self.with_frame(frame_index, |frame| frame.received = now_us);
	}

	pub fn received_first(&self, frame_index: u64) {
		self.received_first_at(frame_index, time::monotonic_us());
	}

	fn received_first_at(&self, frame_index: u64, now_us: u64) {
		self.with_frame(frame_index, |frame| frame.received_first = now_us);
	}

	pub fn received_last(&self, frame_index: u64) {
		self.received_last_at(frame_index, time::monotonic_us());
	}

	fn received_last_at(&self, frame_index: u64, now_us: u64) {
		self.with_frame(frame_index, |frame| frame.received_last = now_us);
	}

	pub fn decoder_input(&self, frame_index: u64) {
		self.decoder_input_at(frame_index, time::monotonic_us());
	}

	fn decoder_input_at(&self, frame_index: u64, now_us: u64) {
		self.with_frame(frame_index, |frame| frame.decoder_input = now_us);
	}

	pub fn decoder_output(&self, frame_index: u64) {
		self.decoder_output_at(frame_index, time::monotonic_us());
	}

	fn decoder_output_at(&self, frame_index: u64, now_us: u64) {
		self.with_frame(frame_index, |frame| frame.decoder_output = now_us);
	}

	pub fn rendered1(&self, frame_index: u64) {
		self.rendered1_at(frame_index, time::monotonic_us());
	}

	fn rendered1_at(&self, frame_index: u64, now_us: u64) {
		self.with_frame(frame_index, |frame| frame.rendered1 = now_us);
	}

	pub fn rendered2(&self, frame_index: u64) {
		self.rendered2_at(frame_index, time::monotonic_us());
	}

	fn rendered2_at(&self, frame_index: u64, now_us: u64) {
		self.with_frame(frame_index, |frame| frame.rendered2 = now_us);
	}

	/// Finalize a frame: derive the rolling latency figures and the frame rate.
	pub fn submit(&self, frame_index: u64) {
		self.submit_at(frame_index, time::monotonic_us());
	}

	fn submit_at(&self, frame_index: u64, now_us: u64) {
		let mut timestamp = {
			let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
			if !frames.contains_key(&frame_index) && frames.len() >= MAX_FRAMES {
				frames.pop_first();
			}
			*frames.entry(frame_index).or_default()
		};
		timestamp.submit = now_us;

		self.latency[0].store(timestamp.submit.saturating_sub(timestamp.tracking), Ordering::Relaxed);

		let decode = if timestamp.decoder_input >= timestamp.decoder_output {
			0
		} else {
			timestamp.decoder_output - timestamp.decoder_input
		};
		self.latency[2].store(decode, Ordering::Relaxed);

		let send_one_way = if timestamp.received != 0 {
			timestamp.received.saturating_sub(timestamp.tracking) / 2
		} else {
			0
		};
		self.latency[3].store(send_one_way, Ordering::Relaxed);
		self.latency[1].store(
			timestamp.received_last.saturating_sub(timestamp.received_first) + send_one_way,
			Ordering::Relaxed,
		);

		let idle = if timestamp.decoder_output >= timestamp.rendered2 {
			0
		} else {
			timestamp.rendered2 - timestamp.decoder_output
		};
		self.latency[4].store(idle, Ordering::Relaxed);

		self.check_and_reset_second(time::wall_clock_us() / 1_000_000);

		let last_submit = self.last_submit_us.swap(timestamp.submit, Ordering::Relaxed);
		if last_submit != 0 && timestamp.submit > last_submit {
			let fps = 1e6 / (timestamp.submit - last_submit) as f32;
			self.frames_in_second.store(fps.to_bits(), Ordering::Relaxed);
		}

		tracing::trace!(
			"Frame {frame_index}: total={:.1}ms transport={:.1}ms decode={:.1}ms idle={:.1}ms",
			self.latency(0) as f64 / 1000.0,
			self.latency(1) as f64 / 1000.0,
			self.latency(2) as f64 / 1000.0,
			self.latency(4) as f64 / 1000.0,
		);
	}

	/// Fold a server-reported total latency sample into the EMA. Samples at or
	/// above the saturation point are ignored, so the EMA can never exceed it.
	pub fn set_total_latency(&self, latency_us: u32) {
		if u64::from(latency_us) >= MAX_SERVER_TOTAL_LATENCY_US {
			return;
		}
		let old = f64::from_bits(self.server_total_latency.load(Ordering::Relaxed));
		let new = 0.05 * f64::from(latency_us) + 0.95 * old;
		self.server_total_latency.store(new.to_bits(), Ordering::Relaxed);
	}

	/// The EMA total latency, clamped to the saturation point. Used by the
	/// host to predict poses ahead of display time.
	pub fn tracking_prediction_latency_us(&self) -> u64 {
		let latency = f64::from_bits(self.server_total_latency.load(Ordering::Relaxed)) as u64;
		latency.min(MAX_SERVER_TOTAL_LATENCY_US)
	}

	fn check_and_reset_second(&self, current_second: u64) {
		let stored = self.statistics_second.load(Ordering::Relaxed);
		if stored == current_second {
			return;
		}
		if self
			.statistics_second
			.compare_exchange(stored, current_second, Ordering::Relaxed, Ordering::Relaxed)
			.is_ok()
		{
			self.packets_lost_previous
				.store(self.packets_lost_in_second.swap(0, Ordering::Relaxed), Ordering::Relaxed);
			self.fec_failure_previous
				.store(self.fec_failure_in_second.swap(0, Ordering::Relaxed), Ordering::Relaxed);
		}
	}

	pub fn packet_loss(&self, lost: u64) {
		self.packet_loss_at(lost, time::wall_clock_us() / 1_000_000);
	}

	fn packet_loss_at(&self, lost: u64, current_second: u64) {
		self.check_and_reset_second(current_second);
		self.packets_lost_total.fetch_add(lost, Ordering::Relaxed);
		self.packets_lost_in_second.fetch_add(lost, Ordering::Relaxed);
	}

	pub fn fec_failure(&self) {
		self.fec_failure_at(time::wall_clock_us() / 1_000_000);
	}

	fn fec_failure_at(&self, current_second: u64) {
		self.check_and_reset_second(current_second);
		self.fec_failure_total.fetch_add(1, Ordering::Relaxed);
		self.fec_failure_in_second.fetch_add(1, Ordering::Relaxed);
	}

	/// Clear every record and counter and re-base the statistics second.
	pub fn reset_all(&self) {
		self.frames.lock().unwrap_or_else(PoisonError::into_inner).clear();
		for latency in &self.latency {
			latency.store(0, Ordering::Relaxed);
		}
		self.server_total_latency.store(0.0f64.to_bits(), Ordering::Relaxed);
		self.packets_lost_total.store(0, Ordering::Relaxed);
		self.packets_lost_in_second.store(0, Ordering::Relaxed);
		self.packets_lost_previous.store(0, Ordering::Relaxed);
		self.fec_failure_total.store(0, Ordering::Relaxed);
		self.fec_failure_in_second.store(0, Ordering::Relaxed);
		self.fec_failure_previous.store(0, Ordering::Relaxed);
		self.frames_in_second.store(0.0f32.to_bits(), Ordering::Relaxed);
		self.last_submit_us.store(0, Ordering::Relaxed);
		self.statistics_second
			.store(time::wall_clock_us() / 1_000_000, Ordering::Relaxed);
	}

	pub fn latency(&self, index: usize) -> u64 {
		self.latency[index].load(Ordering::Relaxed)
	}

	pub fn packets_lost_total(&self) -> u64 {
		self.packets_lost_total.load(Ordering::Relaxed)
	}

	/// Losses counted in the current, still running second.
	pub fn packets_lost_in_second(&self) -> u64 {
		self.packets_lost_in_second.load(Ordering::Relaxed)
	}

	/// Losses counted in the last completed second.
	pub fn packets_lost_previous(&self) -> u64 {
		self.packets_lost_previous.load(Ordering::Relaxed)
	}

	pub fn fec_failure_total(&self) -> u64 {
		self.fec_failure_total.load(Ordering::Relaxed)
	}

	pub fn fec_failure_in_second(&self) -> u64 {
		self.fec_failure_in_second.load(Ordering::Relaxed)
	}

	pub fn fec_failure_previous(&self) -> u64 {
		self.fec_failure_previous.load(Ordering::Relaxed)
	}

	pub fn frames_in_second(&self) -> f32 {
		f32::from_bits(self.frames_in_second.load(Ordering::Relaxed))
	}

	#[cfg(test)]
	fn frame_count(&self) -> usize {
		self.frames.lock().unwrap_or_else(PoisonError::into_inner).len()
	}
}

impl Default for LatencyCollector {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn submit_derives_latencies() {
		let collector = LatencyCollector::new();

		collector.tracking_at(1, 1000);
		collector.received_first_at(1, 2000);
		collector.received_last_at(1, 2500);
		collector.received_at(1, 2700);
		collector.decoder_input_at(1, 3000);
		collector.decoder_output_at(1, 5000);
		collector.rendered1_at(1, 5100);
		collector.rendered2_at(1, 5300);
		collector.submit_at(1, 6000);

		assert_eq!(collector.latency(0), 5000);
		assert_eq!(collector.latency(1), 1350);
		assert_eq!(collector.latency(2), 2000);
		assert_eq!(collector.latency(3), 850);
		assert_eq!(collector.latency(4), 300);
	}

	#[test]
	fn unacknowledged_frame_has_no_send_latency() {
		let collector = LatencyCollector::new();

		collector.tracking_at(7, 1000);
		collector.received_first_at(7, 2000);
		collector.received_last_at(7, 2500);
		collector.submit_at(7, 6000);

		assert_eq!(collector.latency(3), 0);
		assert_eq!(collector.latency(1), 500);
	}

	#[test]
	fn inverted_decode_stamps_clamp_to_zero() {
		let collector = LatencyCollector::new();

		collector.tracking_at(3, 1000);
		collector.decoder_input_at(3, 5000);
		collector.decoder_output_at(3, 4000);
		collector.rendered2_at(3, 3000);
		collector.submit_at(3, 6000);

		assert_eq!(collector.latency(2), 0);
		assert_eq!(collector.latency(4), 0);
	}

	#[test]
	fn ema_converges_on_repeated_samples() {
		let collector = LatencyCollector::new();

		for _ in 0..10 {
			collector.set_total_latency(100_000);
		}

		// 100000 * (1 - 0.95^10)
		let expected = 40_126;
		let latency = collector.tracking_prediction_latency_us() as i64;
		assert!((latency - expected).abs() <= 1, "EMA was {latency}, expected about {expected}");
	}

	#[test]
	fn ema_saturates_at_200_ms() {
		let collector = LatencyCollector::new();

		for _ in 0..1000 {
			collector.set_total_latency(199_999);
		}
		collector.set_total_latency(u32::MAX);

		assert!(collector.tracking_prediction_latency_us() <= 200_000);
	}

	#[test]
	fn counters_window_by_second() {
		let collector = LatencyCollector::new();
		let base = collector.statistics_second.load(Ordering::Relaxed);

		collector.packet_loss_at(5, base);
		collector.packet_loss_at(3, base + 1);

		assert_eq!(collector.packets_lost_in_second(), 3);
		assert_eq!(collector.packets_lost_previous(), 5);
		assert_eq!(collector.packets_lost_total(), 8);

		// A further boundary with no new events rotates the window again.
		collector.check_and_reset_second(base + 2);
		assert_eq!(collector.packets_lost_previous(), 3);
		assert_eq!(collector.packets_lost_in_second(), 0);
		assert_eq!(collector.packets_lost_total(), 8);
	}

	#[test]
	fn fec_failures_window_by_second() {
		let collector = LatencyCollector::new();
		let base = collector.statistics_second.load(Ordering::Relaxed);

		collector.fec_failure_at(base);
		collector.fec_failure_at(base);
		collector.fec_failure_at(base + 1);

		assert_eq!(collector.fec_failure_in_second(), 1);
		assert_eq!(collector.fec_failure_previous(), 2);
		assert_eq!(collector.fec_failure_total(), 3);
	}

	#[test]
	fn frame_map_is_bounded() {
		let collector = LatencyCollector::new();

		for frame_index in 0..(MAX_FRAMES as u64 * 3) {
			collector.tracking_at(frame_index, frame_index);
			assert!(collector.frame_count() <= MAX_FRAMES);
		}

		// The oldest records are the ones evicted.
		let frames = collector.frames.lock().unwrap();
		assert!(frames.contains_key(&(MAX_FRAMES as u64 * 3 - 1)));
		assert!(!frames.contains_key(&0));
	}

	#[test]
	fn fps_follows_submit_interval() {
		let collector = LatencyCollector::new();

		collector.tracking_at(1, 0);
		collector.submit_at(1, 1_000_000);
		collector.tracking_at(2, 1_000_000);
		collector.submit_at(2, 1_013_888);

		let fps = collector.frames_in_second();
		assert!((fps - 72.0).abs() < 0.1, "fps was {fps}");
	}

	#[test]
	fn reset_all_clears_state() {
		let collector = LatencyCollector::new();

		collector.tracking_at(1, 1000);
		collector.submit_at(1, 2000);
		collector.packet_loss(4);
		collector.fec_failure();
		collector.set_total_latency(100_000);

		collector.reset_all();

		assert_eq!(collector.frame_count(), 0);
		assert_eq!(collector.latency(0), 0);
		assert_eq!(collector.packets_lost_total(), 0);
		assert_eq!(collector.fec_failure_total(), 0);
		assert_eq!(collector.tracking_prediction_latency_us(), 0);
		assert_eq!(collector.frames_in_second(), 0.0);
	}
}
