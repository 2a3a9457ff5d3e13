use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::packet::TimeSync;
use crate::time;

use super::LatencyCollector;

/// Sends the outbound statistics report for the transport to deliver.
pub type TimeSyncSender = Box<dyn Fn(&TimeSync) + Send + Sync>;

/// Assembles the return-path statistics reports from the collector state.
///
/// A report goes out on every frame submit. When the render loop repeats a
/// frame instead of presenting a fresh one, the re-render variant is sent:
/// zeroed latencies, but live loss and failure counters.
pub struct ReportGenerator {
	collector: Arc<LatencyCollector>,
	fec_failure: Arc<AtomicBool>,
	sequence: AtomicU64,
	send_time_sync: TimeSyncSender,
}

impl ReportGenerator {
	pub fn new(
		collector: Arc<LatencyCollector>,
		fec_failure: Arc<AtomicBool>,
		send_time_sync: TimeSyncSender,
	) -> Self {
		Self {
			collector,
			fec_failure,
			// Wraps to 0 on the first report.
			sequence: AtomicU64::new(u64::MAX),
			send_time_sync,
		}
	}

	/// Finalize a frame and report. `u64::MAX` marks a frame that never
	/// entered the pipeline and is skipped entirely.
	pub fn submit_and_sync(&self, frame_index: u64, re_render_only: bool) {
		if frame_index == u64::MAX {
			return;
		}
		self.collector.submit(frame_index);
		if re_render_only {
			self.send_re_render_report();
		} else {
			self.send_report();
		}
	}

	pub fn send_report(&self) {
		let mut report = self.counters_report();
		report.average_total_latency_us = clamp_u32(self.collector.latency(0));
		report.average_send_latency_us = clamp_u32(self.collector.latency(3));
		report.average_transport_latency_us = clamp_u32(self.collector.latency(1));
		report.average_decode_latency_us = self.collector.latency(2);
		report.idle_time_us = clamp_u32(self.collector.latency(4));
		(self.send_time_sync)(&report);
	}

	pub fn send_re_render_report(&self) {
		let report = self.counters_report();
		(self.send_time_sync)(&report);
	}

	fn counters_report(&self) -> TimeSync {
		TimeSync {
			mode: 0,
			sequence: self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
			client_time_us: time::monotonic_us(),
			packets_lost_total: self.collector.packets_lost_total(),
			packets_lost_in_second: self.collector.packets_lost_previous(),
			fec_failure: self.fec_failure.load(Ordering::Relaxed),
			fec_failure_in_second: self.collector.fec_failure_previous(),
			fec_failure_total: self.collector.fec_failure_total(),
			fps: self.collector.frames_in_second(),
			..Default::default()
		}
	}

	pub fn reset(&self) {
		self.sequence.store(u64::MAX, Ordering::Relaxed);
	}
}

fn clamp_u32(value: u64) -> u32 {
	u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use super::*;

	fn capture() -> (Arc<Mutex<Vec<TimeSync>>>, TimeSyncSender) {
		let sent = Arc::new(Mutex::new(Vec::new()));
		let sink = sent.clone();
		let send: TimeSyncSender = Box::new(move |report: &TimeSync| {
			sink.lock().unwrap().push(report.clone());
		});
		(sent, send)
	}

	#[test]
	fn sequence_starts_at_zero_and_increments() {
		let (sent, send) = capture();
		let reporter = ReportGenerator::new(
			Arc::new(LatencyCollector::new()),
			Arc::new(AtomicBool::new(false)),
			send,
		);

		reporter.send_report();
		reporter.send_report();
		reporter.send_report();

		let sent = sent.lock().unwrap();
		assert_eq!(sent.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);
		assert!(sent.iter().all(|r| r.mode == 0));
	}

	#[test]
	fn re_render_report_zeroes_latencies_but_keeps_counters() {
		let (sent, send) = capture();
		let collector = Arc::new(LatencyCollector::new());
		let fec_failure = Arc::new(AtomicBool::new(true));
		let reporter = ReportGenerator::new(collector.clone(), fec_failure, send);

		collector.packet_loss(3);
		collector.fec_failure();
		reporter.submit_and_sync(1, true);

		let sent = sent.lock().unwrap();
		let report = &sent[0];
		assert_eq!(report.average_total_latency_us, 0);
		assert_eq!(report.average_decode_latency_us, 0);
		assert_eq!(report.idle_time_us, 0);
		assert_eq!(report.packets_lost_total, 3);
		assert_eq!(report.fec_failure_total, 1);
		assert!(report.fec_failure);
	}

	#[test]
	fn invalid_frame_index_sends_nothing() {
		let (sent, send) = capture();
		let reporter = ReportGenerator::new(
			Arc::new(LatencyCollector::new()),
			Arc::new(AtomicBool::new(false)),
			send,
		);

		reporter.submit_and_sync(u64::MAX, false);
		assert!(sent.lock().unwrap().is_empty());
	}

	#[test]
	fn full_report_carries_latencies() {
		let (sent, send) = capture();
		let collector = Arc::new(LatencyCollector::new());
		let reporter = ReportGenerator::new(collector.clone(), Arc::new(AtomicBool::new(false)), send);

		collector.tracking(5);
		reporter.submit_and_sync(5, false);

		let sent = sent.lock().unwrap();
		assert_eq!(sent.len(), 1);
		assert!(sent[0].client_time_us > 0);
	}
}
