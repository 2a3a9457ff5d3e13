use crate::packet::{TimeSync, VideoFrameHeader};
use crate::time;

use super::LatencyCollector;

/// Estimates the server-minus-client clock offset from time-sync round trips
/// and keeps the per-packet receive bookkeeping that depends on it.
///
/// Owned by the intake thread; nothing here is shared.
pub struct ClockSync {
	/// Server clock minus client clock, in microseconds.
	time_diff_us: i64,
	last_rtt_us: u64,
	last_frame_index: u64,
	prev_video_sequence: u32,
}

impl ClockSync {
	pub fn new() -> Self {
		Self {
			time_diff_us: 0,
			last_rtt_us: 0,
			last_frame_index: 0,
			prev_video_sequence: 0,
		}
	}

	pub fn reset(&mut self) {
		*self = Self::new();
	}

	/// Server clock minus client clock, 0 until the first mode-1 reply.
	pub fn time_diff_us(&self) -> i64 {
		self.time_diff_us
	}

	pub fn last_rtt_us(&self) -> u64 {
		self.last_rtt_us
	}

	/// Process an inbound time-sync packet.
	///
	/// Mode 1 is a server probe: the round trip against our echoed send time
	/// yields the RTT and a fresh offset estimate, and the probe is returned
	/// as a mode-2 echo for the caller to send back. Mode 3 acknowledges a
	/// tracking packet. Other modes are ignored.
	pub fn on_time_sync(&mut self, time_sync: &TimeSync, collector: &LatencyCollector) -> Option<TimeSync> {
		self.on_time_sync_at(time_sync, collector, time::monotonic_us())
	}

	fn on_time_sync_at(
		&mut self,
		time_sync: &TimeSync,
		collector: &LatencyCollector,
		now_us: u64,
	) -> Option<TimeSync> {
		match time_sync.mode {
			1 => {
				collector.set_total_latency(time_sync.server_total_latency_us);

				let rtt = now_us.saturating_sub(time_sync.client_time_us);
				self.last_rtt_us = rtt;
				self.time_diff_us =
					time_sync.server_time_us as i64 + rtt as i64 / 2 - now_us as i64;
				tracing::trace!("Time sync: server - client = {} us, RTT = {rtt} us.", self.time_diff_us);

				let mut reply = time_sync.clone();
				reply.mode = 2;
				reply.client_time_us = now_us;
				Some(reply)
			},
			3 => {
				collector.received(time_sync.tracking_recv_frame_index);
				None
			},
			mode => {
				tracing::trace!("Ignoring time sync packet with mode {mode}.");
				None
			},
		}
	}

	/// Per-packet bookkeeping before a video packet enters reassembly: stamp
	/// the first shard of every frame, estimate when the server sent it and
	/// count sequence gaps.
	pub fn on_video_packet(&mut self, header: &VideoFrameHeader, collector: &LatencyCollector) {
		if self.last_frame_index != header.tracking_frame_index {
			collector.received_first(header.tracking_frame_index);

			let now_us = time::monotonic_us() as i64;
			let sent = header.sent_time_us as i64 - self.time_diff_us;
			let offset = if sent > now_us { 0 } else { sent - now_us };
			collector.estimated_sent(header.tracking_frame_index, offset);

			self.last_frame_index = header.tracking_frame_index;
		}

		let lost = self.process_video_sequence(header.packet_counter);
		if lost != 0 {
			tracing::debug!("Detected {lost} lost video packets.");
			collector.packet_loss(lost);
		}
	}

	fn process_video_sequence(&mut self, packet_counter: u32) -> u64 {
		let next = self.prev_video_sequence.wrapping_add(1);
		let lost = self.prev_video_sequence != 0 && next != packet_counter;
		self.prev_video_sequence = packet_counter;
		if lost {
			u64::from(packet_counter.wrapping_sub(next).min(next.wrapping_sub(packet_counter)))
		} else {
			0
		}
	}
}

impl Default for ClockSync {
	fn default() -> Self {
		Self::new()
	}
}
