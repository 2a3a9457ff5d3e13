//! Video packet intake: reassembly and delivery into the decoder.

pub mod decoder;
pub mod fec;
pub mod surface;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;

use crate::packet::VideoFrameHeader;
use crate::stats::{ClockSync, LatencyCollector};

use decoder::VideoDecoder;
use fec::FecQueue;

use super::super::ClientCallbacks;

/// Receiving end of the video stream: per-packet bookkeeping, shard
/// reassembly and hand-off of whole frames to the decoder queue.
///
/// Lives inside the intake domain; one instance per configured stream.
pub struct VideoReceiver {
	enable_fec: bool,
	fec_queue: FecQueue,
	decoder: Arc<VideoDecoder>,
	collector: Arc<LatencyCollector>,
	callbacks: Arc<ClientCallbacks>,
}

impl VideoReceiver {
	pub fn new(
		enable_fec: bool,
		fec_failure: Arc<AtomicBool>,
		decoder: Arc<VideoDecoder>,
		collector: Arc<LatencyCollector>,
		callbacks: Arc<ClientCallbacks>,
	) -> Self {
		Self {
			enable_fec,
			fec_queue: FecQueue::new(fec_failure),
			decoder,
			collector,
			callbacks,
		}
	}

	/// Process one inbound video packet.
	#[allow(clippy::result_unit_err)]
	pub fn handle_packet(&mut self, clock_sync: &mut ClockSync, buffer: &[u8]) -> Result<(), ()> {
		let header = VideoFrameHeader::from_bytes(buffer)?;
		let payload = &buffer[VideoFrameHeader::SIZE..];

		clock_sync.on_video_packet(&header, &self.collector);

		if !self.enable_fec {
			// Without forward error correction every packet carries a whole
			// frame.
			self.collector.received_last(header.tracking_frame_index);
			let _ = self
				.decoder
				.push(Bytes::copy_from_slice(payload), header.tracking_frame_index);
			return Ok(());
		}

		let frame_failed = self.fec_queue.add_packet(&header, payload);

		if self.fec_queue.reconstruct() {
			let tracking_frame_index = self.fec_queue.tracking_frame_index();
			self.collector.received_last(tracking_frame_index);
			let frame = Bytes::copy_from_slice(self.fec_queue.frame_buffer());
			let _ = self.decoder.push(frame, tracking_frame_index);
			self.fec_queue.clear_fec_failure();
		}

		if frame_failed {
			self.collector.fec_failure();
			(self.callbacks.send_video_error_report)();
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use reed_solomon_erasure::{galois_8, ReedSolomon};

	use crate::config::DecoderConfig;
	use crate::packet::TimeSync;

	use super::decoder::backend::{DummyDecoderFactory, DummySurface, VideoSurface};
	use super::surface::{PresentPolicy, SurfaceExchange};
	use super::*;

	const SHARD_SIZE: usize = 1024;
	const DATA_SHARDS: usize = 4;
	const PARITY_SHARDS: usize = 2;

	struct Harness {
		receiver: VideoReceiver,
		clock_sync: ClockSync,
		exchange: Arc<SurfaceExchange>,
		collector: Arc<LatencyCollector>,
		error_reports: Arc<AtomicUsize>,
		packet_counter: u32,
	}

	fn harness(enable_fec: bool) -> Harness {
		let collector = Arc::new(LatencyCollector::new());
		let exchange = Arc::new(SurfaceExchange::new(PresentPolicy {
			no_frame_skip: true,
			..Default::default()
		}));
		let error_reports = Arc::new(AtomicUsize::new(0));
		let callbacks = Arc::new(ClientCallbacks {
			send_tracking: Box::new(|_| {}),
			send_time_sync: Box::new(|_: &TimeSync| {}),
			send_video_error_report: {
				let error_reports = error_reports.clone();
				Box::new(move || {
					error_reports.fetch_add(1, Ordering::SeqCst);
				})
			},
			send_battery: Box::new(|_, _, _| {}),
			request_idr: Box::new(|| {}),
			set_waiting_next_idr: Box::new(|_| {}),
			haptics_feedback: Box::new(|_| {}),
		});

		let fec_failure = Arc::new(AtomicBool::new(false));
		let decoder = Arc::new(
			VideoDecoder::new(
				DecoderConfig::default(),
				&DummyDecoderFactory,
				collector.clone(),
				exchange.clone(),
				callbacks.clone(),
			)
			.unwrap(),
		);

		Harness {
			receiver: VideoReceiver::new(
				enable_fec,
				fec_failure,
				decoder,
				collector.clone(),
				callbacks,
			),
			clock_sync: ClockSync::new(),
			exchange,
			collector,
			error_reports,
			packet_counter: 0,
		}
	}

	impl Harness {
		fn deliver(&mut self, video_frame_index: u64, fec_index: usize, payload: &[u8]) {
			self.packet_counter += 1;
			let header = VideoFrameHeader {
				packet_counter: self.packet_counter,
				tracking_frame_index: video_frame_index + 100,
				video_frame_index,
				sent_time_us: 0,
				frame_byte_size: (SHARD_SIZE * DATA_SHARDS) as u32,
				fec_index: fec_index as u32,
				fec_percentage: 33,
			};
			let mut buffer = Vec::new();
			header.serialize(&mut buffer);
			buffer.extend_from_slice(payload);
			self.receiver.handle_packet(&mut self.clock_sync, &buffer).unwrap();
		}
	}

	fn frame_bytes(seed: u8) -> Vec<u8> {
		(0..SHARD_SIZE * DATA_SHARDS)
			.map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed))
			.collect()
	}

	fn shards_for(frame: &[u8]) -> Vec<Vec<u8>> {
		let mut shards: Vec<Vec<u8>> = frame.chunks(SHARD_SIZE).map(|c| c.to_vec()).collect();
		for _ in 0..PARITY_SHARDS {
			shards.push(vec![0u8; SHARD_SIZE]);
		}
		let encoder = ReedSolomon::<galois_8::Field>::new(DATA_SHARDS, PARITY_SHARDS).unwrap();
		encoder.encode(&mut shards).unwrap();
		shards
	}

	fn wait_for_frame(exchange: &SurfaceExchange) -> crate::session::stream::DecodedFrame {
		let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
		loop {
			if let Some(frame) = exchange.begin_video_view() {
				return frame;
			}
			assert!(std::time::Instant::now() < deadline, "no decoded frame arrived");
		}
	}

	#[test]
	fn sharded_frame_reaches_the_render_loop() {
		let mut harness = harness(true);
		let frame = frame_bytes(1);
		let shards = shards_for(&frame);

		for (index, shard) in shards.iter().take(DATA_SHARDS).enumerate() {
			harness.deliver(1, index, shard);
		}

		let view = wait_for_frame(&harness.exchange);
		assert_eq!(view.tracking_frame_index, 101);
		let surface = view.surface.as_any().downcast_ref::<DummySurface>().unwrap();
		assert_eq!(&surface.data()[..], &frame[..]);
		assert_eq!(harness.error_reports.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn recovered_frame_matches_the_original() {
		let mut harness = harness(true);
		let frame = frame_bytes(2);
		let shards = shards_for(&frame);

		// Data shard 1 is lost; the parity shards make up for it.
		for index in [0, 2, 3, 4, 5] {
			harness.deliver(1, index, &shards[index]);
		}
		// Recovery happens when the next frame starts.
		let next = shards_for(&frame_bytes(3));
		harness.deliver(2, 0, &next[0]);

		let view = wait_for_frame(&harness.exchange);
		assert_eq!(view.tracking_frame_index, 101);
		let surface = view.surface.as_any().downcast_ref::<DummySurface>().unwrap();
		assert_eq!(&surface.data()[..], &frame[..]);
	}

	#[test]
	fn unrecoverable_frame_reports_an_error() {
		let mut harness = harness(true);
		let shards = shards_for(&frame_bytes(4));

		harness.deliver(1, 0, &shards[0]);
		harness.deliver(1, 1, &shards[1]);

		let next = shards_for(&frame_bytes(5));
		harness.deliver(2, 0, &next[0]);

		assert_eq!(harness.error_reports.load(Ordering::SeqCst), 1);
		assert_eq!(harness.collector.fec_failure_total(), 1);
	}

	#[test]
	fn fec_disabled_passes_whole_frames_through() {
		let mut harness = harness(false);
		let frame = frame_bytes(6);

		harness.deliver(1, 0, &frame);

		let view = wait_for_frame(&harness.exchange);
		assert_eq!(view.tracking_frame_index, 101);
		let surface = view.surface.as_any().downcast_ref::<DummySurface>().unwrap();
		assert_eq!(&surface.data()[..], &frame[..]);
	}

	#[test]
	fn sequence_gap_is_counted_not_fatal() {
		let mut harness = harness(true);
		let frame = frame_bytes(7);
		let shards = shards_for(&frame);

		harness.deliver(1, 0, &shards[0]);
		// Skip two packet counters.
		harness.packet_counter += 2;
		for (index, shard) in shards.iter().take(DATA_SHARDS).enumerate().skip(1) {
			harness.deliver(1, index, shard);
		}

		assert_eq!(harness.collector.packets_lost_total(), 2);
		wait_for_frame(&harness.exchange);
	}

	#[test]
	fn malformed_header_is_rejected() {
		let mut harness = harness(true);
		let mut clock_sync = ClockSync::new();
		assert!(harness.receiver.handle_packet(&mut clock_sync, &[0u8; 10]).is_err());
	}
}
