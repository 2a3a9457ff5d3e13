//! Decoder feeding: a bounded queue of reassembled frames and the worker
//! thread that drives the backend decoder.
//!
//! The worker tags every submitted frame with a presentation timestamp taken
//! from the monotonic clock and records the timestamp-to-frame-index mapping.
//! The backend's completion callback resolves the mapping and hands the
//! decoded surface to the render loop, so decode reordering inside the
//! backend cannot mix up frame identities.

pub mod backend;
pub mod frame_map;
pub mod nal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, SendTimeoutError};

use crate::config::DecoderConfig;
use crate::session::ClientCallbacks;
use crate::stats::LatencyCollector;
use crate::time;

use backend::{DecoderBackend, DecoderFactory, OutputSink};
use frame_map::{FrameIndexMap, NULL_INDEX};

use super::surface::{DecodedFrame, SurfaceExchange};

/// Depth of the assembled-frame queue in front of the decoder.
const PACKET_QUEUE_SIZE: usize = 360;

/// Bound on every queue wait, so producers drop instead of stalling the
/// intake thread and the worker notices shutdown promptly.
const QUEUE_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Sized past any decoder reorder window, so a slot is never overwritten
/// while its frame is still in flight.
const FRAME_INDEX_MAP_SIZE: usize = 4096;

/// After this many decode failures in a row the server is asked for a fresh
/// IDR frame.
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 3;

struct DecoderInput {
	data: Bytes,
	tracking_frame_index: u64,
}

/// Handle to the decoder domain: owns the worker thread and the producer
/// side of the input queue.
pub struct VideoDecoder {
	packet_tx: Sender<DecoderInput>,
	collector: Arc<LatencyCollector>,
	is_running: Arc<AtomicBool>,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl VideoDecoder {
	#[allow(clippy::result_unit_err)]
	pub fn new(
		config: DecoderConfig,
		factory: &dyn DecoderFactory,
		collector: Arc<LatencyCollector>,
		exchange: Arc<SurfaceExchange>,
		callbacks: Arc<ClientCallbacks>,
	) -> Result<Self, ()> {
		let frame_map = Arc::new(FrameIndexMap::new(FRAME_INDEX_MAP_SIZE));

		// Completion sink: runs on the backend's output thread and must stay
		// short. Resolve the frame identity, stamp the timeline and publish.
		let output: OutputSink = {
			let frame_map = frame_map.clone();
			let collector = collector.clone();
			let exchange = exchange.clone();
			Arc::new(move |presentation_time_us, surface| {
				let tracking_frame_index = frame_map.get_clear(presentation_time_us);
				if tracking_frame_index == NULL_INDEX {
					tracing::warn!(
						"Unknown frame index for decoded surface with timestamp {presentation_time_us} us, frame ignored."
					);
					return;
				}
				collector.decoder_output(tracking_frame_index);
				exchange.publish(DecodedFrame {
					tracking_frame_index,
					presentation_time_us,
					surface,
				});
			})
		};

		let backend = factory.create(&config, output)?;

		let (packet_tx, packet_rx) = crossbeam_channel::bounded(PACKET_QUEUE_SIZE);
		let is_running = Arc::new(AtomicBool::new(true));

		let inner = VideoDecoderInner {
			config,
			backend,
			collector: collector.clone(),
			callbacks,
			frame_map,
			is_running: is_running.clone(),
			consecutive_errors: 0,
			last_presentation_time_us: 0,
		};
		let worker = std::thread::Builder::new()
			.name("video-decoder".to_string())
			.spawn(move || inner.run(packet_rx))
			.map_err(|e| tracing::error!("Failed to start video decoder thread: {e}"))?;

		Ok(Self {
			packet_tx,
			collector,
			is_running,
			worker: Mutex::new(Some(worker)),
		})
	}

	/// Queue a reassembled frame for decoding. Blocks for at most the queue
	/// timeout; a frame that does not fit is dropped and counted.
	#[allow(clippy::result_unit_err)]
	pub fn push(&self, data: Bytes, tracking_frame_index: u64) -> Result<(), ()> {
		if !self.is_running.load(Ordering::Acquire) {
			return Err(());
		}

		let input = DecoderInput { data, tracking_frame_index };
		match self.packet_tx.send_timeout(input, QUEUE_WAIT_TIMEOUT) {
			Ok(()) => Ok(()),
			Err(SendTimeoutError::Timeout(input)) => {
				tracing::warn!("Decoder queue is full, dropping frame {}.", input.tracking_frame_index);
				self.collector.fec_failure();
				Err(())
			},
			Err(SendTimeoutError::Disconnected(_)) => {
				tracing::debug!("Decoder queue is closed.");
				Err(())
			},
		}
	}

	/// Cooperative shutdown: the worker drains within one queue timeout.
	pub fn stop(&self) {
		self.is_running.store(false, Ordering::Release);
		let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
		if let Some(worker) = worker {
			if worker.join().is_err() {
				tracing::error!("Video decoder thread panicked.");
			}
		}
	}
}

impl Drop for VideoDecoder {
	fn drop(&mut self) {
		self.stop();
	}
}

struct VideoDecoderInner {
	config: DecoderConfig,
	backend: Box<dyn DecoderBackend>,
	collector: Arc<LatencyCollector>,
	callbacks: Arc<ClientCallbacks>,
	frame_map: Arc<FrameIndexMap>,
	is_running: Arc<AtomicBool>,
	consecutive_errors: u32,
	last_presentation_time_us: u64,
}

impl VideoDecoderInner {
	fn run(mut self, packet_rx: Receiver<DecoderInput>) {
		tracing::debug!("Video decoder thread started.");

		while self.is_running.load(Ordering::Acquire) {
			match packet_rx.recv_timeout(QUEUE_WAIT_TIMEOUT) {
				Ok(input) => self.process(input),
				Err(RecvTimeoutError::Timeout) => continue,
				Err(RecvTimeoutError::Disconnected) => break,
			}
		}

		tracing::debug!("Video decoder thread stopped.");
	}

	fn process(&mut self, input: DecoderInput) {
		let codec = self.config.codec;

		// A keyframe leads with codec configuration; the backend wants those
		// units on their own, ahead of the frame they belong to.
		let frame_data = match nal::split_config(&input.data, codec) {
			Some((config, _)) => {
				let config_len = config.len();
				let config_data = input.data.slice(..config_len);
				if self.submit(&config_data, 0, true).is_err() {
					return;
				}
				input.data.slice(config_len..)
			},
			None => input.data.clone(),
		};

		if nal::is_idr(&frame_data, codec) {
			(self.callbacks.set_waiting_next_idr)(false);
		}

		self.collector.decoder_input(input.tracking_frame_index);

		// Strictly increasing, so frames submitted within the same
		// microsecond cannot share a ring slot.
		let presentation_time_us = time::monotonic_us().max(self.last_presentation_time_us + 1);
		self.last_presentation_time_us = presentation_time_us;
		self.frame_map.set(presentation_time_us, input.tracking_frame_index);
		if self.submit(&frame_data, presentation_time_us, false).is_err() {
			// The mapping must not outlive the frame it was made for.
			self.frame_map.get_clear(presentation_time_us);
		}
	}

	fn submit(&mut self, data: &Bytes, presentation_time_us: u64, is_config: bool) -> Result<(), ()> {
		match self.backend.submit(data, presentation_time_us, is_config) {
			Ok(()) => {
				self.consecutive_errors = 0;
				Ok(())
			},
			Err(()) => {
				tracing::warn!(
					"Decoder rejected a {} buffer of {} bytes, dropping it.",
					if is_config { "configuration" } else { "frame" },
					data.len(),
				);
				self.collector.fec_failure();
				self.consecutive_errors += 1;
				if self.consecutive_errors >= MAX_CONSECUTIVE_DECODE_ERRORS {
					tracing::info!(
						"{} consecutive decode failures, requesting an IDR frame.",
						self.consecutive_errors,
					);
					(self.callbacks.set_waiting_next_idr)(true);
					(self.callbacks.request_idr)();
					self.consecutive_errors = 0;
				}
				Err(())
			},
		}
	}
}
