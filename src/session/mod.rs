//! The streaming session: packet dispatch, lifecycle and the render-loop
//! surface of the pipeline.

pub mod stream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{ClientConfig, StreamConfig};
use crate::packet::{self, HapticsFeedback, PacketType, TimeSync};
use crate::stats::{ClockSync, LatencyCollector, ReportGenerator};

use stream::video::decoder::backend::DecoderFactory;
use stream::video::decoder::VideoDecoder;
use stream::video::VideoReceiver;
use stream::{DecodedFrame, PresentPolicy, SurfaceExchange};

/// Outbound half of the host interface.
///
/// The transport, the XR runtime and the haptics devices all live with the
/// host; the pipeline reaches them exclusively through these callbacks. Each
/// callback may be invoked from the intake, decoder or render domain and
/// must not block.
pub struct ClientCallbacks {
	/// Deliver the tracking packet for this frame index to the server.
	pub send_tracking: Box<dyn Fn(u64) + Send + Sync>,

	/// Deliver a time-sync packet (mode-2 echo or mode-0 report).
	pub send_time_sync: Box<dyn Fn(&TimeSync) + Send + Sync>,

	/// Deliver an empty video error report; the server reacts with
	/// retransmission or an IDR frame.
	pub send_video_error_report: Box<dyn Fn() + Send + Sync>,

	/// Deliver battery telemetry: device path hash, gauge in 0..=1, plugged.
	pub send_battery: Box<dyn Fn(u64, f32, bool) + Send + Sync>,

	/// Ask the server to encode the next frame as an IDR.
	pub request_idr: Box<dyn Fn() + Send + Sync>,

	/// Toggle the host's waiting-for-keyframe flag.
	pub set_waiting_next_idr: Box<dyn Fn(bool) + Send + Sync>,

	/// Apply a haptics command on its output device.
	pub haptics_feedback: Box<dyn Fn(HapticsFeedback) + Send + Sync>,
}

/// State owned by the intake domain, touched on every inbound packet.
struct Intake {
	clock_sync: ClockSync,
	video: Option<VideoReceiver>,
}

/// The client-side streaming pipeline of one remote rendering session.
///
/// One instance spans the life of the connection; each
/// [`StreamClient::set_stream_config`] call tears the decoder down and builds
/// it anew for the negotiated parameters.
pub struct StreamClient {
	callbacks: Arc<ClientCallbacks>,
	collector: Arc<LatencyCollector>,
	reporter: ReportGenerator,
	fec_failure: Arc<AtomicBool>,
	exchange: Arc<SurfaceExchange>,
	decoder_factory: Box<dyn DecoderFactory>,
	intake: Mutex<Intake>,
	decoder: Mutex<Option<Arc<VideoDecoder>>>,
	stream_config: Mutex<Option<StreamConfig>>,
}

impl StreamClient {
	pub fn new(
		config: &ClientConfig,
		callbacks: ClientCallbacks,
		decoder_factory: Box<dyn DecoderFactory>,
	) -> Self {
		let callbacks = Arc::new(callbacks);
		let collector = Arc::new(LatencyCollector::new());
		let fec_failure = Arc::new(AtomicBool::new(false));

		let reporter = ReportGenerator::new(collector.clone(), fec_failure.clone(), {
			let callbacks = callbacks.clone();
			Box::new(move |report: &TimeSync| (callbacks.send_time_sync)(report))
		});

		let exchange = Arc::new(SurfaceExchange::new(PresentPolicy {
			no_frame_skip: config.no_frame_skip,
			no_server_framerate_lock: config.no_server_framerate_lock,
		}));

		Self {
			callbacks,
			collector,
			reporter,
			fec_failure,
			exchange,
			decoder_factory,
			intake: Mutex::new(Intake {
				clock_sync: ClockSync::new(),
				video: None,
			}),
			decoder: Mutex::new(None),
			stream_config: Mutex::new(None),
		}
	}

	fn lock_intake(&self) -> std::sync::MutexGuard<'_, Intake> {
		self.intake.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Dispatch one inbound packet from the transport.
	pub fn on_receive(&self, buffer: &[u8]) {
		let Ok(packet_type) = packet::packet_type(buffer) else {
			return;
		};

		match packet_type {
			PacketType::VideoFrame => {
				let mut intake = self.lock_intake();
				let Intake { clock_sync, video } = &mut *intake;
				match video {
					Some(receiver) => {
						let _ = receiver.handle_packet(clock_sync, buffer);
					},
					None => tracing::trace!("Dropping video packet, no stream is configured."),
				}
			},
			PacketType::TimeSync => {
				let Ok(time_sync) = TimeSync::from_bytes(buffer) else {
					return;
				};
				let reply = self.lock_intake().clock_sync.on_time_sync(&time_sync, &self.collector);
				if let Some(reply) = reply {
					(self.callbacks.send_time_sync)(&reply);
				}
			},
			PacketType::Haptics => {
				let Ok(haptics) = HapticsFeedback::from_bytes(buffer) else {
					return;
				};
				(self.callbacks.haptics_feedback)(haptics);
			},
			other => tracing::trace!("Ignoring inbound {other:?} packet."),
		}
	}

	/// Tear down the running decoder and rebuild the pipeline for a new
	/// stream configuration, then ask the server for a keyframe to start
	/// from.
	#[allow(clippy::result_unit_err)]
	pub fn set_stream_config(&self, config: StreamConfig) -> Result<(), ()> {
		tracing::info!(
			"Configuring stream: {:?}, FEC {}.",
			config.decoder.codec,
			if config.decoder.enable_fec { "enabled" } else { "disabled" },
		);

		self.stop_decoder();
		self.exchange.clear();

		self.collector.reset_all();
		self.reporter.reset();
		self.fec_failure.store(false, Ordering::Relaxed);
		self.lock_intake().clock_sync.reset();

		let decoder = Arc::new(VideoDecoder::new(
			config.decoder.clone(),
			self.decoder_factory.as_ref(),
			self.collector.clone(),
			self.exchange.clone(),
			self.callbacks.clone(),
		)?);

		self.lock_intake().video = Some(VideoReceiver::new(
			config.decoder.enable_fec,
			self.fec_failure.clone(),
			decoder.clone(),
			self.collector.clone(),
			self.callbacks.clone(),
		));
		*self.decoder.lock().unwrap_or_else(PoisonError::into_inner) = Some(decoder);
		*self.stream_config.lock().unwrap_or_else(PoisonError::into_inner) = Some(config);

		(self.callbacks.set_waiting_next_idr)(true);
		(self.callbacks.request_idr)();

		Ok(())
	}

	fn stop_decoder(&self) {
		// Unhook the intake first so nothing produces into a stopping queue.
		self.lock_intake().video = None;
		let decoder = self.decoder.lock().unwrap_or_else(PoisonError::into_inner).take();
		if let Some(decoder) = decoder {
			decoder.stop();
		}
	}

	/// Stop decoding and drop pending surfaces. The stream configuration is
	/// kept for [`StreamClient::resume`].
	pub fn pause(&self) {
		tracing::info!("Pausing stream.");
		self.stop_decoder();
		self.exchange.clear();
	}

	#[allow(clippy::result_unit_err)]
	pub fn resume(&self) -> Result<(), ()> {
		let config = self.stream_config.lock().unwrap_or_else(PoisonError::into_inner).clone();
		match config {
			Some(config) => {
				tracing::info!("Resuming stream.");
				self.set_stream_config(config)
			},
			None => Ok(()),
		}
	}

	/// Called when the host samples the pose for a new frame; stamps the
	/// timeline and delegates the tracking packet to the transport.
	pub fn send_tracking(&self, frame_index: u64) {
		self.collector.tracking(frame_index);
		(self.callbacks.send_tracking)(frame_index);
	}

	/// Forward battery telemetry for a device to the server.
	pub fn report_battery(&self, device_path: u64, gauge_value: f32, is_plugged: bool) {
		(self.callbacks.send_battery)(device_path, gauge_value, is_plugged);
	}

	/// Fetch the decoded surface to render, per the configured policy.
	pub fn begin_video_view(&self) -> Option<DecodedFrame> {
		self.exchange.begin_video_view()
	}

	/// Give a rendered surface back; it stays alive until the next view.
	pub fn end_video_view(&self, frame: DecodedFrame) {
		self.exchange.end_video_view(frame);
	}

	pub fn on_frame_render_begin(&self, frame_index: u64) {
		self.collector.rendered1(frame_index);
	}

	pub fn on_frame_render_end(&self, frame_index: u64) {
		self.collector.rendered2(frame_index);
	}

	/// Finalize the frame that was just handed to the compositor and send
	/// the statistics report. `re_render_only` marks a repeated frame.
	pub fn submit_frame(&self, frame_index: u64, re_render_only: bool) {
		self.reporter.submit_and_sync(frame_index, re_render_only);
	}

	/// Send a statistics report outside the per-frame cadence.
	pub fn send_statistics(&self) {
		self.reporter.send_report();
	}

	/// How far ahead the host should predict poses, from the latency EMA.
	pub fn tracking_prediction_latency_us(&self) -> u64 {
		self.collector.tracking_prediction_latency_us()
	}

	/// Live pipeline statistics, for an on-device overlay.
	pub fn latency_collector(&self) -> &LatencyCollector {
		&self.collector
	}
}

impl Drop for StreamClient {
	fn drop(&mut self) {
		self.stop_decoder();
		self.exchange.close();
	}
}
