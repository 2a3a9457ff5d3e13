//! Hand-off of decoded surfaces from the decoder to the render loop.
//!
//! Single producer (the backend completion callback), single consumer (the
//! render thread). The render loop calls [`SurfaceExchange::begin_video_view`]
//! once per frame and returns the surface through
//! [`SurfaceExchange::end_video_view`], which holds it until the next view
//! begins so the compositor always has an image to sample.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::decoder::backend::VideoSurface;

/// Longest the render loop blocks waiting for a fresh surface.
const VIEW_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Oldest surfaces are dropped beyond this depth, mirroring the image pool
/// of a hardware decoder output.
const MAX_QUEUED_SURFACES: usize = 5;

/// A decoded surface ready to render, tagged with its originating frame.
pub struct DecodedFrame {
	pub tracking_frame_index: u64,
	pub presentation_time_us: u64,
	pub surface: Arc<dyn VideoSurface>,
}

/// How [`SurfaceExchange::begin_video_view`] picks a surface.
#[derive(Clone, Copy, Debug, Default)]
pub struct PresentPolicy {
	/// Present every decoded frame in order instead of skipping to the newest.
	pub no_frame_skip: bool,

	/// Never block waiting for a surface.
	pub no_server_framerate_lock: bool,
}

struct ExchangeState {
	queue: VecDeque<DecodedFrame>,
	deferred_release: Option<DecodedFrame>,
	closed: bool,
}

pub struct SurfaceExchange {
	state: Mutex<ExchangeState>,
	available: Condvar,
	policy: PresentPolicy,
}

impl SurfaceExchange {
	pub fn new(policy: PresentPolicy) -> Self {
		Self {
			state: Mutex::new(ExchangeState {
				queue: VecDeque::new(),
				deferred_release: None,
				closed: false,
			}),
			available: Condvar::new(),
			policy,
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, ExchangeState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Called from the backend completion callback with a freshly decoded
	/// surface. Never blocks; the oldest queued surface is dropped when the
	/// consumer falls behind.
	pub fn publish(&self, frame: DecodedFrame) {
		{
			let mut state = self.lock();
			if state.closed {
				return;
			}
			state.queue.push_back(frame);
			while state.queue.len() > MAX_QUEUED_SURFACES {
				let skipped = state.queue.pop_front();
				if let Some(skipped) = skipped {
					tracing::trace!(
						"Dropping decoded frame {} before presentation, render loop is behind.",
						skipped.tracking_frame_index,
					);
				}
			}
		}
		self.available.notify_one();
	}

	/// Fetch the surface to render this view, or `None` when nothing is
	/// ready, in which case the renderer repeats its previous frame.
	pub fn begin_video_view(&self) -> Option<DecodedFrame> {
		let mut state = self.lock();

		if !self.policy.no_server_framerate_lock {
			while state.queue.is_empty() && !state.closed {
				let (next, timeout) = self
					.available
					.wait_timeout(state, VIEW_WAIT_TIMEOUT)
					.unwrap_or_else(PoisonError::into_inner);
				state = next;
				if timeout.timed_out() {
					break;
				}
			}
		}

		if state.closed {
			return None;
		}

		if self.policy.no_frame_skip {
			return state.queue.pop_front();
		}

		// Skip straight to the newest decoded surface.
		while state.queue.len() > 1 {
			if let Some(skipped) = state.queue.pop_front() {
				tracing::trace!("Skipping decoded frame {}.", skipped.tracking_frame_index);
			}
		}
		state.queue.pop_front()
	}

	/// Return the surface of the view that just finished rendering. It is
	/// held until the next view completes, then released.
	pub fn end_video_view(&self, frame: DecodedFrame) {
		let released = {
			let mut state = self.lock();
			state.deferred_release.replace(frame)
		};
		// The previous surface drops outside the lock.
		drop(released);
	}

	/// Drop everything queued. The exchange stays usable; pausing and stream
	/// reconfiguration call this.
	pub fn clear(&self) {
		let dropped = {
			let mut state = self.lock();
			let queue = std::mem::take(&mut state.queue);
			let deferred = state.deferred_release.take();
			(queue, deferred)
		};
		drop(dropped);
		self.available.notify_all();
	}

	/// Shut the exchange down: wake the render thread and refuse further
	/// surfaces.
	pub fn close(&self) {
		{
			let mut state = self.lock();
			state.closed = true;
			state.queue.clear();
			state.deferred_release.take();
		}
		self.available.notify_all();
	}
}
