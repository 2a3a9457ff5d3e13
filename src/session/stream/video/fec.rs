//! Reassembly of forward-error-corrected video frames.
//!
//! Each frame is cut into fixed-size data shards plus Reed-Solomon parity
//! shards by the server. Shards arrive out of order and possibly not at all;
//! [`FecQueue`] collects them, recovers missing data shards when enough
//! parity arrived and exposes the reassembled frame exactly once.
//!
//! Shards of the frame after the current one may interleave with stragglers
//! of the current frame, so the queue tracks two adjacent frames at a time.
//! Recovery runs exactly once per frame, at the moment a shard of the next
//! frame proves that no more data shards of the current one are coming.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reed_solomon_erasure::{galois_8, ReedSolomon};

use crate::packet::VideoFrameHeader;

/// Maximum allowed number of shards in a frame (data + parity).
///
/// The codec operates on an 8-bit Galois field; frames whose geometry
/// computes to more shards than this are handled uncoded.
pub const MAX_SHARDS: usize = 255;

struct FrameAssembly {
	video_frame_index: u64,
	tracking_frame_index: u64,
	frame_byte_size: usize,
	shard_size: usize,
	data_shards: usize,
	parity_shards: usize,

	/// The contiguous data region, `data_shards * shard_size` bytes. The tail
	/// of the last data shard stays zero so all shards are equally sized for
	/// the codec.
	buffer: Vec<u8>,
	parity: Vec<Option<Vec<u8>>>,
	present: Vec<bool>,

	received_data_shards: usize,
	received_parity_shards: usize,

	complete: bool,
	delivered: bool,
	failed: bool,
	recovery_attempted: bool,
}

impl FrameAssembly {
	fn new(header: &VideoFrameHeader, shard_size: usize, parity_shards: usize) -> Result<Self, String> {
		if shard_size == 0 {
			return Err("first shard of the frame has an empty payload".to_string());
		}
		if header.frame_byte_size == 0 {
			return Err("frame byte size is zero".to_string());
		}

		let frame_byte_size = header.frame_byte_size as usize;
		let data_shards = frame_byte_size.div_ceil(shard_size);

		Ok(Self {
			video_frame_index: header.video_frame_index,
			tracking_frame_index: header.tracking_frame_index,
			frame_byte_size,
			shard_size,
			data_shards,
			parity_shards,
			buffer: vec![0u8; data_shards * shard_size],
			parity: vec![None; parity_shards],
			present: vec![false; data_shards + parity_shards],
			received_data_shards: 0,
			received_parity_shards: 0,
			complete: false,
			delivered: false,
			failed: false,
			recovery_attempted: false,
		})
	}

	/// A placeholder that swallows further shards of a frame whose geometry
	/// was already rejected.
	fn poisoned(header: &VideoFrameHeader) -> Self {
		Self {
			video_frame_index: header.video_frame_index,
			tracking_frame_index: header.tracking_frame_index,
			frame_byte_size: 0,
			shard_size: 1,
			data_shards: 0,
			parity_shards: 0,
			buffer: Vec::new(),
			parity: Vec::new(),
			present: Vec::new(),
			received_data_shards: 0,
			received_parity_shards: 0,
			complete: false,
			delivered: false,
			failed: true,
			recovery_attempted: true,
		}
	}

	fn total_shards(&self) -> usize {
		self.data_shards + self.parity_shards
	}

	fn expected_shard_len(&self, index: usize) -> usize {
		if index == self.data_shards - 1 {
			self.frame_byte_size - (self.data_shards - 1) * self.shard_size
		} else {
			self.shard_size
		}
	}

	fn add_shard(&mut self, header: &VideoFrameHeader, payload: &[u8]) -> Result<(), String> {
		let index = header.fec_index as usize;
		if index >= self.total_shards() {
			return Err(format!(
				"shard index {index} is out of range for {} data and {} parity shards",
				self.data_shards, self.parity_shards,
			));
		}

		let expected = self.expected_shard_len(index);
		if payload.len() != expected {
			return Err(format!(
				"shard {index} has {} bytes, expected {expected}",
				payload.len(),
			));
		}

		if self.present[index] {
			// Retransmitted or duplicated shard.
			return Ok(());
		}

		if index < self.data_shards {
			let start = index * self.shard_size;
			self.buffer[start..start + payload.len()].copy_from_slice(payload);
			self.received_data_shards += 1;
		} else {
			self.parity[index - self.data_shards] = Some(payload.to_vec());
			self.received_parity_shards += 1;
		}
		self.present[index] = true;

		if self.received_data_shards == self.data_shards {
			self.complete = true;
		}

		Ok(())
	}

	fn try_recover(&mut self, decoders: &mut FecDecoders) -> bool {
		if self.complete {
			return true;
		}
		if self.parity_shards == 0
			|| self.received_data_shards + self.received_parity_shards < self.data_shards
		{
			return false;
		}

		let Ok(decoder) = decoders.get(self.data_shards, self.parity_shards) else {
			return false;
		};

		let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(self.total_shards());
		for index in 0..self.data_shards {
			shards.push(self.present[index].then(|| {
				let start = index * self.shard_size;
				self.buffer[start..start + self.shard_size].to_vec()
			}));
		}
		for parity in &self.parity {
			shards.push(parity.clone());
		}

		if let Err(e) = decoder.reconstruct_data(&mut shards) {
			tracing::debug!("Failed to reconstruct video frame {}: {e}", self.video_frame_index);
			return false;
		}

		for (index, shard) in shards.iter().take(self.data_shards).enumerate() {
			if !self.present[index] {
				let Some(shard) = shard else {
					tracing::debug!("Codec did not produce data shard {index}.");
					return false;
				};
				let start = index * self.shard_size;
				self.buffer[start..start + self.shard_size].copy_from_slice(shard);
				self.present[index] = true;
				self.received_data_shards += 1;
			}
		}

		self.complete = true;
		true
	}
}

/// Cache of codec instances per shard geometry, so repeated frames with the
/// same layout reuse the generated matrices.
struct FecDecoders {
	decoders: HashMap<(usize, usize), ReedSolomon<galois_8::Field>>,
}

impl FecDecoders {
	fn new() -> Self {
		Self { decoders: HashMap::new() }
	}

	fn get(&mut self, data_shards: usize, parity_shards: usize) -> Result<&ReedSolomon<galois_8::Field>, ()> {
		Ok(match self.decoders.entry((data_shards, parity_shards)) {
			Entry::Occupied(e) => e.into_mut(),
			Entry::Vacant(e) => e.insert(
				ReedSolomon::<galois_8::Field>::new(data_shards, parity_shards)
					.map_err(|e| tracing::error!("Couldn't create error correction decoder: {e}"))?,
			),
		})
	}
}

/// Shard reconstruction queue for the video stream.
///
/// Call [`FecQueue::add_packet`] for every inbound video packet, then
/// [`FecQueue::reconstruct`]; when it returns `true` the reassembled frame is
/// available through [`FecQueue::frame_buffer`] until the next frame starts.
pub struct FecQueue {
	current: Option<FrameAssembly>,
	next: Option<FrameAssembly>,
	fec_decoders: FecDecoders,
	fec_failure: Arc<AtomicBool>,
	warned_unsupported_geometry: bool,
}

impl FecQueue {
	pub fn new(fec_failure: Arc<AtomicBool>) -> Self {
		Self {
			current: None,
			next: None,
			fec_decoders: FecDecoders::new(),
			fec_failure,
			warned_unsupported_geometry: false,
		}
	}

	/// Feed one video packet into the queue. Returns `true` when this packet
	/// made a frame fail, which is reported at most once per frame.
	pub fn add_packet(&mut self, header: &VideoFrameHeader, payload: &[u8]) -> bool {
		let video_frame_index = header.video_frame_index;

		// A delivered or failed frame is finished business once a newer
		// fingerprint shows up.
		if self
			.current
			.as_ref()
			.is_some_and(|c| (c.delivered || c.failed) && video_frame_index > c.video_frame_index)
		{
			self.current = self.next.take();
		}

		let Some(current_index) = self.current.as_ref().map(|c| c.video_frame_index) else {
			return self.add_to_current(header, payload);
		};

		if video_frame_index == current_index {
			return self.add_to_current(header, payload);
		}

		if video_frame_index < current_index {
			// A straggler of a frame that was already finalized.
			tracing::trace!(
				"Dropping shard of stale video frame {video_frame_index} while reassembling {current_index}."
			);
			return false;
		}

		// A shard of a newer frame. The window tracks exactly two frames, so
		// anything beyond the immediate next frame shifts the window first.
		if let Some(next_index) = self.next.as_ref().map(|n| n.video_frame_index) {
			if video_frame_index < next_index {
				tracing::trace!(
					"Dropping shard of video frame {video_frame_index} between reassembly window {current_index} and {next_index}."
				);
				return false;
			}
			if video_frame_index > next_index {
				let mut failed = self.fail_current();
				self.current = self.next.take();
				failed |= self.add_packet(header, payload);
				return failed;
			}
		}

		let mut failed = self.add_to_next(header, payload);

		// The current frame will not receive more data shards: one shot at
		// Reed-Solomon recovery, then move on.
		failed |= self.finalize_current();

		failed
	}

	fn add_to_current(&mut self, header: &VideoFrameHeader, payload: &[u8]) -> bool {
		Self::add_to_slot(
			&mut self.current,
			header,
			payload,
			&self.fec_failure,
			&mut self.warned_unsupported_geometry,
		)
	}

	fn add_to_next(&mut self, header: &VideoFrameHeader, payload: &[u8]) -> bool {
		Self::add_to_slot(
			&mut self.next,
			header,
			payload,
			&self.fec_failure,
			&mut self.warned_unsupported_geometry,
		)
	}

	fn add_to_slot(
		slot: &mut Option<FrameAssembly>,
		header: &VideoFrameHeader,
		payload: &[u8],
		fec_failure: &Arc<AtomicBool>,
		warned_unsupported_geometry: &mut bool,
	) -> bool {
		if slot.is_none() {
			let parity_shards = Self::parity_shards(header, payload.len(), warned_unsupported_geometry);
			match FrameAssembly::new(header, payload.len(), parity_shards) {
				Ok(frame) => *slot = Some(frame),
				Err(e) => {
					tracing::warn!("Dropping video frame {}: {e}.", header.video_frame_index);
					fec_failure.store(true, Ordering::Relaxed);
					// Poison the slot so later shards of this frame are
					// swallowed without reporting the failure again.
					*slot = Some(FrameAssembly::poisoned(header));
					return true;
				},
			}
		}

		let Some(frame) = slot.as_mut() else {
			return false;
		};
		if frame.failed || frame.complete {
			return false;
		}

		match frame.add_shard(header, payload) {
			Ok(()) => false,
			Err(e) => {
				tracing::warn!("Dropping video frame {}: {e}.", frame.video_frame_index);
				frame.failed = true;
				fec_failure.store(true, Ordering::Relaxed);
				true
			},
		}
	}

	/// Parity count derived from the header, with the fallbacks for
	/// percentages or shard counts the codec cannot represent.
	fn parity_shards(header: &VideoFrameHeader, shard_size: usize, warned: &mut bool) -> usize {
		if header.fec_percentage == 0 || shard_size == 0 || header.frame_byte_size == 0 {
			return 0;
		}

		let fec_percentage = header.fec_percentage as usize;
		let data_shards = (header.frame_byte_size as usize).div_ceil(shard_size);

		if fec_percentage >= 100 {
			if !*warned {
				tracing::warn!("Unsupported FEC percentage {fec_percentage}, treating the stream as uncoded.");
				*warned = true;
			}
			return 0;
		}

		let parity_shards = (data_shards * fec_percentage).div_ceil(100 - fec_percentage);
		if data_shards + parity_shards > MAX_SHARDS {
			if !*warned {
				tracing::warn!(
					"Frame geometry of {data_shards} data and {parity_shards} parity shards exceeds {MAX_SHARDS}, treating the stream as uncoded."
				);
				*warned = true;
			}
			return 0;
		}

		parity_shards
	}

	fn finalize_current(&mut self) -> bool {
		let Some(current) = self.current.as_mut() else {
			return false;
		};
		if current.complete || current.delivered || current.failed || current.recovery_attempted {
			return false;
		}

		current.recovery_attempted = true;
		if current.try_recover(&mut self.fec_decoders) {
			return false;
		}

		tracing::debug!(
			"Unrecoverable video frame {}: {} of {} data shards and {} of {} parity shards received.",
			current.video_frame_index,
			current.received_data_shards,
			current.data_shards,
			current.received_parity_shards,
			current.parity_shards,
		);
		self.fail_current()
	}

	fn fail_current(&mut self) -> bool {
		let Some(current) = self.current.as_mut() else {
			return false;
		};
		if current.delivered || current.failed {
			self.current = self.next.take();
			return false;
		}

		current.failed = true;
		self.fec_failure.store(true, Ordering::Relaxed);
		self.current = self.next.take();
		true
	}

	/// True exactly once per frame, when the reassembled frame first becomes
	/// available.
	pub fn reconstruct(&mut self) -> bool {
		let Some(current) = self.current.as_mut() else {
			return false;
		};
		if current.complete && !current.delivered && !current.failed {
			current.delivered = true;
			true
		} else {
			false
		}
	}

	/// The reassembled frame, valid after [`FecQueue::reconstruct`] returned
	/// `true` and until the next frame starts.
	pub fn frame_buffer(&self) -> &[u8] {
		match &self.current {
			Some(current) if current.delivered => &current.buffer[..current.frame_byte_size],
			_ => &[],
		}
	}

	pub fn frame_byte_size(&self) -> usize {
		match &self.current {
			Some(current) if current.delivered => current.frame_byte_size,
			_ => 0,
		}
	}

	/// Tracking frame index of the reassembled frame.
	pub fn tracking_frame_index(&self) -> u64 {
		match &self.current {
			Some(current) if current.delivered => current.tracking_frame_index,
			_ => u64::MAX,
		}
	}

	pub fn fec_failure(&self) -> bool {
		self.fec_failure.load(Ordering::Relaxed)
	}

	pub fn clear_fec_failure(&self) {
		self.fec_failure.store(false, Ordering::Relaxed);
	}
}
