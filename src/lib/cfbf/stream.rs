/*
cfbf library & toolset
Copyright (C) 2018 Steve Muller <steve.muller@outlook.com>

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

use log::{debug, trace, warn};
use std::cmp::min;
use std::convert::TryFrom;
use std::io::{self, Read, Seek, SeekFrom, Write};
use super::chain::ChainEnumerator;
use super::directory::DirectoryEntry;
use super::entries::DirectoryEntries;
use super::fat::{Fat, SectorStore};
use super::minifat::MiniFat;
use super::storage::EntryInfo;
use super::structures::{sector_type, stream_id, Version, MINI_STREAM_CUTOFF};
use super::RootContext;
use crate::error::{CfbError, CfbResult};
use crate::io::ReadWriteSeek;

/// Largest stream a version 3 file can describe.
const V3_MAX_STREAM_LENGTH: u64 = 0x8000_0000;
const ZEROES: [u8; 4096] = [0; 4096];

/// Byte-level access to the content of one directory entry, stored in a chain of blocks of
/// either the FAT or the mini-FAT.
struct ChainStream {
	id: u32,
	length: u64,
	position: u64,
	chain: ChainEnumerator,
	dirty: bool,
}

impl ChainStream {
	fn new(id: u32, start_sector_id: u32, length: u64) -> ChainStream {
		ChainStream {
			id,
			length,
			position: 0,
			chain: ChainEnumerator::new(start_sector_id),
			dirty: false,
		}
	}

	fn block_index(&self, position: u64, block_size: u64) -> CfbResult<u32> {
		u32::try_from(position / block_size)
			.map_err(|_| CfbError::InvalidArgument(format!("position {} is beyond the largest possible stream", position)))
	}

	fn read<S: SectorStore>(&mut self, store: &mut S, buffer: &mut [u8]) -> CfbResult<usize> {
		if self.position >= self.length {
			return Ok(0);
		}
		let count = min(buffer.len() as u64, self.length - self.position) as usize;
		let block_size = store.block_size() as u64;
		let mut done = 0;
		while done < count {
			let index = self.block_index(self.position, block_size)?;
			let offset = self.position % block_size;
			if !self.chain.move_to(store, index)? {
				return Err(CfbError::corrupt(format!("chain of entry #{} is shorter than its length {}", self.id, self.length)));
			}
			let id = self.chain.current()
				.ok_or_else(|| CfbError::corrupt("stream enumerator lost its position"))?;
			let chunk = min(block_size - offset, (count - done) as u64) as usize;
			store.read_block(id, offset as u32, &mut buffer[done..done + chunk])?;
			done += chunk;
			self.position += chunk as u64;
		}
		Ok(count)
	}

	/// Writes `buffer` at `position`, appending blocks to the chain as needed. Does not touch the length.
	fn write_blocks<S: SectorStore>(&mut self, store: &mut S, position: u64, buffer: &[u8]) -> CfbResult<()> {
		let block_size = store.block_size() as u64;
		let mut position = position;
		let mut done = 0;
		while done < buffer.len() {
			let index = self.block_index(position, block_size)?;
			let offset = position % block_size;
			while !self.chain.move_to(store, index)? {
				self.chain.extend_from(store, 0)?;
			}
			let id = self.chain.current()
				.ok_or_else(|| CfbError::corrupt("stream enumerator lost its position"))?;
			let chunk = min(block_size - offset, (buffer.len() - done) as u64) as usize;
			store.write_block(id, offset as u32, &buffer[done..done + chunk])?;
			done += chunk;
			position += chunk as u64;
		}
		Ok(())
	}

	fn write<S: SectorStore>(&mut self, store: &mut S, buffer: &[u8]) -> CfbResult<()> {
		if buffer.is_empty() {
			return Ok(());
		}
		let position = self.position;
		let end = write_end(position, buffer)?;
		if position > self.length {
			self.set_len(store, position)?;
		}
		self.write_blocks(store, position, buffer)?;
		self.position = end;
		if end > self.length {
			self.length = end;
		}
		self.dirty = true;
		Ok(())
	}

	/// Resizes the chain to hold exactly `length` bytes. Bytes gained are zeroed.
	fn set_len<S: SectorStore>(&mut self, store: &mut S, length: u64) -> CfbResult<()> {
		let block_size = store.block_size() as u64;
		let mut required = self.block_index(length, block_size)?;
		if length % block_size != 0 {
			required = required.checked_add(1)
				.ok_or_else(|| CfbError::InvalidArgument(format!("length {} is beyond the largest possible stream", length)))?;
		}
		let current = self.chain.len(store)?;
		if required > current {
			self.chain.extend(store, required)?;
		}
		else if required < current {
			self.chain.shrink(store, required)?;
		}

		let mut position = self.length;
		while position < length {
			let chunk = min(length - position, ZEROES.len() as u64) as usize;
			self.write_blocks(store, position, &ZEROES[..chunk])?;
			position += chunk as u64;
		}
		trace!("[stream_set_len] Entry #{} resized from {} to {} bytes ({} blocks).", self.id, self.length, length, required);
		self.length = length;
		self.dirty = true;
		Ok(())
	}

	/// Writes start sector and length back into the directory entry.
	fn flush_entry<F: ReadWriteSeek>(&mut self, entries: &mut DirectoryEntries<'_, F>) -> CfbResult<()> {
		if !self.dirty {
			return Ok(());
		}
		let mut entry = entries.get(self.id)?;
		entry.start_sector_id = self.chain.start_id();
		entry.stream_length = self.length;
		entries.write(&entry)?;
		self.dirty = false;
		Ok(())
	}
}

/// A stream whose content lives in regular sectors.
pub struct FatStream(ChainStream);

impl FatStream {
	pub fn new(id: u32, start_sector_id: u32, length: u64) -> FatStream {
		FatStream(ChainStream::new(id, start_sector_id, length))
	}

	pub fn len(&self) -> u64 {
		self.0.length
	}

	pub fn is_empty(&self) -> bool {
		self.0.length == 0
	}

	pub fn read<F: ReadWriteSeek>(&mut self, fat: &mut Fat<'_, F>, buffer: &mut [u8]) -> CfbResult<usize> {
		self.0.read(fat, buffer)
	}

	pub fn write<F: ReadWriteSeek>(&mut self, fat: &mut Fat<'_, F>, buffer: &[u8]) -> CfbResult<()> {
		self.0.write(fat, buffer)
	}

	pub fn set_len<F: ReadWriteSeek>(&mut self, fat: &mut Fat<'_, F>, length: u64) -> CfbResult<()> {
		self.0.set_len(fat, length)
	}

	pub fn read_exact_at<F: ReadWriteSeek>(&mut self, fat: &mut Fat<'_, F>, position: u64, buffer: &mut [u8]) -> CfbResult<()> {
		self.0.position = position;
		if self.0.read(fat, buffer)? < buffer.len() {
			return Err(CfbError::corrupt(format!("read of {} bytes at {} goes past the end of entry #{}", buffer.len(), position, self.0.id)));
		}
		Ok(())
	}

	pub fn write_all_at<F: ReadWriteSeek>(&mut self, fat: &mut Fat<'_, F>, position: u64, buffer: &[u8]) -> CfbResult<()> {
		self.0.position = position;
		self.0.write(fat, buffer)
	}

	pub fn flush_entry<F: ReadWriteSeek>(&mut self, entries: &mut DirectoryEntries<'_, F>) -> CfbResult<()> {
		self.0.flush_entry(entries)
	}
}

/// A stream shorter than the cutoff, stored in 64-byte mini-sectors of the mini-stream.
pub struct MiniFatStream(ChainStream);

impl MiniFatStream {
	pub fn new(id: u32, start_sector_id: u32, length: u64) -> MiniFatStream {
		MiniFatStream(ChainStream::new(id, start_sector_id, length))
	}

	pub fn read<F: ReadWriteSeek>(&mut self, mini_fat: &mut MiniFat<'_, F>, buffer: &mut [u8]) -> CfbResult<usize> {
		self.0.read(mini_fat, buffer)
	}

	pub fn write<F: ReadWriteSeek>(&mut self, mini_fat: &mut MiniFat<'_, F>, buffer: &[u8]) -> CfbResult<()> {
		let end = write_end(self.0.position, buffer)?;
		if end > self.0.length {
			self.set_len(mini_fat, end)?;
		}
		self.0.write(mini_fat, buffer)
	}

	pub fn set_len<F: ReadWriteSeek>(&mut self, mini_fat: &mut MiniFat<'_, F>, length: u64) -> CfbResult<()> {
		if length >= MINI_STREAM_CUTOFF as u64 {
			return Err(CfbError::NotSupported(format!("mini streams must be shorter than {} bytes", MINI_STREAM_CUTOFF)));
		}
		self.0.set_len(mini_fat, length)
	}

	pub fn flush_entry<F: ReadWriteSeek>(&mut self, entries: &mut DirectoryEntries<'_, F>) -> CfbResult<()> {
		self.0.flush_entry(entries)
	}
}

enum Backing {
	Mini(MiniFatStream),
	Fat(FatStream),
}

impl Backing {
	fn core(&self) -> &ChainStream {
		match self {
			Backing::Mini(stream) => &stream.0,
			Backing::Fat(stream) => &stream.0,
		}
	}

	fn core_mut(&mut self) -> &mut ChainStream {
		match self {
			Backing::Mini(stream) => &mut stream.0,
			Backing::Fat(stream) => &mut stream.0,
		}
	}
}

/// An open stream of a compound file.
///
/// Streams shorter than 4096 bytes live in the mini-stream; the content is moved between the
/// mini-stream and regular sectors transparently whenever the length crosses that boundary.
/// The directory entry is updated on `flush` and when the stream is dropped.
pub struct CfbStream<'a, F: ReadWriteSeek> {
	ctx: &'a mut RootContext<F>,
	backing: Backing,
}

impl<'a, F> CfbStream<'a, F> where F: ReadWriteSeek {
	pub(crate) fn open(ctx: &'a mut RootContext<F>, entry: &DirectoryEntry) -> CfbStream<'a, F> {
		let backing = if entry.stream_length < MINI_STREAM_CUTOFF as u64 {
			Backing::Mini(MiniFatStream::new(entry.id, entry.start_sector_id, entry.stream_length))
		}
		else {
			Backing::Fat(FatStream::new(entry.id, entry.start_sector_id, entry.stream_length))
		};
		CfbStream { ctx, backing }
	}

	pub fn id(&self) -> u32 {
		self.backing.core().id
	}

	pub fn len(&self) -> u64 {
		self.backing.core().length
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn position(&self) -> u64 {
		self.backing.core().position
	}

	/// Whether the content currently lives in the mini-stream.
	pub fn is_mini(&self) -> bool {
		match self.backing {
			Backing::Mini(_) => true,
			Backing::Fat(_) => false,
		}
	}

	pub fn entry_info(&mut self) -> CfbResult<EntryInfo> {
		self.flush_entry()?;
		let id = self.id();
		let entry = self.ctx.directory_entries().get(id)?;
		Ok(EntryInfo::from_entry(&entry))
	}

	fn ensure_writable(&self) -> CfbResult<()> {
		self.ctx.check_disposed()?;
		if self.ctx.io.is_writable() {
			Ok(())
		}
		else {
			Err(CfbError::NotSupported("the compound file was opened read-only".to_owned()))
		}
	}

	/// Truncates or zero-extends the stream, moving it in or out of the mini-stream as needed.
	/// The position is left untouched.
	pub fn set_len(&mut self, length: u64) -> CfbResult<()> {
		self.ensure_writable()?;
		if self.ctx.header.version == Version::V3 && length > V3_MAX_STREAM_LENGTH {
			return Err(CfbError::InvalidArgument(format!("version 3 streams are limited to {} bytes", V3_MAX_STREAM_LENGTH)));
		}
		if length / self.ctx.header.sector_size() as u64 >= sector_type::MAXIMUM as u64 {
			return Err(CfbError::InvalidArgument(format!("length {} needs more sectors than a chain can hold", length)));
		}
		let cutoff = MINI_STREAM_CUTOFF as u64;
		let ctx = &mut *self.ctx;
		let migrated = match &mut self.backing {
			Backing::Mini(stream) if length >= cutoff => {
				let id = stream.0.id;
				let position = stream.0.position;
				let mut content = vec![0u8; stream.0.length as usize];
				stream.0.position = 0;
				stream.read(&mut ctx.mini_fat(), &mut content)?;
				stream.set_len(&mut ctx.mini_fat(), 0)?;
				stream.flush_entry(&mut ctx.directory_entries())?;

				let mut target = FatStream::new(id, stream_id::NO_STREAM, 0);
				let mut fat = ctx.fat();
				target.write(&mut fat, &content)?;
				target.set_len(&mut fat, length)?;
				target.0.position = position;
				debug!("[stream_set_len] Moved entry #{} ({} bytes) out of the mini-stream.", id, content.len());
				Some(Backing::Fat(target))
			},
			Backing::Fat(stream) if length < cutoff => {
				let id = stream.0.id;
				let position = stream.0.position;
				let mut content = vec![0u8; min(length, stream.0.length) as usize];
				stream.0.position = 0;
				stream.read(&mut ctx.fat(), &mut content)?;
				stream.set_len(&mut ctx.fat(), 0)?;
				stream.flush_entry(&mut ctx.directory_entries())?;

				let mut target = MiniFatStream::new(id, stream_id::NO_STREAM, 0);
				let mut mini_fat = ctx.mini_fat();
				target.write(&mut mini_fat, &content)?;
				target.set_len(&mut mini_fat, length)?;
				target.0.position = position;
				debug!("[stream_set_len] Moved entry #{} ({} bytes) into the mini-stream.", id, content.len());
				Some(Backing::Mini(target))
			},
			Backing::Mini(stream) => {
				stream.set_len(&mut ctx.mini_fat(), length)?;
				None
			},
			Backing::Fat(stream) => {
				stream.set_len(&mut ctx.fat(), length)?;
				None
			},
		};
		if let Some(backing) = migrated {
			self.backing = backing;
		}
		Ok(())
	}

	fn write_bytes(&mut self, buffer: &[u8]) -> CfbResult<()> {
		self.ensure_writable()?;
		if buffer.is_empty() {
			return Ok(());
		}
		let end = write_end(self.position(), buffer)?;
		if self.ctx.header.version == Version::V3 && end > V3_MAX_STREAM_LENGTH {
			return Err(CfbError::InvalidArgument(format!("version 3 streams are limited to {} bytes", V3_MAX_STREAM_LENGTH)));
		}
		if self.is_mini() && end >= MINI_STREAM_CUTOFF as u64 {
			self.set_len(end.max(self.len()))?;
		}
		let ctx = &mut *self.ctx;
		match &mut self.backing {
			Backing::Mini(stream) => stream.write(&mut ctx.mini_fat(), buffer),
			Backing::Fat(stream) => stream.write(&mut ctx.fat(), buffer),
		}
	}

	fn read_bytes(&mut self, buffer: &mut [u8]) -> CfbResult<usize> {
		self.ctx.check_disposed()?;
		let ctx = &mut *self.ctx;
		match &mut self.backing {
			Backing::Mini(stream) => stream.read(&mut ctx.mini_fat(), buffer),
			Backing::Fat(stream) => stream.read(&mut ctx.fat(), buffer),
		}
	}

	fn flush_entry(&mut self) -> CfbResult<()> {
		if !self.backing.core().dirty {
			return Ok(());
		}
		let ctx = &mut *self.ctx;
		match &mut self.backing {
			Backing::Mini(stream) => stream.flush_entry(&mut ctx.directory_entries()),
			Backing::Fat(stream) => stream.flush_entry(&mut ctx.directory_entries()),
		}
	}

	/// Writes the directory entry and every pending table change to the backing stream.
	pub fn flush_all(&mut self) -> CfbResult<()> {
		self.ctx.check_disposed()?;
		self.flush_entry()?;
		self.ctx.flush()
	}
}

impl<'a, F> Read for CfbStream<'a, F> where F: ReadWriteSeek {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		Ok(self.read_bytes(buf)?)
	}
}

impl<'a, F> Write for CfbStream<'a, F> where F: ReadWriteSeek {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.write_bytes(buf)?;
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(self.flush_all()?)
	}
}

impl<'a, F> Seek for CfbStream<'a, F> where F: ReadWriteSeek {
	fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
		let target = match pos {
			SeekFrom::Start(offset) => Some(offset),
			SeekFrom::Current(delta) => offset_by(self.position(), delta),
			SeekFrom::End(delta) => offset_by(self.len(), delta),
		};
		match target {
			Some(position) => {
				self.backing.core_mut().position = position;
				Ok(position)
			},
			None => Err(CfbError::InvalidSeek.into()),
		}
	}
}

fn write_end(position: u64, buffer: &[u8]) -> CfbResult<u64> {
	position.checked_add(buffer.len() as u64)
		.ok_or_else(|| CfbError::InvalidArgument(format!("writing {} bytes at {} overflows the stream length", buffer.len(), position)))
}

fn offset_by(base: u64, delta: i64) -> Option<u64> {
	if delta >= 0 {
		base.checked_add(delta as u64)
	}
	else {
		base.checked_sub(delta.unsigned_abs())
	}
}

impl<'a, F> Drop for CfbStream<'a, F> where F: ReadWriteSeek {
	fn drop(&mut self) {
		if self.ctx.check_disposed().is_err() || !self.ctx.io.is_writable() {
			return;
		}
		if let Err(e) = self.flush_entry() {
			warn!("[stream_drop] Could not update directory entry #{}: {}", self.id(), e);
		}
	}
}
