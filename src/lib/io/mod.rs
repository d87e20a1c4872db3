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

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::min;
use std::io::{Read, Seek, SeekFrom, Write};
use crate::error::{CfbError, CfbResult};

/// Any backing store a compound file can live in (a `File`, a `Cursor<Vec<u8>>`, ...).
pub trait ReadWriteSeek: Read + Write + Seek { }
impl<T> ReadWriteSeek for T where T: Read + Write + Seek { }

const ZEROES: [u8; 512] = [0; 512];

/// Positioned access to the backing stream of a compound file.
///
/// Keeps track of the logical length of the stream, so that newly allocated sectors can be
/// materialised (zero-filled) before they are referenced by any chain.
pub struct SectorIo<F> {
	inner: F,
	length: u64,
	sector_size: u32,
	writable: bool,
}

impl<F> SectorIo<F> where F: ReadWriteSeek {
	pub fn new(mut inner: F, sector_size: u32, writable: bool) -> CfbResult<SectorIo<F>> {
		let length = inner.seek(SeekFrom::End(0))?;
		Ok(SectorIo { inner, length, sector_size, writable })
	}

	pub fn sector_size(&self) -> u32 {
		self.sector_size
	}

	pub(crate) fn set_sector_size(&mut self, sector_size: u32) {
		self.sector_size = sector_size;
	}

	pub fn is_writable(&self) -> bool {
		self.writable
	}

	pub fn len(&self) -> u64 {
		self.length
	}

	pub fn is_empty(&self) -> bool {
		self.length == 0
	}

	/// Number of sectors following the header, counting a trailing partial sector as a whole one.
	pub fn sector_count(&self) -> u32 {
		let sector_size = self.sector_size as u64;
		let body = self.length.saturating_sub(sector_size);
		((body + sector_size - 1) / sector_size) as u32
	}

	pub fn read_exact_at(&mut self, position: u64, buffer: &mut [u8]) -> CfbResult<()> {
		self.inner.seek(SeekFrom::Start(position))?;
		self.inner.read_exact(buffer)?;
		Ok(())
	}

	pub fn read_u32_at(&mut self, position: u64) -> CfbResult<u32> {
		self.inner.seek(SeekFrom::Start(position))?;
		Ok(self.inner.read_u32::<LittleEndian>()?)
	}

	pub fn write_all_at(&mut self, position: u64, buffer: &[u8]) -> CfbResult<()> {
		self.ensure_writable()?;
		self.inner.seek(SeekFrom::Start(position))?;
		self.inner.write_all(buffer)?;
		let end = position + buffer.len() as u64;
		if end > self.length {
			self.length = end;
		}
		Ok(())
	}

	pub fn write_u32_at(&mut self, position: u64, value: u32) -> CfbResult<()> {
		self.ensure_writable()?;
		self.inner.seek(SeekFrom::Start(position))?;
		self.inner.write_u32::<LittleEndian>(value)?;
		if position + 4 > self.length {
			self.length = position + 4;
		}
		Ok(())
	}

	/// Fills `length` bytes starting at `position` with `value` repeated as little-endian u32.
	pub fn fill_u32_at(&mut self, position: u64, length: u32, value: u32) -> CfbResult<()> {
		let mut buffer = Vec::with_capacity(length as usize);
		for _ in 0..length / 4 {
			buffer.write_u32::<LittleEndian>(value)?;
		}
		self.write_all_at(position, &buffer)
	}

	pub fn zero_at(&mut self, position: u64, length: u64) -> CfbResult<()> {
		self.ensure_writable()?;
		self.inner.seek(SeekFrom::Start(position))?;
		let mut remaining = length;
		while remaining > 0 {
			let chunk = min(remaining, ZEROES.len() as u64) as usize;
			self.inner.write_all(&ZEROES[..chunk])?;
			remaining -= chunk as u64;
		}
		if position + length > self.length {
			self.length = position + length;
		}
		Ok(())
	}

	/// Grows the stream with zeroes up to `end`. Does nothing if the stream is already long enough.
	pub fn extend_length(&mut self, end: u64) -> CfbResult<()> {
		if end > self.length {
			let start = self.length;
			self.zero_at(start, end - start)?;
		}
		Ok(())
	}

	pub fn flush(&mut self) -> CfbResult<()> {
		if self.writable {
			self.inner.flush()?;
		}
		Ok(())
	}

	pub fn into_inner(self) -> F {
		self.inner
	}

	fn ensure_writable(&self) -> CfbResult<()> {
		if self.writable {
			Ok(())
		}
		else {
			Err(CfbError::NotSupported("the compound file was opened read-only".to_owned()))
		}
	}
}
