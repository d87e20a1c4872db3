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

pub mod chain;
pub mod directory;
pub mod entries;
pub mod fat;
pub mod minifat;
pub mod storage;
pub mod stream;
pub mod structures;
pub mod tree;

pub use self::directory::EntryType;
pub use self::storage::{EntryInfo, OpenMode, RootStorage, Storage};
pub use self::stream::CfbStream;
pub use self::structures::Version;

use log::debug;
use self::directory::EntryType as Kind;
use self::entries::{DirectoryEntries, DirectoryState};
use self::fat::{Fat, FatState};
use self::minifat::{MiniFat, MiniFatState};
use self::stream::FatStream;
use self::structures::{sector_type, stream_id, Header, HEADER_SIZE};
use crate::error::{CfbError, CfbResult};
use crate::io::{ReadWriteSeek, SectorIo};

/// Name of directory entry #0.
pub const ROOT_ENTRY_NAME: &str = "Root Entry";

/// Everything that is shared by the storages and streams of one compound file: the backing
/// stream, the header and the state of the allocation tables and of the directory.
///
/// Components never hold on to each other; they borrow what they need from here through
/// the `fat`, `mini_fat` and `directory_entries` accessors.
pub struct RootContext<F> {
	pub io: SectorIo<F>,
	pub header: Header,
	fat: FatState,
	mini_fat: MiniFatState,
	directory: DirectoryState,
	disposed: bool,
}

impl<F> RootContext<F> where F: ReadWriteSeek {
	/// Lays out an empty compound file: header, one FAT sector, one directory sector holding the
	/// root entry. `inner` must be empty.
	pub fn create(inner: F, version: Version) -> CfbResult<RootContext<F>> {
		let header = Header::new(version);
		let mut io = SectorIo::new(inner, version.sector_size(), true)?;
		if !io.is_empty() {
			return Err(CfbError::InvalidArgument(format!("cannot create a compound file over {} bytes of existing content", io.len())));
		}
		io.write_all_at(0, &header.to_bytes()?)?;
		io.extend_length(version.sector_size() as u64)?;

		let mut ctx = RootContext {
			io,
			header,
			fat: FatState::new(),
			mini_fat: MiniFatState::new(sector_type::END_OF_CHAIN, FatStream::new(0, stream_id::NO_STREAM, 0)),
			directory: DirectoryState::new(sector_type::END_OF_CHAIN),
			disposed: false,
		};
		let root = ctx.directory_entries().create_or_recycle(ROOT_ENTRY_NAME, Kind::Root)?;
		if root.id != 0 {
			return Err(CfbError::corrupt(format!("root entry was created as #{}", root.id)));
		}
		ctx.flush()?;
		debug!("[create] Created version {} compound file.", version as u16);
		Ok(ctx)
	}

	pub fn open(inner: F, writable: bool) -> CfbResult<RootContext<F>> {
		let mut io = SectorIo::new(inner, HEADER_SIZE as u32, writable)?;
		if io.len() < HEADER_SIZE as u64 {
			return Err(CfbError::MalformedHeader(format!("file is only {} bytes long", io.len())));
		}
		let mut buffer = [0u8; HEADER_SIZE];
		io.read_exact_at(0, &mut buffer)?;
		let header = Header::parse(&buffer)?;
		io.set_sector_size(header.sector_size());
		debug!("[open] Version {} file, {} FAT sectors, {} mini-FAT sectors, {} DIFAT sectors.",
			header.version as u16, header.number_of_fat_sectors, header.number_of_mini_fat_sectors, header.number_of_difat_sectors);

		let mut ctx = RootContext {
			io,
			fat: FatState::new(),
			mini_fat: MiniFatState::new(header.first_mini_fat_sector_id, FatStream::new(0, stream_id::NO_STREAM, 0)),
			directory: DirectoryState::new(header.first_directory_sector_id),
			header,
			disposed: false,
		};
		let root = ctx.directory_entries().try_get(0)?
			.ok_or_else(|| CfbError::corrupt("directory has no root entry"))?;
		if root.entry_type != Kind::Root {
			return Err(CfbError::corrupt(format!("entry #0 is a {:?}, not the root", root.entry_type)));
		}
		ctx.mini_fat.mini_stream = FatStream::new(0, root.start_sector_id, root.stream_length);
		Ok(ctx)
	}

	pub fn version(&self) -> Version {
		self.header.version
	}

	pub fn is_disposed(&self) -> bool {
		self.disposed
	}

	pub fn check_disposed(&self) -> CfbResult<()> {
		if self.disposed {
			Err(CfbError::ObjectDisposed)
		}
		else {
			Ok(())
		}
	}

	pub(crate) fn dispose(&mut self) {
		self.disposed = true;
	}

	pub fn fat(&mut self) -> Fat<'_, F> {
		Fat::new(&mut self.io, &mut self.header, &mut self.fat)
	}

	pub fn mini_fat(&mut self) -> MiniFat<'_, F> {
		MiniFat::new(Fat::new(&mut self.io, &mut self.header, &mut self.fat), &mut self.mini_fat)
	}

	pub fn directory_entries(&mut self) -> DirectoryEntries<'_, F> {
		DirectoryEntries::new(Fat::new(&mut self.io, &mut self.header, &mut self.fat), &mut self.directory)
	}

	/// Length of the mini-stream, which may be ahead of what the root entry says until the next flush.
	pub fn mini_stream_len(&self) -> u64 {
		self.mini_fat.mini_stream.len()
	}

	/// Writes the cached table sectors, the mini-stream location and the header.
	pub fn flush(&mut self) -> CfbResult<()> {
		if !self.io.is_writable() {
			return Ok(());
		}
		{
			let mut entries = DirectoryEntries::new(Fat::new(&mut self.io, &mut self.header, &mut self.fat), &mut self.directory);
			self.mini_fat.mini_stream.flush_entry(&mut entries)?;
		}
		self.mini_fat().flush()?;
		self.fat().flush()?;
		let header = self.header.to_bytes()?;
		self.io.write_all_at(0, &header)?;
		self.io.flush()
	}

	pub fn into_inner(self) -> F {
		self.io.into_inner()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn test_create_lays_out_minimal_file() {
		let ctx = RootContext::create(Cursor::new(Vec::new()), Version::V3).unwrap();
		assert_eq!(ctx.header.number_of_fat_sectors, 1);
		assert_eq!(ctx.header.difat[0], 0);
		assert_eq!(ctx.header.first_directory_sector_id, 1);
		let bytes = ctx.into_inner().into_inner();
		assert_eq!(bytes.len(), 3 * 512);
		assert_eq!(&bytes[0..8], &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]);
		assert_eq!(&bytes[512..520], &[0xFD, 0xFF, 0xFF, 0xFF, 0xFE, 0xFF, 0xFF, 0xFF]);
	}

	#[test]
	fn test_open_reads_back_root() {
		let ctx = RootContext::create(Cursor::new(Vec::new()), Version::V4).unwrap();
		let bytes = ctx.into_inner().into_inner();
		assert_eq!(bytes.len(), 3 * 4096);
		let mut ctx = RootContext::open(Cursor::new(bytes), false).unwrap();
		assert_eq!(ctx.version(), Version::V4);
		let root = ctx.directory_entries().get(0).unwrap();
		assert_eq!(root.name, ROOT_ENTRY_NAME);
		assert_eq!(root.start_sector_id, stream_id::NO_STREAM);
		assert_eq!(root.child_id, stream_id::NO_STREAM);
	}

	#[test]
	fn test_create_rejects_non_empty_stream() {
		match RootContext::create(Cursor::new(vec![1u8; 600]), Version::V4) {
			Err(CfbError::InvalidArgument(_)) => (),
			other => panic!("unexpected result: {:?}", other.err()),
		}
	}

	#[test]
	fn test_open_rejects_short_file() {
		match RootContext::open(Cursor::new(vec![0u8; 100]), false) {
			Err(CfbError::MalformedHeader(_)) => (),
			other => panic!("unexpected result: {:?}", other.err()),
		}
	}

	#[test]
	fn test_open_rejects_missing_root() {
		let ctx = RootContext::create(Cursor::new(Vec::new()), Version::V3).unwrap();
		let mut bytes = ctx.into_inner().into_inner();
		// Type byte of entry #0 in the directory sector.
		bytes[2 * 512 + 66] = 1;
		assert!(matches!(RootContext::open(Cursor::new(bytes), false), Err(CfbError::CorruptFormat(_))));
	}
}
