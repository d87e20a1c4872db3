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

use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::SystemTime;
use super::chain::ChainEnumerator;
use super::directory::{filetime_to_system_time, validate_name, DirectoryEntry, EntryType};
use super::stream::CfbStream;
use super::structures::{Header, Version, MINI_STREAM_CUTOFF};
use super::tree::{DirectoryTree, DirectoryTreeEnumerator};
use super::RootContext;
use crate::error::{CfbError, CfbResult};
use crate::io::ReadWriteSeek;

/// Access requested when opening an existing compound file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpenMode {
	ReadOnly,
	ReadWrite,
}

/// A snapshot of the metadata of one storage or stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
	pub id: u32,
	pub name: String,
	pub entry_type: EntryType,
	/// Content length in bytes; always 0 for storages other than the root.
	pub length: u64,
	pub clsid: [u8; 16],
	pub state_bits: u32,
	/// FILETIME (100ns ticks since 1601-01-01), 0 if not set.
	pub creation_time: u64,
	pub modified_time: u64,
}

impl EntryInfo {
	pub(crate) fn from_entry(entry: &DirectoryEntry) -> EntryInfo {
		EntryInfo {
			id: entry.id,
			name: entry.name.clone(),
			entry_type: entry.entry_type,
			length: if entry.entry_type == EntryType::Storage { 0 } else { entry.stream_length },
			clsid: entry.clsid,
			state_bits: entry.state_bits,
			creation_time: entry.creation_time,
			modified_time: entry.modified_time,
		}
	}

	pub fn is_storage(&self) -> bool {
		self.entry_type == EntryType::Storage || self.entry_type == EntryType::Root
	}

	pub fn is_stream(&self) -> bool {
		self.entry_type == EntryType::Stream
	}

	pub fn created(&self) -> Option<SystemTime> {
		filetime_to_system_time(self.creation_time)
	}

	pub fn modified(&self) -> Option<SystemTime> {
		filetime_to_system_time(self.modified_time)
	}
}

/// An open compound file.
///
/// Changes are written to the backing stream on `flush`, `close` and when the value is dropped.
pub struct RootStorage<F: ReadWriteSeek> {
	ctx: Option<RootContext<F>>,
}

impl<F> RootStorage<F> where F: ReadWriteSeek {
	/// Writes a new, empty compound file to `inner`, which must be empty.
	pub fn create(inner: F, version: Version) -> CfbResult<RootStorage<F>> {
		Ok(RootStorage { ctx: Some(RootContext::create(inner, version)?) })
	}

	pub fn open(inner: F, mode: OpenMode) -> CfbResult<RootStorage<F>> {
		Ok(RootStorage { ctx: Some(RootContext::open(inner, mode == OpenMode::ReadWrite)?) })
	}

	fn context(&mut self) -> CfbResult<&mut RootContext<F>> {
		match self.ctx.as_mut() {
			Some(ctx) if !ctx.is_disposed() => Ok(ctx),
			_ => Err(CfbError::ObjectDisposed),
		}
	}

	pub fn version(&self) -> CfbResult<Version> {
		match self.ctx.as_ref() {
			Some(ctx) if !ctx.is_disposed() => Ok(ctx.version()),
			_ => Err(CfbError::ObjectDisposed),
		}
	}

	/// A copy of the header as it will be written on the next flush.
	pub fn header(&self) -> CfbResult<Header> {
		match self.ctx.as_ref() {
			Some(ctx) if !ctx.is_disposed() => Ok(ctx.header.clone()),
			_ => Err(CfbError::ObjectDisposed),
		}
	}

	/// The root storage, i.e. directory entry #0.
	pub fn root(&mut self) -> CfbResult<Storage<'_, F>> {
		let ctx = self.context()?;
		Ok(Storage { ctx, id: 0 })
	}

	pub fn flush(&mut self) -> CfbResult<()> {
		self.context()?.flush()
	}

	/// Flushes and disposes the file. Closing twice is a no-op.
	pub fn close(&mut self) -> CfbResult<()> {
		match self.ctx.as_mut() {
			Some(ctx) if !ctx.is_disposed() => {
				let result = ctx.flush();
				ctx.dispose();
				debug!("[close] Compound file closed.");
				result
			},
			_ => Ok(()),
		}
	}

	/// Flushes and hands back the backing stream.
	pub fn into_inner(mut self) -> CfbResult<F> {
		let mut ctx = self.ctx.take().ok_or(CfbError::ObjectDisposed)?;
		if !ctx.is_disposed() {
			ctx.flush()?;
		}
		Ok(ctx.into_inner())
	}

	pub fn create_storage(&mut self, name: &str) -> CfbResult<Storage<'_, F>> {
		Storage::create_storage_in(self.context()?, 0, name)
	}

	pub fn create_stream(&mut self, name: &str) -> CfbResult<CfbStream<'_, F>> {
		Storage::create_stream_in(self.context()?, 0, name)
	}

	pub fn open_storage(&mut self, name: &str) -> CfbResult<Storage<'_, F>> {
		Storage::open_storage_in(self.context()?, 0, name)
	}

	pub fn open_stream(&mut self, name: &str) -> CfbResult<CfbStream<'_, F>> {
		Storage::open_stream_in(self.context()?, 0, name)
	}

	pub fn delete(&mut self, name: &str) -> CfbResult<()> {
		self.root()?.delete(name)
	}

	pub fn entries(&mut self) -> CfbResult<Vec<EntryInfo>> {
		self.root()?.entries()
	}
}

impl RootStorage<File> {
	pub fn create_file<P: AsRef<Path>>(path: P, version: Version) -> CfbResult<RootStorage<File>> {
		let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
		RootStorage::create(file, version)
	}

	pub fn open_file<P: AsRef<Path>>(path: P, mode: OpenMode) -> CfbResult<RootStorage<File>> {
		let file = OpenOptions::new().read(true).write(mode == OpenMode::ReadWrite).open(path)?;
		RootStorage::open(file, mode)
	}
}

impl<F> Drop for RootStorage<F> where F: ReadWriteSeek {
	fn drop(&mut self) {
		if let Err(e) = self.close() {
			warn!("[drop] Could not flush compound file: {}", e);
		}
	}
}

/// A folder of a compound file. Borrowing it borrows the whole file.
pub struct Storage<'a, F: ReadWriteSeek> {
	ctx: &'a mut RootContext<F>,
	id: u32,
}

impl<'a, F> Storage<'a, F> where F: ReadWriteSeek {
	pub fn id(&self) -> u32 {
		self.id
	}

	pub fn entry_info(&mut self) -> CfbResult<EntryInfo> {
		self.ctx.check_disposed()?;
		let mut entry = self.ctx.directory_entries().get(self.id)?;
		if entry.entry_type == EntryType::Root {
			entry.stream_length = self.ctx.mini_stream_len();
		}
		Ok(EntryInfo::from_entry(&entry))
	}

	/// The children of this storage, sorted the way they are stored.
	pub fn entries(&mut self) -> CfbResult<Vec<EntryInfo>> {
		self.ctx.check_disposed()?;
		Ok(list_children(self.ctx, self.id)?.iter().map(EntryInfo::from_entry).collect())
	}

	pub fn contains_entry(&mut self, name: &str) -> CfbResult<bool> {
		Ok(self.find(name)?.is_some())
	}

	fn find(&mut self, name: &str) -> CfbResult<Option<DirectoryEntry>> {
		self.ctx.check_disposed()?;
		let mut entries = self.ctx.directory_entries();
		DirectoryTree::new(self.id).try_get(&mut entries, name)
	}

	pub fn create_storage(&mut self, name: &str) -> CfbResult<Storage<'_, F>> {
		Storage::create_storage_in(self.ctx, self.id, name)
	}

	pub fn create_stream(&mut self, name: &str) -> CfbResult<CfbStream<'_, F>> {
		Storage::create_stream_in(self.ctx, self.id, name)
	}

	pub fn open_storage(&mut self, name: &str) -> CfbResult<Storage<'_, F>> {
		Storage::open_storage_in(self.ctx, self.id, name)
	}

	pub fn try_open_storage(&mut self, name: &str) -> CfbResult<Option<Storage<'_, F>>> {
		match self.find(name)? {
			Some(entry) if entry.entry_type == EntryType::Storage => Ok(Some(Storage { ctx: &mut *self.ctx, id: entry.id })),
			_ => Ok(None),
		}
	}

	pub fn open_stream(&mut self, name: &str) -> CfbResult<CfbStream<'_, F>> {
		Storage::open_stream_in(self.ctx, self.id, name)
	}

	pub fn try_open_stream(&mut self, name: &str) -> CfbResult<Option<CfbStream<'_, F>>> {
		match self.find(name)? {
			Some(entry) if entry.entry_type == EntryType::Stream => Ok(Some(CfbStream::open(self.ctx, &entry))),
			_ => Ok(None),
		}
	}

	/// Turns this handle into a handle on the child storage `name`.
	pub fn into_storage(self, name: &str) -> CfbResult<Storage<'a, F>> {
		Storage::open_storage_in(self.ctx, self.id, name)
	}

	/// Turns this handle into a handle on the child stream `name`.
	pub fn into_stream(self, name: &str) -> CfbResult<CfbStream<'a, F>> {
		Storage::open_stream_in(self.ctx, self.id, name)
	}

	/// Removes the child `name`. Storages are removed with everything below them, and the
	/// sectors of every removed stream are freed.
	pub fn delete(&mut self, name: &str) -> CfbResult<()> {
		self.ensure_writable()?;
		let entry = self.find(name)?
			.ok_or_else(|| CfbError::NotFound(name.to_owned()))?;
		delete_entry(self.ctx, self.id, entry)?;
		debug!("[delete] Deleted '{}' from storage #{}.", name, self.id);
		Ok(())
	}

	pub fn set_clsid(&mut self, clsid: [u8; 16]) -> CfbResult<()> {
		self.ensure_writable()?;
		let mut entries = self.ctx.directory_entries();
		let mut entry = entries.get(self.id)?;
		entry.clsid = clsid;
		entries.write(&entry)
	}

	pub fn set_state_bits(&mut self, state_bits: u32) -> CfbResult<()> {
		self.ensure_writable()?;
		let mut entries = self.ctx.directory_entries();
		let mut entry = entries.get(self.id)?;
		entry.state_bits = state_bits;
		entries.write(&entry)
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

	fn create_entry(ctx: &mut RootContext<F>, parent_id: u32, name: &str, entry_type: EntryType) -> CfbResult<DirectoryEntry> {
		ctx.check_disposed()?;
		if !ctx.io.is_writable() {
			return Err(CfbError::NotSupported("the compound file was opened read-only".to_owned()));
		}
		validate_name(name)?;
		let mut entries = ctx.directory_entries();
		let tree = DirectoryTree::new(parent_id);
		if tree.try_get(&mut entries, name)?.is_some() {
			return Err(CfbError::DuplicateName(name.to_owned()));
		}
		let mut entry = entries.create_or_recycle(name, entry_type)?;
		tree.add(&mut entries, &mut entry)?;
		debug!("[create_entry] Created {:?} '{}' as entry #{} under #{}.", entry_type, name, entry.id, parent_id);
		Ok(entry)
	}

	fn create_storage_in<'b>(ctx: &'b mut RootContext<F>, parent_id: u32, name: &str) -> CfbResult<Storage<'b, F>> {
		let entry = Storage::create_entry(ctx, parent_id, name, EntryType::Storage)?;
		Ok(Storage { ctx, id: entry.id })
	}

	fn create_stream_in<'b>(ctx: &'b mut RootContext<F>, parent_id: u32, name: &str) -> CfbResult<CfbStream<'b, F>> {
		let entry = Storage::create_entry(ctx, parent_id, name, EntryType::Stream)?;
		Ok(CfbStream::open(ctx, &entry))
	}

	fn open_storage_in<'b>(ctx: &'b mut RootContext<F>, parent_id: u32, name: &str) -> CfbResult<Storage<'b, F>> {
		ctx.check_disposed()?;
		let entry = DirectoryTree::new(parent_id).try_get(&mut ctx.directory_entries(), name)?;
		match entry {
			Some(entry) if entry.entry_type == EntryType::Storage => Ok(Storage { ctx, id: entry.id }),
			Some(_) => Err(CfbError::NotFound(format!("'{}' is not a storage", name))),
			None => Err(CfbError::NotFound(name.to_owned())),
		}
	}

	fn open_stream_in<'b>(ctx: &'b mut RootContext<F>, parent_id: u32, name: &str) -> CfbResult<CfbStream<'b, F>> {
		ctx.check_disposed()?;
		let entry = DirectoryTree::new(parent_id).try_get(&mut ctx.directory_entries(), name)?;
		match entry {
			Some(entry) if entry.entry_type == EntryType::Stream => Ok(CfbStream::open(ctx, &entry)),
			Some(_) => Err(CfbError::NotFound(format!("'{}' is not a stream", name))),
			None => Err(CfbError::NotFound(name.to_owned())),
		}
	}
}

fn list_children<F: ReadWriteSeek>(ctx: &mut RootContext<F>, storage_id: u32) -> CfbResult<Vec<DirectoryEntry>> {
	let mut entries = ctx.directory_entries();
	let storage = entries.get(storage_id)?;
	let mut enumerator = DirectoryTreeEnumerator::new(&storage);
	let mut children = Vec::new();
	while let Some(child) = enumerator.next(&mut entries)? {
		children.push(child);
	}
	Ok(children)
}

fn delete_entry<F: ReadWriteSeek>(ctx: &mut RootContext<F>, parent_id: u32, entry: DirectoryEntry) -> CfbResult<()> {
	match entry.entry_type {
		EntryType::Storage => {
			for child in list_children(ctx, entry.id)? {
				delete_entry(ctx, entry.id, child)?;
			}
		},
		EntryType::Stream => free_stream(ctx, &entry)?,
		_ => return Err(CfbError::InvalidArgument(format!("entry #{} cannot be deleted", entry.id))),
	}

	let mut entries = ctx.directory_entries();
	// Removing the children rewrote this entry.
	let entry = entries.get(entry.id)?;
	DirectoryTree::new(parent_id).remove(&mut entries, &entry)?;
	entries.write(&DirectoryEntry::unallocated(entry.id))
}

fn free_stream<F: ReadWriteSeek>(ctx: &mut RootContext<F>, entry: &DirectoryEntry) -> CfbResult<()> {
	let mut chain = ChainEnumerator::new(entry.start_sector_id);
	if entry.stream_length < MINI_STREAM_CUTOFF as u64 {
		let mut mini_fat = ctx.mini_fat();
		if chain.len(&mut mini_fat)? > 0 {
			chain.shrink(&mut mini_fat, 0)?;
		}
	}
	else {
		let mut fat = ctx.fat();
		if chain.len(&mut fat)? > 0 {
			chain.shrink(&mut fat, 0)?;
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cfbf::structures::{sector_type, stream_id};
	use crate::cfbf::fat::AllocationTable;
	use std::io::{Cursor, Read, Seek, SeekFrom, Write};

	fn new_file() -> RootStorage<Cursor<Vec<u8>>> {
		RootStorage::create(Cursor::new(Vec::new()), Version::V3).unwrap()
	}

	fn pattern(length: usize) -> Vec<u8> {
		(0..length).map(|i| (i % 251) as u8).collect()
	}

	#[test]
	fn test_deleted_slot_is_reused() {
		let mut file = new_file();
		let first = file.create_stream("first").unwrap().id();
		let second = file.create_stream("second").unwrap().id();
		assert_eq!((first, second), (1, 2));
		file.delete("first").unwrap();

		let ctx = file.context().unwrap();
		let slot = ctx.directory_entries().get(first).unwrap();
		assert_eq!(slot.entry_type, EntryType::Unallocated);
		assert_eq!(file.create_storage("third").unwrap().id(), first);
	}

	#[test]
	fn test_delete_frees_sectors() {
		let mut file = new_file();
		let start = {
			let mut stream = file.create_stream("big").unwrap();
			stream.write_all(&pattern(10_000)).unwrap();
			stream.flush().unwrap();
			stream.entry_info().unwrap();
			drop(stream);
			let ctx = file.context().unwrap();
			let root = ctx.directory_entries().get(0).unwrap();
			ctx.directory_entries().get(root.child_id).unwrap().start_sector_id
		};
		assert_ne!(start, stream_id::NO_STREAM);
		file.delete("big").unwrap();

		let ctx = file.context().unwrap();
		let mut fat = ctx.fat();
		assert_eq!(fat.get(start).unwrap(), sector_type::FREE);
	}

	#[test]
	fn test_small_streams_live_in_mini_stream() {
		let mut file = new_file();
		{
			let mut storage = file.create_storage("A").unwrap();
			let mut s1 = storage.create_stream("s1").unwrap();
			s1.write_all(&pattern(100)).unwrap();
			assert!(s1.is_mini());
			drop(s1);

			let mut s2 = storage.create_stream("s2").unwrap();
			s2.write_all(&pattern(5000)).unwrap();
			assert!(!s2.is_mini());
		}

		file.flush().unwrap();
		let ctx = file.context().unwrap();
		assert_eq!(ctx.header.number_of_mini_fat_sectors, 1);
		assert_eq!(ctx.mini_stream_len(), 128);
	}

	#[test]
	fn test_stream_migrates_across_cutoff() {
		let mut file = new_file();
		let data = pattern(5000);
		let mut stream = file.create_stream("data").unwrap();
		stream.write_all(&data[..100]).unwrap();
		assert!(stream.is_mini());
		stream.write_all(&data[100..]).unwrap();
		assert!(!stream.is_mini());
		assert_eq!(stream.position(), 5000);

		stream.set_len(100).unwrap();
		assert!(stream.is_mini());
		assert_eq!(stream.position(), 5000);
		stream.seek(SeekFrom::Start(0)).unwrap();
		let mut back = Vec::new();
		stream.read_to_end(&mut back).unwrap();
		assert_eq!(back, &data[..100]);
	}

	#[test]
	fn test_duplicate_and_invalid_names() {
		let mut file = new_file();
		file.create_stream("Data").unwrap();
		assert!(matches!(file.create_storage("DATA").err(), Some(CfbError::DuplicateName(_))));
		assert!(matches!(file.create_stream("a/b").err(), Some(CfbError::InvalidArgument(_))));
		assert!(matches!(file.open_storage("Data").err(), Some(CfbError::NotFound(_))));
		assert!(matches!(file.open_stream("Nope").err(), Some(CfbError::NotFound(_))));
		assert!(file.root().unwrap().try_open_stream("Nope").unwrap().is_none());

		file.delete("Data").unwrap();
		file.create_storage("DATA").unwrap();
		assert!(file.root().unwrap().try_open_storage("data").unwrap().is_some());
	}

	#[test]
	fn test_close_is_idempotent() {
		let mut file = new_file();
		file.close().unwrap();
		file.close().unwrap();
		assert!(matches!(file.root().err(), Some(CfbError::ObjectDisposed)));
		assert!(matches!(file.flush(), Err(CfbError::ObjectDisposed)));
		let bytes = file.into_inner().unwrap().into_inner();
		assert_eq!(bytes.len(), 3 * 512);
	}

	#[test]
	fn test_recursive_delete() {
		let mut file = new_file();
		{
			let mut outer = file.create_storage("outer").unwrap();
			let mut inner = outer.create_storage("inner").unwrap();
			inner.create_stream("leaf").unwrap().write_all(&pattern(300)).unwrap();
		}
		file.create_stream("keep").unwrap();
		file.delete("outer").unwrap();

		let names: Vec<String> = file.entries().unwrap().into_iter().map(|e| e.name).collect();
		assert_eq!(names, vec!["keep"]);
		let ctx = file.context().unwrap();
		let mut mini_fat = ctx.mini_fat();
		for id in 0..mini_fat.capacity() {
			assert_eq!(mini_fat.get(id).unwrap(), sector_type::FREE);
		}
	}

	#[test]
	fn test_read_only_rejects_changes() {
		let bytes = new_file().into_inner().unwrap().into_inner();
		let mut file = RootStorage::open(Cursor::new(bytes), OpenMode::ReadOnly).unwrap();
		assert!(matches!(file.create_stream("x").err(), Some(CfbError::NotSupported(_))));
		assert!(matches!(file.root().unwrap().set_state_bits(1), Err(CfbError::NotSupported(_))));
	}
}
