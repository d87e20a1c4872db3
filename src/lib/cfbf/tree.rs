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

use log::trace;
use std::cmp::Ordering;
use std::collections::HashSet;
use super::directory::{compare_names, Color, DirectoryEntry, EntryType};
use super::entries::DirectoryEntries;
use super::structures::stream_id;
use crate::error::{CfbError, CfbResult};
use crate::io::ReadWriteSeek;

/// How a node hangs off its parent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Relation {
	Previous,
	Next,
	/// The parent is the storage itself and the node is the root of its tree.
	Child,
}

/// Guards a walk through sibling links against cycles.
struct Walk {
	visited: HashSet<u32>,
}

impl Walk {
	fn new() -> Walk {
		Walk { visited: HashSet::new() }
	}

	fn visit<F: ReadWriteSeek>(&mut self, entries: &mut DirectoryEntries<'_, F>, id: u32) -> CfbResult<DirectoryEntry> {
		if !self.visited.insert(id) {
			return Err(CfbError::corrupt(format!("directory tree loops back to entry #{}", id)));
		}
		let entry = entries.get(id)?;
		if entry.entry_type == EntryType::Unallocated {
			return Err(CfbError::corrupt(format!("directory tree links to unallocated entry #{}", id)));
		}
		Ok(entry)
	}
}

/// The children of one storage, kept as a binary search tree over the sibling links.
///
/// Nodes are always written black and the tree is never rebalanced, which keeps it a valid
/// red-black tree for readers that check colours.
pub struct DirectoryTree {
	storage_id: u32,
}

impl DirectoryTree {
	pub fn new(storage_id: u32) -> DirectoryTree {
		DirectoryTree { storage_id }
	}

	pub fn try_get<F: ReadWriteSeek>(&self, entries: &mut DirectoryEntries<'_, F>, name: &str) -> CfbResult<Option<DirectoryEntry>> {
		let storage = entries.get(self.storage_id)?;
		let mut walk = Walk::new();
		let mut id = storage.child_id;
		while id != stream_id::NO_STREAM {
			let node = walk.visit(entries, id)?;
			id = match compare_names(name, &node.name) {
				Ordering::Less => node.left_sibling_id,
				Ordering::Greater => node.right_sibling_id,
				Ordering::Equal => return Ok(Some(node)),
			};
		}
		Ok(None)
	}

	/// Links `entry` into the tree as a black leaf and writes every touched entry.
	pub fn add<F: ReadWriteSeek>(&self, entries: &mut DirectoryEntries<'_, F>, entry: &mut DirectoryEntry) -> CfbResult<()> {
		entry.left_sibling_id = stream_id::NO_STREAM;
		entry.right_sibling_id = stream_id::NO_STREAM;
		entry.color = Color::Black;

		let mut storage = entries.get(self.storage_id)?;
		if storage.child_id == stream_id::NO_STREAM {
			storage.child_id = entry.id;
			entries.write(&storage)?;
		}
		else {
			let mut walk = Walk::new();
			let mut node = walk.visit(entries, storage.child_id)?;
			loop {
				let next = match compare_names(&entry.name, &node.name) {
					Ordering::Less => &mut node.left_sibling_id,
					Ordering::Greater => &mut node.right_sibling_id,
					Ordering::Equal => return Err(CfbError::DuplicateName(entry.name.clone())),
				};
				if *next == stream_id::NO_STREAM {
					*next = entry.id;
					entries.write(&node)?;
					break;
				}
				let id = *next;
				node = walk.visit(entries, id)?;
			}
		}
		entries.write(entry)?;
		trace!("[tree_add] Linked '{}' (#{}) under storage #{}.", entry.name, entry.id, self.storage_id);
		Ok(())
	}

	/// Unlinks `entry` from the tree. The entry itself is left as is.
	pub fn remove<F: ReadWriteSeek>(&self, entries: &mut DirectoryEntries<'_, F>, entry: &DirectoryEntry) -> CfbResult<()> {
		let (mut parent, relation) = self.get_parent(entries, entry)?;

		let replacement = if entry.left_sibling_id == stream_id::NO_STREAM {
			entry.right_sibling_id
		}
		else if entry.right_sibling_id == stream_id::NO_STREAM {
			entry.left_sibling_id
		}
		else {
			// The right subtree goes under the largest node of the left subtree.
			let mut walk = Walk::new();
			walk.visited.insert(entry.id);
			let mut node = walk.visit(entries, entry.left_sibling_id)?;
			while node.right_sibling_id != stream_id::NO_STREAM {
				let id = node.right_sibling_id;
				node = walk.visit(entries, id)?;
			}
			node.right_sibling_id = entry.right_sibling_id;
			entries.write(&node)?;
			entry.left_sibling_id
		};

		match relation {
			Relation::Previous => parent.left_sibling_id = replacement,
			Relation::Next => parent.right_sibling_id = replacement,
			Relation::Child => parent.child_id = replacement,
		}
		entries.write(&parent)?;
		trace!("[tree_remove] Unlinked '{}' (#{}) from storage #{}.", entry.name, entry.id, self.storage_id);
		Ok(())
	}

	fn get_parent<F: ReadWriteSeek>(&self, entries: &mut DirectoryEntries<'_, F>, entry: &DirectoryEntry) -> CfbResult<(DirectoryEntry, Relation)> {
		let storage = entries.get(self.storage_id)?;
		if storage.child_id == entry.id {
			return Ok((storage, Relation::Child));
		}
		let mut walk = Walk::new();
		let mut id = storage.child_id;
		while id != stream_id::NO_STREAM {
			let node = walk.visit(entries, id)?;
			let (next, relation) = match compare_names(&entry.name, &node.name) {
				Ordering::Less => (node.left_sibling_id, Relation::Previous),
				Ordering::Greater => (node.right_sibling_id, Relation::Next),
				Ordering::Equal => break,
			};
			if next == entry.id {
				return Ok((node, relation));
			}
			id = next;
		}
		Err(CfbError::corrupt(format!("entry '{}' (#{}) is not linked under storage #{}", entry.name, entry.id, self.storage_id)))
	}
}

/// In-order walk over the children of a storage. Checks the sort order and the red-black
/// colouring while it goes, and reports loops as corruption.
pub struct DirectoryTreeEnumerator {
	root_id: u32,
	started: bool,
	stack: Vec<DirectoryEntry>,
	walk: Walk,
	previous: Option<String>,
}

impl DirectoryTreeEnumerator {
	pub fn new(storage: &DirectoryEntry) -> DirectoryTreeEnumerator {
		DirectoryTreeEnumerator {
			root_id: storage.child_id,
			started: false,
			stack: Vec::new(),
			walk: Walk::new(),
			previous: None,
		}
	}

	pub fn next<F: ReadWriteSeek>(&mut self, entries: &mut DirectoryEntries<'_, F>) -> CfbResult<Option<DirectoryEntry>> {
		if !self.started {
			self.started = true;
			let root_id = self.root_id;
			self.push_left(entries, root_id, false)?;
		}
		let entry = match self.stack.pop() {
			Some(entry) => entry,
			None => return Ok(None),
		};
		if let Some(previous) = &self.previous {
			if compare_names(previous, &entry.name) != Ordering::Less {
				return Err(CfbError::corrupt(format!("directory entries '{}' and '{}' are out of order", previous, entry.name)));
			}
		}
		self.previous = Some(entry.name.clone());
		self.push_left(entries, entry.right_sibling_id, entry.color == Color::Red)?;
		Ok(Some(entry))
	}

	fn push_left<F: ReadWriteSeek>(&mut self, entries: &mut DirectoryEntries<'_, F>, id: u32, parent_is_red: bool) -> CfbResult<()> {
		let mut id = id;
		let mut parent_is_red = parent_is_red;
		while id != stream_id::NO_STREAM {
			let entry = self.walk.visit(entries, id)?;
			let is_red = entry.color == Color::Red;
			if parent_is_red && is_red {
				return Err(CfbError::corrupt(format!("red entry #{} has a red parent", id)));
			}
			parent_is_red = is_red;
			id = entry.left_sibling_id;
			self.stack.push(entry);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cfbf::entries::DirectoryState;
	use crate::cfbf::fat::{Fat, FatState};
	use crate::cfbf::structures::{sector_type, Header, Version};
	use crate::io::SectorIo;
	use std::io::Cursor;

	struct Fixture {
		io: SectorIo<Cursor<Vec<u8>>>,
		header: Header,
		fat: FatState,
		state: DirectoryState,
	}

	impl Fixture {
		fn new() -> Fixture {
			let mut io = SectorIo::new(Cursor::new(Vec::new()), 512, true).unwrap();
			io.extend_length(512).unwrap();
			let mut fixture = Fixture {
				io,
				header: Header::new(Version::V3),
				fat: FatState::new(),
				state: DirectoryState::new(sector_type::END_OF_CHAIN),
			};
			fixture.entries().create_or_recycle("Root Entry", EntryType::Root).unwrap();
			fixture
		}

		fn entries(&mut self) -> DirectoryEntries<'_, Cursor<Vec<u8>>> {
			DirectoryEntries::new(Fat::new(&mut self.io, &mut self.header, &mut self.fat), &mut self.state)
		}

		fn add(&mut self, name: &str) -> DirectoryEntry {
			let mut entries = self.entries();
			let mut entry = entries.create_or_recycle(name, EntryType::Stream).unwrap();
			DirectoryTree::new(0).add(&mut entries, &mut entry).unwrap();
			entry
		}

		fn names(&mut self) -> Vec<String> {
			let mut entries = self.entries();
			let root = entries.get(0).unwrap();
			let mut enumerator = DirectoryTreeEnumerator::new(&root);
			let mut names = Vec::new();
			while let Some(entry) = enumerator.next(&mut entries).unwrap() {
				names.push(entry.name);
			}
			names
		}
	}

	#[test]
	fn test_enumeration_is_sorted() {
		let mut fixture = Fixture::new();
		for name in &["delta", "Alpha", "b", "CHARLIE", "ee", "a"] {
			fixture.add(name);
		}
		assert_eq!(fixture.names(), vec!["a", "b", "ee", "Alpha", "delta", "CHARLIE"]);
	}

	#[test]
	fn test_lookup_is_case_insensitive_and_rejects_duplicates() {
		let mut fixture = Fixture::new();
		fixture.add("Data");
		fixture.add("Other");
		let mut entries = fixture.entries();
		let tree = DirectoryTree::new(0);
		assert_eq!(tree.try_get(&mut entries, "DATA").unwrap().unwrap().name, "Data");
		assert!(tree.try_get(&mut entries, "Missing").unwrap().is_none());

		let mut duplicate = entries.create_or_recycle("data", EntryType::Stream).unwrap();
		assert!(matches!(tree.add(&mut entries, &mut duplicate), Err(CfbError::DuplicateName(_))));
	}

	#[test]
	fn test_remove_keeps_remaining_entries_reachable() {
		let mut fixture = Fixture::new();
		for name in &["m", "f", "t", "c", "h", "p", "w", "g"] {
			fixture.add(name);
		}
		for name in &["f", "m", "w"] {
			let mut entries = fixture.entries();
			let tree = DirectoryTree::new(0);
			let entry = tree.try_get(&mut entries, name).unwrap().unwrap();
			tree.remove(&mut entries, &entry).unwrap();
		}
		assert_eq!(fixture.names(), vec!["c", "g", "h", "p", "t"]);
	}

	#[test]
	fn test_cycle_is_corrupt() {
		let mut fixture = Fixture::new();
		let a = fixture.add("a");
		let mut b = fixture.add("b");
		b.right_sibling_id = a.id;
		let mut entries = fixture.entries();
		entries.write(&b).unwrap();
		let root = entries.get(0).unwrap();
		let mut enumerator = DirectoryTreeEnumerator::new(&root);
		let mut result = Ok(None);
		for _ in 0..10 {
			result = enumerator.next(&mut entries);
			if result.is_err() {
				break;
			}
		}
		assert!(matches!(result, Err(CfbError::CorruptFormat(_))));
	}

	#[test]
	fn test_red_red_is_corrupt() {
		let mut fixture = Fixture::new();
		let a = fixture.add("a");
		let mut b = fixture.add("b");
		let mut entries = fixture.entries();
		let mut a = entries.get(a.id).unwrap();
		assert_eq!(a.right_sibling_id, b.id);
		a.color = Color::Red;
		b.color = Color::Red;
		entries.write(&a).unwrap();
		entries.write(&b).unwrap();
		let root = entries.get(0).unwrap();
		let mut enumerator = DirectoryTreeEnumerator::new(&root);
		let first = enumerator.next(&mut entries);
		let second = first.and_then(|_| enumerator.next(&mut entries));
		assert!(matches!(second, Err(CfbError::CorruptFormat(_))));
	}
}
