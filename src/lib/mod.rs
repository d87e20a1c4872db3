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

//! Reader and writer for the Compound File Binary File Format (also known as OLE file, COM file,
//! or Structured Storage file).
//!
//! A compound file holds a tree of storages (folders) and streams (files) inside a single flat
//! byte stream cut into sectors. Use [`RootStorage`] to create or open one.

pub mod cfbf;
pub mod error;
pub mod io;

pub use crate::cfbf::{CfbStream, EntryInfo, EntryType, OpenMode, RootStorage, Storage, Version};
pub use crate::error::{CfbError, CfbResult};
