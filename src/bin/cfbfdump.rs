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

use std::fs::File;
use std::io::{self, stdin, stdout, Cursor, Read, Write};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use log::{debug, LevelFilter};
use cfbf::{CfbError, CfbResult, OpenMode, RootStorage, Storage};
use cfbf::io::ReadWriteSeek;

fn input_arg<'a, 'b>() -> Arg<'a, 'b> {
	Arg::with_name("input")
		.value_name("FILE")
		.help("A file in Compound File Binary File Format (CFBF). If omitted (or '-'), the file will be read from STDIN instead.")
		.short("i")
		.long("input")
		.required(false)
}

fn main() {
	let matches = App::new("cfbfdump")
		.version("1.1")
		.author("Steve Muller <steve.muller@outlook.com>")
		.about("This utility reads a Compound File Binary File Format (also known as OLE file, COM file, or Structured Storage file) and dumps its contents.")
		.setting(AppSettings::SubcommandRequired)
		.arg(Arg::with_name("verbose")
			.short("v")
			.help("Increases the debug verbosity. This will print a lot of debug messages to standard error (STDERR). Can be used up to 3 times.")
			.multiple(true)
			.takes_value(false))
		.subcommand(SubCommand::with_name("list")
			.about("Lists all entries contained in the CFBF file. Each output line represents an entry, and contains the internal entry ID and the entry path, separated by a space. Storages end with a slash.")
			.arg(input_arg())
		)
		.subcommand(SubCommand::with_name("dump")
			.about("Dumps a stream from the CFBF file.")
			.arg(Arg::with_name("path")
				.value_name("PATH")
				.help("The path of the stream that shall be dumped, with storages separated by slashes, e.g. 'Storage/Stream'.")
				.short("p")
				.long("path")
				.required(true))
			.arg(Arg::with_name("output")
				.value_name("FILE")
				.help("The file where the stream shall be written to. If this parameter is not specified (or has the value '-'), the stream will be written to STDOUT instead.")
				.short("o")
				.long("output")
				.required(false))
			.arg(input_arg())
		)
		.subcommand(SubCommand::with_name("info")
			.about("Prints the header fields of the CFBF file.")
			.arg(input_arg())
		)
	.get_matches();

	let level = match matches.occurrences_of("verbose") {
		0 => LevelFilter::Warn,
		1 => LevelFilter::Info,
		2 => LevelFilter::Debug,
		_ => LevelFilter::Trace,
	};
	env_logger::Builder::new()
		.filter_level(level)
		.target(env_logger::Target::Stderr)
		.init();

	if let Err(e) = dispatch(&matches) {
		eprintln!("ERROR: {}", e);
		std::process::exit(1);
	}
}

fn dispatch(matches: &ArgMatches) -> CfbResult<()> {
	match matches.subcommand() {
		("list", Some(submatches)) => dispatch_list(submatches),
		("dump", Some(submatches)) => dispatch_dump(submatches),
		("info", Some(submatches)) => dispatch_info(submatches),
		(name, _) => Err(CfbError::InvalidArgument(format!("unrecognised subcommand '{}'", name))),
	}
}

/// Either a file or the whole of STDIN, held in memory so that it can be seeked.
enum Input {
	File(File),
	Memory(Cursor<Vec<u8>>),
}

impl Read for Input {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match self {
			Input::File(file) => file.read(buf),
			Input::Memory(cursor) => cursor.read(buf),
		}
	}
}

impl Write for Input {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self {
			Input::File(file) => file.write(buf),
			Input::Memory(cursor) => cursor.write(buf),
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self {
			Input::File(file) => file.flush(),
			Input::Memory(cursor) => cursor.flush(),
		}
	}
}

impl io::Seek for Input {
	fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
		match self {
			Input::File(file) => file.seek(pos),
			Input::Memory(cursor) => cursor.seek(pos),
		}
	}
}

fn open_input(matches: &ArgMatches) -> CfbResult<RootStorage<Input>> {
	let input = match matches.value_of("input").unwrap_or("") {
		"" | "-" => {
			let mut data = Vec::new();
			stdin().read_to_end(&mut data)?;
			debug!("[open_input] Read {} bytes from STDIN.", data.len());
			Input::Memory(Cursor::new(data))
		},
		path => Input::File(File::open(path)?),
	};
	RootStorage::open(input, OpenMode::ReadOnly)
}

fn dispatch_list(matches: &ArgMatches) -> CfbResult<()> {
	let mut file = open_input(matches)?;
	let mut output = stdout();
	writeln!(output, "0 /")?;
	let mut root = file.root()?;
	list_recursive(&mut root, "", &mut output)
}

fn list_recursive<F: ReadWriteSeek>(storage: &mut Storage<'_, F>, prefix: &str, output: &mut impl Write) -> CfbResult<()> {
	for entry in storage.entries()? {
		let path = format!("{}/{}", prefix, entry.name);
		if entry.is_storage() {
			writeln!(output, "{} {}/", entry.id, path)?;
			let mut child = storage.open_storage(&entry.name)?;
			list_recursive(&mut child, &path, output)?;
		}
		else {
			writeln!(output, "{} {}", entry.id, path)?;
		}
	}
	Ok(())
}

fn dispatch_dump(matches: &ArgMatches) -> CfbResult<()> {
	let path = matches.value_of("path").unwrap_or("");
	let mut parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
	let name = parts.pop()
		.ok_or_else(|| CfbError::InvalidArgument(format!("'{}' does not name a stream", path)))?;

	let mut output: Box<dyn Write> = match matches.value_of("output").unwrap_or("") {
		"" | "-" => Box::new(stdout()),
		outputfile => Box::new(File::create(outputfile)?),
	};

	let mut file = open_input(matches)?;
	let mut storage = file.root()?;
	for part in parts {
		storage = storage.into_storage(part)?;
	}
	let mut stream = storage.into_stream(name)?;
	let length = io::copy(&mut stream, &mut output)?;
	output.flush()?;
	debug!("[dispatch_dump] Dumped {} bytes of '{}'.", length, path);
	Ok(())
}

fn dispatch_info(matches: &ArgMatches) -> CfbResult<()> {
	let mut file = open_input(matches)?;
	let header = file.header()?;
	let mut output = stdout();
	writeln!(output, "version: {}.{:#X}", header.version as u16, header.minor_version)?;
	writeln!(output, "sector size: {}", header.sector_size())?;
	writeln!(output, "FAT sectors: {}", header.number_of_fat_sectors)?;
	writeln!(output, "DIFAT sectors: {} (first {:#X})", header.number_of_difat_sectors, header.first_difat_sector_id)?;
	writeln!(output, "mini-FAT sectors: {} (first {:#X})", header.number_of_mini_fat_sectors, header.first_mini_fat_sector_id)?;
	writeln!(output, "directory sectors: {} (first {:#X})", header.number_of_directory_sectors, header.first_directory_sector_id)?;
	let root = file.root()?.entry_info()?;
	writeln!(output, "mini-stream length: {}", root.length)?;
	writeln!(output, "entries: {}", count_entries(&mut file.root()?)?)?;
	Ok(())
}

fn count_entries<F: ReadWriteSeek>(storage: &mut Storage<'_, F>) -> CfbResult<usize> {
	let mut count = 0;
	for entry in storage.entries()? {
		count += 1;
		if entry.is_storage() {
			count += count_entries(&mut storage.open_storage(&entry.name)?)?;
		}
	}
	Ok(count)
}
