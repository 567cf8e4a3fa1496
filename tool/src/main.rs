use std::fs;
use std::io;
use std::io::Write;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Error;
use clap::{App, AppSettings, Arg, SubCommand};
use ext4img::{FileType, Inode, ReadAt, Volume};

fn mode_string(file_type: FileType, mode: u16) -> String {
    let mut out = String::with_capacity(10);
    out.push(match file_type {
        FileType::RegularFile => '-',
        FileType::Directory => 'd',
        FileType::SymbolicLink => 'l',
        FileType::CharacterDevice => 'c',
        FileType::BlockDevice => 'b',
        FileType::Fifo => 'p',
        FileType::Socket => 's',
    });
    for &shift in &[6u16, 3, 0] {
        let bits = (mode >> shift) & 0b111;
        out.push(if 0 != bits & 0b100 { 'r' } else { '-' });
        out.push(if 0 != bits & 0b010 { 'w' } else { '-' });
        out.push(if 0 != bits & 0b001 { 'x' } else { '-' });
    }
    out
}

fn print_entry(inode: &Inode, name: &str) {
    println!(
        "{:>8} {} {:>5} {:>5} {:>10} {}",
        inode.number,
        mode_string(inode.stat.extracted_type, inode.stat.file_mode),
        inode.stat.uid,
        inode.stat.gid,
        inode.stat.size,
        name
    );
}

fn ls<R: ReadAt>(vol: &Volume<R>, path: &str) -> Result<(), Error> {
    let entry = vol.resolve_path(path)?;
    let inode = vol.load_inode(entry.inode)?;

    if FileType::Directory == inode.stat.extracted_type {
        for entry in vol.dir_entries(&inode)? {
            let child = vol
                .load_inode(entry.inode)
                .with_context(|| anyhow!("loading '{}'", entry.name))?;
            print_entry(&child, &entry.name);
        }
    } else {
        print_entry(&inode, &entry.name);
    }

    Ok(())
}

fn cat<R: ReadAt>(vol: &Volume<R>, path: &str) -> Result<(), Error> {
    let entry = vol.resolve_path(path)?;
    let inode = vol.load_inode(entry.inode)?;
    let mut reader = vol.open(&inode)?;

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    io::copy(&mut reader, &mut stdout)?;
    stdout.flush()?;

    Ok(())
}

fn open_volume(file: &str) -> Result<Volume<fs::File>, Error> {
    let image = fs::File::open(file).with_context(|| anyhow!("opening image '{}'", file))?;
    Volume::new(image).with_context(|| anyhow!("loading filesystem from '{}'", file))
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let image_arg = Arg::with_name("image").required(true);

    let matches = App::new("ext4imgtool")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("ls")
                .about("list a directory, or a single entry")
                .arg(&image_arg)
                .arg(Arg::with_name("path").default_value("/")),
        )
        .subcommand(
            SubCommand::with_name("cat")
                .about("write a file's raw contents to stdout")
                .arg(&image_arg)
                .arg(Arg::with_name("path").required(true)),
        )
        .get_matches();

    match matches.subcommand() {
        ("ls", Some(matches)) => {
            let vol = open_volume(matches.value_of("image").unwrap())?;
            ls(&vol, matches.value_of("path").unwrap())
        }
        ("cat", Some(matches)) => {
            let vol = open_volume(matches.value_of("image").unwrap())?;
            cat(&vol, matches.value_of("path").unwrap())
        }
        (_, _) => unreachable!(),
    }
}
