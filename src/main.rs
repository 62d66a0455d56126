use std::env::set_var;
use std::io::Write;

use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction, ArgMatches, Command};
use log::*;

use axfs::block_dev::FileBlockDevice;
use axfs::desc::{FormatOptions, InodeKind, MountOptions};
use axfs::utils::init_logs;
use axfs::Volume;

fn parse<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<T> {
    let raw = matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow!("missing --{}", name))?;
    raw.parse::<T>()
        .map_err(|_| anyhow!("bad value for --{}: {}", name, raw))
}

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(
            arg!(-d --device <FILE> "Image file holding the volume")
                .required(false)
                .default_value("axfs.img"),
        )
        .arg(
            arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
                .action(ArgAction::SetTrue)
                .required(false),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("format")
                .about("Create a fresh AXFS volume on the image")
                .arg(arg!(--label <LABEL> "Volume label").default_value(""))
                .arg(arg!(--inodes <N> "Inode slots").default_value("512"))
                .arg(arg!(--sectors <N> "Total sectors").default_value("4096"))
                .arg(arg!(--"sector-size" <N> "Sector size in bytes").default_value("512"))
                .arg(arg!(--"no-checksums" "Skip the per-block checksum table").action(ArgAction::SetTrue))
                .arg(arg!(--"no-cow" "Disable copy-on-write rewrites").action(ArgAction::SetTrue)),
        )
        .subcommand(Command::new("info").about("Print volume statistics"))
        .subcommand(Command::new("health").about("Run the volume health checks"))
        .subcommand(
            Command::new("ls")
                .about("List a directory")
                .arg(arg!([path] "Directory path").default_value("/")),
        )
        .subcommand(
            Command::new("cat")
                .about("Write a file's bytes to stdout")
                .arg(arg!(<path> "File path")),
        )
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();
    let image = matches.get_one::<String>("device").unwrap();

    match matches.subcommand() {
        Some(("format", sub)) => {
            let sector_size: u16 = parse(sub, "sector-size")?;
            let sectors: u32 = parse(sub, "sectors")?;
            let opts = FormatOptions {
                label: sub.get_one::<String>("label").unwrap().clone(),
                max_inodes: parse(sub, "inodes")?,
                checksums: !sub.get_flag("no-checksums"),
                cow: !sub.get_flag("no-cow"),
            };
            let mut dev = FileBlockDevice::create(image, sector_size, sectors)?;
            axfs::format(&mut dev, &opts)?;
            println!(
                "{}: AXFS volume, {} sectors of {} bytes, {} inodes",
                image, sectors, sector_size, opts.max_inodes
            );
            Ok(())
        }
        Some((cmd, sub)) => {
            let dev = FileBlockDevice::open(image, 512)?;
            let mut vol = Volume::mount(Box::new(dev), &MountOptions::default())?;
            match cmd {
                "info" => {
                    let i = vol.info();
                    println!("label:         {}", i.label);
                    println!("version:       {}", i.version);
                    println!("sector size:   {}", i.sector_size);
                    println!("total sectors: {}", i.total_sectors);
                    println!("inodes:        {} free of {}", i.free_inodes, i.max_inodes);
                    println!("blocks:        {} free of {}", i.free_blocks, i.max_blocks);
                    println!("data start:    sector {}", i.data_start);
                    println!("generation:    {}", i.generation);
                    println!("checksums:     {}", i.checksums);
                    println!("cow:           {}", i.cow);
                    println!("device reads:  {}", i.lifetime_reads);
                    println!("device writes: {}", i.lifetime_writes);
                    Ok(())
                }
                "health" => {
                    let h = vol.health();
                    if h.ok {
                        println!("ok");
                        Ok(())
                    } else {
                        for issue in &h.issues {
                            println!("issue: {}", issue);
                        }
                        Err(anyhow!("{} issue(s) found", h.issues.len()))
                    }
                }
                "ls" => {
                    let path = sub.get_one::<String>("path").unwrap();
                    for e in vol.list_dir(path)? {
                        let marker = match e.kind {
                            InodeKind::Dir => "d",
                            InodeKind::Link => "l",
                            _ => "-",
                        };
                        println!("{} {:>4o} {:>8} {}", marker, e.mode, e.size, e.name);
                    }
                    Ok(())
                }
                "cat" => {
                    let path = sub.get_one::<String>("path").unwrap();
                    let data = vol.read_file(path)?;
                    std::io::stdout().write_all(&data)?;
                    Ok(())
                }
                other => {
                    error!("unknown subcommand {}", other);
                    Err(anyhow!("unknown subcommand {}", other))
                }
            }
        }
        None => unreachable!("subcommand_required"),
    }
}
