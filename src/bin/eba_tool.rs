//! A tool for poking at the EBA layer on a simulated NAND image.
//!
//! Volumes are not recorded on flash, so every invocation has to describe them again with
//! `--volume`. Run with `--sim-write` to keep the changes a command makes.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;

use ubi_eba::{
    nand::{NandLayout, SimNand},
    ubi::{scan_blocks, AttachInfo, PebIo, Ubi, UbiConfig, VolType, VolumeConfig},
};

#[derive(Args, Debug)]
struct NandOptions {
    /// Path to the NAND image to use
    #[clap(long)]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate
    #[clap(long)]
    sim_layout: NandLayout,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<SimNand> {
        let mut sim = SimNand::new(self.sim_layout);
        if let Some(path) = &self.sim_path {
            sim.load(&mut File::open(path)?)?;
        }
        Ok(sim)
    }

    fn cleanup(&self, nand: SimNand) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                nand.save(&mut File::create(path)?)?;
            }
        }

        Ok(())
    }
}

/// A volume given on the command line as "ID:TYPE:LEBS"
#[derive(Debug, Copy, Clone)]
struct VolumeArg(VolumeConfig);

impl FromStr for VolumeArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let [vol_id, vol_type, lebs]: [&str; 3] = s
            .split(':')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected ID:TYPE:LEBS"))?;

        let vol_type = match vol_type {
            "dynamic" => VolType::Dynamic,
            "static" => VolType::Static,
            _ => bail!("volume type must be \"dynamic\" or \"static\""),
        };

        Ok(Self(
            VolumeConfig::new(vol_type, vol_id.parse()?).lebs(lebs.parse()?),
        ))
    }
}

#[derive(Args, Debug)]
struct UbiOptions {
    /// A volume to attach, as ID:TYPE:LEBS (e.g. 0:dynamic:16)
    #[clap(long = "volume")]
    volumes: Vec<VolumeArg>,

    /// Treat any write or erase failure as fatal instead of retiring the PEB
    #[clap(long)]
    no_bad_blocks: bool,

    /// How many times a failed write is retried on another PEB
    #[clap(long)]
    io_retries: Option<u32>,
}

impl UbiOptions {
    fn config(&self) -> UbiConfig {
        let config = UbiConfig::default().bad_allowed(!self.no_bad_blocks);
        match self.io_retries {
            Some(retries) => config.io_retries(retries),
            None => config,
        }
    }

    fn volumes(&self) -> Vec<VolumeConfig> {
        self.volumes.iter().map(|x| x.0).collect()
    }

    fn attach(&self, nand: SimNand) -> Result<Ubi<SimNand>> {
        Ok(Ubi::attach_scan(nand, self.config(), &self.volumes())?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a summary of the content of each PEB; this is a read-only operation
    Overview,

    /// Attach, then print the PEB accounting and the LEB to PEB table of every volume
    Map,

    /// Write a file into a LEB of a dynamic volume
    Write {
        vol_id: u32,
        lnum: u32,
        path: PathBuf,

        /// Where in the LEB to start writing (must be page-aligned)
        #[clap(long, default_value_t = 0)]
        offset: usize,
    },

    /// Fill a static volume with the contents of a file, one LEB at a time
    WriteStatic { vol_id: u32, path: PathBuf },

    /// Atomically replace the contents of a LEB with a file
    AtomicChange {
        vol_id: u32,
        lnum: u32,
        path: PathBuf,
    },

    /// Dump the contents of a LEB to stdout
    Read {
        vol_id: u32,
        lnum: u32,

        #[clap(long, default_value_t = 0)]
        offset: usize,

        /// How many bytes to read (default: up to the end of the LEB)
        #[clap(long)]
        len: Option<usize>,

        /// Verify the data CRC, where there is one
        #[clap(long)]
        check: bool,
    },

    /// Unmap a LEB
    Unmap { vol_id: u32, lnum: u32 },

    /// Hammer every dynamic volume from several threads, then check that a snapshot of the
    /// mapping survives a re-attach
    Stress {
        #[clap(long, default_value_t = 4)]
        threads: u32,

        #[clap(long, default_value_t = 32)]
        rounds: u32,
    },
}

fn read_file(path: &PathBuf) -> Result<Vec<u8>> {
    let mut data = vec![];
    File::open(path)
        .with_context(|| format!("could not open {}", path.display()))?
        .read_to_end(&mut data)?;
    Ok(data)
}

impl Command {
    fn execute(self, nand: SimNand, ubi_opts: &UbiOptions) -> Result<SimNand> {
        if let Command::Overview = self {
            let ebt = scan_blocks(&nand)?;
            for (i, content) in ebt.iter().enumerate() {
                println!("{i:4} => {content:?}");
            }
            return Ok(nand);
        }

        let ubi = ubi_opts.attach(nand)?;

        match self {
            Command::Overview => unreachable!(),

            Command::Map => {
                let acct = ubi.accounting();
                println!("{acct:#?}");
                println!("LEB size: {}, max sqnum: {}", ubi.leb_size(), ubi.max_sqnum());

                for vol_id in ubi.volume_ids() {
                    let vol = ubi.volume(vol_id)?;
                    println!(
                        "volume {vol_id} ({:?}, {} LEBs):",
                        vol.vol_type(),
                        vol.reserved_pebs()
                    );
                    for (lnum, pnum) in vol.table().mapped() {
                        println!("{lnum:6} => PEB {pnum}");
                    }
                }
            }

            Command::Write {
                vol_id,
                lnum,
                path,
                offset,
            } => {
                let data = read_file(&path)?;
                ubi.write_dynamic(vol_id, lnum, &data, offset)?;
            }

            Command::WriteStatic { vol_id, path } => {
                let data = read_file(&path)?;
                let leb_size = ubi.volume(vol_id)?.usable_leb_size();
                let used_ebs = data.len().div_ceil(leb_size) as u32;

                for (lnum, chunk) in data.chunks(leb_size).enumerate() {
                    ubi.write_static(vol_id, lnum as u32, chunk, chunk.len(), used_ebs)?;
                }
                info!("wrote {} bytes in {used_ebs} LEBs", data.len());
            }

            Command::AtomicChange { vol_id, lnum, path } => {
                let data = read_file(&path)?;
                ubi.atomic_change(vol_id, lnum, &data)?;
            }

            Command::Read {
                vol_id,
                lnum,
                offset,
                len,
                check,
            } => {
                let leb_size = ubi.volume(vol_id)?.usable_leb_size();
                let len = len.unwrap_or(leb_size.saturating_sub(offset));
                let mut buf = vec![0; len];
                ubi.read(vol_id, lnum, &mut buf, offset, check)?;
                std::io::stdout().write_all(&buf)?;
            }

            Command::Unmap { vol_id, lnum } => {
                ubi.unmap(vol_id, lnum)?;
            }

            Command::Stress { threads, rounds } => {
                return stress(ubi, ubi_opts, threads, rounds);
            }
        }

        if ubi.scrub_pending() > 0 {
            ubi.scrub()?;
        }
        Ok(ubi.detach())
    }
}

/// The byte a stress thread fills a LEB with; never 0xFF, so it can't pass for erased flash
fn pattern(thread: u32, round: u32) -> u8 {
    ((thread * 31 + round) % 0xFF) as u8
}

fn stress(ubi: Ubi<SimNand>, ubi_opts: &UbiOptions, threads: u32, rounds: u32) -> Result<SimNand> {
    let lebs: Vec<(u32, u32)> = ubi
        .volume_ids()
        .into_iter()
        .filter_map(|vol_id| ubi.volume(vol_id).ok())
        .filter(|vol| vol.vol_type() == VolType::Dynamic)
        .flat_map(|vol| (0..vol.reserved_pebs()).map(move |lnum| (vol.vol_id(), lnum)))
        .collect();
    if lebs.is_empty() {
        bail!("no dynamic volume to stress");
    }

    let page = ubi.min_io_size();
    thread::scope(|s| -> Result<()> {
        let workers: Vec<_> = (0..threads)
            .map(|thread| {
                let (ubi, lebs) = (&ubi, &lebs);
                s.spawn(move || -> Result<()> {
                    let mut buf = vec![0; page * 4];
                    for round in 0..rounds {
                        let index = (thread + round * threads) as usize % lebs.len();
                        let (vol_id, lnum) = lebs[index];

                        // Every LEB is either unmapped or holds one thread's pattern throughout
                        ubi.read(vol_id, lnum, &mut buf, 0, true)?;
                        if buf.iter().any(|&x| x != buf[0]) {
                            bail!("LEB {vol_id}:{lnum} holds a torn write");
                        }

                        let data = vec![pattern(thread, round); page * 4];
                        match round % 3 {
                            0 => ubi.atomic_change(vol_id, lnum, &data)?,
                            1 => ubi.unmap(vol_id, lnum)?,
                            _ => {
                                ubi.atomic_change(vol_id, lnum, &data)?;
                                ubi.scrub()?;
                            }
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        for worker in workers {
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("stress thread panicked"))??;
        }
        Ok(())
    })?;

    ubi.scrub()?;
    let snapshot = ubi.fastmap_snapshot();
    let max_sqnum = ubi.max_sqnum();
    let nand = ubi.detach();

    let scan = AttachInfo::scan(&PebIo::new(nand.clone())?)?;
    let ubi = Ubi::attach(nand, ubi_opts.config(), &ubi_opts.volumes(), snapshot.clone())?;
    ubi.self_check(&snapshot, &scan)?;

    if scan.max_sqnum != max_sqnum {
        bail!("scan found sqnum {}, expected {max_sqnum}", scan.max_sqnum);
    }
    println!(
        "{threads} threads x {rounds} rounds over {} LEBs: OK (max sqnum {max_sqnum})",
        lebs.len()
    );

    Ok(ubi.detach())
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// How to attach UBI on it
    #[clap(flatten)]
    ubi: UbiOptions,

    /// env_logger-style filter string (e.g. "debug"); overrides RUST_LOG
    #[clap(long)]
    log: Option<String>,

    /// The command to run against the attached device
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let env = env_logger::Env::default().default_filter_or("info");
    let mut logger = env_logger::Builder::from_env(env);
    if let Some(filter) = &args.log {
        logger.parse_filters(filter);
    }
    logger.format_timestamp(None).init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    let nand = args.cmd.execute(nand, &args.ubi)?;
    args.nand.cleanup(nand)?;
    Ok(())
}
