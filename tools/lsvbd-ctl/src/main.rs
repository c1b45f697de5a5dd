//! Interactive operator shell for the LSVBD layer.
//!
//! Drives one in-process [`Registry`] + [`Engine`] pair with the control
//! operations a host module would expose, plus demo `read`/`write` commands
//! that push real I/O through the redirection engine into file-backed
//! devices.

use std::io::{BufRead, Write as _};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use lsvbd_core::{Engine, IoOp, IoRequest, Registry, SECTOR_SIZE};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lsvbd-ctl", about = "Operator shell for log-structured virtual block devices")]
struct Args {
    /// Tracing filter (e.g. "lsvbd_core=debug,lsvbd_map=warn").
    #[arg(long, default_value = "info")]
    log: String,
}

const HELP: &str = "\
commands:
  set_data_structure <bt|sl|ht|rb>   select the map back-end for new binds
  set_redirect_bd <index> <path>     bind lsvbd<index> to a backing file
  delete_bd <index>                  destroy the device at list position
  get_vbd_names                      list bound devices
  get_data_structures                list recognized back-ends
  write <dev> <lba> <byte> <nsect>   write a fill pattern through the engine
  read <dev> <lba> <nsect>           read through the engine
  help                               this text
  exit";

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log))
        .with_writer(std::io::stderr)
        .init();

    let registry = Registry::new();
    let engine = Engine::new(registry.clone());

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    print!("lsvbd> ");
    stdout.flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed == "exit" || trimmed == "quit" {
            break;
        }
        if !trimmed.is_empty() {
            match dispatch(&registry, &engine, trimmed) {
                Ok(output) => {
                    if !output.is_empty() {
                        println!("{output}");
                    }
                }
                Err(e) => eprintln!("error: {e:#}"),
            }
        }
        print!("lsvbd> ");
        stdout.flush()?;
    }
    Ok(())
}

fn dispatch(registry: &Registry, engine: &Engine, line: &str) -> Result<String> {
    let mut words = line.split_whitespace();
    let cmd = words.next().unwrap_or_default();
    let rest: Vec<&str> = words.collect();

    match cmd {
        "set_data_structure" => {
            let &[tag] = rest.as_slice() else {
                bail!("usage: set_data_structure <bt|sl|ht|rb>");
            };
            let kind = registry.set_data_structure(tag)?;
            Ok(format!("selected {kind}"))
        }
        "set_redirect_bd" => {
            let &[index, path] = rest.as_slice() else {
                bail!("usage: set_redirect_bd <index> <path>");
            };
            let index: u32 = index.parse().context("index must be an integer")?;
            let name = registry.set_redirect_bd(index, &PathBuf::from(path))?;
            Ok(format!("bound {name} -> {path}"))
        }
        "delete_bd" => {
            let &[index] = rest.as_slice() else {
                bail!("usage: delete_bd <index>");
            };
            let index: usize = index.parse().context("index must be an integer")?;
            registry.delete_bd(index)?;
            Ok(format!("deleted device {index}"))
        }
        "get_vbd_names" => Ok(registry.vbd_names().trim_end().to_string()),
        "get_data_structures" => Ok(registry.data_structures().trim_end().to_string()),
        "write" => {
            let &[dev, lba, byte, nsect] = rest.as_slice() else {
                bail!("usage: write <dev> <lba> <byte> <nsectors>");
            };
            let lba: u64 = lba.parse().context("lba must be an integer")?;
            let byte: u8 = parse_byte(byte)?;
            let nsect: usize = nsect.parse().context("nsectors must be an integer")?;
            if nsect == 0 {
                bail!("nsectors must be positive");
            }
            let payload = vec![byte; nsect * SECTOR_SIZE as usize];
            let request = IoRequest::new(dev, IoOp::Write, lba, payload);
            let done = request.completion.clone();
            engine.submit(request);
            done.wait()?;
            Ok(format!("wrote {nsect} sector(s) at lba {lba}"))
        }
        "read" => {
            let &[dev, lba, nsect] = rest.as_slice() else {
                bail!("usage: read <dev> <lba> <nsectors>");
            };
            let lba: u64 = lba.parse().context("lba must be an integer")?;
            let nsect: usize = nsect.parse().context("nsectors must be an integer")?;
            if nsect == 0 {
                bail!("nsectors must be positive");
            }
            let request = IoRequest::new(dev, IoOp::Read, lba, vec![0u8; nsect * SECTOR_SIZE as usize]);
            let done = request.completion.clone();
            let payload = request.payload.clone();
            engine.submit(request);
            done.wait()?;
            let data = payload.lock().expect("payload poisoned");
            let head: Vec<String> = data.iter().take(16).map(|b| format!("{b:02x}")).collect();
            Ok(format!(
                "read {nsect} sector(s) at lba {lba}: {} ...",
                head.join(" ")
            ))
        }
        "help" => Ok(HELP.to_string()),
        other => bail!("unknown command {other:?} (try \"help\")"),
    }
}

fn parse_byte(s: &str) -> Result<u8> {
    if let Some(hex) = s.strip_prefix("0x") {
        u8::from_str_radix(hex, 16).context("byte must fit in 8 bits")
    } else {
        s.parse().context("byte must fit in 8 bits")
    }
}
