// Archive inspection tool - parses and displays the structure of a backup
// archive file, verifying body CRCs along the way.
//
// Usage:
//   cargo run --bin archive_inspector -- <file_path> [-x] [--hex-limit N]

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use incremental_bitmap::archive::{ArchiveReader, ARCHIVE_VERSION};

#[derive(Parser, Debug)]
#[command(name = "archive_inspector")]
#[command(about = "Backup archive inspection tool", long_about = None)]
struct Args {
    /// Archive file to inspect
    #[arg(value_name = "FILE")]
    file_path: PathBuf,

    /// Show a hex dump of each payload
    #[arg(short = 'x', long)]
    hex_dump: bool,

    /// Maximum payload bytes per hex dump
    #[arg(long, default_value = "256")]
    hex_limit: usize,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match inspect(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn inspect(args: &Args) -> incremental_bitmap::Result<()> {
    let file = File::open(&args.file_path)?;
    let mut reader = ArchiveReader::new(BufReader::new(file));

    let header = reader.read_header()?;
    println!("=== Archive Header ===");
    println!("object name      : {}", header.obj_name);
    println!("version          : {ARCHIVE_VERSION:#o} ({ARCHIVE_VERSION})");
    println!("api commit id    : {}", display_or_dash(&header.api_commit_id));
    println!("server commit id : {}", display_or_dash(&header.server_commit_id));
    println!("timestamp (ms)   : {}", header.timestamp_ms);
    println!("vgroup id        : {}", header.vg_id);
    println!("file sequence    : {}", header.file_seq);

    println!("\n=== Body Blocks ===");
    let mut count = 0u64;
    let mut payload_bytes = 0u64;
    while let Some(block) = reader.next_block()? {
        println!(
            "block {count}: type={} msg_type={} payload={} bytes, crc ok",
            block.block_type,
            block.msg_type,
            block.payload.len()
        );
        if args.hex_dump {
            hex_dump(&block.payload, args.hex_limit);
        }
        payload_bytes += block.payload.len() as u64;
        count += 1;
    }
    println!("\n{count} blocks, {payload_bytes} payload bytes, all CRCs verified");
    Ok(())
}

fn display_or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

fn hex_dump(payload: &[u8], limit: usize) {
    let shown = &payload[..payload.len().min(limit)];
    for (row, chunk) in shown.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!("  {:06x}  {:<48}  {ascii}", row * 16, hex.join(" "));
    }
    if payload.len() > limit {
        println!("  ... {} more bytes", payload.len() - limit);
    }
}
