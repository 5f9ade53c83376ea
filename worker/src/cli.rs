use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::arena::MAX_SLOTS;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Compute worker for a lattice GPU fleet")]
pub struct Config {
    #[arg(long = "arena", short = 'a', env = "LATTICE_ARENA_NAME", default_value = "/lattice-arena", help = "Name of the shared memory arena")]
    pub arena_name: String,
    #[arg(long = "socket", short = 's', env = "LATTICE_SOCKET_PATH", default_value = "/tmp/lattice.sock", help = "Path of the host control socket")]
    pub socket_path: PathBuf,
    #[arg(long = "slot", env = "LATTICE_SLOT_ID", default_value = "0", value_parser = parse_slot_index, help = "Worker slot index or replica identifier (e.g. \"worker-3\")")]
    pub slot_index: usize,
    #[arg(long = "poll", short = 'p', env = "LATTICE_POLL_INTERVAL", default_value = "1000 ms", value_parser = humantime::parse_duration, help = "Dispatch loop polling interval")]
    pub poll_interval: Duration,
    #[arg(long, env = "LATTICE_DEBUG", help = "Enable debug logging")]
    pub debug: bool,
}

fn parse_slot_index(raw: &str) -> Result<usize, String> {
    Ok(resolve_slot_index(raw))
}

/// Map a slot identifier to an index below [`MAX_SLOTS`].
///
/// Accepts a plain number, a replica-ordinal style name with a trailing
/// numeric suffix ("worker-3"), or any other string, which is reduced
/// through a deterministic FNV-1a hash. The result is always taken modulo
/// the slot count.
pub fn resolve_slot_index(raw: &str) -> usize {
    let trimmed = raw.trim();
    if let Ok(index) = trimmed.parse::<usize>() {
        return index % MAX_SLOTS;
    }

    let suffix: String = trimmed
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if let Ok(index) = suffix.parse::<usize>() {
        return index % MAX_SLOTS;
    }

    (fnv1a_64(trimmed.as_bytes()) % MAX_SLOTS as u64) as usize
}

/// FNV-1a, 64-bit. Used for slot derivation and job-id digests.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
