//! # Control Surface
//!
//! Text attribute layer over the device: every knob and counter is
//! reachable through `write_attr` / `read_attr` with human-readable
//! values, mirroring a sysfs-style interface. Trailing newlines on
//! stored values are ignored.
//!
//! | attribute                | access | semantics                                  |
//! |--------------------------|--------|--------------------------------------------|
//! | `disksize`               | RW     | capacity in bytes (K/M/G suffixes allowed) |
//! | `initstate`              | R      | 1 iff configured                           |
//! | `reset`                  | W      | nonzero tears the device down              |
//! | `compact`                | W      | trigger pool compaction                    |
//! | `mem_limit`              | W      | pool cap in bytes, 0 = unbounded           |
//! | `mem_used_max`           | W      | "0" resets the high-water mark             |
//! | `idle`                   | W      | "all" marks eligible slots idle            |
//! | `new`                    | W      | "all" clears idle state everywhere         |
//! | `comp_algorithm`         | RW     | codec name, unconfigured only              |
//! | `backing_dev`            | RW     | backing file path, unconfigured only       |
//! | `writeback`              | W      | "huge" / "idle [max [min]]"                |
//! | `writeback_limit`        | RW     | write budget in 4 KiB units                |
//! | `writeback_limit_enable` | RW     | budget on/off                              |
//! | `use_dedup`              | RW     | dedup on/off, unconfigured only            |
//! | `low_compress_ratio`     | RW     | COMPRESS_LOW threshold in percent          |
//! | `max_comp_streams`       | RW     | reads report the pool width; writes are    |
//! |                          |        | accepted and ignored (compatibility)       |
//! | `mm_stat` ...            | R      | whitespace-delimited counter tuples        |

use std::sync::atomic::Ordering;

use eyre::{bail, ensure, Result};

use crate::codec;
use crate::config::{IDLE_COUNT_MAX, PAGE_SHIFT, PAGE_SIZE};
use crate::writeback::parse_writeback;

use super::Device;

/// Parse a byte size with an optional K/M/G suffix.
pub fn parse_size(input: &str) -> Result<u64> {
    let input = input.trim();
    ensure!(!input.is_empty(), "empty size");
    let (digits, shift) = match input.as_bytes()[input.len() - 1] {
        b'K' | b'k' => (&input[..input.len() - 1], 10),
        b'M' | b'm' => (&input[..input.len() - 1], 20),
        b'G' | b'g' => (&input[..input.len() - 1], 30),
        _ => (input, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|e| eyre::eyre!("bad size {input:?}: {e}"))?;
    value
        .checked_shl(shift)
        .filter(|v| v >> shift == value)
        .ok_or_else(|| eyre::eyre!("size {input:?} overflows"))
}

fn parse_bool(input: &str) -> Result<bool> {
    match input.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => bail!("expected 0 or 1, got {other:?}"),
    }
}

impl Device {
    /// Store a textual attribute value.
    pub fn write_attr(&self, name: &str, value: &str) -> Result<()> {
        let value = value.trim_end_matches('\n');
        match name {
            "disksize" => self.set_disksize(parse_size(value)?),
            "reset" => {
                let v: u16 = value.trim().parse()?;
                ensure!(v != 0, "reset requires a nonzero value");
                self.reset()
            }
            "compact" => self.compact(),
            "mem_limit" => {
                self.set_mem_limit(parse_size(value)?);
                Ok(())
            }
            "mem_used_max" => {
                ensure!(value.trim() == "0", "mem_used_max only accepts 0");
                self.reset_mem_used_max();
                Ok(())
            }
            "idle" => {
                ensure!(value.trim() == "all", "idle only accepts \"all\"");
                self.mark_idle().map(|_| ())
            }
            "new" => {
                ensure!(value.trim() == "all", "new only accepts \"all\"");
                self.mark_new()
            }
            "comp_algorithm" => self.set_compressor(value.trim()),
            "backing_dev" => self.set_backing_dev(std::path::Path::new(value.trim())),
            "writeback" => self.writeback(parse_writeback(value)?).map(|_| ()),
            "writeback_limit" => {
                self.set_writeback_limit(value.trim().parse()?);
                Ok(())
            }
            "writeback_limit_enable" => {
                self.set_writeback_limit_enable(parse_bool(value)?);
                Ok(())
            }
            "use_dedup" => self.set_use_dedup(parse_bool(value)?),
            "low_compress_ratio" => {
                self.set_low_compress_ratio(value.trim().parse()?);
                Ok(())
            }
            "max_comp_streams" => Ok(()),
            other => bail!("unknown attribute: {other}"),
        }
    }

    /// Render a textual attribute value.
    pub fn read_attr(&self, name: &str) -> Result<String> {
        match name {
            "disksize" => Ok(format!("{}\n", self.disksize())),
            "initstate" => Ok(format!("{}\n", self.init_done() as u32)),
            "comp_algorithm" => Ok(format!(
                "{}\n",
                codec::format_available(&self.compressor())
            )),
            "backing_dev" => {
                let inner = self.inner.read();
                match inner.backing.as_ref().and_then(|b| b.path()) {
                    Some(path) => Ok(format!("{path}\n")),
                    None => Ok("none\n".to_string()),
                }
            }
            "writeback_limit" => Ok(format!("{}\n", self.writeback_limit())),
            "writeback_limit_enable" => {
                Ok(format!("{}\n", self.writeback_limit_enable() as u32))
            }
            "use_dedup" => Ok(format!("{}\n", self.use_dedup() as u32)),
            "low_compress_ratio" => Ok(format!("{}\n", self.low_compress_ratio())),
            "max_comp_streams" => Ok(format!("{}\n", self.max_comp_streams())),
            "mm_stat" => Ok(self.mm_stat()),
            "io_stat" => Ok(self.io_stat()),
            "bd_stat" => Ok(self.bd_stat()),
            "debug_stat" => Ok(self.debug_stat()),
            "idle_stat" => self.idle_stat(),
            "new_stat" => self.new_stat(),
            "block_state" => self.block_state(),
            other => bail!("unknown attribute: {other}"),
        }
    }

    pub fn set_writeback_limit(&self, pages_4k: u64) {
        self.wb_limit.lock().budget = pages_4k;
    }

    pub fn writeback_limit(&self) -> u64 {
        self.wb_limit.lock().budget
    }

    pub fn set_writeback_limit_enable(&self, enable: bool) {
        self.wb_limit.lock().enable = enable;
    }

    pub fn writeback_limit_enable(&self) -> bool {
        self.wb_limit.lock().enable
    }

    pub fn set_low_compress_ratio(&self, percent: u32) {
        self.low_ratio.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn low_compress_ratio(&self) -> u32 {
        self.low_ratio.load(Ordering::Relaxed)
    }

    pub fn max_comp_streams(&self) -> usize {
        self.inner
            .read()
            .runtime
            .as_ref()
            .map(|rt| rt.streams.width())
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }

    /// Pool pages currently in use.
    pub fn mem_used_pages(&self) -> u64 {
        self.inner
            .read()
            .runtime
            .as_ref()
            .map_or(0, |rt| rt.pool.total_pages())
    }

    /// Memory-management counters:
    /// `orig_size compr_size mem_used mem_limit mem_used_max same_pages
    ///  pages_compacted huge_pages dup_size meta_size lowratio_pages`.
    pub fn mm_stat(&self) -> String {
        let inner = self.inner.read();
        let mem_used = inner
            .runtime
            .as_ref()
            .map_or(0, |rt| rt.pool.total_pages());
        let limit_pages = inner.limit_pages;
        drop(inner);

        let s = &self.stats;
        format!(
            "{:8} {:8} {:8} {:8} {:8} {:8} {:8} {:8} {:8} {:8} {:8}\n",
            s.pages_stored.load(Ordering::Relaxed) << PAGE_SHIFT,
            s.compr_data_size.load(Ordering::Relaxed),
            mem_used << PAGE_SHIFT,
            limit_pages << PAGE_SHIFT,
            s.max_used_pages.load(Ordering::Relaxed) << PAGE_SHIFT,
            s.same_pages.load(Ordering::Relaxed),
            s.pages_compacted.load(Ordering::Relaxed),
            s.huge_pages.load(Ordering::Relaxed),
            s.dup_data_size.load(Ordering::Relaxed),
            s.meta_data_size.load(Ordering::Relaxed),
            s.lowratio_pages.load(Ordering::Relaxed),
        )
    }

    /// I/O error counters: `failed_reads failed_writes invalid_io
    /// notify_free`.
    pub fn io_stat(&self) -> String {
        let s = &self.stats;
        format!(
            "{:8} {:8} {:8} {:8}\n",
            s.failed_reads.load(Ordering::Relaxed),
            s.failed_writes.load(Ordering::Relaxed),
            s.invalid_io.load(Ordering::Relaxed),
            s.notify_free.load(Ordering::Relaxed),
        )
    }

    /// Backing device counters in 4 KiB units: `count reads writes`.
    pub fn bd_stat(&self) -> String {
        let four_k = |v: u64| v * ((PAGE_SIZE >> 12) as u64);
        let s = &self.stats;
        format!(
            "{:8} {:8} {:8}\n",
            four_k(s.bd_count.load(Ordering::Relaxed)),
            four_k(s.bd_reads.load(Ordering::Relaxed)),
            four_k(s.bd_writes.load(Ordering::Relaxed)),
        )
    }

    /// Internal counters: `writestall miss_free`.
    pub fn debug_stat(&self) -> String {
        let s = &self.stats;
        format!(
            "version: 1\n{:8} {:8}\n",
            s.writestall.load(Ordering::Relaxed),
            s.miss_free.load(Ordering::Relaxed),
        )
    }

    /// Eviction candidates per idle epoch count, epochs 1..=max.
    pub fn idle_stat(&self) -> Result<String> {
        let counts = self.idle_histogram()?;
        let rendered = (1..=IDLE_COUNT_MAX as usize)
            .map(|i| counts[i].to_string())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(format!("{rendered}\n"))
    }

    /// Eviction candidates that have not survived any idle epoch.
    pub fn new_stat(&self) -> Result<String> {
        let counts = self.idle_histogram()?;
        Ok(format!("{}\n", counts[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64K").unwrap(), 64 << 10);
        assert_eq!(parse_size("8M\n").unwrap(), 8 << 20);
        assert_eq!(parse_size("1g").unwrap(), 1 << 30);
        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("K").is_err());
    }

    #[test]
    fn attr_roundtrip_configuration() {
        let dev = Device::new(0);

        dev.write_attr("comp_algorithm", "snappy\n").unwrap();
        assert_eq!(dev.read_attr("comp_algorithm").unwrap(), "lz4 [snappy]\n");

        dev.write_attr("disksize", "1M").unwrap();
        assert_eq!(dev.read_attr("disksize").unwrap(), "1048576\n");
        assert_eq!(dev.read_attr("initstate").unwrap(), "1\n");
    }

    #[test]
    fn unknown_attributes_are_rejected() {
        let dev = Device::new(0);
        assert!(dev.write_attr("bogus", "1").is_err());
        assert!(dev.read_attr("bogus").is_err());
    }

    #[test]
    fn idle_store_requires_all() {
        let dev = Device::new(0);
        dev.set_disksize(1 << 16).unwrap();
        assert!(dev.write_attr("idle", "some").is_err());
        dev.write_attr("idle", "all").unwrap();
    }

    #[test]
    fn writeback_limit_attrs() {
        let dev = Device::new(0);

        dev.write_attr("writeback_limit", "128").unwrap();
        dev.write_attr("writeback_limit_enable", "1").unwrap();

        assert_eq!(dev.read_attr("writeback_limit").unwrap(), "128\n");
        assert_eq!(dev.read_attr("writeback_limit_enable").unwrap(), "1\n");
    }

    #[test]
    fn backing_dev_reads_none_when_unset() {
        let dev = Device::new(0);
        assert_eq!(dev.read_attr("backing_dev").unwrap(), "none\n");
    }
}
