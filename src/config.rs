//! Runtime configuration, parsed once at init from the `PARCEL_OPTIONS`
//! environment variable (the crate's analogue of jemalloc's
//! `malloc_conf`/`MALLOC_CONF`).
//!
//! Grammar matches jemalloc's `malloc_conf` string: comma-separated
//! `name:value` pairs, e.g. `"abort:true,lg_dirty_mult:4,dss:primary"`.
//! Unknown names and malformed values are logged and skipped rather
//! than treated as fatal, since a typo in an operator's environment
//! should not take the allocator itself down.
use std::env;

use crate::arena::{DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT};
use crate::tcache::DEFAULT_LG_TCACHE_MAX;

/// Controls whether `sbrk`-based allocation (`page::sbrk`) may be used
/// to grow the data segment. Disabled by default: `sbrk` extends a
/// process-wide, non-relocatable region and cannot be released back to
/// the OS, so every caller must opt in explicitly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dss {
    Disabled,
    /// Try `mmap` first, fall back to `sbrk` when it is exhausted.
    Secondary,
    /// Try `sbrk` first, fall back to `mmap`.
    Primary,
}

impl Dss {
    fn parse(value: &str) -> Option<Dss> {
        match value {
            "disabled" => Some(Dss::Disabled),
            "secondary" => Some(Dss::Secondary),
            "primary" => Some(Dss::Primary),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Options {
    /// Call `libc::abort()` on invariant violations instead of
    /// returning an error, to get a core dump at the point of failure.
    pub abort: bool,
    /// Fill freshly carved regions with a recognizable byte pattern,
    /// to turn use-after-alloc-before-write bugs into reproducible
    /// garbage instead of zeros.
    pub junk: bool,
    /// Zero-fill freed regions before they can be reused.
    pub zero: bool,
    /// Shift applied to `ncpus` when deriving `narenas`; see
    /// `init::narenas_from_ncpus`.
    pub narenas_lshift: i32,
    pub lg_chunk: u32,
    pub lg_dirty_mult: u32,
    /// Whether new threads get a `tcache` at all.
    pub tcache: bool,
    pub lg_tcache_max: u32,
    /// Print a human-readable stats dump to stderr at process exit.
    pub stats_print: bool,
    pub dss: Dss,
    /// Back every arena's chunks with `file_backed_mapper` instead of
    /// anonymous memory, so cold chunks can be swapped out under
    /// memory pressure.
    pub file_backed: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            abort: false,
            junk: cfg!(debug_assertions),
            zero: false,
            narenas_lshift: 2,
            lg_chunk: DEFAULT_LG_CHUNK,
            lg_dirty_mult: DEFAULT_LG_DIRTY_MULT,
            tcache: true,
            lg_tcache_max: DEFAULT_LG_TCACHE_MAX,
            stats_print: false,
            dss: Dss::Disabled,
            file_backed: false,
        }
    }
}

impl Options {
    /// Parses options from the `PARCEL_OPTIONS` environment variable,
    /// falling back to defaults for anything absent or malformed.
    pub fn from_env() -> Self {
        let mut opts = Options::default();
        if let Ok(raw) = env::var("PARCEL_OPTIONS") {
            opts.apply_str(&raw);
        }
        opts
    }

    /// Applies every `name:value` pair in `raw`, in order, so later
    /// entries override earlier ones; unrecognized entries are logged
    /// and otherwise ignored.
    pub fn apply_str(&mut self, raw: &str) {
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let Some((name, value)) = entry.split_once(':') else {
                log::warn!("malformed PARCEL_OPTIONS entry (missing ':'): {:?}", entry);
                continue;
            };

            if let Err(reason) = self.apply_one(name.trim(), value.trim()) {
                log::warn!("ignoring PARCEL_OPTIONS entry {:?}: {}", entry, reason);
            }
        }
    }

    fn apply_one(&mut self, name: &str, value: &str) -> Result<(), &'static str> {
        match name {
            "abort" => self.abort = parse_bool(value)?,
            "junk" => self.junk = parse_bool(value)?,
            "zero" => self.zero = parse_bool(value)?,
            "narenas_lshift" => self.narenas_lshift = value.parse().map_err(|_| "not an integer")?,
            "lg_chunk" => self.lg_chunk = parse_lg(value)?,
            "lg_dirty_mult" => self.lg_dirty_mult = parse_lg(value)?,
            "tcache" => self.tcache = parse_bool(value)?,
            "lg_tcache_max" => self.lg_tcache_max = parse_lg(value)?,
            "stats_print" => self.stats_print = parse_bool(value)?,
            "dss" => self.dss = Dss::parse(value).ok_or("unrecognized dss mode")?,
            "file_backed" => self.file_backed = parse_bool(value)?,
            _ => return Err("unrecognized option name"),
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool, &'static str> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err("not a boolean"),
    }
}

fn parse_lg(value: &str) -> Result<u32, &'static str> {
    let lg: u32 = value.parse().map_err(|_| "not an integer")?;
    if lg >= usize::BITS {
        return Err("shift too large");
    }
    Ok(lg)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_are_disabled_dss() {
        let opts = Options::default();
        assert_eq!(opts.dss, Dss::Disabled);
        assert!(opts.tcache);
    }

    #[test]
    fn test_parses_known_options() {
        let mut opts = Options::default();
        opts.apply_str("abort:true,lg_dirty_mult:4,dss:primary,narenas_lshift:-1");
        assert!(opts.abort);
        assert_eq!(opts.lg_dirty_mult, 4);
        assert_eq!(opts.dss, Dss::Primary);
        assert_eq!(opts.narenas_lshift, -1);
    }

    #[test]
    fn test_unknown_option_is_ignored_not_fatal() {
        let mut opts = Options::default();
        opts.apply_str("not_a_real_option:true,junk:true");
        assert!(opts.junk);
    }

    #[test]
    fn test_malformed_entry_is_ignored() {
        let mut opts = Options::default();
        opts.apply_str("lg_chunk_without_colon,lg_chunk:21");
        assert_eq!(opts.lg_chunk, 21);
    }

    #[test]
    fn test_file_backed_defaults_off_and_parses() {
        let mut opts = Options::default();
        assert!(!opts.file_backed);
        opts.apply_str("file_backed:true");
        assert!(opts.file_backed);
    }
}
