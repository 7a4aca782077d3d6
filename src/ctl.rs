//! `mallctl`-style introspection: a `&str` path namespace over the
//! allocator's configuration and live statistics, mirroring jemalloc's
//! own `mallctl` hierarchy (`stats.allocated`, `arena.<i>.purge`, ...).
//!
//! Every entry is either readable (`get`), a zero-argument command
//! (`invoke`, e.g. `arena.<i>.purge`), or both; nothing here is
//! writable with an arbitrary value, since every tunable this crate
//! exposes is fixed at `init::Globals::boot` time and has no runtime
//! setter -- `CtlError::NotWritable` covers that whole class of
//! request uniformly rather than each entry needing its own check.
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::Dss;
use crate::init;
use crate::size_class;

#[derive(Clone, Debug, PartialEq)]
pub enum CtlValue {
    Int(i64),
    Uint(u64),
    Size(usize),
    Bool(bool),
    Str(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CtlError {
    NotFound,
    NotWritable,
    TypeMismatch,
}

/// Bumped by `invoke("epoch")`; mirrors jemalloc's own `epoch` mallctl,
/// which callers write to force cached stats to refresh. Our stats are
/// always computed live (see `stats.rs`), so there is nothing to
/// refresh, but the counter still gives callers a way to observe that
/// their request was serviced.
static EPOCH: AtomicU64 = AtomicU64::new(0);

fn dss_name(dss: Dss) -> &'static str {
    match dss {
        Dss::Disabled => "disabled",
        Dss::Secondary => "secondary",
        Dss::Primary => "primary",
    }
}

fn parse_index(segment: &str) -> Result<u32, CtlError> {
    segment.parse().map_err(|_| CtlError::NotFound)
}

fn arena_index_in_range(idx: u32) -> Result<u32, CtlError> {
    if (idx as usize) < init::global().narenas() {
        Ok(idx)
    } else {
        Err(CtlError::NotFound)
    }
}

fn opt_value(name: &str) -> Result<CtlValue, CtlError> {
    let options = &init::global().options;
    Ok(match name {
        "abort" => CtlValue::Bool(options.abort),
        "junk" => CtlValue::Bool(options.junk),
        "zero" => CtlValue::Bool(options.zero),
        "tcache" => CtlValue::Bool(options.tcache),
        "stats_print" => CtlValue::Bool(options.stats_print),
        "file_backed" => CtlValue::Bool(options.file_backed),
        "narenas_lshift" => CtlValue::Int(options.narenas_lshift as i64),
        "lg_chunk" => CtlValue::Uint(options.lg_chunk as u64),
        "lg_dirty_mult" => CtlValue::Uint(options.lg_dirty_mult as u64),
        "lg_tcache_max" => CtlValue::Uint(options.lg_tcache_max as u64),
        "dss" => CtlValue::Str(dss_name(options.dss).to_string()),
        _ => return Err(CtlError::NotFound),
    })
}

/// Looks up the current value of `name`.
pub fn get(name: &str) -> Result<CtlValue, CtlError> {
    let globals = init::global();
    let parts: Vec<&str> = name.split('.').collect();

    match parts.as_slice() {
        ["arenas", "narenas"] => Ok(CtlValue::Size(globals.narenas())),
        ["arena", idx, "dss"] => {
            arena_index_in_range(parse_index(idx)?)?;
            Ok(CtlValue::Str(dss_name(globals.options.dss).to_string()))
        }
        ["stats", "allocated"] => Ok(CtlValue::Uint(
            globals.arenas().iter().map(|a| a.stats.allocated()).sum(),
        )),
        ["stats", "active"] => Ok(CtlValue::Size(
            globals.arenas().iter().map(|a| a.npages_allocated() * size_class::PAGE).sum(),
        )),
        ["stats", "arenas", idx, "small", "allocated"] => {
            let i = arena_index_in_range(parse_index(idx)?)?;
            Ok(CtlValue::Uint(
                globals.arena(i).stats.small_allocated.load(Ordering::Relaxed),
            ))
        }
        ["stats", "arenas", idx, "large", "allocated"] => {
            let i = arena_index_in_range(parse_index(idx)?)?;
            Ok(CtlValue::Uint(
                globals.arena(i).stats.large_allocated.load(Ordering::Relaxed),
            ))
        }
        ["stats", "arenas", idx, "npurge"] => {
            let i = arena_index_in_range(parse_index(idx)?)?;
            Ok(CtlValue::Uint(globals.arena(i).stats.npurge.load(Ordering::Relaxed)))
        }
        ["stats", "arenas", idx, "nmadvise"] => {
            let i = arena_index_in_range(parse_index(idx)?)?;
            Ok(CtlValue::Uint(globals.arena(i).stats.nmadvise.load(Ordering::Relaxed)))
        }
        ["stats", "arenas", idx, "purged"] => {
            let i = arena_index_in_range(parse_index(idx)?)?;
            Ok(CtlValue::Uint(globals.arena(i).stats.purged.load(Ordering::Relaxed)))
        }
        ["opt", opt_name] => opt_value(opt_name),
        ["epoch"] => Ok(CtlValue::Uint(EPOCH.load(Ordering::Relaxed))),
        _ => Err(CtlError::NotFound),
    }
}

/// Runs the zero-argument command `name`, e.g. `arena.<i>.purge` or
/// `epoch`. Returns `CtlError::NotFound` for anything else, including
/// entries that exist for `get` but are not commands.
pub fn invoke(name: &str) -> Result<(), CtlError> {
    let globals = init::global();
    let parts: Vec<&str> = name.split('.').collect();

    match parts.as_slice() {
        ["arena", idx, "purge"] => {
            let i = arena_index_in_range(parse_index(idx)?)?;
            globals.arena(i).maybe_purge();
            Ok(())
        }
        ["epoch"] => {
            EPOCH.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        _ => Err(CtlError::NotFound),
    }
}

/// Writes `value` to `name`. Every entry `get` exposes is read-only, so
/// this always fails with `NotWritable` for a known entry, or
/// `NotFound` for an unknown one; `set` exists to make that explicit at
/// the API boundary rather than silently accepting a write nothing
/// honors.
pub fn set(name: &str, _value: CtlValue) -> Result<(), CtlError> {
    match get(name) {
        Ok(_) => Err(CtlError::NotWritable),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_arenas_narenas() {
        assert!(matches!(get("arenas.narenas"), Ok(CtlValue::Size(n)) if n >= 1));
    }

    #[test]
    fn test_stats_allocated_reflects_activity() {
        let before = match get("stats.allocated").unwrap() {
            CtlValue::Uint(v) => v,
            _ => panic!("wrong kind"),
        };

        let ptr = crate::dispatch::allocate(4096, 1, false).expect("should allocate");

        let after = match get("stats.allocated").unwrap() {
            CtlValue::Uint(v) => v,
            _ => panic!("wrong kind"),
        };
        assert!(after > before);

        crate::dispatch::deallocate(ptr);
    }

    #[test]
    fn test_opt_junk_is_bool() {
        assert!(matches!(get("opt.junk"), Ok(CtlValue::Bool(_))));
    }

    #[test]
    fn test_unknown_path_not_found() {
        assert_eq!(get("nonsense.path"), Err(CtlError::NotFound));
    }

    #[test]
    fn test_out_of_range_arena_not_found() {
        assert_eq!(get("arena.999999.dss"), Err(CtlError::NotFound));
    }

    #[test]
    fn test_set_known_entry_is_not_writable() {
        assert_eq!(set("opt.junk", CtlValue::Bool(false)), Err(CtlError::NotWritable));
    }

    #[test]
    fn test_epoch_invoke_advances() {
        let before = get("epoch").unwrap();
        invoke("epoch").unwrap();
        let after = get("epoch").unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_arena_purge_invoke_succeeds() {
        invoke("arena.0.purge").expect("should purge arena 0");
    }
}
