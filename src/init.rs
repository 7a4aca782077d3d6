//! One-time, process-wide bootstrap: parses options, installs the fork
//! handlers, and builds the arena array every allocation is routed
//! through.
//!
//! Guarded by the same `lazy_static` + `Once` idiom `rtree.rs` already
//! uses for its own process-wide global: the
//! first caller to touch `global()` runs `Globals::boot`, every other
//! concurrent caller blocks until it finishes, and every later caller
//! gets the already-built value. Matches spec's "init_lock + flag"
//! requirement without a hand-rolled lock, since recursion into this
//! crate's own allocator during bootstrap cannot happen -- `Globals`
//! is built entirely out of the process's ordinary Rust allocator.
use std::sync::atomic::{AtomicU32, Ordering};

use crate::arena::Arena;
use crate::config::Options;
use crate::tcache::{self, TcacheDepot};

/// The fully booted, read-only-after-construction allocator state.
/// Each arena's own mutexes still guard its mutable interior.
pub struct Globals {
    pub options: Options,
    arenas: Vec<Arena>,
    depots: Vec<TcacheDepot>,
    next_arena: AtomicU32,
}

impl Globals {
    fn boot() -> Self {
        let options = Options::from_env();
        crate::fork::install_handlers();

        let ncpus = ncpus();
        let narenas = narenas_from_ncpus(ncpus, options.narenas_lshift);
        let nclasses = tcache::cached_class_count(options.lg_tcache_max);

        let mut arenas = Vec::with_capacity(narenas);
        let mut depots = Vec::with_capacity(narenas);
        for id in 0..narenas {
            let arena = Arena::new(id as u32, options.lg_chunk, options.lg_dirty_mult);
            if options.file_backed {
                arena.hooks().set_alloc(crate::file_backed_mapper::alloc);
                arena.hooks().set_dalloc(crate::file_backed_mapper::dalloc);
            }
            arenas.push(arena);
            depots.push(TcacheDepot::new(nclasses));
        }

        log::info!("parcel: booted {} arena(s) for {} visible cpu(s)", narenas, ncpus);

        Self {
            options,
            arenas,
            depots,
            next_arena: AtomicU32::new(0),
        }
    }

    pub fn narenas(&self) -> usize {
        self.arenas.len()
    }

    pub fn arena(&self, ind: u32) -> &Arena {
        &self.arenas[ind as usize]
    }

    pub fn depot(&self, ind: u32) -> &TcacheDepot {
        &self.depots[ind as usize]
    }

    pub fn arenas(&self) -> &[Arena] {
        &self.arenas
    }

    /// Assigns a newly-seen thread to an arena: round-robin, but biased
    /// to prefer whichever arena currently has the fewest live bound
    /// threads (spec.md §4.4), so a burst of short-lived threads that
    /// all exited doesn't leave later threads piling onto one arena.
    /// Ties (the common case, all arenas equally loaded) fall back to
    /// the round-robin cursor's starting point.
    pub fn choose_arena(&self) -> u32 {
        let narenas = self.narenas() as u32;
        let start = self.next_arena.fetch_add(1, Ordering::Relaxed) % narenas;

        let mut best = start;
        let mut best_load = self.arenas[start as usize].live_threads();
        for offset in 1..narenas {
            let idx = (start + offset) % narenas;
            let load = self.arenas[idx as usize].live_threads();
            if load < best_load {
                best = idx;
                best_load = load;
            }
        }
        best
    }
}

lazy_static::lazy_static! {
    static ref GLOBALS: Globals = Globals::boot();
}

/// Boots the allocator's global state on first call; every later call,
/// from any thread, returns the same already-built value.
pub fn global() -> &'static Globals {
    &GLOBALS
}

fn ncpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// `narenas = max(1, ncpus << narenas_lshift)` when `narenas_lshift` is
/// non-negative, else `max(1, ncpus >> -narenas_lshift)`; mirrors
/// jemalloc.c's `narenas_auto` computation.
pub fn narenas_from_ncpus(ncpus: usize, narenas_lshift: i32) -> usize {
    let scaled = if narenas_lshift >= 0 {
        ncpus.checked_shl(narenas_lshift as u32).unwrap_or(usize::MAX)
    } else {
        let shift = (-narenas_lshift) as u32;
        if shift >= usize::BITS {
            0
        } else {
            ncpus >> shift
        }
    };
    scaled.max(1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_narenas_from_ncpus_positive_shift() {
        assert_eq!(narenas_from_ncpus(4, 2), 16);
    }

    #[test]
    fn test_narenas_from_ncpus_negative_shift() {
        assert_eq!(narenas_from_ncpus(4, -1), 2);
    }

    #[test]
    fn test_narenas_from_ncpus_floor_of_one() {
        assert_eq!(narenas_from_ncpus(1, -8), 1);
    }

    #[test]
    fn test_global_boots_and_is_stable() {
        let a = global() as *const Globals;
        let b = global() as *const Globals;
        assert_eq!(a, b);
        assert!(global().narenas() >= 1);
    }

    #[test]
    fn test_choose_arena_prefers_least_loaded() {
        let arenas: Vec<Arena> = (0..3).map(|id| Arena::new(id, 21, 3)).collect();
        let depots: Vec<TcacheDepot> = (0..3).map(|_| TcacheDepot::new(1)).collect();
        let globals = Globals {
            options: Options::default(),
            arenas,
            depots,
            next_arena: AtomicU32::new(0),
        };

        // Bind two threads to arena 0 and one to arena 1, leaving arena
        // 2 empty; regardless of where the round-robin cursor starts,
        // the least-loaded arena 2 should be preferred.
        globals.arena(0).bind_thread();
        globals.arena(0).bind_thread();
        globals.arena(1).bind_thread();

        assert_eq!(globals.choose_arena(), 2);
    }
}
