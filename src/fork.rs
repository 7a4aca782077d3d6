//! Fork safety: makes sure a child process never inherits a mutex held
//! mid-update by a thread that exists only in the parent.
//!
//! `fork()` only clones the calling thread; any lock held by some other
//! thread at the moment of the call is copied into the child exactly as
//! it was -- locked, with no thread left alive to ever unlock it. Every
//! allocator mutex is therefore acquired, in one fixed order, before
//! the fork happens, and released again immediately after, in both the
//! parent and the child. This is the same strategy and the same lock
//! order (`arenas` then each arena's own mutexes, outermost to
//! innermost) as `jemalloc.c`'s `jemalloc_prefork`/`jemalloc_postfork`,
//! which installs the *same* handler for both the parent and child
//! `pthread_atfork` slots since releasing a lock that was never
//! actually contended is all either side needs to do.
use std::cell::RefCell;

use crate::arena::ArenaForkGuard;
use crate::init;

thread_local! {
    // Populated by `prefork` on the thread that calls `fork()`, and
    // drained (unlocking everything) by whichever of `postfork_parent`/
    // `postfork_child` runs next. `pthread_atfork` guarantees prepare
    // and the matching post-fork callback run on the same thread with
    // nothing else able to observe the locks in between.
    static HELD: RefCell<Option<Vec<ArenaForkGuard<'static>>>> = RefCell::new(None);
}

/// Registers `prefork`/`postfork_parent`/`postfork_child` with
/// `pthread_atfork`, so every `fork()` this process makes through libc
/// (directly or via `std::process::Command`) goes through them. Called
/// once from `init::Globals::boot`.
pub fn install_handlers() {
    unsafe {
        let rc = libc::pthread_atfork(Some(prefork), Some(postfork_parent), Some(postfork_child));
        if rc != 0 {
            log::warn!("parcel: pthread_atfork registration failed (errno {}), fork() will be unsafe", rc);
        }
    }
}

extern "C" fn prefork() {
    let globals = init::global();
    let guards: Vec<ArenaForkGuard<'static>> = globals.arenas().iter().map(|arena| arena.fork_lock()).collect();
    HELD.with(|held| {
        *held.borrow_mut() = Some(guards);
    });
}

extern "C" fn postfork_parent() {
    release();
}

extern "C" fn postfork_child() {
    release();
}

fn release() {
    HELD.with(|held| {
        // Dropping the guards unlocks every mutex, innermost first
        // within each arena, and arena-by-arena, the exact reverse of
        // the order `prefork` acquired them in.
        held.borrow_mut().take();
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prefork_postfork_roundtrip_does_not_deadlock() {
        // Exercises the full lock/unlock cycle on this thread; a real
        // fork() is not exercised here since it would duplicate the
        // whole test process, but the lock acquisition/release pairing
        // is the part unique to this module.
        prefork();
        postfork_parent();

        // A second cycle proves the arena's mutexes were actually
        // released, not merely dropped-and-poisoned.
        prefork();
        postfork_child();
    }
}
