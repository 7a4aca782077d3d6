//! A `MagazineStack` is a thread-safe single-linked intrusive stack
//! of magazines.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")))]
use disabled_contracts::*;

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::magazine::Magazine;
use crate::magazine_impl::MagazineImpl;

/// Pushes `node` onto the intrusive stack rooted at `head`, using
/// `node.link` for linkage.
#[inline(always)]
fn stack_push(head: &AtomicPtr<MagazineImpl>, node: &MagazineImpl) {
    loop {
        let old_top = head.load(Ordering::Acquire);
        node.link.store(old_top, Ordering::Relaxed);

        if head
            .compare_exchange_weak(old_top, node as *const _ as *mut _, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// Pops the top node off the intrusive stack rooted at `head`, or
/// returns null if it is empty.
#[inline(always)]
fn stack_pop(head: &AtomicPtr<MagazineImpl>) -> *mut MagazineImpl {
    loop {
        let old_top = head.load(Ordering::Acquire);
        if old_top.is_null() {
            return std::ptr::null_mut();
        }

        // SAFETY: `old_top` is still linked into `head`; nothing ever
        // deallocates a node, so the read of its `link` field below
        // always lands on live memory even if another thread has
        // already popped and recycled it into a different magazine in
        // the meantime (the CAS below simply fails in that case).
        let next = unsafe { (*old_top).link.load(Ordering::Relaxed) };

        if head
            .compare_exchange_weak(old_top, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return old_top;
        }
    }
}

/// A `MagazineStack` is a single-linked stack with a generation
/// counter for diagnostics.  Every node it ever hands to `Box::leak`
/// is immortal: `try_pop` never deallocates a node, it only reads the
/// `Magazine` out of it and recycles the now-content-less node onto
/// `free_nodes` for a later `push` to reuse. This means no address is
/// ever freed back to the allocator and then reused for an unrelated
/// object while a concurrent pop might still be dereferencing it --
/// the classic ABA-driven use-after-free a lock-free stack is exposed
/// to once its nodes are actually deallocated. A node can still be
/// popped and pushed back before a stale reader's compare-exchange
/// retries, corrupting the stack's linkage (ABA proper); the
/// `generation` counter does not guard against that, it is read only
/// for stats.
#[repr(C)]
#[repr(align(16))]
pub struct MagazineStack {
    top_of_stack: AtomicPtr<MagazineImpl>,
    free_nodes: AtomicPtr<MagazineImpl>,
    generation: AtomicUsize,
}

impl MagazineStack {
    pub fn new() -> Self {
        Self {
            top_of_stack: AtomicPtr::new(std::ptr::null_mut()),
            free_nodes: AtomicPtr::new(std::ptr::null_mut()),
            generation: AtomicUsize::new(0),
        }
    }

    #[requires(mag.check_rep(None).is_ok(), "Magazine must make sense.")]
    #[inline(always)]
    pub fn push<const PUSH_MAG: bool>(&self, mag: Magazine<PUSH_MAG>) {
        let content = mag.into_impl();

        let recycled = stack_pop(&self.free_nodes);
        let node_ptr = if recycled.is_null() {
            Box::leak(Box::new(content)) as *mut MagazineImpl
        } else {
            // SAFETY: `recycled` came off `free_nodes`, so it holds no
            // live `Magazine` content; overwrite it in place rather
            // than going through a drop of whatever stale bytes are
            // there.
            unsafe { std::ptr::write(recycled, content) };
            recycled
        };

        // SAFETY: `node_ptr` is either freshly leaked or was just
        // written to and is not reachable from any other stack yet.
        let node = unsafe { &*node_ptr };
        stack_push(&self.top_of_stack, node);
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    #[ensures(ret.is_some() -> ret.as_ref().unwrap().check_rep(None).is_ok(),
              "Magazine should make sense.")]
    #[inline(always)]
    pub fn pop<const PUSH_MAG: bool>(&self) -> Option<Magazine<PUSH_MAG>> {
        self.try_pop()
    }

    #[ensures(ret.is_some() -> ret.as_ref().unwrap().check_rep(None).is_ok(),
              "Magazine should make sense.")]
    #[inline(always)]
    pub fn try_pop<const PUSH_MAG: bool>(&self) -> Option<Magazine<PUSH_MAG>> {
        let node_ptr = stack_pop(&self.top_of_stack);
        if node_ptr.is_null() {
            return None;
        }

        self.generation.fetch_add(1, Ordering::Relaxed);

        // SAFETY: `node_ptr` was exclusively removed from `top_of_stack`
        // by the CAS above, so we are the sole owner of its content.
        let content = unsafe { std::ptr::read(node_ptr) };
        // SAFETY: the node itself is never deallocated; recycle it for
        // a future `push` instead of freeing it.
        let node = unsafe { &*node_ptr };
        stack_push(&self.free_nodes, node);

        Some(Magazine::from_impl(content))
    }

    /// Number of successful push/pop operations observed so far;
    /// exposed for the stats layer, not used to guard correctness.
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Relaxed)
    }
}

impl Default for MagazineStack {
    fn default() -> Self {
        Self::new()
    }
}

// MagazineStack is safe to `Send`/`Sync`: every node reachable from
// `top_of_stack` is uniquely owned by whichever thread's CAS last
// claimed it.
unsafe impl Send for MagazineStack {}
unsafe impl Sync for MagazineStack {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::linear_ref::LinearRef;

    #[test]
    fn magazine_stack_smoke_test() {
        let stack = MagazineStack::new();

        // Push/pop shouldn't care about the magazines' polarity.
        stack.push(Magazine::<false>::new());
        stack.push(Magazine::<true>::new());

        assert!(stack.pop::<false>().is_some());

        stack.push(Magazine::<true>::new());
        assert!(stack.pop::<true>().is_some());
        assert!(stack.pop::<false>().is_some());

        assert!(stack.pop::<true>().is_none());
    }

    #[test]
    fn magazine_stack_preserves_contents() {
        let stack = MagazineStack::new();

        let mut mag: Magazine<true> = Magazine::new();
        mag.put(LinearRef::from_address(0x1000));
        stack.push(mag);

        let mut popped: Magazine<false> = stack.pop().expect("should have a magazine");
        let item = popped.get().expect("should have the allocation back");
        assert_eq!(item.address(), 0x1000);
        std::mem::forget(item);
    }

    #[test]
    fn magazine_stack_concurrent_push_pop() {
        use std::sync::Arc;
        use std::thread;

        let stack = Arc::new(MagazineStack::new());
        for _ in 0..32 {
            stack.push(Magazine::<true>::new());
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let stack = Arc::clone(&stack);
            handles.push(thread::spawn(move || {
                let mut count = 0;
                while stack.try_pop::<false>().is_some() {
                    count += 1;
                }
                count
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 32);
    }
}
