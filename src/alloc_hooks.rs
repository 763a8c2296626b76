//! Allocator hooks (spec §9 design note): a minimal process-wide
//! `add_new_hook`/`add_delete_hook`/`get_allocation_size` surface, present
//! only to satisfy that design note. This is not a real allocator
//! integration (that's an explicit non-goal, §A.3) — there is no actual
//! global-allocator shim wired in, just the registration/notification
//! plumbing a real one would call into.

use std::cell::Cell;
use std::sync::{Mutex, OnceLock};

type NewHook = Box<dyn Fn(usize) + Send + Sync>;
type DeleteHook = Box<dyn Fn(usize) + Send + Sync>;

struct HookRegistry {
    new_hooks: Mutex<Vec<NewHook>>,
    delete_hooks: Mutex<Vec<DeleteHook>>,
}

fn registry() -> &'static HookRegistry {
    static REGISTRY: OnceLock<HookRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| HookRegistry {
        new_hooks: Mutex::new(Vec::new()),
        delete_hooks: Mutex::new(Vec::new()),
    })
}

thread_local! {
    // Guards against a hook's own bookkeeping allocating and re-entering
    // this module recursively.
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

pub fn add_new_hook(hook: NewHook) {
    registry().new_hooks.lock().unwrap().push(hook);
}

pub fn add_delete_hook(hook: DeleteHook) {
    registry().delete_hooks.lock().unwrap().push(hook);
}

/// Notify registered hooks of an allocation of `size` bytes. No-op if
/// called re-entrantly from within a hook.
pub fn notify_alloc(size: usize) {
    IN_HOOK.with(|in_hook| {
        if in_hook.replace(true) {
            return;
        }
        for hook in registry().new_hooks.lock().unwrap().iter() {
            hook(size);
        }
        in_hook.set(false);
    });
}

pub fn notify_dealloc(size: usize) {
    IN_HOOK.with(|in_hook| {
        if in_hook.replace(true) {
            return;
        }
        for hook in registry().delete_hooks.lock().unwrap().iter() {
            hook(size);
        }
        in_hook.set(false);
    });
}

/// No real allocator is wired in, so there's nothing to report per
/// allocation; always `None`.
pub fn get_allocation_size() -> Option<usize> {
    None
}

/// Backing action for the `release_free_memory` IOCTL key.
pub fn release_free_memory() {
    tracing::debug!("release_free_memory requested (no allocator integration wired in)");
}
