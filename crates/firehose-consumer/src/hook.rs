//! The consumer's connect-callback slot.
//!
//! The slot holds the caller's callback plus one reset hook per running retry
//! loop. Reset hooks are keyed by id and removed exactly when the loop's
//! [`WrapGuard`] drops, so loops that overlap and finish in any order never
//! leave anything behind and never touch the caller's callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

pub type OnConnect = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub(crate) struct ConnectHook {
    slot: RwLock<Option<OnConnect>>,
    resets: Mutex<Vec<(u64, OnConnect)>>,
    next_id: AtomicU64,
}

impl ConnectHook {
    pub(crate) fn get(&self) -> Option<OnConnect> {
        self.slot.read().clone()
    }

    pub(crate) fn set(&self, callback: Option<OnConnect>) {
        *self.slot.write() = callback;
    }

    /// Runs every reset hook, then the caller's callback. No lock is held
    /// while they run.
    pub(crate) fn fire(&self) {
        let resets: Vec<OnConnect> = self
            .resets
            .lock()
            .iter()
            .map(|(_, reset)| reset.clone())
            .collect();
        for reset in resets {
            reset();
        }
        if let Some(callback) = self.get() {
            callback();
        }
    }

    /// Runs `before` ahead of the caller's callback until the guard drops.
    pub(crate) fn wrap<F>(&self, before: F) -> WrapGuard<'_>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.resets.lock().push((id, Arc::new(before)));
        WrapGuard { hook: self, id }
    }

    #[cfg(test)]
    fn wrapped(&self) -> usize {
        self.resets.lock().len()
    }
}

pub(crate) struct WrapGuard<'a> {
    hook: &'a ConnectHook,
    id: u64,
}

impl Drop for WrapGuard<'_> {
    fn drop(&mut self) {
        self.hook.resets.lock().retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, OnConnect) {
        let hits = Arc::new(AtomicUsize::new(0));
        let callback: OnConnect = {
            let hits = hits.clone();
            Arc::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        (hits, callback)
    }

    #[test]
    fn wrap_runs_both_and_restores_original() {
        let hook = ConnectHook::default();
        let (user_hits, user) = counter();
        hook.set(Some(user.clone()));

        let wrap_hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = wrap_hits.clone();
            let _guard = hook.wrap(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
            hook.fire();
            assert_eq!(wrap_hits.load(Ordering::SeqCst), 1);
            assert_eq!(user_hits.load(Ordering::SeqCst), 1);
        }

        let restored = hook.get().expect("callback restored");
        assert!(Arc::ptr_eq(&restored, &user));
        hook.fire();
        assert_eq!(wrap_hits.load(Ordering::SeqCst), 1);
        assert_eq!(user_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn overlapping_wraps_dropped_out_of_order_leave_nothing_behind() {
        let hook = ConnectHook::default();
        let (user_hits, user) = counter();
        hook.set(Some(user.clone()));

        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));
        let first = {
            let hits = first_hits.clone();
            hook.wrap(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let second = {
            let hits = second_hits.clone();
            hook.wrap(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        hook.fire();
        drop(first);
        hook.fire();
        drop(second);
        hook.fire();

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 2);
        assert_eq!(user_hits.load(Ordering::SeqCst), 3);
        assert_eq!(hook.wrapped(), 0);
        assert!(Arc::ptr_eq(&hook.get().expect("user callback"), &user));
    }

    #[test]
    fn guard_leaves_replaced_callback_alone() {
        let hook = ConnectHook::default();
        let guard = hook.wrap(|| {});
        let (_, replacement) = counter();
        hook.set(Some(replacement.clone()));
        drop(guard);
        let current = hook.get().expect("replacement kept");
        assert!(Arc::ptr_eq(&current, &replacement));
    }

    #[test]
    fn wrap_without_callback_restores_none() {
        let hook = ConnectHook::default();
        let (hits, _) = counter();
        {
            let hits = hits.clone();
            let _guard = hook.wrap(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
            hook.fire();
        }
        hook.fire();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(hook.get().is_none());
        assert_eq!(hook.wrapped(), 0);
    }
}
