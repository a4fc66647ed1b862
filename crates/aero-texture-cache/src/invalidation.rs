//! Hand-off of write-watch notifications to the render thread.
//!
//! Watch callbacks run on whatever thread wrote guest memory. They only append a texture handle
//! to the *active* buffer of the matching kind under a short lock. The render thread swaps that
//! buffer with an empty one under the same lock and walks the swapped-out handles without
//! holding it, so a notifier never waits on cache traversal.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::guest::WatchCallback;
use crate::texture::TextureHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationKind {
    Texture,
    Resolve,
}

impl InvalidationKind {
    fn index(self) -> usize {
        match self {
            InvalidationKind::Texture => 0,
            InvalidationKind::Resolve => 1,
        }
    }
}

type ActiveBuffer = Arc<Mutex<Vec<TextureHandle>>>;

#[derive(Default)]
pub struct InvalidationTracker {
    active: [ActiveBuffer; 2],
    spare: [Vec<TextureHandle>; 2],
}

impl InvalidationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the watch callback for one texture.
    ///
    /// The first write sets `flag` and queues `handle`; later writes only observe the flag, so a
    /// texture is queued at most once per watch.
    pub fn notifier(
        &self,
        kind: InvalidationKind,
        handle: TextureHandle,
        flag: Arc<AtomicBool>,
    ) -> WatchCallback {
        let active = Arc::clone(&self.active[kind.index()]);
        Box::new(move || {
            if flag.swap(true, Ordering::AcqRel) {
                return;
            }
            active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        })
    }

    /// Swap out the active buffer of `kind`. Hand the batch back through [`Self::recycle`] so the
    /// allocation is reused for the next swap.
    pub fn take(&mut self, kind: InvalidationKind) -> Vec<TextureHandle> {
        let mut batch = mem::take(&mut self.spare[kind.index()]);
        debug_assert!(batch.is_empty());
        {
            let mut active = self.active[kind.index()]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            mem::swap(&mut *active, &mut batch);
        }
        batch
    }

    pub fn recycle(&mut self, kind: InvalidationKind, mut batch: Vec<TextureHandle>) {
        batch.clear();
        self.spare[kind.index()] = batch;
    }

    /// Number of queued notifications not yet taken.
    pub fn queued(&self, kind: InvalidationKind) -> usize {
        self.active[kind.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clear(&mut self) {
        for active in &self.active {
            active.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
        for spare in &mut self.spare {
            spare.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ResourceRegistry;
    use crate::texture::TextureTag;
    use std::thread;

    #[test]
    fn repeated_writes_queue_a_texture_once() {
        let mut registry: ResourceRegistry<TextureTag, ()> = ResourceRegistry::new("texture");
        let handle = registry.insert(());
        let mut tracker = InvalidationTracker::new();
        let flag = Arc::new(AtomicBool::new(false));
        let notify = tracker.notifier(InvalidationKind::Texture, handle, Arc::clone(&flag));

        notify();
        notify();
        assert!(flag.load(Ordering::Acquire));
        assert_eq!(tracker.queued(InvalidationKind::Texture), 1);
        assert_eq!(tracker.queued(InvalidationKind::Resolve), 0);

        let batch = tracker.take(InvalidationKind::Texture);
        assert_eq!(batch, vec![handle]);
        assert_eq!(tracker.queued(InvalidationKind::Texture), 0);
        tracker.recycle(InvalidationKind::Texture, batch);
        assert!(tracker.take(InvalidationKind::Texture).is_empty());
    }

    #[test]
    fn notifications_from_other_threads_land_in_the_active_buffer() {
        let mut registry: ResourceRegistry<TextureTag, ()> = ResourceRegistry::new("texture");
        let mut tracker = InvalidationTracker::new();
        let callbacks: Vec<_> = (0..16)
            .map(|_| {
                let handle = registry.insert(());
                tracker.notifier(
                    InvalidationKind::Resolve,
                    handle,
                    Arc::new(AtomicBool::new(false)),
                )
            })
            .collect();

        thread::scope(|scope| {
            for callback in &callbacks {
                scope.spawn(move || callback());
            }
        });

        let mut batch = tracker.take(InvalidationKind::Resolve);
        batch.sort_by_key(|h| h.index());
        batch.dedup();
        assert_eq!(batch.len(), 16);
    }
}
