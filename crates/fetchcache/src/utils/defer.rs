/// Guard that runs a closure when dropped.
///
/// The closure also runs when the owning future is dropped or unwinds from a panic, which is what
/// makes it suitable for releasing bookkeeping slots of spawned tasks.
#[must_use = "the closure runs as soon as the guard is dropped"]
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers a closure, returning a `DeferGuard` that will
/// run it when dropped.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}
