use std::future::Future;

use futures::future::BoxFuture;

/// A function producing a fresh value for a cache key.
///
/// The cache treats fetchers as black boxes that may be invoked more than once for the same key,
/// be it as a retry after a failure or as a refresh of a stale value. Timeouts are the
/// responsibility of the fetcher.
///
/// This is implemented for all `Fn() -> impl Future<Output = anyhow::Result<V>>` closures, so
/// most callers never implement it by hand:
///
/// ```
/// use fetchcache::Fetcher;
///
/// fn assert_fetcher<F: Fetcher<u32>>(_: F) {}
///
/// assert_fetcher(|| async { Ok(42) });
/// ```
pub trait Fetcher<V>: Send + Sync + 'static {
    fn fetch(&self) -> BoxFuture<'static, anyhow::Result<V>>;
}

impl<V, F, Fut> Fetcher<V> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    fn fetch(&self) -> BoxFuture<'static, anyhow::Result<V>> {
        Box::pin(self())
    }
}
