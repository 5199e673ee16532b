use std::fmt;
use std::sync::Arc;

use rate_limiter::{RateLimiter, WaitContext};
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::async_throttled_reader::AsyncThrottledReader;
use crate::config::BandwidthLimitConfig;
use crate::throttled_reader::{ThrottledReader, THROTTLED_READER_CONTEXT};
use crate::BoxReadClose;

pub type BoxAsyncRead = Box<dyn AsyncRead + Send + Unpin>;

/// The independent bandwidth budgets a stream can be charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitDomain {
    Network,
    Disk,
}

impl fmt::Display for LimitDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitDomain::Network => f.write_str("network"),
            LimitDomain::Disk => f.write_str("disk"),
        }
    }
}

/// The limiters for each [`LimitDomain`], built once at startup and handed to
/// every call site that opens a stream.
///
/// An empty slot means the domain is unlimited; wrapping a stream for it returns
/// the stream itself. Cloning shares the limiters, so all clones draw from the
/// same buckets.
#[derive(Clone)]
pub struct LimiterRegistry {
    network: Option<Arc<RateLimiter>>,
    disk: Option<Arc<RateLimiter>>,
    context: WaitContext,
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl LimiterRegistry {
    pub fn new(network: Option<Arc<RateLimiter>>, disk: Option<Arc<RateLimiter>>) -> Self {
        Self {
            network,
            disk,
            context: WaitContext::named(THROTTLED_READER_CONTEXT),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    pub fn from_config(config: &BandwidthLimitConfig) -> Self {
        let build = |domain: LimitDomain| {
            config.rate_limit(domain).map(|rate| {
                let burst = config.burst_for(rate);
                info!("Bandwidth limit: {domain} limited to {rate} bytes/sec (burst {burst} bytes)");
                Arc::new(RateLimiter::new(rate, burst))
            })
        };

        let registry = Self::new(build(LimitDomain::Network), build(LimitDomain::Disk));
        debug!("Limiter registry: {registry:?}");
        registry
    }

    /// Context every wrapped stream waits under.
    pub fn with_context(mut self, context: WaitContext) -> Self {
        self.context = context;
        self
    }

    pub fn context(&self) -> &WaitContext {
        &self.context
    }

    pub fn limiter(&self, domain: LimitDomain) -> Option<&Arc<RateLimiter>> {
        match domain {
            LimitDomain::Network => self.network.as_ref(),
            LimitDomain::Disk => self.disk.as_ref(),
        }
    }

    pub fn network_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter(LimitDomain::Network)
    }

    pub fn disk_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter(LimitDomain::Disk)
    }

    /// Charges reads from `stream` against `domain`'s limiter, or returns
    /// `stream` unchanged if that domain is unlimited.
    pub fn wrap(&self, domain: LimitDomain, stream: BoxReadClose) -> BoxReadClose {
        match self.limiter(domain) {
            None => stream,
            Some(limiter) => Box::new(ThrottledReader::with_context(stream, limiter.clone(), self.context.clone())),
        }
    }

    pub fn wrap_for_network(&self, stream: BoxReadClose) -> BoxReadClose {
        self.wrap(LimitDomain::Network, stream)
    }

    pub fn wrap_for_disk(&self, stream: BoxReadClose) -> BoxReadClose {
        self.wrap(LimitDomain::Disk, stream)
    }

    pub fn wrap_async(&self, domain: LimitDomain, reader: BoxAsyncRead) -> BoxAsyncRead {
        match self.limiter(domain) {
            None => reader,
            Some(limiter) => Box::new(AsyncThrottledReader::with_context(reader, limiter.clone(), self.context.clone())),
        }
    }

    pub fn wrap_async_for_network(&self, reader: BoxAsyncRead) -> BoxAsyncRead {
        self.wrap_async(LimitDomain::Network, reader)
    }

    pub fn wrap_async_for_disk(&self, reader: BoxAsyncRead) -> BoxAsyncRead {
        self.wrap_async(LimitDomain::Disk, reader)
    }
}

impl fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let describe = |l: &Option<Arc<RateLimiter>>| match l {
            Some(l) => format!("{} bytes/sec, burst {}", l.rate(), l.burst()),
            None => "unlimited".to_owned(),
        };

        f.debug_struct("LimiterRegistry")
            .field("network", &describe(&self.network))
            .field("disk", &describe(&self.disk))
            .field("context", &self.context.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    use more_asserts::*;
    use tokio::io::AsyncReadExt;
    use tracing_test::traced_test;

    use super::*;
    use crate::test_utils::{expected_bytes, ScriptedReader};
    use crate::ReadClose;

    fn data_ptr(stream: &BoxReadClose) -> *const u8 {
        &**stream as *const dyn ReadClose as *const u8
    }

    #[test]
    fn test_unlimited_passes_stream_through() {
        let registry = LimiterRegistry::unlimited();

        let stream: BoxReadClose = Box::new(Cursor::new(vec![1u8, 2, 3]));
        let before = data_ptr(&stream);
        let wrapped = registry.wrap_for_network(stream);
        assert_eq!(data_ptr(&wrapped), before);

        let stream: BoxReadClose = Box::new(Cursor::new(vec![1u8, 2, 3]));
        let before = data_ptr(&stream);
        let wrapped = registry.wrap_for_disk(stream);
        assert_eq!(data_ptr(&wrapped), before);
    }

    #[test]
    fn test_unconfigured_disk_domain_adds_no_latency() {
        let network = Arc::new(RateLimiter::new(1, 1));
        assert!(network.try_acquire(1));
        let registry = LimiterRegistry::new(Some(network), None);

        let stream: BoxReadClose = Box::new(Cursor::new(vec![7u8; 4096]));
        let before = data_ptr(&stream);
        let mut wrapped = registry.wrap_for_disk(stream);
        assert_eq!(data_ptr(&wrapped), before);

        let start = Instant::now();
        let mut out = Vec::new();
        wrapped.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 4096);
        assert_lt!(start.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn test_domains_select_their_own_limiter() {
        // Slow refill so consumption stays visible in the balance.
        let network = Arc::new(RateLimiter::new(1, 10_000));
        let disk = Arc::new(RateLimiter::new(1, 20_000));
        let registry = LimiterRegistry::new(Some(network.clone()), Some(disk.clone()));

        assert!(Arc::ptr_eq(registry.network_limiter().unwrap(), &network));
        assert!(Arc::ptr_eq(registry.disk_limiter().unwrap(), &disk));

        let mut wrapped = registry.wrap_for_disk(Box::new(ScriptedReader::chunks(1, 5000)));
        let mut out = Vec::new();
        wrapped.read_to_end(&mut out).unwrap();
        assert_eq!(out, expected_bytes(1, 5000));

        // Only the disk bucket paid for the read.
        assert_eq!(network.available_tokens(), 10_000.0);
        assert_lt!(disk.available_tokens(), 15_001.0);
    }

    #[test]
    fn test_wrapped_close_delegates() {
        let registry = LimiterRegistry::new(Some(Arc::new(RateLimiter::new(100, 100))), None);
        let inner = ScriptedReader::chunks(1, 10);
        let closes = inner.closes.clone();

        let mut wrapped = registry.wrap_for_network(Box::new(inner));
        wrapped.close().unwrap();
        assert_eq!(closes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_wrapped_file_on_disk() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, &expected_bytes(2, 1000)).unwrap();

        let registry = LimiterRegistry::new(None, Some(Arc::new(RateLimiter::new(10_000, 1000))));
        let file = std::fs::File::open(tmp.path()).unwrap();
        let mut wrapped = registry.wrap_for_disk(Box::new(file));

        let start = Instant::now();
        let mut buf = [0u8; 1000];
        let mut out = Vec::new();
        loop {
            let n = wrapped.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        wrapped.close().unwrap();

        assert_eq!(out, expected_bytes(2, 1000));
        assert_ge!(start.elapsed(), Duration::from_millis(90));
    }

    #[test]
    fn test_registry_clones_share_limiters() {
        let registry = LimiterRegistry::new(Some(Arc::new(RateLimiter::new(100, 100))), None);
        let clone = registry.clone();
        assert!(Arc::ptr_eq(registry.network_limiter().unwrap(), clone.network_limiter().unwrap()));
    }

    #[test]
    fn test_context_is_passed_to_wrapped_streams() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let registry = LimiterRegistry::new(Some(Arc::new(RateLimiter::new(100, 100))), None)
            .with_context(WaitContext::named("restore").with_cancellation(token));
        assert_eq!(registry.context().name(), "restore");

        let mut wrapped = registry.wrap_for_network(Box::new(ScriptedReader::chunks(1, 10)));
        let mut buf = [0u8; 16];
        assert_eq!(wrapped.read(&mut buf).unwrap(), 10);
        let err = wrapped.read(&mut buf).unwrap_err();
        assert!(err.to_string().contains("restore"));
    }

    #[traced_test]
    #[test]
    fn test_from_config() {
        let config = BandwidthLimitConfig {
            network_rate_limit: Some(1000),
            disk_rate_limit: None,
            burst_headroom: 24,
        };
        let registry = LimiterRegistry::from_config(&config);

        let network = registry.network_limiter().unwrap();
        assert_eq!(network.rate(), 1000.0);
        assert_eq!(network.burst(), 1024);
        assert!(registry.disk_limiter().is_none());
        assert!(logs_contain("network limited to 1000 bytes/sec"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_wrap() {
        let registry = LimiterRegistry::new(Some(Arc::new(RateLimiter::new(1000, 1000))), None);

        let reader: BoxAsyncRead = Box::new(ScriptedReader::chunks(3, 1000));
        let mut wrapped = registry.wrap_async_for_network(reader);

        let start = tokio::time::Instant::now();
        let mut buf = [0u8; 1000];
        let mut total = 0;
        loop {
            let n = wrapped.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 3000);
        assert_ge!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_async_unlimited_passes_through() {
        let registry = LimiterRegistry::unlimited();
        let reader: BoxAsyncRead = Box::new(ScriptedReader::chunks(1, 10));
        let before = &*reader as *const (dyn AsyncRead + Send + Unpin) as *const u8;

        let wrapped = registry.wrap_async_for_disk(reader);
        assert_eq!(&*wrapped as *const (dyn AsyncRead + Send + Unpin) as *const u8, before);
    }
}
