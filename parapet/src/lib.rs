//! Parapet is a service boundary layer: admission limiting for inbound
//! work, a two-tier response cache, and a resilience pipeline for outbound
//! downstream calls.
//!
//! A [`Parapet`] instance owns all three registries. Nothing is process
//! global; two instances with different configurations coexist in one
//! process, which is also how the integration tests exercise it.

#![deny(missing_docs)]

pub use admission::{
    AdmissionDecision, AdmissionError, AdmissionLimiter, AdmissionPermit, AdmitRequest,
    AdmitRequestBuilder,
};
pub use config::Config;
pub use resilience::{AttemptError, PipelineError, ResiliencePipeline, TargetValidationError};
pub use tiered_cache::{CacheError, EntryOptions, TieredCache};

/// The composed boundary layer: admission limiter, tiered cache and
/// outbound resilience pipeline, built from one validated [`Config`].
pub struct Parapet {
    admission: AdmissionLimiter,
    cache: TieredCache,
    resilience: ResiliencePipeline,
}

impl Parapet {
    /// Build an instance from configuration.
    ///
    /// Validates the configuration eagerly and, when a shared cache tier is
    /// configured, connects to it before returning. An unreachable shared
    /// tier fails construction; once running, shared tier outages degrade
    /// to local-only operation instead.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let admission = AdmissionLimiter::new(config.admission);

        let cache = if config.cache.shared.is_some() {
            TieredCache::connect(config.cache).await?
        } else {
            TieredCache::in_process(config.cache)
        };

        let resilience = ResiliencePipeline::new(config.resilience)?;

        log::debug!("Parapet instance ready");

        Ok(Self {
            admission,
            cache,
            resilience,
        })
    }

    /// The inbound admission limiter.
    pub fn admission(&self) -> &AdmissionLimiter {
        &self.admission
    }

    /// The tiered response cache.
    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    /// The outbound resilience pipeline.
    pub fn resilience(&self) -> &ResiliencePipeline {
        &self.resilience
    }
}
