use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{GeoContext, Poi, PoiSearch, ReverseGeoResult, ReverseLookup};
use crate::cache::TtlCache;
use crate::clock::SharedClock;
use crate::error::Result;
use crate::config::{GeoConfig, GeoStrategy};
use crate::metrics::{self, Timer};

/// Coordinates rounded to 1e-5 degrees (about 1.1 m) plus the requested radius
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeoCacheKey {
    lat_e5: i64,
    lon_e5: i64,
    radius_m: u32,
}

impl GeoCacheKey {
    pub fn new(lat: f64, lon: f64, radius_m: u32) -> Self {
        Self {
            lat_e5: (lat * 1e5).round() as i64,
            lon_e5: (lon * 1e5).round() as i64,
            radius_m,
        }
    }
}

/// Progress notifications emitted while a context is being built
#[derive(Debug, Clone, PartialEq)]
pub enum GeoEvent {
    CacheHit { radius_m: u32, pois: usize },
    Reverse(ReverseGeoResult),
    ReverseFailed { error: String },
    Pois { radius_m: u32, count: usize },
    PoiFailed { radius_m: u32, error: String },
    BudgetExceeded { elapsed_ms: u64 },
}

pub trait GeoObserver: Send + Sync {
    fn on_event(&self, event: &GeoEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl GeoObserver for NoopObserver {
    fn on_event(&self, _event: &GeoEvent) {}
}

pub struct GeoContextBuilder {
    config: GeoConfig,
    reverse: Arc<dyn ReverseLookup>,
    pois: Arc<dyn PoiSearch>,
    cache: TtlCache<GeoCacheKey, GeoContext>,
}

impl GeoContextBuilder {
    pub fn new(
        config: GeoConfig,
        reverse: Arc<dyn ReverseLookup>,
        pois: Arc<dyn PoiSearch>,
        clock: SharedClock,
    ) -> Self {
        let cache = TtlCache::new("geo", config.cache_ttl(), clock);
        Self {
            config,
            reverse,
            pois,
            cache,
        }
    }

    pub fn config(&self) -> &GeoConfig {
        &self.config
    }

    pub fn cache(&self) -> &TtlCache<GeoCacheKey, GeoContext> {
        &self.cache
    }

    pub async fn build(&self, lat: f64, lon: f64) -> GeoContext {
        self.build_with_observer(lat, lon, &NoopObserver).await
    }

    /// Build (or fetch from cache) the context for a point.
    ///
    /// Never fails: upstream errors degrade to empty fields. Degraded results
    /// (reverse or POI failure, budget overrun) are returned but not cached.
    pub async fn build_with_observer(
        &self,
        lat: f64,
        lon: f64,
        observer: &dyn GeoObserver,
    ) -> GeoContext {
        let key = GeoCacheKey::new(lat, lon, self.config.radius_m);
        if let Some(cached) = self.cache.get(&key) {
            metrics::GEO_CACHE_HITS.inc();
            debug!(lat, lon, "Geo context cache hit");
            observer.on_event(&GeoEvent::CacheHit {
                radius_m: cached.radius_m,
                pois: cached.pois.len(),
            });
            return cached;
        }
        metrics::GEO_CACHE_MISSES.inc();

        let timer = Timer::new();
        let (context, complete) = match self.config.strategy {
            GeoStrategy::Widening => self.build_widening(lat, lon, observer).await,
            GeoStrategy::Budgeted => self.build_budgeted(lat, lon, observer).await,
        };
        timer.observe_duration_seconds(&metrics::GEO_LATENCY);

        info!(
            lat,
            lon,
            radius_m = context.radius_m,
            pois = context.pois.len(),
            reverse = context.reverse.display_name.is_some(),
            complete,
            elapsed_ms = timer.elapsed_ms(),
            "Geo context built"
        );

        if complete {
            self.cache.set(key, context.clone());
        }
        context
    }

    /// Reverse geocode first, then POIs at r, 2r, 4r... until enough are found.
    async fn build_widening(
        &self,
        lat: f64,
        lon: f64,
        observer: &dyn GeoObserver,
    ) -> (GeoContext, bool) {
        let (reverse, mut complete) = reverse_outcome(self.reverse.try_resolve(lat, lon).await, observer);

        let base = self.config.radius_m;
        let mut pois: Vec<Poi> = Vec::new();
        let mut radius_m = base;

        for step in 0..=self.config.max_escalations {
            let radius = base.saturating_mul(2u32.saturating_pow(step));
            if step > 0 {
                metrics::GEO_RADIUS_ESCALATIONS.inc();
                debug!(radius_m = radius, found = pois.len(), "Widening POI radius");
            }

            match self.pois.search(lat, lon, radius).await {
                Ok(found) => {
                    observer.on_event(&GeoEvent::Pois {
                        radius_m: radius,
                        count: found.len(),
                    });
                    pois = found;
                    radius_m = radius;
                    if pois.len() >= self.config.min_pois {
                        break;
                    }
                }
                Err(e) => {
                    // Keep whatever the previous radius produced
                    warn!(radius_m = radius, "POI search failed: {}", e.detail());
                    observer.on_event(&GeoEvent::PoiFailed {
                        radius_m: radius,
                        error: e.detail(),
                    });
                    complete = false;
                    break;
                }
            }
        }

        (
            GeoContext {
                reverse,
                pois,
                radius_m,
            },
            complete,
        )
    }

    /// Reverse geocode and a single-radius POI search raced against one deadline.
    async fn build_budgeted(
        &self,
        lat: f64,
        lon: f64,
        observer: &dyn GeoObserver,
    ) -> (GeoContext, bool) {
        let radius_m = self.config.radius_m;
        let budget = self.config.total_budget();
        let timer = Timer::new();

        let reverse_fut = self.reverse.try_resolve(lat, lon);
        let poi_fut = self.pois.search(lat, lon, radius_m);
        let deadline = tokio::time::sleep(budget);
        tokio::pin!(reverse_fut);
        tokio::pin!(poi_fut);
        tokio::pin!(deadline);

        let mut reverse: Option<ReverseGeoResult> = None;
        let mut pois: Option<Vec<Poi>> = None;
        let mut complete = true;

        while reverse.is_none() || pois.is_none() {
            tokio::select! {
                result = &mut reverse_fut, if reverse.is_none() => {
                    let (result, ok) = reverse_outcome(result, observer);
                    complete &= ok;
                    reverse = Some(result);
                }
                result = &mut poi_fut, if pois.is_none() => {
                    match result {
                        Ok(found) => {
                            observer.on_event(&GeoEvent::Pois { radius_m, count: found.len() });
                            pois = Some(found);
                        }
                        Err(e) => {
                            warn!(radius_m, "POI search failed: {}", e.detail());
                            observer.on_event(&GeoEvent::PoiFailed { radius_m, error: e.detail() });
                            pois = Some(Vec::new());
                            complete = false;
                        }
                    }
                }
                _ = &mut deadline => {
                    let elapsed_ms = timer.elapsed_ms();
                    metrics::GEO_BUDGET_OVERRUNS.inc();
                    warn!(
                        elapsed_ms,
                        reverse_done = reverse.is_some(),
                        pois_done = pois.is_some(),
                        "Geo budget exceeded, keeping partial results"
                    );
                    observer.on_event(&GeoEvent::BudgetExceeded { elapsed_ms });
                    complete = false;
                    break;
                }
            }
        }

        (
            GeoContext {
                reverse: reverse.unwrap_or_default(),
                pois: pois.unwrap_or_default(),
                radius_m,
            },
            complete,
        )
    }

    /// Drop expired cache entries.
    pub fn sweep(&self) -> usize {
        self.cache.sweep()
    }
}

/// Degrade a failed reverse lookup to nulls; the flag is false on failure.
fn reverse_outcome(result: Result<ReverseGeoResult>, observer: &dyn GeoObserver) -> (ReverseGeoResult, bool) {
    match result {
        Ok(reverse) => {
            observer.on_event(&GeoEvent::Reverse(reverse.clone()));
            (reverse, true)
        }
        Err(e) => {
            warn!("Reverse geocode degraded to empty result: {}", e.detail());
            observer.on_event(&GeoEvent::ReverseFailed { error: e.detail() });
            (ReverseGeoResult::default(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_rounding() {
        assert_eq!(
            GeoCacheKey::new(48.858_401, 2.294_501, 250),
            GeoCacheKey::new(48.858_404, 2.294_498, 250)
        );
        assert_ne!(
            GeoCacheKey::new(48.8584, 2.2945, 250),
            GeoCacheKey::new(48.8585, 2.2945, 250)
        );
        assert_ne!(
            GeoCacheKey::new(48.8584, 2.2945, 250),
            GeoCacheKey::new(48.8584, 2.2945, 500)
        );
    }
}
