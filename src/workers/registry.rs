//! Worker registry: static catalogue plus runtime ad-hoc registration.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::RwLock;

use crate::config::OperatingMode;
use crate::error::RegistryError;
use crate::workers::worker::{Worker, WorkerConfig, WorkerDefinition, WorkerFactory, WorkerTier};

/// Longest purpose slug kept in an ad-hoc id.
const MAX_PURPOSE_SLUG: usize = 24;

/// A registered worker entry.
struct Entry {
    definition: WorkerDefinition,
    ad_hoc: bool,
}

/// Registry of available workers.
pub struct WorkerRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    /// Base implementations for ad-hoc workers, per tier.
    ad_hoc_bases: RwLock<HashMap<WorkerTier, WorkerFactory>>,
}

impl WorkerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ad_hoc_bases: RwLock::new(HashMap::new()),
        }
    }

    /// Register a worker. An existing id is kept and the call is a no-op.
    pub async fn register(&self, definition: WorkerDefinition) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&definition.id) {
            tracing::warn!(worker = %definition.id, "Ignored duplicate worker registration");
            return false;
        }
        tracing::debug!(worker = %definition.id, tier = %definition.tier, "Registered worker");
        entries.insert(
            definition.id.clone(),
            Entry {
                definition,
                ad_hoc: false,
            },
        );
        true
    }

    /// Register the catalogue entries admitted by `mode`. Returns how many were added.
    pub async fn register_catalogue(
        &self,
        catalogue: impl IntoIterator<Item = WorkerDefinition>,
        mode: OperatingMode,
    ) -> usize {
        let mut added = 0;
        for definition in catalogue {
            if !definition.tier.admitted_in(mode) {
                tracing::debug!(
                    worker = %definition.id,
                    tier = %definition.tier,
                    %mode,
                    "Skipped worker not admitted in this mode"
                );
                continue;
            }
            if self.register(definition).await {
                added += 1;
            }
        }
        tracing::info!(%mode, added, "Worker catalogue loaded");
        added
    }

    /// Set the implementation ad-hoc workers of `tier` are built from.
    pub async fn set_ad_hoc_base(&self, tier: WorkerTier, factory: WorkerFactory) {
        self.ad_hoc_bases.write().await.insert(tier, factory);
    }

    /// Build a worker instance for `id`.
    pub async fn resolve(
        &self,
        id: &str,
        config: &WorkerConfig,
    ) -> Result<Arc<dyn Worker>, RegistryError> {
        let factory = self
            .entries
            .read()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.definition.factory))
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        Ok(factory(id, config))
    }

    /// Mint and register a new worker for `purpose`, built from the `tier` base.
    ///
    /// Falls back to the other tier's base when `tier` has none. Returns the
    /// new id, immediately resolvable.
    pub async fn register_ad_hoc(
        &self,
        purpose: &str,
        tier: WorkerTier,
    ) -> Result<String, RegistryError> {
        let (tier, factory) = {
            let bases = self.ad_hoc_bases.read().await;
            let fallback = match tier {
                WorkerTier::Lightweight => WorkerTier::Full,
                WorkerTier::Full => WorkerTier::Lightweight,
            };
            bases
                .get(&tier)
                .map(|f| (tier, Arc::clone(f)))
                .or_else(|| bases.get(&fallback).map(|f| (fallback, Arc::clone(f))))
                .ok_or(RegistryError::NoAdHocBase { tier })?
        };

        let slug = purpose_slug(purpose);
        let mut entries = self.entries.write().await;
        let id = loop {
            let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
            let candidate = format!("{slug}_{suffix:06x}");
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };

        entries.insert(
            id.clone(),
            Entry {
                definition: WorkerDefinition {
                    id: id.clone(),
                    description: format!("Ad-hoc worker for {purpose}"),
                    tier,
                    factory,
                },
                ad_hoc: true,
            },
        );
        tracing::info!(worker = %id, %tier, purpose, "Registered ad-hoc worker");
        Ok(id)
    }

    /// Check if a worker exists.
    pub async fn has(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Whether `id` was minted at runtime.
    pub async fn is_ad_hoc(&self, id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(id)
            .is_some_and(|entry| entry.ad_hoc)
    }

    /// All registered worker ids.
    pub async fn list_available(&self) -> BTreeSet<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Get the number of registered workers.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase alphanumeric slug of a purpose string.
fn purpose_slug(purpose: &str) -> String {
    let mut slug = String::new();
    let mut last_underscore = true;
    for c in purpose.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            slug.push('_');
            last_underscore = true;
        }
        if slug.len() >= MAX_PURPOSE_SLUG {
            break;
        }
    }
    let slug = slug.trim_end_matches('_');
    if slug.is_empty() {
        "adhoc".to_string()
    } else {
        format!("adhoc_{slug}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentMessage, AgentResponse};
    use async_trait::async_trait;

    struct MockWorker {
        name: String,
    }

    #[async_trait]
    impl Worker for MockWorker {
        fn name(&self) -> &str {
            &self.name
        }
        async fn execute(&self, message: &AgentMessage) -> AgentResponse {
            AgentResponse::ok(message, "mock")
        }
    }

    fn mock(id: &str, tier: WorkerTier) -> WorkerDefinition {
        WorkerDefinition::new(id, "A mock worker for testing", tier, |name, _config| {
            Arc::new(MockWorker {
                name: name.to_string(),
            }) as Arc<dyn Worker>
        })
    }

    fn mock_factory() -> WorkerFactory {
        Arc::new(|name: &str, _config: &WorkerConfig| {
            Arc::new(MockWorker {
                name: name.to_string(),
            }) as Arc<dyn Worker>
        })
    }

    #[tokio::test]
    async fn register_and_resolve() {
        let registry = WorkerRegistry::new();
        assert!(registry.register(mock("engineer", WorkerTier::Full)).await);
        assert!(registry.has("engineer").await);

        let worker = registry
            .resolve("engineer", &WorkerConfig::default())
            .await
            .unwrap();
        assert_eq!(worker.name(), "engineer");
    }

    #[tokio::test]
    async fn resolve_unknown_is_not_found() {
        let registry = WorkerRegistry::new();
        let err = registry
            .resolve("ghost", &WorkerConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::NotFound { ref id } if id == "ghost"));
    }

    #[tokio::test]
    async fn duplicate_registration_is_noop() {
        let registry = WorkerRegistry::new();
        assert!(registry.register(mock("sensor", WorkerTier::Lightweight)).await);
        assert!(!registry.register(mock("sensor", WorkerTier::Full)).await);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn catalogue_filtered_by_mode() {
        let catalogue = vec![
            mock("researcher", WorkerTier::Full),
            mock("sensor", WorkerTier::Lightweight),
        ];

        let lean = WorkerRegistry::new();
        assert_eq!(lean.register_catalogue(catalogue.clone(), OperatingMode::Lean).await, 1);
        assert_eq!(
            lean.list_available().await.into_iter().collect::<Vec<_>>(),
            vec!["sensor".to_string()]
        );

        let full = WorkerRegistry::new();
        assert_eq!(full.register_catalogue(catalogue, OperatingMode::Full).await, 2);
    }

    #[tokio::test]
    async fn ad_hoc_registration_is_resolvable() {
        let registry = WorkerRegistry::new();
        registry
            .set_ad_hoc_base(WorkerTier::Lightweight, mock_factory())
            .await;

        let id = registry
            .register_ad_hoc("Weekly Report", WorkerTier::Lightweight)
            .await
            .unwrap();
        assert!(id.starts_with("adhoc_weekly_report_"));
        assert!(registry.is_ad_hoc(&id).await);

        let worker = registry.resolve(&id, &WorkerConfig::default()).await.unwrap();
        assert_eq!(worker.name(), id);
    }

    #[tokio::test]
    async fn ad_hoc_falls_back_to_other_tier() {
        let registry = WorkerRegistry::new();
        registry
            .set_ad_hoc_base(WorkerTier::Lightweight, mock_factory())
            .await;
        let id = registry.register_ad_hoc("scan", WorkerTier::Full).await.unwrap();
        assert!(registry.has(&id).await);
    }

    #[tokio::test]
    async fn ad_hoc_without_base_fails() {
        let registry = WorkerRegistry::new();
        let err = registry
            .register_ad_hoc("scan", WorkerTier::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoAdHocBase { .. }));
    }

    #[tokio::test]
    async fn ad_hoc_ids_are_unique() {
        let registry = Arc::new(WorkerRegistry::new());
        registry.set_ad_hoc_base(WorkerTier::Full, mock_factory()).await;

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry.register_ad_hoc("same purpose", WorkerTier::Full).await.unwrap()
                })
            })
            .collect();

        let mut ids = BTreeSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 32);
        assert_eq!(registry.count().await, 32);
    }

    #[test]
    fn slug_shapes() {
        assert_eq!(purpose_slug("Compile weekly report!"), "adhoc_compile_weekly_report");
        assert_eq!(purpose_slug("  ***  "), "adhoc");
        assert!(purpose_slug(&"x".repeat(100)).len() <= "adhoc_".len() + MAX_PURPOSE_SLUG);
    }
}
