//! Model registry and routing
//!
//! The registry holds every ready [`ModelInstance`] in insertion order; the
//! first element is the default model. Readers take a cheap snapshot (`Arc`
//! clone) so lookups never observe a half-applied mutation, and writers
//! replace the snapshot wholesale.
//!
//! Routing rules:
//! - size: exact `"{w}x{h}"` match, then fuzzy match with both dimensions
//!   rounded to the nearest ten, then the default;
//! - among several candidates the highest `version` wins, first seen on ties;
//! - auto-width models compare on height only.

use crate::descriptor::ImageSize;
use crate::model::ModelInstance;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
struct Snapshot {
    models: Vec<Arc<ModelInstance>>,
}

/// Summary of one registered model, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub version: f64,
    pub model_type: String,
    pub size: String,
    pub sites: Vec<String>,
    pub source: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub total: usize,
    pub default: Option<String>,
    pub models: Vec<ModelSummary>,
    pub invalid: IndexMap<PathBuf, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
    invalid: RwLock<IndexMap<PathBuf, DateTime<Utc>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn load(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut Vec<Arc<ModelInstance>>) -> R) -> R {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let mut models = guard.models.clone();
        let result = f(&mut models);
        *guard = Arc::new(Snapshot { models });
        result
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Append an instance. Returns `false` if this exact instance is present.
    pub fn add(&self, instance: Arc<ModelInstance>) -> bool {
        self.update(|models| {
            if models.iter().any(|m| Arc::ptr_eq(m, &instance)) {
                return false;
            }
            models.push(instance);
            true
        })
    }

    /// Insert an instance at the front, making it the default.
    pub fn set_default(&self, instance: Arc<ModelInstance>) {
        self.update(|models| {
            models.retain(|m| !Arc::ptr_eq(m, &instance));
            models.insert(0, instance);
        })
    }

    pub fn remove(&self, instance: &Arc<ModelInstance>) -> bool {
        self.update(|models| {
            let before = models.len();
            models.retain(|m| !Arc::ptr_eq(m, instance));
            models.len() != before
        })
    }

    /// Remove the first instance named `name`. Unknown names are a no-op.
    pub fn remove_by_name(&self, name: &str) -> Option<Arc<ModelInstance>> {
        self.update(|models| {
            let pos = models.iter().position(|m| m.name() == name)?;
            Some(models.remove(pos))
        })
    }

    /// Remove the instance loaded from descriptor file `path`.
    pub fn remove_by_source(&self, path: &Path) -> Option<Arc<ModelInstance>> {
        self.update(|models| {
            let pos = models.iter().position(|m| m.source() == path)?;
            Some(models.remove(pos))
        })
    }

    /// Drop every instance. Sessions close once in-flight handles are gone.
    pub fn clear(&self) -> usize {
        self.update(|models| {
            let n = models.len();
            models.clear();
            n
        })
    }

    // =========================================================================
    // Invalid descriptors
    // =========================================================================

    pub fn mark_invalid(&self, path: &Path) {
        self.invalid
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), Utc::now());
    }

    pub fn clear_invalid(&self, path: &Path) -> bool {
        self.invalid
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(path)
            .is_some()
    }

    pub fn invalid(&self) -> IndexMap<PathBuf, DateTime<Utc>> {
        self.invalid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn total(&self) -> usize {
        self.load().models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.load().models.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn models(&self) -> Vec<Arc<ModelInstance>> {
        self.load().models.clone()
    }

    pub fn default_model(&self) -> Option<Arc<ModelInstance>> {
        self.load().models.first().cloned()
    }

    fn or_default(
        &self,
        found: Option<Arc<ModelInstance>>,
        return_default: bool,
    ) -> Option<Arc<ModelInstance>> {
        match found {
            Some(m) => Some(m),
            None if return_default => self.default_model(),
            None => None,
        }
    }

    pub fn get_by_size(&self, size: &ImageSize, return_default: bool) -> Option<Arc<ModelInstance>> {
        let snapshot = self.load();
        let found = match_size(snapshot.models.iter(), size);
        self.or_default(found, return_default)
    }

    pub fn get_by_name(&self, name: &str, return_default: bool) -> Option<Arc<ModelInstance>> {
        let snapshot = self.load();
        let found = snapshot.models.iter().find(|m| m.name() == name).cloned();
        self.or_default(found, return_default)
    }

    /// Highest version of `model_type`, ignoring size.
    pub fn get_by_type(&self, model_type: &str) -> Option<Arc<ModelInstance>> {
        let snapshot = self.load();
        highest_version(snapshot.models.iter().filter(|m| m.model_type() == model_type))
    }

    pub fn get_by_type_and_size(
        &self,
        size: &ImageSize,
        model_type: &str,
        return_default: bool,
    ) -> Option<Arc<ModelInstance>> {
        let snapshot = self.load();
        let found = match_size(
            snapshot.models.iter().filter(|m| m.model_type() == model_type),
            size,
        )
        .or_else(|| self.get_by_type(model_type));
        self.or_default(found, return_default)
    }

    /// Models tagged with `site`. When `strict` is false the size must also
    /// match exactly. Falls back to [`get_by_size`](Self::get_by_size).
    pub fn get_by_site(
        &self,
        site: &str,
        size: &ImageSize,
        strict: bool,
        return_default: bool,
    ) -> Option<Arc<ModelInstance>> {
        let snapshot = self.load();
        let found = highest_version(snapshot.models.iter().filter(|m| {
            m.descriptor().has_site(site) && (strict || m.descriptor().input.matches_exact(size))
        }));
        match found {
            Some(m) => Some(m),
            None => self.get_by_size(size, return_default),
        }
    }

    /// Names of other ready models sharing `instance`'s size key.
    pub fn duplicates_of(&self, instance: &ModelInstance) -> Vec<String> {
        let key = instance.size_key();
        self.load()
            .models
            .iter()
            .filter(|m| !std::ptr::eq(m.as_ref(), instance) && m.size_key() == key)
            .map(|m| m.name().to_string())
            .collect()
    }

    pub fn status(&self) -> RegistryStatus {
        let snapshot = self.load();
        RegistryStatus {
            total: snapshot.models.len(),
            default: snapshot.models.first().map(|m| m.name().to_string()),
            models: snapshot
                .models
                .iter()
                .map(|m| ModelSummary {
                    name: m.name().to_string(),
                    version: m.version(),
                    model_type: m.model_type().to_string(),
                    size: m.size_key(),
                    sites: m.descriptor().sites.clone(),
                    source: m.source().to_path_buf(),
                    loaded_at: m.loaded_at(),
                })
                .collect(),
            invalid: self.invalid(),
        }
    }
}

fn highest_version<'a>(
    models: impl Iterator<Item = &'a Arc<ModelInstance>>,
) -> Option<Arc<ModelInstance>> {
    let mut best: Option<&Arc<ModelInstance>> = None;
    for m in models {
        if best.map_or(true, |b| m.version() > b.version()) {
            best = Some(m);
        }
    }
    best.cloned()
}

fn match_size<'a>(
    models: impl Iterator<Item = &'a Arc<ModelInstance>> + Clone,
    size: &ImageSize,
) -> Option<Arc<ModelInstance>> {
    highest_version(
        models
            .clone()
            .filter(|m| m.descriptor().input.matches_exact(size)),
    )
    .or_else(|| highest_version(models.filter(|m| m.descriptor().input.matches_fuzzy(size))))
}
