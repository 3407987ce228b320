//! Snapshot registry of platform profiles.
//!
//! The registry hands out `Arc<PlatformProfile>` snapshots. A reload builds a
//! new [`RegistrySnapshot`] and swaps it in; profiles already handed to
//! in-flight runs are never mutated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ProfileError, Result};
use crate::parse::{discover_profiles, load_profile_toml, validate_profile, ValidationIssue};
use crate::profile::PlatformProfile;

/// An immutable set of profiles, keyed by id.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    profiles: BTreeMap<String, Arc<PlatformProfile>>,
    generation: u64,
}

impl RegistrySnapshot {
    fn from_profiles(profiles: impl IntoIterator<Item = PlatformProfile>, generation: u64) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.id.clone(), Arc::new(p)))
                .collect(),
            generation,
        }
    }

    /// Look up a profile by id.
    pub fn get(&self, id: &str) -> Option<Arc<PlatformProfile>> {
        self.profiles.get(id).cloned()
    }

    /// Profile ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Arc<PlatformProfile>> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Incremented on every successful reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Where the registry's profiles come from.
#[derive(Debug, Clone)]
enum Source {
    /// Built-in profiles only.
    Builtin,
    /// Built-ins overlaid with every `*.profile.toml` in a directory.
    Dir(PathBuf),
    /// A fixed list (tests and embedders).
    Fixed(Vec<PlatformProfile>),
}

/// Thread-safe profile store with atomic snapshot reloads.
#[derive(Debug)]
pub struct Registry {
    source: Source,
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl Registry {
    /// Registry containing only the built-in profiles.
    pub fn builtin() -> Self {
        Self::with_source(Source::Builtin, PlatformProfile::builtins())
    }

    /// Registry containing exactly the given profiles. `reload` keeps them as-is.
    pub fn with_profiles(profiles: Vec<PlatformProfile>) -> Self {
        Self::with_source(Source::Fixed(profiles.clone()), profiles)
    }

    /// Registry backed by a directory of `.profile.toml` files layered over the built-ins.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let profiles = load_dir(dir)?;
        Ok(Self::with_source(Source::Dir(dir.to_path_buf()), profiles))
    }

    fn with_source(source: Source, profiles: Vec<PlatformProfile>) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(RegistrySnapshot::from_profiles(profiles, 0))),
        }
    }

    /// The current snapshot. Holding it pins every profile it contains.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Resolve a platform id to its profile.
    pub fn resolve(&self, id: &str) -> Result<Arc<PlatformProfile>> {
        self.snapshot()
            .get(id)
            .ok_or_else(|| ProfileError::UnknownPlatform { id: id.to_string() })
    }

    /// Resolve and validate in one step.
    pub fn resolve_valid(&self, id: &str) -> Result<Arc<PlatformProfile>> {
        let profile = self.resolve(id)?;
        validate(&profile)?;
        Ok(profile)
    }

    pub fn ids(&self) -> Vec<String> {
        self.snapshot().ids()
    }

    /// Re-read the backing configuration and swap in a new snapshot.
    ///
    /// On failure the previous snapshot stays current.
    pub fn reload(&self) -> Result<Arc<RegistrySnapshot>> {
        let profiles = match &self.source {
            Source::Builtin => PlatformProfile::builtins(),
            Source::Dir(dir) => load_dir(dir)?,
            Source::Fixed(profiles) => profiles.clone(),
        };

        let mut current = self.current.write();
        let next = Arc::new(RegistrySnapshot::from_profiles(
            profiles,
            current.generation + 1,
        ));
        *current = Arc::clone(&next);
        tracing::info!(
            profiles = next.len(),
            generation = next.generation,
            "platform registry reloaded"
        );
        Ok(next)
    }
}

/// Validate, mapping issues into a [`ProfileError::Invalid`].
pub fn validate(profile: &PlatformProfile) -> Result<()> {
    validate_profile(profile).map_err(|issues: Vec<ValidationIssue>| ProfileError::Invalid {
        id: profile.id.clone(),
        issues,
    })
}

fn load_dir(dir: &Path) -> Result<Vec<PlatformProfile>> {
    if !dir.is_dir() {
        return Err(ProfileError::NotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut by_id: BTreeMap<String, PlatformProfile> = PlatformProfile::builtins()
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

    for (id, path) in discover_profiles(dir)? {
        let profile = load_profile_toml(&path)?;
        if profile.id != id {
            return Err(ProfileError::IdMismatch {
                id: profile.id,
                path,
            });
        }
        tracing::debug!(platform = %id, path = %path.display(), "loaded profile");
        by_id.insert(id, profile);
    }
    Ok(by_id.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::profile_to_toml;

    fn write_profile(dir: &Path, profile: &PlatformProfile) {
        let path = dir.join(format!("{}.profile.toml", profile.id));
        std::fs::write(path, profile_to_toml(profile).unwrap()).unwrap();
    }

    #[test]
    fn builtin_resolves_known_ids() {
        let reg = Registry::builtin();
        assert_eq!(reg.resolve("stm32-qemu").unwrap().arch, "arm");
        assert!(reg.ids().contains(&"esp32-idf".to_string()));
    }

    #[test]
    fn unknown_platform() {
        let reg = Registry::builtin();
        let err = reg.resolve("pdp-11").unwrap_err();
        assert!(matches!(err, ProfileError::UnknownPlatform { ref id } if id == "pdp-11"));
    }

    #[test]
    fn directory_overrides_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = PlatformProfile::stm32_qemu();
        p.timeout_secs = 5;
        write_profile(dir.path(), &p);

        let mut custom = PlatformProfile::avr_qemu();
        custom.id = "my-board".into();
        write_profile(dir.path(), &custom);

        let reg = Registry::from_dir(dir.path()).unwrap();
        assert_eq!(reg.resolve("stm32-qemu").unwrap().timeout_secs, 5);
        assert_eq!(reg.resolve("my-board").unwrap().arch, "avr");
        assert!(reg.resolve("avr-qemu").is_ok());
    }

    #[test]
    fn mismatched_file_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = PlatformProfile::stm32_qemu();
        std::fs::write(
            dir.path().join("other.profile.toml"),
            profile_to_toml(&p).unwrap(),
        )
        .unwrap();
        let err = Registry::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ProfileError::IdMismatch { .. }));
    }

    #[test]
    fn reload_never_mutates_captured_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = PlatformProfile::stm32_qemu();
        p.timeout_secs = 5;
        write_profile(dir.path(), &p);

        let reg = Registry::from_dir(dir.path()).unwrap();
        let captured = reg.resolve("stm32-qemu").unwrap();

        p.timeout_secs = 99;
        write_profile(dir.path(), &p);
        let snap = reg.reload().unwrap();

        assert_eq!(captured.timeout_secs, 5);
        assert_eq!(reg.resolve("stm32-qemu").unwrap().timeout_secs, 99);
        assert_eq!(snap.generation(), 1);
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(dir.path(), &PlatformProfile::stm32_qemu());
        let reg = Registry::from_dir(dir.path()).unwrap();

        std::fs::write(dir.path().join("broken.profile.toml"), "not [[[ toml").unwrap();
        assert!(reg.reload().is_err());
        assert_eq!(reg.snapshot().generation(), 0);
        assert!(reg.resolve("stm32-qemu").is_ok());
    }

    #[test]
    fn missing_dir_is_not_found() {
        let err = Registry::from_dir(Path::new("/nonexistent/platforms")).unwrap_err();
        assert!(matches!(err, ProfileError::NotFound { .. }));
    }

    #[test]
    fn concurrent_readers_during_reload() {
        let reg = Arc::new(Registry::builtin());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(reg.resolve("avr-qemu").is_ok());
                    }
                })
            })
            .collect();
        for _ in 0..10 {
            reg.reload().unwrap();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.snapshot().generation(), 10);
    }
}
