//! Named scroll timing profiles with JSON-file overrides.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const SCROLL_PROFILE_SCHEMA_VERSION: u32 = 1;

fn scroll_profile_schema_version() -> u32 {
    SCROLL_PROFILE_SCHEMA_VERSION
}

/// Immutable timing configuration selected by name at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollProfile {
    pub name: String,
    /// Wait after each scroll/change for the host to settle.
    pub settle_timeout_ms: u64,
    /// Delay between retrieval cycles.
    pub cycle_delay_ms: u64,
    /// Maximum retrieval cycles before giving up.
    pub guard_limit: usize,
    /// Consecutive no-growth rounds tolerated before stopping.
    pub max_stable_rounds: usize,
}

impl ScrollProfile {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("scroll profile name cannot be empty");
        }
        if self.guard_limit == 0 {
            bail!("scroll profile '{}' requires guard_limit >= 1", self.name);
        }
        if self.max_stable_rounds == 0 {
            bail!(
                "scroll profile '{}' requires max_stable_rounds >= 1",
                self.name
            );
        }
        Ok(())
    }
}

/// Profile resolved by name, with the reason the resolution took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScrollProfile {
    pub profile: ScrollProfile,
    pub reason_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScrollProfileFile {
    #[serde(default = "scroll_profile_schema_version")]
    schema_version: u32,
    #[serde(default)]
    profiles: Vec<ScrollProfile>,
}

/// Registry of built-in profiles plus any file-loaded overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollProfileSet {
    builtin: Vec<ScrollProfile>,
    overrides: Vec<ScrollProfile>,
}

impl Default for ScrollProfileSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ScrollProfileSet {
    /// Registry with only the built-in profiles.
    pub fn builtin() -> Self {
        Self {
            builtin: vec![
                ScrollProfile {
                    name: "default".to_string(),
                    settle_timeout_ms: 1_200,
                    cycle_delay_ms: 350,
                    guard_limit: 60,
                    max_stable_rounds: 3,
                },
                ScrollProfile {
                    name: "patient".to_string(),
                    settle_timeout_ms: 2_500,
                    cycle_delay_ms: 700,
                    guard_limit: 120,
                    max_stable_rounds: 5,
                },
                ScrollProfile {
                    name: "brisk".to_string(),
                    settle_timeout_ms: 600,
                    cycle_delay_ms: 150,
                    guard_limit: 40,
                    max_stable_rounds: 2,
                },
            ],
            overrides: Vec::new(),
        }
    }

    /// Loads override profiles from a JSON file; unknown names are added,
    /// known names shadow the built-ins.
    pub fn load_overrides(&mut self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let parsed: ScrollProfileFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if parsed.schema_version != SCROLL_PROFILE_SCHEMA_VERSION {
            bail!(
                "unsupported scroll profile schema {} in {}",
                parsed.schema_version,
                path.display()
            );
        }
        for profile in &parsed.profiles {
            profile.validate()?;
        }
        let loaded = parsed.profiles.len();
        self.overrides = parsed.profiles;
        Ok(loaded)
    }

    /// Resolves a profile by trimmed name; overrides win over built-ins.
    pub fn resolve(&self, name: &str) -> Result<ResolvedScrollProfile> {
        let wanted = name.trim();
        if wanted.is_empty() {
            bail!("scroll profile name cannot be empty");
        }
        if let Some(profile) = self.overrides.iter().find(|profile| profile.name == wanted) {
            return Ok(ResolvedScrollProfile {
                profile: profile.clone(),
                reason_code: "scroll_profile_override".to_string(),
            });
        }
        if let Some(profile) = self.builtin.iter().find(|profile| profile.name == wanted) {
            return Ok(ResolvedScrollProfile {
                profile: profile.clone(),
                reason_code: "scroll_profile_builtin".to_string(),
            });
        }
        bail!(
            "unknown scroll profile '{}' (expected one of {})",
            wanted,
            self.names().join("|")
        );
    }

    /// Every selectable profile name, overrides first.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .overrides
            .iter()
            .map(|profile| profile.name.clone())
            .collect();
        for profile in &self.builtin {
            if !names.contains(&profile.name) {
                names.push(profile.name.clone());
            }
        }
        names
    }
}
