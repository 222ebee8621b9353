//! TOML profile loading — an external collaborator by design (spec §1,
//! §6): `hopgate-core` never parses a profile file itself, only consumes
//! the parsed [`hopgate_core::Profile`]. Field shapes mirror the Go
//! original's own TOML profile format
//! (`internal/config/toml.go`, `internal/loaders/toml.go`), expressed here
//! as a `serde::Deserialize` struct tree the way the teacher loads its own
//! config (`lib_common::config_cloud`, `lib_common::config_sys`).

use std::path::Path;

use anyhow::{Context, Result};
use hopgate_core::Profile;

pub async fn load_profile(path: &Path) -> Result<Profile> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading profile at {}", path.display()))?;
    let profile: Profile = toml::from_str(&contents)
        .with_context(|| format!("parsing profile at {}", path.display()))?;
    profile
        .validate()
        .map_err(|e| anyhow::anyhow!("profile {} failed validation: {e}", path.display()))?;
    Ok(profile)
}
