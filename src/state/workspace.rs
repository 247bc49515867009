//! Workspace file store backing `/workspace/files/{path}` and the mutation
//! engine's `workspace_file` target (spec §4.4).

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// Whitelist from spec §4.4 step 2. `**` suffix means "any file under this
/// directory"; entries without it are exact matches.
const WHITELIST: &[&str] = &[
    "prompts/**",
    "prompt/**",
    "docs/AI/**",
    "config/models.json",
    "config/active-llm.json",
];

pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Normalize a client-supplied path: strip a leading `/`, URL-decode,
    /// forbid empty/`.`/`..` segments (spec §4.4 step 2).
    pub fn normalize_path(raw: &str) -> Result<String> {
        let stripped = raw.strip_prefix('/').unwrap_or(raw);
        let decoded = urlencoding::decode(stripped)
            .context("path is not valid percent-encoding")?
            .into_owned();
        if decoded.is_empty() {
            bail!("path must not be empty");
        }
        let mut segments = Vec::new();
        for seg in decoded.split('/') {
            if seg.is_empty() || seg == "." || seg == ".." {
                bail!("path segment '{}' is not allowed", seg);
            }
            segments.push(seg);
        }
        Ok(segments.join("/"))
    }

    /// Returns true if `path` (already normalized) falls inside the whitelist.
    pub fn is_whitelisted(path: &str) -> bool {
        WHITELIST.iter().any(|pattern| match pattern.strip_suffix("/**") {
            Some(prefix) => path.starts_with(prefix) && path.len() > prefix.len(),
            None => path == *pattern,
        })
    }

    fn resolve(&self, normalized_path: &str) -> PathBuf {
        self.root.join(normalized_path)
    }

    pub async fn read(&self, normalized_path: &str) -> Result<String> {
        let path = self.resolve(normalized_path);
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading workspace file {}", path.display()))
    }

    pub async fn exists(&self, normalized_path: &str) -> bool {
        tokio::fs::metadata(self.resolve(normalized_path)).await.is_ok()
    }

    pub async fn write(&self, normalized_path: &str, content: &str) -> Result<()> {
        let path = self.resolve(normalized_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("writing workspace file {}", path.display()))
    }

    pub async fn delete(&self, normalized_path: &str) -> Result<()> {
        let path = self.resolve(normalized_path);
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("deleting workspace file {}", path.display()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_leading_slash_and_decodes() {
        let got = WorkspaceStore::normalize_path("/prompts/hello%20world.md").unwrap();
        assert_eq!(got, "prompts/hello world.md");
    }

    #[test]
    fn normalize_rejects_parent_traversal() {
        assert!(WorkspaceStore::normalize_path("prompts/../secrets.txt").is_err());
    }

    #[test]
    fn whitelist_allows_prompts_glob() {
        assert!(WorkspaceStore::is_whitelisted("prompts/selfops-test.md"));
        assert!(WorkspaceStore::is_whitelisted("config/models.json"));
        assert!(!WorkspaceStore::is_whitelisted("secrets/config.txt"));
    }
}
