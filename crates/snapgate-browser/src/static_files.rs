use std::path::{Component, Path, PathBuf};

use snapgate_core::error::AppError;

/// Fast path for sites served from local static assets: resolves a
/// route against a site-scoped root directory and reads the file,
/// bypassing the browser driver entirely.
#[derive(Debug, Clone)]
pub struct StaticSiteReader {
    root: PathBuf,
}

impl StaticSiteReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a route to a file path under the root.
    ///
    /// Fragments and query strings are stripped (they never reach the
    /// filesystem), directory requests resolve to `index.html`, and
    /// parent-directory components are rejected to keep resolution
    /// inside the root.
    fn resolve(&self, route: &str) -> Result<PathBuf, AppError> {
        let path_part = route.split(['#', '?']).next().unwrap_or("");
        let trimmed = path_part.trim_start_matches('/');

        let relative = Path::new(trimmed);
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(AppError::StaticFile(format!(
                "route '{route}' escapes the static root"
            )));
        }

        let mut full = self.root.join(relative);
        if trimmed.is_empty() || route.ends_with('/') || full.is_dir() {
            full.push("index.html");
        }
        Ok(full)
    }

    /// Read the file backing `route`.
    pub async fn read(&self, route: &str) -> Result<String, AppError> {
        let path = self.resolve(route)?;
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            AppError::StaticFile(format!("cannot read {}: {e}", path.display()))
        })
    }
}
