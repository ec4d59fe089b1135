//! Thin wrapper over the Hugging Face Hub sync API.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};

use crate::error::{FinetuneError, Result};

/// Hub client bound to one cache directory and token.
pub struct HubClient {
    api: Api,
}

impl HubClient {
    /// Build a client. Without `cache_dir` the hub default cache is used.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Hub`] if the client cannot be initialized.
    pub fn new(cache_dir: Option<&Path>, token: Option<String>) -> Result<Self> {
        let mut builder = ApiBuilder::new().with_progress(true);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir.to_path_buf());
        }
        if token.is_some() {
            builder = builder.with_token(token);
        }
        Ok(Self {
            api: builder.build()?,
        })
    }

    /// Handle to a model repository.
    #[must_use]
    pub fn model(&self, model_id: &str, revision: Option<&str>) -> HubRepo {
        self.repo(model_id, RepoType::Model, revision)
    }

    /// Handle to a dataset repository.
    #[must_use]
    pub fn dataset(&self, dataset_id: &str, revision: Option<&str>) -> HubRepo {
        self.repo(dataset_id, RepoType::Dataset, revision)
    }

    fn repo(&self, id: &str, repo_type: RepoType, revision: Option<&str>) -> HubRepo {
        let repo = match revision {
            Some(rev) => Repo::with_revision(id.to_string(), repo_type, rev.to_string()),
            None => Repo::new(id.to_string(), repo_type),
        };
        HubRepo {
            id: id.to_string(),
            repo: self.api.repo(repo),
        }
    }
}

/// A single repository on the hub.
pub struct HubRepo {
    id: String,
    repo: ApiRepo,
}

impl HubRepo {
    /// Repository id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Download `filename` (or reuse the cached copy) and return its local path.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Hub`] if the file cannot be fetched.
    pub fn fetch(&self, filename: &str) -> Result<PathBuf> {
        tracing::debug!("Fetching {}/{}", self.id, filename);
        self.repo
            .get(filename)
            .map_err(|e| FinetuneError::Hub(format!("{}/{filename}: {e}", self.id)))
    }

    /// Like [`Self::fetch`], but a missing file is `None` instead of an error.
    #[must_use]
    pub fn fetch_optional(&self, filename: &str) -> Option<PathBuf> {
        match self.repo.get(filename) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!("{}/{} unavailable: {}", self.id, filename, e);
                None
            }
        }
    }

    /// Relative paths of every file in the repository.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Hub`] if the repository metadata cannot be read.
    pub fn list_files(&self) -> Result<Vec<String>> {
        let info = self
            .repo
            .info()
            .map_err(|e| FinetuneError::Hub(format!("{}: {e}", self.id)))?;
        Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
    }
}
