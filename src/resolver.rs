//! Dynamic dependency resolution against a remote package repository.
//!
//! The repository protocol itself is out of scope: `PackageRepository`
//! is the opaque contract; `HttpPackageRepository` is one concrete binding of
//! it over a configurable HTTP endpoint, following the same `reqwest`-based
//! client shape used elsewhere in the corpus for talking to a JSON API.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// A package's compartment, per NuGet-style layout conventions: `lib/` holds
/// runtime-loadable artifacts, `ref/` holds compile-time-only reference
/// assemblies that must never be loaded into a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compartment {
    Lib,
    Ref,
}

/// One runtime-target build of a package version.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageVariant {
    /// e.g. "net8.0" parsed into (8, 0).
    pub target_framework_major: u32,
    pub target_framework_minor: u32,
    pub compartment: Compartment,
    /// Artifact download URLs relative to the repository, one per file in
    /// this variant (the assembly plus any `.xml`/`.pdb` siblings the
    /// repository happens to ship — the resolver keeps all of them so the
    /// sandbox can load the assembly and ignore the rest).
    pub artifact_urls: Vec<String>,
}

/// Metadata the repository returns for a single package version.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageMetadata {
    pub version: String,
    pub variants: Vec<PackageVariant>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("package '{package_id}' not found")]
    PackageNotFound { package_id: String },
    #[error("package '{package_id}' has no version compatible with the host runtime")]
    Incompatible { package_id: String },
    #[error("failed to download artifact for '{package_id}': {message}")]
    DownloadFailed { package_id: String, message: String },
}

/// Opaque collaborator: the remote package repository.
#[async_trait]
pub trait PackageRepository: Send + Sync {
    /// Latest stable version string for `package_id`, or `None` if the
    /// package does not exist.
    async fn latest_stable_version(&self, package_id: &str) -> anyhow::Result<Option<String>>;

    /// Metadata for an exact `(package_id, version)`, or `None` if not found.
    async fn metadata(&self, package_id: &str, version: &str) -> anyhow::Result<Option<PackageMetadata>>;

    /// Download one artifact URL to a local path and return that path.
    async fn download(&self, package_id: &str, artifact_url: &str) -> anyhow::Result<PathBuf>;
}

/// The host runtime version variants are matched against.
#[derive(Debug, Clone, Copy)]
pub struct HostRuntime {
    pub major: u32,
    pub minor: u32,
}

pub struct DependencyResolver<R: PackageRepository> {
    repository: R,
    host_runtime: HostRuntime,
}

impl<R: PackageRepository> DependencyResolver<R> {
    #[must_use]
    pub fn new(repository: R, host_runtime: HostRuntime) -> Self {
        Self {
            repository,
            host_runtime,
        }
    }

    /// Resolve `(package_id, version?)` to a list of local `lib/` artifact
    /// paths, selecting the best-matching runtime-target variant.
    pub async fn resolve(&self, package_id: &str, version: Option<&str>) -> Result<Vec<PathBuf>, ResolveError> {
        let version = match version {
            Some(v) => v.to_string(),
            None => self
                .repository
                .latest_stable_version(package_id)
                .await
                .map_err(|e| ResolveError::DownloadFailed {
                    package_id: package_id.to_string(),
                    message: e.to_string(),
                })?
                .ok_or_else(|| ResolveError::PackageNotFound {
                    package_id: package_id.to_string(),
                })?,
        };

        let metadata = self
            .repository
            .metadata(package_id, &version)
            .await
            .map_err(|e| ResolveError::DownloadFailed {
                package_id: package_id.to_string(),
                message: e.to_string(),
            })?
            .ok_or_else(|| ResolveError::PackageNotFound {
                package_id: package_id.to_string(),
            })?;

        let variant = self
            .best_matching_variant(&metadata)
            .ok_or_else(|| ResolveError::Incompatible {
                package_id: package_id.to_string(),
            })?;

        let mut paths = Vec::with_capacity(variant.artifact_urls.len());
        for url in &variant.artifact_urls {
            let path = self
                .repository
                .download(package_id, url)
                .await
                .map_err(|e| ResolveError::DownloadFailed {
                    package_id: package_id.to_string(),
                    message: e.to_string(),
                })?;
            debug!(package = %package_id, version = %version, path = %path.display(), "downloaded artifact");
            paths.push(path);
        }
        Ok(paths)
    }

    /// Best-match policy: same major preferred, else highest
    /// version not exceeding the host. `ref/` variants are excluded
    /// entirely — only `lib/` artifacts are ever candidates.
    fn best_matching_variant<'a>(&self, metadata: &'a PackageMetadata) -> Option<&'a PackageVariant> {
        let candidates: Vec<&PackageVariant> = metadata
            .variants
            .iter()
            .filter(|v| v.compartment == Compartment::Lib)
            .filter(|v| {
                v.target_framework_major < self.host_runtime.major
                    || (v.target_framework_major == self.host_runtime.major
                        && v.target_framework_minor <= self.host_runtime.minor)
            })
            .collect();

        candidates
            .iter()
            .copied()
            .filter(|v| v.target_framework_major == self.host_runtime.major)
            .max_by_key(|v| v.target_framework_minor)
            .or_else(|| {
                candidates
                    .iter()
                    .copied()
                    .max_by_key(|v| (v.target_framework_major, v.target_framework_minor))
            })
    }
}

/// `PackageRepository` bound to an HTTP NuGet-style feed.
pub struct HttpPackageRepository {
    client: reqwest::Client,
    base_url: String,
    cache_dir: PathBuf,
}

impl HttpPackageRepository {
    #[must_use]
    pub fn new(base_url: impl Into<String>, cache_dir: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            cache_dir,
        }
    }
}

#[async_trait]
impl PackageRepository for HttpPackageRepository {
    async fn latest_stable_version(&self, package_id: &str) -> anyhow::Result<Option<String>> {
        #[derive(Deserialize)]
        struct VersionsResponse {
            versions: Vec<String>,
        }
        let url = format!("{}/packages/{}/versions", self.base_url, package_id);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: VersionsResponse = response.error_for_status()?.json().await?;
        Ok(body.versions.into_iter().next_back())
    }

    async fn metadata(&self, package_id: &str, version: &str) -> anyhow::Result<Option<PackageMetadata>> {
        let url = format!("{}/packages/{}/{}/metadata", self.base_url, package_id, version);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn download(&self, package_id: &str, artifact_url: &str) -> anyhow::Result<PathBuf> {
        let url = format!("{}/{}", self.base_url, artifact_url);
        let bytes = self.client.get(&url).send().await?.error_for_status()?.bytes().await?;

        let package_dir = self.cache_dir.join(package_id);
        tokio::fs::create_dir_all(&package_dir).await?;
        let file_name = artifact_url.rsplit('/').next().unwrap_or("artifact.dll");
        let dest = package_dir.join(file_name);
        tokio::fs::write(&dest, &bytes).await?;
        Ok(dest)
    }
}

/// Stands in for a package repository when the daemon is run without one
/// configured. Every lookup reports "not found" rather than failing with a
/// connection error, so `LoadPackage` surfaces the ordinary
/// `PACKAGE_NOT_FOUND` diagnostic instead of an internal error.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPackageRepository;

#[async_trait]
impl PackageRepository for NullPackageRepository {
    async fn latest_stable_version(&self, _package_id: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn metadata(&self, _package_id: &str, _version: &str) -> anyhow::Result<Option<PackageMetadata>> {
        Ok(None)
    }

    async fn download(&self, _package_id: &str, _artifact_url: &str) -> anyhow::Result<PathBuf> {
        anyhow::bail!("no package repository configured")
    }
}
