//! OCI distribution API client.
//!
//! Covers the read side only: resolving a reference to an image manifest
//! (through an index when needed) and streaming blobs. Anonymous bearer
//! tokens are requested on a `401` challenge.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use tracing::{debug, info};

use crate::digest::ContentHash;
use crate::error::{OciError, Result};
use crate::manifest::{ImageManifest, ManifestDocument, Platform, ACCEPT_ANY, ACCEPT_IMAGE};

/// A blob body as it arrives from the registry.
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

const DOCKER_HUB: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

/// `registry/repository` plus a tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Host, with port when one was given (e.g. `localhost:5000`).
    pub registry: String,
    /// Repository path (e.g. `library/ubuntu`).
    pub repository: String,
    /// Tag, or a `sha256:` digest.
    pub reference: String,
}

impl ImageRef {
    /// Parse `[registry/]repository[:tag|@digest]`.
    ///
    /// The first path component is a registry when it looks like a host
    /// (contains `.` or `:`, or is `localhost`); otherwise the image lives
    /// on Docker Hub, where single-component names get the `library/`
    /// namespace.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::InvalidReference("empty image reference".into()));
        }

        let (name, reference) = split_reference(raw);
        let (registry, repository) = match name.split_once('/') {
            Some((host, rest)) if looks_like_host(host) => (host.to_string(), rest.to_string()),
            _ => (DOCKER_HUB.to_string(), name.to_string()),
        };
        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        if repository.is_empty() || repository.ends_with('/') || reference.is_empty() {
            return Err(OciError::InvalidReference(raw.to_string()));
        }
        Ok(Self {
            registry,
            repository,
            reference: reference.to_string(),
        })
    }

    fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }
}

/// Split off `@digest` or a `:tag` that follows the last `/`.
fn split_reference(raw: &str) -> (&str, &str) {
    if let Some((name, digest)) = raw.split_once('@') {
        return (name, digest);
    }
    let last_slash = raw.rfind('/').map_or(0, |p| p + 1);
    match raw[last_slash..].rfind(':') {
        Some(colon) => {
            let colon = last_slash + colon;
            (&raw[..colon], &raw[colon + 1..])
        }
        None => (raw, DEFAULT_TAG),
    }
}

fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

/// Registries on the loopback interface are spoken to over plain HTTP.
fn scheme_for(registry: &str) -> &'static str {
    let host = registry
        .rsplit_once(':')
        .map_or(registry, |(host, _port)| host);
    match host {
        "localhost" | "127.0.0.1" | "[::1]" => "http",
        _ => "https",
    }
}

/// An image manifest and the digest of the bytes it was decoded from.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub digest: ContentHash,
    pub manifest: ImageManifest,
}

/// HTTP client for one or more registries.
pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("layerdisk/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    /// Fetch `reference` (a tag or digest) from the repository of
    /// `image_ref`. The returned digest covers the exact bytes served.
    pub async fn fetch_manifest(
        &self,
        image_ref: &ImageRef,
        reference: &str,
        accept: &[&str],
    ) -> Result<(ManifestDocument, ContentHash)> {
        let url = endpoint(image_ref, "manifests", reference);
        let body = self
            .get(&url, image_ref, Some(&accept.join(", ")))
            .await?
            .bytes()
            .await?;
        let digest = ContentHash::of_bytes(&body);
        debug!(%url, %digest, bytes = body.len(), "fetched manifest");
        Ok((ManifestDocument::from_slice(&body)?, digest))
    }

    /// Resolve `image_ref` to the image manifest for `platform`. A digest
    /// reference, or the digest taken from an index, must match the bytes
    /// the registry returns.
    pub async fn resolve_manifest(
        &self,
        image_ref: &ImageRef,
        platform: &Platform,
    ) -> Result<ResolvedManifest> {
        let (doc, digest) = self
            .fetch_manifest(image_ref, &image_ref.reference, &ACCEPT_ANY)
            .await?;
        if image_ref.is_digest() {
            check_digest(&image_ref.reference, &digest)?;
        }

        let index = match doc {
            ManifestDocument::Image(manifest) => return Ok(ResolvedManifest { digest, manifest }),
            ManifestDocument::Index(index) => index,
        };

        let entry = index.select(platform)?;
        info!(digest = %entry.digest, %platform, "selected manifest from index");
        let (doc, digest) = self
            .fetch_manifest(image_ref, &entry.digest, &ACCEPT_IMAGE)
            .await?;
        check_digest(&entry.digest, &digest)?;

        match doc {
            ManifestDocument::Image(manifest) => Ok(ResolvedManifest { digest, manifest }),
            ManifestDocument::Index(_) => Err(OciError::Manifest(format!(
                "index entry {} is itself an index",
                entry.digest
            ))),
        }
    }

    /// Open a streaming download of blob `digest`. The caller verifies
    /// what it reads.
    pub async fn fetch_blob(&self, image_ref: &ImageRef, digest: &ContentHash) -> Result<BlobStream> {
        let url = endpoint(image_ref, "blobs", &digest.to_string());
        debug!(%url, "opening blob stream");
        let resp = self.get(&url, image_ref, None).await?;
        Ok(Box::pin(resp.bytes_stream().map_err(OciError::from)))
    }

    /// GET `url`, answering a bearer challenge once. Non-success statuses
    /// become errors; the body of a success is left unread.
    async fn get(&self, url: &str, image_ref: &ImageRef, accept: Option<&str>) -> Result<Response> {
        let mut resp = self.send(url, accept, None).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            let challenge = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(BearerChallenge::parse)
                .ok_or_else(|| OciError::Registry(format!("{} requires auth but sent no challenge", url)))?;
            let token = self.fetch_token(&challenge, image_ref).await?;
            resp = self.send(url, accept, Some(&token)).await?;
        }

        match resp.status() {
            StatusCode::NOT_FOUND => Err(OciError::NotFound(url.to_string())),
            status if status.is_success() => Ok(resp),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(OciError::Registry(format!("GET {} returned {}: {}", url, status, body)))
            }
        }
    }

    async fn send(&self, url: &str, accept: Option<&str>, token: Option<&str>) -> Result<Response> {
        let mut req = self.http.get(url);
        if let Some(accept) = accept {
            req = req.header(ACCEPT, accept);
        }
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        Ok(req.send().await?)
    }

    async fn fetch_token(&self, challenge: &BearerChallenge, image_ref: &ImageRef) -> Result<String> {
        let realm = challenge
            .realm
            .as_deref()
            .ok_or_else(|| OciError::Registry("auth challenge has no realm".into()))?;
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", image_ref.repository));

        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }
        debug!(realm, "requesting anonymous token");

        let resp = self.http.get(realm).query(&query).send().await?;
        if !resp.status().is_success() {
            return Err(OciError::Registry(format!(
                "token endpoint {} returned {}",
                realm,
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        ["token", "access_token"]
            .iter()
            .find_map(|k| body.get(*k).and_then(|v| v.as_str()))
            .map(str::to_string)
            .ok_or_else(|| OciError::Registry("token response has no token".into()))
    }
}

fn endpoint(image_ref: &ImageRef, kind: &str, reference: &str) -> String {
    format!(
        "{}://{}/v2/{}/{}/{}",
        scheme_for(&image_ref.registry),
        image_ref.registry,
        image_ref.repository,
        kind,
        reference
    )
}

fn check_digest(expected: &str, actual: &ContentHash) -> Result<()> {
    if actual.to_string() == expected {
        Ok(())
    } else {
        Err(OciError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Parameters of a `WWW-Authenticate: Bearer ...` header.
#[derive(Debug, Default, PartialEq, Eq)]
struct BearerChallenge {
    realm: Option<String>,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Self {
        let params = header
            .trim()
            .strip_prefix("Bearer")
            .unwrap_or(header)
            .trim();
        let mut challenge = Self::default();
        for (key, value) in quoted_params(params) {
            match key {
                "realm" => challenge.realm = Some(value.to_string()),
                "service" => challenge.service = Some(value.to_string()),
                "scope" => challenge.scope = Some(value.to_string()),
                _ => {}
            }
        }
        challenge
    }
}

/// `key="value"` pairs separated by commas. Values may contain commas
/// (scopes often do), so the split follows the quotes.
fn quoted_params(mut rest: &str) -> Vec<(&str, &str)> {
    let mut out = Vec::new();
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim().trim_start_matches(',').trim();
        let after = &rest[eq + 2..];
        let Some(close) = after.find('"') else { break };
        out.push((key, &after[..close]));
        rest = &after[close + 1..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> (String, String, String) {
        let r = ImageRef::parse(raw).unwrap();
        (r.registry, r.repository, r.reference)
    }

    #[test]
    fn parses_local_registry_references() {
        assert_eq!(
            parse("localhost:5000/ubuntu-nydus:latest"),
            ("localhost:5000".into(), "ubuntu-nydus".into(), "latest".into())
        );
        assert_eq!(
            parse("localhost/nydus/app"),
            ("localhost".into(), "nydus/app".into(), "latest".into())
        );
        assert_eq!(
            parse("127.0.0.1:5000/org/app@sha256:abc"),
            ("127.0.0.1:5000".into(), "org/app".into(), "sha256:abc".into())
        );
    }

    #[test]
    fn parses_docker_hub_references() {
        assert_eq!(
            parse("ubuntu"),
            (DOCKER_HUB.into(), "library/ubuntu".into(), "latest".into())
        );
        assert_eq!(
            parse("someone/tool:v2"),
            (DOCKER_HUB.into(), "someone/tool".into(), "v2".into())
        );
        assert_eq!(
            parse("ghcr.io/dragonflyoss/nydus:nightly"),
            ("ghcr.io".into(), "dragonflyoss/nydus".into(), "nightly".into())
        );
    }

    #[test]
    fn rejects_incomplete_references() {
        for raw in ["", "   ", "localhost:5000/repo:", "localhost:5000/", "repo@"] {
            assert!(
                matches!(ImageRef::parse(raw), Err(OciError::InvalidReference(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn display_reassembles_reference() {
        let r = ImageRef::parse("localhost:5000/ubuntu-nydus:latest").unwrap();
        assert_eq!(r.to_string(), "localhost:5000/ubuntu-nydus:latest");
        let r = ImageRef::parse("ghcr.io/foo/bar@sha256:abc123").unwrap();
        assert_eq!(r.to_string(), "ghcr.io/foo/bar@sha256:abc123");
    }

    #[test]
    fn loopback_registries_use_http() {
        assert_eq!(scheme_for("localhost:5000"), "http");
        assert_eq!(scheme_for("localhost"), "http");
        assert_eq!(scheme_for("127.0.0.1:41234"), "http");
        assert_eq!(scheme_for("ghcr.io"), "https");
        assert_eq!(scheme_for("registry.example.com:443"), "https");
    }

    #[test]
    fn endpoint_urls() {
        let r = ImageRef::parse("localhost:5000/nydus/app:v1").unwrap();
        assert_eq!(
            endpoint(&r, "manifests", &r.reference),
            "http://localhost:5000/v2/nydus/app/manifests/v1"
        );
    }

    #[test]
    fn parses_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.example.io/token",service="registry.example.io",scope="repository:a/b:pull,push""#;
        assert_eq!(
            BearerChallenge::parse(header),
            BearerChallenge {
                realm: Some("https://auth.example.io/token".into()),
                service: Some("registry.example.io".into()),
                scope: Some("repository:a/b:pull,push".into()),
            }
        );
        assert_eq!(BearerChallenge::parse("Basic"), BearerChallenge::default());
    }

    #[test]
    fn digest_check() {
        let d = ContentHash::of_bytes(b"manifest");
        assert!(check_digest(&d.to_string(), &d).is_ok());
        assert!(matches!(
            check_digest("sha256:00", &d),
            Err(OciError::DigestMismatch { .. })
        ));
    }
}
