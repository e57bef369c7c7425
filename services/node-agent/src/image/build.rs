//! Image builds from a context archive or a VCS remote.

use bytes::Bytes;
use corral_events::BuildSpec;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::AgentError;
use crate::runtime::BuildOptions;

const GITHUB_SSH_PREFIX: &str = "git@github.com:";
const GITHUB_GIT_PREFIX: &str = "git://github.com/";

/// Rewrite an SSH GitHub remote to the anonymous git protocol.
///
/// Other remotes are returned unchanged.
pub fn rewrite_remote(remote: &str) -> String {
    match remote.strip_prefix(GITHUB_SSH_PREFIX) {
        Some(path) => format!("{}{}", GITHUB_GIT_PREFIX, path),
        None => remote.to_string(),
    }
}

/// Download a build context archive.
///
/// The archive is staged in a temporary directory that is removed on return.
pub async fn download_context(http: &reqwest::Client, url: &str) -> Result<Bytes, AgentError> {
    let download_error = |message: String| AgentError::Download {
        url: url.to_string(),
        message,
    };

    let staging = tempfile::tempdir()?;
    let path = staging.path().join("context.tar");

    let mut response = http
        .get(url)
        .send()
        .await
        .map_err(|e| download_error(e.to_string()))?;

    if !response.status().is_success() {
        return Err(download_error(format!("HTTP {}", response.status())));
    }

    let mut file = tokio::fs::File::create(&path).await?;
    let mut size = 0usize;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| download_error(e.to_string()))?
    {
        size += chunk.len();
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    debug!(url = %url, bytes = size, "Downloaded build context");
    let context = tokio::fs::read(&path).await?;
    Ok(Bytes::from(context))
}

/// Assemble build options for `tag` from a build spec.
pub async fn build_options(
    http: &reqwest::Client,
    spec: &BuildSpec,
    tag: &str,
) -> Result<BuildOptions, AgentError> {
    let mut options = BuildOptions {
        tag: tag.to_string(),
        dockerfile: spec.dockerfile.clone(),
        nocache: spec.nocache,
        rm: spec.rm.unwrap_or(true),
        forcerm: spec.forcerm,
        ..Default::default()
    };

    if let Some(url) = spec.context.as_deref() {
        info!(tag = %tag, url = %url, "Building image from context archive");
        options.context = Some(download_context(http, url).await?);
    } else if let Some(remote) = spec.remote.as_deref() {
        let remote = rewrite_remote(remote);
        info!(tag = %tag, remote = %remote, "Building image from remote");
        options.remote = Some(remote);
    } else {
        return Err(AgentError::configuration(
            format!("build spec of image {}", tag),
            "neither context nor remote given",
        ));
    }

    Ok(options)
}
