//! Registry authentication for pulls.

use corral_events::Image;

use crate::error::AgentError;
use crate::runtime::RegistryAuth;

/// Canonical index address of the public registry.
pub const DOCKER_HUB_INDEX: &str = "https://index.docker.io/v1/";

const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// Pull credentials for `image`, if it carries a registry credential.
pub fn registry_auth(image: &Image, image_name: &str) -> Result<Option<RegistryAuth>, AgentError> {
    let Some(credential) = image.registry_credential.as_ref() else {
        return Ok(None);
    };

    let username = credential
        .public_value
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            AgentError::configuration(
                format!("registry credential of image {}", image_name),
                "missing username (publicValue)",
            )
        })?;
    let password = credential
        .secret_value
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            AgentError::configuration(
                format!("registry credential of image {}", image_name),
                "missing password (secretValue)",
            )
        })?;

    let server_address = credential
        .registry
        .as_ref()
        .and_then(|r| r.server_address.clone())
        .or_else(|| {
            image
                .data
                .docker_image
                .as_ref()
                .and_then(|d| d.server.clone())
        })
        .map(|server| normalize_server(&server));

    Ok(Some(RegistryAuth {
        username,
        password,
        email: credential.email.clone(),
        server_address,
    }))
}

/// Map aliases of the public registry to its index address.
pub fn normalize_server(server: &str) -> String {
    let host = server
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let host = host.split('/').next().unwrap_or(host);

    if DOCKER_HUB_ALIASES.contains(&host) {
        DOCKER_HUB_INDEX.to_string()
    } else {
        server.to_string()
    }
}
