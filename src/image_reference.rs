use std::fmt;

pub const LATEST_TAG: &str = "latest";

/// An image reference built from its parts. The registry is optional so that
/// short names such as `app:latest` can be expressed; no character-set
/// validation is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    pub fn latest(registry: Option<&str>, repository: &str) -> Self {
        Self {
            registry: registry.map(str::to_string),
            repository: repository.to_string(),
            tag: LATEST_TAG.to_string(),
        }
    }

    /// Reference without the tag, e.g. `quay.example.com/team/app`.
    pub fn name(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.repository),
            None => self.repository.clone(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name(), self.tag)
    }
}

/// `repository:latest`
pub fn image_path(repository: &str) -> ImageReference {
    ImageReference::latest(None, repository)
}

/// `registry/repository/base:latest` when a base image is given, otherwise
/// `registry/repository:latest`.
pub fn full_image_ref(registry_host: &str, repository: &str, base_image: &str) -> ImageReference {
    if base_image.is_empty() {
        ImageReference::latest(Some(registry_host), repository)
    } else {
        ImageReference::latest(
            Some(registry_host),
            &format!("{}/{}", repository, base_image),
        )
    }
}
