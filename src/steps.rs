use crate::config::Config;
use crate::engine::{ContainerEngine, EngineError, RegistryAuth, SIGKILL};
use crate::image_reference::{ImageReference, full_image_ref, image_path};
use chrono::Utc;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Which image the deleted top layer is rebuilt from. Exactly one is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseSelector {
    BaseImage(String),
    BaseLayerId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Connect,
    ResolveBase,
    PullTest,
    PullBase,
    DeleteLayer,
    TagLayer,
    PushTest,
}

impl Step {
    #[inline]
    pub fn as_label(&self) -> &'static str {
        match self {
            Step::Connect => "connect",
            Step::ResolveBase => "resolve-base",
            Step::PullTest => "pull-test",
            Step::PullBase => "pull-base",
            Step::DeleteLayer => "delete-layer",
            Step::TagLayer => "tag-layer",
            Step::PushTest => "push-test",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A failed step, classified by how the monitor has to react to it.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Safe to retry shortly.
    #[error("{step} step failed")]
    Transient {
        step: Step,
        #[source]
        source: EngineError,
    },
    /// Registry state may be inconsistent; the monitor stops probing.
    #[error("{step} step failed")]
    Structural {
        step: Step,
        #[source]
        source: EngineError,
    },
    /// Terminates the process.
    #[error("{step} step failed fatally")]
    Fatal {
        step: Step,
        #[source]
        source: EngineError,
    },
}

impl StepError {
    pub fn step(&self) -> Step {
        match self {
            StepError::Transient { step, .. }
            | StepError::Structural { step, .. }
            | StepError::Fatal { step, .. } => *step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerDeletion {
    Deleted(String),
    /// No history entry carried the `latest` tag.
    NoLayerToDelete,
}

/// Everything the steps need to know about the probed repository.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub registry_host: String,
    pub repository: String,
    pub base: BaseSelector,
    pub pull_auth: Option<RegistryAuth>,
    pub push_auth: RegistryAuth,
}

impl ProbeTarget {
    pub fn new(config: &Config, base: BaseSelector) -> Self {
        Self {
            registry_host: config.registry.host.clone(),
            repository: config.registry.repository.clone(),
            base,
            pull_auth: config.pull_auth(),
            push_auth: config.registry_auth(),
        }
    }

    fn base_image(&self) -> &str {
        match &self.base {
            BaseSelector::BaseImage(name) => name,
            BaseSelector::BaseLayerId(_) => "",
        }
    }

    /// Image the tag-layer container is created from.
    pub fn source_image(&self) -> ImageReference {
        full_image_ref(&self.registry_host, &self.repository, self.base_image())
    }

    /// Image that is committed and pushed back to the registry.
    pub fn test_image(&self) -> ImageReference {
        full_image_ref(&self.registry_host, &self.repository, "")
    }

    /// Image whose history holds the top layer to delete.
    pub fn history_target(&self) -> String {
        match &self.base {
            BaseSelector::BaseImage(_) => self.source_image().to_string(),
            BaseSelector::BaseLayerId(id) => id.clone(),
        }
    }
}

/// Uses the most recent history entry of the repository as base layer.
pub async fn resolve_base_layer(
    engine: &dyn ContainerEngine,
    repository: &str,
) -> Result<BaseSelector, StepError> {
    info!("No base image or base layer configured; resolving base layer id from {}", repository);
    let fatal = |source: EngineError| StepError::Fatal {
        step: Step::ResolveBase,
        source,
    };
    let history = engine.history(repository).await.map_err(fatal)?;
    let latest = history.into_iter().next().ok_or_else(|| {
        fatal(EngineError::Reported {
            operation: "history",
            message: format!("repository {} has no image history", repository),
        })
    })?;
    info!("Assigning base layer id {}", latest.id);
    Ok(BaseSelector::BaseLayerId(latest.id))
}

pub async fn pull_test_image(
    engine: &dyn ContainerEngine,
    target: &ProbeTarget,
) -> Result<Duration, StepError> {
    let started = Instant::now();
    engine
        .pull(&image_path(&target.repository), target.pull_auth.as_ref())
        .await
        .map_err(|source| StepError::Transient {
            step: Step::PullTest,
            source,
        })?;
    Ok(started.elapsed())
}

pub async fn pull_base_image(
    engine: &dyn ContainerEngine,
    target: &ProbeTarget,
) -> Result<(), StepError> {
    engine
        .pull(&target.source_image(), target.pull_auth.as_ref())
        .await
        .map_err(|source| StepError::Structural {
            step: Step::PullBase,
            source,
        })
}

pub async fn delete_top_layer(
    engine: &dyn ContainerEngine,
    target: &ProbeTarget,
) -> Result<LayerDeletion, StepError> {
    let structural = |source: EngineError| StepError::Structural {
        step: Step::DeleteLayer,
        source,
    };
    let history = engine
        .history(&target.history_target())
        .await
        .map_err(structural)?;

    let Some(top) = history.into_iter().find(|entry| entry.is_tagged_latest()) else {
        return Ok(LayerDeletion::NoLayerToDelete);
    };

    info!("Deleting image {}", top.id);
    engine
        .remove_images(std::slice::from_ref(&top.id))
        .await
        .map_err(structural)?;
    Ok(LayerDeletion::Deleted(top.id))
}

/// Creates, commits, starts and kills a throwaway container so that a fresh
/// top layer exists for the push. Returns the container name.
pub async fn create_tag_layer(
    engine: &dyn ContainerEngine,
    target: &ProbeTarget,
) -> Result<String, StepError> {
    let container_name = format!("updatedcontainer{}", Utc::now().timestamp_millis());
    info!("Creating new image via container {}", container_name);

    let fatal = |source: EngineError| StepError::Fatal {
        step: Step::TagLayer,
        source,
    };
    let structural = |source: EngineError| StepError::Structural {
        step: Step::TagLayer,
        source,
    };

    let container = engine
        .create_container(&target.source_image(), &container_name)
        .await
        .map_err(fatal)?;
    debug!("Created container {} ({})", container.name, container.id);
    engine
        .commit(&container, &target.test_image())
        .await
        .map_err(structural)?;
    engine.start(&container).await.map_err(fatal)?;

    info!("Removing container {}", container.name);
    engine.kill(&container, SIGKILL).await.map_err(structural)?;
    Ok(container.name)
}

pub async fn push_test_image(
    engine: &dyn ContainerEngine,
    target: &ProbeTarget,
) -> Result<Duration, StepError> {
    let image = target.test_image();
    let started = Instant::now();
    engine
        .push(&image, &image, &target.push_auth)
        .await
        .map_err(|source| StepError::Transient {
            step: Step::PushTest,
            source,
        })?;
    Ok(started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeEngine, entry};
    use crate::secret_string::SecretString;

    fn target(base: BaseSelector) -> ProbeTarget {
        let auth = RegistryAuth {
            username: "robot".to_string(),
            password: SecretString::new("secret"),
        };
        ProbeTarget {
            registry_host: "h".to_string(),
            repository: "app".to_string(),
            base,
            pull_auth: Some(auth.clone()),
            push_auth: auth,
        }
    }

    #[test]
    fn test_probe_target_references() {
        let layer = target(BaseSelector::BaseLayerId("sha1".to_string()));
        assert_eq!(layer.source_image().to_string(), "h/app:latest");
        assert_eq!(layer.test_image().to_string(), "h/app:latest");
        assert_eq!(layer.history_target(), "sha1");

        let image = target(BaseSelector::BaseImage("base".to_string()));
        assert_eq!(image.source_image().to_string(), "h/app/base:latest");
        assert_eq!(image.test_image().to_string(), "h/app:latest");
        assert_eq!(image.history_target(), "h/app/base:latest");
    }

    #[test]
    fn test_probe_target_from_config() {
        let mut config = Config::default();
        config.registry.host = "h".to_string();
        config.registry.repository = "app".to_string();
        config.registry.username = "robot".to_string();
        config.base.public = true;
        let target = ProbeTarget::new(&config, BaseSelector::BaseLayerId("x".to_string()));
        assert!(target.pull_auth.is_none());
        assert_eq!(target.push_auth.username, "robot");
    }

    #[tokio::test]
    async fn test_resolve_base_layer_uses_most_recent_entry() {
        let engine = FakeEngine::new();
        engine.with_history("app", vec![entry("newest", &[]), entry("older", &[])]);
        let selector = resolve_base_layer(&engine, "app").await.unwrap();
        assert_eq!(selector, BaseSelector::BaseLayerId("newest".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_base_layer_fails_on_empty_history() {
        let engine = FakeEngine::new();
        let err = resolve_base_layer(&engine, "app").await.unwrap_err();
        assert!(matches!(
            err,
            StepError::Fatal {
                step: Step::ResolveBase,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pull_test_image_is_transient_on_failure() {
        let engine = FakeEngine::new();
        let target = target(BaseSelector::BaseLayerId("sha1".to_string()));
        pull_test_image(&engine, &target).await.unwrap();
        assert_eq!(engine.calls(), vec!["pull app:latest as robot"]);

        engine.fail("pull");
        let err = pull_test_image(&engine, &target).await.unwrap_err();
        assert!(matches!(
            err,
            StepError::Transient {
                step: Step::PullTest,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pull_base_image_is_structural_on_failure() {
        let engine = FakeEngine::new();
        let target = target(BaseSelector::BaseImage("base".to_string()));
        pull_base_image(&engine, &target).await.unwrap();
        assert_eq!(engine.calls(), vec!["pull h/app/base:latest as robot"]);

        engine.fail("pull");
        let err = pull_base_image(&engine, &target).await.unwrap_err();
        assert_eq!(err.step(), Step::PullBase);
        assert!(matches!(err, StepError::Structural { .. }));
    }

    #[tokio::test]
    async fn test_delete_top_layer_removes_latest_entry_only() {
        let engine = FakeEngine::new();
        engine.with_history(
            "sha1",
            vec![
                entry("qualified", &["h/app:latest"]),
                entry("top", &["latest"]),
                entry("other", &["latest"]),
                entry("base", &[]),
            ],
        );
        let target = target(BaseSelector::BaseLayerId("sha1".to_string()));
        let deletion = delete_top_layer(&engine, &target).await.unwrap();
        assert_eq!(deletion, LayerDeletion::Deleted("top".to_string()));
        assert_eq!(engine.calls(), vec!["history sha1", "remove top"]);
    }

    #[tokio::test]
    async fn test_delete_top_layer_keeps_source_image() {
        let engine = FakeEngine::new();
        engine.with_history(
            "h/app/base:latest",
            vec![entry("base-id", &["h/app/base:latest"])],
        );
        let target = target(BaseSelector::BaseImage("base".to_string()));
        let deletion = delete_top_layer(&engine, &target).await.unwrap();
        assert_eq!(deletion, LayerDeletion::NoLayerToDelete);
        assert!(engine.removed().is_empty());
    }

    #[tokio::test]
    async fn test_delete_top_layer_without_latest_tag_is_a_no_op() {
        let engine = FakeEngine::new();
        engine.with_history("sha1", vec![entry("base", &["h/app:v1"])]);
        let target = target(BaseSelector::BaseLayerId("sha1".to_string()));
        let deletion = delete_top_layer(&engine, &target).await.unwrap();
        assert_eq!(deletion, LayerDeletion::NoLayerToDelete);
        assert_eq!(engine.calls(), vec!["history sha1"]);
    }

    #[tokio::test]
    async fn test_delete_top_layer_failures_are_structural() {
        let engine = FakeEngine::new();
        engine.with_history("sha1", vec![entry("top", &["latest"])]);
        engine.fail("remove");
        let target = target(BaseSelector::BaseLayerId("sha1".to_string()));
        let err = delete_top_layer(&engine, &target).await.unwrap_err();
        assert!(matches!(
            err,
            StepError::Structural {
                step: Step::DeleteLayer,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_create_tag_layer_runs_container_lifecycle() {
        let engine = FakeEngine::new();
        let target = target(BaseSelector::BaseImage("base".to_string()));
        let name = create_tag_layer(&engine, &target).await.unwrap();
        assert!(name.starts_with("updatedcontainer"));
        assert_eq!(
            engine.calls(),
            vec![
                format!("create {name} from h/app/base:latest"),
                format!("commit {name} as h/app:latest"),
                format!("start {name}"),
                format!("kill {name} SIGKILL"),
            ]
        );
    }

    #[tokio::test]
    async fn test_create_tag_layer_failure_classification() {
        let target = target(BaseSelector::BaseLayerId("sha1".to_string()));
        for (operation, fatal) in [("create", true), ("commit", false), ("start", true), ("kill", false)] {
            let engine = FakeEngine::new();
            engine.fail(operation);
            let err = create_tag_layer(&engine, &target).await.unwrap_err();
            assert_eq!(err.step(), Step::TagLayer);
            assert_eq!(
                matches!(err, StepError::Fatal { .. }),
                fatal,
                "{operation} failure classification"
            );
        }
    }

    #[tokio::test]
    async fn test_push_test_image_pushes_to_itself() {
        let engine = FakeEngine::new();
        let target = target(BaseSelector::BaseImage("base".to_string()));
        push_test_image(&engine, &target).await.unwrap();
        assert_eq!(
            engine.calls(),
            vec!["push h/app:latest to h/app:latest as robot"]
        );

        engine.fail("push");
        let err = push_test_image(&engine, &target).await.unwrap_err();
        assert!(matches!(
            err,
            StepError::Transient {
                step: Step::PushTest,
                ..
            }
        ));
    }
}
