//! Local-mode build/deploy backend.
//!
//! Nothing is compiled or shipped: a build stamps an image tag under the
//! configured registry and a deploy logs where each replica group would run.

use std::time::{SystemTime, UNIX_EPOCH};

use lsf_composer::{BackendFuture, FunctionBackend};
use lsf_core::{Build, FunctionComposition};
use tracing::info;

pub struct LocalBackend {
    registry: String,
}

impl LocalBackend {
    pub fn new(registry: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
        }
    }

    pub fn image_for(&self, composition: &FunctionComposition, timestamp: u64) -> String {
        format!(
            "{}/{}:{timestamp}",
            self.registry.trim_end_matches('/'),
            composition.id
        )
    }
}

impl FunctionBackend for LocalBackend {
    fn build<'a>(
        &'a self,
        composition: &'a FunctionComposition,
    ) -> BackendFuture<'a, FunctionComposition> {
        Box::pin(async move {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let image = self.image_for(composition, timestamp);
            info!(
                composition_id = %composition.id,
                components = ?composition.components,
                %image,
                "image recorded"
            );
            let mut built = composition.clone();
            built.build = Some(Build { image, timestamp });
            Ok(built)
        })
    }

    fn deploy<'a>(&'a self, composition: &'a FunctionComposition) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let Some(build) = &composition.build else {
                anyhow::bail!("composition {} has no build", composition.id);
            };
            for deployment in &composition.deployments {
                info!(
                    deployment_id = %deployment.id,
                    node = %deployment.node,
                    namespace = %deployment.namespace,
                    image = %build.image,
                    routes = deployment.routing_table.len(),
                    "deployment rolled out"
                );
            }
            Ok(())
        })
    }
}
