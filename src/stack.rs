//! Per-mount source stack

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{MergeFsError, Result};
use crate::handle::PluginId;
use crate::plugin::PluginRegistry;
use crate::source::{Source, SourceOptions};

/// Which end of the stack a descriptor is inserted at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertPosition {
    Front,
    #[default]
    Back,
}

/// One layer to stack: which plugin to use and where its source lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Plugin GUID, name or path; None auto-detects from the locator
    pub plugin: Option<String>,
    /// Provider-specific locator (root directory, archive path, ...)
    pub locator: String,
    pub position: InsertPosition,
    pub options: SourceOptions,
}

impl SourceDescriptor {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            plugin: None,
            locator: locator.into(),
            position: InsertPosition::Back,
            options: SourceOptions::new(),
        }
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn at(mut self, position: InsertPosition) -> Self {
        self.position = position;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// One instantiated layer
pub struct Layer {
    pub plugin: PluginId,
    pub source: Arc<dyn Source>,
    pub locator: String,
}

/// Resolve a descriptor's plugin, take a mount reference on it and
/// instantiate the source. The reference is dropped again on failure.
pub async fn instantiate_layer(
    registry: &Arc<PluginRegistry>,
    descriptor: &SourceDescriptor,
) -> Result<Layer> {
    let plugin = registry.resolve(descriptor.plugin.as_deref(), &descriptor.locator)?;
    let provider = registry.acquire(plugin)?;
    let acquired = scopeguard::guard(plugin, |id| registry.release(id));

    let source = provider
        .instantiate(&descriptor.locator, &descriptor.options)
        .await
        .map_err(|e| match e {
            MergeFsError::SourceInit(msg) => MergeFsError::SourceInit(msg),
            other => MergeFsError::SourceInit(format!("{}: {}", descriptor.locator, other)),
        })?;

    let plugin = scopeguard::ScopeGuard::into_inner(acquired);
    debug!("Instantiated {} via {}", descriptor.locator, plugin);
    Ok(Layer {
        plugin,
        source,
        locator: descriptor.locator.clone(),
    })
}

/// Ordered layers of one mount, front (index 0) wins
pub struct SourceStack {
    layers: Vec<Layer>,
    registry: Arc<PluginRegistry>,
    released: AtomicBool,
}

impl SourceStack {
    /// Instantiate every descriptor, all or nothing.
    ///
    /// Front descriptors are prepended in supplied order, so the last
    /// supplied front descriptor ends up at the head; back descriptors are
    /// appended in supplied order.
    pub async fn build(
        registry: &Arc<PluginRegistry>,
        descriptors: &[SourceDescriptor],
    ) -> Result<SourceStack> {
        if descriptors.is_empty() {
            return Err(MergeFsError::InvalidArgument(
                "a mount needs at least one source".to_string(),
            ));
        }

        let mut partial = scopeguard::guard(Vec::<(InsertPosition, Layer)>::new(), |layers| {
            if !layers.is_empty() {
                warn!("Rolling back {} partially built source(s)", layers.len());
            }
            for (_, layer) in layers {
                registry.release(layer.plugin);
            }
        });

        for descriptor in descriptors {
            let layer = instantiate_layer(registry, descriptor).await?;
            partial.push((descriptor.position, layer));
        }

        let built = scopeguard::ScopeGuard::into_inner(partial);
        let mut front = Vec::new();
        let mut back = Vec::new();
        for (position, layer) in built {
            match position {
                InsertPosition::Front => front.push(layer),
                InsertPosition::Back => back.push(layer),
            }
        }
        front.reverse();
        front.extend(back);

        info!(
            "Built source stack: [{}]",
            front
                .iter()
                .map(|l| l.locator.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(SourceStack {
            layers: front,
            registry: registry.clone(),
            released: AtomicBool::new(false),
        })
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn source(&self, index: usize) -> Option<&Arc<dyn Source>> {
        self.layers.get(index).map(|l| &l.source)
    }

    /// Drop the plugin references held by this stack. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for layer in &self.layers {
            self.registry.release(layer.plugin);
        }
    }
}

impl Drop for SourceStack {
    fn drop(&mut self) {
        self.release();
    }
}
