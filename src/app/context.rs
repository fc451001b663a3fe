use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::{
    app::service::AppService,
    config::Config,
    graph::{GraphEngine, ZkCli},
    semantic::{EmbeddingModel, IndexStore, SearchSettings, TimeoutEmbedder},
    vault::Vault,
};

/// Everything one vault needs, wired once per process.
pub struct AppContext {
    config: Config,
    service: Arc<AppService>,
}

impl AppContext {
    pub fn new(config: Config, service: AppService) -> Self {
        Self {
            config,
            service: Arc::new(service),
        }
    }

    /// Read the vault's config and bring up the graph engine and the index.
    ///
    /// A model that fails to load leaves the index unavailable; the process
    /// still starts and search answers from keyword matches.
    pub fn load(vault_root: &Path) -> anyhow::Result<Self> {
        let config = Config::load_with(vault_root)?;

        let vault = Arc::new(
            Vault::new(vault_root, &config)
                .with_context(|| format!("cannot open vault {}", vault_root.display()))?,
        );
        let root = vault.root().to_path_buf();

        let graph: Arc<dyn GraphEngine> = Arc::new(ZkCli::new(&root, &config.graph));
        let index = Arc::new(open_index(&root, &config));

        log::info!(
            "vault {} ready (index {})",
            root.display(),
            index.state_label()
        );

        Ok(Self::new(config, AppService::new(vault, graph, index)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn service(&self) -> Arc<AppService> {
        self.service.clone()
    }
}

fn open_index(root: &Path, config: &Config) -> IndexStore {
    let index_path = Config::index_path(root);
    let settings = &config.index;

    if !settings.enabled {
        return IndexStore::disabled("semantic index disabled in config", index_path);
    }

    let model = match EmbeddingModel::new(
        &settings.model,
        Config::models_dir(root),
        Some(Duration::from_secs(settings.download_timeout_secs)),
    ) {
        Ok(model) => model,
        Err(e) => {
            log::warn!("embedding model '{}' unavailable: {e}", settings.model);
            return IndexStore::disabled(&e.to_string(), index_path);
        }
    };

    let embedder = Arc::new(TimeoutEmbedder::new(
        Arc::new(model),
        Duration::from_secs(settings.embed_timeout_secs),
    ));

    IndexStore::open(
        embedder,
        index_path,
        SearchSettings {
            semantic_weight: settings.semantic_weight,
            min_score: settings.min_score,
        },
    )
}
