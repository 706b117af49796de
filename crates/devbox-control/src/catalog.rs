//! Shared data sources a tunnel can reach.
//!
//! The built-in catalog lists the organisation's shared databases; entries in
//! the config document's `sources` table replace built-ins with the same id
//! or add new ones.

use std::collections::BTreeMap;

use devbox_core::{Provider, SourceId};
use devbox_store::{DevboxConfig, SourceDefinition};

/// Credential reference used by every built-in source.
pub const DEFAULT_CREDENTIALS_REF: &str = "ssh-key:~/.ssh/platform_bastion_key";

/// The data sources known to this invocation.
#[derive(Debug, Clone)]
pub struct Catalog {
    sources: BTreeMap<SourceId, SourceDefinition>,
}

impl Catalog {
    /// The built-in shared sources.
    #[must_use]
    pub fn builtin() -> Self {
        let sources = [
            builtin(
                "aws-postgres",
                Provider::Aws,
                "Shared PostgreSQL instance with sample datasets",
                "bastion-aws.platform.internal",
                "postgres-shared.platform.internal",
                5432,
                5432,
            ),
            builtin(
                "aws-mysql",
                Provider::Aws,
                "Shared MySQL instance for compatibility testing",
                "bastion-aws.platform.internal",
                "mysql-shared.platform.internal",
                3306,
                3306,
            ),
            builtin(
                "gcp-postgres",
                Provider::Gcp,
                "Shared Cloud SQL PostgreSQL instance",
                "bastion-gcp.platform.internal",
                "postgres-gcp.platform.internal",
                5432,
                5433,
            ),
            builtin(
                "azure-synapse",
                Provider::Azure,
                "Shared Azure Synapse for data warehouse testing",
                "bastion-azure.platform.internal",
                "synapse-shared.platform.internal",
                1433,
                1433,
            ),
        ]
        .into_iter()
        .flatten()
        .map(|source| (source.source_id.clone(), source))
        .collect();
        Self { sources }
    }

    /// The built-in sources with the config's overrides applied.
    #[must_use]
    pub fn from_config(config: &DevboxConfig) -> Self {
        let mut catalog = Self::builtin();
        for source in config.sources.values() {
            catalog
                .sources
                .insert(source.source_id.clone(), source.clone());
        }
        catalog
    }

    /// Look up a source.
    #[must_use]
    pub fn get(&self, source_id: &SourceId) -> Option<&SourceDefinition> {
        self.sources.get(source_id)
    }

    /// All sources, ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &SourceDefinition> {
        self.sources.values()
    }

    /// Number of sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true if the catalog has no sources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

fn builtin(
    id: &str,
    provider: Provider,
    description: &str,
    bastion_host: &str,
    target_host: &str,
    remote_port: u16,
    local_port: u16,
) -> Option<SourceDefinition> {
    let source_id = SourceId::parse(id).ok()?;
    Some(SourceDefinition {
        source_id,
        provider,
        description: description.to_string(),
        bastion_host: bastion_host.to_string(),
        target_host: target_host.to_string(),
        remote_port,
        local_port,
        credentials_ref: DEFAULT_CREDENTIALS_REF.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SourceId {
        SourceId::parse(s).unwrap()
    }

    #[test]
    fn builtin_sources() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.len(), 4);
        let postgres = catalog.get(&id("aws-postgres")).unwrap();
        assert_eq!(postgres.provider, Provider::Aws);
        assert_eq!(postgres.local_port, 5432);
        assert_eq!(catalog.get(&id("gcp-postgres")).unwrap().local_port, 5433);
        assert!(catalog.get(&id("aws-s3")).is_none());
    }

    #[test]
    fn config_overrides_and_adds() {
        let mut config = DevboxConfig::default();
        let mut postgres = Catalog::builtin().get(&id("aws-postgres")).unwrap().clone();
        postgres.local_port = 15432;
        config.sources.insert("aws-postgres".into(), postgres);
        let mut extra = Catalog::builtin().get(&id("aws-mysql")).unwrap().clone();
        extra.source_id = id("eu-mysql");
        config.sources.insert("eu-mysql".into(), extra);

        let catalog = Catalog::from_config(&config);
        assert_eq!(catalog.len(), 5);
        assert_eq!(catalog.get(&id("aws-postgres")).unwrap().local_port, 15432);
        assert!(catalog.get(&id("eu-mysql")).is_some());
    }
}
