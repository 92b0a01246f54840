//! Where managed resources are created and what kind they are.
use clap::Args;

use crate::cluster::ResourceKind;

/// Options selecting the managed resource kind and its namespaces.
#[derive(Args, Debug, Clone)]
pub struct TargetOpts {
    /// Namespace the resources are created in. With `--separate-namespaces`
    /// this is the prefix of the per iteration namespaces.
    #[arg(long, env = "DWLOAD_NAMESPACE", default_value = "loadtest-devworkspaces")]
    pub namespace: String,

    /// Create every resource in its own namespace.
    #[arg(long, env = "DWLOAD_SEPARATE_NAMESPACES")]
    pub separate_namespaces: bool,

    /// API group of the managed resource.
    #[arg(long, env = "DWLOAD_RESOURCE_GROUP", default_value = "workspace.devfile.io")]
    pub resource_group: String,

    /// API version of the managed resource.
    #[arg(long, env = "DWLOAD_RESOURCE_VERSION", default_value = "v1alpha2")]
    pub resource_version: String,

    /// Kind of the managed resource.
    #[arg(long, env = "DWLOAD_RESOURCE_KIND", default_value = "DevWorkspace")]
    pub resource_kind: String,

    /// Plural name of the managed resource.
    #[arg(long, env = "DWLOAD_RESOURCE_PLURAL", default_value = "devworkspaces")]
    pub resource_plural: String,
}

impl TargetOpts {
    /// Namespace layout selected by the options.
    pub fn mode(&self) -> NamespaceMode {
        if self.separate_namespaces {
            NamespaceMode::Separate {
                base: self.namespace.clone(),
            }
        } else {
            NamespaceMode::Shared(self.namespace.clone())
        }
    }

    /// Managed resource kind selected by the options.
    pub fn kind(&self) -> ResourceKind {
        ResourceKind {
            group: self.resource_group.clone(),
            version: self.resource_version.clone(),
            kind: self.resource_kind.clone(),
            plural: self.resource_plural.clone(),
        }
    }
}

/// How resources are spread over namespaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceMode {
    /// All resources live in one pre-existing namespace.
    Shared(String),
    /// Every iteration creates its own namespace named `<base>-<vu>-<iteration>`.
    Separate {
        /// Prefix of the generated namespaces
        base: String,
    },
}

impl NamespaceMode {
    /// Namespace of the resource created by an iteration.
    pub fn namespace_for(&self, vu: usize, iteration: usize) -> String {
        match self {
            NamespaceMode::Shared(namespace) => namespace.clone(),
            NamespaceMode::Separate { base } => format!("{base}-{vu}-{iteration}"),
        }
    }

    /// True when iterations create their own namespace.
    pub fn is_separate(&self) -> bool {
        matches!(self, NamespaceMode::Separate { .. })
    }
}
