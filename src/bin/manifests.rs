//! Manifest tool
//!
//! Applies, lists and deletes the built-in objects described by YAML files.
//!
//! Usage:
//!   manifests apply yaml/namespace.yaml yaml/deployment.yaml
//!   manifests list deployment --namespace k8s-test
//!   manifests delete deployment svc-cloud-resourceserver --namespace k8s-test

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use kube::api::PropagationPolicy;
use kube::Client;
use tracing_subscriber::EnvFilter;

use deployment_service_controller::manifests::{Applied, Manifest, ManifestKind, Manifests};

#[derive(Parser, Debug)]
#[command(name = "manifests", version, about = "Create, list and delete objects from YAML manifests")]
struct Cli {
    /// Namespace for namespaced objects whose manifest does not name one
    #[arg(short, long, global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create each object, or update it when it already exists
    Apply {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List object names of a kind
    List {
        #[arg(value_enum)]
        kind: ManifestKind,
    },
    /// Delete an object by name
    Delete {
        #[arg(value_enum)]
        kind: ManifestKind,
        name: String,
        /// How dependents are cleaned up
        #[arg(long, value_enum, default_value_t = Propagation::Foreground)]
        propagation: Propagation,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Propagation {
    Foreground,
    Background,
    Orphan,
}

impl From<Propagation> for PropagationPolicy {
    fn from(value: Propagation) -> Self {
        match value {
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Orphan => PropagationPolicy::Orphan,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kube=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let client = Client::try_default().await?;
    let manifests = Manifests::new(client, cli.namespace);

    match cli.command {
        Command::Apply { files } => {
            for file in files {
                let manifest = Manifest::from_file(&file)?;
                let (kind, name) = (manifest.kind, manifest.name.clone());
                let applied = manifests
                    .apply(manifest)
                    .await
                    .with_context(|| format!("applying {}", file.display()))?;
                let verb = match applied {
                    Applied::Created => "created",
                    Applied::Updated => "updated",
                };
                println!("{:?}/{} {}", kind, name, verb);
            }
        }
        Command::List { kind } => {
            for name in manifests.list(kind).await? {
                println!("{}", name);
            }
        }
        Command::Delete {
            kind,
            name,
            propagation,
        } => {
            manifests.delete(kind, &name, propagation.into()).await?;
            println!("{:?}/{} deleted", kind, name);
        }
    }

    Ok(())
}
