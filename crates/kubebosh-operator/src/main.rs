//! kubebosh operator - deploys BOSH manifests onto Kubernetes

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;

use kubebosh_common::config::OperatorConfig;
use kubebosh_common::config_source::KubeConfigSource;
use kubebosh_common::registry::ResourceRegistry;
use kubebosh_common::telemetry::{init_telemetry, TelemetryConfig};
use kubebosh_operator::controller_runner::{
    build_deployment_controllers, build_extended_job_controllers,
};
use kubebosh_operator::crds::{crds_yaml, ensure_crds_installed};
use kubebosh_operator::template_render::{self, TemplateRenderArgs};
use kubebosh_operator::webhook::{self, WebhookState};

/// kubebosh - reconciles BoshDeployments into StatefulSets, ExtendedJobs and Services
#[derive(Parser, Debug)]
#[command(name = "kubebosh-operator", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers and, when a certificate is configured, the
    /// admission webhook
    Controller(OperatorConfig),

    /// Print the CRD manifests and exit
    Crd,

    /// Helpers run inside workload pods
    Util {
        #[command(subcommand)]
        command: UtilCommands,
    },
}

#[derive(Subcommand, Debug)]
enum UtilCommands {
    /// Render the job templates of one instance group pod
    TemplateRender(TemplateRenderArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // aws-lc-rs backs both the kube client and the webhook TLS server
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Crd => {
            print!("{}", crds_yaml()?);
            Ok(())
        }
        Commands::Util {
            command: UtilCommands::TemplateRender(args),
        } => {
            init_telemetry(TelemetryConfig::default())?;
            template_render::run(&args)?;
            Ok(())
        }
        Commands::Controller(config) => {
            init_telemetry(TelemetryConfig::default())?;
            run_controller(config).await
        }
    }
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!(
        namespace = config.watch_namespace().unwrap_or("<all>"),
        ctx_timeout_secs = config.ctx_timeout_secs,
        "kubebosh controller starting"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    ensure_crds_installed(&client).await?;

    let config = Arc::new(config);
    let registry = Arc::new(ResourceRegistry::new());

    match (&config.webhook_cert, &config.webhook_key) {
        (Some(cert), Some(key)) => {
            let state = Arc::new(WebhookState {
                configs: Arc::new(KubeConfigSource::new(client.clone())),
            });
            let (addr, cert, key) = (config.webhook_addr, cert.clone(), key.clone());
            tokio::spawn(async move {
                if let Err(e) = webhook::serve(addr, &cert, &key, state).await {
                    tracing::error!(error = %e, "admission webhook stopped");
                }
            });
        }
        _ => tracing::info!("no webhook certificate configured, admission webhook disabled"),
    }

    tracing::info!("Starting kubebosh controllers...");
    let mut controllers =
        build_deployment_controllers(client.clone(), config.clone(), registry);
    controllers.extend(build_extended_job_controllers(client, config));

    futures::future::join_all(controllers).await;

    tracing::info!("kubebosh controller shutting down");
    Ok(())
}
