//! Runs in the renderer init container of every instance group pod. The
//! converter sets the environment; flags override it for local debugging.

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use kubebosh_manifest::render::TemplateRenderer;
use kubebosh_manifest::Manifest;

/// Inputs of `util template-render`
#[derive(Args, Clone, Debug)]
pub struct TemplateRenderArgs {
    /// Instance group whose jobs are rendered
    #[arg(long, env = "INSTANCE_GROUP_NAME")]
    pub instance_group_name: String,

    /// Resolved properties of the instance group
    #[arg(long, env = "BOSH_MANIFEST_PATH")]
    pub bosh_manifest_path: PathBuf,

    /// Directory the spec copiers placed job specs and templates in
    #[arg(long, env = "JOBS_DIR")]
    pub jobs_dir: PathBuf,

    /// Directory rendered files are written to
    #[arg(long, env = "OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// Pod ordinal within its zone
    #[arg(long, env = "SPEC_INDEX", default_value_t = 0)]
    pub spec_index: u32,

    /// Zone index of the pod's StatefulSet
    #[arg(long, env = "AZ_INDEX", default_value_t = 0)]
    pub az_index: usize,
}

/// Render all job templates of one pod, returning the files written
pub fn run(args: &TemplateRenderArgs) -> anyhow::Result<Vec<PathBuf>> {
    let text = std::fs::read_to_string(&args.bosh_manifest_path).map_err(|e| {
        anyhow::anyhow!(
            "failed to read resolved properties {}: {e}",
            args.bosh_manifest_path.display()
        )
    })?;
    let manifest = Manifest::from_yaml(&args.bosh_manifest_path.to_string_lossy(), &text)?;

    let written = TemplateRenderer::new(&args.jobs_dir, &args.output_dir).render_instance_group(
        &manifest,
        &args.instance_group_name,
        args.spec_index,
        args.az_index,
    )?;
    info!(
        instance_group = %args.instance_group_name,
        files = written.len(),
        "rendered job templates"
    );
    Ok(written)
}
