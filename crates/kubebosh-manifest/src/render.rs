//! Job template rendering
//!
//! Runs inside the renderer init container. The spec copiers have placed
//! each job's `job.MF` and `templates/` under `<jobs dir>/jobs-src/<release>/<job>`;
//! the resolved properties of the instance group carry the instances and
//! links. Each template listed in `job.MF` is rendered with minijinja into
//! `<output dir>/<job>/<destination>`.
//!
//! Templates see `spec` (the [`RenderContext`]) and two functions:
//! `p("dotted.key", default?)` and `link("name")`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use minijinja::{context, Environment, ErrorKind, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::converter::containers::job_spec_dir;
use crate::model::{Job, JobInstance, JobLink, Manifest};
use crate::{ManifestError, Result};

/// File name of a job's spec inside its spec directory
pub const JOB_SPEC_FILE: &str = "job.MF";

/// Directory of a job's templates inside its spec directory
pub const TEMPLATES_DIR: &str = "templates";

// =============================================================================
// Job spec
// =============================================================================

/// The parts of `job.MF` rendering needs
#[derive(Clone, Debug, Default, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub name: String,
    /// Template source file to destination path
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDefinition>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PropertyDefinition {
    #[serde(default)]
    pub default: Option<Value>,
}

impl JobSpec {
    pub fn from_yaml(source_name: &str, text: &str) -> Result<Self> {
        let value = kubebosh_common::yaml::parse_yaml(text)
            .map_err(|e| ManifestError::parse(source_name, e))?;
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value).map_err(|e| ManifestError::parse(source_name, e))
    }
}

// =============================================================================
// Render context
// =============================================================================

/// Flatten nested properties into dotted keys
///
/// Inner nodes are kept as well, so `p("nats")` returns the whole sub-tree.
pub fn flatten_properties(properties: &Map<String, Value>) -> BTreeMap<String, Value> {
    fn walk(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
        out.insert(prefix.to_string(), value.clone());
        if let Value::Object(map) = value {
            for (key, child) in map {
                walk(&format!("{prefix}.{key}"), child, out);
            }
        }
    }

    let mut out = BTreeMap::new();
    for (key, value) in properties {
        walk(key, value, &mut out);
    }
    out
}

/// A consumed link as a template sees it
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RenderLink {
    pub name: String,
    pub instances: Vec<JobInstance>,
    pub properties: BTreeMap<String, Value>,
}

/// What one job instance renders against
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RenderContext {
    pub address: String,
    pub az: String,
    pub id: String,
    pub index: usize,
    pub name: String,
    pub bootstrap: bool,
    /// Job properties with `job.MF` defaults filled in, by dotted key
    pub properties: BTreeMap<String, Value>,
    pub links: Vec<RenderLink>,
}

impl RenderContext {
    pub fn new(
        job: &Job,
        instance: &JobInstance,
        links: &BTreeMap<String, JobLink>,
        spec: &JobSpec,
    ) -> Self {
        let mut properties = flatten_properties(&job.user_properties());
        for (key, definition) in &spec.properties {
            if let Some(default) = &definition.default {
                properties
                    .entry(key.clone())
                    .or_insert_with(|| default.clone());
            }
        }

        Self {
            address: instance.address.clone(),
            az: instance.az.clone(),
            id: instance.id.clone(),
            index: instance.index,
            name: instance.name.clone(),
            bootstrap: instance.bootstrap,
            properties,
            links: links
                .iter()
                .map(|(name, link)| RenderLink {
                    name: name.clone(),
                    instances: link.instances.clone(),
                    properties: flatten_properties(&link.properties),
                })
                .collect(),
        }
    }

    /// Render one template source
    pub fn render(&self, template_name: &str, source: &str) -> Result<String> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        let properties = Arc::new(self.properties.clone());
        env.add_function(
            "p",
            move |key: String, default: Option<minijinja::Value>| match properties.get(&key) {
                Some(value) => Ok(minijinja::Value::from_serialize(value)),
                None => default.ok_or_else(|| {
                    minijinja::Error::new(
                        ErrorKind::UndefinedError,
                        format!("property '{key}' is not set"),
                    )
                }),
            },
        );

        let links = Arc::new(self.links.clone());
        env.add_function("link", move |name: String| {
            links
                .iter()
                .find(|l| l.name == name)
                .map(minijinja::Value::from_serialize)
                .ok_or_else(|| {
                    minijinja::Error::new(
                        ErrorKind::UndefinedError,
                        format!("link '{name}' is not consumed"),
                    )
                })
        });

        env.render_str(source, context! { spec => self })
            .map_err(|e| ManifestError::render(template_name, format!("{e:#}")))
    }
}

// =============================================================================
// Renderer
// =============================================================================

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| ManifestError::render(path.display().to_string(), e))
}

/// Renders the jobs of one instance group for one pod
pub struct TemplateRenderer {
    jobs_dir: PathBuf,
    output_dir: PathBuf,
}

impl TemplateRenderer {
    pub fn new(jobs_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Render every job of `instance_group` for the pod at `spec_index` in
    /// zone `az_index`, returning the written files
    pub fn render_instance_group(
        &self,
        manifest: &Manifest,
        instance_group: &str,
        spec_index: u32,
        az_index: usize,
    ) -> Result<Vec<PathBuf>> {
        let ig = manifest.instance_group(instance_group).ok_or_else(|| {
            ManifestError::render(
                instance_group,
                format!("instance group '{instance_group}' not found in resolved properties"),
            )
        })?;
        let index = ig.instance_index(spec_index, az_index);
        info!(instance_group, index, "rendering job templates");

        let mut written = Vec::new();
        for job in &ig.jobs {
            let containerization = job.containerization()?;
            let instance = containerization
                .instances
                .iter()
                .find(|i| i.index == index)
                .ok_or_else(|| {
                    ManifestError::render(
                        &job.name,
                        format!("no instance with index {index}"),
                    )
                })?;
            written.extend(self.render_job(job, instance, &containerization.consumes)?);
        }
        Ok(written)
    }

    fn render_job(
        &self,
        job: &Job,
        instance: &JobInstance,
        links: &BTreeMap<String, JobLink>,
    ) -> Result<Vec<PathBuf>> {
        let spec_dir = PathBuf::from(job_spec_dir(
            &self.jobs_dir.to_string_lossy(),
            &job.release,
            &job.name,
        ));
        let spec_path = spec_dir.join(JOB_SPEC_FILE);
        let spec = JobSpec::from_yaml(&spec_path.to_string_lossy(), &read(&spec_path)?)?;
        let context = RenderContext::new(job, instance, links, &spec);

        let mut written = Vec::with_capacity(spec.templates.len());
        for (source, destination) in &spec.templates {
            let template = read(&spec_dir.join(TEMPLATES_DIR).join(source))?;
            let rendered = context.render(source, &template)?;

            let target = self.output_dir.join(&job.name).join(destination);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ManifestError::render(source, e))?;
            }
            std::fs::write(&target, rendered).map_err(|e| ManifestError::render(source, e))?;
            debug!(job = %job.name, target = %target.display(), "rendered template");
            written.push(target);
        }
        Ok(written)
    }
}
