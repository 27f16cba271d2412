//! Release image resolution
//!
//! Every release is published as an image per stemcell:
//! `<url>/<release>:<stemcell os>-<stemcell version>-<release version>`.
//! A stemcell set on the release wins over the deployment's stemcell.

use crate::model::Manifest;
use crate::{ManifestError, Result};

impl Manifest {
    /// Image of the release providing `job` in `instance_group`
    pub fn release_image(&self, instance_group: &str, job: &str) -> Result<String> {
        let ig = self.instance_group(instance_group).ok_or_else(|| {
            ManifestError::conversion(format!("instance group '{instance_group}' not found"))
        })?;
        let job = ig.job(job).ok_or_else(|| {
            ManifestError::conversion(format!(
                "job '{job}' not found in instance group '{instance_group}'"
            ))
        })?;
        let release = self.release(&job.release).ok_or_else(|| {
            ManifestError::conversion(format!(
                "release '{}' of job '{}' not found",
                job.release, job.name
            ))
        })?;

        let (os, stemcell_version) = match &release.stemcell {
            Some(stemcell) => (stemcell.os.as_str(), stemcell.version.as_str()),
            None => {
                let stemcell = self.stemcell(ig.stemcell.as_deref()).ok_or_else(|| {
                    ManifestError::conversion(format!(
                        "stemcell could not be resolved for instance group '{instance_group}'"
                    ))
                })?;
                (stemcell.os.as_str(), stemcell.version.as_str())
            }
        };

        let repository = if release.url.is_empty() {
            release.name.clone()
        } else {
            format!("{}/{}", release.url.trim_end_matches('/'), release.name)
        };
        Ok(format!(
            "{repository}:{os}-{stemcell_version}-{}",
            release.version
        ))
    }
}
