//! Shared Kubernetes utilities using kube-rs

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::debug;

use crate::Error;

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "kubebosh-operator";

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so the value is stable across toolchains and can
/// be persisted in names, labels and status fields.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Decode the data of a Secret into UTF-8 strings
///
/// `stringData` entries win over `data` entries with the same key, matching
/// how the API server merges them on write.
pub fn secret_string_data(secret: &Secret) -> Result<BTreeMap<String, String>, Error> {
    let name = secret.metadata.name.as_deref().unwrap_or_default();
    let mut out = BTreeMap::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            let text = String::from_utf8(value.0.clone()).map_err(|e| {
                Error::serialization_for_kind("Secret", format!("{name}/{key}: {e}"))
            })?;
            out.insert(key.clone(), text);
        }
    }
    if let Some(data) = &secret.string_data {
        out.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Ok(out)
}

/// Encode string data as Secret `data`
pub fn to_secret_data(data: &BTreeMap<String, String>) -> BTreeMap<String, ByteString> {
    data.iter()
        .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
        .collect()
}

// =============================================================================
// ApplyBatch: parallel server-side apply
// =============================================================================

type ApplyFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send>>;

/// Collects server-side-apply operations and runs them in parallel.
///
/// Resources go through `DynamicObject` with an explicit `ApiResource`. For
/// native types, construct it with `ApiResource::erase::<T>(&())`.
pub struct ApplyBatch<'a> {
    client: Client,
    futures: Vec<ApplyFuture>,
    namespace: &'a str,
    params: &'a PatchParams,
}

impl<'a> ApplyBatch<'a> {
    /// Create a new batch targeting `namespace` with the given `PatchParams`.
    pub fn new(client: Client, namespace: &'a str, params: &'a PatchParams) -> Self {
        Self {
            client,
            futures: Vec::new(),
            namespace,
            params,
        }
    }

    /// Serialize a typed resource and queue a server-side-apply patch.
    pub fn push(
        &mut self,
        kind: &str,
        name: &str,
        resource: &impl serde::Serialize,
        ar: &ApiResource,
    ) -> Result<(), Error> {
        let mut json = serde_json::to_value(resource)
            .map_err(|e| Error::serialization_for_kind(kind, e.to_string()))?;
        if let Some(obj) = json.as_object_mut() {
            obj.insert(
                "apiVersion".to_string(),
                serde_json::Value::String(ar.api_version.clone()),
            );
            obj.insert(
                "kind".to_string(),
                serde_json::Value::String(ar.kind.clone()),
            );
        }

        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), self.namespace, ar);
        let params = self.params.clone();
        let name = name.to_string();
        let kind = kind.to_string();
        self.futures.push(Box::pin(async move {
            debug!(name = %name, kind = %kind, "applying resource");
            api.patch(&name, &params, &Patch::Apply(&json)).await?;
            Ok(())
        }));
        Ok(())
    }

    /// Number of queued patches
    pub fn len(&self) -> usize {
        self.futures.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    /// Execute all queued patches in parallel, returning the count applied.
    pub async fn run(self, layer: &str) -> Result<usize, Error> {
        use futures::future::join_all;

        let count = self.futures.len();
        if count == 0 {
            return Ok(0);
        }

        debug!(count, layer, "applying resources in parallel");
        let results = join_all(self.futures).await;

        let mut errors: Vec<_> = results.into_iter().filter_map(|r| r.err()).collect();
        if !errors.is_empty() {
            for (i, err) in errors.iter().enumerate() {
                tracing::error!(error = %err, index = i, layer, "resource application failed");
            }
            return Err(errors.swap_remove(0));
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn hash_is_stable_and_sixteen_hex_chars() {
        let a = deterministic_hash("nats.var-nats-password");
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, deterministic_hash("nats.var-nats-password"));
        assert_ne!(a, deterministic_hash("nats.var-nats-password2"));
    }

    #[test]
    fn secret_data_round_trips_and_string_data_wins() {
        let mut data = BTreeMap::new();
        data.insert("password".to_string(), "hunter2".to_string());
        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some("s".into()),
                ..Default::default()
            },
            data: Some(to_secret_data(&data)),
            ..Default::default()
        };
        assert_eq!(secret_string_data(&secret).unwrap(), data);

        let mut overlay = BTreeMap::new();
        overlay.insert("password".to_string(), "override".to_string());
        secret.string_data = Some(overlay);
        assert_eq!(secret_string_data(&secret).unwrap()["password"], "override");
    }

    #[test]
    fn non_utf8_secret_data_is_a_serialization_error() {
        let mut data = BTreeMap::new();
        data.insert("bin".to_string(), ByteString(vec![0xff, 0xfe]));
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };
        assert!(matches!(
            secret_string_data(&secret),
            Err(Error::Serialization { .. })
        ));
    }
}
