//! Variable generation
//!
//! Every variable of a manifest is stored as the plain secret
//! `<deployment>.var-<variable>`. Secrets are created once and never
//! regenerated, so rotating a credential means deleting its secret.
//!
//! - `password`: 64 random alphanumeric characters
//! - `rsa`: 2048-bit RSA key pair as PEM
//! - `ssh`: RSA key pair plus an OpenSSH public key and fingerprint
//! - `certificate`: RSA key and X.509 certificate, self-signed or signed by
//!   the CA stored in another certificate variable

use std::collections::BTreeMap;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
};
use serde_json::Value;
use tracing::{debug, info};
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

use kubebosh_common::kube_utils::deterministic_hash;
use kubebosh_common::names::variable_secret_name;
use kubebosh_common::versioned_secret::{
    SecretContent, SecretScope, VersionedSecretStore, LABEL_SECRET_KIND, SECRET_KIND_VARIABLE,
};

use crate::model::{ExtendedKeyUsage, Manifest, Variable, VariableType};
use crate::{ManifestError, Result};

/// Length of generated passwords
pub const PASSWORD_LENGTH: usize = 64;

/// Validity of leaf certificates in years
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Validity of CA certificates in years
pub const CA_VALIDITY_YEARS: i64 = 10;

pub const KEY_PASSWORD: &str = "password";
pub const KEY_PRIVATE_KEY: &str = "private_key";
pub const KEY_PUBLIC_KEY: &str = "public_key";
pub const KEY_PUBLIC_KEY_FINGERPRINT: &str = "public_key_fingerprint";
pub const KEY_CERTIFICATE: &str = "certificate";
pub const KEY_CA: &str = "ca";

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

// =============================================================================
// Material
// =============================================================================

/// Certificate and key of a signing CA
#[derive(Clone, Debug, PartialEq)]
pub struct CaMaterial {
    pub certificate: String,
    pub private_key: String,
}

/// Generate the secret data of one variable
///
/// `ca` must be given for certificates whose options name a CA.
pub fn generate_material(
    variable: &Variable,
    ca: Option<&CaMaterial>,
) -> Result<BTreeMap<String, String>> {
    match variable.type_ {
        VariableType::Password => {
            let mut data = BTreeMap::new();
            data.insert(KEY_PASSWORD.to_string(), generate_password());
            Ok(data)
        }
        VariableType::Rsa => generate_rsa(&variable.name),
        VariableType::Ssh => generate_ssh(&variable.name),
        VariableType::Certificate => generate_certificate(variable, ca),
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

fn rsa_key(variable: &str) -> Result<KeyPair> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .map_err(|e| {
            ManifestError::generation(variable, format!("failed to generate RSA key: {e}"))
        })
}

fn generate_rsa(variable: &str) -> Result<BTreeMap<String, String>> {
    let key = rsa_key(variable)?;
    let mut data = BTreeMap::new();
    data.insert(KEY_PRIVATE_KEY.to_string(), key.serialize_pem());
    data.insert(KEY_PUBLIC_KEY.to_string(), key.public_key_pem());
    Ok(data)
}

fn generate_ssh(variable: &str) -> Result<BTreeMap<String, String>> {
    let key = rsa_key(variable)?;
    let blob = ssh_public_key_blob(&key.subject_public_key_info())
        .map_err(|e| ManifestError::generation(variable, e))?;
    let fingerprint = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, &blob);

    let mut data = BTreeMap::new();
    data.insert(KEY_PRIVATE_KEY.to_string(), key.serialize_pem());
    data.insert(
        KEY_PUBLIC_KEY.to_string(),
        format!("ssh-rsa {}", STANDARD.encode(&blob)),
    );
    data.insert(
        KEY_PUBLIC_KEY_FINGERPRINT.to_string(),
        format!("SHA256:{}", STANDARD_NO_PAD.encode(fingerprint.as_ref())),
    );
    Ok(data)
}

/// OpenSSH wire encoding of an RSA public key given as SubjectPublicKeyInfo
fn ssh_public_key_blob(spki_der: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(spki_der)
        .map_err(|e| format!("failed to parse public key: {e}"))?;
    let (modulus, exponent) = match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => (rsa.modulus.to_vec(), rsa.exponent.to_vec()),
        Ok(_) => return Err("public key is not an RSA key".to_string()),
        Err(e) => return Err(format!("failed to parse public key: {e}")),
    };

    let mut blob = Vec::new();
    write_ssh_string(&mut blob, b"ssh-rsa");
    write_ssh_string(&mut blob, &mpint(&exponent));
    write_ssh_string(&mut blob, &mpint(&modulus));
    Ok(blob)
}

fn write_ssh_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Two's complement big-endian integer without redundant leading zeros
fn mpint(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let trimmed = &bytes[start..];
    let mut out = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.first().is_some_and(|b| b & 0x80 != 0) {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

fn generate_certificate(
    variable: &Variable,
    ca: Option<&CaMaterial>,
) -> Result<BTreeMap<String, String>> {
    let name = variable.name.as_str();
    let options = variable.options.clone().unwrap_or_default();
    if options.ca.is_some() && ca.is_none() {
        return Err(ManifestError::generation(name, "signing CA material not provided"));
    }

    let mut params = CertificateParams::default();

    let common_name = if options.common_name.is_empty() {
        name.to_string()
    } else {
        options.common_name.clone()
    };
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name));
    params.distinguished_name = dn;

    let years = if options.is_ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        CA_VALIDITY_YEARS
    } else {
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        CERT_VALIDITY_YEARS
    };

    params.extended_key_usages = options
        .extended_key_usage
        .iter()
        .map(|usage| match usage {
            ExtendedKeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
        })
        .collect();

    let (not_before, not_after) = compute_validity(years);
    params.not_before = not_before;
    params.not_after = not_after;

    params.subject_alt_names = options
        .alternative_names
        .iter()
        .map(|san| {
            if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(san.to_string())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        ManifestError::generation(name, format!("invalid DNS name '{san}': {e}"))
                    })
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let key = rsa_key(name)?;
    let key_pem = key.serialize_pem();

    let (certificate, ca_certificate) = match ca {
        Some(ca) => {
            let ca_key = KeyPair::from_pem(&ca.private_key).map_err(|e| {
                ManifestError::generation(name, format!("failed to parse CA key: {e}"))
            })?;
            let issuer = Issuer::from_ca_cert_pem(&ca.certificate, &ca_key).map_err(|e| {
                ManifestError::generation(name, format!("failed to create issuer: {e}"))
            })?;
            let cert = params.signed_by(&key, &issuer).map_err(|e| {
                ManifestError::generation(name, format!("failed to sign certificate: {e}"))
            })?;
            (cert.pem(), ca.certificate.clone())
        }
        None => {
            let cert = params.self_signed(&key).map_err(|e| {
                ManifestError::generation(name, format!("failed to create certificate: {e}"))
            })?;
            let pem = cert.pem();
            (pem.clone(), pem)
        }
    };

    let mut data = BTreeMap::new();
    data.insert(KEY_CERTIFICATE.to_string(), certificate);
    data.insert(KEY_PRIVATE_KEY.to_string(), key_pem);
    data.insert(KEY_CA.to_string(), ca_certificate);
    Ok(data)
}

// =============================================================================
// Generator
// =============================================================================

/// Outcome for one variable
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratedVariable {
    pub variable: String,
    pub secret_name: String,
    /// Whether this run created the secret
    pub created: bool,
}

/// Values of all variables of a manifest, ready for interpolation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadedVariables {
    pub values: BTreeMap<String, Value>,
    /// Hash over the resourceVersions of the variable secrets
    pub digest: String,
}

/// Generates and loads variable secrets
#[derive(Clone)]
pub struct VariableGenerator {
    store: VersionedSecretStore,
}

impl VariableGenerator {
    pub fn new(store: VersionedSecretStore) -> Self {
        Self { store }
    }

    /// Create the secret of every variable that does not have one yet
    ///
    /// Variables are processed in manifest order, so a certificate may name
    /// a CA variable declared before it.
    pub async fn generate(
        &self,
        scope: &SecretScope,
        manifest: &Manifest,
    ) -> Result<Vec<GeneratedVariable>> {
        let mut outcomes = Vec::with_capacity(manifest.variables.len());
        for variable in &manifest.variables {
            let secret_name = variable_secret_name(&scope.deployment, &variable.name);
            if self
                .store
                .get_secret(&scope.namespace, &secret_name)
                .await?
                .is_some()
            {
                debug!(
                    variable = %variable.name,
                    secret = %secret_name,
                    "variable already generated"
                );
                outcomes.push(GeneratedVariable {
                    variable: variable.name.clone(),
                    secret_name,
                    created: false,
                });
                continue;
            }

            let ca = self.signing_ca(scope, variable).await?;
            let data = generate_material(variable, ca.as_ref())?;
            let content = SecretContent::from_data(data)
                .with_label(LABEL_SECRET_KIND, SECRET_KIND_VARIABLE)
                .described(format!(
                    "{} variable '{}' of deployment '{}'",
                    variable.type_, variable.name, scope.deployment
                ));
            let (_, created) = self.store.create_once(scope, &secret_name, &content).await?;
            if created {
                info!(
                    variable = %variable.name,
                    secret = %secret_name,
                    type_ = %variable.type_,
                    "generated variable"
                );
            }
            outcomes.push(GeneratedVariable {
                variable: variable.name.clone(),
                secret_name,
                created,
            });
        }
        Ok(outcomes)
    }

    async fn signing_ca(
        &self,
        scope: &SecretScope,
        variable: &Variable,
    ) -> Result<Option<CaMaterial>> {
        let Some(ca_name) = variable.options.as_ref().and_then(|o| o.ca.as_deref()) else {
            return Ok(None);
        };
        let secret_name = variable_secret_name(&scope.deployment, ca_name);
        let secret = self
            .store
            .get_secret(&scope.namespace, &secret_name)
            .await?
            .ok_or_else(|| {
                ManifestError::generation(
                    &variable.name,
                    format!("CA variable '{ca_name}' has not been generated"),
                )
            })?;
        let field = |key: &str| {
            secret.data.get(key).cloned().ok_or_else(|| {
                ManifestError::generation(
                    &variable.name,
                    format!("CA variable '{ca_name}' has no {key}"),
                )
            })
        };
        Ok(Some(CaMaterial {
            certificate: field(KEY_CERTIFICATE)?,
            private_key: field(KEY_PRIVATE_KEY)?,
        }))
    }

    /// Read every variable secret of `manifest`
    ///
    /// Passwords load as strings, other types as maps of their keys.
    pub async fn load(&self, scope: &SecretScope, manifest: &Manifest) -> Result<LoadedVariables> {
        let mut values = BTreeMap::new();
        let mut versions = Vec::with_capacity(manifest.variables.len());
        for variable in &manifest.variables {
            let secret_name = variable_secret_name(&scope.deployment, &variable.name);
            let secret = self
                .store
                .get_secret(&scope.namespace, &secret_name)
                .await?
                .ok_or_else(|| {
                    ManifestError::generation(&variable.name, "variable secret does not exist")
                })?;
            versions.push(format!("{}={}", secret.name, secret.resource_version));

            let value = match variable.type_ {
                VariableType::Password => secret
                    .data
                    .get(KEY_PASSWORD)
                    .cloned()
                    .map(Value::String)
                    .ok_or_else(|| ManifestError::generation(&variable.name, "missing password"))?,
                _ => Value::Object(
                    secret
                        .data
                        .into_iter()
                        .map(|(k, v)| (k, Value::String(v)))
                        .collect(),
                ),
            };
            values.insert(variable.name.clone(), value);
        }
        Ok(LoadedVariables {
            values,
            digest: deterministic_hash(&versions.join(",")),
        })
    }
}
