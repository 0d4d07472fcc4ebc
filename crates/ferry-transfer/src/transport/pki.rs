//! Self-signed TLS material for the stunnel tunnel
//!
//! One RSA-4096 certificate is generated per transfer. It is both the leaf
//! certificate presented by each tunnel end and the CA the other end may
//! verify against.

use std::collections::BTreeMap;

use ferry_common::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
    KeyUsagePurpose, RsaKeySize, PKCS_RSA_SHA256,
};

/// Validity of the generated certificate
pub const VALIDITY_YEARS: i64 = 10;

/// Secret key holding the certificate
pub const TLS_CRT_KEY: &str = "tls.crt";
/// Secret key holding the private key
pub const TLS_KEY_KEY: &str = "tls.key";
/// Secret key holding the CA bundle
pub const CA_CRT_KEY: &str = "ca.crt";

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

/// PEM-encoded certificate, key and CA bundle
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    /// CA bundle (the certificate itself)
    pub ca_crt: Vec<u8>,
    /// Certificate
    pub tls_crt: Vec<u8>,
    /// Private key
    pub tls_key: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_crt", &format_args!("{} bytes", self.ca_crt.len()))
            .field("tls_crt", &format_args!("{} bytes", self.tls_crt.len()))
            .field("tls_key", &"<redacted>")
            .finish()
    }
}

impl TlsMaterial {
    /// Generate a self-signed RSA-4096 certificate for `common_name`
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("ferry".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let (not_before, not_after) = compute_validity(VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_4096)
            .map_err(|e| Error::certificate(format!("failed to generate RSA key: {}", e)))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(format!("failed to self-sign certificate: {}", e)))?;

        let cert_pem = cert.pem().into_bytes();
        Ok(Self {
            ca_crt: cert_pem.clone(),
            tls_crt: cert_pem,
            tls_key: key_pair.serialize_pem().into_bytes(),
        })
    }

    /// Secret data layout: `tls.crt`, `tls.key`, `ca.crt`
    pub fn to_secret_data(&self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (TLS_CRT_KEY.to_string(), ByteString(self.tls_crt.clone())),
            (TLS_KEY_KEY.to_string(), ByteString(self.tls_key.clone())),
            (CA_CRT_KEY.to_string(), ByteString(self.ca_crt.clone())),
        ])
    }

    /// Read material back from a Secret written by [`TlsMaterial::to_secret_data`]
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let data = secret.data.as_ref();
        let get = |key: &str| -> Result<Vec<u8>> {
            data.and_then(|d| d.get(key))
                .map(|b| b.0.clone())
                .filter(|b| !b.is_empty())
                .ok_or_else(|| {
                    Error::configuration(format!(
                        "secret {} is missing key {}",
                        secret.metadata.name.as_deref().unwrap_or_default(),
                        key
                    ))
                })
        };
        Ok(Self {
            tls_crt: get(TLS_CRT_KEY)?,
            tls_key: get(TLS_KEY_KEY)?,
            ca_crt: get(CA_CRT_KEY)?,
        })
    }
}
