//! Local identity certificate generation, and fingerprinting of both the
//! local and peer certificates.

use std::fs;
use std::path::{Path, PathBuf};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509, X509Name};
use tracing::info;

use crate::error::Result;

const CERT_VALIDITY_YEARS: u32 = 10;
const CERT_ORG: &str = "KDE";
const CERT_ORG_UNIT: &str = "Kde connect";

/// A self-signed X.509 identity certificate and its private key.
#[derive(Clone)]
pub struct LocalCertificate {
    pub device_id: String,
    pub certificate: X509,
    pub private_key: PKey<Private>,
}

impl LocalCertificate {
    /// Generate a new RSA-2048 self-signed certificate for `device_id`,
    /// valid for ten years.
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        builder.set_serial_number(&serial.to_asn1_integer()?)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", &device_id)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        builder.set_not_before(&Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&Asn1Time::days_from_now(CERT_VALIDITY_YEARS * 365)?)?;
        builder.set_pubkey(&pkey)?;

        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;
        let certificate = builder.build();

        info!(
            device_id = %device_id,
            fingerprint = %fingerprint(&certificate)?,
            "generated local identity certificate"
        );

        Ok(Self {
            device_id,
            certificate,
            private_key: pkey,
        })
    }

    /// Load a previously generated certificate and key from PEM files,
    /// generating and persisting a fresh pair if either is missing.
    pub fn load_or_generate(device_id: &str, cert_dir: &Path) -> Result<Self> {
        let cert_path = cert_dir.join("identity.pem");
        let key_path = cert_dir.join("identity.key");

        if cert_path.exists() && key_path.exists() {
            return Self::load(device_id, &cert_path, &key_path);
        }

        let generated = Self::generate(device_id)?;
        generated.save(&cert_path, &key_path)?;
        Ok(generated)
    }

    fn load(device_id: &str, cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read(cert_path)?;
        let certificate = X509::from_pem(&cert_pem)?;

        let key_pem = fs::read(key_path)?;
        let private_key = PKey::private_key_from_pem(&key_pem)?;

        Ok(Self {
            device_id: device_id.to_string(),
            certificate,
            private_key,
        })
    }

    fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(cert_path, self.certificate.to_pem()?)?;
        fs::write(key_path, self.private_key.private_key_to_pem_pkcs8()?)?;
        Ok(())
    }

    /// PEM encoding of the certificate, suitable for DeviceCache storage.
    pub fn certificate_pem(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.certificate.to_pem()?).into_owned())
    }

    /// `sha1:<hex>` fingerprint of this certificate.
    pub fn fingerprint(&self) -> Result<String> {
        fingerprint(&self.certificate)
    }
}

/// Compute the `sha1:<lowercase hex>` fingerprint of an X.509 certificate's
/// DER encoding. Always 45 characters: the `sha1:` prefix plus 40 hex
/// digits.
pub fn fingerprint(cert: &X509) -> Result<String> {
    Ok(fingerprint_der(&cert.to_der()?))
}

/// Compute the fingerprint directly from a DER-encoded certificate, as
/// used when validating a peer's leaf certificate during the TLS upgrade.
pub fn fingerprint_der(der: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let digest = Sha1::digest(der);
    format!("sha1:{}", hex::encode(digest))
}

/// Parse a PEM-encoded certificate out of DeviceCache storage.
pub fn parse_pem(pem: &str) -> Result<X509> {
    Ok(X509::from_pem(pem.as_bytes())?)
}

/// Standard locations for the local identity certificate within `cert_dir`.
pub fn cert_paths(cert_dir: &Path) -> (PathBuf, PathBuf) {
    (cert_dir.join("identity.pem"), cert_dir.join("identity.key"))
}
