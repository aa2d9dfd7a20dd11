//! Helper functions for reading and handling TLS certificates.
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
    sync::Arc,
};

use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    crypto::{CryptoProvider, ring},
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
};

use crate::{error::Error, internal_prelude::*};

/// The name the server's certificate is issued for.
/// Nodes always validate the server against this name, no matter which host they connect to.
pub const SERVER_NAME: &str = "alertr.local";

/// The certificate chain and key a node authenticates itself with.
#[derive(Debug)]
pub struct ClientIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Everything a TLS listener needs.
#[derive(Debug)]
pub struct ServerIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// If set, nodes have to present a certificate that's signed by this CA.
    pub client_ca: Option<CertificateDer<'static>>,
}

impl ClientIdentity {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, Error> {
        Ok(ClientIdentity {
            certs: load_certs(cert_path)?,
            key: load_key(key_path)?,
        })
    }
}

impl ServerIdentity {
    pub fn load(
        cert_path: &Path,
        key_path: &Path,
        client_ca_path: Option<&Path>,
    ) -> Result<Self, Error> {
        Ok(ServerIdentity {
            certs: load_certs(cert_path)?,
            key: load_key(key_path)?,
            client_ca: client_ca_path.map(load_ca).transpose()?,
        })
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Initialize our client config. \
/// 1. Trust the server's certificate. ONLY this certificate.
/// 2. Set the client certificate and key, if the server requires them.
pub fn get_tls_client_config(
    server_certificate: &CertificateDer<'static>,
    identity: Option<&ClientIdentity>,
) -> Result<Arc<ClientConfig>, Error> {
    let mut cert_store = RootCertStore::empty();
    cert_store.add(server_certificate.clone()).map_err(|err| {
        Error::CertificateFailure(format!("Failed to build RootCertStore: {err}"))
    })?;

    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|err| Error::CertificateFailure(format!("Unsupported TLS setup: {err}")))?
        .with_root_certificates(cert_store);

    let config = match identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())
            .map_err(|err| {
                Error::CertificateFailure(format!("Invalid client certificate or key: {err}"))
            })?,
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Configure the server using rustls. \
/// A TLS server needs a certificate and a fitting private key.
pub fn get_tls_server_config(identity: &ServerIdentity) -> Result<Arc<ServerConfig>, Error> {
    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|err| Error::CertificateFailure(format!("Unsupported TLS setup: {err}")))?;

    let builder = match &identity.client_ca {
        Some(client_ca) => {
            let mut roots = RootCertStore::empty();
            roots.add(client_ca.clone()).map_err(|err| {
                Error::CertificateFailure(format!("Failed to build client RootCertStore: {err}"))
            })?;
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
                .build()
                .map_err(|err| {
                    Error::CertificateFailure(format!("Failed to build client verifier: {err}"))
                })?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(identity.certs.clone(), identity.key.clone_key())
        .map_err(|err| Error::CertificateFailure(format!("Failed to build TLS config: {err}")))?;

    Ok(Arc::new(config))
}

/// Load the server's certificate from a given path.
///
/// This certificate needs to be provided when connecting via
/// [ConnectionSettings::TlsTcpSocket](crate::channel::ConnectionSettings::TlsTcpSocket)
pub fn load_ca(path: &Path) -> Result<CertificateDer<'static>, Error> {
    load_certs(path)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::CertificateFailure("Couldn't find CA certificate in file".into()))
}

/// Load the passed certificates file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path)
        .map_err(|err| Error::IoPathError(path.to_path_buf(), "opening cert", err))?;

    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, std::io::Error>>()
        .map_err(|_| Error::CertificateFailure(format!("Failed to parse certificate {path:?}.")))
}

/// Load the passed keys file.
/// Only the first key will be used. It should match the certificate.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path)
        .map_err(|err| Error::IoPathError(path.to_path_buf(), "opening key", err))?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|_| Error::CertificateFailure(format!("Failed to parse key file {path:?}.")))?
        .ok_or_else(|| {
            Error::CertificateFailure(format!("Couldn't extract private key from keyfile {path:?}"))
        })
}

/// Create a self-signed server certificate and key at the given paths.
///
/// Nothing happens if both files already exist.
pub fn create_certificates(cert_path: &Path, key_path: &Path) -> Result<(), Error> {
    if key_path.exists() || cert_path.exists() {
        if !(key_path.exists() && cert_path.exists()) {
            return Err(Error::CertificateFailure(
                "Not all default certificates exist, some are missing. \
                 Please fix your cert/key paths.\n \
                 You can also remove the certificate directory \
                 and restart the server to create new certificates/keys."
                    .into(),
            ));
        }
        info!("All default keys do exist.");
        return Ok(());
    }

    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                Error::IoPathError(parent.to_path_buf(), "creating certificate directory", err)
            })?;
        }
    }

    let subject_alt_names = vec![SERVER_NAME.to_string(), "localhost".to_string()];
    let certified = rcgen::generate_simple_self_signed(subject_alt_names).map_err(|err| {
        Error::CertificateFailure(format!("Failed to generate server certificate: {err}"))
    })?;

    write_file(&certified.cert.pem(), "server cert", cert_path)?;
    write_file(&certified.key_pair.serialize_pem(), "server key", key_path)?;

    Ok(())
}

fn write_file(blob: &str, name: &str, path: &Path) -> Result<(), Error> {
    info!("Generate {name}.");
    let mut file = File::create(path)
        .map_err(|err| Error::IoPathError(path.to_path_buf(), "creating file", err))?;

    file.write_all(blob.as_bytes())
        .map_err(|err| Error::IoPathError(path.to_path_buf(), "writing file", err))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o640))
            .map_err(|_| Error::CertificateFailure("Failed to set certificate permission.".into()))?;
    }

    Ok(())
}
