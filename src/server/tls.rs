//! TLS configuration for the server and peer-facing channels.
//!
//! The server side terminates mutual TLS: clients must present a
//! certificate signed by the configured CA, and the verified chain is how
//! connections get their identity. The peer side is the client half used
//! when dialing other nodes, presenting this node's certificate.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsPaths;

fn config_err(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}

/// Server-side TLS: certificate plus mandatory client verification.
#[derive(Clone)]
pub struct ServerTls {
    acceptor: TlsAcceptor,
}

impl ServerTls {
    /// Build from PEM files. The CA verifies client certificates;
    /// connections without a valid client certificate fail the handshake.
    pub fn from_paths(paths: &TlsPaths) -> io::Result<Self> {
        let certs = load_certs(&paths.cert_file)?;
        let key = load_private_key(&paths.key_file)?;
        let ca_certs = load_certs(&paths.ca_file)?;

        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots.add(cert).map_err(config_err)?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(config_err)?;

        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(config_err)?;

        Ok(ServerTls {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

/// Client-side TLS used when dialing peers (Raft) or servers (clients),
/// presenting this node's certificate for mutual authentication.
#[derive(Clone)]
pub struct PeerTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl PeerTls {
    pub fn from_paths(paths: &TlsPaths) -> io::Result<Self> {
        let certs = load_certs(&paths.cert_file)?;
        let key = load_private_key(&paths.key_file)?;
        let ca_certs = load_certs(&paths.ca_file)?;

        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots.add(cert).map_err(config_err)?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(config_err)?;
        let server_name =
            ServerName::try_from(paths.server_name.clone()).map_err(config_err)?;

        Ok(PeerTls {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Run the client handshake over an established TCP stream.
    pub async fn connect(
        &self,
        stream: TcpStream,
    ) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
        self.connector
            .connect(self.server_name.clone(), stream)
            .await
    }
}

/// Load certificates from a PEM file.
fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| config_err(format!("open certificate file {path:?}: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| config_err(format!("parse certificates in {path:?}: {e}")))?;
    if certs.is_empty() {
        return Err(config_err(format!("no certificates found in {path:?}")));
    }
    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| config_err(format!("open key file {path:?}: {e}")))?;
    let mut reader = BufReader::new(file);
    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| config_err(format!("parse key file {path:?}: {e}")))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            Some(_) => continue,
            None => break,
        }
    }
    Err(config_err(format!("no private key found in {path:?}")))
}
