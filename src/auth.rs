//! Authentication and authorization.
//!
//! Authentication happens at connection setup: the server requires a
//! mutual-TLS handshake and takes the subject common name of the verified
//! leaf certificate as the principal identity. Authorization happens per
//! procedure: the identity is evaluated as `(subject, "*", procedure)`
//! against a casbin-style model/policy file pair.

use std::path::Path;

use rustls::pki_types::CertificateDer;
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Why a connection could not be authenticated.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no verified peer certificate")]
    NoPeerCertificate,

    #[error("bad peer certificate: {0}")]
    BadCertificate(String),

    #[error("peer certificate has an empty common name")]
    EmptyCommonName,

    #[error("policy: {0}")]
    Policy(String),
}

/// Extract the principal identity from a verified peer certificate chain.
///
/// The identity is the subject common name of the leaf certificate.
pub fn identity_from_certs(certs: &[CertificateDer<'_>]) -> Result<String, AuthError> {
    let leaf = certs.first().ok_or(AuthError::NoPeerCertificate)?;
    let (_, cert) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| AuthError::BadCertificate(e.to_string()))?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default();
    if cn.is_empty() {
        return Err(AuthError::EmptyCommonName);
    }
    Ok(cn.to_string())
}

/// One `p, sub, obj, act` policy line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PolicyRule {
    subject: String,
    object: String,
    action: String,
}

impl PolicyRule {
    fn matches(&self, subject: &str, object: &str, action: &str) -> bool {
        fn field_matches(rule: &str, value: &str) -> bool {
            rule == "*" || rule == value
        }
        field_matches(&self.subject, subject)
            && field_matches(&self.object, object)
            && field_matches(&self.action, action)
    }
}

/// File-driven ACL evaluator over a casbin-format model and policy pair.
///
/// The model file is validated for the sections the evaluator relies on;
/// the policy file contributes one rule per `p, sub, obj, act` line.
/// Missing rules deny.
pub struct Authorizer {
    rules: Vec<PolicyRule>,
}

impl Authorizer {
    pub fn new(model: impl AsRef<Path>, policy: impl AsRef<Path>) -> Result<Self, AuthError> {
        let model_text = std::fs::read_to_string(model.as_ref())
            .map_err(|e| AuthError::Policy(format!("read model: {e}")))?;
        for section in ["[request_definition]", "[policy_definition]", "[matchers]"] {
            if !model_text.contains(section) {
                return Err(AuthError::Policy(format!(
                    "model is missing the {section} section"
                )));
            }
        }

        let policy_text = std::fs::read_to_string(policy.as_ref())
            .map_err(|e| AuthError::Policy(format!("read policy: {e}")))?;
        let mut rules = Vec::new();
        for (lineno, line) in policy_text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 4 || fields[0] != "p" {
                return Err(AuthError::Policy(format!(
                    "malformed policy rule on line {}",
                    lineno + 1
                )));
            }
            rules.push(PolicyRule {
                subject: fields[1].to_string(),
                object: fields[2].to_string(),
                action: fields[3].to_string(),
            });
        }
        Ok(Authorizer { rules })
    }

    /// True when some policy rule grants `(subject, object, action)`.
    pub fn enforce(&self, subject: &str, object: &str, action: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.matches(subject, object, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MODEL: &str = "\
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = r.sub == p.sub && r.obj == p.obj && r.act == p.act
";

    fn write_files(policy: &str) -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
        let mut model_file = tempfile::NamedTempFile::new().unwrap();
        model_file.write_all(MODEL.as_bytes()).unwrap();
        let mut policy_file = tempfile::NamedTempFile::new().unwrap();
        policy_file.write_all(policy.as_bytes()).unwrap();
        (model_file, policy_file)
    }

    #[test]
    fn test_enforce_grants_and_denies() {
        let (model, policy) = write_files(
            "p, root, *, produce\n\
             p, root, *, consume\n",
        );
        let authz = Authorizer::new(model.path(), policy.path()).unwrap();
        assert!(authz.enforce("root", "*", "produce"));
        assert!(authz.enforce("root", "*", "consume"));
        assert!(!authz.enforce("root", "*", "produce_stream"));
        assert!(!authz.enforce("nobody", "*", "produce"));
    }

    #[test]
    fn test_enforce_wildcard_action() {
        let (model, policy) = write_files("p, root, *, *\n");
        let authz = Authorizer::new(model.path(), policy.path()).unwrap();
        assert!(authz.enforce("root", "*", "consume_stream"));
        assert!(!authz.enforce("nobody", "*", "consume_stream"));
    }

    #[test]
    fn test_comments_and_blank_lines_are_skipped() {
        let (model, policy) = write_files("# grants\n\np, root, *, produce\n");
        let authz = Authorizer::new(model.path(), policy.path()).unwrap();
        assert!(authz.enforce("root", "*", "produce"));
    }

    #[test]
    fn test_malformed_rule_is_rejected() {
        let (model, policy) = write_files("p, root, produce\n");
        assert!(Authorizer::new(model.path(), policy.path()).is_err());
    }

    #[test]
    fn test_model_missing_section_is_rejected() {
        let mut model_file = tempfile::NamedTempFile::new().unwrap();
        model_file.write_all(b"[request_definition]\n").unwrap();
        let (_, policy) = write_files("p, root, *, produce\n");
        assert!(Authorizer::new(model_file.path(), policy.path()).is_err());
    }

    #[test]
    fn test_identity_from_generated_cert() {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "root");
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let identity = identity_from_certs(&[cert.der().clone()]).unwrap();
        assert_eq!(identity, "root");
    }

    #[test]
    fn test_identity_requires_a_certificate() {
        assert!(matches!(
            identity_from_certs(&[]),
            Err(AuthError::NoPeerCertificate)
        ));
    }

    #[test]
    fn test_identity_requires_a_common_name() {
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        assert!(matches!(
            identity_from_certs(&[cert.der().clone()]),
            Err(AuthError::EmptyCommonName)
        ));
    }
}
