//! Configuration file loading and validation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// The JSON configuration file. Field names are case-preserving.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// host:port for the HTTPS listener.
    #[serde(rename = "ListenAddr")]
    pub listen_addr: String,

    /// Writable directory for keys, certificates and account records.
    #[serde(rename = "DataDir")]
    pub data_dir: PathBuf,

    /// The sites to maintain; each binds one domain per condition.
    #[serde(rename = "Sites")]
    pub sites: Vec<Site>,

    #[serde(rename = "ACME")]
    pub acme: Acme,
}

/// Configuration for one site (three domains sharing issuer and key
/// parameters).
#[derive(Clone, Debug, Deserialize)]
pub struct Site {
    /// Common Name of the issuer this site's chains should come from.
    #[serde(rename = "IssuerCN")]
    pub issuer_cn: String,

    /// Key algorithm: "p256" or "rsa2048".
    #[serde(rename = "KeyType")]
    pub key_type: String,

    /// ACME profile to request for this site's orders.
    #[serde(rename = "Profile", default)]
    pub profile: Option<String>,

    #[serde(rename = "Domains")]
    pub domains: Domains,
}

/// One domain per condition.
#[derive(Clone, Debug, Deserialize)]
pub struct Domains {
    #[serde(rename = "Valid")]
    pub valid: String,
    #[serde(rename = "Revoked")]
    pub revoked: String,
    #[serde(rename = "Expired")]
    pub expired: String,
}

/// ACME client configuration, shared between all sites.
#[derive(Clone, Debug, Deserialize)]
pub struct Acme {
    /// ACME directory URL.
    #[serde(rename = "Directory")]
    pub directory: String,

    /// Optional PEM bundle of extra trusted roots when talking to the CA.
    /// Typically only used in test environments.
    #[serde(rename = "CACerts", default)]
    pub ca_certs: Option<PathBuf>,

    #[serde(rename = "TermsOfServiceAgreed", default)]
    pub terms_of_service_agreed: bool,
}

/// Key algorithm for a site's certificates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyType {
    P256,
    Rsa2048,
}

#[derive(Debug, Error)]
#[error("unknown key type: {0:?}")]
pub struct UnknownKeyType(String);

impl FromStr for KeyType {
    type Err = UnknownKeyType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p256" => Ok(Self::P256),
            "rsa2048" => Ok(Self::Rsa2048),
            other => Err(UnknownKeyType(other.to_owned())),
        }
    }
}

/// The intended state of a demonstration certificate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Condition {
    Valid,
    Revoked,
    Expired,
}

impl Condition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        }
    }
}

// --- impl Config --- //

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|source| {
            ConfigError::Parse {
                path: path.to_owned(),
                source,
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the whole file, collecting every problem before failing.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.listen_addr.is_empty() {
            problems.push("ListenAddr must not be empty".to_owned());
        }
        if self.data_dir.as_os_str().is_empty() {
            problems.push("DataDir must not be empty".to_owned());
        }
        if self.acme.directory.is_empty() {
            problems.push("ACME.Directory must not be empty".to_owned());
        }

        let mut seen_domains = HashSet::new();
        for (idx, site) in self.sites.iter().enumerate() {
            if site.issuer_cn.is_empty() {
                problems.push(format!("site {idx}: IssuerCN must not be empty"));
            }
            if let Err(err) = site.parse_key_type() {
                problems.push(format!("site {idx}: {err}"));
            }
            for (condition, domain) in site.domains.iter() {
                if domain.is_empty() {
                    problems.push(format!(
                        "site {idx}: {} domain must not be empty",
                        condition.as_str()
                    ));
                } else if !seen_domains.insert(domain.to_owned()) {
                    problems.push(format!(
                        "site {idx}: domain {domain} is configured more than once"
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

// --- impl Site + Domains --- //

impl Site {
    pub fn parse_key_type(&self) -> Result<KeyType, UnknownKeyType> {
        self.key_type.parse()
    }
}

impl Domains {
    /// Iterate the site's `(condition, domain)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Condition, &str)> {
        [
            (Condition::Valid, self.valid.as_str()),
            (Condition::Revoked, self.revoked.as_str()),
            (Condition::Expired, self.expired.as_str()),
        ]
        .into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).expect("config JSON should parse")
    }

    const GOOD: &str = r#"{
        "ListenAddr": "[::]:443",
        "DataDir": "/var/lib/cert-states-site",
        "Sites": [{
            "IssuerCN": "Example Intermediate X1",
            "KeyType": "p256",
            "Profile": "shortlived",
            "Domains": {
                "Valid": "valid.example.com",
                "Revoked": "revoked.example.com",
                "Expired": "expired.example.com"
            }
        }],
        "ACME": {
            "Directory": "https://acme.example.com/directory",
            "TermsOfServiceAgreed": true
        }
    }"#;

    #[test]
    fn good_config_validates() {
        let config = parse(GOOD);
        config.validate().expect("config should be valid");
        assert_eq!(config.listen_addr, "[::]:443");
        assert_eq!(config.sites[0].parse_key_type().unwrap(), KeyType::P256);
        assert!(config.acme.terms_of_service_agreed);
        assert_eq!(config.acme.ca_certs, None);
        let domains = config.sites[0]
            .domains
            .iter()
            .map(|(_, domain)| domain.to_owned())
            .collect::<Vec<_>>();
        assert_eq!(
            domains,
            vec![
                "valid.example.com",
                "revoked.example.com",
                "expired.example.com"
            ]
        );
    }

    #[test]
    fn all_problems_are_collected() {
        let config = parse(
            r#"{
            "ListenAddr": "[::]:443",
            "DataDir": "/data",
            "Sites": [
                {
                    "IssuerCN": "",
                    "KeyType": "dsa1024",
                    "Domains": {
                        "Valid": "a.example.com",
                        "Revoked": "b.example.com",
                        "Expired": "a.example.com"
                    }
                },
                {
                    "IssuerCN": "Example X1",
                    "KeyType": "rsa2048",
                    "Domains": {
                        "Valid": "b.example.com",
                        "Revoked": "c.example.com",
                        "Expired": ""
                    }
                }
            ],
            "ACME": { "Directory": "https://acme.example.com/directory" }
        }"#,
        );

        let Err(ConfigError::Invalid(problems)) = config.validate() else {
            panic!("validation should fail");
        };

        // Empty IssuerCN, unknown key type, two duplicated domains, and
        // one empty domain, all reported in one pass.
        assert_eq!(problems.len(), 5, "problems: {problems:?}");
        assert!(problems.iter().any(|p| p.contains("IssuerCN")));
        assert!(problems.iter().any(|p| p.contains("dsa1024")));
        assert!(problems.iter().any(|p| p.contains("a.example.com")));
        assert!(problems.iter().any(|p| p.contains("b.example.com")));
    }
}
