//! Certificate authority handling, signing is delegated to the `openssl` tool.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Signs device certificate requests.
pub trait CertificateIssuer: Send + Sync {
    /// Sign PEM encoded request, returns PEM certificate.
    fn issue<'a>(&'a self, csr: &'a str) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

pub struct OpensslIssuer {
    program: String,
    ca_cert: String,
    ca_key: String,
}

impl OpensslIssuer {
    pub fn new(ca_cert: &str, ca_key: &str) -> Self {
        Self {
            program: "openssl".to_owned(),
            ca_cert: ca_cert.to_owned(),
            ca_key: ca_key.to_owned(),
        }
    }

    fn sign_args(&self) -> Vec<&str> {
        vec![
            "x509", "-req", "-in", "-", "-days", "3650", "-CA", self.ca_cert.as_str(), "-CAkey", self.ca_key.as_str(),
            "-set_serial", "0100", "-out", "-",
        ]
    }

    async fn sign(&self, csr: &str) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(self.sign_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(format!("starting {}", self.program))?;
        let mut stdin = child.stdin.take().context("no stdin for signing process")?;
        stdin.write_all(csr.as_bytes()).await.context("writing csr")?;
        drop(stdin);
        let out = child.wait_with_output().await.context("waiting for signing process")?;
        if !out.status.success() {
            anyhow::bail!(
                "signing failed ({}): {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        let pem = String::from_utf8(out.stdout).context("certificate is not utf-8")?;
        Ok(strip_cr(&pem))
    }

    /// Create self-signed CA for `hostname` unless both files already exist.
    pub async fn ensure_ca(&self, hostname: &str) -> Result<()> {
        if Path::new(&self.ca_cert).exists() && Path::new(&self.ca_key).exists() {
            return Ok(());
        }
        log::info!(target: "status", "creating new CA key and certificate for {}", hostname);
        let subject = format!("/CN={}", hostname);
        let out = Command::new(&self.program)
            .args([
                "req", "-x509", "-newkey", "rsa:4096", "-keyout", self.ca_key.as_str(), "-out", self.ca_cert.as_str(), "-sha256",
                "-days", "3650", "-nodes", "-subj", subject.as_str(),
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .context(format!("starting {}", self.program))?;
        if !out.status.success() {
            anyhow::bail!(
                "creating CA failed ({}): {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }
}

impl CertificateIssuer for OpensslIssuer {
    fn issue<'a>(&'a self, csr: &'a str) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(self.sign(csr))
    }
}

/// Appliances choke on CRLF line endings.
fn strip_cr(pem: &str) -> String {
    pem.replace('\r', "")
}
