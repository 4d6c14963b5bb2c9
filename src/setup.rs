//! Initial Wi-Fi setup of appliances through their access point.
//!
//! While in setup mode an appliance opens an access point and accepts TLS on port 5500
//! with a self-signed certificate. Older appliances take `mTosp` XML requests in
//! [mtosp](crate::frame::mtosp) frames, one request per connection. Newer ones keep a
//! single connection and exchange JSON documents.
//!
//! The region code is replaced so the appliance looks for its cloud under a name the
//! local DNS can point at this host.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::frame::{json as json_frame, mtosp};

const TARGET: &str = "setup";
pub const SETUP_PORT: u16 = 5500;
const TIMEOUT: Duration = Duration::from_secs(30);

/// Key the vendor cloud hands out, appliances refuse to continue without one.
const CLOUD_PUBLIC_KEY: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEApYRAZXRWijMuWNr9LHOJ
fcPcZHDYcO3CwRF9olsPvtJpkrDXR7jEDA6qPHF1jvJ7ArxDLVj8rbkwXb3oXNmN
Sc+n0DPNDiRgghDaDyJpN0qfzmt06MKdihVScwghyYKWD+oA9d1+j3wy3W32he+X
7FnS+yUmmbQ8cT0PYS7p2E8YtbgHrH+SbUzHAgBbaS8E92l7f0qOpQFmYEyP/OX+
1n0dLdXXJ8kFxCLP2n8Wy6XXTutrT0YuZCxabPVYSKsjLh86MuHEM6V8BdBoZItW
qA1bDeDvjP7QC93lGxmwIYR0H8VVQq7gBZYWpPfsRSfwsE/PCMrF1WS4sPnSauaV
QwIDAQAB
-----END PUBLIC KEY-----
";

#[derive(Debug, Clone)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    fn encoded(&self) -> (String, String) {
        let b64 = base64::engine::general_purpose::STANDARD;
        (b64.encode(self.ssid.as_bytes()), b64.encode(self.password.as_bytes()))
    }
}

/// Appliance certificates are self-signed, any certificate is accepted.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

async fn connect(host: &str) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("tls protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(host.to_owned()).context(format!("invalid host name {}", host))?;
    let tcp = tokio::time::timeout(TIMEOUT, TcpStream::connect((host, SETUP_PORT)))
        .await
        .context("connect timeout")?
        .context(format!("connecting to {}:{}", host, SETUP_PORT))?;
    tokio::time::timeout(TIMEOUT, connector.connect(name, tcp))
        .await
        .context("tls handshake timeout")?
        .context("tls handshake")
}

/// Send one XML request and wait for the answer.
pub async fn mtosp_request<S>(stream: &mut S, xml: &str) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&mtosp::format(xml)?).await?;
    stream.flush().await?;
    let mut splitter = mtosp::Splitter::default();
    let mut buf = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
            .await
            .context("no answer")??;
        if n == 0 {
            anyhow::bail!("connection closed before answer");
        }
        if let Some(answer) = splitter.push(&buf[..n])?.into_iter().next() {
            return Ok(answer);
        }
    }
}

pub fn device_info_request(now_ms: u128) -> String {
    format!(
        "<mTosp><data type=\"deviceinfo\"><time>{}</time><reg>000</reg><errorCode>N</errorCode></data></mTosp>",
        now_ms
    )
}

pub fn ap_info_request(wifi: &WifiCredentials) -> String {
    let (ssid, password) = wifi.encoded();
    format!(
        "<mTosp><data type=\"apinfo\"><format>B64</format><bssid>{}</bssid><security>WPA_PSK</security>\
         <password>{}</password><subCountryCode>DE</subCountryCode><regionalCode>rethink</regionalCode></data></mTosp>",
        ssid, password
    )
}

async fn xml_setup(host: &str, wifi: &WifiCredentials) -> Result<()> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
    let mut stream = connect(host).await?;
    let answer = mtosp_request(&mut stream, &device_info_request(now)).await?;
    log::info!(target: TARGET, "device info: {}", answer);

    let mut stream = connect(host).await?;
    let answer = mtosp_request(&mut stream, &ap_info_request(wifi)).await?;
    log::info!(target: TARGET, "access point accepted: {}", answer);
    Ok(())
}

fn request(cmd: &str, data: Value) -> Value {
    json!({ "type": "request", "cmd": cmd, "data": data })
}

/// Request following the response to `cmd`, `None` once setup is complete.
fn next_request(cmd: &str, wifi: &WifiCredentials) -> Result<Option<Value>> {
    let next = match cmd {
        "setDeviceInit" => request(
            "getDeviceInfo",
            json!({
                "subCountryCode": "DE",
                "regionalCode": "eic",
                "timezone": "+0100",
                "publicKey": CLOUD_PUBLIC_KEY,
                "constantConnect": "Y",
            }),
        ),
        "getDeviceInfo" => request(
            "setCertInfo",
            json!({
                "otp": "0123456789abcdef0123456789abcdef0123456789abcdef",
                "svccode": "SVC202",
                "svcphase": "OP",
                "constantConnect": "Y",
            }),
        ),
        "setCertInfo" => {
            let (ssid, password) = wifi.encoded();
            request(
                "setApInfo",
                json!({
                    "format": "B64",
                    "ssid": ssid,
                    "password": password,
                    "security": "WPA2_PSK",
                    "cipher": "AES",
                    "constantConnect": "Y",
                }),
            )
        }
        "setApInfo" => request("releaseDev", json!({})),
        "releaseDev" => return Ok(None),
        other => anyhow::bail!("unexpected response to {}", other),
    };
    Ok(Some(next))
}

/// Run JSON setup conversation on an established connection.
pub async fn json_session<S>(stream: &mut S, wifi: &WifiCredentials) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = request("setDeviceInit", json!({ "set": "true", "constantConnect": "Y" }));
    stream.write_all(first.to_string().as_bytes()).await?;
    let mut splitter = json_frame::Splitter::default();
    let mut buf = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
            .await
            .context("no answer")??;
        if n == 0 {
            anyhow::bail!("connection closed during setup");
        }
        for doc in splitter.push(&buf[..n])? {
            log::debug!(target: TARGET, "received {}", doc);
            if doc["type"] != "response" {
                continue;
            }
            if let Some(result) = doc["data"]["result"].as_str() {
                if result != "000" {
                    anyhow::bail!("appliance returned error {}", result);
                }
            }
            let cmd = doc["cmd"].as_str().unwrap_or_default();
            match next_request(cmd, wifi)? {
                Some(next) => stream.write_all(next.to_string().as_bytes()).await?,
                None => return Ok(()),
            }
        }
    }
}

/// Configure Wi-Fi of appliance reachable at `host`. The XML protocol is tried first,
/// appliances which do not speak it drop the connection.
pub async fn run(host: &str, wifi: &WifiCredentials) -> Result<()> {
    log::info!(target: TARGET, "trying xml setup at {}:{}", host, SETUP_PORT);
    match xml_setup(host, wifi).await {
        Ok(()) => return Ok(()),
        Err(e) => log::info!(target: TARGET, "xml setup failed ({:#}), trying json setup", e),
    }
    let mut stream = connect(host).await?;
    json_session(&mut stream, wifi).await?;
    log::info!(target: TARGET, "setup complete, the appliance now joins {}", wifi.ssid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{ap_info_request, device_info_request, json_session, mtosp_request, WifiCredentials};
    use crate::frame::{json as json_frame, mtosp};

    fn wifi() -> WifiCredentials {
        WifiCredentials {
            ssid: "home".to_owned(),
            password: "secret".to_owned(),
        }
    }

    #[test]
    fn xml_requests() {
        assert!(device_info_request(42).contains("<time>42</time>"));
        let ap = ap_info_request(&wifi());
        assert!(ap.contains("<bssid>aG9tZQ==</bssid>"));
        assert!(ap.contains("<password>c2VjcmV0</password>"));
        assert!(ap.contains("<regionalCode>rethink</regionalCode>"));
    }

    #[tokio::test]
    async fn xml_exchange() {
        let (mut client, mut appliance) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            let mut splitter = mtosp::Splitter::default();
            let mut buf = [0u8; 1024];
            let n = appliance.read(&mut buf).await.unwrap();
            let req = splitter.push(&buf[..n]).unwrap().remove(0);
            let answer = mtosp::format("<mTosp><data type=\"deviceinfo\"/></mTosp>").unwrap();
            // split answer to check reassembly
            appliance.write_all(&answer[..5]).await.unwrap();
            appliance.write_all(&answer[5..]).await.unwrap();
            req
        });
        let answer = mtosp_request(&mut client, &device_info_request(1)).await.unwrap();
        assert_eq!(answer, "<mTosp><data type=\"deviceinfo\"/></mTosp>");
        assert!(handle.await.unwrap().contains("deviceinfo"));
    }

    fn response(cmd: &str) -> Vec<u8> {
        json!({"type": "response", "cmd": cmd, "data": {"result": "000"}}).to_string().into_bytes()
    }

    #[tokio::test]
    async fn json_conversation() {
        let (mut client, mut appliance) = tokio::io::duplex(16 * 1024);
        let handle = tokio::spawn(async move {
            let mut splitter = json_frame::Splitter::default();
            let mut buf = [0u8; 4096];
            let mut seen: Vec<Value> = Vec::new();
            while seen.len() < 5 {
                let n = appliance.read(&mut buf).await.unwrap();
                for req in splitter.push(&buf[..n]).unwrap() {
                    let cmd = req["cmd"].as_str().unwrap().to_owned();
                    appliance.write_all(&response(&cmd)).await.unwrap();
                    seen.push(req);
                }
            }
            seen
        });
        json_session(&mut client, &wifi()).await.unwrap();
        let seen = handle.await.unwrap();
        let cmds: Vec<&str> = seen.iter().map(|r| r["cmd"].as_str().unwrap()).collect();
        assert_eq!(cmds, ["setDeviceInit", "getDeviceInfo", "setCertInfo", "setApInfo", "releaseDev"]);
        assert_eq!(seen[3]["data"]["ssid"], "aG9tZQ==");
        assert!(seen[1]["data"]["publicKey"].as_str().unwrap().starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[tokio::test]
    async fn json_error_code_aborts() {
        let (mut client, mut appliance) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            _ = appliance.read(&mut buf).await.unwrap();
            let r = json!({"type": "response", "cmd": "setDeviceInit", "data": {"result": "100"}});
            appliance.write_all(r.to_string().as_bytes()).await.unwrap();
            // keep the stream open
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });
        let e = json_session(&mut client, &wifi()).await.unwrap_err();
        assert!(e.to_string().contains("100"));
    }
}
