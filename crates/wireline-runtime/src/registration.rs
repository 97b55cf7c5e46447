//! Account registration and verification
//!
//! One-shot flows against the daemon, run before a dispatcher exists for the
//! account. A failed registration leaves partial account data behind in the
//! daemon, so it is cleaned up before reporting the original error.

use serde_json::json;
use tracing::{info, warn};

use wireline_core::errors::Result;

use crate::transport::DaemonConnection;

/// Register a new account. `voice` requests a phone call instead of an SMS;
/// `captcha` is the token the daemon demands when registration is rate
/// limited.
pub async fn register(
    conn: &mut DaemonConnection,
    number: &str,
    voice: bool,
    captcha: Option<&str>,
) -> Result<()> {
    let mut params = json!({
        "account": number,
        "voice": voice,
    });
    if let Some(captcha) = captcha {
        params["captcha"] = json!(captcha);
    }
    match conn.call("register", params).await {
        Ok(_) => {
            info!(account = number, "registration started");
            Ok(())
        }
        Err(e) => {
            // A failed attempt leaves a half-created account behind.
            let cleanup = conn
                .call("deleteLocalAccountData", json!({ "account": number }))
                .await;
            if let Err(cleanup_err) = cleanup {
                warn!("cleanup after failed registration also failed: {cleanup_err}");
            }
            Err(e)
        }
    }
}

/// Complete registration with the verification code, and the registration
/// lock PIN when the account carries one.
pub async fn verify(
    conn: &mut DaemonConnection,
    number: &str,
    code: &str,
    pin: Option<&str>,
) -> Result<()> {
    let mut params = json!({
        "account": number,
        "verificationCode": code,
    });
    if let Some(pin) = pin {
        params["pin"] = json!(pin);
    }
    conn.call("verify", params).await?;
    info!(account = number, "account verified");
    Ok(())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn failed_registration_cleans_up() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = DaemonConnection::from_stream(client);

        let server_task = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read);

            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(request["method"], "register");
            write
                .write_all(
                    b"{\"jsonrpc\":\"2.0\",\"id\":1,\"error\":{\"code\":-32602,\"message\":\"captcha required\"}}\n",
                )
                .await
                .unwrap();

            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(request["method"], "deleteLocalAccountData");
            write
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":null}\n")
                .await
                .unwrap();
        });

        let err = register(&mut connection, "+15550000001", false, None)
            .await
            .unwrap_err();
        assert!(err.is_daemon_error());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn verify_passes_code_and_pin() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = DaemonConnection::from_stream(client);

        let server_task = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read);
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(request["method"], "verify");
            assert_eq!(request["params"]["verificationCode"], "123456");
            assert_eq!(request["params"]["pin"], "0000");
            write
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":null}\n")
                .await
                .unwrap();
        });

        verify(&mut connection, "+15550000001", "123456", Some("0000"))
            .await
            .unwrap();
        server_task.await.unwrap();
    }
}
