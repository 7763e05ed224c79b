use crate::types::SlotView;
use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Response types (mirrors server types for deserialization)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct MessageResponse {
    message: String,
}

#[derive(Deserialize)]
pub struct HealthInfo {
    #[allow(dead_code)]
    pub status: String,
    pub pid: Option<u32>,
    pub config: String,
    pub managed: usize,
}

#[derive(Deserialize)]
pub struct ListenerInfo {
    pub port: u16,
    pub slot: String,
    pub mode: String,
    pub static_root: Option<String>,
    #[serde(default)]
    pub spa: bool,
}

// ---------------------------------------------------------------------------
// Client helpers
// ---------------------------------------------------------------------------

fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

fn make_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .no_proxy()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .expect("failed to build HTTP client")
}

/// Send a request and handle connection errors with a friendly message.
fn handle_connection_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_connect() {
        anyhow::anyhow!("slotd is not running. Start it with 'slotd serve'.")
    } else {
        err.into()
    }
}

/// Extract error message from a non-success HTTP response.
fn check_response(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        let status = resp.status();
        let body: MessageResponse = resp.json().unwrap_or(MessageResponse {
            message: format!("Server returned {}", status),
        });
        anyhow::bail!("{}", body.message)
    }
}

fn get_json<T: serde::de::DeserializeOwned>(port: u16, path: &str) -> Result<T> {
    let resp = make_client()
        .get(format!("{}{}", base_url(port), path))
        .send()
        .map_err(handle_connection_error)?;
    let resp = check_response(resp)?;
    resp.json().context("Failed to parse response")
}

fn post_message(port: u16, path: &str) -> Result<String> {
    let resp = make_client()
        .post(format!("{}{}", base_url(port), path))
        .send()
        .map_err(handle_connection_error)?;
    let resp = check_response(resp)?;
    let msg: MessageResponse = resp.json().context("Failed to parse response")?;
    Ok(msg.message)
}

// ---------------------------------------------------------------------------
// Public client functions
// ---------------------------------------------------------------------------

pub fn client_status(port: u16) -> Result<()> {
    let health: HealthInfo = get_json(port, "/api/health")?;
    println!(
        "slotd pid {} managing {} port(s) from {}",
        health
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "?".into()),
        health.managed,
        health.config
    );

    let listeners: Vec<ListenerInfo> = get_json(port, "/api/listeners")?;
    if listeners.is_empty() {
        println!("No ports are being served.");
        return Ok(());
    }
    println!("{:<6} {:<5} {:<12} TARGET", "PORT", "SLOT", "MODE");
    for l in listeners {
        let target = match (l.mode.as_str(), &l.static_root) {
            ("static", Some(root)) if l.spa => format!("{} (spa)", root),
            ("static", Some(root)) => root.clone(),
            ("static", None) => "(no static root)".into(),
            _ => "placeholder assets".into(),
        };
        println!("{:<6} {:<5} {:<12} {}", l.port, l.slot, l.mode, target);
    }
    Ok(())
}

pub fn client_slots(port: u16) -> Result<()> {
    let slots: Vec<SlotView> = get_json(port, "/api/slots")?;
    print_slots(&slots);
    Ok(())
}

pub fn print_slots(slots: &[SlotView]) {
    println!("{:<5} {:<6} {:<10} MODE", "SLOT", "PORT", "STATUS");
    for s in slots {
        println!(
            "{:<5} {:<6} {:<10} {}",
            s.slot,
            s.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            s.status
                .map(|st| st.to_string())
                .unwrap_or_else(|| "-".into()),
            s.mode
        );
    }
}

pub fn client_reconcile(port: u16) -> Result<()> {
    println!("{}", post_message(port, "/api/reconcile")?);
    Ok(())
}

pub fn client_stop(port: u16) -> Result<()> {
    println!("{}", post_message(port, "/api/shutdown")?);
    Ok(())
}
