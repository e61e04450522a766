//! Smoke checker for a running storefront stack
//!
//! Checks the API server directly, the gateway's site root, and the API as
//! seen through the gateway's same-origin proxy.
//!
//! Environment variables:
//! - BACKEND_URL: API server base URL (default: http://localhost:5000)
//! - FRONTEND_URL: gateway base URL (default: http://localhost:3001)

use anyhow::{Context, Result};
use reqwest::StatusCode;
use std::env;
use std::time::Duration;

const DEFAULT_BACKEND_URL: &str = "http://localhost:5000";
const DEFAULT_FRONTEND_URL: &str = "http://localhost:3001";

struct Checker {
    client: reqwest::Client,
    failures: usize,
}

impl Checker {
    fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, failures: 0 })
    }

    fn assert(&mut self, ok: bool, message: &str) {
        if ok {
            println!("PASS: {}", message);
        } else {
            self.failures += 1;
            eprintln!("FAIL: {}", message);
        }
    }

    /// Count a whole section as one failure when it cannot complete
    fn section(&mut self, name: &str, result: Result<()>) {
        if let Err(e) = result {
            self.failures += 1;
            eprintln!("FAIL: {} error: {:#}", name, e);
        }
    }

    async fn get(&self, url: &str) -> Result<(StatusCode, String)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        let status = response.status();
        let body = response.text().await.with_context(|| format!("reading {}", url))?;
        Ok((status, body))
    }

    async fn expect_ok(&mut self, url: &str, label: &str) -> Result<String> {
        let (status, body) = self.get(url).await?;
        self.assert(status == StatusCode::OK, &format!("{} 200 (got {})", label, status.as_u16()));
        Ok(body)
    }

    async fn check_backend(&mut self, backend: &str) -> Result<()> {
        self.expect_ok(&format!("{}/health", backend), "Backend /health").await?;
        self.expect_ok(&format!("{}/api/health", backend), "Backend /api/health").await?;
        Ok(())
    }

    async fn check_frontend(&mut self, frontend: &str) -> Result<()> {
        self.expect_ok(&format!("{}/", frontend), "Frontend /").await?;
        Ok(())
    }

    async fn check_proxy(&mut self, frontend: &str) -> Result<()> {
        self.expect_ok(&format!("{}/api/health", frontend), "Proxied /api/health").await?;
        let body = self
            .expect_ok(&format!("{}/api/products?limit=3", frontend), "Proxied /api/products")
            .await?;

        match product_count(&body) {
            Some(count) => {
                self.assert(true, "Products response is an array");
                self.assert(count >= 1, "Products array has at least 1 item");
            }
            None => self.assert(false, "Products response not valid JSON array"),
        }
        Ok(())
    }
}

/// Number of products in a JSON array body, `None` if the body is not one
fn product_count(body: &str) -> Option<usize> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .as_array()
        .map(|items| items.len())
}

fn base_url(var: &str, default: &str) -> String {
    env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let backend = base_url("BACKEND_URL", DEFAULT_BACKEND_URL);
    let frontend = base_url("FRONTEND_URL", DEFAULT_FRONTEND_URL);

    let mut checker = Checker::new()?;

    let result = checker.check_backend(&backend).await;
    checker.section("Backend health", result);

    let result = checker.check_frontend(&frontend).await;
    checker.section("Frontend root", result);

    let result = checker.check_proxy(&frontend).await;
    checker.section("Proxied API", result);

    if checker.failures > 0 {
        anyhow::bail!("Smoke test FAILED with {} issue(s)", checker.failures);
    }

    println!("\nSmoke test PASSED.");
    Ok(())
}
