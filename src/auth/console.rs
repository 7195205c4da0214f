/// Terminal stand-in for an embedded web view: opens pages in the system
/// browser and asks the user to paste back where they landed
use async_trait::async_trait;
use std::io::Write;
use tracing::debug;
use url::Url;

use super::webview::WebViewNavigator;
use crate::error::{AuthError, Result};
use crate::types::Cookie;

#[derive(Debug, Default)]
pub struct ConsoleNavigator;

impl ConsoleNavigator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WebViewNavigator for ConsoleNavigator {
    async fn navigate(&self, uri: &Url) -> Result<()> {
        println!("\n📱 Opening browser...\n");
        println!("   {}\n", uri);

        // Try to open browser
        if let Err(e) = opener::open(uri.as_str()) {
            debug!("Could not open browser: {}", e);
        }

        println!("Steps:");
        println!("  1. Sign in through every page the browser shows");
        println!("  2. Copy the address of the page you end up on");
        println!("  3. Paste it below (empty line to cancel)\n");
        Ok(())
    }

    async fn next_navigation(&self) -> Option<Url> {
        loop {
            let line = prompt("🔗 Paste the address you landed on: ").await?;
            if line.is_empty() {
                return None;
            }
            match Url::parse(&line) {
                Ok(url) => return Some(url),
                Err(e) => println!("❌ Not a valid address ({}), try again", e),
            }
        }
    }

    async fn cookies(&self, domain: &str) -> Result<Vec<Cookie>> {
        println!("\n🍪 Copy the Cookie request header sent to {} from the", domain);
        println!("   browser's developer tools (Network tab)\n");

        let header = prompt("📋 Paste Cookie header: ")
            .await
            .ok_or(AuthError::Canceled)?;
        Ok(parse_cookie_header(domain, &header))
    }

    async fn close(&self) {
        println!("\n✓ You can close the browser tab now\n");
    }
}

/// Reads one trimmed line from stdin; `None` on end of input.
async fn prompt(message: &'static str) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        print!("{}", message);
        std::io::stdout().flush().ok()?;

        let mut input = String::new();
        match std::io::stdin().read_line(&mut input) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(input.trim().to_string()),
        }
    })
    .await
    .ok()
    .flatten()
}

/// Splits a `Cookie:` header (`a=1; b=2`) into cookies scoped to `domain`.
/// An optional leading `Cookie:` is accepted; pairs without `=` are skipped.
pub fn parse_cookie_header(domain: &str, header: &str) -> Vec<Cookie> {
    let header = header.trim();
    let header = header
        .get(..7)
        .filter(|prefix| prefix.eq_ignore_ascii_case("cookie:"))
        .map(|_| &header[7..])
        .unwrap_or(header);

    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(Cookie::new(name, value.trim(), domain))
        })
        .collect()
}
