use anyhow::Result;
use portal_auth::{
    AuthError, AuthenticatedClient, AuthenticationType, ChallengeCoordinator, CredentialRequest,
    Scheme,
    auth::ConsoleNavigator,
    config::{Config, LoggingConfig},
    types::CredentialMaterial,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const USAGE: &str = "Usage: portal-auth <login <url> [--type <authentication-type>] | status | logout <url> | fetch <url>> [--metrics]";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }

    // Load configuration
    let config = Config::load()?;
    init_logging(&config.logging);
    info!("portal-auth v{}", portal_auth::VERSION);

    let ctx = config.build_context()?;
    let coordinator = Arc::new(ChallengeCoordinator::new(
        ctx.clone(),
        Arc::new(ConsoleNavigator::new()),
    ));

    // Ctrl-C cancels whatever negotiation is running
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let show_metrics = args.iter().any(|arg| arg == "--metrics");

    match args[1].as_str() {
        "login" => {
            let Some(url) = args.get(2) else {
                eprintln!("Usage: portal-auth login <url> [--type <authentication-type>]");
                std::process::exit(1);
            };

            let mut request = CredentialRequest::new(url.clone());
            if let Some(idx) = args.iter().position(|arg| arg == "--type") {
                let Some(raw) = args.get(idx + 1) else {
                    eprintln!("--type needs a value: token, OAuthAuthorizationCode or OAuthClientCredentials");
                    std::process::exit(1);
                };
                let authentication_type: AuthenticationType = raw.parse()?;
                request = request.with_authentication_type(authentication_type);
            }

            println!("\n🔐 Signing in to {}", url);
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

            match coordinator.resolve_with_cancel(request, &cancel).await {
                Ok(credential) => {
                    println!("\n✅ Authenticated with {}", credential.server_uri());
                    println!("   Scheme: {}", credential.scheme());
                    if let Some(remaining) = credential.time_until_expiration() {
                        println!("   Expires in: {}\n", describe_duration(remaining));
                    } else {
                        println!();
                    }
                }
                Err(AuthError::Canceled) => println!("\n↩️  Login canceled\n"),
                Err(e) => return Err(e.into()),
            }
        }

        "status" => {
            println!("\n🔐 Authentication Status");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

            let servers = ctx.registry().servers();
            if servers.is_empty() {
                println!("No servers configured\n");
            }

            for server in servers {
                let credentials: Vec<_> = Scheme::ALL
                    .iter()
                    .filter_map(|scheme| ctx.store().get(&server.base_uri, *scheme))
                    .collect();

                if credentials.is_empty() {
                    println!(
                        "❌ {} ({}): not authenticated",
                        server.base_uri, server.authentication_type
                    );
                    continue;
                }

                for credential in credentials {
                    let detail = match credential.material() {
                        CredentialMaterial::CookieSession { cookie_names, .. } => {
                            format!("cookie session ({})", cookie_names.join(", "))
                        }
                        CredentialMaterial::Bearer { .. } => credential.scheme().to_string(),
                    };

                    match credential.time_until_expiration() {
                        Some(remaining) if remaining > chrono::Duration::zero() => println!(
                            "✅ {}: {} ({} remaining)",
                            server.base_uri,
                            detail,
                            describe_duration(remaining)
                        ),
                        Some(_) if credential.refresh_token().is_some() => println!(
                            "⚠️  {}: {} expired (will auto-refresh)",
                            server.base_uri, detail
                        ),
                        Some(_) => println!("⚠️  {}: {} expired", server.base_uri, detail),
                        None => println!("✅ {}: {}", server.base_uri, detail),
                    }
                }
            }
            println!();
        }

        "logout" => {
            let Some(url) = args.get(2) else {
                eprintln!("Usage: portal-auth logout <url>");
                std::process::exit(1);
            };

            let removed = coordinator.logout(url).await?;
            println!("\n✅ Removed {} credential(s) for {}\n", removed, url);
        }

        "fetch" => {
            let Some(url) = args.get(2) else {
                eprintln!("Usage: portal-auth fetch <url>");
                std::process::exit(1);
            };

            let client = AuthenticatedClient::new(coordinator.clone());
            let request = client.get(url.as_str()).build()?;

            match client.send_with_cancel(request, &cancel).await {
                Ok(response) => {
                    eprintln!("{} {}", response.status(), response.url());
                    println!("{}", response.text().await?);
                }
                Err(AuthError::Canceled) => println!("\n↩️  Request canceled\n"),
                Err(e) => return Err(e.into()),
            }
        }

        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    }

    if show_metrics {
        eprintln!("{}", portal_auth::metrics::METRICS.render()?);
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn describe_duration(remaining: chrono::Duration) -> String {
    let hours = remaining.num_hours();
    let minutes = remaining.num_minutes();

    if hours > 0 {
        format!("{} hours", hours)
    } else if minutes > 0 {
        format!("{} minutes", minutes)
    } else {
        format!("{} seconds", remaining.num_seconds())
    }
}
