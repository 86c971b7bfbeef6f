use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::anonymizer::Anonymizer;
use crate::config::AppConfig;
use crate::descriptor::AnonymizeOptions;
use crate::forwarder::{TunnelConnectResponded, TunnelObserver};

use super::config::{check_config, check_config_file_permissions, expand_path};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Open {
            url,
            port,
            ignore_proxy_certificate,
        } => {
            let options = AnonymizeOptions::new(url.as_str())
                .port(*port)
                .ignore_proxy_certificate(*ignore_proxy_certificate);
            run_single(options).await?;
        }
        Commands::Run { config } => {
            run_config(config).await?;
        }
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
    }

    Ok(())
}

/// 记录每次上游 CONNECT 握手
fn log_tunnel_events(name: &str) -> TunnelObserver {
    let name = name.to_string();
    Arc::new(move |event: &TunnelConnectResponded<'_>| {
        info!(
            "[{}] Tunnel #{} established via upstream ({} {}, {} bytes pre-read)",
            name,
            event.channel.connection_id,
            event.response.status,
            event.response.reason,
            event.head.len()
        );
    })
}

/// 匿名化单个代理
async fn run_single(options: AnonymizeOptions) -> Result<()> {
    let anonymizer = Anonymizer::new();

    let local_url = anonymizer
        .open(options.clone())
        .await
        .context("Failed to anonymize proxy")?;

    if local_url == options.url {
        warn!("Upstream proxy needs no anonymization, nothing to serve");
        println!("{}", local_url);
        return Ok(());
    }

    anonymizer.subscribe_tunnel_event(&local_url, log_tunnel_events("proxy"));
    println!("{}", local_url);

    wait_for_shutdown().await?;

    anonymizer
        .close_all(true)
        .await
        .context("Failed to close anonymized proxy")?;
    Ok(())
}

/// 按配置文件匿名化所有代理
async fn run_config(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    // 检查配置文件权限
    check_config_file_permissions(&config_path)?;

    info!("Loading configuration from: {}", config_path);
    let app_config = AppConfig::load(&config_path)?;

    let anonymizer = Anonymizer::new();
    for entry in &app_config.proxies {
        let opened = anonymizer
            .open(entry.options.clone())
            .await
            .with_context(|| format!("Failed to anonymize proxy '{}'", entry.name));

        let local_url = match opened {
            Ok(url) => url,
            Err(e) => {
                // 已启动的本地代理不能泄漏
                if let Err(close_err) = anonymizer.close_all(true).await {
                    warn!("Failed to close anonymized proxies: {}", close_err);
                }
                return Err(e);
            }
        };

        if anonymizer.subscribe_tunnel_event(&local_url, log_tunnel_events(&entry.name)) {
            println!("{}\t{}", entry.name, local_url);
        } else {
            println!("{}\t{}\t(direct)", entry.name, local_url);
        }
    }

    wait_for_shutdown().await?;

    let closed = anonymizer
        .close_all(true)
        .await
        .context("Failed to close anonymized proxies")?;
    info!("Closed {} anonymized proxies", closed);
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, shutting down");
    Ok(())
}
