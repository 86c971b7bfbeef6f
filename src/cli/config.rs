use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::decision::needs_anonymization;
use crate::descriptor::{validate, ProxyInput, SchemeSet};
use crate::uri::redact_url;

/// 检查配置文件权限（仅Unix系统），返回发出的警告
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<Vec<String>> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();
    let mut warnings = Vec::new();

    // 检查是否其他用户可读（o+r = 0o004）
    if mode & 0o004 != 0 {
        warnings.push(format!(
            "Config file '{}' is readable by others (permissions: {:o})",
            config_path,
            mode & 0o777
        ));
    }

    // 检查是否组用户可读（g+r = 0o040）
    if mode & 0o040 != 0 {
        warnings.push(format!(
            "Config file '{}' is readable by group (permissions: {:o})",
            config_path,
            mode & 0o777
        ));
    }

    for warning in &warnings {
        warn!(
            "⚠️  SECURITY WARNING: {}\n\
             This file may contain upstream proxy credentials.\n\
             RECOMMENDATION: chmod 600 {}",
            warning, config_path
        );
    }

    Ok(warnings)
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

#[derive(Debug, Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    proxies: Vec<ProxyReport>,
}

/// 单个代理的检查结果
#[derive(Debug, Serialize)]
pub struct ProxyReport {
    pub name: String,
    /// 凭据已隐藏的上游 URL
    pub upstream: String,
    pub scheme: String,
    pub local_port: u16,
    pub ignore_proxy_certificate: bool,
    pub needs_anonymization: bool,
}

/// 为已验证的配置生成每个代理的报告
pub fn build_reports(config: &AppConfig) -> Result<Vec<ProxyReport>> {
    let schemes = SchemeSet::default();
    config
        .proxies
        .iter()
        .map(|entry| {
            let descriptor = validate(&ProxyInput::Options(entry.options.clone()), &schemes)
                .with_context(|| format!("Proxy '{}'", entry.name))?;
            Ok(ProxyReport {
                name: entry.name.clone(),
                upstream: redact_url(descriptor.url()),
                scheme: descriptor.scheme().to_string(),
                local_port: descriptor.local_port(),
                ignore_proxy_certificate: descriptor.ignore_proxy_certificate(),
                needs_anonymization: needs_anonymization(&descriptor),
            })
        })
        .collect()
}

fn print_json(result: &CheckResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    if !path.exists() {
        if format == "json" {
            print_json(&CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                proxies: vec![],
            })?;
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    let loaded = AppConfig::load(config_path).and_then(|config| build_reports(&config));
    let proxies = match loaded {
        Ok(proxies) => proxies,
        Err(e) => {
            if format == "json" {
                print_json(&CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    proxies: vec![],
                })?;
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Every [[proxies]] entry needs a unique name and a url");
                println!("  3. Supported schemes: {}", SchemeSet::default().describe());
                println!("  4. Ensure port numbers are valid (0-65535)");
                println!("  5. Percent-encode special characters in usernames and passwords");
            }
            return Err(e);
        }
    };

    let warnings: Vec<String> = proxies
        .iter()
        .filter(|p| p.ignore_proxy_certificate && p.scheme != "https")
        .map(|p| {
            format!(
                "Proxy '{}': ignore_proxy_certificate has no effect for {} proxies",
                p.name, p.scheme
            )
        })
        .collect();

    if format == "json" {
        print_json(&CheckResult {
            valid: true,
            warnings,
            error: None,
            proxies,
        })?;
    } else {
        println!("✓ Number of proxies: {}", proxies.len());
        for (idx, proxy) in proxies.iter().enumerate() {
            let action = if proxy.needs_anonymization {
                if proxy.local_port == 0 {
                    "local forwarder on a random port".to_string()
                } else {
                    format!("local forwarder on port {}", proxy.local_port)
                }
            } else {
                "used directly".to_string()
            };
            println!(
                "  Proxy #{}: '{}' {} ({})",
                idx + 1,
                proxy.name,
                proxy.upstream,
                action
            );
        }
        for warning in &warnings {
            println!("⚠ Warning: {}", warning);
        }
        println!("\n✓ Configuration is valid!");
    }

    Ok(())
}
