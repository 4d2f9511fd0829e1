//! CLI command implementations

use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, Result};
use console::style;
use ovault_core::{HttpManifestResolver, HttpSegmentFetcher, NoopDrmClient, OvaultCore};
use ovault_types::{ConfigureOptions, RecordStatus, StoreConfig, StoredContentRecord};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Build an engine wired with the default HTTP collaborators
async fn build_core(data_dir: &Path) -> Result<OvaultCore> {
    let client = reqwest::Client::builder()
        .user_agent("OVault/0.1.0")
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(120))
        .build()?;

    let core = OvaultCore::with_fetcher(
        data_dir.to_path_buf(),
        Arc::new(HttpManifestResolver::new(client.clone())),
        Arc::new(NoopDrmClient),
        Arc::new(HttpSegmentFetcher::new(client)),
    )
    .await?;

    core.configure(load_config_overlay(data_dir)?).await;
    Ok(core)
}

// ============================================================================
// Config persistence (JSON file in the data directory)
// ============================================================================

fn config_path(data_dir: &Path) -> std::path::PathBuf {
    data_dir.join("config.json")
}

fn load_config(data_dir: &Path) -> Result<StoreConfig> {
    let path = config_path(data_dir);
    if !path.exists() {
        return Ok(StoreConfig::default());
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

fn load_config_overlay(data_dir: &Path) -> Result<ConfigureOptions> {
    let config = load_config(data_dir)?;
    Ok(ConfigureOptions {
        use_persistent_license: Some(config.use_persistent_license),
        max_concurrent_fetches: Some(config.max_concurrent_fetches),
        max_retries: Some(config.max_retries),
        retry_delay_secs: Some(config.retry_delay_secs),
        speed_limit: Some(config.speed_limit),
    })
}

fn save_config(data_dir: &Path, config: &StoreConfig) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(config_path(data_dir), content)?;
    Ok(())
}

// ============================================================================
// Store
// ============================================================================

pub async fn store(
    data_dir: &Path,
    source: &str,
    persistent_license: bool,
    concurrency: Option<u32>,
    speed_limit: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let core = build_core(data_dir).await?;

    core.configure(ConfigureOptions {
        use_persistent_license: if persistent_license { Some(true) } else { None },
        max_concurrent_fetches: concurrency,
        speed_limit: speed_limit.map(Some),
        ..Default::default()
    })
    .await;

    let bar = crate::progress::StoreProgress::new(source);
    let mut rx = core.subscribe();
    let handler = {
        let bar = bar.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                bar.handle_event(&event);
            }
        })
    };

    let result = core.store(source).await;
    handler.abort();
    let _ = handler.await;

    match result {
        Ok(record) => {
            bar.finish_ok();
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                OutputFormat::Human | OutputFormat::Table => {
                    println!(
                        "{} Stored: {}",
                        style("✓").green().bold(),
                        style(&record.offline_uri).cyan()
                    );
                    println!("  Source: {}", record.source);
                    println!("  Segments: {}", record.segments.len());
                    println!(
                        "  Size: {}",
                        human_bytes::human_bytes(record.size_bytes as f64)
                    );
                }
            }
            Ok(())
        }
        Err(e) => {
            bar.finish_err(&e.to_string());
            Err(anyhow!(e))
        }
    }
}

// ============================================================================
// List / Info
// ============================================================================

pub async fn list(data_dir: &Path, show_all: bool, format: OutputFormat) -> Result<()> {
    let core = build_core(data_dir).await?;
    let records = core.list_all().await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct RecordRow {
                uri: String,
                source: String,
                segments: usize,
                size: String,
                status: String,
            }

            let rows: Vec<RecordRow> = records
                .iter()
                .map(|r| RecordRow {
                    uri: short_uri(&r.offline_uri),
                    source: if r.source.len() > 40 {
                        format!("{}...", &r.source[..37])
                    } else {
                        r.source.clone()
                    },
                    segments: r.segments.len(),
                    size: human_bytes::human_bytes(r.size_bytes as f64),
                    status: format!("{:?}", r.status),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if records.is_empty() {
                println!("{}", style("No stored content").dim());
                return Ok(());
            }

            for record in &records {
                print_record_summary(record, show_all);
            }
            println!();
            println!("{} record(s) total", style(records.len()).bold());
        }
    }

    Ok(())
}

fn short_uri(uri: &str) -> String {
    uri.strip_prefix("offline://")
        .map(|s| s[..8.min(s.len())].to_string())
        .unwrap_or_else(|| uri.to_string())
}

fn print_record_summary(record: &StoredContentRecord, detailed: bool) {
    let status_icon = match record.status {
        RecordStatus::Complete => style("✓").green(),
        RecordStatus::Pending => style("·").dim(),
        RecordStatus::Corrupt => style("✗").red(),
    };

    println!(
        "{} {} {} [{}]",
        status_icon,
        style(&record.offline_uri).bold(),
        style(human_bytes::human_bytes(record.size_bytes as f64)).dim(),
        style(format!("{:?}", record.status)).dim()
    );

    if detailed {
        println!("    Source: {}", record.source);
        println!("    Segments: {}", record.segments.len());
        println!("    Created: {}", record.created_at);
        if let Some(license_id) = record.license_id {
            println!("    License: {}", license_id);
        }
        println!();
    }
}

pub async fn info(data_dir: &Path, uri: &str, format: OutputFormat) -> Result<()> {
    let core = build_core(data_dir).await?;
    let record = core.resolve(uri).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        _ => {
            print_record_summary(&record, true);
        }
    }

    Ok(())
}

// ============================================================================
// Remove / delete-all / cancel
// ============================================================================

pub async fn remove(data_dir: &Path, uri: &str, _format: OutputFormat) -> Result<()> {
    let core = build_core(data_dir).await?;
    core.remove(uri).await?;
    println!("{} Removed {}", style("✓").green().bold(), uri);
    Ok(())
}

pub async fn delete_all(data_dir: &Path, yes: bool, format: OutputFormat) -> Result<()> {
    let core = build_core(data_dir).await?;

    let count = core.list_all().await?.len();
    if count == 0 {
        println!("{}", style("No stored content").dim());
        return Ok(());
    }

    if !yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Remove all {} stored record(s)?", count))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted");
            return Ok(());
        }
    }

    let report = core.delete_all().await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!(
                "{} Removed {} record(s)",
                style("✓").green().bold(),
                report.removed.len()
            );
            for failure in &report.failed {
                println!(
                    "{} {}: {}",
                    style("✗").red().bold(),
                    failure.offline_uri,
                    style(&failure.error).red()
                );
            }
        }
    }

    if report.is_clean() {
        Ok(())
    } else {
        Err(anyhow!("{} removal(s) failed", report.failed.len()))
    }
}

pub async fn cancel(data_dir: &Path, source: &str, _format: OutputFormat) -> Result<()> {
    let core = build_core(data_dir).await?;
    core.cancel_store(source).await?;
    println!("{} Store cancelled", style("✓").green().bold());
    Ok(())
}

// ============================================================================
// Support / config
// ============================================================================

pub async fn support(data_dir: &Path, format: OutputFormat) -> Result<()> {
    let core = build_core(data_dir).await?;
    let supported = core.support();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "supported": supported }));
        }
        _ => {
            if supported {
                println!(
                    "{} Offline storage is supported",
                    style("✓").green().bold()
                );
            } else {
                println!(
                    "{} No usable persistence backend",
                    style("✗").red().bold()
                );
            }
        }
    }

    Ok(())
}

pub async fn config_action(
    data_dir: &Path,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    let mut config = load_config(data_dir)?;

    match action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            _ => {
                println!("use_persistent_license = {}", config.use_persistent_license);
                println!("max_concurrent_fetches = {}", config.max_concurrent_fetches);
                println!("max_retries = {}", config.max_retries);
                println!("retry_delay_secs = {}", config.retry_delay_secs);
                match config.speed_limit {
                    Some(limit) => println!("speed_limit = {}", limit),
                    None => println!("speed_limit = unlimited"),
                }
            }
        },

        ConfigAction::Get { key } => {
            let value = match key.as_str() {
                "use_persistent_license" => config.use_persistent_license.to_string(),
                "max_concurrent_fetches" => config.max_concurrent_fetches.to_string(),
                "max_retries" => config.max_retries.to_string(),
                "retry_delay_secs" => config.retry_delay_secs.to_string(),
                "speed_limit" => config
                    .speed_limit
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "unlimited".to_string()),
                other => return Err(anyhow!("unknown config key: {}", other)),
            };
            println!("{}", value);
        }

        ConfigAction::Set { key, value } => {
            match key.as_str() {
                "use_persistent_license" => config.use_persistent_license = value.parse()?,
                "max_concurrent_fetches" => config.max_concurrent_fetches = value.parse()?,
                "max_retries" => config.max_retries = value.parse()?,
                "retry_delay_secs" => config.retry_delay_secs = value.parse()?,
                "speed_limit" => {
                    config.speed_limit = if value == "unlimited" || value == "0" {
                        None
                    } else {
                        Some(value.parse()?)
                    }
                }
                other => return Err(anyhow!("unknown config key: {}", other)),
            }
            save_config(data_dir, &config)?;
            println!("{} {} updated", style("✓").green().bold(), key);
        }

        ConfigAction::Reset => {
            let path = config_path(data_dir);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            println!("{} Configuration reset to defaults", style("✓").green().bold());
        }
    }

    Ok(())
}
