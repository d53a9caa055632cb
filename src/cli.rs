use std::{
    env,
    io::{self, Write},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, bail};

use gcal_mirror::{
    calendar::{JsonFileSource, RemoteEvent},
    storage::{Config, FingerprintStore},
    sync::{
        BrowserPrompt, EngineSettings, GoogleCalendarClient, SyncEngine, SyncReport,
        SyncScheduler, TokenManager,
    },
};

pub const USAGE: &str = "Usage: gcal-mirror [run | once | list | cleanup [--yes] | purge [--yes] | auth]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliMode {
    /// Keep mirroring until interrupted.
    Run,
    Once,
    List,
    Cleanup { assume_yes: bool },
    Purge { assume_yes: bool },
    Auth,
}

pub fn parse_cli_mode() -> Result<CliMode, String> {
    parse_args(env::args().skip(1))
}

pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliMode, String> {
    let mut command = None;
    let mut assume_yes = false;

    for arg in args {
        match arg.as_str() {
            "--yes" | "-y" => assume_yes = true,
            "--help" | "-h" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            _ if command.is_none() && !arg.starts_with('-') => command = Some(arg.clone()),
            _ => return Err(format!("Unknown argument: {}", arg)),
        }
    }

    let mode = match command.as_deref() {
        None | Some("run") => CliMode::Run,
        Some("once") => CliMode::Once,
        Some("list") => CliMode::List,
        Some("cleanup") => CliMode::Cleanup { assume_yes },
        Some("purge") => CliMode::Purge { assume_yes },
        Some("auth") => CliMode::Auth,
        Some(other) => return Err(format!("Unknown command: {}", other)),
    };

    if assume_yes && !matches!(mode, CliMode::Cleanup { .. } | CliMode::Purge { .. }) {
        return Err("--yes only applies to cleanup and purge".to_string());
    }

    Ok(mode)
}

pub async fn run(mode: CliMode, config: Config) -> anyhow::Result<()> {
    if mode == CliMode::Auth {
        return run_auth(&config).await;
    }

    let source = Arc::new(JsonFileSource::new(
        config.source.events_file.clone(),
        Duration::from_secs(config.source.poll_seconds),
    ));
    let engine = build_engine(&config, source.clone())?;

    match mode {
        CliMode::Run => {
            let watcher = source.spawn_watcher();
            let interval = Duration::from_secs(u64::from(config.sync.interval_minutes) * 60);
            let scheduler = SyncScheduler::new(engine, interval);
            println!("Mirroring every {} minutes, press Ctrl-C to stop", config.sync.interval_minutes);

            scheduler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl-C: {}", e);
                    }
                })
                .await;
            watcher.abort();
        }
        CliMode::Once => {
            let report = engine.run_pass().await?;
            print_report(&report);
        }
        CliMode::List => {
            let events = engine.remote_provenance_events(&engine.window()).await?;
            for event in &events {
                println!("{}", format_remote_line(event));
            }
            println!("{} mirrored events", events.len());
        }
        CliMode::Cleanup { assume_yes } => {
            let window = engine.window();
            let orphans = engine.orphaned_events(&window).await?;
            if orphans.is_empty() {
                println!("No orphaned events found.");
                return Ok(());
            }
            let question = format!("Delete {} orphaned remote events?", orphans.len());
            if !confirm(&question, assume_yes)? {
                println!("Aborted.");
                return Ok(());
            }
            print_report(&engine.cleanup_orphans(&window).await?);
        }
        CliMode::Purge { assume_yes } => {
            let window = engine.window();
            let events = engine.remote_provenance_events(&window).await?;
            let question = format!(
                "Delete {} mirrored remote events and forget all {} sync records?",
                events.len(),
                engine.store().len()?
            );
            if !confirm(&question, assume_yes)? {
                println!("Aborted.");
                return Ok(());
            }
            print_report(&engine.purge(&window).await?);
        }
        CliMode::Auth => unreachable!("handled above"),
    }

    Ok(())
}

fn build_engine(config: &Config, source: Arc<JsonFileSource>) -> anyhow::Result<SyncEngine> {
    let store = FingerprintStore::open(&config.storage.database).with_context(|| {
        format!("Failed to open sync database {}", config.storage.database.display())
    })?;
    let imported = store
        .import_legacy(&config.storage.legacy_mappings)
        .context("Failed to import legacy mappings")?;
    if imported > 0 {
        println!("Imported {} records from the legacy mapping file", imported);
    }

    let tokens = Arc::new(TokenManager::new(&config.google).with_prompt(Arc::new(BrowserPrompt)));
    let api = GoogleCalendarClient::new(tokens.clone(), config.calendars.target.clone());

    Ok(SyncEngine::new(
        store,
        Arc::new(api),
        tokens,
        source,
        EngineSettings::from_config(config),
    ))
}

async fn run_auth(config: &Config) -> anyhow::Result<()> {
    if config.google.client_id.is_empty() || config.google.client_secret.is_empty() {
        bail!(
            "Set google.client_id and google.client_secret in {}",
            Config::config_path().display()
        );
    }

    let manager = TokenManager::new(&config.google).with_prompt(Arc::new(BrowserPrompt));
    let credential = manager.reauthorize().await?;
    println!(
        "Authorized. Token valid until {}, cached at {}",
        credential.expires_at.format("%Y-%m-%d %H:%M UTC"),
        config.google.token_cache.display()
    );
    Ok(())
}

fn confirm(question: &str, assume_yes: bool) -> io::Result<bool> {
    if assume_yes {
        return Ok(true);
    }

    print!("{} Type 'yes' to continue: ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(answer.trim() == "yes")
}

fn print_report(report: &SyncReport) {
    println!("{}", report);
    for failure in &report.failures {
        match failure.index {
            Some(index) => println!(
                "  {} {} (batch item {}): {}",
                failure.operation, failure.key, index, failure.error
            ),
            None => println!("  {} {}: {}", failure.operation, failure.key, failure.error),
        }
    }
}

fn format_remote_line(event: &RemoteEvent) -> String {
    let start = event
        .start
        .date
        .as_deref()
        .or(event.start.date_time.as_deref())
        .unwrap_or("?");
    let mut line = format!(
        "{:<25} {}",
        start,
        event.summary.as_deref().unwrap_or("(untitled)")
    );
    if let Some(calendar) = event.source_calendar() {
        line.push_str(&format!(" [{}]", calendar));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcal_mirror::calendar::RemoteDateTime;

    fn parse(args: &[&str]) -> Result<CliMode, String> {
        parse_args(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn no_arguments_runs_continuously() {
        assert_eq!(parse(&[]), Ok(CliMode::Run));
    }

    #[test]
    fn parses_admin_modes() {
        assert_eq!(parse(&["once"]), Ok(CliMode::Once));
        assert_eq!(parse(&["list"]), Ok(CliMode::List));
        assert_eq!(parse(&["auth"]), Ok(CliMode::Auth));
        assert_eq!(parse(&["cleanup"]), Ok(CliMode::Cleanup { assume_yes: false }));
        assert_eq!(parse(&["purge", "--yes"]), Ok(CliMode::Purge { assume_yes: true }));
        assert_eq!(parse(&["-y", "cleanup"]), Ok(CliMode::Cleanup { assume_yes: true }));
    }

    #[test]
    fn rejects_unknown_and_repeated_commands() {
        assert!(parse(&["sync"]).is_err());
        assert!(parse(&["once", "list"]).is_err());
    }

    #[test]
    fn yes_flag_only_applies_to_deleting_modes() {
        assert!(parse(&["once", "--yes"]).is_err());
    }

    #[test]
    fn remote_line_shows_date_title_and_calendar() {
        let mut event = RemoteEvent {
            summary: Some("Team Offsite".to_string()),
            start: RemoteDateTime::date("2024-03-01".to_string()),
            ..RemoteEvent::default()
        };
        let mut private = std::collections::BTreeMap::new();
        private.insert("sourceCalendar".to_string(), "Work".to_string());
        event.extended_properties = Some(gcal_mirror::calendar::ExtendedProperties { private });

        let line = format_remote_line(&event);

        assert!(line.starts_with("2024-03-01"));
        assert!(line.ends_with("Team Offsite [Work]"));
    }
}
