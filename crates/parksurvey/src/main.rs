//! `parksurvey` - CLI for recording and sharing parking-impact interviews.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use tracing::debug;

use parksurvey::cli::{
    AddCommand, Cli, Command, ConfigCommand, ListCommand, ShareCommand, StatusCommand,
    SummaryCommand,
};
use parksurvey::session::JoinPreview;
use parksurvey::{
    init_logging, Config, Error, HttpMirror, LocalStore, Record, Session, SessionMode, Summary,
    SyncStatus,
};

type CliSession = Session<HttpMirror>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbosity());

    if let Command::Config(cmd) = cli.command {
        return handle_config(cli.config, cmd);
    }

    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;
    let store = LocalStore::open(config.database_path())
        .with_context(|| format!("failed to open {}", config.database_path().display()))?;
    let mirror = HttpMirror::from_config(&config.remote)?;
    let session = Session::new(store, mirror);

    session.resume().await.context("failed to restore session")?;
    let descriptor = session.descriptor();
    if descriptor.status == SyncStatus::Error {
        if let Some(reason) = &descriptor.error {
            eprintln!("warning: {reason}");
        }
    }

    match cli.command {
        Command::Status(cmd) => handle_status(&session, &config, &cmd)?,
        Command::Local => {
            session.start_local()?;
            println!("Local session with {} records.", session.records().len());
        }
        Command::Share(cmd) => handle_share(&session, cmd).await?,
        Command::Disconnect => {
            session.disconnect()?;
            println!("Disconnected. Records stay on this device.");
        }
        Command::Add(cmd) => handle_add(&session, cmd).await?,
        Command::List(cmd) => handle_list(&session, &cmd)?,
        Command::Summary(cmd) => handle_summary(&session, &cmd)?,
        Command::Clear => {
            ensure_active(&session)?;
            session
                .clear_all()
                .await
                .context("records cleared on this device only")?;
            println!("All records deleted.");
        }
        Command::Import { file } => handle_import(&session, &file).await?,
        Command::Export { file } => handle_export(&session, &file)?,
        Command::Sync => {
            let outcome = session.sync_now().await?;
            println!(
                "Synced: {} pushed, remote {}.",
                outcome.pushed,
                if outcome.changed { "changed" } else { "unchanged" }
            );
        }
        Command::Watch => handle_watch(&session, &config).await?,
        Command::Config(_) => unreachable!("handled before loading the session"),
    }
    Ok(())
}

/// Switch a fresh session to local mode so that writes have a home.
fn ensure_active(session: &CliSession) -> anyhow::Result<()> {
    if session.descriptor().mode == SessionMode::Disconnected {
        debug!("No session chosen, starting a local one");
        session.start_local()?;
    }
    Ok(())
}

/// Records to read from: the session's, or the local store when disconnected.
fn current_records(session: &CliSession) -> anyhow::Result<Vec<Record>> {
    if session.descriptor().mode == SessionMode::Disconnected {
        Ok(session.stored_records()?)
    } else {
        Ok(session.records())
    }
}

fn handle_status(session: &CliSession, config: &Config, cmd: &StatusCommand) -> anyhow::Result<()> {
    let descriptor = session.descriptor();
    let records = current_records(session)?.len();
    let pending = session.pending_count()?;

    if cmd.json {
        let status = serde_json::json!({
            "mode": descriptor.mode.as_str(),
            "endpoint": descriptor.endpoint,
            "status": descriptor.status.to_string(),
            "etag": descriptor.etag.as_ref().map(|t| t.as_str()),
            "error": descriptor.error,
            "records": records,
            "pending": pending,
            "database_path": config.database_path(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("parksurvey status");
        println!("-----------------");
        println!("Mode:          {}", descriptor.mode);
        if let Some(endpoint) = &descriptor.endpoint {
            println!("Shared store:  {endpoint}");
        }
        println!("Sync status:   {}", descriptor.status);
        if let Some(error) = &descriptor.error {
            println!("Last error:    {error}");
        }
        println!("Records:       {records}");
        println!("Not mirrored:  {pending}");
        println!("Database:      {}", config.database_path().display());
    }
    Ok(())
}

async fn handle_share(session: &CliSession, cmd: ShareCommand) -> anyhow::Result<()> {
    match cmd {
        ShareCommand::Create => {
            ensure_active(session)?;
            let url = session
                .create_shared()
                .await
                .context("could not create shared store")?;
            println!("Sharing {} records at:", session.records().len());
            println!("{url}");
        }
        ShareCommand::Join { url, yes } => {
            let joined = if yes {
                session.join_shared(&url).await
            } else {
                session.join_shared_confirmed(&url, confirm_on_stdin).await
            };
            match joined {
                Ok(()) => println!("Joined shared store with {} records.", session.records().len()),
                Err(Error::UserDeclined) => println!("Aborted; nothing changed."),
                Err(e) => return Err(e).context("could not join shared store"),
            }
        }
    }
    Ok(())
}

fn confirm_on_stdin(preview: &JoinPreview) -> bool {
    eprint!(
        "Replace {} local records with {} records from {}? [y/N] ",
        preview.local, preview.incoming, preview.url
    );
    let _ = std::io::stderr().flush();

    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

async fn handle_add(session: &CliSession, cmd: AddCommand) -> anyhow::Result<()> {
    ensure_active(session)?;
    let record = Record::new(
        cmd.location,
        cmd.travel_mode,
        cmd.payment,
        cmd.cost,
        cmd.period,
        cmd.park_and_ride,
        cmd.at.unwrap_or_else(Utc::now),
    )?;
    let id = record.id.clone();

    match session.add_record(record).await {
        Ok(()) => {
            println!("Recorded {id}.");
            Ok(())
        }
        Err(e) if e.is_remote_error() => {
            Err(e).with_context(|| format!("recorded {id} on this device only"))
        }
        Err(e) => Err(e.into()),
    }
}

fn handle_list(session: &CliSession, cmd: &ListCommand) -> anyhow::Result<()> {
    let records = current_records(session)?;
    let selected = cmd.range.range().filter(&records);

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&selected)?);
        return Ok(());
    }

    for r in &selected {
        println!(
            "{}  {}  {:<12} {:<16} {:<15} {:>8.2}  {}",
            r.interview_date_time.format("%Y-%m-%d %H:%M"),
            r.id,
            r.location,
            r.previous_travel_mode,
            r.previous_payment_type,
            r.previous_weekly_cost,
            if r.uses_park_and_ride { "P+R" } else { "-" }
        );
    }
    println!("{} of {} records", selected.len(), records.len());
    Ok(())
}

fn handle_summary(session: &CliSession, cmd: &SummaryCommand) -> anyhow::Result<()> {
    let records = current_records(session)?;
    let summary = Summary::from_records(&records, cmd.range.range());
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{summary}");
    }
    Ok(())
}

async fn handle_import(session: &CliSession, file: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let records: Vec<Record> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of records", file.display()))?;

    ensure_active(session)?;
    let count = session
        .replace_all(records)
        .await
        .context("records replaced on this device only")?;
    println!("Imported {count} records.");
    Ok(())
}

fn handle_export(session: &CliSession, file: &Path) -> anyhow::Result<()> {
    let records = current_records(session)?;
    let json = serde_json::to_string_pretty(&records)?;
    std::fs::write(file, json).with_context(|| format!("failed to write {}", file.display()))?;
    println!("Exported {} records to {}.", records.len(), file.display());
    Ok(())
}

async fn handle_watch(session: &CliSession, config: &Config) -> anyhow::Result<()> {
    if session.descriptor().mode != SessionMode::Shared {
        bail!("watch needs a shared session; use `share create` or `share join` first");
    }

    let mut changes = session.subscribe();
    let poller = session.spawn_poller(config.poll_interval());
    let mut last = (session.records().len(), session.descriptor().status);
    println!(
        "Watching {} every {}s, {} records. Ctrl-C to stop.",
        session.descriptor().endpoint.unwrap_or_default(),
        config.remote.poll_interval_secs,
        last.0
    );

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let descriptor = session.descriptor();
                let now = (session.records().len(), descriptor.status);
                if now != last && descriptor.status != SyncStatus::Syncing {
                    match &descriptor.error {
                        Some(error) => println!("{}: {} records ({error})", descriptor.status, now.0),
                        None => println!("{}: {} records", descriptor.status, now.0),
                    }
                    last = now;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    poller.shutdown().await;
    Ok(())
}

fn handle_config(path: Option<PathBuf>, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = Config::load_from(path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!();
                println!("[Remote]");
                println!("  Create URL:         {}", config.remote.create_url);
                println!("  Capability prefix:  {}", config.remote.capability_prefix);
                println!("  Poll interval (s):  {}", config.remote.poll_interval_secs);
                println!("  Timeout (s):        {}", config.remote.request_timeout_secs);
            }
        }
        ConfigCommand::Path => {
            println!(
                "{}",
                path.unwrap_or_else(Config::default_config_path).display()
            );
        }
        ConfigCommand::Validate => {
            let path = path.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => bail!("configuration error: {e}"),
            }
        }
    }
    Ok(())
}
