//! Subcommand bodies. Each function owns one subcommand's behavior and
//! talks to the core only through the [`monico_core::App`] facade.

use crate::format::{seconds_to_human_readable_string, timestamp_to_human_readable_string};
use anyhow::Result;
use monico_core::{App, Monitor, Probe};
use tokio::sync::broadcast;

pub async fn setup(app: &App, force: bool) -> Result<()> {
    app.setup(force).await?;
    println!("Initialized the database");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn create(
    app: &App,
    id: Option<String>,
    name: String,
    endpoint: String,
    interval: i64,
    body_regexp: Option<String>,
) -> Result<()> {
    let monitor = app
        .create_monitor(id, name, endpoint, interval, body_regexp)
        .await?;
    println!(
        "Added monitor {} for \"{}\" every {} seconds",
        monitor.name, monitor.endpoint, monitor.interval
    );
    Ok(())
}

pub async fn list(app: &App, json: bool) -> Result<()> {
    let monitors = app.list_monitors().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&monitors)?);
    } else {
        print_monitors(&monitors);
    }
    Ok(())
}

pub async fn delete(app: &App, id: String) -> Result<()> {
    app.delete_monitor(&id).await?;
    println!("Removed monitor {id}");
    Ok(())
}

pub async fn status(app: &App, id: String, number_of_probes: i64, json: bool) -> Result<()> {
    let (monitor, probes) = app.status(&id, number_of_probes).await?;
    print_status(&monitor, &probes, number_of_probes, json)
}

/// Refreshes the status view once a second until cancelled, clearing the
/// terminal between redraws.
pub async fn status_live(app: &App, id: String, number_of_probes: i64) -> Result<()> {
    println!("Press Ctrl+C to exit\n");
    loop {
        let (monitor, probes) = app.status(&id, number_of_probes).await?;
        print!("\x1B[2J\x1B[1;1H");
        print_status(&monitor, &probes, number_of_probes, false)?;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

fn print_status(monitor: &Monitor, probes: &[Probe], number_of_probes: i64, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "monitor": monitor,
                "probes": probes,
            }))?
        );
        return Ok(());
    }
    print_monitor_header(monitor);
    println!("\nLast {number_of_probes} probes:");
    print_probes(probes);
    Ok(())
}

pub async fn run_manager(app: &App, shutdown: broadcast::Receiver<()>) {
    app.run_manager(shutdown).await;
}

pub async fn run_worker(app: &App, worker_id: Option<String>, shutdown: broadcast::Receiver<()>) {
    app.run_worker(worker_id, shutdown).await;
}

pub async fn run(app: &App, worker_id: Option<String>, shutdown: broadcast::Sender<()>) {
    app.run(worker_id, shutdown).await;
}

fn print_monitor_header(monitor: &Monitor) {
    println!(
        "Monitor ID   {}",
        monitor.id.as_deref().unwrap_or("<unknown>")
    );
    println!("Name         {}", monitor.name);
    println!("Endpoint     {}", monitor.endpoint);
    println!(
        "Body Regexp  {}",
        monitor.body_regexp.as_deref().unwrap_or("None")
    );
    println!(
        "Interval     {}",
        seconds_to_human_readable_string(monitor.interval as f64)
    );
}

fn print_monitors(monitors: &[Monitor]) {
    println!("{:<36}  {:<24}  {:<32}  INTERVAL", "ID", "NAME", "ENDPOINT");
    for monitor in monitors {
        println!(
            "{:<36}  {:<24}  {:<32}  {}",
            monitor.id.as_deref().unwrap_or("<unknown>"),
            monitor.name,
            monitor.endpoint,
            seconds_to_human_readable_string(monitor.interval as f64)
        );
    }
}

fn print_probes(probes: &[Probe]) {
    println!(
        "{:<20}  {:<16}  {:<14}  {:<18}  CONTENT MATCH",
        "TIME", "RESPONSE TIME", "RESPONSE CODE", "RESPONSE ERROR"
    );
    for probe in probes.iter().rev() {
        println!(
            "{:<20}  {:<16}  {:<14}  {:<18}  {}",
            timestamp_to_human_readable_string(probe.timestamp),
            seconds_to_human_readable_string(probe.response_time),
            probe
                .response_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            probe
                .response_error
                .map(|e| e.as_str().to_string())
                .unwrap_or_else(|| "-".to_string()),
            probe.content_match.as_deref().unwrap_or("-"),
        );
    }
}
